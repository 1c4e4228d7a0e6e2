//! IMAP high-water marks.
//!
//! POP3 checkpoints live in per-account files instead; see `UidCache`.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use crate::domain::{AccountId, SyncCheckpoint};
use crate::storage::database::{Database, Result};

/// Stored mark for the account, or an empty one when it never synced.
pub async fn read_imap(db: &Database, account_id: &AccountId) -> Result<SyncCheckpoint> {
    let account_id = account_id.clone();

    db.with_conn(move |conn| {
        let row: Option<(u32, Option<u32>)> = conn
            .query_row(
                "SELECT last_uid, uid_validity FROM imap_checkpoints WHERE account_id = ?1",
                [&account_id.0],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(match row {
            Some((last_uid, uid_validity)) => SyncCheckpoint::Imap {
                last_uid,
                uid_validity,
            },
            None => SyncCheckpoint::imap(0),
        })
    })
    .await
}

/// Stores the mark. Within one UIDVALIDITY it never moves backwards; a new
/// UIDVALIDITY replaces it outright.
pub async fn write_imap(
    db: &Database,
    account_id: &AccountId,
    last_uid: u32,
    uid_validity: Option<u32>,
) -> Result<()> {
    let account_id = account_id.clone();

    db.with_conn(move |conn| {
        conn.execute(
            r#"
            INSERT INTO imap_checkpoints (account_id, last_uid, uid_validity, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(account_id) DO UPDATE SET
                last_uid = CASE
                    WHEN imap_checkpoints.uid_validity IS excluded.uid_validity
                        THEN MAX(imap_checkpoints.last_uid, excluded.last_uid)
                    ELSE excluded.last_uid
                END,
                uid_validity = excluded.uid_validity,
                updated_at = excluded.updated_at
            "#,
            params![account_id.0, last_uid, uid_validity, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    })
    .await
}
