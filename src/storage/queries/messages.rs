//! Message persistence.
//!
//! Each message is written in its own transaction together with its
//! attachment rows, so a failure on one message never undoes another.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use crate::domain::{AccountId, Address, Attachment, MessageId, NewMessage, StoredMessage};
use crate::storage::database::{Database, DatabaseError, Result};

/// What happened to a message handed to [`insert`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// A new row was written.
    Inserted(MessageId),
    /// The account already holds this Message-ID or protocol UID.
    Duplicate,
}

impl UpsertOutcome {
    pub fn is_inserted(&self) -> bool {
        matches!(self, UpsertOutcome::Inserted(_))
    }
}

const MESSAGE_COLUMNS: &str = r#"
    id, account_id, message_id, protocol_uid, from_address, from_name,
    to_addresses, cc_addresses, subject, date, body_text, snippet, has_attachments
"#;

/// Whether the account already holds a message with this Message-ID or UID.
pub async fn exists(
    db: &Database,
    account_id: &AccountId,
    message_id: &str,
    protocol_uid: &str,
) -> Result<bool> {
    let account_id = account_id.clone();
    let message_id = message_id.to_string();
    let protocol_uid = protocol_uid.to_string();

    db.with_conn(move |conn| {
        let count: u32 = conn.query_row(
            r#"
            SELECT COUNT(*) FROM messages
            WHERE account_id = ?1 AND (message_id = ?2 OR protocol_uid = ?3)
            "#,
            params![account_id.0, message_id, protocol_uid],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    })
    .await
}

/// Whether the account already holds a message with this Message-ID.
pub async fn message_id_known(
    db: &Database,
    account_id: &AccountId,
    message_id: &str,
) -> Result<bool> {
    let account_id = account_id.clone();
    let message_id = message_id.to_string();

    db.with_conn(move |conn| {
        let count: u32 = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE account_id = ?1 AND message_id = ?2",
            params![account_id.0, message_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    })
    .await
}

/// Renames the account's current UID keys once the mailbox's UIDVALIDITY
/// changed, so new messages reusing those numbers are not taken for
/// duplicates. Returns how many rows were renamed.
pub async fn retire_protocol_uids(
    db: &Database,
    account_id: &AccountId,
    uid_validity: u32,
) -> Result<usize> {
    let account_id = account_id.clone();

    db.with_conn(move |conn| {
        let renamed = conn.execute(
            r#"
            UPDATE messages SET protocol_uid = ?2 || protocol_uid
            WHERE account_id = ?1 AND protocol_uid NOT LIKE 'stale:%'
            "#,
            params![account_id.0, format!("stale:{}:", uid_validity)],
        )?;
        Ok(renamed)
    })
    .await
}

/// Inserts a message and its attachment rows in one transaction.
///
/// A uniqueness conflict on either key yields [`UpsertOutcome::Duplicate`]
/// and writes nothing.
pub async fn insert(
    db: &Database,
    message: &NewMessage,
    attachments: Vec<Attachment>,
) -> Result<UpsertOutcome> {
    let message = message.clone();

    db.transaction(move |tx| {
        let id = MessageId::generate();
        let envelope = &message.envelope;
        let to = encode_addresses(&envelope.to)?;
        let cc = encode_addresses(&envelope.cc)?;

        let changed = tx.execute(
            r#"
            INSERT OR IGNORE INTO messages (
                id, account_id, message_id, protocol_uid, from_address, from_name,
                to_addresses, cc_addresses, subject, body_text, body_html, snippet,
                date, has_attachments, raw_size, created_at
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16
            )
            "#,
            params![
                id.0,
                message.account_id.0,
                envelope.message_id,
                message.protocol_uid,
                envelope.from.email,
                envelope.from.name,
                to,
                cc,
                envelope.subject,
                message.body_text,
                message.body_html,
                message.snippet(),
                envelope.date.to_rfc3339(),
                (!attachments.is_empty()) as i32,
                message.raw_size as i64,
                Utc::now().to_rfc3339(),
            ],
        )?;

        if changed == 0 {
            return Ok(UpsertOutcome::Duplicate);
        }

        for attachment in &attachments {
            tx.execute(
                r#"
                INSERT INTO attachments (id, message_id, filename, mime_type, size_bytes, local_path)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![
                    uuid::Uuid::new_v4().to_string(),
                    id.0,
                    attachment.filename,
                    attachment.mime_type,
                    attachment.size_bytes as i64,
                    attachment.local_path,
                ],
            )?;
        }

        Ok(UpsertOutcome::Inserted(id))
    })
    .await
}

/// Loads messages by local ID, preserving the order of `ids`.
pub async fn get_by_ids(db: &Database, ids: &[MessageId]) -> Result<Vec<StoredMessage>> {
    let ids = ids.to_vec();

    db.with_conn(move |conn| {
        let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1");
        let mut stmt = conn.prepare(&sql)?;
        let mut messages = Vec::with_capacity(ids.len());
        for id in &ids {
            if let Some(message) = stmt.query_row([&id.0], row_to_message).optional()? {
                messages.push(message);
            }
        }
        Ok(messages)
    })
    .await
}

/// Loads one message by local ID.
pub async fn get_by_id(db: &Database, id: &MessageId) -> Result<Option<StoredMessage>> {
    Ok(get_by_ids(db, std::slice::from_ref(id)).await?.pop())
}

/// Messages of an account with no classification yet, oldest first.
pub async fn unclassified(
    db: &Database,
    account_id: &AccountId,
    limit: u32,
) -> Result<Vec<StoredMessage>> {
    let account_id = account_id.clone();

    db.with_conn(move |conn| {
        let sql = format!(
            r#"
            SELECT {MESSAGE_COLUMNS} FROM messages m
            WHERE account_id = ?1
              AND NOT EXISTS (SELECT 1 FROM classifications c WHERE c.message_id = m.id)
            ORDER BY date ASC
            LIMIT ?2
            "#
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![account_id.0, limit], row_to_message)?;
        let messages: std::result::Result<Vec<_>, _> = rows.collect();
        Ok(messages?)
    })
    .await
}

/// Most recent messages of an account, newest first.
pub async fn for_account(
    db: &Database,
    account_id: &AccountId,
    limit: u32,
) -> Result<Vec<StoredMessage>> {
    let account_id = account_id.clone();

    db.with_conn(move |conn| {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE account_id = ?1 ORDER BY date DESC LIMIT ?2"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![account_id.0, limit], row_to_message)?;
        let messages: std::result::Result<Vec<_>, _> = rows.collect();
        Ok(messages?)
    })
    .await
}

/// Attachment rows of a message.
pub async fn attachments(db: &Database, id: &MessageId) -> Result<Vec<Attachment>> {
    let id = id.clone();

    db.with_conn(move |conn| {
        let mut stmt = conn.prepare(
            r#"
            SELECT filename, mime_type, size_bytes, local_path
            FROM attachments WHERE message_id = ?1 ORDER BY filename
            "#,
        )?;
        let rows = stmt.query_map([&id.0], |row| {
            Ok(Attachment {
                filename: row.get(0)?,
                mime_type: row.get(1)?,
                size_bytes: row.get::<_, i64>(2)?.max(0) as u64,
                local_path: row.get(3)?,
            })
        })?;
        let attachments: std::result::Result<Vec<_>, _> = rows.collect();
        Ok(attachments?)
    })
    .await
}

/// Counts messages stored for an account.
pub async fn count_for_account(db: &Database, account_id: &AccountId) -> Result<u32> {
    let account_id = account_id.clone();

    db.with_conn(move |conn| {
        let count: u32 = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE account_id = ?1",
            [&account_id.0],
            |row| row.get(0),
        )?;
        Ok(count)
    })
    .await
}

/// Bytes of raw mail stored for an account.
pub async fn mailbox_usage(db: &Database, account_id: &AccountId) -> Result<u64> {
    let account_id = account_id.clone();

    db.with_conn(move |conn| {
        let total: i64 = conn.query_row(
            "SELECT COALESCE(SUM(raw_size), 0) FROM messages WHERE account_id = ?1",
            [&account_id.0],
            |row| row.get(0),
        )?;
        Ok(total.max(0) as u64)
    })
    .await
}

fn encode_addresses(addresses: &[Address]) -> Result<String> {
    serde_json::to_string(addresses).map_err(|e| DatabaseError::Encode(e.to_string()))
}

fn decode_addresses(idx: usize, json: &str) -> std::result::Result<Vec<Address>, rusqlite::Error> {
    serde_json::from_str(json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn row_to_message(row: &Row<'_>) -> std::result::Result<StoredMessage, rusqlite::Error> {
    let to_json: String = row.get(6)?;
    let cc_json: String = row.get(7)?;
    let date_str: String = row.get(9)?;

    let date = DateTime::parse_from_rfc3339(&date_str)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(9, rusqlite::types::Type::Text, Box::new(e))
        })?;

    let from = Address {
        email: row.get(4)?,
        name: row.get(5)?,
    };

    Ok(StoredMessage {
        id: MessageId(row.get(0)?),
        account_id: AccountId(row.get(1)?),
        message_id: row.get(2)?,
        protocol_uid: row.get(3)?,
        from,
        to: decode_addresses(6, &to_json)?,
        cc: decode_addresses(7, &cc_json)?,
        subject: row.get(8)?,
        date,
        body_text: row.get(10)?,
        snippet: row.get(11)?,
        has_attachments: row.get::<_, i32>(12)? != 0,
    })
}
