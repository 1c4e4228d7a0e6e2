//! Append-only audit log.

use chrono::{DateTime, Utc};
use rusqlite::{params, Row};

use crate::domain::{AccountId, AuditEntry, AuditStatus};
use crate::storage::database::{Database, Result};

/// Appends an entry. Entries are never updated.
pub async fn append(db: &Database, entry: &AuditEntry) -> Result<()> {
    let entry = entry.clone();

    db.with_conn(move |conn| {
        conn.execute(
            r#"
            INSERT INTO audit_log (account_id, action, status, detail, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                entry.account_id.as_ref().map(|id| id.0.as_str()),
                entry.action,
                entry.status.as_str(),
                entry.detail,
                entry.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    })
    .await
}

/// Most recent entries first.
pub async fn recent(db: &Database, limit: u32) -> Result<Vec<AuditEntry>> {
    db.with_conn(move |conn| {
        let mut stmt = conn.prepare(
            r#"
            SELECT account_id, action, status, detail, created_at
            FROM audit_log ORDER BY id DESC LIMIT ?1
            "#,
        )?;
        let rows = stmt.query_map([limit], row_to_entry)?;
        let entries: std::result::Result<Vec<_>, _> = rows.collect();
        Ok(entries?)
    })
    .await
}

/// Entries for one account, most recent first.
pub async fn for_account(db: &Database, account_id: &AccountId) -> Result<Vec<AuditEntry>> {
    let account_id = account_id.clone();

    db.with_conn(move |conn| {
        let mut stmt = conn.prepare(
            r#"
            SELECT account_id, action, status, detail, created_at
            FROM audit_log WHERE account_id = ?1 ORDER BY id DESC
            "#,
        )?;
        let rows = stmt.query_map([&account_id.0], row_to_entry)?;
        let entries: std::result::Result<Vec<_>, _> = rows.collect();
        Ok(entries?)
    })
    .await
}

fn row_to_entry(row: &Row<'_>) -> std::result::Result<AuditEntry, rusqlite::Error> {
    let status_str: String = row.get(2)?;
    let created_at_str: String = row.get(4)?;

    let status = AuditStatus::parse(&status_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            format!("unknown audit status {status_str}").into(),
        )
    })?;
    let created_at = DateTime::parse_from_rfc3339(&created_at_str)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(AuditEntry {
        account_id: row.get::<_, Option<String>>(0)?.map(AccountId),
        action: row.get(1)?,
        status,
        detail: row.get(3)?,
        created_at,
    })
}
