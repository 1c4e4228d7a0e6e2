//! Account CRUD operations.
//!
//! Provides database operations for account entities.

use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

use crate::domain::{Account, AccountId, Protocol};
use crate::storage::database::{Database, Result};

const ACCOUNT_COLUMNS: &str = r#"
    id, email, host, port, protocol, username, use_tls, verify_tls,
    timeout_seconds, auto_classify, is_active, last_sync_error,
    custom_classification_prompt
"#;

/// Inserts a new account into the database.
pub async fn insert(db: &Database, account: &Account) -> Result<()> {
    let account = account.clone();

    db.with_conn(move |conn| {
        let now = Utc::now().to_rfc3339();
        conn.execute(
            r#"
            INSERT INTO accounts (
                id, email, host, port, protocol, username, use_tls, verify_tls,
                timeout_seconds, auto_classify, is_active, last_sync_error,
                custom_classification_prompt, created_at, updated_at
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15
            )
            "#,
            params![
                account.id.0,
                account.email,
                account.host,
                account.port,
                account.protocol.as_str(),
                account.username,
                account.use_tls as i32,
                account.verify_tls as i32,
                account.timeout.as_secs() as i64,
                account.auto_classify as i32,
                account.is_active as i32,
                account.last_sync_error,
                account.custom_classification_prompt,
                now,
                now,
            ],
        )?;

        Ok(())
    })
    .await
}

/// Retrieves an account by its ID.
pub async fn get_by_id(db: &Database, account_id: &AccountId) -> Result<Option<Account>> {
    let account_id = account_id.clone();

    db.with_conn(move |conn| {
        let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?1");
        let mut stmt = conn.prepare(&sql)?;
        let result = stmt.query_row([&account_id.0], row_to_account).optional()?;
        Ok(result)
    })
    .await
}

/// Retrieves all accounts.
pub async fn get_all(db: &Database) -> Result<Vec<Account>> {
    db.with_conn(|conn| {
        let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts ORDER BY email");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], row_to_account)?;
        let accounts: std::result::Result<Vec<_>, _> = rows.collect();
        Ok(accounts?)
    })
    .await
}

/// Retrieves the accounts the scheduler should visit, in a stable order.
pub async fn get_active(db: &Database) -> Result<Vec<Account>> {
    db.with_conn(|conn| {
        let sql = format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE is_active = 1 ORDER BY created_at, id"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], row_to_account)?;
        let accounts: std::result::Result<Vec<_>, _> = rows.collect();
        Ok(accounts?)
    })
    .await
}

/// Records or clears the most recent sync failure.
pub async fn set_last_sync_error(
    db: &Database,
    account_id: &AccountId,
    error: Option<&str>,
) -> Result<()> {
    let account_id = account_id.clone();
    let error = error.map(|s| s.to_string());

    db.with_conn(move |conn| {
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE accounts SET last_sync_error = ?1, updated_at = ?2 WHERE id = ?3",
            params![error, now, account_id.0],
        )?;
        Ok(())
    })
    .await
}

/// Enables or disables an account.
pub async fn set_active(db: &Database, account_id: &AccountId, active: bool) -> Result<()> {
    let account_id = account_id.clone();

    db.with_conn(move |conn| {
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE accounts SET is_active = ?1, updated_at = ?2 WHERE id = ?3",
            params![active as i32, now, account_id.0],
        )?;
        Ok(())
    })
    .await
}

fn row_to_account(row: &Row<'_>) -> std::result::Result<Account, rusqlite::Error> {
    let protocol_str: String = row.get(4)?;
    let timeout_secs: i64 = row.get(8)?;

    let protocol = Protocol::parse(&protocol_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            rusqlite::types::Type::Text,
            format!("unknown protocol {protocol_str}").into(),
        )
    })?;

    Ok(Account {
        id: AccountId(row.get(0)?),
        email: row.get(1)?,
        host: row.get(2)?,
        port: row.get(3)?,
        protocol,
        username: row.get(5)?,
        use_tls: row.get::<_, i32>(6)? != 0,
        verify_tls: row.get::<_, i32>(7)? != 0,
        timeout: Duration::from_secs(timeout_secs.max(0) as u64),
        auto_classify: row.get::<_, i32>(9)? != 0,
        is_active: row.get::<_, i32>(10)? != 0,
        last_sync_error: row.get(11)?,
        custom_classification_prompt: row.get(12)?,
    })
}
