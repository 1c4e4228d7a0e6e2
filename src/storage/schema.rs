//! SQL schema definitions as const strings.
//!
//! Contains the complete SQLite schema for the sync and triage engine.

/// SQL to create the accounts table.
pub const CREATE_ACCOUNTS: &str = r#"
CREATE TABLE IF NOT EXISTS accounts (
    id TEXT PRIMARY KEY,
    email TEXT NOT NULL,
    host TEXT NOT NULL,
    port INTEGER NOT NULL,
    protocol TEXT NOT NULL,
    username TEXT NOT NULL,
    use_tls INTEGER NOT NULL DEFAULT 1,
    verify_tls INTEGER NOT NULL DEFAULT 1,
    timeout_seconds INTEGER NOT NULL DEFAULT 30,
    auto_classify INTEGER NOT NULL DEFAULT 1,
    is_active INTEGER NOT NULL DEFAULT 1,
    last_sync_error TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
)
"#;

/// SQL to create the messages table.
pub const CREATE_MESSAGES: &str = r#"
CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    account_id TEXT NOT NULL REFERENCES accounts(id),
    message_id TEXT NOT NULL,
    protocol_uid TEXT NOT NULL,
    from_address TEXT NOT NULL,
    from_name TEXT,
    to_addresses TEXT NOT NULL,
    cc_addresses TEXT NOT NULL,
    subject TEXT,
    body_text TEXT,
    body_html TEXT,
    snippet TEXT NOT NULL,
    date TEXT NOT NULL,
    has_attachments INTEGER NOT NULL DEFAULT 0,
    raw_size INTEGER NOT NULL DEFAULT 0,
    is_read INTEGER NOT NULL DEFAULT 0,
    is_starred INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    UNIQUE (account_id, message_id),
    UNIQUE (account_id, protocol_uid)
)
"#;

/// SQL to create message indexes.
pub const CREATE_MESSAGE_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_messages_account ON messages(account_id);
CREATE INDEX IF NOT EXISTS idx_messages_date ON messages(date DESC)
"#;

/// SQL to create the attachments table.
pub const CREATE_ATTACHMENTS: &str = r#"
CREATE TABLE IF NOT EXISTS attachments (
    id TEXT PRIMARY KEY,
    message_id TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
    filename TEXT NOT NULL,
    mime_type TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    local_path TEXT NOT NULL
)
"#;

/// SQL to create the classifications table.
pub const CREATE_CLASSIFICATIONS: &str = r#"
CREATE TABLE IF NOT EXISTS classifications (
    message_id TEXT PRIMARY KEY REFERENCES messages(id) ON DELETE CASCADE,
    model_a_label TEXT,
    model_a_confidence REAL,
    model_a_rationale TEXT,
    model_b_label TEXT,
    model_b_confidence REAL,
    model_b_rationale TEXT,
    final_label TEXT NOT NULL,
    final_reason TEXT NOT NULL,
    decided_by TEXT NOT NULL,
    decided_at TEXT NOT NULL
)
"#;

/// SQL to create the audit log.
pub const CREATE_AUDIT_LOG: &str = r#"
CREATE TABLE IF NOT EXISTS audit_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    account_id TEXT,
    action TEXT NOT NULL,
    status TEXT NOT NULL,
    detail TEXT NOT NULL,
    created_at TEXT NOT NULL
)
"#;

/// SQL to create the IMAP high-water marks.
pub const CREATE_IMAP_CHECKPOINTS: &str = r#"
CREATE TABLE IF NOT EXISTS imap_checkpoints (
    account_id TEXT PRIMARY KEY REFERENCES accounts(id),
    last_uid INTEGER NOT NULL,
    updated_at TEXT NOT NULL
)
"#;

/// Adds the per-account prompt override.
pub const ADD_ACCOUNT_PROMPT: &str =
    "ALTER TABLE accounts ADD COLUMN custom_classification_prompt TEXT";

/// Ties the IMAP high-water mark to the mailbox's UIDVALIDITY.
pub const ADD_CHECKPOINT_UID_VALIDITY: &str =
    "ALTER TABLE imap_checkpoints ADD COLUMN uid_validity INTEGER";

/// One step of the schema history.
#[derive(Debug)]
pub struct Migration {
    /// `PRAGMA user_version` once applied.
    pub version: i64,
    pub statements: &'static [&'static str],
}

/// Every migration, oldest first.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        statements: &[
            CREATE_ACCOUNTS,
            CREATE_MESSAGES,
            CREATE_MESSAGE_INDEXES,
            CREATE_ATTACHMENTS,
            CREATE_CLASSIFICATIONS,
            CREATE_AUDIT_LOG,
            CREATE_IMAP_CHECKPOINTS,
        ],
    },
    Migration {
        version: 2,
        statements: &[ADD_ACCOUNT_PROMPT, ADD_CHECKPOINT_UID_VALIDITY],
    },
];

pub fn latest_version() -> i64 {
    MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
}
