//! Classification results.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row, Transaction};

use crate::domain::{ClassificationResult, DecidedBy, MessageId, ModelVerdict};
use crate::storage::database::{Database, DatabaseError, Result};

const UPSERT: &str = r#"
INSERT INTO classifications (
    message_id,
    model_a_label, model_a_confidence, model_a_rationale,
    model_b_label, model_b_confidence, model_b_rationale,
    final_label, final_reason, decided_by, decided_at
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
ON CONFLICT(message_id) DO UPDATE SET
    model_a_label = excluded.model_a_label,
    model_a_confidence = excluded.model_a_confidence,
    model_a_rationale = excluded.model_a_rationale,
    model_b_label = excluded.model_b_label,
    model_b_confidence = excluded.model_b_confidence,
    model_b_rationale = excluded.model_b_rationale,
    final_label = excluded.final_label,
    final_reason = excluded.final_reason,
    decided_by = excluded.decided_by,
    decided_at = excluded.decided_at
"#;

/// Writes all results in one transaction, replacing any previous result
/// for the same message. Either every row lands or none does.
pub async fn upsert_batch(db: &Database, results: Vec<ClassificationResult>) -> Result<usize> {
    if results.is_empty() {
        return Ok(0);
    }

    db.transaction(move |tx| {
        for result in &results {
            upsert_in(tx, result)?;
        }
        Ok(results.len())
    })
    .await
}

fn upsert_in(tx: &Transaction<'_>, result: &ClassificationResult) -> Result<()> {
    let a = result.model_a.as_ref();
    let b = result.model_b.as_ref();
    tx.execute(
        UPSERT,
        params![
            result.message_id.0,
            a.map(|v| v.label.as_str()),
            a.map(|v| v.confidence as f64),
            a.map(|v| v.rationale.as_str()),
            b.map(|v| v.label.as_str()),
            b.map(|v| v.confidence as f64),
            b.map(|v| v.rationale.as_str()),
            result.final_label,
            result.final_reason,
            result.decided_by.as_str(),
            result.decided_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// Replaces the final decision of a message, keeping any model outputs.
///
/// Creates the row when the message was never classified.
pub async fn set_final(
    db: &Database,
    message_id: &MessageId,
    label: &str,
    reason: &str,
    decided_by: DecidedBy,
) -> Result<()> {
    let message_id = message_id.clone();
    let label = label.to_string();
    let reason = reason.to_string();

    db.with_conn(move |conn| {
        let known: u32 = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE id = ?1",
            [&message_id.0],
            |row| row.get(0),
        )?;
        if known == 0 {
            return Err(DatabaseError::NotFound(format!("message {}", message_id)));
        }

        conn.execute(
            r#"
            INSERT INTO classifications (message_id, final_label, final_reason, decided_by, decided_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(message_id) DO UPDATE SET
                final_label = excluded.final_label,
                final_reason = excluded.final_reason,
                decided_by = excluded.decided_by,
                decided_at = excluded.decided_at
            "#,
            params![
                message_id.0,
                label,
                reason,
                decided_by.as_str(),
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    })
    .await
}

/// Loads the result for a message.
pub async fn get(db: &Database, message_id: &MessageId) -> Result<Option<ClassificationResult>> {
    let message_id = message_id.clone();

    db.with_conn(move |conn| {
        let mut stmt = conn.prepare(
            r#"
            SELECT message_id,
                   model_a_label, model_a_confidence, model_a_rationale,
                   model_b_label, model_b_confidence, model_b_rationale,
                   final_label, final_reason, decided_by, decided_at
            FROM classifications WHERE message_id = ?1
            "#,
        )?;
        let result = stmt.query_row([&message_id.0], row_to_result).optional()?;
        Ok(result)
    })
    .await
}

/// Counts results written for an account's messages.
pub async fn count_for_account(db: &Database, account_id: &crate::domain::AccountId) -> Result<u32> {
    let account_id = account_id.clone();

    db.with_conn(move |conn| {
        let count: u32 = conn.query_row(
            r#"
            SELECT COUNT(*) FROM classifications c
            JOIN messages m ON m.id = c.message_id
            WHERE m.account_id = ?1
            "#,
            [&account_id.0],
            |row| row.get(0),
        )?;
        Ok(count)
    })
    .await
}

fn verdict(
    row: &Row<'_>,
    first: usize,
) -> std::result::Result<Option<ModelVerdict>, rusqlite::Error> {
    let label: Option<String> = row.get(first)?;
    Ok(match label {
        Some(label) => Some(ModelVerdict {
            label,
            confidence: row.get::<_, Option<f64>>(first + 1)?.unwrap_or(0.0) as f32,
            rationale: row.get::<_, Option<String>>(first + 2)?.unwrap_or_default(),
        }),
        None => None,
    })
}

fn row_to_result(row: &Row<'_>) -> std::result::Result<ClassificationResult, rusqlite::Error> {
    let decided_by_str: String = row.get(9)?;
    let decided_at_str: String = row.get(10)?;

    let decided_by = DecidedBy::parse(&decided_by_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            9,
            rusqlite::types::Type::Text,
            format!("unknown decided_by {decided_by_str}").into(),
        )
    })?;
    let decided_at = DateTime::parse_from_rfc3339(&decided_at_str)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(10, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(ClassificationResult {
        message_id: MessageId(row.get(0)?),
        model_a: verdict(row, 1)?,
        model_b: verdict(row, 4)?,
        final_label: row.get(7)?,
        final_reason: row.get(8)?,
        decided_by,
        decided_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Account, Address, Envelope, NewMessage};
    use crate::storage::queries::{accounts, messages};
    use pretty_assertions::assert_eq;

    async fn setup(n: usize) -> (Database, Vec<MessageId>) {
        let db = Database::open_in_memory().await.unwrap();
        let account = Account::imap("acc", "me@example.com", "h");
        accounts::insert(&db, &account).await.unwrap();

        let mut ids = Vec::new();
        for i in 0..n {
            let message = NewMessage {
                account_id: account.id.clone(),
                protocol_uid: i.to_string(),
                envelope: Envelope {
                    message_id: format!("<{i}@x>"),
                    from: Address::new("a@example.com"),
                    to: Vec::new(),
                    cc: Vec::new(),
                    subject: None,
                    date: Utc::now(),
                },
                body_text: None,
                body_html: None,
                attachments: Vec::new(),
                raw_size: 10,
            };
            if let messages::UpsertOutcome::Inserted(id) =
                messages::insert(&db, &message, Vec::new()).await.unwrap()
            {
                ids.push(id);
            }
        }
        (db, ids)
    }

    fn consensus(id: &MessageId) -> ClassificationResult {
        let verdict = ModelVerdict {
            label: "SPAM".into(),
            confidence: 0.9,
            rationale: "cold outreach".into(),
        };
        ClassificationResult {
            message_id: id.clone(),
            model_a: Some(verdict.clone()),
            model_b: Some(verdict),
            final_label: "SPAM".into(),
            final_reason: "cold outreach".into(),
            decided_by: DecidedBy::Consensus,
            decided_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn batch_upsert_and_get() {
        let (db, ids) = setup(2).await;
        let written = upsert_batch(&db, ids.iter().map(consensus).collect())
            .await
            .unwrap();
        assert_eq!(written, 2);

        let stored = get(&db, &ids[0]).await.unwrap().unwrap();
        assert_eq!(stored.decided_by, DecidedBy::Consensus);
        assert_eq!(stored.model_a.unwrap().label, "SPAM");
        assert_eq!(
            count_for_account(&db, &"acc".into()).await.unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn batch_is_all_or_nothing() {
        let (db, ids) = setup(1).await;
        let mut results = vec![consensus(&ids[0])];
        results.push(consensus(&MessageId::from("missing")));

        assert!(upsert_batch(&db, results).await.is_err());
        assert!(get(&db, &ids[0]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn second_write_replaces_first() {
        let (db, ids) = setup(1).await;
        upsert_batch(&db, vec![consensus(&ids[0])]).await.unwrap();

        let rule = ClassificationResult::from_rule(
            ids[0].clone(),
            "Services",
            "whitelisted sender",
            DecidedBy::RuleWhitelist,
        );
        upsert_batch(&db, vec![rule]).await.unwrap();

        let stored = get(&db, &ids[0]).await.unwrap().unwrap();
        assert_eq!(stored.final_label, "Services");
        assert!(stored.model_a.is_none());
    }

    #[tokio::test]
    async fn set_final_keeps_model_outputs() {
        let (db, ids) = setup(1).await;
        upsert_batch(&db, vec![consensus(&ids[0])]).await.unwrap();

        set_final(&db, &ids[0], "Interesting", "user override", DecidedBy::Manual)
            .await
            .unwrap();

        let stored = get(&db, &ids[0]).await.unwrap().unwrap();
        assert_eq!(stored.final_label, "Interesting");
        assert_eq!(stored.decided_by, DecidedBy::Manual);
        assert_eq!(stored.model_b.unwrap().label, "SPAM");
    }

    #[tokio::test]
    async fn set_final_creates_missing_row() {
        let (db, ids) = setup(1).await;
        set_final(&db, &ids[0], "Deleted", "deleted by user", DecidedBy::UserDelete)
            .await
            .unwrap();

        let stored = get(&db, &ids[0]).await.unwrap().unwrap();
        assert_eq!(stored.decided_by, DecidedBy::UserDelete);
        assert!(stored.model_a.is_none());
    }

    #[tokio::test]
    async fn set_final_rejects_unknown_message() {
        let (db, _) = setup(0).await;
        let err = set_final(&db, &"nope".into(), "X", "", DecidedBy::Manual)
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound(_)));
    }
}
