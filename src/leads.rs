//! Turns raw lead records into dispatchable work items.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::OnceLock;

use crate::models::WorkItem;

/// A lead as submitted by the dashboard. Everything besides the email is
/// passed through to the destination untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeadRecord {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// A record that was left out of the batch, with the reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedLead {
    pub index: usize,
    pub email: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PreparedBatch {
    pub items: Vec<WorkItem>,
    pub skipped: Vec<SkippedLead>,
}

fn email_regex() -> &'static Regex {
    static EMAIL: OnceLock<Regex> = OnceLock::new();
    EMAIL.get_or_init(|| {
        // Simplified RFC 5322: local@domain.tld
        Regex::new(
            r"^[a-zA-Z0-9.!#$%&'*+/=?^_`{|}~-]+@[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)+$",
        )
        .expect("email pattern is valid")
    })
}

/// Validate email address
///
/// Checks for:
/// - Minimum length and an `@`
/// - Placeholder patterns (runs of repeated digits like 999999)
/// - A dotted domain
pub fn is_valid_email(email: &str) -> bool {
    if email.len() < 5 || !email.contains('@') {
        return false;
    }

    const FAKE_PATTERNS: [&str; 4] = ["999999", "111111", "000000", "123456789"];
    if let Some(pattern) = FAKE_PATTERNS.iter().find(|p| email.contains(*p)) {
        tracing::warn!("Invalid email detected (fake pattern '{}'): {}", pattern, email);
        return false;
    }

    email_regex().is_match(email)
}

/// Validates, normalizes and de-duplicates leads, keeping the first occurrence of each email.
///
/// The work item key is the lowercased email; the payload is the full record
/// with the normalized email written back.
pub fn prepare_work_items(records: Vec<LeadRecord>) -> PreparedBatch {
    let mut seen = HashSet::new();
    let mut batch = PreparedBatch::default();

    for (index, record) in records.into_iter().enumerate() {
        let email = record
            .email
            .as_deref()
            .map(|e| e.trim().to_lowercase())
            .filter(|e| !e.is_empty());

        let Some(email) = email else {
            batch.skipped.push(SkippedLead {
                index,
                email: None,
                reason: "missing email".to_string(),
            });
            continue;
        };

        if !is_valid_email(&email) {
            batch.skipped.push(SkippedLead {
                index,
                email: Some(email),
                reason: "invalid email".to_string(),
            });
            continue;
        }

        if !seen.insert(email.clone()) {
            tracing::debug!(email = %email, index, "Duplicate lead skipped");
            batch.skipped.push(SkippedLead {
                index,
                email: Some(email),
                reason: "duplicate email".to_string(),
            });
            continue;
        }

        let mut payload = record.fields;
        payload.insert("email".to_string(), Value::String(email.clone()));
        batch.items.push(WorkItem::new(email, Value::Object(payload)));
    }

    if !batch.skipped.is_empty() {
        tracing::info!(
            accepted = batch.items.len(),
            skipped = batch.skipped.len(),
            "Lead batch prepared with skipped records"
        );
    }

    batch
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn lead(value: Value) -> LeadRecord {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_valid_emails() {
        assert!(is_valid_email("joao.silva@gmail.com"));
        assert!(is_valid_email("ops+leads@example.co.uk"));
    }

    #[test]
    fn test_invalid_emails() {
        assert!(!is_valid_email("invalid"));
        assert!(!is_valid_email("a@b"));
        assert!(!is_valid_email("no-domain@"));
        assert!(!is_valid_email("1199999999333@gmail.com"));
        assert!(!is_valid_email("user@localhost"));
    }

    #[test]
    fn test_prepare_normalizes_and_dedupes() {
        let batch = prepare_work_items(vec![
            lead(json!({"email": " Ana@Example.com ", "first_name": "Ana"})),
            lead(json!({"email": "bruno@example.com"})),
            lead(json!({"email": "ana@example.com", "first_name": "Duplicate"})),
            lead(json!({"first_name": "No email"})),
            lead(json!({"email": "broken"})),
        ]);

        let keys: Vec<_> = batch.items.iter().map(|i| i.key.as_str()).collect();
        assert_eq!(keys, vec!["ana@example.com", "bruno@example.com"]);
        assert_eq!(batch.items[0].payload["first_name"], json!("Ana"));
        assert_eq!(batch.items[0].payload["email"], json!("ana@example.com"));

        let reasons: Vec<_> = batch
            .skipped
            .iter()
            .map(|s| (s.index, s.reason.as_str()))
            .collect();
        assert_eq!(
            reasons,
            vec![
                (2, "duplicate email"),
                (3, "missing email"),
                (4, "invalid email")
            ]
        );
    }
}
