use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::DispatchResult;

/// Overall classification of a dispatched batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Nothing was dispatched.
    Empty,
    /// Every item succeeded.
    Success,
    /// At least one item succeeded and at least one failed.
    PartialFailure,
    /// Every item failed.
    TotalFailure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub success_count: usize,
    pub failure_count: usize,
    pub status: BatchStatus,
    pub per_item_detail: Vec<DispatchResult>,
}

impl BatchSummary {
    pub fn is_total_failure(&self) -> bool {
        self.status == BatchStatus::TotalFailure
    }

    /// Keys of the items that did not make it to the destination.
    pub fn failed_keys(&self) -> Vec<&str> {
        self.per_item_detail
            .iter()
            .filter(|r| !r.success)
            .map(|r| r.key.as_str())
            .collect()
    }
}

/// Result of a non-total-failure batch dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub batch_id: Uuid,
    pub destination: String,
    #[serde(flatten)]
    pub summary: BatchSummary,
}

/// Counts successes and failures, keeping the per-item detail in input order.
pub fn summarize(results: Vec<DispatchResult>) -> BatchSummary {
    let success_count = results.iter().filter(|r| r.success).count();
    let failure_count = results.len() - success_count;

    let status = match (success_count, failure_count) {
        (0, 0) => BatchStatus::Empty,
        (0, _) => BatchStatus::TotalFailure,
        (_, 0) => BatchStatus::Success,
        _ => BatchStatus::PartialFailure,
    };

    BatchSummary {
        success_count,
        failure_count,
        status,
        per_item_detail: results,
    }
}

/// Label the persistence collaborator stores for one item.
pub fn status_label(result: &DispatchResult) -> &'static str {
    if result.success {
        "sent"
    } else {
        "failed"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::AppError;
    use crate::models::SendResponse;
    use serde_json::json;

    fn ok(key: &str) -> DispatchResult {
        DispatchResult::succeeded(
            key,
            SendResponse {
                ok: true,
                status: 200,
                body: json!({"id": key}),
                rate_limit: None,
            },
            1,
        )
    }

    fn failed(key: &str) -> DispatchResult {
        DispatchResult::failed(key, &AppError::from_status(400, "invalid"), 1)
    }

    #[test]
    fn test_empty_batch() {
        let summary = summarize(Vec::new());
        assert_eq!(summary.status, BatchStatus::Empty);
        assert_eq!(summary.success_count, 0);
        assert_eq!(summary.failure_count, 0);
        assert!(summary.per_item_detail.is_empty());
        assert!(!summary.is_total_failure());
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(summarize(vec![ok("a"), ok("b")]).status, BatchStatus::Success);
        assert_eq!(
            summarize(vec![ok("a"), failed("b")]).status,
            BatchStatus::PartialFailure
        );

        let total = summarize(vec![failed("a"), failed("b")]);
        assert_eq!(total.status, BatchStatus::TotalFailure);
        assert!(total.is_total_failure());
        assert_eq!(total.failed_keys(), vec!["a", "b"]);
    }

    #[test]
    fn test_labels() {
        assert_eq!(status_label(&ok("a")), "sent");
        assert_eq!(status_label(&failed("a")), "failed");
    }

    #[test]
    fn test_outcome_serializes_flat() {
        let outcome = BatchOutcome {
            batch_id: Uuid::nil(),
            destination: "instantly".into(),
            summary: summarize(vec![ok("a")]),
        };
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["status"], json!("success"));
        assert_eq!(value["success_count"], json!(1));
        assert_eq!(value["destination"], json!("instantly"));
    }
}
