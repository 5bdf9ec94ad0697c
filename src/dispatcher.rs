//! Fan-out of a batch of work items to one destination.
//!
//! Every item gets its own tokio task. A task holds its limiter slot for the
//! whole retry sequence, so retries never jump the queue ahead of waiting
//! items. Results are joined in input order.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;

use crate::destination::Destination;
use crate::errors::AppError;
use crate::limiter::ConcurrencyLimiter;
use crate::models::{DispatchResult, SendResponse, WorkItem};
use crate::rate_limit::RateLimitTracker;
use crate::retry::{execute_with_retry, RetryPolicy};

/// Per-item result of a deadline-bounded dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ItemOutcome {
    Resolved(DispatchResult),
    /// Still in flight when the deadline passed. The task keeps running detached.
    Unknown { key: String },
}

impl ItemOutcome {
    pub fn key(&self) -> &str {
        match self {
            ItemOutcome::Resolved(result) => &result.key,
            ItemOutcome::Unknown { key } => key,
        }
    }

    pub fn result(&self) -> Option<&DispatchResult> {
        match self {
            ItemOutcome::Resolved(result) => Some(result),
            ItemOutcome::Unknown { .. } => None,
        }
    }
}

#[derive(Clone)]
pub struct BatchDispatcher {
    destination: Arc<dyn Destination>,
    limiter: Arc<ConcurrencyLimiter>,
    rate_limits: Arc<RateLimitTracker>,
    policy: RetryPolicy,
    call_timeout: Duration,
}

impl BatchDispatcher {
    pub fn new(
        destination: Arc<dyn Destination>,
        limiter: Arc<ConcurrencyLimiter>,
        rate_limits: Arc<RateLimitTracker>,
        policy: RetryPolicy,
        call_timeout: Duration,
    ) -> Self {
        Self {
            destination,
            limiter,
            rate_limits,
            policy,
            call_timeout,
        }
    }

    /// Sends every item and waits for all of them. `results[i]` belongs to `items[i]`.
    pub async fn dispatch(&self, items: Vec<WorkItem>) -> Vec<DispatchResult> {
        if items.is_empty() {
            return Vec::new();
        }

        let handles = self.spawn_all(items);
        let mut results = Vec::with_capacity(handles.len());
        for (key, handle) in handles {
            results.push(Self::joined(key, handle.await));
        }
        results
    }

    /// Like [`dispatch`](Self::dispatch) but stops waiting at `deadline`.
    ///
    /// Items that have not finished by then are reported as [`ItemOutcome::Unknown`].
    pub async fn dispatch_with_deadline(
        &self,
        items: Vec<WorkItem>,
        deadline: Instant,
    ) -> Vec<ItemOutcome> {
        let handles = self.spawn_all(items);
        let mut outcomes = Vec::with_capacity(handles.len());

        for (key, mut handle) in handles {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(joined) => outcomes.push(ItemOutcome::Resolved(Self::joined(key, joined))),
                Err(_) => {
                    tracing::warn!(
                        key = %key,
                        destination = self.destination.name(),
                        "Deadline passed before item resolved; outcome unknown"
                    );
                    outcomes.push(ItemOutcome::Unknown { key });
                }
            }
        }

        outcomes
    }

    fn spawn_all(&self, items: Vec<WorkItem>) -> Vec<(String, JoinHandle<DispatchResult>)> {
        tracing::info!(
            destination = self.destination.name(),
            items = items.len(),
            capacity = self.limiter.capacity(),
            "Dispatching batch"
        );

        items
            .into_iter()
            .map(|item| {
                let key = item.key.clone();
                let handle = tokio::spawn(run_item(
                    self.destination.clone(),
                    self.limiter.clone(),
                    self.rate_limits.clone(),
                    self.policy.clone(),
                    self.call_timeout,
                    item,
                ));
                (key, handle)
            })
            .collect()
    }

    fn joined(key: String, joined: Result<DispatchResult, JoinError>) -> DispatchResult {
        match joined {
            Ok(result) => result,
            Err(e) => {
                let reason = if e.is_panic() {
                    "dispatch task panicked"
                } else {
                    "dispatch task was cancelled"
                };
                tracing::error!(key = %key, "{}", reason);
                DispatchResult::aborted(key, reason)
            }
        }
    }
}

async fn run_item(
    destination: Arc<dyn Destination>,
    limiter: Arc<ConcurrencyLimiter>,
    rate_limits: Arc<RateLimitTracker>,
    policy: RetryPolicy,
    call_timeout: Duration,
    item: WorkItem,
) -> DispatchResult {
    // Released on drop, whatever the outcome.
    let _permit = limiter.acquire().await;

    let destination = destination.as_ref();
    let tracker = rate_limits.as_ref();
    let payload = &item.payload;

    let outcome = execute_with_retry(&item.key, &policy, move |_attempt| async move {
        tracker.wait_if_exhausted().await;
        send_once(destination, tracker, payload, call_timeout).await
    })
    .await;

    match outcome.result {
        Ok(response) => {
            tracing::debug!(key = %item.key, attempts = outcome.attempts, "Item delivered");
            DispatchResult::succeeded(item.key, response, outcome.attempts)
        }
        Err(err) => DispatchResult::failed(item.key, &err, outcome.attempts),
    }
}

/// One bounded call. Non-success statuses become errors so the retry executor can classify them.
async fn send_once(
    destination: &dyn Destination,
    tracker: &RateLimitTracker,
    payload: &Value,
    call_timeout: Duration,
) -> Result<SendResponse, AppError> {
    let response = tokio::time::timeout(call_timeout, destination.send(payload))
        .await
        .map_err(|_| AppError::Timeout(call_timeout))??;

    if let Some(state) = response.rate_limit {
        tracker.update(state);
    }

    if response.ok {
        Ok(response)
    } else {
        Err(AppError::from_status(response.status, &response.body_text()))
    }
}
