//! Advisory view of the destination's own rate-limit window.

use chrono::{DateTime, TimeZone, Utc};
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;

const REMAINING_HEADER: &str = "x-ratelimit-remaining";
const RESET_HEADER: &str = "x-ratelimit-reset";
const LIMIT_HEADER: &str = "x-ratelimit-limit";

/// Reset values above this are epoch seconds, below it seconds-until-reset.
const EPOCH_THRESHOLD: i64 = 1_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitState {
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
    pub limit: u32,
}

impl RateLimitState {
    /// Reads the `X-RateLimit-*` headers. Returns `None` unless remaining and reset are both present.
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        Self::from_headers_at(headers, Utc::now())
    }

    pub fn from_headers_at(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Self> {
        let read = |name: &str| -> Option<i64> {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<i64>().ok())
        };

        let remaining = read(REMAINING_HEADER)?;
        let reset = read(RESET_HEADER)?;
        let limit = read(LIMIT_HEADER).unwrap_or(remaining);

        let reset_at = if reset >= EPOCH_THRESHOLD {
            Utc.timestamp_opt(reset, 0).single()?
        } else {
            now + chrono::Duration::seconds(reset.max(0))
        };

        Some(Self {
            remaining: remaining.clamp(0, u32::MAX as i64) as u32,
            reset_at,
            limit: limit.clamp(0, u32::MAX as i64) as u32,
        })
    }

    pub fn is_exhausted_at(&self, now: DateTime<Utc>) -> bool {
        self.remaining == 0 && self.reset_at > now
    }
}

/// Latest rate-limit state seen for one destination.
///
/// Consulted before each call; an exhausted window produces a pause capped at
/// `max_pause`, never a refusal.
#[derive(Debug)]
pub struct RateLimitTracker {
    state: Mutex<Option<RateLimitState>>,
    max_pause: Duration,
}

impl Default for RateLimitTracker {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl RateLimitTracker {
    pub fn new(max_pause: Duration) -> Self {
        Self {
            state: Mutex::new(None),
            max_pause,
        }
    }

    pub fn update(&self, state: RateLimitState) {
        let mut current = self.state.lock().unwrap_or_else(|p| p.into_inner());
        *current = Some(state);
    }

    pub fn current(&self) -> Option<RateLimitState> {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn advised_pause_at(&self, now: DateTime<Utc>) -> Option<Duration> {
        let state = self.current()?;
        if !state.is_exhausted_at(now) {
            return None;
        }
        let wait = (state.reset_at - now).to_std().ok()?;
        Some(wait.min(self.max_pause))
    }

    /// Sleeps until the window resets when the last response reported zero remaining calls.
    pub async fn wait_if_exhausted(&self) {
        if let Some(pause) = self.advised_pause_at(Utc::now()) {
            tracing::warn!(
                pause_ms = pause.as_millis() as u64,
                "Rate-limit window exhausted, pausing before next call"
            );
            tokio::time::sleep(pause).await;
        }
    }
}
