use async_trait::async_trait;
use reqwest::{Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::config::DestinationConfig;
use crate::destination::{AnalyticsSource, Destination};
use crate::errors::{AppError, ResultExt};
use crate::models::{CampaignSummary, MetricSet, SendResponse, SubResource};
use crate::rate_limit::{RateLimitState, RateLimitTracker};

/// HTTP client for an outbound marketing platform.
///
/// Implements both the push side (`POST /leads`) and the analytics side
/// (`/campaigns`, `/campaigns/{id}/analytics`, `/campaigns/{id}/overview`).
#[derive(Clone)]
pub struct PlatformClient {
    client: reqwest::Client,
    name: String,
    base_url: String,
    api_key: String,
    rate_limits: Arc<RateLimitTracker>,
}

impl PlatformClient {
    /// Creates a new `PlatformClient`.
    ///
    /// # Arguments
    ///
    /// * `name` - Destination name used in logs and limiter keys.
    /// * `base_url` - Base URL of the platform API, without trailing slash.
    /// * `api_key` - Bearer token.
    /// * `timeout` - Transport-level timeout for every request.
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| {
                AppError::Configuration(format!("Failed to create platform client: {}", e))
            })?;

        Ok(Self {
            client,
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            rate_limits: Arc::new(RateLimitTracker::default()),
        })
    }

    /// Records the `X-RateLimit-*` state of every analytics response in `rate_limits`.
    pub fn with_rate_limits(mut self, rate_limits: Arc<RateLimitTracker>) -> Self {
        self.rate_limits = rate_limits;
        self
    }

    /// Builds a client from a destination config. Fails without a usable API key.
    pub fn from_config(config: &DestinationConfig) -> Result<Self, AppError> {
        let api_key = config.api_key()?;
        Self::new(
            config.name.clone(),
            config.base_url.clone(),
            api_key,
            config.request_timeout(),
        )
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Joins `segments` onto the base URL, percent-encoding each one.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, AppError> {
        let mut url = Url::parse(&self.base_url).map_err(|e| {
            AppError::Configuration(format!("invalid base URL {}: {}", self.base_url, e))
        })?;
        url.path_segments_mut()
            .map_err(|_| {
                AppError::Configuration(format!("base URL {} cannot carry a path", self.base_url))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get(&self, segments: &[&str]) -> Result<Response, AppError> {
        let url = self.endpoint(segments)?;
        tracing::debug!(destination = %self.name, "GET {}", url);

        let response = self
            .client
            .get(url)
            .bearer_auth(&self.api_key)
            .send()
            .await?;

        if let Some(state) = RateLimitState::from_headers(response.headers()) {
            self.rate_limits.update(state);
        }
        Ok(response)
    }

    async fn get_json<T: DeserializeOwned>(&self, segments: &[&str]) -> Result<T, AppError> {
        let response = self.get(segments).await?;
        let response = Self::error_for_status(response).await?;
        response
            .json::<T>()
            .await
            .map_err(AppError::from)
            .with_context(|| format!("decoding /{} response", segments.join("/")))
    }

    async fn error_for_status(response: Response) -> Result<Response, AppError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        Err(AppError::from_status(status.as_u16(), &error_text))
    }
}

impl fmt::Debug for PlatformClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlatformClient")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

#[async_trait]
impl Destination for PlatformClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, payload: &Value) -> Result<SendResponse, AppError> {
        let url = self.endpoint(&["leads"])?;

        let response = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(payload)
            .send()
            .await?;

        let status = response.status();
        let rate_limit = RateLimitState::from_headers(response.headers());
        let text = response.text().await.unwrap_or_default();
        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };

        Ok(SendResponse {
            ok: status.is_success(),
            status: status.as_u16(),
            body,
            rate_limit,
        })
    }
}

#[async_trait]
impl AnalyticsSource for PlatformClient {
    async fn list_entities(&self) -> Result<Vec<CampaignSummary>, AppError> {
        let body: Value = self.get_json(&["campaigns"]).await?;
        let campaigns = unwrap_list(body)
            .into_iter()
            .enumerate()
            .map(|(index, raw)| CampaignSummary::from_listed(raw, index))
            .inspect(|campaign| {
                if let Some(reason) = &campaign.unreadable {
                    tracing::warn!(
                        destination = %self.name,
                        campaign_id = %campaign.id,
                        "Unreadable campaign kept as fallback: {}",
                        reason
                    );
                }
            })
            .collect::<Vec<_>>();

        tracing::info!(destination = %self.name, count = campaigns.len(), "Campaigns listed");
        Ok(campaigns)
    }

    async fn fetch_sub_resource(&self, entity_id: &str) -> Result<SubResource, AppError> {
        let analytics_path = ["campaigns", entity_id, "analytics"];
        let (analytics, overview) = tokio::try_join!(
            self.get_json::<Value>(&analytics_path),
            self.fetch_overview(entity_id),
        )?;

        Ok(SubResource {
            analytics: metric_set(analytics).with_context(|| {
                format!("reading analytics for campaign {}", entity_id)
            })?,
            overview,
        })
    }
}

impl PlatformClient {
    /// The overview endpoint is optional; a 404 means the platform does not offer it.
    async fn fetch_overview(&self, entity_id: &str) -> Result<Option<MetricSet>, AppError> {
        let response = self.get(&["campaigns", entity_id, "overview"]).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let response = Self::error_for_status(response).await?;
        let body: Value = response.json().await?;
        metric_set(body).map(Some)
    }
}

/// Lists come back bare or wrapped in `data` / `items`.
fn unwrap_list(body: Value) -> Vec<Value> {
    match body {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("data").or_else(|| map.remove("items")) {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

/// Analytics may come back as a single object or a one-element list.
fn metric_set(body: Value) -> Result<MetricSet, AppError> {
    let body = match body {
        Value::Array(items) => items.into_iter().next().unwrap_or(Value::Null),
        Value::Object(mut map) if map.contains_key("data") => {
            map.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    };

    if body.is_null() {
        return Ok(MetricSet::default());
    }

    serde_json::from_value(body).map_err(|e| AppError::InternalError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unwrap_list_shapes() {
        assert_eq!(unwrap_list(json!([{"id": 1}])).len(), 1);
        assert_eq!(unwrap_list(json!({"data": [{"id": 1}, {"id": 2}]})).len(), 2);
        assert_eq!(unwrap_list(json!({"items": [{"id": 1}]})).len(), 1);
        assert!(unwrap_list(json!({"unexpected": true})).is_empty());
    }

    #[test]
    fn test_metric_set_shapes() {
        let single = metric_set(json!({"emails_sent_count": 10, "open_count": 4})).unwrap();
        assert_eq!(single.emails_sent, Some(10));
        assert_eq!(single.opened, Some(4));

        let listed = metric_set(json!([{"sent": 3}])).unwrap();
        assert_eq!(listed.emails_sent, Some(3));

        assert_eq!(metric_set(json!([])).unwrap(), MetricSet::default());
    }

    #[test]
    fn test_debug_redacts_key() {
        let client = PlatformClient::new(
            "instantly",
            "https://api.example.com/",
            "secret-key",
            Duration::from_secs(5),
        )
        .unwrap();

        let rendered = format!("{:?}", client);
        assert!(!rendered.contains("secret-key"));
        assert_eq!(client.base_url(), "https://api.example.com");
    }

    #[test]
    fn test_endpoint_escapes_segments() {
        let client = PlatformClient::new(
            "instantly",
            "https://api.example.com/v2/",
            "key",
            Duration::from_secs(5),
        )
        .unwrap();

        let url = client.endpoint(&["campaigns", "a/b?c#d", "analytics"]).unwrap();
        assert_eq!(
            url.as_str(),
            "https://api.example.com/v2/campaigns/a%2Fb%3Fc%23d/analytics"
        );

        let leads = client.endpoint(&["leads"]).unwrap();
        assert_eq!(leads.as_str(), "https://api.example.com/v2/leads");
    }
}
