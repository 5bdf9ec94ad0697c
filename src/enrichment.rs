//! Campaign enrichment pipeline.
//!
//! Each listed campaign moves through:
//! 1. `Listed`: returned by `list_entities`
//! 2. `SubResourceFetched`: analytics (and overview) fetched, or degraded on failure
//! 3. `Transformed`: merged into an [`EnrichedCampaign`]
//!
//! A campaign that cannot be built at all ends as a `Fallback` stub. No
//! campaign is ever dropped from the result set.

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;

use crate::destination::AnalyticsSource;
use crate::errors::AppError;
use crate::limiter::ConcurrencyLimiter;
use crate::rate_limit::RateLimitTracker;
use crate::models::{
    leads_ready, percentage, CampaignSummary, EnrichedCampaign, EnrichmentState, MetricSet,
    SubResource,
};
use crate::retry::{execute_with_retry, RetryPolicy};

#[derive(Debug, Clone)]
pub struct EnrichmentSettings {
    /// Campaigns enriched together, and the limiter capacity.
    pub batch_size: usize,
    /// Pause between two batches.
    pub batch_delay: Duration,
    /// Read-path retry policy for list and sub-resource calls.
    pub retry: RetryPolicy,
}

impl Default for EnrichmentSettings {
    fn default() -> Self {
        Self {
            batch_size: 3,
            batch_delay: Duration::from_millis(250),
            retry: RetryPolicy::new(2, Duration::from_millis(500)),
        }
    }
}

pub struct EnrichmentPipeline {
    source: Arc<dyn AnalyticsSource>,
    limiter: Arc<ConcurrencyLimiter>,
    rate_limits: Arc<RateLimitTracker>,
    settings: EnrichmentSettings,
}

impl EnrichmentPipeline {
    /// Pipeline with its own limiter (capacity `batch_size`) and rate-limit state.
    pub fn new(source: Arc<dyn AnalyticsSource>, settings: EnrichmentSettings) -> Self {
        Self {
            source,
            limiter: Arc::new(ConcurrencyLimiter::new("enrichment", settings.batch_size)),
            rate_limits: Arc::new(RateLimitTracker::default()),
            settings,
        }
    }

    /// Uses a shared limiter, so reads count against the same bound as writes.
    pub fn with_limiter(mut self, limiter: Arc<ConcurrencyLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    /// Uses shared rate-limit state, consulted before every read call.
    pub fn with_rate_limits(mut self, rate_limits: Arc<RateLimitTracker>) -> Self {
        self.rate_limits = rate_limits;
        self
    }

    /// Lists every campaign and enriches it.
    ///
    /// Only a failing list call is an error; sub-resource failures degrade single entries.
    pub async fn run(&self) -> Result<Vec<EnrichedCampaign>, AppError> {
        let listed = self.list().await?;
        tracing::info!(campaigns = listed.len(), "Campaigns listed, enriching");
        Ok(self.enrich_all(listed).await)
    }

    /// Lists campaigns through the read-path retry policy.
    pub async fn list(&self) -> Result<Vec<CampaignSummary>, AppError> {
        let source = self.source.as_ref();
        let tracker = self.rate_limits.as_ref();
        execute_with_retry("list_entities", &self.settings.retry, move |_| async move {
            tracker.wait_if_exhausted().await;
            source.list_entities().await
        })
        .await
        .result
    }

    /// Enriches in batches of `batch_size`, pausing `batch_delay` between batches.
    pub async fn enrich_all(&self, summaries: Vec<CampaignSummary>) -> Vec<EnrichedCampaign> {
        let batch_size = self.settings.batch_size.max(1);
        let mut enriched = Vec::with_capacity(summaries.len());

        for (index, batch) in summaries.chunks(batch_size).enumerate() {
            if index > 0 && !self.settings.batch_delay.is_zero() {
                tokio::time::sleep(self.settings.batch_delay).await;
            }
            enriched.extend(join_all(batch.iter().map(|summary| self.enrich_one(summary))).await);
        }

        let degraded = enriched.iter().filter(|c| c.degraded).count();
        if degraded > 0 {
            tracing::warn!(
                total = enriched.len(),
                degraded,
                "Enrichment finished with degraded campaigns"
            );
        }
        enriched
    }

    /// Enriches a single listed campaign. Never fails.
    pub async fn enrich_one(&self, summary: &CampaignSummary) -> EnrichedCampaign {
        let sub_resource = if buildable(summary).is_ok() {
            self.fetch_sub_resource(summary).await
        } else {
            None
        };

        match build_enriched(summary, sub_resource.as_ref()) {
            Ok(campaign) => campaign,
            Err(e) => {
                tracing::warn!(
                    campaign_id = %summary.id,
                    state = ?EnrichmentState::Fallback,
                    "Falling back to stub: {}",
                    e
                );
                EnrichedCampaign::fallback(summary)
            }
        }
    }

    async fn fetch_sub_resource(&self, summary: &CampaignSummary) -> Option<SubResource> {
        let fetched = {
            let _permit = self.limiter.acquire().await;
            let source = self.source.as_ref();
            let tracker = self.rate_limits.as_ref();
            let id = summary.id.as_str();
            execute_with_retry(id, &self.settings.retry, move |_| async move {
                tracker.wait_if_exhausted().await;
                source.fetch_sub_resource(id).await
            })
            .await
        };

        let sub_resource = match fetched.result {
            Ok(sub_resource) => Some(sub_resource),
            Err(e) => {
                tracing::warn!(
                    campaign_id = %summary.id,
                    attempts = fetched.attempts,
                    "Sub-resource fetch failed, returning degraded campaign: {}",
                    e
                );
                None
            }
        };
        tracing::debug!(
            campaign_id = %summary.id,
            state = ?EnrichmentState::SubResourceFetched {
                degraded: sub_resource.is_none()
            },
            "Campaign sub-resources resolved"
        );
        sub_resource
    }
}

/// A summary can be enriched when it was readable and carries an id.
fn buildable(summary: &CampaignSummary) -> Result<&str, AppError> {
    if let Some(reason) = &summary.unreadable {
        return Err(AppError::InvalidEntity(format!(
            "campaign {} could not be read: {}",
            summary.id, reason
        )));
    }

    let id = summary.id.trim();
    if id.is_empty() {
        return Err(AppError::InvalidEntity(
            "campaign has an empty id".to_string(),
        ));
    }
    Ok(id)
}

/// Merges list-level fields with fetched sub-resources.
///
/// Per field the first non-null value wins, in the order analytics, overview,
/// list level. Without a sub-resource every metric is zero and the result is
/// flagged `degraded`.
pub fn build_enriched(
    summary: &CampaignSummary,
    sub_resource: Option<&SubResource>,
) -> Result<EnrichedCampaign, AppError> {
    let id = buildable(summary)?;

    let name = summary
        .name
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .unwrap_or(id)
        .to_string();

    let empty = MetricSet::default();
    let sources: Vec<&MetricSet> = match sub_resource {
        Some(sub) => {
            let mut sources = vec![&sub.analytics];
            sources.extend(sub.overview.as_ref());
            sources.push(&summary.metrics);
            sources
        }
        None => vec![&empty],
    };

    let pick = |field: fn(&MetricSet) -> Option<i64>| -> i64 {
        sources.iter().find_map(|m| field(m)).unwrap_or(0).max(0)
    };

    let total_leads = pick(|m| m.total_leads);
    let contacted = pick(|m| m.contacted);
    let emails_sent = pick(|m| m.emails_sent);
    let opened = pick(|m| m.opened);
    let clicked = pick(|m| m.clicked);
    let replied = pick(|m| m.replied);
    let bounced = pick(|m| m.bounced);
    let unsubscribed = pick(|m| m.unsubscribed);

    Ok(EnrichedCampaign {
        id: id.to_string(),
        name,
        status: summary.status,
        total_leads,
        contacted,
        emails_sent,
        opened,
        clicked,
        replied,
        bounced,
        unsubscribed,
        leads_ready: leads_ready(total_leads, contacted, bounced, unsubscribed),
        open_rate: percentage(opened, emails_sent),
        click_rate: percentage(clicked, emails_sent),
        reply_rate: percentage(replied, emails_sent),
        bounce_rate: percentage(bounced, emails_sent),
        degraded: sub_resource.is_none(),
        state: EnrichmentState::Transformed,
    })
}
