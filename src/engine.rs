//! Engine facade: the operations the HTTP layer and other callers use.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use crate::audit::OutcomeRecorder;
use crate::cache::CacheManager;
use crate::config::DestinationConfig;
use crate::destination::{AnalyticsSource, Destination};
use crate::dispatcher::BatchDispatcher;
use crate::enrichment::{EnrichmentPipeline, EnrichmentSettings};
use crate::errors::AppError;
use crate::limiter::LimiterRegistry;
use crate::models::{EnrichedCampaign, WorkItem};
use crate::platform_client::PlatformClient;
use crate::rate_limit::RateLimitTracker;
use crate::reporter::{summarize, BatchOutcome};

pub const CAMPAIGNS_CACHE_KEY: &str = "campaigns:enriched";

fn campaign_cache_key(id: &str) -> String {
    format!("campaign:{}", id)
}

pub struct Engine {
    cache: Arc<CacheManager>,
    recorder: Arc<dyn OutcomeRecorder>,
    limiters: LimiterRegistry,
    rate_limits: Mutex<HashMap<String, Arc<RateLimitTracker>>>,
    analytics: Option<EnrichmentPipeline>,
    cache_ttl: Duration,
    degraded_ttl: Duration,
}

impl Engine {
    pub fn new(cache: Arc<CacheManager>, recorder: Arc<dyn OutcomeRecorder>) -> Self {
        Self {
            cache,
            recorder,
            limiters: LimiterRegistry::new(),
            rate_limits: Mutex::new(HashMap::new()),
            analytics: None,
            cache_ttl: Duration::from_secs(300),
            degraded_ttl: Duration::from_secs(30),
        }
    }

    /// Enables the read path against `destination`.
    ///
    /// Reads share the destination's limiter and rate-limit state with dispatches,
    /// so both together never exceed `destination.concurrency` calls in flight.
    pub fn with_analytics(
        mut self,
        destination: &DestinationConfig,
        source: Arc<dyn AnalyticsSource>,
        settings: EnrichmentSettings,
    ) -> Self {
        let limiter = self
            .limiters
            .for_destination(&destination.name, destination.concurrency);
        let pipeline = EnrichmentPipeline::new(source, settings)
            .with_limiter(limiter)
            .with_rate_limits(self.rate_limit_tracker(&destination.name));
        self.analytics = Some(pipeline);
        self
    }

    /// TTL for fully enriched results, and the shorter one used when any entry is degraded.
    pub fn with_cache_ttls(mut self, cache_ttl: Duration, degraded_ttl: Duration) -> Self {
        self.cache_ttl = cache_ttl;
        self.degraded_ttl = degraded_ttl.min(cache_ttl);
        self
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    // ------------------------------------------------------------------
    // Write path
    // ------------------------------------------------------------------

    /// Dispatches `items` to the platform described by `config`.
    ///
    /// Fails with `Configuration` before any network call when the config is
    /// unusable, and with `TotalBatchFailure` when every item failed.
    pub async fn dispatch_batch(
        &self,
        items: Vec<WorkItem>,
        config: &DestinationConfig,
    ) -> Result<BatchOutcome, AppError> {
        config.validate()?;
        let client = PlatformClient::from_config(config)?
            .with_rate_limits(self.rate_limit_tracker(&config.name));
        self.dispatch_batch_to(items, config, Arc::new(client)).await
    }

    /// Same as [`dispatch_batch`](Self::dispatch_batch) with an explicit destination.
    pub async fn dispatch_batch_to(
        &self,
        items: Vec<WorkItem>,
        config: &DestinationConfig,
        destination: Arc<dyn Destination>,
    ) -> Result<BatchOutcome, AppError> {
        let dispatcher = self.dispatcher(config, destination)?;
        let batch_id = Uuid::new_v4();

        let results = dispatcher.dispatch(items.clone()).await;
        let outcome = BatchOutcome {
            batch_id,
            destination: config.name.clone(),
            summary: summarize(results),
        };

        tracing::info!(
            batch_id = %batch_id,
            destination = %config.name,
            sent = outcome.summary.success_count,
            failed = outcome.summary.failure_count,
            status = ?outcome.summary.status,
            "Batch dispatch finished"
        );

        if let Err(e) = self.recorder.record_batch_outcome(&items, &outcome).await {
            tracing::warn!(batch_id = %batch_id, "Failed to record batch outcome: {}", e);
        }

        if outcome.summary.success_count > 0 {
            self.invalidate_cache().await;
        }

        if outcome.summary.is_total_failure() {
            return Err(AppError::TotalBatchFailure(Box::new(outcome.summary)));
        }
        Ok(outcome)
    }

    /// A dispatcher sharing this engine's limiter and rate-limit state for the destination.
    pub fn dispatcher(
        &self,
        config: &DestinationConfig,
        destination: Arc<dyn Destination>,
    ) -> Result<BatchDispatcher, AppError> {
        config.validate()?;

        Ok(BatchDispatcher::new(
            destination,
            self.limiters.for_destination(&config.name, config.concurrency),
            self.rate_limit_tracker(&config.name),
            config.retry_policy(),
            config.request_timeout(),
        ))
    }

    /// Rate-limit state shared by every read and write against `destination`.
    pub fn rate_limit_tracker(&self, destination: &str) -> Arc<RateLimitTracker> {
        let mut trackers = self
            .rate_limits
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        trackers
            .entry(destination.to_string())
            .or_insert_with(|| Arc::new(RateLimitTracker::default()))
            .clone()
    }

    // ------------------------------------------------------------------
    // Read path
    // ------------------------------------------------------------------

    fn pipeline(&self) -> Result<&EnrichmentPipeline, AppError> {
        self.analytics.as_ref().ok_or_else(|| {
            AppError::Configuration("no analytics source configured".to_string())
        })
    }

    fn ttl_for(&self, degraded: bool) -> Duration {
        if degraded {
            self.degraded_ttl
        } else {
            self.cache_ttl
        }
    }

    /// Every campaign, enriched. Served from cache unless `force_refresh`.
    pub async fn get_enriched_entities(
        &self,
        force_refresh: bool,
    ) -> Result<Vec<EnrichedCampaign>, AppError> {
        let pipeline = self.pipeline()?;

        if !force_refresh {
            if let Some(cached) = self
                .cache
                .get::<Vec<EnrichedCampaign>>(CAMPAIGNS_CACHE_KEY)
                .await
            {
                tracing::debug!(count = cached.len(), "Enriched campaigns served from cache");
                return Ok(cached);
            }
        }

        let campaigns = pipeline.run().await?;
        let ttl = self.ttl_for(campaigns.iter().any(|c| c.degraded));
        self.cache.set(CAMPAIGNS_CACHE_KEY, &campaigns, ttl).await;

        Ok(campaigns)
    }

    /// One campaign, enriched. `Ok(None)` when the platform does not list it.
    pub async fn get_enriched_entity_by_id(
        &self,
        id: &str,
        force_refresh: bool,
    ) -> Result<Option<EnrichedCampaign>, AppError> {
        let pipeline = self.pipeline()?;
        let key = campaign_cache_key(id);

        if !force_refresh {
            if let Some(cached) = self.cache.get::<EnrichedCampaign>(&key).await {
                tracing::debug!(campaign_id = id, "Enriched campaign served from cache");
                return Ok(Some(cached));
            }
            if let Some(listed) = self
                .cache
                .get::<Vec<EnrichedCampaign>>(CAMPAIGNS_CACHE_KEY)
                .await
            {
                if let Some(campaign) = listed.into_iter().find(|c| c.id == id) {
                    return Ok(Some(campaign));
                }
            }
        }

        let Some(summary) = pipeline.list().await?.into_iter().find(|s| s.id == id) else {
            tracing::debug!(campaign_id = id, "Campaign not listed by platform");
            return Ok(None);
        };

        let campaign = pipeline.enrich_one(&summary).await;
        self.cache
            .set(&key, &campaign, self.ttl_for(campaign.degraded))
            .await;

        Ok(Some(campaign))
    }

    /// Drops every cached read.
    pub async fn invalidate_cache(&self) {
        self.cache.clear().await;
    }
}
