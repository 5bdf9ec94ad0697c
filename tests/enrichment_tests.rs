/// Read-path tests against a scripted analytics source
/// Covers degradation, caching, forced refresh and bounded enrichment concurrency
use async_trait::async_trait;
use rust_lead_dispatch::audit::TracingOutcomeRecorder;
use rust_lead_dispatch::cache::{CacheManager, CacheSettings, DurableStore, MemoryStore};
use rust_lead_dispatch::config::DestinationConfig;
use rust_lead_dispatch::destination::{AnalyticsSource, Destination};
use rust_lead_dispatch::engine::Engine;
use rust_lead_dispatch::enrichment::{EnrichmentPipeline, EnrichmentSettings};
use rust_lead_dispatch::errors::AppError;
use rust_lead_dispatch::models::{
    CampaignStatus, CampaignSummary, EnrichedCampaign, EnrichmentState, MetricSet, SendResponse,
    SubResource, WorkItem,
};
use rust_lead_dispatch::rate_limit::RateLimitState;
use rust_lead_dispatch::retry::RetryPolicy;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct ScriptedSource {
    campaigns: Vec<CampaignSummary>,
    failing: HashSet<String>,
    fail_list: bool,
    delay: Duration,
    list_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedSource {
    fn new(ids: &[&str]) -> Self {
        Self {
            campaigns: ids.iter().map(|id| summary(id)).collect(),
            failing: HashSet::new(),
            fail_list: false,
            delay: Duration::ZERO,
            list_calls: AtomicUsize::new(0),
            fetch_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    fn failing(mut self, id: &str) -> Self {
        self.failing.insert(id.to_string());
        self
    }

    fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AnalyticsSource for ScriptedSource {
    async fn list_entities(&self) -> Result<Vec<CampaignSummary>, AppError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_list {
            return Err(AppError::from_status(401, "invalid api key"));
        }
        Ok(self.campaigns.clone())
    }

    async fn fetch_sub_resource(&self, entity_id: &str) -> Result<SubResource, AppError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.failing.contains(entity_id) {
            return Err(AppError::from_status(503, "analytics unavailable"));
        }

        Ok(SubResource {
            analytics: MetricSet {
                total_leads: Some(100),
                contacted: Some(40),
                emails_sent: Some(200),
                opened: Some(50),
                clicked: Some(10),
                replied: Some(4),
                bounced: Some(6),
                unsubscribed: Some(2),
            },
            overview: None,
        })
    }
}

fn summary(id: &str) -> CampaignSummary {
    CampaignSummary {
        id: id.to_string(),
        name: Some(format!("Campaign {}", id)),
        status: CampaignStatus::Active,
        metrics: MetricSet::default(),
        ..CampaignSummary::default()
    }
}

fn settings(batch_size: usize) -> EnrichmentSettings {
    EnrichmentSettings {
        batch_size,
        batch_delay: Duration::from_millis(1),
        retry: RetryPolicy::new(2, Duration::from_millis(1))
            .with_rate_limit_cooldown(Duration::from_millis(1)),
    }
}

fn platform() -> DestinationConfig {
    let mut config = DestinationConfig::new("scripted", "https://api.example.com", Some("key".into()));
    config.base_delay_ms = 1;
    config.rate_limit_cooldown_ms = 1;
    config
}

fn engine_with(source: Arc<ScriptedSource>) -> Engine {
    Engine::new(
        Arc::new(CacheManager::in_memory()),
        Arc::new(TracingOutcomeRecorder),
    )
    .with_analytics(&platform(), source, settings(3))
}

#[tokio::test]
async fn test_failed_sub_resource_degrades_single_entity() {
    let source = Arc::new(ScriptedSource::new(&["c1", "c2", "c3"]).failing("c2"));
    let engine = engine_with(source.clone());

    let campaigns = engine.get_enriched_entities(false).await.unwrap();

    assert_eq!(campaigns.len(), 3);
    let ids: Vec<_> = campaigns.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec!["c1", "c2", "c3"]);

    let degraded = &campaigns[1];
    assert!(degraded.degraded);
    assert_eq!(degraded.emails_sent, 0);
    assert_eq!(degraded.open_rate, 0);
    assert_eq!(degraded.name, "Campaign c2");

    for healthy in [&campaigns[0], &campaigns[2]] {
        assert!(!healthy.degraded);
        assert_eq!(healthy.open_rate, 25);
        assert_eq!(healthy.click_rate, 5);
        assert_eq!(healthy.leads_ready, 100 - 40 - 6 - 2);
        assert_eq!(healthy.state, EnrichmentState::Transformed);
    }

    // read-path policy: two attempts for the failing campaign
    assert_eq!(source.fetch_calls(), 4);
}

#[tokio::test]
async fn test_second_read_is_served_from_cache() {
    let source = Arc::new(ScriptedSource::new(&["c1", "c2"]));
    let engine = engine_with(source.clone());

    let first = engine.get_enriched_entities(false).await.unwrap();
    let second = engine.get_enriched_entities(false).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(source.list_calls(), 1);
    assert_eq!(source.fetch_calls(), 2);
}

#[tokio::test]
async fn test_force_refresh_bypasses_cache() {
    let source = Arc::new(ScriptedSource::new(&["c1"]));
    let engine = engine_with(source.clone());

    engine.get_enriched_entities(false).await.unwrap();
    engine.get_enriched_entities(true).await.unwrap();

    assert_eq!(source.list_calls(), 2);
}

#[tokio::test]
async fn test_invalidate_cache_forces_refetch() {
    let source = Arc::new(ScriptedSource::new(&["c1"]));
    let engine = engine_with(source.clone());

    engine.get_enriched_entities(false).await.unwrap();
    engine.invalidate_cache().await;
    engine.get_enriched_entities(false).await.unwrap();

    assert_eq!(source.list_calls(), 2);
}

#[tokio::test]
async fn test_degraded_results_use_shorter_ttl() {
    let source = Arc::new(ScriptedSource::new(&["c1"]).failing("c1"));
    let engine = engine_with(source.clone())
        .with_cache_ttls(Duration::from_secs(300), Duration::from_millis(50));

    let first = engine.get_enriched_entities(false).await.unwrap();
    assert!(first[0].degraded);

    tokio::time::sleep(Duration::from_millis(100)).await;
    engine.get_enriched_entities(false).await.unwrap();

    assert_eq!(source.list_calls(), 2);
}

#[tokio::test]
async fn test_entity_by_id() {
    let source = Arc::new(ScriptedSource::new(&["c1", "c2"]));
    let engine = engine_with(source.clone());

    let found = engine.get_enriched_entity_by_id("c2", false).await.unwrap();
    assert_eq!(found.map(|c| c.id), Some("c2".to_string()));

    let missing = engine.get_enriched_entity_by_id("c9", false).await.unwrap();
    assert!(missing.is_none());

    // cached after the first lookup
    let fetches = source.fetch_calls();
    engine.get_enriched_entity_by_id("c2", false).await.unwrap();
    assert_eq!(source.fetch_calls(), fetches);
}

#[tokio::test]
async fn test_entity_by_id_uses_cached_list() {
    let source = Arc::new(ScriptedSource::new(&["c1", "c2"]));
    let engine = engine_with(source.clone());

    engine.get_enriched_entities(false).await.unwrap();
    let found = engine.get_enriched_entity_by_id("c1", false).await.unwrap();

    assert!(found.is_some());
    assert_eq!(source.list_calls(), 1);
}

#[tokio::test]
async fn test_blank_id_becomes_fallback() {
    let mut source = ScriptedSource::new(&["c1"]);
    source.campaigns.push(summary(" "));
    let source = Arc::new(source);
    let engine = engine_with(source.clone());

    let campaigns = engine.get_enriched_entities(false).await.unwrap();

    assert_eq!(campaigns.len(), 2);
    assert_eq!(campaigns[1].state, EnrichmentState::Fallback);
    assert!(campaigns[1].degraded);
    assert_eq!(source.fetch_calls(), 1);
}

#[tokio::test]
async fn test_list_failure_is_an_error() {
    let mut source = ScriptedSource::new(&["c1"]);
    source.fail_list = true;
    let source = Arc::new(source);
    let engine = engine_with(source.clone());

    let err = engine.get_enriched_entities(false).await.unwrap_err();

    assert_eq!(err.status_code(), Some(401));
    assert_eq!(source.list_calls(), 1);
}

#[tokio::test]
async fn test_read_path_requires_analytics_source() {
    let engine = Engine::new(
        Arc::new(CacheManager::in_memory()),
        Arc::new(TracingOutcomeRecorder),
    );

    let err = engine.get_enriched_entities(false).await.unwrap_err();
    assert!(matches!(err, AppError::Configuration(_)));
}

#[tokio::test]
async fn test_enrichment_concurrency_bounded_by_batch_size() {
    let mut source = ScriptedSource::new(&["c1", "c2", "c3", "c4", "c5", "c6", "c7"]);
    source.delay = Duration::from_millis(20);
    let source = Arc::new(source);
    let pipeline = EnrichmentPipeline::new(source.clone(), settings(2));

    let campaigns = pipeline.run().await.unwrap();

    assert_eq!(campaigns.len(), 7);
    assert_eq!(source.max_in_flight.load(Ordering::SeqCst), 2);
}

/// One platform serving both directions, counting every call in flight.
struct SharedPlatform {
    source: ScriptedSource,
}

#[async_trait]
impl Destination for SharedPlatform {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn send(&self, payload: &Value) -> Result<SendResponse, AppError> {
        let now = self.source.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.source.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.source.delay).await;
        self.source.in_flight.fetch_sub(1, Ordering::SeqCst);

        Ok(SendResponse {
            ok: true,
            status: 200,
            body: payload.clone(),
            rate_limit: None,
        })
    }
}

#[async_trait]
impl AnalyticsSource for SharedPlatform {
    async fn list_entities(&self) -> Result<Vec<CampaignSummary>, AppError> {
        self.source.list_entities().await
    }

    async fn fetch_sub_resource(&self, entity_id: &str) -> Result<SubResource, AppError> {
        self.source.fetch_sub_resource(entity_id).await
    }
}

#[tokio::test]
async fn test_reads_and_writes_share_destination_limit() {
    let mut source = ScriptedSource::new(&["c1", "c2", "c3", "c4"]);
    source.delay = Duration::from_millis(30);
    let shared = Arc::new(SharedPlatform { source });

    let mut config = platform();
    config.concurrency = 2;
    let engine = Engine::new(
        Arc::new(CacheManager::in_memory()),
        Arc::new(TracingOutcomeRecorder),
    )
    .with_analytics(&config, shared.clone(), settings(4));

    let items: Vec<WorkItem> = (0..4)
        .map(|i| WorkItem::new(format!("lead{}@example.com", i), json!({"n": i})))
        .collect();

    let (written, read) = tokio::join!(
        engine.dispatch_batch_to(items, &config, shared.clone()),
        engine.get_enriched_entities(true),
    );

    assert_eq!(written.unwrap().summary.success_count, 4);
    assert_eq!(read.unwrap().len(), 4);
    assert_eq!(shared.source.max_in_flight.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_read_path_waits_for_exhausted_rate_limit() {
    let source = Arc::new(ScriptedSource::new(&["c1"]));
    let engine = engine_with(source.clone());
    engine
        .rate_limit_tracker("scripted")
        .update(RateLimitState {
            remaining: 0,
            reset_at: chrono::Utc::now() + chrono::Duration::milliseconds(300),
            limit: 10,
        });

    let started = Instant::now();
    let campaigns = engine.get_enriched_entities(true).await.unwrap();

    assert_eq!(campaigns.len(), 1);
    assert!(started.elapsed() >= Duration::from_millis(250));
}

#[tokio::test]
async fn test_cached_campaigns_survive_restart() {
    let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
    let source = Arc::new(ScriptedSource::new(&["c1"]));

    let first = Engine::new(
        Arc::new(CacheManager::new(store.clone(), CacheSettings::default())),
        Arc::new(TracingOutcomeRecorder),
    )
    .with_analytics(&platform(), source.clone(), settings(3));
    let before: Vec<EnrichedCampaign> = first.get_enriched_entities(false).await.unwrap();

    let cache = Arc::new(CacheManager::new(store, CacheSettings::default()));
    assert_eq!(cache.rehydrate().await, 1);
    let restarted = Engine::new(cache, Arc::new(TracingOutcomeRecorder))
        .with_analytics(&platform(), source.clone(), settings(3));

    let after = restarted.get_enriched_entities(false).await.unwrap();
    assert_eq!(before, after);
    assert_eq!(source.list_calls(), 1);
}
