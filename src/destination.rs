//! Collaborator seams consumed by the engine.

use async_trait::async_trait;
use serde_json::Value;

use crate::errors::AppError;
use crate::models::{CampaignSummary, SendResponse, SubResource};

/// Where work items are pushed.
///
/// `send` returns `Ok` for any HTTP answer, including 4xx/5xx; classification
/// is the dispatcher's job. `Err` is reserved for transport failures.
#[async_trait]
pub trait Destination: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, payload: &Value) -> Result<SendResponse, AppError>;
}

/// Where campaign lists and per-campaign analytics are read from.
#[async_trait]
pub trait AnalyticsSource: Send + Sync {
    async fn list_entities(&self) -> Result<Vec<CampaignSummary>, AppError>;

    async fn fetch_sub_resource(&self, entity_id: &str) -> Result<SubResource, AppError>;
}
