use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::errors::AppError;
use crate::rate_limit::RateLimitState;

// ============================================================================
// Dispatch (write path)
// ============================================================================

/// One unit of outbound work: an opaque payload plus the key used to correlate results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub key: String,
    pub payload: Value,
}

impl WorkItem {
    pub fn new(key: impl Into<String>, payload: Value) -> Self {
        Self {
            key: key.into(),
            payload,
        }
    }
}

/// What a destination answered for one send.
#[derive(Debug, Clone, PartialEq)]
pub struct SendResponse {
    pub ok: bool,
    pub status: u16,
    pub body: Value,
    pub rate_limit: Option<RateLimitState>,
}

impl SendResponse {
    pub fn body_text(&self) -> String {
        match &self.body {
            Value::String(text) => text.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

/// Terminal per-item result of a batch dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchResult {
    pub key: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl DispatchResult {
    pub fn succeeded(key: impl Into<String>, response: SendResponse, attempts: u32) -> Self {
        Self {
            key: key.into(),
            success: true,
            status: Some(response.status),
            response: Some(response.body),
            error: None,
            attempts,
        }
    }

    pub fn failed(key: impl Into<String>, err: &AppError, attempts: u32) -> Self {
        Self {
            key: key.into(),
            success: false,
            response: None,
            error: Some(err.to_string()),
            attempts,
            status: err.status_code(),
        }
    }

    /// The task running this item died before producing a result.
    pub fn aborted(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            success: false,
            response: None,
            error: Some(reason.into()),
            attempts: 0,
            status: None,
        }
    }
}

// ============================================================================
// Campaign analytics (read path)
// ============================================================================

/// Canonical campaign status.
///
/// Vendor payloads carry either a numeric code or a lowercase label. Codes
/// outside the table are kept as `Unknown(code)` so they survive a cache round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CampaignStatus {
    Draft,
    Active,
    Paused,
    Completed,
    Stopped,
    Unknown(i64),
}

impl Default for CampaignStatus {
    fn default() -> Self {
        CampaignStatus::Unknown(-1)
    }
}

impl CampaignStatus {
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => CampaignStatus::Draft,
            1 => CampaignStatus::Active,
            2 => CampaignStatus::Paused,
            3 => CampaignStatus::Completed,
            4 => CampaignStatus::Stopped,
            other => CampaignStatus::Unknown(other),
        }
    }

    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "draft" => CampaignStatus::Draft,
            "active" | "running" => CampaignStatus::Active,
            "paused" => CampaignStatus::Paused,
            "completed" => CampaignStatus::Completed,
            "stopped" => CampaignStatus::Stopped,
            numeric => numeric
                .parse::<i64>()
                .map(Self::from_code)
                .unwrap_or_default(),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            CampaignStatus::Draft => "draft",
            CampaignStatus::Active => "active",
            CampaignStatus::Paused => "paused",
            CampaignStatus::Completed => "completed",
            CampaignStatus::Stopped => "stopped",
            CampaignStatus::Unknown(_) => "unknown",
        }
    }
}

impl Serialize for CampaignStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            CampaignStatus::Unknown(code) => serializer.serialize_i64(*code),
            known => serializer.serialize_str(known.label()),
        }
    }
}

impl<'de> Deserialize<'de> for CampaignStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Code(i64),
            Float(f64),
            Label(String),
        }

        // `null` is how some platforms say "not set yet".
        Ok(match Option::<Raw>::deserialize(deserializer)? {
            None => CampaignStatus::default(),
            Some(Raw::Code(code)) => CampaignStatus::from_code(code),
            Some(Raw::Float(code)) if code.fract() == 0.0 => CampaignStatus::from_code(code as i64),
            Some(Raw::Float(_)) => CampaignStatus::default(),
            Some(Raw::Label(label)) => CampaignStatus::from_label(&label),
        })
    }
}

/// Counters reported by a platform. Every field is optional because sources
/// report different subsets; merging picks the first non-null value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricSet {
    #[serde(default, alias = "leads_count", alias = "total")]
    pub total_leads: Option<i64>,
    #[serde(default, alias = "contacted_count")]
    pub contacted: Option<i64>,
    #[serde(default, alias = "emails_sent_count", alias = "sent")]
    pub emails_sent: Option<i64>,
    #[serde(default, alias = "open_count", alias = "opens")]
    pub opened: Option<i64>,
    #[serde(default, alias = "link_click_count", alias = "clicks")]
    pub clicked: Option<i64>,
    #[serde(default, alias = "reply_count", alias = "replies")]
    pub replied: Option<i64>,
    #[serde(default, alias = "bounced_count", alias = "bounces")]
    pub bounced: Option<i64>,
    #[serde(default, alias = "unsubscribed_count", alias = "unsubscribes")]
    pub unsubscribed: Option<i64>,
}

/// List-level view of a campaign.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CampaignSummary {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: CampaignStatus,
    #[serde(flatten)]
    pub metrics: MetricSet,
    /// Set when the listed record could not be read; such a summary only ever becomes a fallback.
    #[serde(skip)]
    pub unreadable: Option<String>,
}

impl CampaignSummary {
    /// Reads one listed record.
    ///
    /// A record that does not match the expected shape is kept, not dropped: its
    /// id, name and status are salvaged where possible (the id falls back to
    /// `unlisted-{index}`) and `unreadable` carries the reason.
    pub fn from_listed(raw: Value, index: usize) -> Self {
        match serde_json::from_value::<CampaignSummary>(raw.clone()) {
            Ok(summary) => summary,
            Err(e) => {
                let id = raw
                    .get("id")
                    .and_then(|id| string_or_number(id.clone()).ok())
                    .filter(|id| !id.trim().is_empty())
                    .unwrap_or_else(|| format!("unlisted-{}", index));
                let name = raw.get("name").and_then(Value::as_str).map(String::from);
                let status = raw
                    .get("status")
                    .and_then(|status| serde_json::from_value(status.clone()).ok())
                    .unwrap_or_default();

                CampaignSummary {
                    id,
                    name,
                    status,
                    metrics: MetricSet::default(),
                    unreadable: Some(e.to_string()),
                }
            }
        }
    }
}

/// Per-campaign sub-resources: the campaign's own analytics and, when the
/// platform offers one, an overview record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubResource {
    pub analytics: MetricSet,
    #[serde(default)]
    pub overview: Option<MetricSet>,
}

/// Where an entity ended up in the enrichment pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentState {
    Pending,
    Listed,
    SubResourceFetched { degraded: bool },
    Transformed,
    Fallback,
}

/// Dashboard-ready campaign record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedCampaign {
    pub id: String,
    pub name: String,
    pub status: CampaignStatus,
    pub total_leads: i64,
    pub contacted: i64,
    pub emails_sent: i64,
    pub opened: i64,
    pub clicked: i64,
    pub replied: i64,
    pub bounced: i64,
    pub unsubscribed: i64,
    pub leads_ready: i64,
    pub open_rate: u32,
    pub click_rate: u32,
    pub reply_rate: u32,
    pub bounce_rate: u32,
    /// A sub-resource fetch failed and the metrics above are zero-valued.
    pub degraded: bool,
    pub state: EnrichmentState,
}

impl EnrichedCampaign {
    /// Zero-valued stub for an entity that could not be built.
    pub fn fallback(summary: &CampaignSummary) -> Self {
        Self {
            id: summary.id.clone(),
            name: summary.name.clone().unwrap_or_else(|| summary.id.clone()),
            status: summary.status,
            total_leads: 0,
            contacted: 0,
            emails_sent: 0,
            opened: 0,
            clicked: 0,
            replied: 0,
            bounced: 0,
            unsubscribed: 0,
            leads_ready: 0,
            open_rate: 0,
            click_rate: 0,
            reply_rate: 0,
            bounce_rate: 0,
            degraded: true,
            state: EnrichmentState::Fallback,
        }
    }
}

/// Integer percentage `numerator / denominator`, rounded, clamped at zero.
///
/// A non-positive denominator yields 0.
pub fn percentage(numerator: i64, denominator: i64) -> u32 {
    if denominator <= 0 {
        return 0;
    }
    let ratio = numerator.max(0) as f64 * 100.0 / denominator as f64;
    ratio.round() as u32
}

/// `max(0, total - contacted - bounced - unsubscribed)`.
pub fn leads_ready(total: i64, contacted: i64, bounced: i64, unsubscribed: i64) -> i64 {
    total
        .saturating_sub(contacted)
        .saturating_sub(bounced)
        .saturating_sub(unsubscribed)
        .max(0)
}

fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(i64),
        Float(f64),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(text) => text,
        Raw::Number(number) => number.to_string(),
        Raw::Float(number) if number.fract() == 0.0 => (number as i64).to_string(),
        Raw::Float(number) => number.to_string(),
    })
}
