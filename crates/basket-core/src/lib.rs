//! Core domain model for the order ledger and the price watch.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "basket-core";

/// Origin used to absolutise relative product links returned by the order source.
pub const SOURCE_ORIGIN: &str = "https://www.amazon.com";

pub const UNKNOWN_PRODUCT: &str = "Unknown Product";

pub type UserId = Uuid;
pub type JobId = i64;
pub type TrackedItemId = i64;

/// Row of the cheap transaction listing; only the order number matters to ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceTransaction {
    pub order_number: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRecipient {
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceOrderItem {
    pub title: String,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub image_link: Option<String>,
    #[serde(default)]
    pub quantity: Option<i32>,
    #[serde(default)]
    pub price: Option<Decimal>,
    #[serde(default)]
    pub is_subscribe_and_save: bool,
}

/// Full order detail as returned by the (expensive) per-order fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceOrder {
    pub order_number: String,
    pub placed_date: NaiveDate,
    #[serde(default)]
    pub grand_total: Option<Decimal>,
    #[serde(default)]
    pub subscription_discount: Option<Decimal>,
    #[serde(default)]
    pub recipient: Option<SourceRecipient>,
    #[serde(default)]
    pub items: Vec<SourceOrderItem>,
}

/// Persisted order row. Inserted once, never updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub order_number: String,
    pub user_id: UserId,
    pub placed_date: NaiveDate,
    pub grand_total: Option<Decimal>,
    pub subscription_discount: Option<Decimal>,
    pub recipient_name: Option<String>,
}

/// Persisted line item, unique on (order_number, title, unit_price).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub order_number: String,
    pub product_id: Option<String>,
    pub title: String,
    pub link: Option<String>,
    pub thumbnail_url: Option<String>,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub is_subscribe_and_save: bool,
}

impl Item {
    pub fn key(&self) -> (String, String, Decimal) {
        (self.order_number.clone(), self.title.clone(), self.unit_price)
    }
}

/// Extracts the 10-character product identifier from `/dp/<id>` or `/gp/product/<id>` links.
pub fn extract_product_id(url: &str) -> Option<String> {
    for marker in ["/dp/", "/gp/product/"] {
        let mut rest = url;
        while let Some(pos) = rest.find(marker) {
            let tail = &rest[pos + marker.len()..];
            let candidate: String = tail
                .chars()
                .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
                .take(10)
                .collect();
            if candidate.chars().count() == 10 {
                return Some(candidate);
            }
            rest = tail;
        }
    }
    None
}

pub fn absolute_source_link(link: &str) -> String {
    if link.starts_with("http://") || link.starts_with("https://") {
        link.to_string()
    } else {
        format!("{SOURCE_ORIGIN}{link}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Manual,
    Scheduled,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Scheduled => "scheduled",
        }
    }
}

impl FromStr for JobType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Self::Manual),
            "scheduled" => Ok(Self::Scheduled),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Lifecycle: `pending -> running -> {completed, failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown variant `{0}`")]
pub struct UnknownVariant(pub String);

/// Progress payload; manual runs count orders, scheduled runs count users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobProgress {
    Orders { value: u64, max: u64 },
    Users { current: u64, total: u64 },
}

impl Default for JobProgress {
    fn default() -> Self {
        Self::Orders { value: 0, max: 100 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRunDetails {
    pub user_id: UserId,
    pub status: JobStatus,
    pub username: String,
    #[serde(default)]
    pub log: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Free-form job payload stored as JSON next to the job row.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct JobDetails {
    #[serde(default)]
    pub log: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
    /// Per-user breakdown of scheduled runs, in processing order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub users: Vec<UserRunDetails>,
}

impl JobDetails {
    pub fn with_log(line: impl Into<String>) -> Self {
        Self {
            log: vec![line.into()],
            ..Self::default()
        }
    }

    pub fn user(&self, user_id: UserId) -> Option<&UserRunDetails> {
        self.users.iter().find(|u| u.user_id == user_id)
    }

    pub fn user_mut(&mut self, user_id: UserId) -> Option<&mut UserRunDetails> {
        self.users.iter_mut().find(|u| u.user_id == user_id)
    }

    pub fn any_user_failed(&self) -> bool {
        self.users.iter().any(|u| u.status == JobStatus::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionJob {
    pub id: JobId,
    pub job_type: JobType,
    pub user_id: Option<UserId>,
    pub status: JobStatus,
    pub progress: Option<JobProgress>,
    pub details: JobDetails,
    pub notification_seen: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Flat snapshot served to polling clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusView {
    pub id: JobId,
    pub status: JobStatus,
    pub progress: JobProgress,
    pub log: Vec<String>,
    pub error: Option<String>,
    pub show_notification: bool,
    pub notification_seen: bool,
}

impl From<&IngestionJob> for JobStatusView {
    fn from(job: &IngestionJob) -> Self {
        Self {
            id: job.id,
            status: job.status,
            progress: job.progress.unwrap_or_default(),
            log: job.details.log.clone(),
            error: job.details.error.clone(),
            show_notification: job.status == JobStatus::Completed && !job.notification_seen,
            notification_seen: job.notification_seen,
        }
    }
}

/// Typed event emitted by an ingestion run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "lowercase")]
pub enum JobEvent {
    Status(String),
    Progress { value: u64, max: u64 },
    Error(String),
    Done(String),
}

impl JobEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Status(_) => "status",
            Self::Progress { .. } => "progress",
            Self::Error(_) => "error",
            Self::Done(_) => "done",
        }
    }

    /// `kind: payload` line used in per-user logs of scheduled runs. Progress has none.
    pub fn log_line(&self) -> Option<String> {
        match self {
            Self::Status(msg) | Self::Error(msg) | Self::Done(msg) => {
                Some(format!("{}: {msg}", self.kind()))
            }
            Self::Progress { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdKind {
    Percent,
    Absolute,
}

impl ThresholdKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Percent => "percent",
            Self::Absolute => "absolute",
        }
    }
}

impl FromStr for ThresholdKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "percent" => Ok(Self::Percent),
            "absolute" => Ok(Self::Absolute),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Minimum price drop required before a price alert is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationThreshold {
    pub kind: ThresholdKind,
    pub value: Decimal,
}

impl NotificationThreshold {
    pub fn percent(value: Decimal) -> Self {
        Self {
            kind: ThresholdKind::Percent,
            value,
        }
    }

    pub fn absolute(value: Decimal) -> Self {
        Self {
            kind: ThresholdKind::Absolute,
            value,
        }
    }

    /// Rebuilds a threshold from its two nullable storage columns.
    pub fn from_columns(kind: Option<&str>, value: Option<Decimal>) -> Option<Self> {
        let kind = kind?.parse().ok()?;
        Some(Self {
            kind,
            value: value?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedItem {
    pub id: TrackedItemId,
    pub user_id: UserId,
    pub url: String,
    pub product_id: Option<String>,
    pub name: Option<String>,
    pub is_custom_name: bool,
    pub current_price: Option<Decimal>,
    pub currency: Option<String>,
    pub last_checked: Option<DateTime<Utc>>,
    pub threshold: Option<NotificationThreshold>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceHistoryEntry {
    pub price: Decimal,
    pub recorded_at: DateTime<Utc>,
}

/// Result of scraping one product page.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PriceQuote {
    pub price: Option<Decimal>,
    pub title: Option<String>,
    pub currency: Option<String>,
}

impl PriceQuote {
    /// Blocked, failed, or unparseable fetch: nothing usable.
    pub fn empty() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationPreference {
    #[default]
    Off,
    Always,
    ErrorsOnly,
}

impl NotificationPreference {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Always => "always",
            Self::ErrorsOnly => "errors_only",
        }
    }
}

impl FromStr for NotificationPreference {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" => Ok(Self::Off),
            "always" => Ok(Self::Always),
            "errors_only" => Ok(Self::ErrorsOnly),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Stored per-user settings; the source password stays encrypted at rest.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UserSettings {
    pub user_id: UserId,
    pub source_email: Option<String>,
    pub source_password_encrypted: Option<Vec<u8>>,
    pub source_otp_secret: Option<String>,
    pub enable_scheduled_ingestion: bool,
    pub job_webhook_url: Option<String>,
    pub job_notification_preference: NotificationPreference,
    pub price_webhook_url: Option<String>,
    pub default_threshold: Option<NotificationThreshold>,
}

/// Partial settings update: only `Some` fields overwrite stored values.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SettingsPatch {
    pub source_email: Option<String>,
    pub source_password_encrypted: Option<Vec<u8>>,
    pub source_otp_secret: Option<String>,
    pub enable_scheduled_ingestion: Option<bool>,
    pub job_webhook_url: Option<String>,
    pub job_notification_preference: Option<NotificationPreference>,
    pub price_webhook_url: Option<String>,
    pub default_threshold: Option<NotificationThreshold>,
}

impl SettingsPatch {
    pub fn apply_to(&self, settings: &mut UserSettings) {
        if let Some(v) = &self.source_email {
            settings.source_email = Some(v.clone());
        }
        if let Some(v) = &self.source_password_encrypted {
            settings.source_password_encrypted = Some(v.clone());
        }
        if let Some(v) = &self.source_otp_secret {
            settings.source_otp_secret = Some(v.clone());
        }
        if let Some(v) = self.enable_scheduled_ingestion {
            settings.enable_scheduled_ingestion = v;
        }
        if let Some(v) = &self.job_webhook_url {
            settings.job_webhook_url = Some(v.clone());
        }
        if let Some(v) = self.job_notification_preference {
            settings.job_notification_preference = v;
        }
        if let Some(v) = &self.price_webhook_url {
            settings.price_webhook_url = Some(v.clone());
        }
        if let Some(v) = self.default_threshold {
            settings.default_threshold = Some(v);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRef {
    pub id: UserId,
    pub username: String,
}
