//! Relational store seam + outbound HTTP utilities for the order ledger.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use basket_core::{
    IngestionJob, Item, JobDetails, JobId, JobProgress, JobStatus, JobType, NotificationThreshold,
    Order, PriceHistoryEntry, SettingsPatch, TrackedItem, TrackedItemId, UserId, UserRef,
    UserSettings,
};
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE};
use reqwest::StatusCode;
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "basket-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("json payload error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid stored value: {0}")]
    Decode(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("write rejected: {0}")]
    Rejected(String),
}

/// Outcome of persisting one fetched order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OrderWrite {
    pub order_inserted: bool,
    pub items_inserted: usize,
    pub items_refreshed: usize,
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Latest placement date, for one user or across all users.
    async fn latest_order_date(&self, user_id: Option<UserId>)
        -> Result<Option<NaiveDate>, StoreError>;

    /// Subset of `candidates` already stored for `user_id`.
    async fn existing_order_numbers(
        &self,
        user_id: UserId,
        candidates: &[String],
    ) -> Result<HashSet<String>, StoreError>;

    /// Insert-if-absent for the order, upsert for its items; one transaction per call.
    async fn save_order(&self, order: &Order, items: &[Item]) -> Result<OrderWrite, StoreError>;

    async fn count_orders(&self, user_id: UserId) -> Result<u64, StoreError>;

    async fn items_for_order(
        &self,
        user_id: UserId,
        order_number: &str,
    ) -> Result<Vec<Item>, StoreError>;
}

/// Partial job mutation. Terminal statuses are a latch: once `completed` or
/// `failed`, a later status is ignored. `updated_at` is bumped on every call.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub progress: Option<JobProgress>,
    pub details: Option<JobDetails>,
}

impl JobUpdate {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn progress(progress: JobProgress) -> Self {
        Self {
            progress: Some(progress),
            ..Self::default()
        }
    }

    pub fn details(details: JobDetails) -> Self {
        Self {
            details: Some(details),
            ..Self::default()
        }
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_progress(mut self, progress: JobProgress) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_details(mut self, details: JobDetails) -> Self {
        self.details = Some(details);
        self
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_job(
        &self,
        job_type: JobType,
        user_id: Option<UserId>,
        details: &JobDetails,
    ) -> Result<JobId, StoreError>;

    /// Creates a pending manual job unless the user already has one pending or
    /// running. Returns `None` when the guard rejects the insert.
    async fn try_create_manual_job(
        &self,
        user_id: UserId,
        details: &JobDetails,
    ) -> Result<Option<JobId>, StoreError>;

    async fn update_job(&self, id: JobId, update: &JobUpdate) -> Result<(), StoreError>;

    async fn get_job(&self, id: JobId) -> Result<Option<IngestionJob>, StoreError>;

    async fn latest_job(
        &self,
        job_type: JobType,
        user_id: Option<UserId>,
    ) -> Result<Option<IngestionJob>, StoreError>;

    /// One-way latch; returns false when no job matched.
    async fn mark_notification_seen(&self, id: JobId, user_id: UserId) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn get_settings(&self, user_id: UserId) -> Result<Option<UserSettings>, StoreError>;

    async fn save_settings(&self, user_id: UserId, patch: &SettingsPatch) -> Result<(), StoreError>;

    async fn scheduled_users(&self) -> Result<Vec<UserRef>, StoreError>;

    /// Oldest admin account; its settings drive global job notifications.
    async fn admin_user(&self) -> Result<Option<UserId>, StoreError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewTrackedItem {
    pub user_id: UserId,
    pub url: String,
    pub product_id: Option<String>,
    pub name: Option<String>,
    pub current_price: Option<Decimal>,
    pub currency: Option<String>,
    pub threshold: Option<NotificationThreshold>,
    pub checked_at: DateTime<Utc>,
}

/// Write set of one successful price check.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceCheckWrite {
    pub price: Decimal,
    /// `None` keeps the stored name.
    pub name: Option<String>,
    pub append_history: bool,
    pub checked_at: DateTime<Utc>,
}

#[async_trait]
pub trait PriceStore: Send + Sync {
    async fn list_tracked_items(&self) -> Result<Vec<TrackedItem>, StoreError>;

    async fn tracked_items_for_user(&self, user_id: UserId) -> Result<Vec<TrackedItem>, StoreError>;

    async fn get_tracked_item(
        &self,
        user_id: UserId,
        id: TrackedItemId,
    ) -> Result<Option<TrackedItem>, StoreError>;

    /// Matches by product id when known, otherwise by URL.
    async fn find_tracked_item(
        &self,
        user_id: UserId,
        product_id: Option<&str>,
        url: &str,
    ) -> Result<Option<TrackedItemId>, StoreError>;

    /// Inserts the item and, when a price is known, its first history row.
    async fn insert_tracked_item(&self, item: &NewTrackedItem) -> Result<TrackedItem, StoreError>;

    async fn latest_price(&self, id: TrackedItemId) -> Result<Option<PriceHistoryEntry>, StoreError>;

    async fn record_price_check(
        &self,
        id: TrackedItemId,
        write: &PriceCheckWrite,
    ) -> Result<(), StoreError>;

    async fn touch_last_checked(
        &self,
        id: TrackedItemId,
        checked_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Sets a user-chosen name and flips `is_custom_name`.
    async fn rename_tracked_item(
        &self,
        user_id: UserId,
        id: TrackedItemId,
        name: &str,
    ) -> Result<Option<TrackedItem>, StoreError>;

    async fn set_threshold(
        &self,
        user_id: UserId,
        id: TrackedItemId,
        threshold: Option<NotificationThreshold>,
    ) -> Result<Option<TrackedItem>, StoreError>;

    async fn delete_tracked_item(&self, user_id: UserId, id: TrackedItemId)
        -> Result<bool, StoreError>;

    /// Full history, oldest first.
    async fn price_history(&self, id: TrackedItemId) -> Result<Vec<PriceHistoryEntry>, StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// Constant delay between `attempts` total tries.
    pub fn fixed(attempts: usize, delay: Duration) -> Self {
        Self {
            max_retries: attempts.saturating_sub(1),
            base_delay: delay,
            max_delay: delay,
        }
    }

    pub fn attempts(&self) -> usize {
        self.max_retries + 1
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Shared outbound client for product pages and webhook posts.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));
        headers.insert(
            ACCEPT,
            HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            ),
        );

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .default_headers(headers)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn fetch_page(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0;
        loop {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(%status, attempt, "retrying page fetch");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(error = %err, attempt, "retrying page fetch");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }

    /// Single-shot JSON POST; non-2xx responses are errors.
    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
    ) -> Result<(), FetchError> {
        let resp = self.client.post(url).json(body).send().await?;
        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            })
        }
    }
}
