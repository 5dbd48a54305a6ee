//! Notification decisions and webhook delivery.
//!
//! Whether to send is decided by the pure functions here; delivery goes
//! through the [`Notifier`] seam so runs can be tested without a network.

use async_trait::async_trait;
use basket_core::{JobDetails, JobId, NotificationPreference};
use basket_storage::{FetchError, HttpFetcher};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::info;

pub const COLOR_SUCCESS: u32 = 3_066_993;
pub const COLOR_FAILURE: u32 = 15_158_332;

/// Longest log excerpt embedded in a job report, in characters.
pub const LOG_EXCERPT_LIMIT: usize = 3800;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("webhook delivery failed: {0}")]
    Delivery(#[from] FetchError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobReport {
    pub title: String,
    pub description: String,
    pub color: u32,
    pub log: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PriceDropAlert {
    pub item_name: String,
    pub url: String,
    pub current_price: Decimal,
    pub previous_price: Decimal,
    pub price_change: Decimal,
    pub price_change_percent: Decimal,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_job_report(&self, webhook_url: &str, report: &JobReport) -> Result<(), NotifyError>;

    async fn send_price_drop(&self, webhook_url: &str, alert: &PriceDropAlert) -> Result<(), NotifyError>;
}

/// Preference check for a single-user manual job.
pub fn manual_job_should_notify(
    webhook_url: Option<&str>,
    preference: NotificationPreference,
    job_failed: bool,
) -> bool {
    if webhook_url.map_or(true, str::is_empty) {
        return false;
    }
    match preference {
        NotificationPreference::Off => false,
        NotificationPreference::Always => true,
        NotificationPreference::ErrorsOnly => job_failed,
    }
}

/// Automated runs always report when a webhook exists; user-triggered runs
/// respect that user's preference.
pub fn scheduled_job_should_notify(
    automated: bool,
    webhook_url: Option<&str>,
    preference: NotificationPreference,
    has_errors: bool,
) -> bool {
    if webhook_url.map_or(true, str::is_empty) {
        return false;
    }
    automated || manual_job_should_notify(webhook_url, preference, has_errors)
}

pub fn manual_job_report(job_id: JobId, failed: bool, log: &[String]) -> JobReport {
    let (title, description, color) = if failed {
        (
            format!("Manual Ingestion Job Failed (ID: {job_id})"),
            "Your manually triggered ingestion job has failed.",
            COLOR_FAILURE,
        )
    } else {
        (
            format!("Manual Ingestion Job Completed (ID: {job_id})"),
            "Your manually triggered ingestion job has finished successfully.",
            COLOR_SUCCESS,
        )
    };
    JobReport {
        title,
        description: description.to_string(),
        color,
        log: log.to_vec(),
    }
}

pub fn scheduled_job_report(automated: bool, has_errors: bool, details: &JobDetails) -> JobReport {
    let mut log = Vec::new();
    if let Some(err) = &details.error {
        log.push(format!("CRITICAL JOB ERROR: {err}\n"));
    }
    for user in &details.users {
        log.push(format!(
            "--- User: {} | Status: {} ---",
            user.username,
            user.status.as_str().to_uppercase()
        ));
        if user.log.is_empty() {
            log.push("No log entries.".to_string());
        } else {
            log.extend(user.log.iter().cloned());
        }
        if user.status == basket_core::JobStatus::Failed {
            log.push(format!(
                "ERROR: {}",
                user.error.as_deref().unwrap_or("Unknown error")
            ));
        }
        log.push(String::new());
    }

    let base = if automated {
        "Automated Daily Ingestion Finished"
    } else {
        "Scheduled Ingestion Run Finished"
    };
    let (title, description, color) = if has_errors {
        (
            format!("{base} with Errors"),
            "The scheduled data ingestion process ran, but one or more users failed.",
            COLOR_FAILURE,
        )
    } else {
        (
            format!("{base} Successfully"),
            "The scheduled data ingestion process completed for all users.",
            COLOR_SUCCESS,
        )
    };
    JobReport {
        title,
        description: description.to_string(),
        color,
        log,
    }
}

/// Joins log lines and cuts them to [`LOG_EXCERPT_LIMIT`] characters.
pub fn log_excerpt(lines: &[String]) -> String {
    let joined = lines.join("\n");
    if joined.chars().count() <= LOG_EXCERPT_LIMIT {
        return joined;
    }
    let mut cut: String = joined.chars().take(LOG_EXCERPT_LIMIT).collect();
    cut.push_str("\n... (log truncated)");
    cut
}

pub fn job_report_payload(report: &JobReport, generated_at: DateTime<Utc>) -> JsonValue {
    let description = format!(
        "{}\n\n**Verbose Log:**\n```\n{}\n```",
        report.description,
        log_excerpt(&report.log)
    );
    json!({
        "embeds": [{
            "title": report.title,
            "description": description,
            "color": report.color,
            "footer": {
                "text": format!("Report generated at {}", generated_at.format("%Y-%m-%d %H:%M:%S UTC")),
            },
        }]
    })
}

pub fn price_drop_payload(alert: &PriceDropAlert) -> JsonValue {
    json!({
        "embeds": [{
            "title": format!("Price Drop: {}", alert.item_name),
            "url": alert.url,
            "color": COLOR_SUCCESS,
            "fields": [
                {"name": "Current Price", "value": format!("${:.2}", alert.current_price), "inline": true},
                {"name": "Previous Price", "value": format!("${:.2}", alert.previous_price), "inline": true},
                {"name": "Change", "value": format!("{:.2} ({:.2}%)", alert.price_change, alert.price_change_percent), "inline": true},
            ],
        }],
        "item_name": alert.item_name,
        "url": alert.url,
        "current_price": alert.current_price,
        "previous_price": alert.previous_price,
        "price_change": alert.price_change,
        "price_change_percent": alert.price_change_percent,
    })
}

/// Posts JSON payloads to user-configured webhooks.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    http: HttpFetcher,
}

impl WebhookNotifier {
    pub fn new(http: HttpFetcher) -> Self {
        Self { http }
    }
}

fn webhook_prefix(url: &str) -> String {
    url.chars().take(30).collect()
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send_job_report(&self, webhook_url: &str, report: &JobReport) -> Result<(), NotifyError> {
        info!(webhook = %webhook_prefix(webhook_url), title = %report.title, "sending job notification");
        let payload = job_report_payload(report, Utc::now());
        self.http.post_json(webhook_url, &payload).await?;
        Ok(())
    }

    async fn send_price_drop(&self, webhook_url: &str, alert: &PriceDropAlert) -> Result<(), NotifyError> {
        info!(webhook = %webhook_prefix(webhook_url), item = %alert.item_name, "sending price drop notification");
        self.http
            .post_json(webhook_url, &price_drop_payload(alert))
            .await?;
        Ok(())
    }
}
