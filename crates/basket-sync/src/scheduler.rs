use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::config::ServiceConfig;
use crate::jobs::{JobRunner, ScheduledTrigger};
use crate::price::PriceWatchEngine;

/// Daily automated ingestion plus the hourly price cycle. `None` when the
/// scheduler is disabled.
pub async fn maybe_build_scheduler(
    config: &ServiceConfig,
    runner: Arc<JobRunner>,
    prices: Arc<PriceWatchEngine>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;

    let ingest = Job::new_async(config.ingest_cron.as_str(), move |_uuid, _l| {
        let runner = Arc::clone(&runner);
        Box::pin(async move {
            info!("scheduled ingestion triggered");
            let today = Utc::now().date_naive();
            match runner
                .start_scheduled(ScheduledTrigger::Automated, today, None)
                .await
            {
                Ok(report) => info!(job_id = report.job_id, status = %report.status, "scheduled ingestion done"),
                Err(err) => error!(error = %err, "scheduled ingestion could not start"),
            }
        })
    })
    .with_context(|| format!("creating ingestion job for cron {}", config.ingest_cron))?;
    sched.add(ingest).await.context("adding ingestion job")?;

    let price = Job::new_async(config.price_cron.as_str(), move |_uuid, _l| {
        let prices = Arc::clone(&prices);
        Box::pin(async move {
            if let Err(err) = prices.update_all_prices(Utc::now()).await {
                error!(error = %err, "price check cycle failed");
            }
        })
    })
    .with_context(|| format!("creating price job for cron {}", config.price_cron))?;
    sched.add(price).await.context("adding price job")?;

    Ok(Some(sched))
}
