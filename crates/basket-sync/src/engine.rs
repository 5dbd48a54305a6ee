//! One ingestion run for one user.

use std::sync::Arc;

use basket_adapters::{OrderSource, SourceConnector, SourceError};
use basket_core::UserId;
use basket_storage::{OrderStore, StoreError};
use chrono::NaiveDate;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};

use crate::config::{IngestionConfig, WindowScope};
use crate::dedup::{candidate_order_numbers, filter_new_orders};
use crate::events::EventEmitter;
use crate::planner::{plan_window, WindowPlan};
use crate::pool::{FetchOutcome, FetchPool};
use crate::settings::{SettingsError, SettingsResolver};
use crate::writer::persist_order;

/// Failures that end a run. Per-order problems never show up here.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Configuration(#[from] SettingsError),
    #[error("Amazon login failed: {0}")]
    Authentication(#[source] SourceError),
    #[error("order source error: {0}")]
    Source(#[source] SourceError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestionRequest {
    pub user_id: UserId,
    pub days_override: Option<i64>,
    pub today: NaiveDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    UpToDate,
    NoTransactions,
    NothingNew,
    Processed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub window: WindowPlan,
    pub outcome: RunOutcome,
    pub listed: usize,
    pub new_orders: usize,
    pub persisted: usize,
    pub skipped_empty: usize,
    pub fetch_failures: usize,
    pub write_failures: usize,
}

impl RunSummary {
    fn new(window: WindowPlan, outcome: RunOutcome) -> Self {
        Self {
            window,
            outcome,
            listed: 0,
            new_orders: 0,
            persisted: 0,
            skipped_empty: 0,
            fetch_failures: 0,
            write_failures: 0,
        }
    }
}

pub struct IngestionEngine {
    orders: Arc<dyn OrderStore>,
    settings: SettingsResolver,
    connector: Arc<dyn SourceConnector>,
    config: IngestionConfig,
}

impl IngestionEngine {
    pub fn new(
        orders: Arc<dyn OrderStore>,
        settings: SettingsResolver,
        connector: Arc<dyn SourceConnector>,
        config: IngestionConfig,
    ) -> Self {
        Self {
            orders,
            settings,
            connector,
            config,
        }
    }

    pub fn config(&self) -> &IngestionConfig {
        &self.config
    }

    /// Runs to completion, emitting events as it goes.
    ///
    /// Setup failures (settings, planning, login, listing) are emitted as an
    /// `error` event, the session is logged out if it was opened, and the
    /// error is returned. Failures of single orders are logged and skipped.
    pub async fn run(
        &self,
        request: IngestionRequest,
        events: &EventEmitter,
    ) -> Result<RunSummary, IngestError> {
        let span = info_span!("ingestion_run", user_id = %request.user_id);
        async {
            let mut session: Option<Arc<dyn OrderSource>> = None;
            match self.run_inner(request, events, &mut session).await {
                Ok(summary) => Ok(summary),
                Err(err) => {
                    events.error(err.to_string());
                    if let Some(session) = session {
                        if let Err(logout_err) = session.logout().await {
                            warn!(error = %logout_err, "logout after failed run also failed");
                        }
                    }
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn run_inner(
        &self,
        request: IngestionRequest,
        events: &EventEmitter,
        session_slot: &mut Option<Arc<dyn OrderSource>>,
    ) -> Result<RunSummary, IngestError> {
        let credentials = self.settings.resolve_credentials(request.user_id).await?;

        let latest = if request.days_override.is_some() {
            None
        } else {
            let scope = match self.config.window_scope {
                WindowScope::User => Some(request.user_id),
                WindowScope::Global => None,
            };
            self.orders.latest_order_date(scope).await?
        };
        let window = plan_window(
            request.days_override,
            latest,
            request.today,
            self.config.default_window_days,
        );
        events.status(window.describe());

        if window.is_up_to_date() {
            events.status("All orders are up to date.");
            return Ok(RunSummary::new(window, RunOutcome::UpToDate));
        }

        events.status(format!("Logging into Amazon as {}...", credentials.email));
        let session = self
            .connector
            .connect(&credentials)
            .map_err(IngestError::Source)?;
        session.login().await.map_err(IngestError::Authentication)?;
        *session_slot = Some(Arc::clone(&session));
        events.status("Amazon login successful.");

        events.status(format!(
            "Fetching transactions for the last {} days...",
            window.days
        ));
        let transactions = session
            .list_transactions(window.days)
            .await
            .map_err(IngestError::Source)?;
        let candidates = candidate_order_numbers(&transactions);

        if candidates.is_empty() {
            events.status("No new orders found in the specified date range.");
            logout(session.as_ref()).await;
            return Ok(RunSummary::new(window, RunOutcome::NoTransactions));
        }

        let new_orders = filter_new_orders(self.orders.as_ref(), request.user_id, &candidates).await?;
        let mut summary = RunSummary::new(window, RunOutcome::Processed);
        summary.listed = candidates.len();
        summary.new_orders = new_orders.len();

        if new_orders.is_empty() {
            events.status(format!(
                "All {} orders in this date range are already stored.",
                candidates.len()
            ));
            logout(session.as_ref()).await;
            summary.outcome = RunOutcome::NothingNew;
            return Ok(summary);
        }

        let total = new_orders.len() as u64;
        events.progress(0, total);
        events.status(format!("Found {total} unique orders to process..."));

        let mut pool = FetchPool::spawn(
            Arc::clone(&session),
            new_orders,
            self.config.workers,
            self.config.fetch_retry,
        );
        let mut processed = 0u64;
        while let Some(outcome) = pool.next().await {
            processed += 1;
            events.progress(processed, total);

            let order = match outcome {
                FetchOutcome::Fetched(order) => order,
                FetchOutcome::Exhausted { .. } | FetchOutcome::Aborted(_) => {
                    summary.fetch_failures += 1;
                    continue;
                }
            };
            if order.items.is_empty() {
                summary.skipped_empty += 1;
                continue;
            }

            match persist_order(self.orders.as_ref(), request.user_id, &order).await {
                Ok(write) => {
                    summary.persisted += 1;
                    info!(order_number = %order.order_number, ?write, "order stored");
                }
                Err(err) => {
                    summary.write_failures += 1;
                    events.error(format!(
                        "Failed to process order {} in DB: {err}",
                        order.order_number
                    ));
                }
            }
        }

        events.status("Successfully processed all fetched orders.");
        logout(session.as_ref()).await;
        *session_slot = None;
        events.status("Ingestion process completed.");
        events.done("Import complete.");

        info!(
            persisted = summary.persisted,
            fetch_failures = summary.fetch_failures,
            write_failures = summary.write_failures,
            "ingestion run finished"
        );
        Ok(summary)
    }
}

async fn logout(session: &dyn OrderSource) {
    if let Err(err) = session.logout().await {
        warn!(error = %err, "source logout failed");
    }
}
