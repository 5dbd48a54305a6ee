//! Bounded concurrent fetch of order details with per-order retries.

use std::sync::Arc;

use basket_adapters::OrderSource;
use basket_core::SourceOrder;
use basket_storage::BackoffPolicy;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info_span, warn, Instrument};

#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Fetched(SourceOrder),
    /// Every attempt failed; the order is skipped for this run.
    Exhausted { order_number: String },
    /// The worker task itself died.
    Aborted(String),
}

/// Tries `get_order` up to `retry.attempts()` times, sleeping between tries.
pub async fn fetch_with_retries(
    session: &dyn OrderSource,
    order_number: &str,
    retry: BackoffPolicy,
) -> Option<SourceOrder> {
    let attempts = retry.attempts();
    for attempt in 0..attempts {
        match session.get_order(order_number).await {
            Ok(order) => return Some(order),
            Err(err) => {
                warn!(order_number, attempt = attempt + 1, error = %err, "order fetch attempt failed");
                if attempt + 1 < attempts {
                    tokio::time::sleep(retry.delay_for_attempt(attempt)).await;
                }
            }
        }
    }
    error!(order_number, "all retries failed for order");
    None
}

/// All fetches are submitted up front; at most `workers` run at once and
/// results come back in completion order.
pub struct FetchPool {
    tasks: JoinSet<FetchOutcome>,
    total: usize,
}

impl FetchPool {
    pub fn spawn(
        session: Arc<dyn OrderSource>,
        order_numbers: Vec<String>,
        workers: usize,
        retry: BackoffPolicy,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(workers.max(1)));
        let total = order_numbers.len();
        let mut tasks = JoinSet::new();

        for order_number in order_numbers {
            let session = Arc::clone(&session);
            let permits = Arc::clone(&permits);
            let span = info_span!("order_fetch", order_number = %order_number);
            tasks.spawn(
                async move {
                    let Ok(_permit) = permits.acquire_owned().await else {
                        return FetchOutcome::Exhausted { order_number };
                    };
                    match fetch_with_retries(session.as_ref(), &order_number, retry).await {
                        Some(order) => FetchOutcome::Fetched(order),
                        None => FetchOutcome::Exhausted { order_number },
                    }
                }
                .instrument(span),
            );
        }

        Self { tasks, total }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    /// Next finished fetch, or `None` once every task has been consumed.
    pub async fn next(&mut self) -> Option<FetchOutcome> {
        match self.tasks.join_next().await? {
            Ok(outcome) => Some(outcome),
            Err(err) => {
                error!(error = %err, "order fetch task aborted");
                Some(FetchOutcome::Aborted(err.to_string()))
            }
        }
    }
}
