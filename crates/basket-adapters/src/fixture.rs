//! Fixture-backed order source for offline runs, demos, and tests.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use basket_core::{SourceOrder, SourceTransaction};
use chrono::{Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{OrderSource, SourceConnector, SourceCredentials, SourceError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixtureTransaction {
    pub order_number: Option<String>,
    pub placed_date: NaiveDate,
}

/// On-disk fixture layout.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OrderFixture {
    /// When set, `login` rejects any other password.
    #[serde(default)]
    pub password: Option<String>,
    /// Reference date for the transaction window; defaults to today (UTC).
    #[serde(default)]
    pub as_of: Option<NaiveDate>,
    #[serde(default)]
    pub transactions: Vec<FixtureTransaction>,
    #[serde(default)]
    pub orders: Vec<SourceOrder>,
    /// Orders whose detail fetch always fails.
    #[serde(default)]
    pub failing_orders: Vec<String>,
    /// Orders whose detail fetch fails the given number of times before succeeding.
    #[serde(default)]
    pub flaky_orders: BTreeMap<String, u32>,
}

pub fn load_order_fixture(path: impl AsRef<Path>) -> Result<OrderFixture> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

#[derive(Debug)]
pub struct FixtureSource {
    fixture: OrderFixture,
    password: String,
    logged_in: AtomicBool,
    attempts: Mutex<BTreeMap<String, u32>>,
}

impl FixtureSource {
    pub fn new(fixture: OrderFixture, credentials: &SourceCredentials) -> Self {
        Self {
            fixture,
            password: credentials.password.clone(),
            logged_in: AtomicBool::new(false),
            attempts: Mutex::new(BTreeMap::new()),
        }
    }

    /// Detail fetch attempts made so far for `order_number`.
    pub async fn attempts_for(&self, order_number: &str) -> u32 {
        self.attempts
            .lock()
            .await
            .get(order_number)
            .copied()
            .unwrap_or(0)
    }

    pub async fn total_attempts(&self) -> u32 {
        self.attempts.lock().await.values().sum()
    }

    pub fn is_logged_in(&self) -> bool {
        self.logged_in.load(Ordering::SeqCst)
    }

    fn ensure_logged_in(&self) -> Result<(), SourceError> {
        if self.is_logged_in() {
            Ok(())
        } else {
            Err(SourceError::NotLoggedIn)
        }
    }
}

#[async_trait]
impl OrderSource for FixtureSource {
    async fn login(&self) -> Result<(), SourceError> {
        if let Some(expected) = &self.fixture.password {
            if expected != &self.password {
                return Err(SourceError::Login("invalid credentials".to_string()));
            }
        }
        self.logged_in.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn logout(&self) -> Result<(), SourceError> {
        self.logged_in.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn list_transactions(&self, days: i64) -> Result<Vec<SourceTransaction>, SourceError> {
        self.ensure_logged_in()?;
        let as_of = self.fixture.as_of.unwrap_or_else(|| Utc::now().date_naive());
        let earliest = as_of - Duration::days(days);
        let rows: Vec<SourceTransaction> = self
            .fixture
            .transactions
            .iter()
            .filter(|t| t.placed_date >= earliest && t.placed_date <= as_of)
            .map(|t| SourceTransaction {
                order_number: t.order_number.clone(),
            })
            .collect();
        debug!(days, count = rows.len(), "fixture transactions listed");
        Ok(rows)
    }

    async fn get_order(&self, order_number: &str) -> Result<SourceOrder, SourceError> {
        self.ensure_logged_in()?;
        let attempt = {
            let mut attempts = self.attempts.lock().await;
            let counter = attempts.entry(order_number.to_string()).or_insert(0);
            *counter += 1;
            *counter
        };

        if self.fixture.failing_orders.iter().any(|n| n == order_number) {
            return Err(SourceError::Fetch(format!(
                "order {order_number} detail unavailable"
            )));
        }
        if let Some(failures) = self.fixture.flaky_orders.get(order_number) {
            if attempt <= *failures {
                return Err(SourceError::Fetch(format!(
                    "transient failure {attempt} for order {order_number}"
                )));
            }
        }

        self.fixture
            .orders
            .iter()
            .find(|o| o.order_number == order_number)
            .cloned()
            .ok_or_else(|| SourceError::OrderNotFound(order_number.to_string()))
    }
}

/// Reloads the fixture file on every `connect`, so each run gets a fresh session.
#[derive(Debug, Clone)]
pub struct FixtureConnector {
    path: PathBuf,
}

impl FixtureConnector {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SourceConnector for FixtureConnector {
    fn connect(&self, credentials: &SourceCredentials) -> Result<Arc<dyn OrderSource>, SourceError> {
        let fixture = load_order_fixture(&self.path)?;
        info!(path = %self.path.display(), orders = fixture.orders.len(), "fixture order source loaded");
        Ok(Arc::new(FixtureSource::new(fixture, credentials)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use basket_core::SourceOrderItem;
    use rust_decimal_macros::dec;

    fn creds(password: &str) -> SourceCredentials {
        SourceCredentials {
            email: "sam@example.com".into(),
            password: password.into(),
            otp_secret: None,
        }
    }

    fn fixture() -> OrderFixture {
        let as_of = NaiveDate::from_ymd_opt(2024, 6, 10).unwrap();
        OrderFixture {
            password: Some("secret".into()),
            as_of: Some(as_of),
            transactions: vec![
                FixtureTransaction {
                    order_number: Some("A".into()),
                    placed_date: as_of - Duration::days(1),
                },
                FixtureTransaction {
                    order_number: Some("B".into()),
                    placed_date: as_of - Duration::days(20),
                },
            ],
            orders: vec![SourceOrder {
                order_number: "A".into(),
                placed_date: as_of - Duration::days(1),
                grand_total: Some(dec!(12.00)),
                subscription_discount: None,
                recipient: None,
                items: vec![SourceOrderItem {
                    title: "Tea".into(),
                    link: Some("/dp/B000000TEA".into()),
                    image_link: None,
                    quantity: None,
                    price: Some(dec!(12.00)),
                    is_subscribe_and_save: false,
                }],
            }],
            failing_orders: vec![],
            flaky_orders: BTreeMap::from([("A".to_string(), 1)]),
        }
    }

    #[tokio::test]
    async fn login_checks_password_when_fixture_pins_one() {
        let source = FixtureSource::new(fixture(), &creds("wrong"));
        assert!(matches!(source.login().await, Err(SourceError::Login(_))));
        assert!(!source.is_logged_in());
    }

    #[tokio::test]
    async fn listing_respects_window_and_requires_login() {
        let source = FixtureSource::new(fixture(), &creds("secret"));
        assert!(matches!(
            source.list_transactions(3).await,
            Err(SourceError::NotLoggedIn)
        ));
        source.login().await.unwrap();
        assert_eq!(source.list_transactions(3).await.unwrap().len(), 1);
        assert_eq!(source.list_transactions(30).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn flaky_orders_recover_after_configured_failures() {
        let source = FixtureSource::new(fixture(), &creds("secret"));
        source.login().await.unwrap();
        assert!(source.get_order("A").await.is_err());
        assert_eq!(source.get_order("A").await.unwrap().items.len(), 1);
        assert_eq!(source.attempts_for("A").await, 2);
        assert!(matches!(
            source.get_order("B").await,
            Err(SourceError::OrderNotFound(_))
        ));
    }
}
