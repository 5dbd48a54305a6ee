//! Order-source capability contracts, the fixture-backed source, and the
//! product-page extractor used by the price watch.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use basket_core::{SourceOrder, SourceTransaction};
use thiserror::Error;

mod fixture;
mod product_page;

pub use fixture::{
    load_order_fixture, FixtureConnector, FixtureSource, FixtureTransaction, OrderFixture,
};
pub use product_page::{is_block_page_title, parse_price_text, parse_product_page};

pub const CRATE_NAME: &str = "basket-adapters";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("login failed: {0}")]
    Login(String),
    #[error("session is not logged in")]
    NotLoggedIn,
    #[error("order {0} not found")]
    OrderNotFound(String),
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error("page parse failed: {0}")]
    Parse(String),
    #[error(transparent)]
    Fixture(#[from] anyhow::Error),
}

/// Decrypted login material for one run. Never logged.
#[derive(Clone, PartialEq, Eq)]
pub struct SourceCredentials {
    pub email: String,
    pub password: String,
    pub otp_secret: Option<String>,
}

impl fmt::Debug for SourceCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceCredentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .field("otp_secret", &self.otp_secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// One authenticated session against the order source.
///
/// Lifecycle is `login -> list_transactions/get_order -> logout`. Any error
/// from `get_order` is treated as retryable by callers.
#[async_trait]
pub trait OrderSource: Send + Sync {
    async fn login(&self) -> Result<(), SourceError>;

    async fn logout(&self) -> Result<(), SourceError>;

    /// Cheap listing of transactions placed in the last `days` days.
    async fn list_transactions(&self, days: i64) -> Result<Vec<SourceTransaction>, SourceError>;

    /// Expensive per-order detail fetch.
    async fn get_order(&self, order_number: &str) -> Result<SourceOrder, SourceError>;
}

/// Builds a fresh, isolated session per run so no state leaks between runs.
pub trait SourceConnector: Send + Sync {
    fn connect(&self, credentials: &SourceCredentials) -> Result<Arc<dyn OrderSource>, SourceError>;
}
