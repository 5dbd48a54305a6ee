//! Price watch: scrape tracked product pages, compact history, and alert on
//! drops that clear the item's threshold.

use std::sync::Arc;

use async_trait::async_trait;
use basket_adapters::parse_product_page;
use basket_core::{
    extract_product_id, NotificationThreshold, PriceHistoryEntry, PriceQuote, ThresholdKind,
    TrackedItem, TrackedItemId, UserId, UNKNOWN_PRODUCT,
};
use basket_storage::{
    HttpFetcher, NewTrackedItem, PriceCheckWrite, PriceStore, SettingsStore, StoreError,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};

use crate::notify::{Notifier, PriceDropAlert};

#[derive(Debug, Error)]
pub enum PriceError {
    #[error("This item is already being tracked (id {0}).")]
    Duplicate(TrackedItemId),
    #[error("tracked item {0} not found")]
    NotFound(TrackedItemId),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Fetches one product page. Any failure comes back as an empty quote.
#[async_trait]
pub trait PriceProbe: Send + Sync {
    async fn probe(&self, url: &str) -> PriceQuote;
}

#[derive(Debug, Clone)]
pub struct HttpPriceProbe {
    http: HttpFetcher,
}

impl HttpPriceProbe {
    pub fn new(http: HttpFetcher) -> Self {
        Self { http }
    }
}

#[async_trait]
impl PriceProbe for HttpPriceProbe {
    async fn probe(&self, url: &str) -> PriceQuote {
        let page = match self.http.fetch_page(url).await {
            Ok(page) => page,
            Err(err) => {
                warn!(url, error = %err, "product page fetch failed");
                return PriceQuote::empty();
            }
        };
        match parse_product_page(&page.text()) {
            Ok(quote) => quote,
            Err(err) => {
                warn!(url, error = %err, "product page could not be parsed");
                PriceQuote::empty()
            }
        }
    }
}

/// At most one history row per item per day unless the price moves.
pub fn should_append_history(
    last: Option<&PriceHistoryEntry>,
    price: Decimal,
    now: DateTime<Utc>,
) -> bool {
    match last {
        None => true,
        Some(last) => last.price != price || last.recorded_at.date_naive() != now.date_naive(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriceDrop {
    /// Negative for a drop.
    pub change: Decimal,
    pub percent: Decimal,
}

/// A drop that meets or exceeds the threshold, compared by magnitude.
pub fn price_drop(
    previous: Decimal,
    current: Decimal,
    threshold: NotificationThreshold,
) -> Option<PriceDrop> {
    if current >= previous {
        return None;
    }
    let change = current - previous;
    let percent = change.checked_div(previous)? * Decimal::ONE_HUNDRED;
    let magnitude = match threshold.kind {
        ThresholdKind::Percent => percent.abs(),
        ThresholdKind::Absolute => change.abs(),
    };
    (magnitude >= threshold.value).then_some(PriceDrop { change, percent })
}

/// Name to write after a check; `None` keeps whatever is stored.
pub fn refreshed_name(item: &TrackedItem, scraped_title: Option<&str>) -> Option<String> {
    if item.is_custom_name {
        return None;
    }
    let scraped = scraped_title
        .map(str::trim)
        .filter(|t| !t.is_empty() && *t != UNKNOWN_PRODUCT);
    Some(
        scraped
            .or(item.name.as_deref())
            .unwrap_or(UNKNOWN_PRODUCT)
            .to_string(),
    )
}

/// Last recorded price of each calendar day, oldest day first.
pub fn daily_history(entries: &[PriceHistoryEntry]) -> Vec<PriceHistoryEntry> {
    let mut sorted = entries.to_vec();
    sorted.sort_by_key(|e| e.recorded_at);
    let mut daily: Vec<PriceHistoryEntry> = Vec::new();
    for entry in sorted {
        match daily.last_mut() {
            Some(last) if last.recorded_at.date_naive() == entry.recorded_at.date_naive() => {
                *last = entry;
            }
            _ => daily.push(entry),
        }
    }
    daily
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemCheck {
    /// No price on the page; only `last_checked` moved.
    Unavailable,
    Priced {
        price: Decimal,
        history_appended: bool,
        notified: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CycleSummary {
    pub checked: usize,
    pub priced: usize,
    pub unavailable: usize,
    pub history_appended: usize,
    pub notified: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrackedItemDetail {
    pub item: TrackedItem,
    pub history: Vec<PriceHistoryEntry>,
}

pub struct PriceWatchEngine {
    store: Arc<dyn PriceStore>,
    settings: Arc<dyn SettingsStore>,
    probe: Arc<dyn PriceProbe>,
    notifier: Arc<dyn Notifier>,
}

impl PriceWatchEngine {
    pub fn new(
        store: Arc<dyn PriceStore>,
        settings: Arc<dyn SettingsStore>,
        probe: Arc<dyn PriceProbe>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            settings,
            probe,
            notifier,
        }
    }

    /// Checks every tracked item in turn. A failing item is logged and skipped.
    pub async fn update_all_prices(&self, now: DateTime<Utc>) -> Result<CycleSummary, PriceError> {
        let items = self.store.list_tracked_items().await?;
        info!(items = items.len(), "starting price check cycle");

        let mut summary = CycleSummary::default();
        for item in &items {
            summary.checked += 1;
            let span = info_span!("price_check", item_id = item.id);
            match self.check_item(item, now).instrument(span).await {
                Ok(ItemCheck::Unavailable) => summary.unavailable += 1,
                Ok(ItemCheck::Priced {
                    history_appended,
                    notified,
                    ..
                }) => {
                    summary.priced += 1;
                    summary.history_appended += usize::from(history_appended);
                    summary.notified += usize::from(notified);
                }
                Err(err) => {
                    summary.failed += 1;
                    error!(item_id = item.id, error = %err, "price check failed");
                }
            }
        }
        info!(?summary, "price check cycle finished");
        Ok(summary)
    }

    pub async fn check_item(
        &self,
        item: &TrackedItem,
        now: DateTime<Utc>,
    ) -> Result<ItemCheck, PriceError> {
        let quote = self.probe.probe(&item.url).await;
        let Some(price) = quote.price else {
            warn!(url = %item.url, "no price found; touching last_checked only");
            self.store.touch_last_checked(item.id, now).await?;
            return Ok(ItemCheck::Unavailable);
        };

        let last = self.store.latest_price(item.id).await?;
        let append_history = should_append_history(last.as_ref(), price, now);
        let name = refreshed_name(item, quote.title.as_deref());
        self.store
            .record_price_check(
                item.id,
                &PriceCheckWrite {
                    price,
                    name: name.clone(),
                    append_history,
                    checked_at: now,
                },
            )
            .await?;

        let drop = match (last, item.threshold) {
            (Some(last), Some(threshold)) => price_drop(last.price, price, threshold)
                .map(|drop| (last.price, drop)),
            _ => None,
        };
        let mut notified = false;
        if let Some((previous, drop)) = drop {
            let alert = PriceDropAlert {
                item_name: name
                    .or_else(|| item.name.clone())
                    .unwrap_or_else(|| UNKNOWN_PRODUCT.to_string()),
                url: item.url.clone(),
                current_price: price,
                previous_price: previous,
                price_change: drop.change,
                price_change_percent: drop.percent.round_dp(2),
            };
            notified = self.send_drop_alert(item.user_id, &alert).await;
        }

        Ok(ItemCheck::Priced {
            price,
            history_appended: append_history,
            notified,
        })
    }

    async fn send_drop_alert(&self, user_id: UserId, alert: &PriceDropAlert) -> bool {
        let webhook = match self.settings.get_settings(user_id).await {
            Ok(settings) => settings
                .and_then(|s| s.price_webhook_url)
                .filter(|url| !url.is_empty()),
            Err(err) => {
                error!(%user_id, error = %err, "could not load price webhook");
                return false;
            }
        };
        let Some(url) = webhook else {
            info!(%user_id, "price dropped but no price webhook is configured");
            return false;
        };
        match self.notifier.send_price_drop(&url, alert).await {
            Ok(()) => true,
            Err(err) => {
                error!(%user_id, error = %err, "price drop notification failed");
                false
            }
        }
    }

    /// On-demand single fetch, nothing stored.
    pub async fn check_price(&self, url: &str) -> PriceQuote {
        self.probe.probe(url).await
    }

    /// Starts tracking a product page. The threshold falls back to the user's
    /// default when none is given.
    pub async fn add_tracked_item(
        &self,
        user_id: UserId,
        url: &str,
        custom_name: Option<&str>,
        threshold: Option<NotificationThreshold>,
        now: DateTime<Utc>,
    ) -> Result<TrackedItem, PriceError> {
        let product_id = extract_product_id(url);
        if let Some(existing) = self
            .store
            .find_tracked_item(user_id, product_id.as_deref(), url)
            .await?
        {
            return Err(PriceError::Duplicate(existing));
        }

        let quote = self.probe.probe(url).await;
        let threshold = match threshold {
            Some(t) => Some(t),
            None => self
                .settings
                .get_settings(user_id)
                .await?
                .and_then(|s| s.default_threshold),
        };
        let item = self
            .store
            .insert_tracked_item(&NewTrackedItem {
                user_id,
                url: url.to_string(),
                product_id,
                name: Some(quote.title.unwrap_or_else(|| UNKNOWN_PRODUCT.to_string())),
                current_price: quote.price,
                currency: quote.currency,
                threshold,
                checked_at: now,
            })
            .await?;
        info!(item_id = item.id, %user_id, "tracking new item");

        match custom_name.map(str::trim).filter(|n| !n.is_empty()) {
            Some(name) => self.rename(user_id, item.id, name).await,
            None => Ok(item),
        }
    }

    pub async fn list(&self, user_id: UserId) -> Result<Vec<TrackedItem>, PriceError> {
        Ok(self.store.tracked_items_for_user(user_id).await?)
    }

    pub async fn detail(
        &self,
        user_id: UserId,
        id: TrackedItemId,
    ) -> Result<TrackedItemDetail, PriceError> {
        let item = self
            .store
            .get_tracked_item(user_id, id)
            .await?
            .ok_or(PriceError::NotFound(id))?;
        let history = daily_history(&self.store.price_history(id).await?);
        Ok(TrackedItemDetail { item, history })
    }

    pub async fn rename(
        &self,
        user_id: UserId,
        id: TrackedItemId,
        name: &str,
    ) -> Result<TrackedItem, PriceError> {
        self.store
            .rename_tracked_item(user_id, id, name)
            .await?
            .ok_or(PriceError::NotFound(id))
    }

    pub async fn set_threshold(
        &self,
        user_id: UserId,
        id: TrackedItemId,
        threshold: Option<NotificationThreshold>,
    ) -> Result<TrackedItem, PriceError> {
        self.store
            .set_threshold(user_id, id, threshold)
            .await?
            .ok_or(PriceError::NotFound(id))
    }

    pub async fn delete(&self, user_id: UserId, id: TrackedItemId) -> Result<(), PriceError> {
        if self.store.delete_tracked_item(user_id, id).await? {
            Ok(())
        } else {
            Err(PriceError::NotFound(id))
        }
    }
}
