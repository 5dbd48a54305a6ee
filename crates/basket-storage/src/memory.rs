//! In-process store with the same semantics as [`crate::PgStore`]. Backs tests
//! and the fixture-driven CLI mode.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use basket_core::{
    IngestionJob, Item, JobDetails, JobId, JobStatus, JobType, NotificationThreshold, Order,
    PriceHistoryEntry, SettingsPatch, TrackedItem, TrackedItemId, UserId, UserRef, UserSettings,
};
use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::Mutex;

use crate::{
    JobStore, JobUpdate, NewTrackedItem, OrderStore, OrderWrite, PriceCheckWrite, PriceStore,
    SettingsStore, StoreError,
};

#[derive(Debug, Clone)]
struct UserRow {
    user: UserRef,
    admin: bool,
}

#[derive(Debug, Default)]
struct State {
    users: Vec<UserRow>,
    settings: HashMap<UserId, UserSettings>,
    orders: BTreeMap<(UserId, String), Order>,
    items: Vec<(UserId, Item)>,
    jobs: BTreeMap<JobId, IngestionJob>,
    next_job_id: JobId,
    tracked: BTreeMap<TrackedItemId, TrackedItem>,
    next_tracked_id: TrackedItemId,
    history: Vec<(TrackedItemId, PriceHistoryEntry)>,
    failing_orders: HashSet<String>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_user(&self, id: UserId, username: &str, admin: bool) {
        let mut state = self.state.lock().await;
        state.users.retain(|row| row.user.id != id);
        state.users.push(UserRow {
            user: UserRef {
                id,
                username: username.to_string(),
            },
            admin,
        });
    }

    /// Makes every later `save_order` for `order_number` fail, for exercising
    /// partial-failure paths.
    pub async fn fail_writes_for_order(&self, order_number: &str) {
        self.state
            .lock()
            .await
            .failing_orders
            .insert(order_number.to_string());
    }

    pub async fn job_count(&self) -> usize {
        self.state.lock().await.jobs.len()
    }
}

#[async_trait]
impl OrderStore for MemoryStore {
    async fn latest_order_date(
        &self,
        user_id: Option<UserId>,
    ) -> Result<Option<NaiveDate>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .orders
            .values()
            .filter(|o| user_id.map_or(true, |u| o.user_id == u))
            .map(|o| o.placed_date)
            .max())
    }

    async fn existing_order_numbers(
        &self,
        user_id: UserId,
        candidates: &[String],
    ) -> Result<HashSet<String>, StoreError> {
        let state = self.state.lock().await;
        Ok(candidates
            .iter()
            .filter(|n| state.orders.contains_key(&(user_id, (*n).clone())))
            .cloned()
            .collect())
    }

    async fn save_order(&self, order: &Order, items: &[Item]) -> Result<OrderWrite, StoreError> {
        let mut state = self.state.lock().await;
        if state.failing_orders.contains(&order.order_number) {
            return Err(StoreError::Rejected(format!(
                "order {} refused by store",
                order.order_number
            )));
        }

        let key = (order.user_id, order.order_number.clone());
        let order_inserted = !state.orders.contains_key(&key);
        if order_inserted {
            state.orders.insert(key, order.clone());
        }

        let mut write = OrderWrite {
            order_inserted,
            ..OrderWrite::default()
        };
        for item in items {
            let existing = state
                .items
                .iter_mut()
                .find(|(uid, stored)| *uid == order.user_id && stored.key() == item.key());
            match existing {
                Some((_, stored)) => {
                    stored.is_subscribe_and_save = item.is_subscribe_and_save;
                    stored.thumbnail_url = item.thumbnail_url.clone();
                    write.items_refreshed += 1;
                }
                None => {
                    state.items.push((order.user_id, item.clone()));
                    write.items_inserted += 1;
                }
            }
        }
        Ok(write)
    }

    async fn count_orders(&self, user_id: UserId) -> Result<u64, StoreError> {
        let state = self.state.lock().await;
        Ok(state.orders.keys().filter(|(u, _)| *u == user_id).count() as u64)
    }

    async fn items_for_order(
        &self,
        user_id: UserId,
        order_number: &str,
    ) -> Result<Vec<Item>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .items
            .iter()
            .filter(|(u, item)| *u == user_id && item.order_number == order_number)
            .map(|(_, item)| item.clone())
            .collect())
    }
}

fn insert_job(
    state: &mut State,
    job_type: JobType,
    user_id: Option<UserId>,
    details: &JobDetails,
) -> JobId {
    state.next_job_id += 1;
    let id = state.next_job_id;
    let now = Utc::now();
    state.jobs.insert(
        id,
        IngestionJob {
            id,
            job_type,
            user_id,
            status: JobStatus::Pending,
            progress: None,
            details: details.clone(),
            notification_seen: false,
            created_at: now,
            updated_at: now,
        },
    );
    id
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn create_job(
        &self,
        job_type: JobType,
        user_id: Option<UserId>,
        details: &JobDetails,
    ) -> Result<JobId, StoreError> {
        let mut state = self.state.lock().await;
        let id = insert_job(&mut state, job_type, user_id, details);
        Ok(id)
    }

    async fn try_create_manual_job(
        &self,
        user_id: UserId,
        details: &JobDetails,
    ) -> Result<Option<JobId>, StoreError> {
        let mut state = self.state.lock().await;
        let active = state.jobs.values().any(|job| {
            job.job_type == JobType::Manual
                && job.user_id == Some(user_id)
                && !job.status.is_terminal()
        });
        if active {
            return Ok(None);
        }
        Ok(Some(insert_job(&mut state, JobType::Manual, Some(user_id), details)))
    }

    async fn update_job(&self, id: JobId, update: &JobUpdate) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let job = state
            .jobs
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("ingestion job {id}")))?;

        if let Some(status) = update.status {
            if !job.status.is_terminal() {
                job.status = status;
            }
        }
        if let Some(progress) = update.progress {
            job.progress = Some(progress);
        }
        if let Some(details) = &update.details {
            job.details = details.clone();
        }
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn get_job(&self, id: JobId) -> Result<Option<IngestionJob>, StoreError> {
        Ok(self.state.lock().await.jobs.get(&id).cloned())
    }

    async fn latest_job(
        &self,
        job_type: JobType,
        user_id: Option<UserId>,
    ) -> Result<Option<IngestionJob>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .jobs
            .values()
            .rev()
            .find(|job| job.job_type == job_type && job.user_id == user_id)
            .cloned())
    }

    async fn mark_notification_seen(&self, id: JobId, user_id: UserId) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        match state.jobs.get_mut(&id) {
            Some(job) if job.user_id == Some(user_id) => {
                job.notification_seen = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl SettingsStore for MemoryStore {
    async fn get_settings(&self, user_id: UserId) -> Result<Option<UserSettings>, StoreError> {
        Ok(self.state.lock().await.settings.get(&user_id).cloned())
    }

    async fn save_settings(&self, user_id: UserId, patch: &SettingsPatch) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let settings = state.settings.entry(user_id).or_insert_with(|| UserSettings {
            user_id,
            ..UserSettings::default()
        });
        patch.apply_to(settings);
        Ok(())
    }

    async fn scheduled_users(&self) -> Result<Vec<UserRef>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .users
            .iter()
            .filter(|row| {
                state
                    .settings
                    .get(&row.user.id)
                    .is_some_and(|s| s.enable_scheduled_ingestion)
            })
            .map(|row| row.user.clone())
            .collect())
    }

    async fn admin_user(&self) -> Result<Option<UserId>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.users.iter().find(|row| row.admin).map(|row| row.user.id))
    }
}

#[async_trait]
impl PriceStore for MemoryStore {
    async fn list_tracked_items(&self) -> Result<Vec<TrackedItem>, StoreError> {
        Ok(self.state.lock().await.tracked.values().cloned().collect())
    }

    async fn tracked_items_for_user(&self, user_id: UserId) -> Result<Vec<TrackedItem>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .tracked
            .values()
            .rev()
            .filter(|item| item.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn get_tracked_item(
        &self,
        user_id: UserId,
        id: TrackedItemId,
    ) -> Result<Option<TrackedItem>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .tracked
            .get(&id)
            .filter(|item| item.user_id == user_id)
            .cloned())
    }

    async fn find_tracked_item(
        &self,
        user_id: UserId,
        product_id: Option<&str>,
        url: &str,
    ) -> Result<Option<TrackedItemId>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .tracked
            .values()
            .filter(|item| item.user_id == user_id)
            .find(|item| match product_id {
                Some(pid) => item.product_id.as_deref() == Some(pid),
                None => item.url == url,
            })
            .map(|item| item.id))
    }

    async fn insert_tracked_item(&self, item: &NewTrackedItem) -> Result<TrackedItem, StoreError> {
        let mut state = self.state.lock().await;
        state.next_tracked_id += 1;
        let id = state.next_tracked_id;
        let tracked = TrackedItem {
            id,
            user_id: item.user_id,
            url: item.url.clone(),
            product_id: item.product_id.clone(),
            name: item.name.clone(),
            is_custom_name: false,
            current_price: item.current_price,
            currency: item.currency.clone(),
            last_checked: Some(item.checked_at),
            threshold: item.threshold,
            created_at: item.checked_at,
        };
        state.tracked.insert(id, tracked.clone());
        if let Some(price) = item.current_price {
            state.history.push((
                id,
                PriceHistoryEntry {
                    price,
                    recorded_at: item.checked_at,
                },
            ));
        }
        Ok(tracked)
    }

    async fn latest_price(&self, id: TrackedItemId) -> Result<Option<PriceHistoryEntry>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .history
            .iter()
            .filter(|(tid, _)| *tid == id)
            .map(|(_, entry)| *entry)
            .max_by_key(|entry| entry.recorded_at))
    }

    async fn record_price_check(
        &self,
        id: TrackedItemId,
        write: &PriceCheckWrite,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let item = state
            .tracked
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("tracked item {id}")))?;
        item.current_price = Some(write.price);
        item.last_checked = Some(write.checked_at);
        if let Some(name) = &write.name {
            item.name = Some(name.clone());
        }
        if write.append_history {
            state.history.push((
                id,
                PriceHistoryEntry {
                    price: write.price,
                    recorded_at: write.checked_at,
                },
            ));
        }
        Ok(())
    }

    async fn touch_last_checked(
        &self,
        id: TrackedItemId,
        checked_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if let Some(item) = self.state.lock().await.tracked.get_mut(&id) {
            item.last_checked = Some(checked_at);
        }
        Ok(())
    }

    async fn rename_tracked_item(
        &self,
        user_id: UserId,
        id: TrackedItemId,
        name: &str,
    ) -> Result<Option<TrackedItem>, StoreError> {
        let mut state = self.state.lock().await;
        match state.tracked.get_mut(&id) {
            Some(item) if item.user_id == user_id => {
                item.name = Some(name.to_string());
                item.is_custom_name = true;
                Ok(Some(item.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn set_threshold(
        &self,
        user_id: UserId,
        id: TrackedItemId,
        threshold: Option<NotificationThreshold>,
    ) -> Result<Option<TrackedItem>, StoreError> {
        let mut state = self.state.lock().await;
        match state.tracked.get_mut(&id) {
            Some(item) if item.user_id == user_id => {
                item.threshold = threshold;
                Ok(Some(item.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn delete_tracked_item(
        &self,
        user_id: UserId,
        id: TrackedItemId,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let owned = state
            .tracked
            .get(&id)
            .is_some_and(|item| item.user_id == user_id);
        if !owned {
            return Ok(false);
        }
        state.tracked.remove(&id);
        state.history.retain(|(tid, _)| *tid != id);
        Ok(true)
    }

    async fn price_history(&self, id: TrackedItemId) -> Result<Vec<PriceHistoryEntry>, StoreError> {
        let state = self.state.lock().await;
        let mut entries: Vec<PriceHistoryEntry> = state
            .history
            .iter()
            .filter(|(tid, _)| *tid == id)
            .map(|(_, entry)| *entry)
            .collect();
        entries.sort_by_key(|entry| entry.recorded_at);
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use basket_core::JobProgress;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn order(user_id: UserId, number: &str, day: u32) -> Order {
        Order {
            order_number: number.to_string(),
            user_id,
            placed_date: NaiveDate::from_ymd_opt(2024, 3, day).unwrap(),
            grand_total: Some(dec!(19.99)),
            subscription_discount: None,
            recipient_name: Some("Jordan".into()),
        }
    }

    fn item(number: &str, title: &str, price: rust_decimal::Decimal) -> Item {
        Item {
            order_number: number.to_string(),
            product_id: None,
            title: title.to_string(),
            link: None,
            thumbnail_url: None,
            quantity: 1,
            unit_price: price,
            is_subscribe_and_save: false,
        }
    }

    #[tokio::test]
    async fn orders_insert_once_and_items_refresh() {
        let store = MemoryStore::new();
        let user = Uuid::new_v4();
        let o = order(user, "111-1", 4);

        let first = store
            .save_order(&o, &[item("111-1", "Kettle", dec!(25.00))])
            .await
            .unwrap();
        assert!(first.order_inserted);
        assert_eq!(first.items_inserted, 1);

        let mut refreshed = item("111-1", "Kettle", dec!(25.00));
        refreshed.is_subscribe_and_save = true;
        refreshed.thumbnail_url = Some("https://img.test/k.jpg".into());
        let second = store.save_order(&o, &[refreshed]).await.unwrap();
        assert!(!second.order_inserted);
        assert_eq!(second.items_refreshed, 1);

        let items = store.items_for_order(user, "111-1").await.unwrap();
        assert_eq!(items.len(), 1);
        assert!(items[0].is_subscribe_and_save);
        assert_eq!(store.count_orders(user).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn latest_order_date_scopes_by_user() {
        let store = MemoryStore::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        store.save_order(&order(a, "1", 2), &[]).await.unwrap();
        store.save_order(&order(b, "2", 9), &[]).await.unwrap();

        assert_eq!(
            store.latest_order_date(Some(a)).await.unwrap(),
            NaiveDate::from_ymd_opt(2024, 3, 2)
        );
        assert_eq!(
            store.latest_order_date(None).await.unwrap(),
            NaiveDate::from_ymd_opt(2024, 3, 9)
        );
    }

    #[tokio::test]
    async fn terminal_status_is_a_latch() {
        let store = MemoryStore::new();
        let id = store
            .create_job(JobType::Manual, None, &JobDetails::default())
            .await
            .unwrap();
        store
            .update_job(id, &JobUpdate::status(JobStatus::Failed))
            .await
            .unwrap();
        store
            .update_job(
                id,
                &JobUpdate::status(JobStatus::Completed)
                    .with_progress(JobProgress::Orders { value: 3, max: 3 }),
            )
            .await
            .unwrap();

        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.progress, Some(JobProgress::Orders { value: 3, max: 3 }));
    }

    #[tokio::test]
    async fn manual_job_guard_rejects_second_active_job() {
        let store = MemoryStore::new();
        let user = Uuid::new_v4();
        let first = store
            .try_create_manual_job(user, &JobDetails::default())
            .await
            .unwrap();
        assert!(first.is_some());
        assert_eq!(
            store
                .try_create_manual_job(user, &JobDetails::default())
                .await
                .unwrap(),
            None
        );

        store
            .update_job(first.unwrap(), &JobUpdate::status(JobStatus::Completed))
            .await
            .unwrap();
        assert!(store
            .try_create_manual_job(user, &JobDetails::default())
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn settings_patch_merges_and_feeds_scheduled_users() {
        let store = MemoryStore::new();
        let user = Uuid::new_v4();
        store.add_user(user, "casey", false).await;
        store
            .save_settings(
                user,
                &SettingsPatch {
                    source_email: Some("casey@example.com".into()),
                    ..SettingsPatch::default()
                },
            )
            .await
            .unwrap();
        assert!(store.scheduled_users().await.unwrap().is_empty());

        store
            .save_settings(
                user,
                &SettingsPatch {
                    enable_scheduled_ingestion: Some(true),
                    ..SettingsPatch::default()
                },
            )
            .await
            .unwrap();
        let settings = store.get_settings(user).await.unwrap().unwrap();
        assert_eq!(settings.source_email.as_deref(), Some("casey@example.com"));
        assert_eq!(store.scheduled_users().await.unwrap()[0].username, "casey");
    }

    #[tokio::test]
    async fn price_history_is_oldest_first_and_deleted_with_item() {
        let store = MemoryStore::new();
        let user = Uuid::new_v4();
        let t0 = Utc::now() - chrono::Duration::hours(3);
        let tracked = store
            .insert_tracked_item(&NewTrackedItem {
                user_id: user,
                url: "https://www.amazon.com/dp/B000000001".into(),
                product_id: Some("B000000001".into()),
                name: Some("Lamp".into()),
                current_price: Some(dec!(40)),
                currency: Some("$".into()),
                threshold: None,
                checked_at: t0,
            })
            .await
            .unwrap();
        store
            .record_price_check(
                tracked.id,
                &PriceCheckWrite {
                    price: dec!(35),
                    name: None,
                    append_history: true,
                    checked_at: t0 + chrono::Duration::hours(2),
                },
            )
            .await
            .unwrap();

        let history = store.price_history(tracked.id).await.unwrap();
        assert_eq!(history.iter().map(|e| e.price).collect::<Vec<_>>(), vec![dec!(40), dec!(35)]);
        assert_eq!(store.latest_price(tracked.id).await.unwrap().unwrap().price, dec!(35));
        assert_eq!(
            store
                .find_tracked_item(user, Some("B000000001"), "ignored")
                .await
                .unwrap(),
            Some(tracked.id)
        );

        assert!(!store.delete_tracked_item(Uuid::new_v4(), tracked.id).await.unwrap());
        assert!(store.delete_tracked_item(user, tracked.id).await.unwrap());
        assert!(store.price_history(tracked.id).await.unwrap().is_empty());
    }
}
