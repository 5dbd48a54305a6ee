#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use basket_adapters::{OrderSource, SourceConnector, SourceCredentials, SourceError};
use basket_core::{
    IngestionJob, JobDetails, JobId, JobStatus, JobType, PriceQuote, SourceOrder,
    SourceOrderItem, SourceTransaction, UserId,
};
use basket_storage::{JobStore, JobUpdate, MemoryStore, StoreError};
use basket_sync::{
    CredentialCipher, FernetCipher, IngestionConfig, IngestionEngine, JobReport, JobRunner,
    Notifier, NotifyError, PriceDropAlert, PriceProbe, SettingsInput, SettingsResolver,
};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use uuid::Uuid;

pub const GOOD_PASSWORD: &str = "hunter2";

pub fn day(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

pub fn source_order(number: &str, placed: NaiveDate, price: Decimal) -> SourceOrder {
    SourceOrder {
        order_number: number.to_string(),
        placed_date: placed,
        grand_total: Some(price),
        subscription_discount: None,
        recipient: None,
        items: vec![SourceOrderItem {
            title: format!("Item of {number}"),
            link: Some("/dp/B000TEST01".to_string()),
            image_link: None,
            quantity: Some(1),
            price: Some(price),
            is_subscribe_and_save: false,
        }],
    }
}

/// Shared script behind every session the connector hands out.
#[derive(Default)]
pub struct Script {
    pub transactions: Vec<SourceTransaction>,
    pub orders: HashMap<String, SourceOrder>,
    pub failing_orders: HashSet<String>,
    pub failing_listing: bool,
    pub listed_days: Mutex<Vec<i64>>,
    pub get_calls: AtomicUsize,
    pub logouts: AtomicUsize,
}

impl Script {
    pub fn with_orders(orders: Vec<SourceOrder>) -> Self {
        Self {
            transactions: orders
                .iter()
                .map(|o| SourceTransaction {
                    order_number: Some(o.order_number.clone()),
                })
                .collect(),
            orders: orders
                .into_iter()
                .map(|o| (o.order_number.clone(), o))
                .collect(),
            ..Self::default()
        }
    }

    pub fn listed_days(&self) -> Vec<i64> {
        self.listed_days.lock().unwrap().clone()
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }
}

struct ScriptedSession {
    script: Arc<Script>,
    password: String,
}

#[async_trait]
impl OrderSource for ScriptedSession {
    async fn login(&self) -> Result<(), SourceError> {
        if self.password == GOOD_PASSWORD {
            Ok(())
        } else {
            Err(SourceError::Login("invalid password".into()))
        }
    }

    async fn logout(&self) -> Result<(), SourceError> {
        self.script.logouts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list_transactions(&self, days: i64) -> Result<Vec<SourceTransaction>, SourceError> {
        self.script.listed_days.lock().unwrap().push(days);
        if self.script.failing_listing {
            return Err(SourceError::Fetch("order history page did not load".into()));
        }
        Ok(self.script.transactions.clone())
    }

    async fn get_order(&self, order_number: &str) -> Result<SourceOrder, SourceError> {
        self.script.get_calls.fetch_add(1, Ordering::SeqCst);
        if self.script.failing_orders.contains(order_number) {
            return Err(SourceError::Fetch("timeout".into()));
        }
        self.script
            .orders
            .get(order_number)
            .cloned()
            .ok_or_else(|| SourceError::OrderNotFound(order_number.to_string()))
    }
}

pub struct ScriptedConnector {
    pub script: Arc<Script>,
}

impl SourceConnector for ScriptedConnector {
    fn connect(&self, credentials: &SourceCredentials) -> Result<Arc<dyn OrderSource>, SourceError> {
        Ok(Arc::new(ScriptedSession {
            script: Arc::clone(&self.script),
            password: credentials.password.clone(),
        }))
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub reports: Mutex<Vec<(String, JobReport)>>,
    pub drops: Mutex<Vec<(String, PriceDropAlert)>>,
}

impl RecordingNotifier {
    pub fn reports(&self) -> Vec<(String, JobReport)> {
        self.reports.lock().unwrap().clone()
    }

    pub fn drops(&self) -> Vec<(String, PriceDropAlert)> {
        self.drops.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send_job_report(&self, webhook_url: &str, report: &JobReport) -> Result<(), NotifyError> {
        self.reports
            .lock()
            .unwrap()
            .push((webhook_url.to_string(), report.clone()));
        Ok(())
    }

    async fn send_price_drop(&self, webhook_url: &str, alert: &PriceDropAlert) -> Result<(), NotifyError> {
        self.drops
            .lock()
            .unwrap()
            .push((webhook_url.to_string(), alert.clone()));
        Ok(())
    }
}

/// Serves canned quotes by URL; unknown URLs look like a failed fetch.
#[derive(Default)]
pub struct ScriptedProbe {
    quotes: Mutex<HashMap<String, PriceQuote>>,
}

impl ScriptedProbe {
    pub fn set(&self, url: &str, quote: PriceQuote) {
        self.quotes.lock().unwrap().insert(url.to_string(), quote);
    }

    pub fn set_price(&self, url: &str, price: Decimal, title: &str) {
        self.set(
            url,
            PriceQuote {
                price: Some(price),
                title: Some(title.to_string()),
                currency: Some("$".to_string()),
            },
        );
    }
}

#[async_trait]
impl PriceProbe for ScriptedProbe {
    async fn probe(&self, url: &str) -> PriceQuote {
        self.quotes
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .unwrap_or_else(PriceQuote::empty)
    }
}

/// Job store that rejects the next `failures` status writes matching `status`.
pub struct FlakyJobs {
    pub inner: Arc<MemoryStore>,
    status: JobStatus,
    failures: AtomicUsize,
}

impl FlakyJobs {
    pub fn failing(inner: Arc<MemoryStore>, status: JobStatus, failures: usize) -> Self {
        Self {
            inner,
            status,
            failures: AtomicUsize::new(failures),
        }
    }
}

#[async_trait]
impl JobStore for FlakyJobs {
    async fn create_job(
        &self,
        job_type: JobType,
        user_id: Option<UserId>,
        details: &JobDetails,
    ) -> Result<JobId, StoreError> {
        self.inner.create_job(job_type, user_id, details).await
    }

    async fn try_create_manual_job(
        &self,
        user_id: UserId,
        details: &JobDetails,
    ) -> Result<Option<JobId>, StoreError> {
        self.inner.try_create_manual_job(user_id, details).await
    }

    async fn update_job(&self, id: JobId, update: &JobUpdate) -> Result<(), StoreError> {
        if update.status == Some(self.status)
            && self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(StoreError::Rejected("connection reset".into()));
        }
        self.inner.update_job(id, update).await
    }

    async fn get_job(&self, id: JobId) -> Result<Option<IngestionJob>, StoreError> {
        self.inner.get_job(id).await
    }

    async fn latest_job(
        &self,
        job_type: JobType,
        user_id: Option<UserId>,
    ) -> Result<Option<IngestionJob>, StoreError> {
        self.inner.latest_job(job_type, user_id).await
    }

    async fn mark_notification_seen(&self, id: JobId, user_id: UserId) -> Result<bool, StoreError> {
        self.inner.mark_notification_seen(id, user_id).await
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub script: Arc<Script>,
    pub notifier: Arc<RecordingNotifier>,
    pub resolver: SettingsResolver,
    pub engine: Arc<IngestionEngine>,
}

impl Harness {
    pub fn new(script: Script) -> Self {
        let store = Arc::new(MemoryStore::new());
        let script = Arc::new(script);
        let cipher: Arc<dyn CredentialCipher> =
            Arc::new(FernetCipher::from_secret("test-encryption-key").unwrap());
        let resolver = SettingsResolver::new(store.clone(), Some(cipher));
        let engine = Arc::new(IngestionEngine::new(
            store.clone(),
            resolver.clone(),
            Arc::new(ScriptedConnector {
                script: Arc::clone(&script),
            }),
            IngestionConfig::default(),
        ));
        Self {
            store,
            script,
            notifier: Arc::new(RecordingNotifier::default()),
            resolver,
            engine,
        }
    }

    pub fn runner(&self) -> Arc<JobRunner> {
        self.runner_with_jobs(self.store.clone())
    }

    pub fn runner_with_jobs(&self, jobs: Arc<dyn JobStore>) -> Arc<JobRunner> {
        Arc::new(JobRunner::new(
            Arc::clone(&self.engine),
            jobs,
            self.store.clone(),
            self.notifier.clone(),
            3,
        ))
    }

    /// Registers a user with source credentials and the given extra settings.
    pub async fn user(&self, username: &str, password: &str, admin: bool, extra: SettingsInput) -> UserId {
        let id = Uuid::new_v4();
        self.store.add_user(id, username, admin).await;
        self.resolver
            .save(
                id,
                SettingsInput {
                    source_email: Some(format!("{username}@example.test")),
                    source_password: Some(password.to_string()),
                    ..extra
                },
            )
            .await
            .unwrap();
        id
    }
}
