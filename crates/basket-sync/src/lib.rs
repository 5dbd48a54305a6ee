//! Ingestion and price watch engines, their job drivers, and scheduling.

pub mod cipher;
pub mod config;
pub mod dedup;
pub mod engine;
pub mod events;
pub mod jobs;
pub mod notify;
pub mod planner;
pub mod pool;
pub mod price;
pub mod scheduler;
pub mod settings;
pub mod writer;

pub use cipher::{CipherError, CredentialCipher, FernetCipher};
pub use config::{IngestionConfig, ServiceConfig, WindowScope};
pub use engine::{IngestError, IngestionEngine, IngestionRequest, RunOutcome, RunSummary};
pub use events::EventEmitter;
pub use jobs::{
    run_foreground, JobRunner, ManualSubmission, ScheduledEvent, ScheduledRunReport,
    ScheduledTrigger,
};
pub use notify::{JobReport, Notifier, NotifyError, PriceDropAlert, WebhookNotifier};
pub use planner::{plan_window, WindowBasis, WindowPlan};
pub use price::{
    CycleSummary, HttpPriceProbe, ItemCheck, PriceError, PriceProbe, PriceWatchEngine,
    TrackedItemDetail,
};
pub use scheduler::maybe_build_scheduler;
pub use settings::{SettingsError, SettingsInput, SettingsResolver, SettingsView};

pub const CRATE_NAME: &str = "basket-sync";
