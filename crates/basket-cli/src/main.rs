use std::sync::Arc;

use anyhow::{bail, Context, Result};
use basket_adapters::FixtureConnector;
use basket_core::{
    JobEvent, JobId, NotificationPreference, NotificationThreshold, ThresholdKind,
    TrackedItemId, UserId,
};
use basket_storage::{HttpFetcher, PgStore};
use basket_sync::{
    maybe_build_scheduler, run_foreground, CredentialCipher, FernetCipher, HttpPriceProbe,
    IngestionConfig, IngestionEngine, IngestionRequest, JobRunner, ManualSubmission,
    PriceWatchEngine, ScheduledTrigger, ServiceConfig, SettingsInput, SettingsResolver,
    WebhookNotifier,
};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "basket-cli")]
#[command(about = "Order ledger ingestion and price watch")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply database migrations.
    Migrate,
    /// Run one ingestion in the foreground, printing events as they arrive.
    Ingest {
        #[arg(long)]
        user: UserId,
        #[arg(long)]
        days: Option<i64>,
    },
    /// Create a manual job, run it, and wait for its final status.
    RunManual {
        #[arg(long)]
        user: UserId,
        #[arg(long)]
        days: Option<i64>,
    },
    /// Ingest for every user with scheduled ingestion enabled.
    Scheduled {
        #[arg(long)]
        triggered_by: Option<UserId>,
    },
    /// Show a user's job by id or their latest manual job; without a user,
    /// the latest automated run.
    Status {
        #[arg(long, requires = "user")]
        job: Option<JobId>,
        #[arg(long)]
        user: Option<UserId>,
    },
    /// Mark a finished job's notification as seen.
    Ack {
        #[arg(long)]
        job: JobId,
        #[arg(long)]
        user: UserId,
    },
    /// Run one price check cycle over every tracked item.
    Prices,
    /// Fetch a single product page without storing anything.
    CheckPrice { url: String },
    #[command(subcommand)]
    Settings(SettingsCommand),
    #[command(subcommand)]
    Track(TrackCommand),
    /// Run the cron scheduler until interrupted.
    Serve,
}

#[derive(Debug, Subcommand)]
enum SettingsCommand {
    Show {
        #[arg(long)]
        user: UserId,
    },
    Set(SettingsArgs),
}

#[derive(Debug, Args)]
struct SettingsArgs {
    #[arg(long)]
    user: UserId,
    #[arg(long)]
    email: Option<String>,
    #[arg(long)]
    password: Option<String>,
    #[arg(long)]
    otp_secret: Option<String>,
    #[arg(long)]
    scheduled: Option<bool>,
    #[arg(long)]
    job_webhook: Option<String>,
    /// off, always or errors_only
    #[arg(long)]
    job_notify: Option<NotificationPreference>,
    #[arg(long)]
    price_webhook: Option<String>,
    #[command(flatten)]
    threshold: ThresholdArgs,
}

#[derive(Debug, Args)]
struct ThresholdArgs {
    /// percent or absolute
    #[arg(long = "threshold-type", requires = "threshold_value")]
    threshold_type: Option<ThresholdKind>,
    #[arg(long = "threshold-value", requires = "threshold_type")]
    threshold_value: Option<Decimal>,
}

impl ThresholdArgs {
    fn threshold(&self) -> Option<NotificationThreshold> {
        Some(NotificationThreshold {
            kind: self.threshold_type?,
            value: self.threshold_value?,
        })
    }
}

#[derive(Debug, Subcommand)]
enum TrackCommand {
    Add {
        #[arg(long)]
        user: UserId,
        url: String,
        #[arg(long)]
        name: Option<String>,
        #[command(flatten)]
        threshold: ThresholdArgs,
    },
    List {
        #[arg(long)]
        user: UserId,
    },
    Show {
        #[arg(long)]
        user: UserId,
        id: TrackedItemId,
    },
    Rename {
        #[arg(long)]
        user: UserId,
        id: TrackedItemId,
        name: String,
    },
    /// Set or, without threshold flags, clear an item's threshold.
    Threshold {
        #[arg(long)]
        user: UserId,
        id: TrackedItemId,
        #[command(flatten)]
        threshold: ThresholdArgs,
    },
    Delete {
        #[arg(long)]
        user: UserId,
        id: TrackedItemId,
    },
}

struct App {
    config: ServiceConfig,
    store: Arc<PgStore>,
    settings: SettingsResolver,
    http: HttpFetcher,
}

impl App {
    async fn connect(config: ServiceConfig) -> Result<Self> {
        let store = Arc::new(
            PgStore::connect(&config.database_url)
                .await
                .context("connecting to database")?,
        );
        let cipher = match config.encryption_key.as_deref() {
            Some(secret) => {
                let cipher = FernetCipher::from_secret(secret).context("loading ENCRYPTION_KEY")?;
                Some(Arc::new(cipher) as Arc<dyn CredentialCipher>)
            }
            None => None,
        };
        let settings = SettingsResolver::new(store.clone(), cipher);
        let http = HttpFetcher::new(config.http_client_config())?;
        Ok(Self {
            config,
            store,
            settings,
            http,
        })
    }

    fn runner(&self) -> Result<Arc<JobRunner>> {
        let fixture = self
            .config
            .order_source_fixture
            .clone()
            .context("ORDER_SOURCE_FIXTURE must point at an order fixture file")?;
        let engine = IngestionEngine::new(
            self.store.clone(),
            self.settings.clone(),
            Arc::new(FixtureConnector::new(fixture)),
            IngestionConfig::default(),
        );
        Ok(Arc::new(JobRunner::new(
            Arc::new(engine),
            self.store.clone(),
            self.store.clone(),
            Arc::new(WebhookNotifier::new(self.http.clone())),
            self.config.scheduled_ingest_days,
        )))
    }

    fn prices(&self) -> Arc<PriceWatchEngine> {
        Arc::new(PriceWatchEngine::new(
            self.store.clone(),
            self.store.clone(),
            Arc::new(HttpPriceProbe::new(self.http.clone())),
            Arc::new(WebhookNotifier::new(self.http.clone())),
        ))
    }
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_event(event: &JobEvent) {
    match event {
        JobEvent::Status(msg) => println!("STATUS: {msg}"),
        JobEvent::Progress { value, max } => println!("PROGRESS: {value}/{max}"),
        JobEvent::Error(msg) => println!("ERROR: {msg}"),
        JobEvent::Done(msg) => println!("DONE: {msg}"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let app = App::connect(ServiceConfig::from_env()).await?;
    let today = Utc::now().date_naive();

    match cli.command {
        Commands::Migrate => {
            app.store.migrate().await.context("applying migrations")?;
            println!("migrations applied");
        }
        Commands::Ingest { user, days } => {
            let runner = app.runner()?;
            let request = IngestionRequest {
                user_id: user,
                days_override: days,
                today,
            };
            let summary = run_foreground(runner.engine(), request, print_event).await?;
            println!(
                "ingest finished: window={}d new={} stored={} fetch_failures={} write_failures={}",
                summary.window.days,
                summary.new_orders,
                summary.persisted,
                summary.fetch_failures,
                summary.write_failures
            );
        }
        Commands::RunManual { user, days } => {
            let runner = app.runner()?;
            match runner.submit_manual(user, days, today).await? {
                ManualSubmission::AlreadyRunning => {
                    bail!("an ingestion job is already in progress for this user")
                }
                ManualSubmission::Started { job_id, handle } => {
                    println!("job {job_id} started");
                    let status = handle.await.context("joining manual job task")??;
                    println!("job {job_id} finished: {status}");
                }
            }
        }
        Commands::Scheduled { triggered_by } => {
            let trigger = triggered_by.map_or(ScheduledTrigger::Automated, ScheduledTrigger::User);
            let report = app.runner()?.start_scheduled(trigger, today, None).await?;
            print_json(&report.details)?;
            println!("scheduled job {} finished: {}", report.job_id, report.status);
        }
        Commands::Status { job, user } => {
            let runner = app.runner()?;
            let view = match (job, user) {
                (Some(job), Some(user)) => runner.job_status(job, user).await?,
                (None, Some(user)) => runner.latest_manual_status(user).await?,
                (Some(_), None) => bail!("--job requires --user"),
                (None, None) => runner.latest_scheduled_status().await?,
            };
            match view {
                Some(view) => print_json(&view)?,
                None => println!("no job found"),
            }
        }
        Commands::Ack { job, user } => {
            if !app.runner()?.acknowledge(job, user).await? {
                bail!("job {job} not found for user {user}");
            }
            println!("notification acknowledged");
        }
        Commands::Prices => {
            let summary = app.prices().update_all_prices(Utc::now()).await?;
            println!(
                "price check finished: checked={} priced={} unavailable={} history_rows={} notified={} failed={}",
                summary.checked,
                summary.priced,
                summary.unavailable,
                summary.history_appended,
                summary.notified,
                summary.failed
            );
        }
        Commands::CheckPrice { url } => {
            print_json(&app.prices().check_price(&url).await)?;
        }
        Commands::Settings(SettingsCommand::Show { user }) => {
            print_json(&app.settings.view(user).await?)?;
        }
        Commands::Settings(SettingsCommand::Set(args)) => {
            let input = SettingsInput {
                source_email: args.email,
                source_password: args.password,
                source_otp_secret: args.otp_secret,
                enable_scheduled_ingestion: args.scheduled,
                job_webhook_url: args.job_webhook,
                job_notification_preference: args.job_notify,
                price_webhook_url: args.price_webhook,
                default_threshold: args.threshold.threshold(),
            };
            app.settings.save(args.user, input).await?;
            println!("settings saved");
        }
        Commands::Track(command) => run_track(&app, command).await?,
        Commands::Serve => {
            let Some(sched) = maybe_build_scheduler(&app.config, app.runner()?, app.prices()).await? else {
                bail!("scheduler is disabled; set BASKET_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            info!(
                ingest_cron = %app.config.ingest_cron,
                price_cron = %app.config.price_cron,
                "scheduler running"
            );
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            info!("shutting down");
        }
    }

    Ok(())
}

async fn run_track(app: &App, command: TrackCommand) -> Result<()> {
    let prices = app.prices();
    match command {
        TrackCommand::Add {
            user,
            url,
            name,
            threshold,
        } => {
            let item = prices
                .add_tracked_item(user, &url, name.as_deref(), threshold.threshold(), Utc::now())
                .await?;
            print_json(&item)?;
        }
        TrackCommand::List { user } => print_json(&prices.list(user).await?)?,
        TrackCommand::Show { user, id } => {
            let detail = prices.detail(user, id).await?;
            print_json(&detail.item)?;
            print_json(&detail.history)?;
        }
        TrackCommand::Rename { user, id, name } => {
            print_json(&prices.rename(user, id, &name).await?)?;
        }
        TrackCommand::Threshold {
            user,
            id,
            threshold,
        } => {
            print_json(&prices.set_threshold(user, id, threshold.threshold()).await?)?;
        }
        TrackCommand::Delete { user, id } => {
            prices.delete(user, id).await?;
            println!("item {id} deleted");
        }
    }
    Ok(())
}
