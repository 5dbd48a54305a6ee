//! Job drivers: foreground, manual background, and scheduled multi-user
//! runs, plus the status lookups the UI polls.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use basket_core::{
    JobDetails, JobEvent, JobId, JobProgress, JobStatus, JobStatusView, JobType,
    UserId, UserRunDetails,
};
use basket_storage::{BackoffPolicy, JobStore, JobUpdate, SettingsStore, StoreError};
use chrono::NaiveDate;
use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{error, info, info_span, warn, Instrument};

use crate::engine::{IngestError, IngestionEngine, IngestionRequest, RunSummary};
use crate::events::EventEmitter;
use crate::notify::{
    manual_job_report, manual_job_should_notify, scheduled_job_report,
    scheduled_job_should_notify, Notifier,
};

pub const INITIALIZATION_FAILED: &str = "Job failed during initialization.";
pub const JOB_CREATED: &str = "Job created...";

/// Runs the engine and hands every event to `on_event` as it arrives.
pub async fn run_foreground<F>(
    engine: &IngestionEngine,
    request: IngestionRequest,
    mut on_event: F,
) -> Result<RunSummary, IngestError>
where
    F: FnMut(&JobEvent),
{
    let (emitter, mut rx) = EventEmitter::channel();
    let run = async move { engine.run(request, &emitter).await };
    let consume = async {
        while let Some(event) = rx.recv().await {
            on_event(&event);
        }
    };
    let (result, ()) = tokio::join!(run, consume);
    result
}

async fn run_collecting(
    engine: &IngestionEngine,
    request: IngestionRequest,
) -> (Result<RunSummary, IngestError>, Vec<JobEvent>) {
    let mut events = Vec::new();
    let result = run_foreground(engine, request, |event| events.push(event.clone())).await;
    (result, events)
}

/// Who started a scheduled run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduledTrigger {
    Automated,
    User(UserId),
}

impl ScheduledTrigger {
    pub fn user_id(&self) -> Option<UserId> {
        match self {
            Self::Automated => None,
            Self::User(id) => Some(*id),
        }
    }
}

/// Snapshot stream of a scheduled run for live consumers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ScheduledEvent {
    JobUpdate {
        id: JobId,
        status: JobStatus,
        progress: JobProgress,
        details: JobDetails,
    },
    Error(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledRunReport {
    pub job_id: JobId,
    pub status: JobStatus,
    pub details: JobDetails,
}

#[derive(Debug)]
pub enum ManualSubmission {
    Started {
        job_id: JobId,
        handle: JoinHandle<Result<JobStatus, StoreError>>,
    },
    /// The user already has a pending or running manual job.
    AlreadyRunning,
}

pub struct JobRunner {
    engine: Arc<IngestionEngine>,
    jobs: Arc<dyn JobStore>,
    settings: Arc<dyn SettingsStore>,
    notifier: Arc<dyn Notifier>,
    scheduled_days: i64,
    final_write: BackoffPolicy,
}

impl JobRunner {
    pub fn new(
        engine: Arc<IngestionEngine>,
        jobs: Arc<dyn JobStore>,
        settings: Arc<dyn SettingsStore>,
        notifier: Arc<dyn Notifier>,
        scheduled_days: i64,
    ) -> Self {
        Self {
            engine,
            jobs,
            settings,
            notifier,
            scheduled_days,
            final_write: BackoffPolicy::fixed(3, Duration::from_millis(500)),
        }
    }

    pub fn engine(&self) -> &Arc<IngestionEngine> {
        &self.engine
    }

    /// Creates a manual job and runs it on a background task.
    pub async fn submit_manual(
        self: &Arc<Self>,
        user_id: UserId,
        days_override: Option<i64>,
        today: NaiveDate,
    ) -> Result<ManualSubmission, StoreError> {
        let Some(job_id) = self
            .jobs
            .try_create_manual_job(user_id, &JobDetails::with_log(JOB_CREATED))
            .await?
        else {
            info!(%user_id, "manual ingestion already in progress");
            return Ok(ManualSubmission::AlreadyRunning);
        };

        let runner = Arc::clone(self);
        let request = IngestionRequest {
            user_id,
            days_override,
            today,
        };
        let handle = tokio::spawn(async move { runner.run_manual_job(job_id, request).await });
        Ok(ManualSubmission::Started { job_id, handle })
    }

    /// Drives an existing manual job row to a terminal status.
    ///
    /// The row never stays `pending` or `running` once this returns `Ok`: a
    /// failed start or a lost completion write marks the job failed.
    pub async fn run_manual_job(
        &self,
        job_id: JobId,
        request: IngestionRequest,
    ) -> Result<JobStatus, StoreError> {
        let span = info_span!("manual_job", job_id, user_id = %request.user_id);
        async {
            let mut details = JobDetails::with_log("Job started...");
            let started = self
                .jobs
                .update_job(
                    job_id,
                    &JobUpdate::status(JobStatus::Running)
                        .with_progress(JobProgress::default())
                        .with_details(details.clone()),
                )
                .await;
            if let Err(err) = started {
                error!(error = %err, "could not start manual job");
                let message = format!("Could not start job: {err}");
                details.log.push(format!("ERROR: {message}"));
                details.error = Some(message);
                let status = self.finish_manual(job_id, JobStatus::Failed, &mut details).await;
                self.notify_manual(job_id, true, &details).await;
                return status;
            }

            let (emitter, mut rx) = EventEmitter::channel();
            let engine = &self.engine;
            let jobs = &self.jobs;
            let run = async move { engine.run(request, &emitter).await };
            let consume = async move {
                let mut details = details;
                while let Some(event) = rx.recv().await {
                    let update = match event {
                        JobEvent::Status(msg) | JobEvent::Done(msg) => {
                            details.log.push(msg);
                            JobUpdate::details(details.clone())
                        }
                        JobEvent::Error(msg) => {
                            details.log.push(format!("ERROR: {msg}"));
                            JobUpdate::details(details.clone())
                        }
                        JobEvent::Progress { value, max } => {
                            JobUpdate::progress(JobProgress::Orders { value, max })
                        }
                    };
                    if let Err(err) = jobs.update_job(job_id, &update).await {
                        warn!(error = %err, "could not record job event");
                    }
                }
                details
            };
            let (result, mut details) = tokio::join!(run, consume);

            let status = match &result {
                Ok(_) => JobStatus::Completed,
                Err(err) => {
                    details.error = Some(err.to_string());
                    JobStatus::Failed
                }
            };
            let written = self.finish_manual(job_id, status, &mut details).await;
            let final_status = written.as_ref().copied().unwrap_or(JobStatus::Failed);
            info!(status = %final_status, "manual job finished");

            self.notify_manual(job_id, final_status == JobStatus::Failed, &details)
                .await;
            written
        }
        .instrument(span)
        .await
    }

    /// Writes the terminal status. A completed run whose result cannot be
    /// recorded is downgraded to failed so the user's guard is released.
    async fn finish_manual(
        &self,
        job_id: JobId,
        status: JobStatus,
        details: &mut JobDetails,
    ) -> Result<JobStatus, StoreError> {
        match self.write_terminal(job_id, status, details).await {
            Ok(()) => Ok(status),
            Err(err) if status == JobStatus::Completed => {
                error!(error = %err, "could not record completed status");
                details.error = Some(format!("Could not record job result: {err}"));
                self.write_terminal(job_id, JobStatus::Failed, details)
                    .await
                    .map(|()| JobStatus::Failed)
            }
            Err(err) => Err(err),
        }
    }

    async fn write_terminal(
        &self,
        job_id: JobId,
        status: JobStatus,
        details: &JobDetails,
    ) -> Result<(), StoreError> {
        let update = JobUpdate::status(status).with_details(details.clone());
        let mut attempt = 0;
        loop {
            match self.jobs.update_job(job_id, &update).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt + 1 < self.final_write.attempts() => {
                    warn!(attempt = attempt + 1, error = %err, "retrying final job status write");
                    sleep(self.final_write.delay_for_attempt(attempt)).await;
                    attempt += 1;
                }
                Err(err) => {
                    error!(%status, error = %err, "giving up on final job status write");
                    return Err(err);
                }
            }
        }
    }

    async fn notify_manual(&self, job_id: JobId, failed: bool, details: &JobDetails) {
        let sent: anyhow::Result<()> = async {
            let Some(admin) = self.settings.admin_user().await? else {
                warn!("no admin user; skipping manual job notification");
                return Ok(());
            };
            let Some(settings) = self.settings.get_settings(admin).await? else {
                return Ok(());
            };
            let webhook = settings.job_webhook_url.as_deref();
            if !manual_job_should_notify(webhook, settings.job_notification_preference, failed) {
                return Ok(());
            }
            let Some(url) = webhook else {
                return Ok(());
            };
            let report = manual_job_report(job_id, failed, &details.log);
            self.notifier
                .send_job_report(url, &report)
                .await
                .context("sending manual job report")?;
            Ok(())
        }
        .await;
        if let Err(err) = sent {
            error!(job_id, error = %err, "manual job notification failed");
        }
    }

    /// Creates a scheduled job row and runs it for every opted-in user.
    pub async fn start_scheduled(
        &self,
        trigger: ScheduledTrigger,
        today: NaiveDate,
        updates: Option<&UnboundedSender<ScheduledEvent>>,
    ) -> Result<ScheduledRunReport, StoreError> {
        let job_id = self
            .jobs
            .create_job(JobType::Scheduled, trigger.user_id(), &JobDetails::default())
            .await?;
        self.run_scheduled(job_id, trigger, today, updates).await
    }

    /// Runs users one after another with a fixed short window. One user's
    /// failure is recorded and the run moves on.
    pub async fn run_scheduled(
        &self,
        job_id: JobId,
        trigger: ScheduledTrigger,
        today: NaiveDate,
        updates: Option<&UnboundedSender<ScheduledEvent>>,
    ) -> Result<ScheduledRunReport, StoreError> {
        let span = info_span!("scheduled_job", job_id);
        async {
            let mut details = JobDetails::default();
            let mut progress = JobProgress::Users {
                current: 0,
                total: 0,
            };

            let outcome = self
                .drive_scheduled(job_id, today, updates, &mut details, &mut progress)
                .await;

            let status = match outcome {
                Ok(()) => JobStatus::Completed,
                Err(err) => {
                    error!(error = %err, "scheduled ingestion failed");
                    if details.error.is_none() {
                        details.error = Some(INITIALIZATION_FAILED.to_string());
                    }
                    let update = JobUpdate::status(JobStatus::Failed).with_details(details.clone());
                    if let Err(write_err) = self.jobs.update_job(job_id, &update).await {
                        error!(error = %write_err, "could not mark scheduled job failed");
                    }
                    send_update(updates, job_id, JobStatus::Failed, progress, &details);
                    if let Some(tx) = updates {
                        let _ = tx.send(ScheduledEvent::Error(err.to_string()));
                    }
                    JobStatus::Failed
                }
            };

            let job_failed = status == JobStatus::Failed;
            self.notify_scheduled(trigger, job_failed, &details).await;
            Ok(ScheduledRunReport {
                job_id,
                status,
                details,
            })
        }
        .instrument(span)
        .await
    }

    async fn drive_scheduled(
        &self,
        job_id: JobId,
        today: NaiveDate,
        updates: Option<&UnboundedSender<ScheduledEvent>>,
        details: &mut JobDetails,
        progress: &mut JobProgress,
    ) -> Result<(), StoreError> {
        let users = self.settings.scheduled_users().await?;
        let total = users.len() as u64;
        info!(users = total, "starting scheduled ingestion");

        details.users = users
            .iter()
            .map(|user| UserRunDetails {
                user_id: user.id,
                status: JobStatus::Pending,
                username: user.username.clone(),
                log: Vec::new(),
                error: None,
            })
            .collect();
        *progress = JobProgress::Users { current: 0, total };
        self.jobs
            .update_job(
                job_id,
                &JobUpdate::status(JobStatus::Running)
                    .with_progress(*progress)
                    .with_details(details.clone()),
            )
            .await?;
        send_update(updates, job_id, JobStatus::Running, *progress, details);

        for (index, user) in users.iter().enumerate() {
            *progress = JobProgress::Users {
                current: index as u64,
                total,
            };
            set_user_status(details, user.id, JobStatus::Running);
            self.jobs
                .update_job(
                    job_id,
                    &JobUpdate::progress(*progress).with_details(details.clone()),
                )
                .await?;
            send_update(updates, job_id, JobStatus::Running, *progress, details);

            let request = IngestionRequest {
                user_id: user.id,
                days_override: Some(self.scheduled_days),
                today,
            };
            let (result, events) = run_collecting(&self.engine, request).await;
            if let Some(entry) = details.user_mut(user.id) {
                entry.log.extend(events.iter().filter_map(JobEvent::log_line));
                match result {
                    Ok(_) => entry.status = JobStatus::Completed,
                    Err(err) => {
                        warn!(user = %user.username, error = %err, "scheduled ingestion failed for user");
                        entry.status = JobStatus::Failed;
                        entry.error = Some(err.to_string());
                    }
                }
            }
            self.jobs
                .update_job(job_id, &JobUpdate::details(details.clone()))
                .await?;
            send_update(updates, job_id, JobStatus::Running, *progress, details);
        }

        *progress = JobProgress::Users {
            current: total,
            total,
        };
        self.jobs
            .update_job(
                job_id,
                &JobUpdate::status(JobStatus::Completed)
                    .with_progress(*progress)
                    .with_details(details.clone()),
            )
            .await?;
        send_update(updates, job_id, JobStatus::Completed, *progress, details);
        info!("scheduled ingestion finished");
        Ok(())
    }

    async fn notify_scheduled(&self, trigger: ScheduledTrigger, job_failed: bool, details: &JobDetails) {
        let has_errors = job_failed || details.any_user_failed();
        let sent: anyhow::Result<()> = async {
            let target = match trigger {
                ScheduledTrigger::User(id) => Some(id),
                ScheduledTrigger::Automated => self.settings.admin_user().await?,
            };
            let Some(target) = target else {
                warn!("no notification target for scheduled job");
                return Ok(());
            };
            let Some(settings) = self.settings.get_settings(target).await? else {
                return Ok(());
            };
            let automated = trigger == ScheduledTrigger::Automated;
            let webhook = settings.job_webhook_url.as_deref();
            if !scheduled_job_should_notify(
                automated,
                webhook,
                settings.job_notification_preference,
                has_errors,
            ) {
                return Ok(());
            }
            let Some(url) = webhook else {
                return Ok(());
            };
            let report = scheduled_job_report(automated, has_errors, details);
            self.notifier
                .send_job_report(url, &report)
                .await
                .context("sending scheduled job report")?;
            Ok(())
        }
        .await;
        if let Err(err) = sent {
            error!(error = %err, "scheduled job notification failed");
        }
    }

    /// Snapshot of a job owned by `user_id`; other users' jobs read as absent.
    pub async fn job_status(
        &self,
        job_id: JobId,
        user_id: UserId,
    ) -> Result<Option<JobStatusView>, StoreError> {
        Ok(self
            .jobs
            .get_job(job_id)
            .await?
            .filter(|job| job.user_id == Some(user_id))
            .as_ref()
            .map(JobStatusView::from))
    }

    /// Most recent manual job of a user, for resuming a progress display.
    pub async fn latest_manual_status(
        &self,
        user_id: UserId,
    ) -> Result<Option<JobStatusView>, StoreError> {
        Ok(self
            .jobs
            .latest_job(JobType::Manual, Some(user_id))
            .await?
            .as_ref()
            .map(JobStatusView::from))
    }

    /// Most recent automated scheduled run.
    pub async fn latest_scheduled_status(&self) -> Result<Option<JobStatusView>, StoreError> {
        Ok(self
            .jobs
            .latest_job(JobType::Scheduled, None)
            .await?
            .as_ref()
            .map(JobStatusView::from))
    }

    pub async fn acknowledge(&self, job_id: JobId, user_id: UserId) -> Result<bool, StoreError> {
        self.jobs.mark_notification_seen(job_id, user_id).await
    }
}

fn set_user_status(details: &mut JobDetails, user_id: UserId, status: JobStatus) {
    if let Some(entry) = details.user_mut(user_id) {
        entry.status = status;
    }
}

fn send_update(
    updates: Option<&UnboundedSender<ScheduledEvent>>,
    id: JobId,
    status: JobStatus,
    progress: JobProgress,
    details: &JobDetails,
) {
    if let Some(tx) = updates {
        let _ = tx.send(ScheduledEvent::JobUpdate {
            id,
            status,
            progress,
            details: details.clone(),
        });
    }
}
