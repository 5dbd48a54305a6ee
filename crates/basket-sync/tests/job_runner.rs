mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use basket_core::{JobDetails, JobProgress, JobStatus, NotificationPreference};
use basket_storage::{JobStore, OrderStore};
use basket_sync::{
    IngestionRequest, ManualSubmission, ScheduledEvent, ScheduledTrigger, SettingsInput,
};
use common::{day, source_order, FlakyJobs, Harness, Script, GOOD_PASSWORD};
use rust_decimal_macros::dec;
use uuid::Uuid;

const HOOK: &str = "https://hooks.example.test/jobs";

fn admin_settings(preference: NotificationPreference) -> SettingsInput {
    SettingsInput {
        job_webhook_url: Some(HOOK.into()),
        job_notification_preference: Some(preference),
        ..SettingsInput::default()
    }
}

#[tokio::test]
async fn manual_job_runs_to_completed_and_notifies_admin() {
    let harness = Harness::new(Script::with_orders(vec![
        source_order("M-1", day(2024, 6, 29), dec!(10)),
        source_order("M-2", day(2024, 6, 28), dec!(20)),
    ]));
    harness
        .user("admin", GOOD_PASSWORD, true, admin_settings(NotificationPreference::Always))
        .await;
    let user = harness.user("ana", GOOD_PASSWORD, false, SettingsInput::default()).await;
    let runner = harness.runner();

    let submission = runner
        .submit_manual(user, Some(3), day(2024, 6, 30))
        .await
        .unwrap();
    let ManualSubmission::Started { job_id, handle } = submission else {
        panic!("expected a started job");
    };
    assert_eq!(handle.await.unwrap().unwrap(), JobStatus::Completed);

    let view = runner.job_status(job_id, user).await.unwrap().unwrap();
    assert_eq!(view.status, JobStatus::Completed);
    assert_eq!(view.progress, JobProgress::Orders { value: 2, max: 2 });
    assert_eq!(view.log.first().map(String::as_str), Some("Job started..."));
    assert_eq!(view.log.last().map(String::as_str), Some("Import complete."));
    assert_eq!(view.error, None);
    assert!(view.show_notification);
    assert_eq!(harness.store.count_orders(user).await.unwrap(), 2);

    let reports = harness.notifier.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].0, HOOK);
    assert_eq!(
        reports[0].1.title,
        format!("Manual Ingestion Job Completed (ID: {job_id})")
    );

    assert!(runner.acknowledge(job_id, user).await.unwrap());
    let view = runner.job_status(job_id, user).await.unwrap().unwrap();
    assert!(!view.show_notification);
    assert!(view.notification_seen);
}

#[tokio::test]
async fn new_manual_job_reads_as_created_until_it_starts() {
    let harness = Harness::new(Script::default());
    let user = harness.user("ana", GOOD_PASSWORD, false, SettingsInput::default()).await;
    let runner = harness.runner();

    let ManualSubmission::Started { job_id, handle } = runner
        .submit_manual(user, Some(3), day(2024, 6, 30))
        .await
        .unwrap()
    else {
        panic!("expected a started job");
    };

    // The spawned task has not been polled yet on the current-thread runtime.
    let view = runner.job_status(job_id, user).await.unwrap().unwrap();
    assert_eq!(view.status, JobStatus::Pending);
    assert_eq!(view.log, vec!["Job created...".to_string()]);
    assert_eq!(runner.job_status(job_id, Uuid::new_v4()).await.unwrap(), None);

    assert_eq!(handle.await.unwrap().unwrap(), JobStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn job_that_cannot_start_is_failed_and_frees_the_user() {
    let harness = Harness::new(Script::default());
    harness
        .user("admin", GOOD_PASSWORD, true, admin_settings(NotificationPreference::ErrorsOnly))
        .await;
    let user = harness.user("ana", GOOD_PASSWORD, false, SettingsInput::default()).await;
    let jobs = Arc::new(FlakyJobs::failing(harness.store.clone(), JobStatus::Running, 1));
    let runner = harness.runner_with_jobs(jobs);

    let ManualSubmission::Started { job_id, handle } = runner
        .submit_manual(user, Some(3), day(2024, 6, 30))
        .await
        .unwrap()
    else {
        panic!("expected a started job");
    };
    assert_eq!(handle.await.unwrap().unwrap(), JobStatus::Failed);

    let view = runner.job_status(job_id, user).await.unwrap().unwrap();
    assert_eq!(view.status, JobStatus::Failed);
    assert!(view.error.unwrap().starts_with("Could not start job"));
    assert!(harness.script.listed_days().is_empty());

    let reports = harness.notifier.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(
        reports[0].1.title,
        format!("Manual Ingestion Job Failed (ID: {job_id})")
    );

    let retry = runner
        .submit_manual(user, Some(3), day(2024, 6, 30))
        .await
        .unwrap();
    let ManualSubmission::Started { handle, .. } = retry else {
        panic!("guard still held by the failed job");
    };
    assert_eq!(handle.await.unwrap().unwrap(), JobStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn final_status_write_is_retried() {
    let harness = Harness::new(Script::default());
    let user = harness.user("ana", GOOD_PASSWORD, false, SettingsInput::default()).await;
    let jobs = Arc::new(FlakyJobs::failing(harness.store.clone(), JobStatus::Completed, 2));
    let runner = harness.runner_with_jobs(jobs);

    let ManualSubmission::Started { job_id, handle } = runner
        .submit_manual(user, Some(3), day(2024, 6, 30))
        .await
        .unwrap()
    else {
        panic!("expected a started job");
    };
    assert_eq!(handle.await.unwrap().unwrap(), JobStatus::Completed);
    let view = runner.job_status(job_id, user).await.unwrap().unwrap();
    assert_eq!(view.status, JobStatus::Completed);
    assert_eq!(view.error, None);
}

#[tokio::test(start_paused = true)]
async fn unrecorded_completion_is_downgraded_to_failed() {
    let harness = Harness::new(Script::default());
    let user = harness.user("ana", GOOD_PASSWORD, false, SettingsInput::default()).await;
    let jobs = Arc::new(FlakyJobs::failing(harness.store.clone(), JobStatus::Completed, 3));
    let runner = harness.runner_with_jobs(jobs);

    let ManualSubmission::Started { job_id, handle } = runner
        .submit_manual(user, Some(3), day(2024, 6, 30))
        .await
        .unwrap()
    else {
        panic!("expected a started job");
    };
    assert_eq!(handle.await.unwrap().unwrap(), JobStatus::Failed);

    let view = runner.job_status(job_id, user).await.unwrap().unwrap();
    assert_eq!(view.status, JobStatus::Failed);
    assert!(view.error.unwrap().starts_with("Could not record job result"));
    assert!(matches!(
        runner.submit_manual(user, None, day(2024, 6, 30)).await.unwrap(),
        ManualSubmission::Started { .. }
    ));
}

#[tokio::test]
async fn listing_failure_fails_the_manual_job() {
    let harness = Harness::new(Script {
        failing_listing: true,
        ..Script::default()
    });
    let user = harness.user("ana", GOOD_PASSWORD, false, SettingsInput::default()).await;
    let runner = harness.runner();

    let ManualSubmission::Started { job_id, handle } = runner
        .submit_manual(user, Some(3), day(2024, 6, 30))
        .await
        .unwrap()
    else {
        panic!("expected a started job");
    };
    assert_eq!(handle.await.unwrap().unwrap(), JobStatus::Failed);

    let view = runner.job_status(job_id, user).await.unwrap().unwrap();
    assert_eq!(view.status, JobStatus::Failed);
    let error = view.error.unwrap();
    assert!(error.starts_with("order source error"));
    assert_eq!(view.log.last(), Some(&format!("ERROR: {error}")));
    assert_eq!(harness.script.logouts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn second_manual_submission_is_rejected_while_one_is_active() {
    let harness = Harness::new(Script::default());
    let user = harness.user("ana", GOOD_PASSWORD, false, SettingsInput::default()).await;
    let runner = harness.runner();

    let pending = harness
        .store
        .try_create_manual_job(user, &JobDetails::default())
        .await
        .unwrap();
    assert!(pending.is_some());

    let submission = runner
        .submit_manual(user, None, day(2024, 6, 30))
        .await
        .unwrap();
    assert!(matches!(submission, ManualSubmission::AlreadyRunning));
    assert_eq!(harness.store.job_count().await, 1);
}

#[tokio::test]
async fn failed_manual_job_records_error_and_respects_errors_only() {
    let harness = Harness::new(Script::with_orders(vec![source_order(
        "F-1",
        day(2024, 6, 29),
        dec!(1),
    )]));
    harness
        .user("admin", GOOD_PASSWORD, true, admin_settings(NotificationPreference::ErrorsOnly))
        .await;
    let user = harness.user("ana", "wrong", false, SettingsInput::default()).await;
    let runner = harness.runner();

    let job_id = harness
        .store
        .try_create_manual_job(user, &JobDetails::default())
        .await
        .unwrap()
        .unwrap();
    let status = runner
        .run_manual_job(
            job_id,
            IngestionRequest {
                user_id: user,
                days_override: Some(3),
                today: day(2024, 6, 30),
            },
        )
        .await
        .unwrap();
    assert_eq!(status, JobStatus::Failed);

    let view = runner.job_status(job_id, user).await.unwrap().unwrap();
    assert_eq!(view.status, JobStatus::Failed);
    let error = view.error.unwrap();
    assert!(error.starts_with("Amazon login failed"));
    assert!(view.log.contains(&format!("ERROR: {error}")));
    assert!(!view.show_notification);

    let reports = harness.notifier.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(
        reports[0].1.title,
        format!("Manual Ingestion Job Failed (ID: {job_id})")
    );
}

#[tokio::test]
async fn successful_job_is_silent_under_errors_only() {
    let harness = Harness::new(Script::default());
    harness
        .user("admin", GOOD_PASSWORD, true, admin_settings(NotificationPreference::ErrorsOnly))
        .await;
    let user = harness.user("ana", GOOD_PASSWORD, false, SettingsInput::default()).await;
    let runner = harness.runner();

    let ManualSubmission::Started { handle, .. } = runner
        .submit_manual(user, Some(3), day(2024, 6, 30))
        .await
        .unwrap()
    else {
        panic!("expected a started job");
    };
    assert_eq!(handle.await.unwrap().unwrap(), JobStatus::Completed);
    assert!(harness.notifier.reports().is_empty());
}

#[tokio::test]
async fn scheduled_run_tracks_each_user_and_reports_failures() {
    let harness = Harness::new(Script::with_orders(vec![source_order(
        "S-1",
        day(2024, 6, 29),
        dec!(7),
    )]));
    harness
        .user("admin", GOOD_PASSWORD, true, admin_settings(NotificationPreference::Off))
        .await;
    let opted_in = SettingsInput {
        enable_scheduled_ingestion: Some(true),
        ..SettingsInput::default()
    };
    let good = harness.user("bea", GOOD_PASSWORD, false, opted_in.clone()).await;
    let bad = harness.user("cal", "wrong", false, opted_in).await;
    let runner = harness.runner();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let report = runner
        .start_scheduled(ScheduledTrigger::Automated, day(2024, 6, 30), Some(&tx))
        .await
        .unwrap();
    drop(tx);

    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(harness.script.listed_days(), vec![3]);
    let processed: Vec<_> = report.details.users.iter().map(|u| u.user_id).collect();
    assert_eq!(processed, vec![good, bad]);
    let good_run = report.details.user(good).unwrap();
    assert_eq!(good_run.status, JobStatus::Completed);
    assert!(good_run.log.iter().any(|l| l == "done: Import complete."));
    assert!(good_run.log.iter().all(|l| !l.starts_with("progress")));
    let bad_run = report.details.user(bad).unwrap();
    assert_eq!(bad_run.status, JobStatus::Failed);
    assert!(bad_run.error.as_deref().unwrap().starts_with("Amazon login failed"));
    assert_eq!(harness.store.count_orders(good).await.unwrap(), 1);

    let mut snapshots = Vec::new();
    while let Some(event) = rx.recv().await {
        snapshots.push(event);
    }
    match snapshots.first() {
        Some(ScheduledEvent::JobUpdate { status, details, .. }) => {
            assert_eq!(*status, JobStatus::Running);
            assert!(details.users.iter().all(|u| u.status == JobStatus::Pending));
        }
        other => panic!("unexpected first snapshot: {other:?}"),
    }
    match snapshots.last() {
        Some(ScheduledEvent::JobUpdate { status, progress, .. }) => {
            assert_eq!(*status, JobStatus::Completed);
            assert_eq!(*progress, JobProgress::Users { current: 2, total: 2 });
        }
        other => panic!("unexpected last snapshot: {other:?}"),
    }

    // Automated runs notify the admin even with the preference off.
    let reports = harness.notifier.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].1.title, "Automated Daily Ingestion Finished with Errors");
    assert!(reports[0]
        .1
        .log
        .contains(&"--- User: cal | Status: FAILED ---".to_string()));

    let latest = runner.latest_scheduled_status().await.unwrap().unwrap();
    assert_eq!(latest.id, report.job_id);
    assert_eq!(latest.status, JobStatus::Completed);
}

#[tokio::test]
async fn user_triggered_scheduled_run_respects_preference() {
    let harness = Harness::new(Script::default());
    let trigger_user = harness
        .user(
            "dee",
            GOOD_PASSWORD,
            false,
            SettingsInput {
                enable_scheduled_ingestion: Some(true),
                job_webhook_url: Some(HOOK.into()),
                job_notification_preference: Some(NotificationPreference::Always),
                ..SettingsInput::default()
            },
        )
        .await;
    let runner = harness.runner();

    let report = runner
        .start_scheduled(ScheduledTrigger::User(trigger_user), day(2024, 6, 30), None)
        .await
        .unwrap();
    assert_eq!(report.status, JobStatus::Completed);

    let reports = harness.notifier.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].1.title, "Scheduled Ingestion Run Finished Successfully");
}
