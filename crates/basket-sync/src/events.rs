//! Producer side of the job event stream.

use basket_core::JobEvent;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info};

/// Pushes typed events to a single consumer and mirrors them into the log.
///
/// The consumer sees the end of the stream once every clone of the emitter is
/// dropped; the run's `Result` is the completion signal.
#[derive(Debug, Clone)]
pub struct EventEmitter {
    tx: Option<UnboundedSender<JobEvent>>,
}

impl EventEmitter {
    pub fn channel() -> (Self, UnboundedReceiver<JobEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Emitter that only logs.
    pub fn detached() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: JobEvent) {
        match &event {
            JobEvent::Status(msg) => info!(event = "status", "{msg}"),
            JobEvent::Progress { value, max } => debug!(event = "progress", value, max),
            JobEvent::Error(msg) => error!(event = "error", "{msg}"),
            JobEvent::Done(msg) => info!(event = "done", "{msg}"),
        }
        if let Some(tx) = &self.tx {
            // A consumer that went away does not stop the run.
            let _ = tx.send(event);
        }
    }

    pub fn status(&self, msg: impl Into<String>) {
        self.emit(JobEvent::Status(msg.into()));
    }

    pub fn progress(&self, value: u64, max: u64) {
        self.emit(JobEvent::Progress { value, max });
    }

    pub fn error(&self, msg: impl Into<String>) {
        self.emit(JobEvent::Error(msg.into()));
    }

    pub fn done(&self, msg: impl Into<String>) {
        self.emit(JobEvent::Done(msg.into()));
    }
}
