//! Job events and observers
//!
//! A job emits a totally ordered stream of [`JobEvent`]s ending in exactly one
//! terminal event (`Completed` or `Failure`). Observers are called on the job's
//! worker thread and should hand the event off quickly.

use core::fmt;

use crate::error::FailureKind;
use crate::job::JobState;
use tokio::sync::mpsc;

/// Progress report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// The job entered a new phase
    Phase(JobState),
    /// Write progress of the current image, 0 to 100
    Percent(u8),
}

/// Terminal failure of a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    /// Failure classification
    pub kind: FailureKind,
    /// Human readable message
    pub message: String,
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// An event emitted by a flash job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    /// Informational message for the user
    Data(String),
    /// Phase or percentage progress
    Progress(Progress),
    /// The job failed; no further events follow
    Failure(Failure),
    /// The job finished successfully; no further events follow
    Completed,
}

impl JobEvent {
    /// Whether this event ends the job's stream
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failure(_) | Self::Completed)
    }
}

/// Receives job events
pub trait Observer: Send + Sync {
    /// Called for every event of a job running on `port`
    fn on_event(&self, port: &str, event: &JobEvent);
}

/// Forwards events into an unbounded channel
///
/// The receiving side can be drained from any thread, either with
/// `blocking_recv` or from async code with `recv().await`.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<JobEvent>,
}

impl ChannelObserver {
    /// Wrap an existing sender
    pub fn new(tx: mpsc::UnboundedSender<JobEvent>) -> Self {
        Self { tx }
    }
}

impl Observer for ChannelObserver {
    fn on_event(&self, _port: &str, event: &JobEvent) {
        // A dropped receiver just means nobody is listening any more
        let _ = self.tx.send(event.clone());
    }
}

/// Create a channel observer and the receiver for its events
pub fn channel_observer() -> (ChannelObserver, mpsc::UnboundedReceiver<JobEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ChannelObserver::new(tx), rx)
}

/// Writes events to the `log` facade
#[derive(Debug, Clone, Copy, Default)]
pub struct LogObserver;

impl Observer for LogObserver {
    fn on_event(&self, port: &str, event: &JobEvent) {
        match event {
            JobEvent::Data(message) => log::info!("[{}] {}", port, message),
            JobEvent::Progress(Progress::Phase(state)) => log::debug!("[{}] phase: {}", port, state),
            JobEvent::Progress(Progress::Percent(pct)) => log::trace!("[{}] {}%", port, pct),
            JobEvent::Failure(failure) => {
                log::error!("[{}] {} ({})", port, failure.message, failure.kind)
            }
            JobEvent::Completed => log::info!("[{}] flash finished", port),
        }
    }
}
