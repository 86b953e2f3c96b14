//! Job supervisor
//!
//! Accepts flash requests, allows at most one active job and fans the job's
//! events out to every subscribed observer. The active slot is cleared before
//! the terminal event is relayed, so an observer reacting to `Completed` may
//! submit the next job right away.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{Error, Result};
use crate::event::{channel_observer, JobEvent, Observer};
use crate::job::{self, CancelToken, FlashContext, JobHandle, JobRequest};
use tokio::sync::mpsc;

/// Front door for flash jobs
pub struct Supervisor {
    ctx: FlashContext,
    relay: Arc<Relay>,
}

struct ActiveJob {
    port: String,
    cancel: CancelToken,
}

#[derive(Default)]
struct Relay {
    active: Mutex<Option<ActiveJob>>,
    observers: Mutex<Vec<Arc<dyn Observer>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Observer for Relay {
    fn on_event(&self, port: &str, event: &JobEvent) {
        if event.is_terminal() {
            let mut active = lock(&self.active);
            if active.as_ref().is_some_and(|job| job.port == port) {
                *active = None;
            }
        }

        // Snapshot so observers may subscribe from inside a callback
        let observers = lock(&self.observers).clone();
        for observer in observers {
            observer.on_event(port, event);
        }
    }
}

impl Supervisor {
    /// Create a supervisor over the given collaborators
    pub fn new(ctx: FlashContext) -> Self {
        Self {
            ctx,
            relay: Arc::new(Relay::default()),
        }
    }

    /// Shared job context
    pub fn context(&self) -> &FlashContext {
        &self.ctx
    }

    /// Add an observer for all future events
    pub fn subscribe(&self, observer: Arc<dyn Observer>) {
        lock(&self.relay.observers).push(observer);
    }

    /// Subscribe through an unbounded channel
    pub fn subscribe_channel(&self) -> mpsc::UnboundedReceiver<JobEvent> {
        let (observer, rx) = channel_observer();
        self.subscribe(Arc::new(observer));
        rx
    }

    /// Start flashing `profile_id` (at `version`) onto the device at `port`
    ///
    /// Fails with [`Error::JobAlreadyRunning`] while another job is active;
    /// the running job is not affected.
    pub fn submit(&self, port: &str, profile_id: &str, version: &str) -> Result<JobHandle> {
        let mut active = lock(&self.relay.active);
        if let Some(job) = active.as_ref() {
            log::warn!("Rejecting flash of {}: job on {} still running", port, job.port);
            return Err(Error::JobAlreadyRunning {
                port: job.port.clone(),
            });
        }

        // The worker's terminal event blocks on `active` until the slot is set
        let relay: Arc<dyn Observer> = self.relay.clone();
        let handle = job::start(&self.ctx, JobRequest::new(port, profile_id, version), relay)?;
        *active = Some(ActiveJob {
            port: handle.port().to_string(),
            cancel: handle.cancel_token(),
        });
        log::debug!("Accepted flash job on {}", port);
        Ok(handle)
    }

    /// Port of the active job, if any
    pub fn active_port(&self) -> Option<String> {
        lock(&self.relay.active).as_ref().map(|job| job.port.clone())
    }

    /// Whether a job is active
    pub fn is_busy(&self) -> bool {
        lock(&self.relay.active).is_some()
    }

    /// Cancel the active job if it has not contacted the device yet
    pub fn cancel(&self) -> bool {
        lock(&self.relay.active)
            .as_ref()
            .is_some_and(|job| job.cancel.cancel())
    }
}

impl core::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Supervisor")
            .field("active_port", &self.active_port())
            .finish_non_exhaustive()
    }
}
