//! Flash job
//!
//! One run of "flash profile P to port D" on a dedicated worker thread. The
//! job walks a strictly sequential state machine:
//!
//! ```text
//! Idle ─▶ Detecting ─▶ StubRunning ─▶ BaudChanged ─▶ FlashParamsSet
//!      ─▶ Erasing ─▶ Writing ─▶ Resetting ─▶ Completed
//!
//! any non-terminal state ─▶ Failed(kind)
//! ```
//!
//! Before leaving `Idle` the job resolves the profile and opens every image.
//! An unknown profile fails right there, before any image is opened and
//! before the port is touched. Nothing is retried: a failure after the erase
//! leaves the device in an undefined state and the whole sequence has to be
//! started again.
//!
//! The caller only learns about the job through its observer. Opened images,
//! the programmer connection and the port reservation are all released before
//! the terminal event is emitted.

use core::fmt;
use std::slice;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::config::{FlashConfig, FlashSize};
use crate::error::{Error, FailureKind, Result};
use crate::event::{Failure, JobEvent, Observer, Progress};
use crate::port_lock::PortLease;
use crate::profile::{find_overlap, FirmwareProfile, ProfileRegistry};
use crate::programmer::{ChipProgrammer, ProgrammerError, Stub};
use crate::progress::ProgressInterpreter;
use crate::source::{FirmwareProvider, FlashImage};

/// Notice emitted once the images are open, before the device is contacted
pub const PREPARING: &str = "Preparing to flash memory. This can take a while.";

/// Notice emitted before the flash is erased
pub const ERASING: &str = "Erasing flash memory.";

/// Prefix of the notice emitted before each image is written
pub const WRITING: &str = "Writing flash memory";

/// State of a flash job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Resolving the profile and opening images
    Idle,
    /// Opening the port and detecting the chip
    Detecting,
    /// Flasher stub uploaded and running
    StubRunning,
    /// Connection switched to the high-speed baud rate
    BaudChanged,
    /// Flash size known and parameters applied
    FlashParamsSet,
    /// Erasing the flash
    Erasing,
    /// Writing images
    Writing,
    /// Resetting the device
    Resetting,
    /// Finished successfully
    Completed,
    /// Finished with an error
    Failed(FailureKind),
}

impl JobState {
    /// Whether the job has finished
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed(_))
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Detecting => write!(f, "detecting chip"),
            Self::StubRunning => write!(f, "stub running"),
            Self::BaudChanged => write!(f, "baud rate changed"),
            Self::FlashParamsSet => write!(f, "flash parameters set"),
            Self::Erasing => write!(f, "erasing"),
            Self::Writing => write!(f, "writing"),
            Self::Resetting => write!(f, "resetting"),
            Self::Completed => write!(f, "completed"),
            Self::Failed(kind) => write!(f, "failed ({})", kind),
        }
    }
}

/// Collaborators shared by every job
#[derive(Clone)]
pub struct FlashContext {
    /// Profile lookup
    pub registry: Arc<ProfileRegistry>,
    /// Firmware byte sources
    pub provider: Arc<dyn FirmwareProvider>,
    /// Chip programmer
    pub programmer: Arc<dyn ChipProgrammer>,
    /// Flashing parameters
    pub config: FlashConfig,
}

impl FlashContext {
    /// Create a context with the default flash configuration
    pub fn new(
        registry: Arc<ProfileRegistry>,
        provider: Arc<dyn FirmwareProvider>,
        programmer: Arc<dyn ChipProgrammer>,
    ) -> Self {
        Self {
            registry,
            provider,
            programmer,
            config: FlashConfig::default(),
        }
    }

    /// Replace the flash configuration
    pub fn with_config(mut self, config: FlashConfig) -> Self {
        self.config = config;
        self
    }
}

impl fmt::Debug for FlashContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlashContext")
            .field("profiles", &self.registry.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// What to flash where
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    /// Serial port of the device
    pub port: String,
    /// Profile identifier or alias
    pub profile_id: String,
    /// Profile version, or `latest`
    pub version: String,
}

impl JobRequest {
    /// Create a request
    pub fn new(
        port: impl Into<String>,
        profile_id: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            port: port.into(),
            profile_id: profile_id.into(),
            version: version.into(),
        }
    }
}

const GATE_OPEN: u8 = 0;
const GATE_CANCELLED: u8 = 1;
const GATE_COMMITTED: u8 = 2;

/// Cancels a job before it contacts the device
///
/// Once the job has entered `Detecting` it can no longer be cancelled:
/// interrupting an erase or write could leave the device unbootable.
#[derive(Debug, Clone)]
pub struct CancelToken(Arc<AtomicU8>);

impl CancelToken {
    fn new() -> Self {
        Self(Arc::new(AtomicU8::new(GATE_OPEN)))
    }

    /// Request cancellation
    ///
    /// Returns `true` if the job will stop without touching the device,
    /// `false` if it is already past the point of no return.
    pub fn cancel(&self) -> bool {
        match self
            .0
            .compare_exchange(GATE_OPEN, GATE_CANCELLED, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => true,
            Err(current) => current == GATE_CANCELLED,
        }
    }

    /// Whether cancellation took effect
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst) == GATE_CANCELLED
    }

    /// Pass the point of no return; fails if already cancelled
    fn commit(&self) -> bool {
        self.0
            .compare_exchange(GATE_OPEN, GATE_COMMITTED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// Handle to a running job
#[derive(Debug)]
pub struct JobHandle {
    port: String,
    cancel: CancelToken,
    thread: JoinHandle<JobState>,
}

impl JobHandle {
    /// Port the job is flashing
    pub fn port(&self) -> &str {
        &self.port
    }

    /// Cancel the job if it has not contacted the device yet
    pub fn cancel(&self) -> bool {
        self.cancel.cancel()
    }

    /// Token that can cancel this job from elsewhere
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Block until the worker exits and return its final state
    pub fn wait(self) -> JobState {
        self.thread
            .join()
            .unwrap_or(JobState::Failed(FailureKind::Internal))
    }
}

/// Start flashing `request` on a new worker thread
///
/// Returns immediately. Fails synchronously only if the port name is empty,
/// the port is already reserved by another job, or the thread cannot be
/// spawned; every other outcome reaches `observer` as events.
pub fn start(
    ctx: &FlashContext,
    request: JobRequest,
    observer: Arc<dyn Observer>,
) -> Result<JobHandle> {
    if request.port.trim().is_empty() {
        return Err(Error::InvalidPort);
    }

    let lease = PortLease::acquire(&request.port)?;
    let cancel = CancelToken::new();
    let port = request.port.clone();

    let worker = Worker {
        ctx: ctx.clone(),
        request,
        lease,
        cancel: cancel.clone(),
        emitter: Emitter::new(port.clone(), observer),
        state: JobState::Idle,
    };

    let thread = thread::Builder::new()
        .name(format!("kitflash {}", port))
        .spawn(move || worker.run())
        .map_err(Error::Spawn)?;

    Ok(JobHandle {
        port,
        cancel,
        thread,
    })
}

/// Delivers events and enforces a single terminal event
struct Emitter {
    port: String,
    observer: Arc<dyn Observer>,
    armed: bool,
    finished: bool,
}

impl Emitter {
    fn new(port: String, observer: Arc<dyn Observer>) -> Self {
        Self {
            port,
            observer,
            armed: false,
            finished: false,
        }
    }

    fn emit(&mut self, event: JobEvent) {
        if self.finished {
            log::warn!("[{}] dropping event after job end: {:?}", self.port, event);
            return;
        }
        self.finished = event.is_terminal();
        self.observer.on_event(&self.port, &event);
    }
}

impl Drop for Emitter {
    fn drop(&mut self) {
        // Worker unwound without reporting; observers still need an ending
        if self.armed && !self.finished {
            self.emit(JobEvent::Failure(Failure {
                kind: FailureKind::Internal,
                message: "flash job terminated unexpectedly".to_string(),
            }));
        }
    }
}

// Field order matters: the lease is released before the emitter's drop guard runs
struct Worker {
    ctx: FlashContext,
    request: JobRequest,
    lease: PortLease,
    cancel: CancelToken,
    emitter: Emitter,
    state: JobState,
}

impl Worker {
    fn run(mut self) -> JobState {
        self.emitter.armed = true;
        log::info!(
            "Starting flash of '{}' ({}) on {}",
            self.request.profile_id,
            self.request.version,
            self.request.port
        );

        let result = self.execute();

        let Worker {
            request,
            lease,
            mut emitter,
            ..
        } = self;
        drop(lease);

        match result {
            Ok(()) => {
                log::info!("Flash of {} finished", request.port);
                emitter.emit(JobEvent::Completed);
                JobState::Completed
            }
            Err(err) => {
                let kind = err.kind();
                log::error!("Flash of {} failed: {}", request.port, err);
                emitter.emit(JobEvent::Failure(Failure {
                    kind,
                    message: err.to_string(),
                }));
                JobState::Failed(kind)
            }
        }
    }

    fn execute(&mut self) -> Result<()> {
        let profile = self
            .ctx
            .registry
            .resolve(&self.request.profile_id, &self.request.version)?;
        log::info!(
            "Resolved profile {} version {} ({} images)",
            profile.id(),
            profile.version(),
            profile.images().len()
        );

        let mut images = self.open_images(&profile)?;

        let regions: Vec<(u32, u64)> = images.iter().map(|i| (i.address(), i.len())).collect();
        if let Some((first, second)) = find_overlap(&regions) {
            return Err(Error::ImageOverlap { first, second });
        }

        if !self.cancel.commit() {
            log::info!("Flash of {} cancelled before detection", self.request.port);
            return Err(Error::Cancelled);
        }

        self.emitter.emit(JobEvent::Data(PREPARING.to_string()));
        let (mut stub, flash_size) = self.detect_and_prepare()?;

        for image in &images {
            if image.address() as u64 + image.len() > flash_size as u64 {
                return Err(Error::Write(ProgrammerError::OutOfBounds {
                    address: image.address(),
                    len: image.len(),
                    flash_size,
                }));
            }
        }

        self.erase_and_write(stub.as_mut(), &mut images)?;

        self.enter(JobState::Resetting);
        stub.hard_reset().map_err(Error::Write)?;
        Ok(())
    }

    fn open_images(&self, profile: &FirmwareProfile) -> Result<Vec<FlashImage>> {
        // Collecting stops at the first failure and drops what was opened so far
        profile
            .images()
            .iter()
            .map(|desc| {
                let source = self
                    .ctx
                    .provider
                    .open(&desc.source)
                    .map_err(|source| Error::SourceOpen {
                        address: desc.address,
                        source,
                    })?;
                log::debug!(
                    "Opened {} for 0x{:08X} ({} bytes)",
                    desc.source,
                    desc.address,
                    source.len()
                );
                Ok(FlashImage::new(desc.address, source))
            })
            .collect()
    }

    fn detect_and_prepare(&mut self) -> Result<(Box<dyn Stub>, u32)> {
        let port = self.request.port.clone();
        let config = self.ctx.config.clone();
        let programmer = Arc::clone(&self.ctx.programmer);
        let detect = |source: ProgrammerError| Error::DeviceDetect {
            port: port.clone(),
            source,
        };

        self.enter(JobState::Detecting);
        let chip = programmer
            .detect_chip(&port, config.initial_baud, config.trace)
            .map_err(detect)?;
        log::info!("Detected {} on {}", chip.description(), port);

        self.enter(JobState::StubRunning);
        let mut stub = chip.run_stub().map_err(detect)?;

        self.enter(JobState::BaudChanged);
        stub.change_baud(config.flash_baud).map_err(detect)?;

        self.enter(JobState::FlashParamsSet);
        let flash_size = match config.flash_size {
            FlashSize::Detect => stub.detect_flash_size().map_err(detect)?,
            FlashSize::Fixed(size) => size,
        };
        stub.set_flash_params(&config.params(flash_size))
            .map_err(detect)?;
        log::debug!("Flash size is {} bytes", flash_size);

        Ok((stub, flash_size))
    }

    fn erase_and_write(&mut self, stub: &mut dyn Stub, images: &mut [FlashImage]) -> Result<()> {
        self.enter(JobState::Erasing);
        self.emitter.emit(JobEvent::Data(ERASING.to_string()));
        stub.erase().map_err(Error::Write)?;

        self.enter(JobState::Writing);
        for image in images.iter_mut() {
            self.emitter.emit(JobEvent::Data(format!(
                "{} at 0x{:08X} ({} bytes).",
                WRITING,
                image.address(),
                image.len()
            )));

            let mut interpreter = ProgressInterpreter::new();
            let emitter = &mut self.emitter;
            stub.write(slice::from_mut(image), &mut |chunk: &[u8]| {
                for event in interpreter.feed(chunk) {
                    emitter.emit(event);
                }
            })
            .map_err(Error::Write)?;
        }

        Ok(())
    }

    fn enter(&mut self, state: JobState) {
        log::debug!("[{}] {} -> {}", self.request.port, self.state, state);
        self.state = state;
        self.emitter.emit(JobEvent::Progress(Progress::Phase(state)));
    }
}
