//! Flash command implementation

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use kitflash_core::job::WRITING;
use kitflash_core::progress::WRITE_COMPLETE;
use kitflash_core::{
    BundledFirmware, ChipProgrammer, FlashConfig, FlashContext, JobEvent, ProfileRegistry,
    Progress, Supervisor,
};

/// What to flash and how
pub struct FlashArgs<'a> {
    /// Serial port
    pub port: &'a str,
    /// Profile identifier or alias
    pub profile: &'a str,
    /// Profile version
    pub version: &'a str,
    /// Firmware directory
    pub firmware_dir: &'a Path,
}

fn create_bar_style() -> Result<ProgressStyle, Box<dyn std::error::Error>> {
    Ok(ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos:>3}% {msg}")?
        .progress_chars("#>-"))
}

fn create_spinner_style() -> Result<ProgressStyle, Box<dyn std::error::Error>> {
    Ok(ProgressStyle::default_spinner().template("{spinner:.green} {msg}")?)
}

/// Renders job events with indicatif
struct EventDisplay {
    multi: MultiProgress,
    current: Option<ProgressBar>,
}

impl EventDisplay {
    fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            current: None,
        }
    }

    fn spinner(&mut self, message: &str) {
        self.finish(None);
        let pb = self.multi.add(ProgressBar::new_spinner());
        pb.set_style(create_spinner_style().unwrap_or_else(|_| ProgressStyle::default_spinner()));
        pb.set_message(message.to_string());
        pb.enable_steady_tick(Duration::from_millis(100));
        self.current = Some(pb);
    }

    fn bar(&mut self, message: &str) {
        self.finish(None);
        let pb = self.multi.add(ProgressBar::new(100));
        pb.set_style(create_bar_style().unwrap_or_else(|_| ProgressStyle::default_bar()));
        pb.set_message(message.to_string());
        self.current = Some(pb);
    }

    fn finish(&mut self, message: Option<&str>) {
        if let Some(pb) = self.current.take() {
            match message {
                Some(message) => pb.finish_with_message(message.to_string()),
                None => pb.finish(),
            }
        }
    }

    fn abandon(&mut self) {
        if let Some(pb) = self.current.take() {
            pb.abandon();
        }
    }

    fn show(&mut self, event: &JobEvent) {
        match event {
            JobEvent::Data(message) if message.starts_with(WRITING) => self.bar(message),
            JobEvent::Data(message) if message == WRITE_COMPLETE => self.finish(Some(message)),
            JobEvent::Data(message) => self.spinner(message),
            JobEvent::Progress(Progress::Percent(percent)) => {
                if let Some(pb) = &self.current {
                    pb.set_position(u64::from(*percent));
                }
            }
            JobEvent::Progress(Progress::Phase(state)) => log::debug!("Phase: {}", state),
            JobEvent::Completed => self.finish(Some("done")),
            JobEvent::Failure(_) => self.abandon(),
        }
    }
}

/// Flash a profile and wait for the job to end
pub fn run(
    args: &FlashArgs<'_>,
    registry: ProfileRegistry,
    programmer: Arc<dyn ChipProgrammer>,
    config: FlashConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    if !args.firmware_dir.is_dir() {
        log::warn!(
            "Firmware directory {} does not exist",
            args.firmware_dir.display()
        );
    }

    let ctx = FlashContext::new(
        Arc::new(registry),
        Arc::new(BundledFirmware::new(args.firmware_dir)),
        programmer,
    )
    .with_config(config);
    let supervisor = Supervisor::new(ctx);
    let mut events = supervisor.subscribe_channel();

    let handle = supervisor.submit(args.port, args.profile, args.version)?;

    let mut display = EventDisplay::new();
    let mut outcome: Result<(), Box<dyn std::error::Error>> =
        Err("flash job ended without a result".into());
    while let Some(event) = events.blocking_recv() {
        display.show(&event);
        match event {
            JobEvent::Completed => {
                outcome = Ok(());
                break;
            }
            JobEvent::Failure(failure) => {
                outcome = Err(format!("Flashing failed: {}", failure).into());
                break;
            }
            _ => {}
        }
    }

    let state = handle.wait();
    log::debug!("Job on {} ended in state {}", args.port, state);

    if outcome.is_ok() {
        println!(
            "Flashed '{}' ({}) to {}",
            args.profile, args.version, args.port
        );
    }
    outcome
}
