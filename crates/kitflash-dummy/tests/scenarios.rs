//! End-to-end flash jobs against the dummy device

use std::io;
use std::sync::{mpsc as std_mpsc, Arc, Mutex};

use kitflash_core::job::{ERASING, PREPARING};
use kitflash_core::profile::SourceRef;
use kitflash_core::progress::WRITE_COMPLETE;
use kitflash_core::source::ByteSource;
use kitflash_core::{
    channel_observer, start, Error, FailureKind, FirmwareProvider, FlashContext, JobEvent,
    JobRequest, JobState, MemoryProvider, ProfileRegistry, Progress, Supervisor,
};
use kitflash_dummy::{DummyConfig, DummyProgrammer, FailPoint, Operation};
use tokio::sync::mpsc::UnboundedReceiver;

const RUNTIME_APP: &str = "esp32-20180511-v1.9.4.bin";
const RUNTIME_FS: &str = "pixel32-v0.1.0.img";

fn runtime_images() -> MemoryProvider {
    MemoryProvider::new()
        .with_image(RUNTIME_APP, vec![0xA5u8; 4096])
        .with_image(RUNTIME_FS, vec![0x3Cu8; 2048])
}

fn context(device: &DummyProgrammer, provider: MemoryProvider) -> FlashContext {
    FlashContext::new(
        Arc::new(ProfileRegistry::builtin()),
        Arc::new(provider),
        Arc::new(device.clone()),
    )
}

/// Collect events until the job's sender is gone
fn drain(mut rx: UnboundedReceiver<JobEvent>) -> Vec<JobEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.blocking_recv() {
        events.push(event);
    }
    events
}

/// Collect events up to and including the first terminal one
fn until_terminal(rx: &mut UnboundedReceiver<JobEvent>) -> Vec<JobEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.blocking_recv() {
        let done = event.is_terminal();
        events.push(event);
        if done {
            break;
        }
    }
    events
}

fn data(events: &[JobEvent]) -> Vec<&str> {
    events
        .iter()
        .filter_map(|e| match e {
            JobEvent::Data(message) => Some(message.as_str()),
            _ => None,
        })
        .collect()
}

fn failure_kind(events: &[JobEvent]) -> Option<FailureKind> {
    match events.last() {
        Some(JobEvent::Failure(failure)) => Some(failure.kind),
        _ => None,
    }
}

fn run(ctx: &FlashContext, port: &str, profile: &str, version: &str) -> (JobState, Vec<JobEvent>) {
    let (observer, rx) = channel_observer();
    let handle = start(ctx, JobRequest::new(port, profile, version), Arc::new(observer)).unwrap();
    let state = handle.wait();
    (state, drain(rx))
}

#[test]
fn test_runtime_profile_flashes_both_images() {
    let device = DummyProgrammer::new_default();
    let ctx = context(&device, runtime_images());

    let (state, events) = run(&ctx, "scenario-a", "runtime", "latest");
    assert_eq!(state, JobState::Completed);

    assert_eq!(
        data(&events),
        vec![
            PREPARING,
            ERASING,
            "Writing flash memory at 0x00001000 (4096 bytes).",
            WRITE_COMPLETE,
            "Writing flash memory at 0x00200000 (2048 bytes).",
            WRITE_COMPLETE,
        ]
    );
    assert_eq!(events.last(), Some(&JobEvent::Completed));
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);

    // Percentages restart per image and never repeat within one
    let percents: Vec<u8> = events
        .iter()
        .filter_map(|e| match e {
            JobEvent::Progress(Progress::Percent(p)) => Some(*p),
            _ => None,
        })
        .collect();
    assert_eq!(percents, vec![25, 50, 75, 100, 50, 100]);

    assert!(device.read(0x1000, 4096).iter().all(|&b| b == 0xA5));
    assert!(device.read(0x200000, 2048).iter().all(|&b| b == 0x3C));
    assert_eq!(device.read(0x0, 0x1000), vec![0xFF; 0x1000]);

    let ops = device.operations();
    assert_eq!(
        ops.iter().filter(|op| **op == Operation::Erase).count(),
        1
    );
    assert_eq!(ops.last(), Some(&Operation::HardReset));
    assert_eq!(device.connected_port(), None);
}

#[test]
fn test_alias_resolves_to_same_profile() {
    let device = DummyProgrammer::new_default();
    let ctx = context(&device, runtime_images());

    let (state, _) = run(&ctx, "scenario-alias", "MicroPython", "1.9.4");
    assert_eq!(state, JobState::Completed);
    assert!(device.operations().contains(&Operation::Write {
        address: 0x200000,
        len: 2048
    }));
}

#[test]
fn test_missing_image_fails_before_device_contact() {
    let device = DummyProgrammer::new_default();
    let provider = MemoryProvider::new().with_image(RUNTIME_APP, vec![0u8; 4096]);
    let watcher = provider.clone();
    let ctx = context(&device, provider);

    let (state, events) = run(&ctx, "scenario-b", "runtime", "");
    assert_eq!(
        state,
        JobState::Failed(FailureKind::SourceOpenFailure { address: 0x200000 })
    );
    assert_eq!(events.len(), 1);
    assert_eq!(
        failure_kind(&events),
        Some(FailureKind::SourceOpenFailure { address: 0x200000 })
    );
    assert!(data(&events).is_empty());

    // The first image was opened and released again
    assert_eq!(watcher.open_count(), 0);
    assert!(device.operations().is_empty());
}

#[test]
fn test_unknown_profile_is_only_event() {
    let device = DummyProgrammer::new_default();
    let provider = runtime_images();
    let watcher = provider.clone();
    let ctx = context(&device, provider);

    for (id, version) in [("foo", "latest"), ("runtime", "0.0.1")] {
        let (state, events) = run(&ctx, "scenario-c", id, version);
        assert_eq!(state, JobState::Failed(FailureKind::UnknownProfile));
        assert_eq!(events.len(), 1);
        assert_eq!(failure_kind(&events), Some(FailureKind::UnknownProfile));
    }
    assert_eq!(watcher.open_count(), 0);
    assert!(device.operations().is_empty());
}

#[test]
fn test_supervisor_rejects_second_job() {
    let device = DummyProgrammer::new_default();
    let supervisor = Supervisor::new(context(&device, runtime_images()));
    let mut events = supervisor.subscribe_channel();

    let hold = device.hold();
    let first = supervisor
        .submit("scenario-busy-1", "runtime", "latest")
        .unwrap();

    let err = supervisor
        .submit("scenario-busy-2", "factory-restore", "latest")
        .unwrap_err();
    assert!(matches!(err, Error::JobAlreadyRunning { ref port } if port == "scenario-busy-1"));
    assert_eq!(err.kind(), FailureKind::JobAlreadyRunning);

    drop(hold);
    let events_first = until_terminal(&mut events);
    assert_eq!(events_first.last(), Some(&JobEvent::Completed));
    assert_eq!(first.wait(), JobState::Completed);

    // The rejected request never reached the device
    assert!(device.operations().iter().all(|op| match op {
        Operation::Detect { port, .. } => port == "scenario-busy-1",
        _ => true,
    }));

    // Idle again: the next request is accepted
    assert!(!supervisor.is_busy());
    let second = supervisor
        .submit("scenario-busy-2", "runtime", "latest")
        .unwrap();
    assert_eq!(until_terminal(&mut events).last(), Some(&JobEvent::Completed));
    assert_eq!(second.wait(), JobState::Completed);
}

#[test]
fn test_same_port_rejected_outside_supervisor() {
    let device = DummyProgrammer::new_default();
    let ctx = context(&device, runtime_images());

    let hold = device.hold();
    let (observer, rx) = channel_observer();
    let first = start(
        &ctx,
        JobRequest::new("scenario-lock", "runtime", ""),
        Arc::new(observer),
    )
    .unwrap();

    let (other, _other_rx) = channel_observer();
    let err = start(
        &ctx,
        JobRequest::new("scenario-lock", "runtime", ""),
        Arc::new(other),
    )
    .unwrap_err();
    assert!(matches!(err, Error::JobAlreadyRunning { .. }));

    drop(hold);
    assert_eq!(first.wait(), JobState::Completed);
    assert_eq!(drain(rx).last(), Some(&JobEvent::Completed));

    // Released with the job
    let (observer, rx) = channel_observer();
    let again = start(
        &ctx,
        JobRequest::new("scenario-lock", "runtime", ""),
        Arc::new(observer),
    )
    .unwrap();
    assert_eq!(again.wait(), JobState::Completed);
    drop(rx);
}

#[test]
fn test_failures_map_to_kinds_and_release_everything() {
    let cases = [
        (FailPoint::Detect, FailureKind::DeviceDetectFailure, false),
        (FailPoint::Stub, FailureKind::DeviceDetectFailure, false),
        (FailPoint::ChangeBaud, FailureKind::DeviceDetectFailure, false),
        (FailPoint::FlashParams, FailureKind::DeviceDetectFailure, false),
        (FailPoint::Erase, FailureKind::WriteFailure, true),
        (FailPoint::Write { address: 0x200000 }, FailureKind::WriteFailure, true),
        (FailPoint::Reset, FailureKind::WriteFailure, true),
    ];

    for (index, (fail_at, kind, erased)) in cases.into_iter().enumerate() {
        let device = DummyProgrammer::new(DummyConfig {
            fail_at: Some(fail_at),
            ..Default::default()
        });
        let provider = runtime_images();
        let watcher = provider.clone();
        let ctx = context(&device, provider);

        let port = format!("scenario-fail-{}", index);
        let (state, events) = run(&ctx, &port, "runtime", "latest");

        assert_eq!(state, JobState::Failed(kind), "{:?}", fail_at);
        assert_eq!(failure_kind(&events), Some(kind), "{:?}", fail_at);
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
        assert_eq!(data(&events).contains(&ERASING), erased, "{:?}", fail_at);
        assert_eq!(watcher.open_count(), 0, "{:?}", fail_at);
        assert_eq!(device.connected_port(), None, "{:?}", fail_at);
        assert!(!kitflash_core::port_lock::is_reserved(&port));
    }
}

#[test]
fn test_write_failure_after_first_image() {
    let device = DummyProgrammer::new(DummyConfig {
        fail_at: Some(FailPoint::Write { address: 0x200000 }),
        ..Default::default()
    });
    let ctx = context(&device, runtime_images());

    let (_, events) = run(&ctx, "scenario-partial", "runtime", "latest");
    let messages = data(&events);
    // First image completed, second started and never finished
    assert_eq!(messages.iter().filter(|m| **m == WRITE_COMPLETE).count(), 1);
    assert_eq!(
        messages.last(),
        Some(&"Writing flash memory at 0x00200000 (2048 bytes).")
    );
    assert!(!device.operations().contains(&Operation::HardReset));
}

#[test]
fn test_overlapping_images_rejected() {
    let device = DummyProgrammer::new_default();
    let mut registry = ProfileRegistry::new();
    registry
        .add_version(
            "overlap",
            "1",
            vec![
                kitflash_core::ImageDescriptor::new(0x1000, "big.bin"),
                kitflash_core::ImageDescriptor::new(0x1800, "small.bin"),
            ],
            true,
        )
        .unwrap();
    let provider = MemoryProvider::new()
        .with_image("big.bin", vec![0u8; 0x1000])
        .with_image("small.bin", vec![0u8; 16]);
    let watcher = provider.clone();
    let ctx = FlashContext::new(Arc::new(registry), Arc::new(provider), Arc::new(device.clone()));

    let (state, events) = run(&ctx, "scenario-overlap", "overlap", "latest");
    let kind = FailureKind::ImageOverlap {
        first: 0x1000,
        second: 0x1800,
    };
    assert_eq!(state, JobState::Failed(kind));
    assert_eq!(events.len(), 1);
    assert_eq!(watcher.open_count(), 0);
    assert!(device.operations().is_empty());
}

/// Blocks the first open until released
struct GatedProvider {
    inner: MemoryProvider,
    entered: Mutex<std_mpsc::Sender<()>>,
    release: Mutex<std_mpsc::Receiver<()>>,
}

impl FirmwareProvider for GatedProvider {
    fn open(&self, source: &SourceRef) -> io::Result<Box<dyn ByteSource>> {
        let _ = self.entered.lock().unwrap().send(());
        let _ = self.release.lock().unwrap().recv();
        self.inner.open(source)
    }
}

#[test]
fn test_cancel_before_detection() {
    let device = DummyProgrammer::new_default();
    let (entered_tx, entered_rx) = std_mpsc::channel();
    let (release_tx, release_rx) = std_mpsc::channel();
    let inner = runtime_images();
    let watcher = inner.clone();
    let provider = GatedProvider {
        inner,
        entered: Mutex::new(entered_tx),
        release: Mutex::new(release_rx),
    };
    let ctx = FlashContext::new(
        Arc::new(ProfileRegistry::builtin()),
        Arc::new(provider),
        Arc::new(device.clone()),
    );

    let supervisor = Supervisor::new(ctx);
    let mut events = supervisor.subscribe_channel();
    let handle = supervisor
        .submit("scenario-cancel", "runtime", "latest")
        .unwrap();

    entered_rx.recv().unwrap();
    assert!(supervisor.cancel());
    // Dropping the sender lets every later open through as well
    drop(release_tx);

    let events = until_terminal(&mut events);
    assert_eq!(events.len(), 1);
    assert_eq!(failure_kind(&events), Some(FailureKind::Cancelled));
    assert_eq!(handle.wait(), JobState::Failed(FailureKind::Cancelled));
    assert_eq!(watcher.open_count(), 0);
    assert!(device.operations().is_empty());
    assert!(!supervisor.is_busy());
}

#[test]
fn test_fixed_flash_size_skips_detection() {
    let device = DummyProgrammer::new_default();
    let config = kitflash_core::FlashConfig::from_toml_str(
        "[flash]\nflash_size = \"4MB\"\nflash_baud = 460800\n",
    )
    .unwrap();
    let ctx = context(&device, runtime_images()).with_config(config);

    let (state, _) = run(&ctx, "scenario-fixed", "runtime", "latest");
    assert_eq!(state, JobState::Completed);

    let ops = device.operations();
    assert!(!ops.contains(&Operation::DetectFlashSize));
    assert!(ops.contains(&Operation::ChangeBaud(460_800)));
    assert!(ops.iter().any(|op| matches!(
        op,
        Operation::SetFlashParams(params) if params.size == 4 * 1024 * 1024
    )));
}
