//! kitflash-core - Firmware flash orchestration
//!
//! This crate flashes named firmware profiles onto a microcontroller without
//! blocking the caller. The serial bootloader protocol itself is provided by
//! an external [`ChipProgrammer`](programmer::ChipProgrammer) implementation
//! and the firmware bytes come from a
//! [`FirmwareProvider`](source::FirmwareProvider).
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐ submit ┌──────────────┐ spawn ┌───────────────────────┐
//! │    caller    │───────▶│  Supervisor  │──────▶│ FlashJob worker thread│
//! └──────────────┘        └──────────────┘       └───────────────────────┘
//!        ▲                       │ relay                     │
//!        │      JobEvent         ▼                           ▼
//!        └──────────────── observers ◀── events ── ProfileRegistry
//!                                                   FirmwareProvider
//!                                                   ChipProgrammer
//!                                                   ProgressInterpreter
//! ```
//!
//! # Example
//!
//! ```ignore
//! use kitflash_core::{FlashContext, ProfileRegistry, Supervisor, JobEvent};
//! use std::sync::Arc;
//!
//! let ctx = FlashContext::new(
//!     Arc::new(ProfileRegistry::builtin()),
//!     Arc::new(BundledFirmware::new("firmware")),
//!     programmer,
//! );
//! let supervisor = Supervisor::new(ctx);
//! let mut events = supervisor.subscribe_channel();
//! let _handle = supervisor.submit("/dev/ttyUSB0", "runtime", "latest")?;
//!
//! while let Some(event) = events.blocking_recv() {
//!     println!("{:?}", event);
//!     if event.is_terminal() {
//!         break;
//!     }
//! }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod error;
pub mod event;
pub mod job;
pub mod port_lock;
pub mod profile;
pub mod programmer;
pub mod progress;
pub mod source;
pub mod supervisor;

pub use config::{FlashConfig, FlashFreq, FlashMode, FlashParams, FlashSize};
pub use error::{Error, FailureKind, Result};
pub use event::{channel_observer, ChannelObserver, Failure, JobEvent, LogObserver, Observer, Progress};
pub use job::{start, CancelToken, FlashContext, JobHandle, JobRequest, JobState};
pub use profile::{FirmwareProfile, ImageDescriptor, ProfileRegistry, SourceRef};
pub use programmer::{Chip, ChipProgrammer, ProgrammerError, Stub};
pub use progress::ProgressInterpreter;
pub use source::{BundledFirmware, ByteSource, FirmwareProvider, FlashImage, MemoryProvider};
pub use supervisor::Supervisor;
