//! Error types for kitflash-core
//!
//! [`Error`] is the job-level taxonomy. Every variant is terminal for the job
//! that raised it and none of them are retried internally. Errors raised while
//! a job is being accepted (`JobAlreadyRunning`, an empty port name) are
//! returned synchronously; everything else reaches observers as a single
//! [`JobEvent::Failure`](crate::event::JobEvent::Failure) carrying a
//! [`FailureKind`].

use core::fmt;

use crate::programmer::ProgrammerError;
use thiserror::Error;

/// Classification of a job failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// The requested profile (or version) is not in the registry
    UnknownProfile,
    /// A firmware image could not be opened
    SourceOpenFailure {
        /// Flash address of the first image that failed to open
        address: u32,
    },
    /// Two images of the profile would overwrite each other
    ImageOverlap {
        /// Address of the lower image
        first: u32,
        /// Address of the image that starts inside the lower one
        second: u32,
    },
    /// The port could not be opened or no compatible chip responded
    DeviceDetectFailure,
    /// Erase, write or reset failed; device state is undefined
    WriteFailure,
    /// Another job already owns the device
    JobAlreadyRunning,
    /// The job was cancelled before it contacted the device
    Cancelled,
    /// The worker could not be started or terminated abnormally
    Internal,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownProfile => write!(f, "unknown profile"),
            Self::SourceOpenFailure { address } => {
                write!(f, "source open failure at 0x{:08X}", address)
            }
            Self::ImageOverlap { first, second } => {
                write!(f, "image overlap (0x{:08X} / 0x{:08X})", first, second)
            }
            Self::DeviceDetectFailure => write!(f, "device detect failure"),
            Self::WriteFailure => write!(f, "write failure"),
            Self::JobAlreadyRunning => write!(f, "job already running"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Internal => write!(f, "internal error"),
        }
    }
}

/// Job-level error
#[derive(Debug, Error)]
pub enum Error {
    /// Profile identifier or version not known to the registry
    #[error("unknown firmware profile '{id}' (version '{version}')")]
    UnknownProfile {
        /// Requested profile identifier
        id: String,
        /// Requested version
        version: String,
    },

    /// A byte source could not be opened
    #[error("could not open firmware image for 0x{address:08X}: {source}")]
    SourceOpen {
        /// Address of the failing image
        address: u32,
        /// Underlying provider error
        #[source]
        source: std::io::Error,
    },

    /// Image regions overlap once their lengths are known
    #[error("firmware images at 0x{first:08X} and 0x{second:08X} overlap")]
    ImageOverlap {
        /// Address of the lower image
        first: u32,
        /// Address of the overlapping image
        second: u32,
    },

    /// No port name was given
    #[error("no serial port selected")]
    InvalidPort,

    /// Chip detection or preparation failed
    #[error("could not connect to a device on {port}: {source}")]
    DeviceDetect {
        /// Port that was probed
        port: String,
        /// Programmer error
        #[source]
        source: ProgrammerError,
    },

    /// Erase, write or reset failed
    #[error("could not write to flash memory: {0}")]
    Write(#[source] ProgrammerError),

    /// A job is already active on the port or in the supervisor
    #[error("a flash job is already running on {port}")]
    JobAlreadyRunning {
        /// Port of the running job
        port: String,
    },

    /// Cancelled before the device was contacted
    #[error("flash job cancelled before contacting the device")]
    Cancelled,

    /// The worker thread could not be spawned
    #[error("could not start flash worker: {0}")]
    Spawn(#[source] std::io::Error),
}

impl Error {
    /// Get the failure classification for this error
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::UnknownProfile { .. } => FailureKind::UnknownProfile,
            Self::SourceOpen { address, .. } => FailureKind::SourceOpenFailure { address: *address },
            Self::ImageOverlap { first, second } => FailureKind::ImageOverlap {
                first: *first,
                second: *second,
            },
            Self::InvalidPort | Self::DeviceDetect { .. } => FailureKind::DeviceDetectFailure,
            Self::Write(_) => FailureKind::WriteFailure,
            Self::JobAlreadyRunning { .. } => FailureKind::JobAlreadyRunning,
            Self::Cancelled => FailureKind::Cancelled,
            Self::Spawn(_) => FailureKind::Internal,
        }
    }
}

/// Result type alias using the job-level Error type
pub type Result<T> = core::result::Result<T, Error>;
