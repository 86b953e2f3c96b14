//! Error types for the esptool backend

use kitflash_core::programmer::ProgrammerError;
use thiserror::Error;

/// Errors raised while driving esptool
#[derive(Debug, Error)]
pub enum EsptoolError {
    /// The esptool executable could not be started
    #[error("could not run '{program}' (install with: pip install esptool): {source}")]
    Spawn {
        /// Program that was invoked
        program: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// esptool ran and reported a failure
    #[error("esptool {command} failed: {message}")]
    Failed {
        /// esptool sub-command
        command: String,
        /// Fatal error line or exit status
        message: String,
    },

    /// esptool output did not contain the expected line
    #[error("unexpected esptool {command} output: missing '{expected}'")]
    Parse {
        /// esptool sub-command
        command: String,
        /// Line prefix that was looked for
        expected: &'static str,
    },

    /// I/O error while talking to the child process or spooling images
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for esptool operations
pub type Result<T> = core::result::Result<T, EsptoolError>;

impl From<EsptoolError> for ProgrammerError {
    fn from(err: EsptoolError) -> Self {
        match err {
            EsptoolError::Io(e) => ProgrammerError::Io(e),
            EsptoolError::Failed { command, message } => {
                let lower = message.to_ascii_lowercase();
                if lower.contains("could not open port") || lower.contains("serial exception") {
                    ProgrammerError::Serial(message)
                } else if lower.contains("timed out") || lower.contains("no serial data received") {
                    ProgrammerError::Timeout
                } else {
                    ProgrammerError::Protocol(format!("esptool {} failed: {}", command, message))
                }
            }
            other => ProgrammerError::Protocol(other.to_string()),
        }
    }
}
