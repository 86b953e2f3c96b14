//! Progress interpreter
//!
//! Turns the console-style output of a chip programmer into de-duplicated
//! percentage events. The recognized marker is the one esptool prints while
//! writing:
//!
//! ```text
//! Writing at 0x00001000... (3 %)
//! Writing at 0x00005000... (6 %)
//! ```
//!
//! A marker may arrive split across chunks; the unterminated tail of a chunk
//! is held back and joined with the next one.
//!
//! One interpreter covers one write phase. Create a fresh one per image.

use crate::event::{JobEvent, Progress};
use heapless::Vec as BoundedVec;

/// Keyword that precedes a progress percentage
pub const WRITE_MARKER: &str = "Writing at";

/// Message emitted once a write phase reaches 100%
pub const WRITE_COMPLETE: &str = "Image written.";

/// Percentage that completes a write phase
const COMPLETE: u8 = 100;

/// Longest unterminated tail carried over to the next chunk
const PENDING_LIMIT: usize = 128;

/// Events produced by one [`ProgressInterpreter::feed`] call
pub type Interpreted = BoundedVec<JobEvent, 2>;

/// Normalizes raw programmer output into progress events
#[derive(Debug, Clone, Default)]
pub struct ProgressInterpreter {
    last_status: Option<u8>,
    pending: Vec<u8>,
}

impl ProgressInterpreter {
    /// Create an interpreter for a new write phase
    pub fn new() -> Self {
        Self::default()
    }

    /// Last reported percentage, if any
    pub fn last_status(&self) -> Option<u8> {
        self.last_status
    }

    /// Whether this write phase reached 100%
    pub fn is_complete(&self) -> bool {
        self.last_status == Some(COMPLETE)
    }

    /// Interpret one chunk of raw output
    ///
    /// Returns nothing for unrelated output or a repeated percentage, a
    /// `Progress` event for a new percentage, and `Progress(100)` followed by a
    /// `Data` notice when the write completes. Once complete, lower values are
    /// ignored for the rest of the phase.
    pub fn feed(&mut self, chunk: &[u8]) -> Interpreted {
        let mut events = Interpreted::new();

        let mut joined = std::mem::take(&mut self.pending);
        joined.extend_from_slice(chunk);
        let text = String::from_utf8_lossy(&joined);

        let tail = text.rsplit(['\r', '\n']).next().unwrap_or_default();
        if tail.len() <= PENDING_LIMIT && !has_complete_marker(tail) {
            self.pending = tail.as_bytes().to_vec();
        }

        let Some(percent) = last_marker(&text) else {
            return events;
        };
        if self.last_status == Some(percent) || (self.is_complete() && percent < COMPLETE) {
            return events;
        }

        self.last_status = Some(percent);
        // Capacity is two and at most two events are pushed
        let _ = events.push(JobEvent::Progress(Progress::Percent(percent)));
        if percent == COMPLETE {
            let _ = events.push(JobEvent::Data(WRITE_COMPLETE.to_string()));
        }
        events
    }
}

/// Find the percentage of the last complete marker in `text`
fn last_marker(text: &str) -> Option<u8> {
    text.match_indices(WRITE_MARKER)
        .filter_map(|(pos, _)| parse_percent(&text[pos + WRITE_MARKER.len()..]))
        .last()
}

/// Whether `line` already holds a marker with its closing parenthesis
fn has_complete_marker(line: &str) -> bool {
    line.find(WRITE_MARKER)
        .is_some_and(|pos| line[pos..].contains(')'))
}

/// Parse the first `( NN %)` token of a line
fn parse_percent(rest: &str) -> Option<u8> {
    let line = rest.split(['\r', '\n']).next().unwrap_or_default();
    let open = line.find('(')?;
    let inner = &line[open + 1..];
    let close = inner.find(')')?;
    let value = inner[..close].trim().strip_suffix('%')?.trim();
    let percent: u8 = value.parse().ok()?;
    (percent <= COMPLETE).then_some(percent)
}
