//! CLI command implementations
//!
//! `flash` runs one job through the supervisor and renders its event stream.
//! The list commands only print.

pub mod flash;
mod list;

pub use list::{list_ports, list_profiles, list_programmers};
