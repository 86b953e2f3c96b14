//! Process-wide serial port reservations
//!
//! A job reserves its port before spawning and holds the [`PortLease`] for its
//! whole lifetime, so two jobs can never talk to the same device even when
//! they were started outside a supervisor.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::{Error, Result};
use once_cell::sync::Lazy;

static ACTIVE_PORTS: Lazy<Mutex<HashSet<String>>> = Lazy::new(|| Mutex::new(HashSet::new()));

fn active_ports() -> MutexGuard<'static, HashSet<String>> {
    ACTIVE_PORTS.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Exclusive reservation of a serial port
///
/// Released when dropped.
#[derive(Debug)]
pub struct PortLease {
    port: String,
}

impl PortLease {
    /// Reserve `port`, failing if another job holds it
    pub fn acquire(port: &str) -> Result<Self> {
        if !active_ports().insert(port.to_string()) {
            return Err(Error::JobAlreadyRunning {
                port: port.to_string(),
            });
        }
        log::trace!("Reserved port {}", port);
        Ok(Self {
            port: port.to_string(),
        })
    }

    /// The reserved port
    pub fn port(&self) -> &str {
        &self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        active_ports().remove(&self.port);
        log::trace!("Released port {}", self.port);
    }
}

/// Check whether a job currently holds `port`
pub fn is_reserved(port: &str) -> bool {
    active_ports().contains(port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exclusive_until_dropped() {
        let lease = PortLease::acquire("port-lock-test-0").unwrap();
        assert_eq!(lease.port(), "port-lock-test-0");
        assert!(is_reserved("port-lock-test-0"));

        let err = PortLease::acquire("port-lock-test-0").unwrap_err();
        assert!(matches!(err, Error::JobAlreadyRunning { .. }));

        drop(lease);
        assert!(!is_reserved("port-lock-test-0"));
        let _again = PortLease::acquire("port-lock-test-0").unwrap();
    }

    #[test]
    fn test_independent_ports() {
        let _a = PortLease::acquire("port-lock-test-1").unwrap();
        let _b = PortLease::acquire("port-lock-test-2").unwrap();
    }
}
