//! Admission control around the dispatcher.
//!
//! [`AdmissionControl`] owns an atomic count of connections currently being
//! handled and an optional ceiling. Without a ceiling every connection is
//! admitted, but the count is still kept for logging.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Connection limiter with RAII accounting.
#[derive(Debug)]
pub struct AdmissionControl {
    /// Maximum concurrent connections; `None` = unbounded.
    max_connections: Option<usize>,
    /// Shared counter of currently active connections.
    active_connections: Arc<AtomicUsize>,
}

impl AdmissionControl {
    pub fn new(max_connections: Option<usize>) -> Self {
        Self {
            max_connections,
            active_connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Admit one connection, returning a guard that releases the slot on drop.
    ///
    /// # Errors
    ///
    /// Returns `Err(String)` if the connection limit has been reached.
    pub fn try_acquire(&self) -> Result<ConnectionGuard, String> {
        let max = self.max_connections.unwrap_or(usize::MAX);
        self.active_connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < max).then_some(current + 1)
            })
            .map_err(|current| format!("connection limit reached ({}/{})", current, max))?;
        Ok(ConnectionGuard {
            counter: self.active_connections.clone(),
        })
    }

    /// Current number of admitted connections.
    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }
}

/// RAII guard that decrements the connection count on drop.
/// Owns an `Arc<AtomicUsize>` so it can be moved into the connection task.
#[derive(Debug)]
pub struct ConnectionGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}
