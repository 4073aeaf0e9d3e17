use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::EtudeResult;
use crate::syscalls::EventFd;

/// Process-wide stop request.
///
/// The flag is what the reactor checks; the eventfd is what gets it out of
/// an untimed readiness wait.
pub struct Shutdown {
    requested: AtomicBool,
    waker: EventFd,
}

impl Shutdown {
    pub fn new() -> EtudeResult<Self> {
        Ok(Self {
            requested: AtomicBool::new(false),
            waker: EventFd::new()?,
        })
    }

    /// Request shutdown. Safe to call from any thread, any number of times.
    pub fn trigger(&self) {
        if !self.requested.swap(true, Ordering::AcqRel) {
            if let Err(e) = self.waker.notify() {
                tracing::error!(error = %e, "failed to wake reactor for shutdown");
            }
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    pub(crate) fn acknowledge(&self) {
        if let Err(e) = self.waker.drain() {
            tracing::warn!(error = %e, "failed to drain shutdown eventfd");
        }
    }
}

impl AsRawFd for Shutdown {
    fn as_raw_fd(&self) -> RawFd {
        self.waker.as_raw_fd()
    }
}

impl std::fmt::Debug for Shutdown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shutdown")
            .field("requested", &self.is_triggered())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_is_idempotent() {
        let shutdown = Shutdown::new().unwrap();
        assert!(!shutdown.is_triggered());
        shutdown.trigger();
        shutdown.trigger();
        assert!(shutdown.is_triggered());
        shutdown.acknowledge();
    }
}
