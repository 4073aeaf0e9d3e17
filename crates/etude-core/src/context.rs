// src/context.rs
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::syscalls::Poller;

/// Process-wide counters, updated lock-free from the reactor and workers.
#[repr(C, align(64))]
#[derive(Debug, Default)]
pub struct Metrics {
    pub req_count: AtomicUsize,
    pub active_conns: AtomicUsize,
    pub bytes_sent: AtomicUsize,
    pub rejected_conns: AtomicUsize,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_req(&self) {
        self.req_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Stats {
        Stats {
            requests: self.req_count.load(Ordering::Relaxed),
            active: self.active_conns.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            rejected: self.rejected_conns.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub requests: usize,
    pub active: usize,
    pub bytes_sent: usize,
    pub rejected: usize,
}

/// State every connection operation may need: the readiness registration
/// handle, the document root, and admission bookkeeping.
pub struct Shared {
    poller: Arc<dyn Poller>,
    doc_root: PathBuf,
    max_connections: usize,
    metrics: Metrics,
}

impl Shared {
    pub fn new(poller: Arc<dyn Poller>, doc_root: impl Into<PathBuf>, max_connections: usize) -> Self {
        Self {
            poller,
            doc_root: doc_root.into(),
            max_connections,
            metrics: Metrics::new(),
        }
    }

    pub fn poller(&self) -> &dyn Poller {
        &*self.poller
    }

    pub fn doc_root(&self) -> &Path {
        &self.doc_root
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn active_connections(&self) -> usize {
        self.metrics.active_conns.load(Ordering::Acquire)
    }

    /// Reserve room for one more connection; `false` once the limit is reached.
    pub fn try_admit(&self) -> bool {
        let admitted = self
            .metrics
            .active_conns
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |active| {
                (active < self.max_connections).then_some(active + 1)
            })
            .is_ok();
        if !admitted {
            self.metrics.rejected_conns.fetch_add(1, Ordering::Relaxed);
        }
        admitted
    }

    pub fn release(&self) {
        self.metrics.active_conns.fetch_sub(1, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared")
            .field("doc_root", &self.doc_root)
            .field("max_connections", &self.max_connections)
            .field("metrics", &self.metrics)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syscalls::Epoll;

    #[test]
    fn admission_stops_at_the_limit() {
        let shared = Shared::new(Arc::new(Epoll::new().unwrap()), "/tmp", 2);
        assert!(shared.try_admit());
        assert!(shared.try_admit());
        assert!(!shared.try_admit());
        assert_eq!(shared.active_connections(), 2);

        shared.release();
        assert!(shared.try_admit());

        let stats = shared.metrics().snapshot();
        assert_eq!(stats.active, 2);
        assert_eq!(stats.rejected, 1);
    }
}
