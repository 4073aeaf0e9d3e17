// src/reactor.rs
//! The single-threaded readiness loop.
//!
//! The reactor is the only thread that accepts and the only thread that
//! waits on epoll. It performs the non-blocking read for read-ready
//! sockets, then hands the connection to the pool; workers return it by
//! re-arming its one-shot registration.

use std::collections::VecDeque;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::ServerConfig;
use crate::context::{Shared, Stats};
use crate::error::EtudeResult;
use crate::pool::{SubmitError, ThreadPool};
use crate::shutdown::Shutdown;
use crate::syscalls::{Epoll, Interest, Poller, epoll_event};
use crate::table::{ConnectionTable, Slot};

/// Wait used while submissions are parked behind a full queue.
const RETRY_INTERVAL_MS: i32 = 5;
/// Wait used when an idle sweep is due periodically.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

const HANGUP: u32 = (libc::EPOLLRDHUP | libc::EPOLLHUP | libc::EPOLLERR) as u32;
const READABLE: u32 = libc::EPOLLIN as u32;
const WRITABLE: u32 = libc::EPOLLOUT as u32;

pub struct Reactor {
    listener: TcpListener,
    epoll: Arc<Epoll>,
    shared: Arc<Shared>,
    table: ConnectionTable,
    pool: ThreadPool<Arc<Slot>>,
    shutdown: Arc<Shutdown>,
    events: Vec<epoll_event>,
    deferred: VecDeque<Arc<Slot>>,
    read_buffer_size: usize,
    write_buffer_size: usize,
    idle_timeout: Option<Duration>,
    last_sweep: Instant,
}

impl Reactor {
    pub fn new(listener: TcpListener, config: &ServerConfig, shutdown: Arc<Shutdown>) -> EtudeResult<Self> {
        let epoll = Arc::new(Epoll::new()?);
        let poller = Arc::clone(&epoll) as Arc<dyn Poller>;
        Self::assemble(listener, config, shutdown, epoll, poller)
    }

    /// A reactor whose client registrations go through `poller` instead of
    /// its own epoll instance. The listener and shutdown handle still wait on
    /// the real epoll.
    pub fn with_poller(
        listener: TcpListener,
        config: &ServerConfig,
        shutdown: Arc<Shutdown>,
        poller: Arc<dyn Poller>,
    ) -> EtudeResult<Self> {
        let epoll = Arc::new(Epoll::new()?);
        Self::assemble(listener, config, shutdown, epoll, poller)
    }

    fn assemble(
        listener: TcpListener,
        config: &ServerConfig,
        shutdown: Arc<Shutdown>,
        epoll: Arc<Epoll>,
        poller: Arc<dyn Poller>,
    ) -> EtudeResult<Self> {
        listener.set_nonblocking(true)?;

        let shared = Arc::new(Shared::new(poller, config.doc_root.clone(), config.max_connections));
        let table = ConnectionTable::new(config.max_fds, Arc::clone(&shared));
        let pool = ThreadPool::with_pinning(config.workers, config.queue_capacity, config.pin_workers)?;

        Ok(Self {
            listener,
            epoll,
            shared,
            table,
            pool,
            shutdown,
            events: vec![epoll_event { events: 0, u64: 0 }; config.max_events],
            deferred: VecDeque::new(),
            read_buffer_size: config.read_buffer_size,
            write_buffer_size: config.write_buffer_size,
            idle_timeout: config.idle_timeout,
            last_sweep: Instant::now(),
        })
    }

    pub fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    pub fn stats(&self) -> Stats {
        self.shared.metrics().snapshot()
    }

    /// Run until the shutdown handle is triggered, then drain the pool and
    /// close every connection.
    pub fn run(&mut self) -> EtudeResult<()> {
        let listen_fd = self.listener.as_raw_fd();
        let wake_fd = self.shutdown.as_raw_fd();
        self.epoll.add_level(listen_fd)?;
        self.epoll.add_level(wake_fd)?;

        tracing::info!(
            addr = ?self.listener.local_addr().ok(),
            doc_root = %self.shared.doc_root().display(),
            workers = self.pool.workers(),
            "reactor running"
        );

        let result = self.event_loop(listen_fd, wake_fd);
        self.teardown();
        result
    }

    fn event_loop(&mut self, listen_fd: RawFd, wake_fd: RawFd) -> EtudeResult<()> {
        while !self.shutdown.is_triggered() {
            let timeout = self.wait_timeout();
            let n = self.epoll.wait(&mut self.events, timeout)?;

            for i in 0..n {
                let event = self.events[i];
                let fd = event.u64 as RawFd;

                if fd == listen_fd {
                    self.accept();
                } else if fd == wake_fd {
                    self.shutdown.acknowledge();
                } else {
                    self.dispatch(fd, event.events);
                }
            }

            self.retry_deferred();
            self.sweep_idle();
        }
        Ok(())
    }

    fn wait_timeout(&self) -> i32 {
        if !self.deferred.is_empty() {
            RETRY_INTERVAL_MS
        } else if self.idle_timeout.is_some() {
            SWEEP_INTERVAL.as_millis() as i32
        } else {
            -1
        }
    }

    /// Accept one pending connection.
    fn accept(&mut self) {
        let (stream, peer) = match self.listener.accept() {
            Ok(accepted) => accepted,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                return;
            }
        };

        if !self.shared.try_admit() {
            tracing::warn!(%peer, active = self.shared.active_connections(), "connection limit reached; closing");
            return;
        }
        if let Err(e) = self.install(stream, peer) {
            self.shared.release();
            tracing::warn!(%peer, error = %e, "could not register connection");
        }
    }

    fn install(&mut self, stream: TcpStream, peer: SocketAddr) -> EtudeResult<()> {
        stream.set_nonblocking(true)?;
        let socket = OwnedFd::from(stream);
        let fd = socket.as_raw_fd();

        let slot = Arc::clone(self.table.slot(fd)?);
        let mut conn = slot.lock();
        if conn.is_open() {
            tracing::error!(fd, "descriptor reused while its slot was still open");
            conn.close(&self.shared);
        }

        // Nothing can be delivered for `fd` before the slot lock is released.
        self.shared.poller().register(fd, Interest::Readable)?;
        conn.init(socket, peer, self.read_buffer_size, self.write_buffer_size);
        tracing::debug!(fd, %peer, "connection accepted");
        Ok(())
    }

    fn dispatch(&mut self, fd: RawFd, events: u32) {
        let Some(slot) = self.table.get(fd).cloned() else {
            tracing::warn!(fd, "event for unknown descriptor");
            return;
        };

        let mut conn = slot.lock();
        if !conn.is_open() {
            return;
        }

        if events & HANGUP != 0 {
            tracing::debug!(fd, "peer hung up");
            conn.close(&self.shared);
            return;
        }

        if events & READABLE != 0 {
            if let Err(e) = conn.read() {
                if e.is_transport() {
                    tracing::debug!(fd, error = %e, "read failed");
                } else {
                    tracing::warn!(fd, error = %e, "read failed");
                }
                conn.close(&self.shared);
                return;
            }
            conn.begin(Interest::Readable);
        } else if events & WRITABLE != 0 {
            conn.begin(Interest::Writable);
        } else {
            conn.arm(&self.shared, Interest::Readable);
            return;
        }

        drop(conn);
        self.submit(slot);
    }

    fn submit(&mut self, slot: Arc<Slot>) {
        match self.pool.submit(slot) {
            Ok(()) => {}
            Err(SubmitError::Full(slot)) => {
                if self.deferred.is_empty() {
                    tracing::warn!(capacity = self.pool.capacity(), "request queue full; deferring");
                }
                self.deferred.push_back(slot);
            }
            Err(SubmitError::Stopped(slot)) => slot.lock().close(&self.shared),
        }
    }

    fn retry_deferred(&mut self) {
        while let Some(slot) = self.deferred.pop_front() {
            match self.pool.submit(slot) {
                Ok(()) => {}
                Err(SubmitError::Full(slot)) => {
                    self.deferred.push_front(slot);
                    break;
                }
                Err(SubmitError::Stopped(slot)) => slot.lock().close(&self.shared),
            }
        }
    }

    /// Close connections that have sat armed with no traffic for too long.
    fn sweep_idle(&mut self) {
        let Some(limit) = self.idle_timeout else {
            return;
        };
        let now = Instant::now();
        if now.duration_since(self.last_sweep) < SWEEP_INTERVAL {
            return;
        }
        self.last_sweep = now;

        for slot in self.table.slots() {
            // A held lock means a worker owns it, so it is not idle.
            let Some(mut conn) = slot.try_lock() else {
                continue;
            };
            if conn.is_open() && !conn.is_in_flight() && conn.idle_for(now) >= limit {
                tracing::debug!(fd = ?conn.fd(), peer = ?conn.peer(), "closing idle connection");
                conn.close(&self.shared);
            }
        }
    }

    fn teardown(&mut self) {
        tracing::info!("reactor stopping; draining worker pool");
        self.pool.shutdown();

        for slot in self.deferred.drain(..) {
            slot.lock().close(&self.shared);
        }
        for slot in self.table.slots() {
            slot.lock().close(&self.shared);
        }

        let stats = self.stats();
        tracing::info!(
            requests = stats.requests,
            bytes_sent = stats.bytes_sent,
            rejected = stats.rejected,
            "reactor stopped"
        );
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("listener", &self.listener)
            .field("table", &self.table)
            .field("pool", &self.pool)
            .field("deferred", &self.deferred.len())
            .finish_non_exhaustive()
    }
}
