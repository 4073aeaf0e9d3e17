// src/conn.rs
//! Per-connection protocol state machine.
//!
//! A [`Connection`] owns one client socket together with its inbound and
//! outbound buffers, the incremental parser state, and (while a file
//! response is in flight) the memory mapping of the served file.
//!
//! The reactor and the pool hand a connection back and forth; the one-shot
//! registration guarantees only one of them touches it at a time. Every
//! pass through [`Connection::process`] ends in exactly one readiness
//! decision: re-arm in one direction, or close.

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, IoSlice};
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use arrayvec::ArrayVec;

use crate::context::{Metrics, Shared};
use crate::error::{EtudeError, EtudeResult};
use crate::mapping::FileMapping;
use crate::parser::{self, HeaderLine, LineStatus, ParseError, Request};
use crate::response::{self, Outcome, Overflow};
use crate::syscalls::{self, Interest};

/// Longest filesystem path a request may resolve to.
pub const MAX_PATH_LEN: usize = libc::PATH_MAX as usize;

/// Inbound bytes a rejected client may still push before the linger is cut short.
pub const LINGER_DISCARD_LIMIT: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CheckState {
    #[default]
    RequestLine,
    Headers,
    Body,
}

/// Where the read side got to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    NeedMore,
    Done(Outcome),
}

/// Where a flush got to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flush {
    /// The socket stopped accepting bytes; resume on the next write-ready.
    Pending,
    /// Response finished on a keep-alive connection; state has been reset.
    KeepAlive,
    /// Response finished and the client did not ask to keep the connection.
    Close,
    /// Response to a rejected request finished; our side is shut for writing
    /// and unread input is discarded until the peer closes.
    Linger,
}

/// What a finished `process()` did with the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Armed(Interest),
    Closed,
}

enum Step {
    Continue,
    NeedMore,
    Complete,
    Reject(ParseError),
}

pub struct Connection {
    socket: Option<OwnedFd>,
    peer: Option<SocketAddr>,

    read_buf: Vec<u8>,
    read_end: usize,
    checked: usize,
    line_start: usize,
    state: CheckState,
    request: Request,
    body_start: usize,

    target: PathBuf,
    mapping: Option<FileMapping>,

    write_buf: Vec<u8>,
    write_end: usize,
    bytes_total: usize,
    bytes_sent: usize,

    ready: Interest,
    in_flight: bool,
    last_active: Instant,

    linger: bool,
    lingering: bool,
    discarded: usize,
}

impl Connection {
    /// An unused slot. Buffers are allocated on first `init`.
    pub fn empty() -> Self {
        Self {
            socket: None,
            peer: None,
            read_buf: Vec::new(),
            read_end: 0,
            checked: 0,
            line_start: 0,
            state: CheckState::RequestLine,
            request: Request::default(),
            body_start: 0,
            target: PathBuf::new(),
            mapping: None,
            write_buf: Vec::new(),
            write_end: 0,
            bytes_total: 0,
            bytes_sent: 0,
            ready: Interest::Readable,
            in_flight: false,
            last_active: Instant::now(),
            linger: false,
            lingering: false,
            discarded: 0,
        }
    }

    /// Take ownership of a freshly accepted socket.
    pub fn init(&mut self, socket: OwnedFd, peer: SocketAddr, read_cap: usize, write_cap: usize) {
        if self.read_buf.len() != read_cap {
            self.read_buf = vec![0; read_cap];
        }
        if self.write_buf.len() != write_cap {
            self.write_buf = vec![0; write_cap];
        }
        self.socket = Some(socket);
        self.peer = Some(peer);
        self.ready = Interest::Readable;
        self.in_flight = false;
        self.reset();
    }

    /// Return every parser, buffer and response field to its initial value.
    pub fn reset(&mut self) {
        self.read_end = 0;
        self.checked = 0;
        self.line_start = 0;
        self.state = CheckState::RequestLine;
        self.request = Request::default();
        self.body_start = 0;
        self.target = PathBuf::new();
        self.mapping = None;
        self.write_end = 0;
        self.bytes_total = 0;
        self.bytes_sent = 0;
        self.read_buf.fill(0);
        self.write_buf.fill(0);
        self.last_active = Instant::now();
        self.linger = false;
        self.lingering = false;
        self.discarded = 0;
    }

    pub fn is_open(&self) -> bool {
        self.socket.is_some()
    }

    pub fn fd(&self) -> Option<RawFd> {
        self.socket.as_ref().map(AsRawFd::as_raw_fd)
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Bytes of the request body, once the read side has completed.
    pub fn body(&self) -> &[u8] {
        let end = (self.body_start + self.request.content_length).min(self.read_end);
        &self.read_buf[self.body_start.min(end)..end]
    }

    /// Hand the connection to a worker for the given readiness direction.
    pub fn begin(&mut self, interest: Interest) {
        self.ready = interest;
        self.in_flight = true;
    }

    /// True from `begin` until the worker re-arms or closes.
    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_active)
    }

    // ---- inbound ----

    /// Drain the socket into the inbound buffer until it would block.
    ///
    /// Stops early, without error, once the buffer is full; the parser then
    /// decides whether the buffered bytes are a complete request. While
    /// lingering, everything read is thrown away instead.
    pub fn read(&mut self) -> EtudeResult<()> {
        let fd = self.fd().ok_or(EtudeError::PeerClosed)?;
        if self.lingering {
            return self.discard_input(fd);
        }

        while self.read_end < self.read_buf.len() {
            match syscalls::recv_nonblocking(fd, &mut self.read_buf[self.read_end..]) {
                Ok(0) => return Err(EtudeError::PeerClosed),
                Ok(n) => self.read_end += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }

        self.last_active = Instant::now();
        Ok(())
    }

    /// True once a rejection response is out and the read side is being drained.
    pub fn is_lingering(&self) -> bool {
        self.lingering
    }

    fn discard_input(&mut self, fd: RawFd) -> EtudeResult<()> {
        loop {
            match syscalls::recv_nonblocking(fd, &mut self.read_buf) {
                Ok(0) => return Err(EtudeError::PeerClosed),
                Ok(n) => {
                    self.discarded += n;
                    if self.discarded > LINGER_DISCARD_LIMIT {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "peer kept sending after rejection",
                        )
                        .into());
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }
        self.last_active = Instant::now();
        Ok(())
    }

    /// Drive the parser over whatever is buffered.
    pub fn process_read(&mut self, doc_root: &Path) -> Progress {
        loop {
            let step = match self.state {
                CheckState::Body => self.parse_body(),
                CheckState::RequestLine | CheckState::Headers => {
                    match parser::scan_line(&mut self.read_buf, &mut self.checked, self.read_end) {
                        LineStatus::Complete => self.parse_line(),
                        LineStatus::Incomplete => Step::NeedMore,
                        LineStatus::Malformed => Step::Reject(ParseError::MalformedLine),
                    }
                }
            };

            match step {
                Step::Continue => continue,
                Step::NeedMore if self.read_end == self.read_buf.len() => {
                    return self.reject(ParseError::TooLarge);
                }
                Step::NeedMore => return Progress::NeedMore,
                Step::Complete => return Progress::Done(self.do_request(doc_root)),
                Step::Reject(e) => return self.reject(e),
            }
        }
    }

    fn parse_line(&mut self) -> Step {
        let start = self.line_start;
        let end = self.checked - 2;
        self.line_start = self.checked;
        let line = &self.read_buf[start..end];

        match self.state {
            CheckState::RequestLine => match parser::parse_request_line(line, &mut self.request) {
                Ok(()) => {
                    self.state = CheckState::Headers;
                    Step::Continue
                }
                Err(e) => Step::Reject(e),
            },
            CheckState::Headers => match parser::parse_header(line, &mut self.request) {
                Ok(HeaderLine::Continue) => Step::Continue,
                Ok(HeaderLine::End) if self.request.content_length == 0 => Step::Complete,
                Ok(HeaderLine::End) => {
                    self.body_start = self.checked;
                    if self.request.content_length > self.read_buf.len() - self.body_start {
                        return Step::Reject(ParseError::TooLarge);
                    }
                    // The body may already be buffered; the next pass checks it right away.
                    self.state = CheckState::Body;
                    Step::Continue
                }
                Err(e) => Step::Reject(e),
            },
            CheckState::Body => Step::Continue,
        }
    }

    fn parse_body(&self) -> Step {
        if self.read_end >= self.body_start + self.request.content_length {
            Step::Complete
        } else {
            Step::NeedMore
        }
    }

    fn reject(&mut self, error: ParseError) -> Progress {
        tracing::debug!(peer = ?self.peer, %error, "rejecting request");
        self.request.keep_alive = false;
        self.linger = true;
        Progress::Done(Outcome::BadRequest)
    }

    /// Resolve the parsed path under `doc_root` and map the file.
    pub fn do_request(&mut self, doc_root: &Path) -> Outcome {
        let root = doc_root.as_os_str();
        if root.len() + self.request.url.len() > MAX_PATH_LEN {
            tracing::debug!(peer = ?self.peer, "resolved path too long");
            self.request.keep_alive = false;
            return Outcome::BadRequest;
        }
        let mut target = OsString::with_capacity(root.len() + self.request.url.len());
        target.push(root);
        target.push(&self.request.url);
        self.target = PathBuf::from(target);

        let meta = match fs::metadata(&self.target) {
            Ok(meta) => meta,
            Err(_) => return Outcome::NoResource,
        };
        if meta.permissions().mode() & libc::S_IROTH == 0 {
            return Outcome::Forbidden;
        }
        if meta.is_dir() {
            return Outcome::BadRequest;
        }

        let file = match File::open(&self.target) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => return Outcome::Forbidden,
            Err(e) => {
                tracing::warn!(path = %self.target.display(), error = %e, "open failed");
                return Outcome::InternalError;
            }
        };
        let Ok(len) = usize::try_from(meta.len()) else {
            return Outcome::InternalError;
        };
        match FileMapping::map(&file, len) {
            Ok(mapping) => {
                self.mapping = Some(mapping);
                Outcome::FileRequest
            }
            Err(e) => {
                tracing::warn!(path = %self.target.display(), error = %e, "mmap failed");
                Outcome::InternalError
            }
        }
    }

    // ---- outbound ----

    /// Lay out the response for `outcome` in the outbound buffer.
    pub fn process_write(&mut self, outcome: Outcome) -> Result<(), Overflow> {
        let keep_alive = self.request.keep_alive;
        self.write_end = 0;
        self.bytes_sent = 0;
        self.bytes_total = 0;

        let head = match outcome {
            Outcome::FileRequest => match &self.mapping {
                Some(mapping) => {
                    response::write_file_head(&mut self.write_buf, mapping.len() as u64, keep_alive)
                        .map(|n| (n, n + mapping.len()))
                }
                None => Err(Overflow),
            },
            canned => {
                self.mapping = None;
                response::write_canned(&mut self.write_buf, canned, keep_alive).map(|n| (n, n))
            }
        };

        match head {
            Ok((head_len, total)) => {
                self.write_end = head_len;
                self.bytes_total = total;
                Ok(())
            }
            Err(overflow) => {
                self.mapping = None;
                Err(overflow)
            }
        }
    }

    /// The unsent tail of {outbound buffer, mapped file}.
    fn pending_slices(&self) -> ArrayVec<IoSlice<'_>, 2> {
        let mut iov = ArrayVec::new();
        if self.bytes_sent < self.write_end {
            iov.push(IoSlice::new(&self.write_buf[self.bytes_sent..self.write_end]));
        }
        if let Some(mapping) = &self.mapping {
            let body_sent = self.bytes_sent.saturating_sub(self.write_end);
            if body_sent < mapping.len() {
                iov.push(IoSlice::new(&mapping[body_sent..]));
            }
        }
        iov
    }

    /// Push queued bytes to the socket, resuming at `bytes_sent`.
    pub fn write(&mut self, metrics: &Metrics) -> EtudeResult<Flush> {
        if self.bytes_total == 0 {
            self.reset();
            return Ok(Flush::KeepAlive);
        }
        let fd = self.fd().ok_or(EtudeError::PeerClosed)?;

        while self.bytes_sent < self.bytes_total {
            let sent = {
                let iov = self.pending_slices();
                syscalls::send_vectored(fd, &iov)
            };
            match sent {
                Ok(0) => {
                    self.mapping = None;
                    return Err(io::Error::from(io::ErrorKind::WriteZero).into());
                }
                Ok(n) => {
                    self.bytes_sent += n;
                    metrics.add_bytes(n);
                    self.last_active = Instant::now();
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Flush::Pending),
                Err(e) => {
                    self.mapping = None;
                    return Err(e.into());
                }
            }
        }

        self.mapping = None;
        if self.request.keep_alive {
            self.reset();
            Ok(Flush::KeepAlive)
        } else if self.linger {
            // The client may still be sending; closing now would answer with a reset.
            syscalls::shutdown_write(fd)?;
            self.lingering = true;
            Ok(Flush::Linger)
        } else {
            Ok(Flush::Close)
        }
    }

    // ---- worker entry point ----

    /// Run one unit of work for the readiness direction set by `begin`.
    pub fn process(&mut self, shared: &Shared) -> Disposition {
        let next = match self.ready {
            Interest::Readable => self.handle_request(shared),
            Interest::Writable => self.handle_flush(shared),
        };
        match next {
            Some(interest) => self.arm(shared, interest),
            None => {
                self.close(shared);
                Disposition::Closed
            }
        }
    }

    fn handle_request(&mut self, shared: &Shared) -> Option<Interest> {
        if self.lingering {
            return Some(Interest::Readable);
        }
        let outcome = match self.process_read(shared.doc_root()) {
            Progress::NeedMore => return Some(Interest::Readable),
            Progress::Done(outcome) => outcome,
        };

        shared.metrics().inc_req();
        tracing::debug!(
            peer = ?self.peer,
            url = %self.request.url,
            status = outcome.status(),
            keep_alive = self.request.keep_alive,
            "request handled"
        );

        if self.process_write(outcome).is_ok() {
            return Some(Interest::Writable);
        }
        tracing::warn!(peer = ?self.peer, status = outcome.status(), "response head overflows outbound buffer");
        match self.process_write(Outcome::InternalError) {
            Ok(()) => Some(Interest::Writable),
            Err(_) => None,
        }
    }

    fn handle_flush(&mut self, shared: &Shared) -> Option<Interest> {
        match self.write(shared.metrics()) {
            Ok(Flush::Pending) => Some(Interest::Writable),
            Ok(Flush::KeepAlive) => Some(Interest::Readable),
            Ok(Flush::Close) => None,
            Ok(Flush::Linger) => Some(Interest::Readable),
            Err(e) => {
                tracing::debug!(peer = ?self.peer, error = %e, "write failed");
                None
            }
        }
    }

    /// The single re-arm point: return the connection to the reactor.
    pub fn arm(&mut self, shared: &Shared, interest: Interest) -> Disposition {
        let Some(fd) = self.fd() else {
            return Disposition::Closed;
        };
        self.in_flight = false;
        match shared.poller().rearm(fd, interest) {
            Ok(()) => Disposition::Armed(interest),
            Err(e) => {
                tracing::warn!(fd, error = %e, "re-arm failed");
                self.close(shared);
                Disposition::Closed
            }
        }
    }

    /// Deregister, unmap, close the socket and free the slot.
    pub fn close(&mut self, shared: &Shared) {
        self.mapping = None;
        self.in_flight = false;
        if let Some(socket) = self.socket.take() {
            let fd = socket.as_raw_fd();
            if self.lingering {
                // Unread input turns close() into a reset.
                let _ = self.discard_input(fd);
            }
            if let Err(e) = shared.poller().deregister(fd) {
                tracing::trace!(fd, error = %e, "deregister failed");
            }
            drop(socket);
            shared.release();
            tracing::debug!(fd, peer = ?self.peer, "connection closed");
        }
        self.peer = None;
    }
}

impl Default for Connection {
    fn default() -> Self {
        Self::empty()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("fd", &self.fd())
            .field("peer", &self.peer)
            .field("state", &self.state)
            .field("read_end", &self.read_end)
            .field("checked", &self.checked)
            .field("line_start", &self.line_start)
            .field("url", &self.request.url)
            .field("bytes_sent", &self.bytes_sent)
            .field("bytes_total", &self.bytes_total)
            .field("in_flight", &self.in_flight)
            .field("lingering", &self.lingering)
            .finish()
    }
}
