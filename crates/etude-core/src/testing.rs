// src/testing.rs
//! Test doubles shared by the unit tests.

use std::io;
use std::os::fd::RawFd;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::syscalls::{Interest, Poller};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    Register(Interest),
    Rearm(Interest),
    Deregister,
}

/// Records registration changes instead of making them.
#[derive(Default)]
pub struct RecordingPoller {
    calls: Mutex<Vec<(RawFd, Call)>>,
}

impl RecordingPoller {
    pub fn take(&self) -> Vec<Call> {
        self.take_with_fds().into_iter().map(|(_, call)| call).collect()
    }

    pub fn take_with_fds(&self) -> Vec<(RawFd, Call)> {
        std::mem::take(&mut *self.calls.lock().unwrap())
    }

    /// Wait for at least `count` calls from other threads, give stragglers a
    /// moment to show up, then take everything recorded.
    pub fn take_after(&self, count: usize) -> Vec<(RawFd, Call)> {
        let deadline = Instant::now() + Duration::from_secs(5);
        while self.calls.lock().unwrap().len() < count && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        std::thread::sleep(Duration::from_millis(50));
        self.take_with_fds()
    }

    fn record(&self, fd: RawFd, call: Call) -> io::Result<()> {
        self.calls.lock().unwrap().push((fd, call));
        Ok(())
    }
}

impl Poller for RecordingPoller {
    fn register(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.record(fd, Call::Register(interest))
    }

    fn rearm(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.record(fd, Call::Rearm(interest))
    }

    fn deregister(&self, fd: RawFd) -> io::Result<()> {
        self.record(fd, Call::Deregister)
    }
}
