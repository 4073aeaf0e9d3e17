use std::path::PathBuf;
use std::time::Duration;

use crate::error::{EtudeError, EtudeResult};

/// Server configuration.
///
/// Every field has a default matching the classic single-box deployment
/// (2 KiB inbound / 1 KiB outbound buffers, 64K descriptor table). Only
/// `port` is normally supplied by the operator.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address (default: 0.0.0.0)
    pub host: String,

    /// Listen port
    pub port: u16,

    /// Directory under which every request target is resolved (default: ./resources)
    pub doc_root: PathBuf,

    /// Maximum number of simultaneously open client connections
    pub max_connections: usize,

    /// Length of the descriptor-indexed connection table
    pub max_fds: usize,

    /// Inbound buffer capacity per connection, in bytes
    pub read_buffer_size: usize,

    /// Outbound (status line + headers) buffer capacity per connection, in bytes
    pub write_buffer_size: usize,

    /// Number of pool worker threads (default: number of CPUs)
    pub workers: usize,

    /// Maximum number of connections waiting in the pool queue
    pub queue_capacity: usize,

    /// Maximum readiness events handled per reactor wake-up
    pub max_events: usize,

    /// Close connections idle in the reactor for longer than this. `None` disables the sweep.
    pub idle_timeout: Option<Duration>,

    /// Pin each worker thread to a CPU core
    pub pin_workers: bool,
}

pub const DEFAULT_MAX_FDS: usize = 65536;
pub const DEFAULT_READ_BUFFER_SIZE: usize = 2048;
pub const DEFAULT_WRITE_BUFFER_SIZE: usize = 1024;
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;
pub const DEFAULT_MAX_EVENTS: usize = 10_000;

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            doc_root: PathBuf::from("./resources"),
            max_connections: DEFAULT_MAX_FDS - 1,
            max_fds: DEFAULT_MAX_FDS,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            write_buffer_size: DEFAULT_WRITE_BUFFER_SIZE,
            workers: num_cpus::get(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_events: DEFAULT_MAX_EVENTS,
            idle_timeout: None,
            pin_workers: false,
        }
    }
}

impl ServerConfig {
    /// Start from the defaults with the given port.
    pub fn with_port(port: u16) -> Self {
        Self {
            port,
            ..Self::default()
        }
    }

    /// Get the full listen address.
    pub fn server_addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> EtudeResult<()> {
        let invalid = |msg: &str| Err(EtudeError::InvalidConfig(msg.to_string()));

        if self.workers == 0 {
            return invalid("workers must be at least 1");
        }
        if self.queue_capacity == 0 {
            return invalid("queue capacity must be at least 1");
        }
        if self.read_buffer_size == 0 || self.write_buffer_size == 0 {
            return invalid("buffer sizes must be non-zero");
        }
        if self.max_events == 0 {
            return invalid("max events must be at least 1");
        }
        if self.max_connections == 0 || self.max_connections > self.max_fds {
            return invalid("max connections must be between 1 and the descriptor table size");
        }
        if !self.doc_root.is_dir() {
            return Err(EtudeError::InvalidConfig(format!(
                "document root {} is not a directory",
                self.doc_root.display()
            )));
        }
        Ok(())
    }
}
