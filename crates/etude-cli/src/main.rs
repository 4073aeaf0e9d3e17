use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use etude_core::config::{
    DEFAULT_MAX_EVENTS, DEFAULT_MAX_FDS, DEFAULT_QUEUE_CAPACITY, DEFAULT_READ_BUFFER_SIZE,
    DEFAULT_WRITE_BUFFER_SIZE,
};
use etude_core::{Server, ServerConfig};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "etude")]
#[command(about = "A small HTTP/1.1 static-file server")]
#[command(version)]
struct Cli {
    /// Port to listen on
    #[arg(env = "ETUDE_PORT")]
    port: u16,

    /// Address to bind
    #[arg(long, env = "ETUDE_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Directory files are served from
    #[arg(long, env = "ETUDE_DOC_ROOT", default_value = "./resources")]
    doc_root: PathBuf,

    /// Maximum simultaneously open client connections
    #[arg(long, env = "ETUDE_MAX_CONNECTIONS", default_value_t = DEFAULT_MAX_FDS - 1)]
    max_connections: usize,

    /// Inbound buffer per connection, in bytes
    #[arg(long, env = "ETUDE_READ_BUFFER", default_value_t = DEFAULT_READ_BUFFER_SIZE)]
    read_buffer: usize,

    /// Outbound header buffer per connection, in bytes
    #[arg(long, env = "ETUDE_WRITE_BUFFER", default_value_t = DEFAULT_WRITE_BUFFER_SIZE)]
    write_buffer: usize,

    /// Worker threads (defaults to the number of CPUs)
    #[arg(long, env = "ETUDE_WORKERS")]
    workers: Option<usize>,

    /// Connections that may wait for a worker
    #[arg(long, env = "ETUDE_QUEUE_CAPACITY", default_value_t = DEFAULT_QUEUE_CAPACITY)]
    queue_capacity: usize,

    /// Readiness events handled per wake-up
    #[arg(long, env = "ETUDE_MAX_EVENTS", default_value_t = DEFAULT_MAX_EVENTS)]
    max_events: usize,

    /// Close connections idle for this many seconds (disabled when unset)
    #[arg(long, env = "ETUDE_IDLE_TIMEOUT")]
    idle_timeout: Option<u64>,

    /// Pin each worker thread to a CPU core
    #[arg(long, env = "ETUDE_PIN_WORKERS")]
    pin_workers: bool,

    /// Fallback log level when RUST_LOG is unset
    #[arg(long, env = "ETUDE_LOG", default_value = "info")]
    log_level: String,
}

impl Cli {
    fn into_config(self) -> ServerConfig {
        let defaults = ServerConfig::default();
        ServerConfig {
            host: self.host,
            port: self.port,
            doc_root: self.doc_root,
            max_connections: self.max_connections,
            read_buffer_size: self.read_buffer,
            write_buffer_size: self.write_buffer,
            workers: self.workers.unwrap_or(defaults.workers),
            queue_capacity: self.queue_capacity,
            max_events: self.max_events,
            idle_timeout: self.idle_timeout.map(Duration::from_secs),
            pin_workers: self.pin_workers,
            ..defaults
        }
    }
}

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    etude_core::init_logging_with_level(&cli.log_level);

    let config = cli.into_config();
    let addr = config.server_addr();
    let stats = Server::new(config)
        .run()
        .with_context(|| format!("server on {} failed", addr))?;

    tracing::info!(
        requests = stats.requests,
        bytes_sent = stats.bytes_sent,
        "bye"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_alone_yields_defaults() {
        let config = Cli::try_parse_from(["etude", "9090"]).unwrap().into_config();
        assert_eq!(config.port, 9090);
        assert_eq!(config.read_buffer_size, DEFAULT_READ_BUFFER_SIZE);
        assert_eq!(config.write_buffer_size, DEFAULT_WRITE_BUFFER_SIZE);
        assert!(config.idle_timeout.is_none());
        assert!(config.workers >= 1);
    }

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "etude",
            "8000",
            "--doc-root",
            "/srv/www",
            "--workers",
            "3",
            "--idle-timeout",
            "30",
        ])
        .unwrap();
        let config = cli.into_config();
        assert_eq!(config.doc_root, PathBuf::from("/srv/www"));
        assert_eq!(config.workers, 3);
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn port_is_required() {
        assert!(Cli::try_parse_from(["etude"]).is_err());
    }
}
