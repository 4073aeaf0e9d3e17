// src/server.rs
use std::io;
use std::net::{TcpListener, ToSocketAddrs};
use std::sync::Arc;

use crate::config::ServerConfig;
use crate::context::Stats;
use crate::error::{EtudeError, EtudeResult};
use crate::reactor::Reactor;
use crate::shutdown::Shutdown;
use crate::syscalls;

pub struct Server {
    config: ServerConfig,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Open the listening socket for the configured host and port.
    pub fn bind(&self) -> EtudeResult<TcpListener> {
        let host_port = self.config.server_addr();
        let addr = host_port.to_socket_addrs()?.next().ok_or_else(|| {
            EtudeError::InvalidConfig(format!("{} did not resolve to an address", host_port))
        })?;
        syscalls::create_listen_socket(addr, libc::SOMAXCONN)
    }

    /// Serve on an already bound listener until `shutdown` is triggered.
    pub fn serve(&self, listener: TcpListener, shutdown: Arc<Shutdown>) -> EtudeResult<Stats> {
        self.config.validate()?;
        let mut reactor = Reactor::new(listener, &self.config, shutdown)?;
        reactor.run()?;
        Ok(reactor.stats())
    }

    /// Bind, install the Ctrl-C handler, and serve until interrupted.
    pub fn run(self) -> EtudeResult<Stats> {
        self.config.validate()?;
        syscalls::ignore_sigpipe();

        let listener = self.bind()?;
        let shutdown = Arc::new(Shutdown::new()?);

        let handle = Arc::clone(&shutdown);
        ctrlc::set_handler(move || {
            tracing::info!("received interrupt; initiating graceful shutdown");
            handle.trigger();
        })
        .map_err(|e| EtudeError::Io(io::Error::other(e)))?;

        tracing::info!(
            addr = %self.config.server_addr(),
            workers = self.config.workers,
            max_connections = self.config.max_connections,
            "starting etude"
        );
        let stats = self.serve(listener, shutdown)?;
        tracing::info!("etude shut down successfully");
        Ok(stats)
    }
}
