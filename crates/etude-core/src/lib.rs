//! etude: a small HTTP/1.1 static-file server.
//!
//! One reactor thread waits on epoll and accepts; a fixed pool of worker
//! threads parses requests and sends responses. File bodies are memory
//! mapped and sent together with the response head in one vectored write.
//!
//! ```no_run
//! use etude_core::{Server, ServerConfig};
//!
//! etude_core::init_logging();
//! let config = ServerConfig::with_port(8080);
//! Server::new(config).run().unwrap();
//! ```

pub mod config;
pub mod conn;
pub mod context;
pub mod error;
pub mod logging;
pub mod mapping;
pub mod parser;
pub mod pool;
pub mod reactor;
pub mod response;
pub mod server;
pub mod shutdown;
pub mod syscalls;
pub mod table;
#[cfg(test)]
mod testing;

pub use config::ServerConfig;
pub use conn::Connection;
pub use context::{Metrics, Shared, Stats};
pub use error::{EtudeError, EtudeResult};
pub use logging::{init_logging, init_logging_with_level};
pub use pool::{SubmitError, Task, ThreadPool};
pub use reactor::Reactor;
pub use response::Outcome;
pub use server::Server;
pub use shutdown::Shutdown;
