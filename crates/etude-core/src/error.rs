use std::io;

/// Central error type for the etude engine.
#[derive(Debug, thiserror::Error)]
pub enum EtudeError {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// The peer performed an orderly shutdown of its side of the socket.
    #[error("peer closed the connection")]
    PeerClosed,
    /// A configuration value is out of range or inconsistent.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// The connection table has no room for another descriptor.
    #[error("connection table is full")]
    TableFull,
}

impl EtudeError {
    /// True for transport failures that only concern a single connection.
    pub fn is_transport(&self) -> bool {
        matches!(self, EtudeError::Io(_) | EtudeError::PeerClosed)
    }
}

pub type EtudeResult<T> = Result<T, EtudeError>;
