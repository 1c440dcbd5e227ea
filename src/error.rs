use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SwarmError {
    #[error("Invalid handshake: {0}")]
    InvalidHandshake(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Unknown message type: {0}")]
    UnknownMessageType(u8),

    #[error("Connection closed by remote peer")]
    ConnectionClosed,

    #[error("Piece {index} has length {expected}, got {actual} bytes")]
    LengthMismatch {
        index: u32,
        expected: u32,
        actual: usize,
    },

    #[error("File is already finalized")]
    AlreadyFinalized,

    #[error("Piece index {0} is out of range")]
    OutOfRange(u32),

    #[error("Complete file missing: {0}")]
    MissingCompleteFile(PathBuf),

    #[error("Failed to finalize file: {0}")]
    FinalizeFailed(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SwarmError {
    /// Errors that end a peer connection without affecting the rest of the swarm.
    pub fn is_connection_fatal(&self) -> bool {
        !matches!(self, SwarmError::UnknownMessageType(_))
    }
}

pub type Result<T> = std::result::Result<T, SwarmError>;
