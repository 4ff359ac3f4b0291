//! Error types for the session core.
//!
//! Nothing here is fatal to the process: sink errors are turned into state
//! machine events, store errors are logged, and command errors are shown to
//! the user.

use std::path::PathBuf;
use thiserror::Error;

/// Errors returned to callers of the session registry.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    /// The requested stream is neither a catalog name nor an http(s) URL.
    #[error("'{0}' no es una URL válida ni una radio predefinida")]
    InvalidTarget(String),

    /// The first connection attempt of a user-initiated play failed.
    #[error("no se pudo conectar al canal de voz: {0}")]
    ConnectFailure(String),

    /// A later `stop` or `play` cancelled this attempt before it finished.
    #[error("la reproducción fue reemplazada o detenida antes de comenzar")]
    Superseded,

    /// The guild session task went away before answering.
    #[error("la sesión del servidor se cerró inesperadamente")]
    SessionClosed,
}

/// Errors raised by the durable state store.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("archivo de estado corrupto en {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("no se pudo escribir el estado en {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("error de E/S: {0}")]
    Io(#[from] std::io::Error),

    #[error("no se pudo serializar el estado: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Errors raised by a stream sink.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SinkError {
    #[error("error al unirse al canal de voz: {0}")]
    Join(String),

    #[error("no hay conexión de voz activa")]
    NotConnected,

    #[error("error de reproducción: {0}")]
    Playback(String),
}

pub type SessionResult<T> = std::result::Result<T, SessionError>;
