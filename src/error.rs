//! Error taxonomy of the coordination core.
//!
//! Buffer overflows, unknown protocol codes and page store failures are all
//! surfaced as typed errors. Failures inside a worker travel back to the
//! parent as a `Failed` reply and become [`Error::Remote`], so the job can be
//! aborted with the level and section where it went wrong.

use std::io;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Which array of a transfer buffer ran out of room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    Byte,
    Short,
    Int,
    Float,
    Double,
}

impl std::fmt::Display for BufferKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BufferKind::Byte => "byte",
            BufferKind::Short => "u16",
            BufferKind::Int => "u32",
            BufferKind::Float => "f32",
            BufferKind::Double => "f64",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum Error {
    /// A record did not fit into the pre-sized transfer buffer.
    #[error("{kind} transfer buffer overflow: capacity {capacity} exceeded")]
    Capacity { kind: BufferKind, capacity: usize },

    /// Unknown border flag, request id or reply shape.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Page store failure for a given section.
    #[error("I/O error at recursion level {level}, section {section}: {source}")]
    Io {
        level: u16,
        section: u16,
        #[source]
        source: io::Error,
    },

    /// Invalid configuration detected at startup.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("dimension mismatch: {0}")]
    DimensionMismatch(String),

    /// Link closed, timed out or answered by the wrong task.
    #[error("transport error: {0}")]
    Transport(String),

    /// A worker task failed while serving a request.
    #[error("task {task} failed at recursion level {level}, section {section}: {message}")]
    Remote {
        task: u16,
        level: u16,
        section: u16,
        message: String,
    },
}

impl Error {
    pub(crate) fn io(level: u16, section: u16, source: io::Error) -> Self {
        Error::Io {
            level,
            section,
            source,
        }
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol(message.into())
    }
}
