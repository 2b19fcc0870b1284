//! HTTP/1.1 message layer for the loopback broker
//!
//! This module implements the broker's connection core directly on raw byte
//! streams: an incremental message assembler driven by `Content-Length`
//! framing, and a per-connection driver that feeds it from readiness
//! notifications and serializes a FIFO queue of replies back out, resuming
//! partial writes.
//!
//! # Architecture
//!
//! Each accepted connection is owned by exactly one thread. That thread
//! polls the socket for readability/writability and drains a channel of
//! handler results, so assembler state and the reply queue never need locks.
//! The secret handler is the one point of suspension: it runs on its own
//! thread and delivers its result back through the connection's channel.
//!
//! Chunked transfer-encoding, TLS and HTTP/2 are deliberately unsupported;
//! message bodies are framed by `Content-Length` alone.

pub mod connection;
pub mod handler;
pub mod headers;
pub mod message;
pub mod registry;
pub mod server;
pub mod session;

pub use connection::Connection;
pub use handler::{HandlerError, SecretHandler, SecretRequest};
pub use headers::Headers;
pub use message::{MessageKind, MessageStatus, RawMessage, Reply};
pub use registry::ConnectionRegistry;
pub use server::MessageServer;
pub use session::{FdSessionOps, SessionOps};

/// Result type for HTTP operations
pub type Result<T> = std::result::Result<T, Error>;

/// HTTP operation errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid Content-Length: {0}")]
    InvalidContentLength(String),

    #[error("Cannot append bytes to a finalized message")]
    FramingAppend,

    #[error("Connection closed")]
    ConnectionClosed,
}

/// Bytes read from a connection per readiness notification.
pub const READ_CHUNK: usize = 2048;

/// CRLF line ending
pub const CRLF: &str = "\r\n";
