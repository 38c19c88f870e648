//! Error types shared across the sync core.

use thiserror::Error;

/// Convenience alias for results returned by this crate.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors surfaced by the synchronization core.
///
/// Every variant here corresponds to one of the documented error kinds: transport
/// failures recover via reconnect, framing/unknown-doc-id errors drop the frame and
/// keep the transport open, engine errors propagate to the caller without tearing
/// anything down.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The WebSocket connection closed or errored. Transient; the caller should
    /// reconnect with backoff.
    #[error("transport error: {0}")]
    Transport(String),

    /// A frame's length prefix was malformed or the body was truncated.
    #[error("framing error: {0}")]
    Framing(String),

    /// A binary frame's doc id did not match `workspace:` or `body:{ws}/{path}`,
    /// or referenced a body path with no active subscription.
    #[error("unknown doc id: {0}")]
    UnknownDocId(String),

    /// The CRDT engine rejected a command or returned an unexpected response tag.
    #[error("engine error: {0}")]
    Engine(String),

    /// The first-join handshake failed (e.g. snapshot download error).
    #[error("handshake error: {0}")]
    Handshake(String),

    /// A JSON control message failed to parse.
    #[error("control message parse error: {0}")]
    ControlMessage(#[from] serde_json::Error),

    /// Reconnection attempts were exhausted.
    #[error("max reconnect attempts exceeded")]
    MaxReconnectExceeded,

    /// The session was destroyed; no further operations are valid on it.
    #[error("session destroyed")]
    Destroyed,

    /// Underlying I/O failure (snapshot import, local storage).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The HTTP snapshot fetch failed.
    #[error("snapshot fetch error: {0}")]
    Snapshot(String),

    /// Base64 decode failure on a `CrdtState` payload.
    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),
}
