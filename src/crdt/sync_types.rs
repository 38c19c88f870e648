//! Shared sync types used by every transport component and by the session
//! manager.

use std::sync::Arc;

/// Configuration shared by every per-file sync session.
#[derive(Debug, Clone)]
pub struct SyncSessionConfig {
    /// Workspace id to sync.
    pub workspace_id: String,
    /// Whether to write changes to disk (false for one-shot / guest mode).
    pub write_to_disk: bool,
}

/// Events emitted by a transport or session to its subscribers.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncEvent {
    /// Connection status changed.
    StatusChanged {
        /// The new status.
        status: SyncStatus,
    },
    /// Sync progress update (bulk body handshake).
    Progress {
        /// Number of documents completed.
        completed: usize,
        /// Total number of documents to sync.
        total: usize,
    },
    /// Workspace files changed (metadata sync).
    FilesChanged {
        /// Changed file paths.
        files: Vec<String>,
    },
    /// A body document changed.
    BodyChanged {
        /// Path of the changed file.
        file_path: String,
    },
    /// The focus list (files other peers have open) changed.
    FocusListChanged {
        /// Currently focused paths.
        files: Vec<String>,
    },
    /// An error occurred.
    Error {
        /// Error message.
        message: String,
    },
}

/// Current connection/sync status, shared across every transport component.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum SyncStatus {
    /// P2P sync is turned off.
    Disabled,
    /// Not connected to the server.
    Disconnected,
    /// Connecting to the server.
    Connecting,
    /// Connected, handshake not yet complete.
    Connected,
    /// Performing initial sync.
    Syncing {
        /// Number of documents completed so far.
        completed: usize,
        /// Total number of documents to sync.
        total: usize,
    },
    /// Initial sync complete, watching for changes.
    Synced,
    /// Reconnecting after an unexpected disconnect.
    Reconnecting {
        /// Current reconnection attempt number.
        attempt: u32,
    },
    /// A connection error occurred; reconnection attempts were exhausted.
    Error {
        /// Error message describing what went wrong.
        message: String,
    },
}

/// Callback invoked whenever a [`SyncEvent`] fires.
pub type SyncEventCallback = Arc<dyn Fn(SyncEvent) + Send + Sync>;
