//! The CRDT engine adaptor.
//!
//! The engine itself — state-vector math, update merging, history, disk
//! persistence — is an external collaborator; only its contract lives here, as a
//! typed command/response interface. All commands are asynchronous and every
//! response is tagged, never a bare guess at the caller's expectations: a
//! rejected command surfaces as `Err`, not as a wrong-shaped `Ok`.
//!
//! Implementations are expected to be cheap to clone-share (`Arc<dyn SyncEngine>`)
//! since every transport component holds a reference to the same engine.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;

/// Result of handing a unified-transport workspace message to the engine.
#[derive(Debug, Clone, Default)]
pub struct WorkspaceSyncOutcome {
    /// Bytes to send back to the server, if the engine produced a reply.
    pub response: Option<Vec<u8>>,
    /// Paths whose workspace metadata changed as a result of this message.
    pub changed_files: Vec<String>,
    /// Whether the engine considers the workspace document now fully synced.
    pub sync_complete: bool,
}

/// Result of handing a unified-transport body message to the engine.
#[derive(Debug, Clone, Default)]
pub struct BodySyncOutcome {
    /// Bytes to send back to the server, if the engine produced a reply.
    pub response: Option<Vec<u8>>,
    /// The document's rendered content, if this message changed it.
    pub content: Option<String>,
    /// Whether this message was an echo of a locally originated update.
    pub is_echo: bool,
}

/// File-system side effects emitted by the engine after a message is applied
/// with `write_to_disk = true`.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A sync session started for a document.
    SyncStarted { doc_name: String },
    /// A sync session completed for a document.
    SyncCompleted { doc_name: String },
    /// Overall sync status changed.
    SyncStatusChanged { status: String },
    /// Progress update while syncing many body documents.
    SyncProgress { completed: usize, total: usize },
    /// A file was created on disk.
    FileCreated { path: String },
    /// A file was deleted on disk.
    FileDeleted { path: String },
    /// A file's body contents changed on disk.
    ContentsChanged { path: String },
    /// A file's frontmatter metadata changed on disk.
    MetadataChanged { path: String },
    /// A file was renamed.
    FileRenamed { from: String, to: String },
    /// A file was moved to a different location.
    FileMoved { from: String, to: String },
    /// The engine has an outgoing sync message that must be sent on the
    /// transport bound to `doc_name` (e.g. a spontaneous local update).
    SendSyncMessage {
        doc_name: String,
        message: Vec<u8>,
        is_body: bool,
    },
}

/// Callback invoked for every [`EngineEvent`].
pub type EngineEventCallback = Arc<dyn Fn(EngineEvent) + Send + Sync>;

/// Typed façade over the backend CRDT engine's command/response channel.
///
/// `doc` parameters are doc *names* (the local form; see [`crate::crdt::frame`]
/// for the wire doc-id encoding), not raw file paths.
#[async_trait]
pub trait SyncEngine: Send + Sync {
    // ---- Workspace ops ----

    /// Opaque state-vector bytes summarizing locally known workspace updates.
    async fn get_sync_state(&self) -> Result<Vec<u8>>;
    /// Apply a remote update to the workspace document.
    async fn apply_remote_update(&self, update: &[u8]) -> Result<Option<String>>;
    /// Compute the update bytes a peer with state vector `remote_sv` is missing.
    async fn get_missing_updates(&self, remote_sv: &[u8]) -> Result<Vec<u8>>;
    /// The full current state of the workspace document.
    async fn get_full_state(&self) -> Result<Vec<u8>>;
    /// Persist the current CRDT state to durable storage.
    async fn save_crdt_state(&self) -> Result<()>;

    // ---- Body ops (per doc name) ----

    /// Current rendered body content, if the document is loaded.
    async fn get_body_content(&self, doc: &str) -> Result<Option<String>>;
    /// Overwrite a body document's content.
    async fn set_body_content(&self, doc: &str, content: &str) -> Result<()>;
    /// Opaque state-vector bytes for one body document.
    async fn get_body_sync_state(&self, doc: &str) -> Result<Vec<u8>>;
    /// Full current state of one body document.
    async fn get_body_full_state(&self, doc: &str) -> Result<Vec<u8>>;
    /// Apply a remote update to one body document.
    async fn apply_body_update(&self, doc: &str, update: &[u8]) -> Result<Option<String>>;
    /// Compute missing updates for a body document given a peer's state vector.
    async fn get_body_missing_updates(&self, doc: &str, remote_sv: &[u8]) -> Result<Vec<u8>>;
    /// Persist a body document.
    async fn save_body_doc(&self, doc: &str) -> Result<()>;
    /// Unload a body document from memory (does not delete it).
    async fn unload_body_doc(&self, doc: &str) -> Result<()>;
    /// List the doc names of currently loaded body documents.
    async fn list_loaded_body_docs(&self) -> Result<Vec<String>>;

    // ---- Protocol ops (single-doc transport) ----

    /// Build a SyncStep1 message (state-vector announcement) for `doc`.
    async fn create_sync_step1(&self, doc: &str) -> Result<Vec<u8>>;
    /// Decode, apply, and optionally produce a reply for an incoming sync message.
    async fn handle_sync_message(
        &self,
        doc: &str,
        bytes: &[u8],
        write_to_disk: bool,
    ) -> Result<Option<Vec<u8>>>;
    /// Wrap `update` as an Update message ready to send.
    async fn create_update_message(&self, doc: &str, update: &[u8]) -> Result<Vec<u8>>;

    // ---- Unified v2 variants ----

    /// Mark a body document as actively syncing (unified transport bookkeeping).
    async fn init_body_sync(&self, doc: &str) -> Result<()>;
    /// Mark a body document as no longer actively syncing.
    async fn close_body_sync(&self, doc: &str) -> Result<()>;
    /// Build the workspace document's SyncStep1 message.
    async fn create_workspace_sync_step1(&self) -> Result<Vec<u8>>;
    /// Decode, apply, and summarize the effect of a workspace sync message.
    async fn handle_workspace_sync_message(
        &self,
        bytes: &[u8],
        write_to_disk: bool,
    ) -> Result<WorkspaceSyncOutcome>;
    /// Decode, apply, and summarize the effect of a body sync message.
    async fn handle_body_sync_message(
        &self,
        doc: &str,
        bytes: &[u8],
        write_to_disk: bool,
    ) -> Result<BodySyncOutcome>;
    /// Apply a server-authoritative snapshot delivered as the `CrdtState`
    /// handshake message. Returns the number of files the snapshot touched.
    async fn handle_crdt_state(&self, bytes: &[u8]) -> Result<usize>;

    // ---- Auxiliary ----

    /// Configure guest-join and OPFS-backed storage behavior.
    async fn configure_sync_handler(&self, guest_join_code: Option<String>, uses_opfs: bool) -> Result<()>;
    /// Read the raw persisted CRDT document bytes for `doc`, if any.
    async fn get_crdt_file(&self, doc: &str) -> Result<Option<Vec<u8>>>;
    /// Overwrite the raw persisted CRDT document bytes for `doc`.
    async fn set_crdt_file(&self, doc: &str, bytes: &[u8]) -> Result<()>;
    /// List the doc names of every file tracked by the workspace CRDT.
    async fn list_crdt_files(&self) -> Result<Vec<String>>;
    /// All file paths currently known to the workspace document. Used to seed
    /// per-body SyncStep1 broadcasts on (re)connect.
    async fn get_all_file_paths(&self) -> Result<Vec<String>>;

    /// Register a callback for engine-originated events (local updates that
    /// must be broadcast, file-system side effects of a remote apply).
    fn set_event_callback(&self, callback: EngineEventCallback);
    /// Remove any registered event callback.
    fn clear_event_callback(&self);
    /// Reset per-connection bookkeeping (e.g. cached state vectors) after a
    /// transport disconnects. Does not discard document content.
    fn reset(&self);
}
