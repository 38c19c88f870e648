//! Unified v2 transport: one WebSocket carries the workspace document and
//! every body document, multiplexed by canonical doc id (`frame_message_v2`).
//!
//! Split into two halves, mirroring the other transports:
//! - [`UnifiedSession`] is the message-driven protocol handler: feed it
//!   [`IncomingEvent`]s, get back [`SessionAction`]s to execute. It owns no
//!   I/O, so it is plain to unit test.
//! - [`UnifiedTransport`] is the platform layer: owns the WebSocket, the HTTP
//!   client for snapshot fetches, and the reconnect loop, and drives
//!   `UnifiedSession` from the events it observes.

use std::collections::HashSet;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use base64::Engine;
use tokio::sync::Mutex;

use super::control_message::ControlMessage;
use super::engine::SyncEngine;
use super::frame::{
    DocIdKind, format_body_doc_id, format_workspace_doc_id, frame_message_v2, parse_doc_id,
    unframe_message_v2,
};
use super::reconnect::{MAX_RECONNECT_ATTEMPTS, backoff_delay};
use super::sync_types::{SyncEvent, SyncEventCallback, SyncStatus};
use super::ws::{WsEvent, WsHandle};
use crate::error::{Result, SyncError};
use crate::fs::FileSystem;

/// Configuration for a unified v2 transport connection.
#[derive(Debug, Clone)]
pub struct UnifiedTransportConfig {
    /// Base HTTP(S) server URL, e.g. `https://sync.example.com`.
    pub server_url: String,
    /// Workspace id to sync.
    pub workspace_id: String,
    /// Bearer auth token (session token or share token), if any.
    pub auth_token: Option<String>,
    /// Whether to persist synced changes to disk.
    pub write_to_disk: bool,
}

impl UnifiedTransportConfig {
    /// Build the `/sync2` WebSocket URL, rewriting `http(s)://` to `ws(s)://`.
    fn build_ws_url(&self) -> String {
        let ws_server = self
            .server_url
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1);
        match &self.auth_token {
            Some(token) => format!("{ws_server}/sync2?token={token}"),
            None => format!("{ws_server}/sync2"),
        }
    }

    /// Build the snapshot-fetch URL used after a `FileManifest` that reports
    /// `client_is_new`.
    fn snapshot_url(&self) -> String {
        format!(
            "{}/api/workspaces/{}/snapshot",
            self.server_url, self.workspace_id
        )
    }
}

/// Internal handshake state machine.
#[derive(Debug, Clone, PartialEq)]
enum SessionState {
    AwaitingConnect,
    WaitingForHandshake,
    Active,
}

/// Events fed into [`UnifiedSession`] by the platform layer.
#[derive(Debug)]
pub enum IncomingEvent {
    /// WebSocket connected.
    Connected,
    /// A binary WebSocket frame arrived.
    BinaryMessage(Vec<u8>),
    /// A text WebSocket frame (JSON control message) arrived.
    TextMessage(String),
    /// A snapshot ZIP was downloaded and imported by the platform layer.
    SnapshotImported,
    /// The WebSocket disconnected.
    Disconnected,
}

/// Actions [`UnifiedSession::process`] asks the platform layer to perform.
#[derive(Debug)]
pub enum SessionAction {
    /// Send a binary frame.
    SendBinary(Vec<u8>),
    /// Send a text frame.
    SendText(String),
    /// Fetch `GET {httpBase}/api/workspaces/{id}/snapshot` and import it,
    /// then feed `SnapshotImported` back in.
    DownloadSnapshot,
    /// Surface a [`SyncEvent`] to subscribers.
    Emit(SyncEvent),
}

/// Message-driven protocol handler for the unified v2 transport. Holds no
/// I/O; the platform layer (`UnifiedTransport`) drives it.
pub struct UnifiedSession<E: SyncEngine> {
    engine: Arc<E>,
    workspace_id: String,
    write_to_disk: bool,
    state: Mutex<SessionState>,
    metadata_ready: Mutex<bool>,
    pending_body_docs: Mutex<HashSet<String>>,
    synced_emitted: Mutex<bool>,
}

impl<E: SyncEngine> UnifiedSession<E> {
    /// Create a new session bound to `workspace_id`.
    pub fn new(engine: Arc<E>, workspace_id: String, write_to_disk: bool) -> Self {
        Self {
            engine,
            workspace_id,
            write_to_disk,
            state: Mutex::new(SessionState::AwaitingConnect),
            metadata_ready: Mutex::new(false),
            pending_body_docs: Mutex::new(HashSet::new()),
            synced_emitted: Mutex::new(false),
        }
    }

    /// Process one incoming event, returning the actions the platform layer
    /// must carry out.
    pub async fn process(&self, event: IncomingEvent) -> Vec<SessionAction> {
        match event {
            IncomingEvent::Connected => self.handle_connected().await,
            IncomingEvent::BinaryMessage(data) => self.handle_binary_message(&data).await,
            IncomingEvent::TextMessage(text) => self.handle_text_message(&text).await,
            IncomingEvent::SnapshotImported => vec![SessionAction::SendText(
                serde_json::to_string(&super::control_message::ClientControlMessage::FilesReady)
                    .unwrap_or_else(|_| r#"{"type":"FilesReady"}"#.to_string()),
            )],
            IncomingEvent::Disconnected => self.handle_disconnected().await,
        }
    }

    async fn handle_connected(&self) -> Vec<SessionAction> {
        *self.state.lock().await = SessionState::WaitingForHandshake;
        *self.metadata_ready.lock().await = false;
        self.pending_body_docs.lock().await.clear();
        *self.synced_emitted.lock().await = false;

        let mut actions = Vec::new();
        match self.engine.create_workspace_sync_step1().await {
            Ok(step1) => {
                let doc_id = format_workspace_doc_id(&self.workspace_id);
                actions.push(SessionAction::SendBinary(frame_message_v2(&doc_id, &step1)));
            }
            Err(e) => actions.push(SessionAction::Emit(SyncEvent::Error {
                message: e.to_string(),
            })),
        }
        actions.push(SessionAction::Emit(SyncEvent::StatusChanged {
            status: SyncStatus::Connected,
        }));
        actions
    }

    async fn handle_disconnected(&self) -> Vec<SessionAction> {
        *self.state.lock().await = SessionState::AwaitingConnect;
        *self.metadata_ready.lock().await = false;
        self.pending_body_docs.lock().await.clear();
        *self.synced_emitted.lock().await = false;
        self.engine.reset();
        vec![SessionAction::Emit(SyncEvent::StatusChanged {
            status: SyncStatus::Disconnected,
        })]
    }

    async fn handle_binary_message(&self, data: &[u8]) -> Vec<SessionAction> {
        let state = self.state.lock().await.clone();
        match state {
            SessionState::WaitingForHandshake => {
                let mut actions = self.transition_to_active().await;
                actions.extend(self.route_binary_message(data).await);
                if let Some(synced) = self.maybe_emit_synced().await {
                    actions.push(synced);
                }
                actions
            }
            SessionState::Active => self.route_binary_message(data).await,
            SessionState::AwaitingConnect => {
                log::warn!("[unified] binary message received before connect");
                Vec::new()
            }
        }
    }

    async fn handle_text_message(&self, text: &str) -> Vec<SessionAction> {
        let state = self.state.lock().await.clone();
        match state {
            SessionState::WaitingForHandshake => self.handle_handshake_message(text).await,
            SessionState::Active => self.handle_control_message(text).await,
            SessionState::AwaitingConnect => {
                log::warn!("[unified] text message received before connect");
                Vec::new()
            }
        }
    }

    async fn handle_handshake_message(&self, text: &str) -> Vec<SessionAction> {
        let mut actions = Vec::new();
        let ctrl = match serde_json::from_str::<ControlMessage>(text) {
            Ok(ctrl) => ctrl,
            Err(_) => return actions,
        };

        match ctrl {
            ControlMessage::FileManifest {
                files,
                client_is_new,
            } => {
                let has_non_deleted_file = files
                    .iter()
                    .any(|f| !f.get("deleted").and_then(|d| d.as_bool()).unwrap_or(false));
                if client_is_new && has_non_deleted_file {
                    actions.push(SessionAction::DownloadSnapshot);
                } else {
                    actions.push(SessionAction::SendText(
                        serde_json::to_string(
                            &super::control_message::ClientControlMessage::FilesReady,
                        )
                        .unwrap_or_else(|_| r#"{"type":"FilesReady"}"#.to_string()),
                    ));
                }
            }
            ControlMessage::CrdtState { state } => {
                match base64::engine::general_purpose::STANDARD.decode(&state) {
                    Ok(bytes) => match self.engine.handle_crdt_state(&bytes).await {
                        Ok(count) => {
                            log::info!("[unified] applied crdt state ({count} files)");
                            *self.metadata_ready.lock().await = true;
                        }
                        Err(e) => actions.push(SessionAction::Emit(SyncEvent::Error {
                            message: e.to_string(),
                        })),
                    },
                    Err(e) => actions.push(SessionAction::Emit(SyncEvent::Error {
                        message: format!("failed to decode crdt state: {e}"),
                    })),
                }
                actions.extend(self.transition_to_active().await);
                if let Some(synced) = self.maybe_emit_synced().await {
                    actions.push(synced);
                }
            }
            ControlMessage::SessionJoined {} => {}
            ControlMessage::SyncComplete { .. } => {
                *self.metadata_ready.lock().await = true;
            }
            _ => {}
        }
        actions
    }

    async fn route_binary_message(&self, data: &[u8]) -> Vec<SessionAction> {
        let mut actions = Vec::new();
        let Some((doc_id, payload)) = unframe_message_v2(data) else {
            log::debug!("[unified] failed to unframe binary message");
            return actions;
        };

        match parse_doc_id(&doc_id) {
            Some(DocIdKind::Workspace(_)) => {
                match self
                    .engine
                    .handle_workspace_sync_message(&payload, self.write_to_disk)
                    .await
                {
                    Ok(outcome) => {
                        if let Some(response) = outcome.response {
                            actions.push(SessionAction::SendBinary(frame_message_v2(
                                &doc_id, &response,
                            )));
                        }
                        if outcome.sync_complete {
                            *self.metadata_ready.lock().await = true;
                        }
                        if !outcome.changed_files.is_empty() {
                            actions.push(SessionAction::Emit(SyncEvent::FilesChanged {
                                files: outcome.changed_files,
                            }));
                        }
                        let all_paths = self.engine.get_all_file_paths().await.unwrap_or_default();
                        actions.extend(self.queue_body_sync_step1(&all_paths, false).await);
                        if let Some(synced) = self.maybe_emit_synced().await {
                            actions.push(synced);
                        }
                    }
                    Err(e) => actions.push(SessionAction::Emit(SyncEvent::Error {
                        message: e.to_string(),
                    })),
                }
            }
            Some(DocIdKind::Body { file_path, .. }) => {
                match self
                    .engine
                    .handle_body_sync_message(&doc_id, &payload, self.write_to_disk)
                    .await
                {
                    Ok(outcome) => {
                        self.pending_body_docs.lock().await.remove(&file_path);
                        if let Some(response) = outcome.response {
                            actions.push(SessionAction::SendBinary(frame_message_v2(
                                &doc_id, &response,
                            )));
                        }
                        if outcome.content.is_some() && !outcome.is_echo {
                            actions.push(SessionAction::Emit(SyncEvent::BodyChanged {
                                file_path,
                            }));
                        }
                        if let Some(synced) = self.maybe_emit_synced().await {
                            actions.push(synced);
                        }
                    }
                    Err(e) => actions.push(SessionAction::Emit(SyncEvent::Error {
                        message: e.to_string(),
                    })),
                }
            }
            None => log::debug!("[unified] unknown doc id: {doc_id}"),
        }
        actions
    }

    async fn handle_control_message(&self, text: &str) -> Vec<SessionAction> {
        let mut actions = Vec::new();
        let Ok(ctrl) = serde_json::from_str::<ControlMessage>(text) else {
            return actions;
        };
        match ctrl {
            ControlMessage::SyncProgress { completed, total } => {
                actions.push(SessionAction::Emit(SyncEvent::Progress { completed, total }));
            }
            ControlMessage::SyncComplete { .. } => {
                *self.metadata_ready.lock().await = true;
                if let Some(synced) = self.maybe_emit_synced().await {
                    actions.push(synced);
                }
            }
            ControlMessage::FocusListChanged { files } => {
                actions.push(SessionAction::Emit(SyncEvent::FocusListChanged { files }));
            }
            _ => {}
        }
        actions
    }

    async fn transition_to_active(&self) -> Vec<SessionAction> {
        *self.state.lock().await = SessionState::Active;
        let mut actions = vec![SessionAction::Emit(SyncEvent::StatusChanged {
            status: SyncStatus::Syncing {
                completed: 0,
                total: 0,
            },
        })];
        *self.metadata_ready.lock().await = true;

        let all_paths = self.engine.get_all_file_paths().await.unwrap_or_default();
        actions.extend(self.queue_body_sync_step1(&all_paths, true).await);
        actions
    }

    async fn queue_body_sync_step1(
        &self,
        file_paths: &[String],
        reset_pending: bool,
    ) -> Vec<SessionAction> {
        let mut actions = Vec::new();
        let mut targets = Vec::new();
        {
            let mut pending = self.pending_body_docs.lock().await;
            if reset_pending {
                pending.clear();
            }
            for path in file_paths {
                if pending.insert(path.clone()) || reset_pending {
                    targets.push(path.clone());
                }
            }
        }
        for path in targets {
            let doc_id = format_body_doc_id(&self.workspace_id, &path);
            match self.engine.create_sync_step1(&doc_id).await {
                Ok(step1) => {
                    actions.push(SessionAction::SendBinary(frame_message_v2(&doc_id, &step1)));
                }
                Err(e) => actions.push(SessionAction::Emit(SyncEvent::Error {
                    message: e.to_string(),
                })),
            }
        }
        actions
    }

    async fn maybe_emit_synced(&self) -> Option<SessionAction> {
        let metadata_ready = *self.metadata_ready.lock().await;
        let pending_empty = self.pending_body_docs.lock().await.is_empty();
        let mut emitted = self.synced_emitted.lock().await;
        if metadata_ready && pending_empty && !*emitted {
            *emitted = true;
            return Some(SessionAction::Emit(SyncEvent::StatusChanged {
                status: SyncStatus::Synced,
            }));
        }
        None
    }
}

/// Owns the WebSocket, the HTTP client for snapshot fetches, and the
/// reconnect loop for the unified v2 transport.
pub struct UnifiedTransport<E: SyncEngine> {
    session: UnifiedSession<E>,
    config: UnifiedTransportConfig,
    http: reqwest::Client,
    fs: Arc<dyn FileSystem>,
    handle: Mutex<Option<WsHandle>>,
    status: Mutex<SyncStatus>,
    on_event: Mutex<Option<SyncEventCallback>>,
    running: Arc<AtomicBool>,
}

impl<E: SyncEngine + 'static> UnifiedTransport<E> {
    /// Create a new, unconnected transport. `fs` receives the files unpacked
    /// from a first-join workspace snapshot before CRDT sync takes over.
    pub fn new(engine: Arc<E>, config: UnifiedTransportConfig, fs: Arc<dyn FileSystem>) -> Arc<Self> {
        let session = UnifiedSession::new(
            Arc::clone(&engine),
            config.workspace_id.clone(),
            config.write_to_disk,
        );
        Arc::new(Self {
            session,
            config,
            http: reqwest::Client::new(),
            fs,
            handle: Mutex::new(None),
            status: Mutex::new(SyncStatus::Disconnected),
            on_event: Mutex::new(None),
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    /// Register the callback invoked for every [`SyncEvent`].
    pub async fn set_on_event(&self, callback: SyncEventCallback) {
        *self.on_event.lock().await = Some(callback);
    }

    fn emit(&self, event: SyncEvent) {
        if let Ok(guard) = self.on_event.try_lock() {
            if let Some(cb) = guard.as_ref() {
                cb(event);
            }
        }
    }

    async fn set_status(&self, status: SyncStatus) {
        *self.status.lock().await = status.clone();
        self.emit(SyncEvent::StatusChanged { status });
    }

    /// Current connection status.
    pub async fn status(&self) -> SyncStatus {
        self.status.lock().await.clone()
    }

    /// Connect and run the reconnect-governed session loop in the background.
    pub fn connect(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run_with_reconnect().await;
        });
    }

    async fn run_with_reconnect(self: Arc<Self>) {
        let mut attempt = 0u32;
        while self.running.load(Ordering::SeqCst) {
            if attempt > 0 {
                if attempt > MAX_RECONNECT_ATTEMPTS {
                    self.set_status(SyncStatus::Error {
                        message: "max reconnect attempts exceeded".to_string(),
                    })
                    .await;
                    return;
                }
                self.set_status(SyncStatus::Reconnecting { attempt }).await;
                tokio::time::sleep(backoff_delay(attempt - 1)).await;
                if !self.running.load(Ordering::SeqCst) {
                    return;
                }
            }

            self.set_status(SyncStatus::Connecting).await;
            let url = self.config.build_ws_url();
            match WsHandle::connect(&url).await {
                Ok((handle, rx)) => {
                    attempt = 0;
                    *self.handle.lock().await = Some(handle);
                    if let Err(e) = self.run_session(rx).await {
                        self.emit(SyncEvent::Error {
                            message: e.to_string(),
                        });
                    }
                    *self.handle.lock().await = None;
                    self.dispatch(self.session.process(IncomingEvent::Disconnected).await)
                        .await;
                }
                Err(e) => {
                    self.emit(SyncEvent::Error {
                        message: e.to_string(),
                    });
                    attempt += 1;
                    continue;
                }
            }

            if self.running.load(Ordering::SeqCst) {
                attempt += 1;
            }
        }
    }

    async fn run_session(
        self: &Arc<Self>,
        mut rx: tokio::sync::mpsc::UnboundedReceiver<WsEvent>,
    ) -> Result<()> {
        self.dispatch(self.session.process(IncomingEvent::Connected).await)
            .await;

        while let Some(event) = rx.recv().await {
            match event {
                WsEvent::Binary(data) => {
                    let actions = self
                        .session
                        .process(IncomingEvent::BinaryMessage(data))
                        .await;
                    self.dispatch(actions).await;
                }
                WsEvent::Text(text) => {
                    let actions = self.session.process(IncomingEvent::TextMessage(text)).await;
                    self.dispatch(actions).await;
                }
                WsEvent::Pong => {}
                WsEvent::Closed => break,
            }
        }
        Ok(())
    }

    async fn dispatch(self: &Arc<Self>, actions: Vec<SessionAction>) {
        for action in actions {
            match action {
                SessionAction::SendBinary(data) => {
                    if let Err(e) = self.send_binary(&data).await {
                        self.emit(SyncEvent::Error {
                            message: e.to_string(),
                        });
                    }
                }
                SessionAction::SendText(text) => {
                    if let Err(e) = self.send_text(text).await {
                        self.emit(SyncEvent::Error {
                            message: e.to_string(),
                        });
                    }
                }
                SessionAction::DownloadSnapshot => {
                    let this = Arc::clone(self);
                    tokio::spawn(async move {
                        if let Err(e) = this.download_and_import_snapshot().await {
                            this.emit(SyncEvent::Error {
                                message: e.to_string(),
                            });
                        }
                    });
                }
                SessionAction::Emit(event) => self.emit(event),
            }
        }
    }

    async fn download_and_import_snapshot(self: &Arc<Self>) -> Result<()> {
        let mut request = self.http.get(self.config.snapshot_url());
        if let Some(ref token) = self.config.auth_token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| SyncError::Snapshot(e.to_string()))?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| SyncError::Snapshot(e.to_string()))?;

        // A near-empty body means the server has nothing to seed us with;
        // treat it the same as "no snapshot" rather than as import failure.
        if bytes.len() > 100 {
            self.import_snapshot_archive(&bytes)?;
        }

        let actions = self.session.process(IncomingEvent::SnapshotImported).await;
        self.dispatch(actions).await;
        Ok(())
    }

    /// Unpack a workspace snapshot ZIP into local storage, ahead of the CRDT
    /// sync that follows `FilesReady`. Directories and dotfiles are skipped;
    /// entries that aren't valid UTF-8 (binary attachments) are skipped too,
    /// since `FileSystem` only carries text content.
    fn import_snapshot_archive(&self, bytes: &[u8]) -> Result<()> {
        let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
            .map_err(|e| SyncError::Snapshot(format!("invalid snapshot archive: {e}")))?;

        for i in 0..archive.len() {
            let mut entry = archive
                .by_index(i)
                .map_err(|e| SyncError::Snapshot(format!("failed to read snapshot entry: {e}")))?;
            if entry.is_dir() {
                continue;
            }
            let name = entry.name().to_string();
            if name.split('/').any(|part| part.starts_with('.')) {
                continue;
            }

            let mut contents = String::new();
            if entry.read_to_string(&mut contents).is_err() {
                log::warn!("[unified] skipping non-utf8 snapshot entry: {name}");
                continue;
            }

            let path = PathBuf::from(&name);
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    self.fs.create_dir_all(parent).map_err(|e| {
                        SyncError::Snapshot(format!("failed to create directory: {e}"))
                    })?;
                }
            }
            self.fs
                .write_file(&path, &contents)
                .map_err(|e| SyncError::Snapshot(format!("failed to write {name}: {e}")))?;
        }
        Ok(())
    }

    async fn send_binary(&self, data: &[u8]) -> Result<()> {
        let guard = self.handle.lock().await;
        match guard.as_ref() {
            Some(handle) => handle.send_binary(data.to_vec()),
            None => Err(SyncError::Transport("not connected".to_string())),
        }
    }

    async fn send_text(&self, text: String) -> Result<()> {
        let guard = self.handle.lock().await;
        match guard.as_ref() {
            Some(handle) => handle.send_text(text),
            None => Err(SyncError::Transport("not connected".to_string())),
        }
    }

    /// Final teardown: save state, close the socket, stop reconnecting.
    pub async fn destroy(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().await.take() {
            handle.close();
        }
        self.session.engine.save_crdt_state().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_ws_url_rewrites_scheme_and_appends_token() {
        let config = UnifiedTransportConfig {
            server_url: "https://sync.example.com".to_string(),
            workspace_id: "ws1".to_string(),
            auth_token: Some("tok".to_string()),
            write_to_disk: true,
        };
        assert_eq!(
            config.build_ws_url(),
            "wss://sync.example.com/sync2?token=tok"
        );
    }

    #[test]
    fn build_ws_url_without_token() {
        let config = UnifiedTransportConfig {
            server_url: "http://localhost:8787".to_string(),
            workspace_id: "ws1".to_string(),
            auth_token: None,
            write_to_disk: true,
        };
        assert_eq!(config.build_ws_url(), "ws://localhost:8787/sync2");
    }

    #[test]
    fn snapshot_url_is_scoped_to_workspace() {
        let config = UnifiedTransportConfig {
            server_url: "https://sync.example.com".to_string(),
            workspace_id: "ws42".to_string(),
            auth_token: None,
            write_to_disk: true,
        };
        assert_eq!(
            config.snapshot_url(),
            "https://sync.example.com/api/workspaces/ws42/snapshot"
        );
    }
}
