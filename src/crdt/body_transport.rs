//! Multiplexed body transport: many body documents share one WebSocket.
//!
//! Frames are v1 (`varuint7`-length-prefixed path ‖ payload, see
//! [`crate::crdt::frame`]). Each subscribed file path gets its own
//! `SyncStep1` handshake and its own debounced-synced signal, but all of it
//! rides the same socket and the same reconnect loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, watch};

use super::control_message::ControlMessage;
use super::engine::SyncEngine;
use super::frame::{format_body_doc_id, frame_body_message_v1, unframe_body_message_v1};
use super::reconnect::{MAX_RECONNECT_ATTEMPTS, backoff_delay};
use super::sync_types::{SyncEvent, SyncEventCallback, SyncStatus};
use super::ws::{WsEvent, WsHandle};
use crate::error::{Result, SyncError};

/// How long to wait for a subscription to reach `synced` before timing out,
/// unless the caller asks for a different value.
const DEFAULT_WAIT_FOR_SYNC_MS: u64 = 30_000;

/// Configuration for a multiplexed body transport connection.
#[derive(Debug, Clone)]
pub struct BodyTransportConfig {
    /// WebSocket server URL, e.g. `wss://sync.example.com/sync`.
    pub server_url: String,
    /// Workspace id this transport multiplexes body docs for.
    pub workspace_id: String,
    /// Whether the engine should persist synced changes to disk.
    pub write_to_disk: bool,
}

impl BodyTransportConfig {
    /// Build the connection URL: `{serverUrl}?doc={workspaceId}&multiplexed=true`.
    pub fn build_url(&self) -> String {
        format!(
            "{}?doc={}&multiplexed=true",
            self.server_url, self.workspace_id
        )
    }
}

fn should_send_response(last_response: Option<&[u8]>, candidate: &[u8], synced: bool) -> bool {
    !(synced && last_response == Some(candidate))
}

struct Subscription {
    synced: watch::Sender<bool>,
    last_response: Option<Vec<u8>>,
    last_sent_sv: Option<Vec<u8>>,
}

/// One WebSocket shared by every body document in a workspace.
pub struct BodyTransport<E: SyncEngine> {
    engine: Arc<E>,
    config: BodyTransportConfig,
    handle: Mutex<Option<WsHandle>>,
    status: Mutex<SyncStatus>,
    on_event: Mutex<Option<SyncEventCallback>>,
    subscriptions: Mutex<HashMap<String, Subscription>>,
    running: Arc<AtomicBool>,
}

impl<E: SyncEngine + 'static> BodyTransport<E> {
    /// Create a new, unconnected transport.
    pub fn new(engine: Arc<E>, config: BodyTransportConfig) -> Arc<Self> {
        Arc::new(Self {
            engine,
            config,
            handle: Mutex::new(None),
            status: Mutex::new(SyncStatus::Disconnected),
            on_event: Mutex::new(None),
            subscriptions: Mutex::new(HashMap::new()),
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

    /// Subscribe to a file path. Sends its `SyncStep1` immediately if
    /// connected; otherwise the subscription is replayed on the next
    /// successful connect. Calling this again for an already-subscribed path
    /// is a no-op (the existing synced watch is returned).
    pub async fn subscribe(self: &Arc<Self>, file_path: &str) -> watch::Receiver<bool> {
        let mut subs = self.subscriptions.lock().await;
        if let Some(existing) = subs.get(file_path) {
            return existing.synced.subscribe();
        }
        let (tx, rx) = watch::channel(false);
        subs.insert(
            file_path.to_string(),
            Subscription {
                synced: tx,
                last_response: None,
                last_sent_sv: None,
            },
        );
        drop(subs);

        if self.handle.lock().await.is_some() {
            if let Err(e) = self.send_step1_for(file_path).await {
                self.emit(SyncEvent::Error {
                    message: e.to_string(),
                });
            }
        }
        rx
    }

    /// Drop a subscription. Does not notify the server.
    pub async fn unsubscribe(&self, file_path: &str) {
        self.subscriptions.lock().await.remove(file_path);
    }

    /// Wait until `file_path` reaches the synced state, or the timeout elapses.
    pub async fn wait_for_sync(&self, file_path: &str, timeout_ms: Option<u64>) -> Result<()> {
        let mut rx = {
            let subs = self.subscriptions.lock().await;
            match subs.get(file_path) {
                Some(sub) => sub.synced.subscribe(),
                None => return Err(SyncError::UnknownDocId(file_path.to_string())),
            }
        };
        if *rx.borrow() {
            return Ok(());
        }
        let timeout = Duration::from_millis(timeout_ms.unwrap_or(DEFAULT_WAIT_FOR_SYNC_MS));
        tokio::time::timeout(timeout, async {
            loop {
                if *rx.borrow() {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        })
        .await
        .map_err(|_| SyncError::Transport(format!("wait_for_sync timed out for {file_path}")))
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

            self.reset_subscriptions_for_reconnect().await;
            self.set_status(SyncStatus::Connecting).await;

            let url = self.config.build_url();
            match WsHandle::connect(&url).await {
                Ok((handle, rx)) => {
                    attempt = 0;
                    *self.handle.lock().await = Some(handle);
                    self.set_status(SyncStatus::Connected).await;
                    if let Err(e) = self.replay_subscriptions().await {
                        self.emit(SyncEvent::Error {
                            message: e.to_string(),
                        });
                    }
                    if let Err(e) = self.run_session(rx).await {
                        self.emit(SyncEvent::Error {
                            message: e.to_string(),
                        });
                    }
                    *self.handle.lock().await = None;
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

    async fn replay_subscriptions(&self) -> Result<()> {
        let paths: Vec<String> = self.subscriptions.lock().await.keys().cloned().collect();
        for path in paths {
            self.send_step1_for(&path).await?;
        }
        Ok(())
    }

    async fn reset_subscriptions_for_reconnect(&self) {
        let mut subs = self.subscriptions.lock().await;
        for sub in subs.values_mut() {
            sub.last_response = None;
            sub.last_sent_sv = None;
            let _ = sub.synced.send(false);
        }
        drop(subs);
        self.engine.reset();
    }

    async fn send_step1_for(&self, file_path: &str) -> Result<()> {
        let doc_name = format_body_doc_id(&self.config.workspace_id, file_path);
        let step1 = self.engine.create_sync_step1(&doc_name).await?;
        self.send_framed(file_path, &step1).await
    }

    async fn run_session(
        &self,
        mut rx: tokio::sync::mpsc::UnboundedReceiver<WsEvent>,
    ) -> Result<()> {
        while let Some(event) = rx.recv().await {
            match event {
                WsEvent::Binary(data) => self.handle_incoming(&data).await?,
                WsEvent::Text(text) => self.handle_control_message(&text).await,
                WsEvent::Pong => {}
                WsEvent::Closed => break,
            }
        }
        Ok(())
    }

    async fn handle_control_message(&self, text: &str) {
        let Ok(ctrl) = serde_json::from_str::<ControlMessage>(text) else {
            log::warn!("[body_transport] failed to parse control message");
            return;
        };
        match ctrl {
            ControlMessage::SyncProgress { completed, total } => {
                self.emit(SyncEvent::Progress { completed, total });
            }
            ControlMessage::SyncComplete { files_synced } => {
                let paths: Vec<String> = {
                    let subs = self.subscriptions.lock().await;
                    subs.keys().cloned().collect()
                };
                for path in &paths {
                    if let Some(sub) = self.subscriptions.lock().await.get(path) {
                        let _ = sub.synced.send(true);
                    }
                    self.emit(SyncEvent::BodyChanged {
                        file_path: path.clone(),
                    });
                }
                log::info!("[body_transport] sync complete ({files_synced} files)");
                self.set_status(SyncStatus::Synced).await;
            }
            _ => {}
        }
    }

    async fn handle_incoming(&self, data: &[u8]) -> Result<()> {
        let (path, payload) =
            unframe_body_message_v1(data).map_err(|e| SyncError::Framing(e.to_string()))?;
        let doc_name = format_body_doc_id(&self.config.workspace_id, &path);
        let response = self
            .engine
            .handle_sync_message(&doc_name, &payload, self.config.write_to_disk)
            .await?;

        let already_synced = {
            let subs = self.subscriptions.lock().await;
            subs.get(&path).map(|s| *s.synced.borrow()).unwrap_or(false)
        };

        match response {
            Some(bytes) => {
                let last = {
                    let subs = self.subscriptions.lock().await;
                    subs.get(&path).and_then(|s| s.last_response.clone())
                };
                if should_send_response(last.as_deref(), &bytes, already_synced) {
                    self.send_framed(&path, &bytes).await?;
                    if let Some(sub) = self.subscriptions.lock().await.get_mut(&path) {
                        sub.last_response = Some(bytes);
                    }
                } else if let Some(sub) = self.subscriptions.lock().await.get_mut(&path) {
                    let _ = sub.synced.send(true);
                }
            }
            None => {
                if let Some(sub) = self.subscriptions.lock().await.get_mut(&path) {
                    let _ = sub.synced.send(true);
                }
            }
        }

        self.emit(SyncEvent::BodyChanged {
            file_path: path.clone(),
        });
        Ok(())
    }

    async fn send_framed(&self, file_path: &str, payload: &[u8]) -> Result<()> {
        let framed = frame_body_message_v1(file_path, payload);
        let guard = self.handle.lock().await;
        match guard.as_ref() {
            Some(handle) => handle.send_binary(framed),
            None => Err(SyncError::Transport("not connected".to_string())),
        }
    }

    /// Compute and send any locally originated changes for `file_path` not
    /// yet sent to the server.
    pub async fn send_local_changes(&self, file_path: &str) -> Result<()> {
        let doc_name = format_body_doc_id(&self.config.workspace_id, file_path);
        let last_sv = {
            let subs = self.subscriptions.lock().await;
            subs.get(file_path).and_then(|s| s.last_sent_sv.clone())
        };
        let current_sv = self.engine.get_body_sync_state(&doc_name).await?;
        if last_sv.as_deref() == Some(current_sv.as_slice()) {
            return Ok(());
        }
        let missing = self
            .engine
            .get_body_missing_updates(&doc_name, last_sv.as_deref().unwrap_or(&[]))
            .await?;
        if !missing.is_empty() {
            let message = self
                .engine
                .create_update_message(&doc_name, &missing)
                .await?;
            self.send_framed(file_path, &message).await?;
        }
        if let Some(sub) = self.subscriptions.lock().await.get_mut(file_path) {
            sub.last_sent_sv = Some(current_sv);
            sub.last_response = None;
        }
        Ok(())
    }

    /// Final teardown: no further reconnects are scheduled.
    pub async fn destroy(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().await.take() {
            handle.close();
        }
        self.subscriptions.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_url_includes_workspace_and_multiplex_flag() {
        let config = BodyTransportConfig {
            server_url: "wss://sync.example.com/sync".to_string(),
            workspace_id: "ws1".to_string(),
            write_to_disk: true,
        };
        assert_eq!(
            config.build_url(),
            "wss://sync.example.com/sync?doc=ws1&multiplexed=true"
        );
    }

    #[test]
    fn ping_pong_suppression_matches_single_doc_semantics() {
        let last = b"same".to_vec();
        assert!(!should_send_response(Some(&last), b"same", true));
        assert!(should_send_response(Some(&last), b"same", false));
        assert!(should_send_response(None, b"anything", true));
    }
}
