//! Single-doc transport: one WebSocket bound to one logical document.
//!
//! Drives the SyncStep1/SyncStep2/Update exchange, a debounced "synced"
//! signal, ping-pong loop breaking, and reconnect with backoff. This is the
//! `/sync?doc={docName}` endpoint (non-multiplexed).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;

use super::engine::SyncEngine;
use super::reconnect::{MAX_RECONNECT_ATTEMPTS, backoff_delay};
use super::sync_types::{SyncEvent, SyncEventCallback, SyncStatus};
use super::ws::{WsEvent, WsHandle};
use crate::error::Result;

/// How long to wait, after the last incoming frame, before declaring the
/// document synced (§4.C).
const SYNCED_DEBOUNCE: Duration = Duration::from_millis(300);

/// Configuration for a single-doc transport connection.
#[derive(Debug, Clone)]
pub struct SingleDocConfig {
    /// WebSocket server URL, e.g. `wss://sync.example.com/sync`.
    pub server_url: String,
    /// Doc name to bind to.
    pub doc_name: String,
    /// Active P2P/share session code, if any.
    pub session_code: Option<String>,
    /// Owner id, for share sessions.
    pub owner_id: Option<String>,
    /// Bearer auth token.
    pub token: Option<String>,
    /// Whether the engine should persist synced changes to disk.
    pub write_to_disk: bool,
    /// Host mode: immediately seed the server with our full document state
    /// after the initial SyncStep1 (used when we are the authoritative side).
    pub host_mode: bool,
}

impl SingleDocConfig {
    /// Build the connection URL: `{serverUrl}?doc={docName}[&session=][&ownerId=][&token=]`.
    pub fn build_url(&self) -> String {
        let mut url = format!("{}?doc={}", self.server_url, self.doc_name);
        if let Some(ref session) = self.session_code {
            url.push_str("&session=");
            url.push_str(session);
        }
        if let Some(ref owner) = self.owner_id {
            url.push_str("&ownerId=");
            url.push_str(owner);
        }
        if let Some(ref token) = self.token {
            url.push_str("&token=");
            url.push_str(token);
        }
        url
    }
}

/// Ping-pong suppression (P4): decide whether a candidate response is worth
/// sending given the last response we sent and whether we're already synced.
fn should_send_response(last_response: Option<&[u8]>, candidate: &[u8], synced: bool) -> bool {
    if synced && last_response == Some(candidate) {
        return false;
    }
    true
}

/// One WebSocket bound to one logical document.
pub struct SingleDocTransport<E: SyncEngine> {
    engine: Arc<E>,
    config: SingleDocConfig,
    handle: Mutex<Option<WsHandle>>,
    status: Mutex<SyncStatus>,
    on_event: Mutex<Option<SyncEventCallback>>,
    synced: AtomicBool,
    last_sent_sv: Mutex<Option<Vec<u8>>>,
    last_response: Mutex<Option<Vec<u8>>>,
    debounce_generation: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
}

impl<E: SyncEngine + 'static> SingleDocTransport<E> {
    /// Create a new, unconnected transport.
    pub fn new(engine: Arc<E>, config: SingleDocConfig) -> Arc<Self> {
        Arc::new(Self {
            engine,
            config,
            handle: Mutex::new(None),
            status: Mutex::new(SyncStatus::Disconnected),
            on_event: Mutex::new(None),
            synced: AtomicBool::new(false),
            last_sent_sv: Mutex::new(None),
            last_response: Mutex::new(None),
            debounce_generation: Arc::new(AtomicU64::new(0)),
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

    /// Whether the document has reached the debounced synced state.
    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
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

            self.reset_on_disconnect();
            self.set_status(SyncStatus::Connecting).await;

            let url = self.config.build_url();
            match WsHandle::connect(&url).await {
                Ok((handle, rx)) => {
                    attempt = 0;
                    *self.handle.lock().await = Some(handle);
                    self.set_status(SyncStatus::Connected).await;
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

    async fn run_session(
        self: &Arc<Self>,
        mut rx: tokio::sync::mpsc::UnboundedReceiver<WsEvent>,
    ) -> Result<()> {
        // SyncStep1 on open.
        let step1 = self.engine.create_sync_step1(&self.config.doc_name).await?;
        self.send_binary(&step1).await?;

        if self.config.host_mode {
            let full_state = self.engine.get_full_state().await?;
            let update = self
                .engine
                .create_update_message(&self.config.doc_name, &full_state)
                .await?;
            self.send_binary(&update).await?;
        }

        while let Some(event) = rx.recv().await {
            match event {
                WsEvent::Binary(data) => self.handle_incoming(&data).await?,
                WsEvent::Text(_) | WsEvent::Pong => {}
                WsEvent::Closed => break,
            }
        }
        Ok(())
    }

    async fn handle_incoming(self: &Arc<Self>, data: &[u8]) -> Result<()> {
        let response = self
            .engine
            .handle_sync_message(&self.config.doc_name, data, self.config.write_to_disk)
            .await?;

        if let Some(ref bytes) = response {
            let last = self.last_response.lock().await;
            let send = should_send_response(last.as_deref(), bytes, self.is_synced());
            drop(last);
            if send {
                self.send_binary(bytes).await?;
                *self.last_response.lock().await = Some(bytes.clone());
            }
        }

        self.emit(SyncEvent::BodyChanged {
            file_path: self.config.doc_name.clone(),
        });

        self.arm_synced_debounce();
        Ok(())
    }

    fn arm_synced_debounce(self: &Arc<Self>) {
        let generation = self.debounce_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let this = Arc::clone(self);
        let gen_ref = Arc::clone(&self.debounce_generation);
        tokio::spawn(async move {
            tokio::time::sleep(SYNCED_DEBOUNCE).await;
            if gen_ref.load(Ordering::SeqCst) == generation {
                this.synced.store(true, Ordering::SeqCst);
                this.set_status(SyncStatus::Synced).await;
            }
        });
    }

    async fn send_binary(&self, data: &[u8]) -> Result<()> {
        let guard = self.handle.lock().await;
        match guard.as_ref() {
            Some(handle) => handle.send_binary(data.to_vec()),
            None => Err(crate::error::SyncError::Transport("not connected".to_string())),
        }
    }

    /// Compute and broadcast any locally originated changes not yet sent.
    ///
    /// Clears the cached last-sent response so the next server echo of our
    /// own update is not mistaken for a ping-pong loop.
    pub async fn send_local_changes(&self) -> Result<()> {
        let last_sv = self.last_sent_sv.lock().await.clone();
        let current_sv = self.engine.get_sync_state().await?;
        if last_sv.as_deref() == Some(current_sv.as_slice()) {
            return Ok(());
        }
        let missing = self
            .engine
            .get_missing_updates(last_sv.as_deref().unwrap_or(&[]))
            .await?;
        if !missing.is_empty() {
            let message = self
                .engine
                .create_update_message(&self.config.doc_name, &missing)
                .await?;
            self.send_binary(&message).await?;
        }
        *self.last_sent_sv.lock().await = Some(current_sv);
        *self.last_response.lock().await = None;
        Ok(())
    }

    fn reset_on_disconnect(&self) {
        self.synced.store(false, Ordering::SeqCst);
        self.debounce_generation.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut sv) = self.last_sent_sv.try_lock() {
            *sv = None;
        }
        if let Ok(mut resp) = self.last_response.try_lock() {
            *resp = None;
        }
        self.engine.reset();
    }

    /// Final teardown: no further reconnects are scheduled.
    pub async fn destroy(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().await.take() {
            handle.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_url_includes_doc_and_optional_params() {
        let config = SingleDocConfig {
            server_url: "wss://sync.example.com/sync".to_string(),
            doc_name: "workspace:w1".to_string(),
            session_code: Some("ABCD1234-EFGH5678".to_string()),
            owner_id: None,
            token: Some("tok".to_string()),
            write_to_disk: true,
            host_mode: false,
        };
        let url = config.build_url();
        assert!(url.starts_with("wss://sync.example.com/sync?doc=workspace:w1"));
        assert!(url.contains("&session=ABCD1234-EFGH5678"));
        assert!(url.contains("&token=tok"));
        assert!(!url.contains("ownerId"));
    }

    #[test]
    fn ping_pong_suppression_drops_identical_response_once_synced() {
        let last = b"same".to_vec();
        assert!(!should_send_response(Some(&last), b"same", true));
        assert!(should_send_response(Some(&last), b"same", false));
        assert!(should_send_response(Some(&last), b"different", true));
        assert!(should_send_response(None, b"same", true));
    }
}
