//! Session manager: reference-counted lifecycle for collaborative documents.
//!
//! Multiple callers (editor tabs, preview panes) can ask for the same
//! document; the manager hands out the existing connection if one is live,
//! opens a fresh one otherwise, and only tears a connection down once every
//! caller has released it. Local edits are debounced 5s before triggering the
//! caller-supplied save hook, so a burst of keystrokes becomes one disk write.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::engine::SyncEngine;
use super::single_doc::{SingleDocConfig, SingleDocTransport};
use crate::error::Result;

/// How long to wait after the last local edit before invoking the
/// markdown-save hook (§4.F).
const SAVE_DEBOUNCE: Duration = Duration::from_secs(5);

/// Callback invoked after a document's debounced save window elapses.
pub type MarkdownSaveCallback = Arc<dyn Fn(String) + Send + Sync>;

/// Minimal surface the session manager needs from a document's transport, so
/// it stays agnostic to which transport variant (single-doc, multiplexed,
/// unified) actually backs a given document.
#[async_trait]
pub trait DocumentTransport: Send + Sync {
    /// Push any locally originated changes that haven't been sent yet.
    async fn push_local_changes(&self) -> Result<()>;
    /// Tear the connection down, persisting state first.
    async fn teardown(&self) -> Result<()>;
}

#[async_trait]
impl<E: SyncEngine + 'static> DocumentTransport for SingleDocTransport<E> {
    async fn push_local_changes(&self) -> Result<()> {
        self.send_local_changes().await
    }

    async fn teardown(&self) -> Result<()> {
        self.destroy().await;
        Ok(())
    }
}

struct ManagedDocument {
    transport: Arc<dyn DocumentTransport>,
    refcount: usize,
    debounce_generation: Arc<AtomicU64>,
}

/// Tracks every currently-open collaborative document, reference-counted by
/// caller, with debounced save and clean teardown.
pub struct SessionManager<E: SyncEngine> {
    engine: Arc<E>,
    server_url: Mutex<String>,
    documents: Mutex<HashMap<String, ManagedDocument>>,
    on_markdown_save: Mutex<Option<MarkdownSaveCallback>>,
}

impl<E: SyncEngine + 'static> SessionManager<E> {
    /// Create a new session manager bound to `server_url`.
    pub fn new(engine: Arc<E>, server_url: String) -> Arc<Self> {
        Arc::new(Self {
            engine,
            server_url: Mutex::new(server_url),
            documents: Mutex::new(HashMap::new()),
            on_markdown_save: Mutex::new(None),
        })
    }

    /// Register the callback invoked after a document's debounced save
    /// window elapses.
    pub async fn set_on_markdown_save(&self, callback: MarkdownSaveCallback) {
        *self.on_markdown_save.lock().await = Some(callback);
    }

    /// Get (or open) the connection for `doc_name`, incrementing its
    /// refcount. Pair with [`Self::release_document`].
    pub async fn get_collaborative_document(
        self: &Arc<Self>,
        doc_name: &str,
    ) -> Arc<dyn DocumentTransport> {
        let mut docs = self.documents.lock().await;
        if let Some(existing) = docs.get_mut(doc_name) {
            existing.refcount += 1;
            return Arc::clone(&existing.transport);
        }

        let server_url = self.server_url.lock().await.clone();
        let transport = SingleDocTransport::new(
            Arc::clone(&self.engine),
            SingleDocConfig {
                server_url,
                doc_name: doc_name.to_string(),
                session_code: None,
                owner_id: None,
                token: None,
                write_to_disk: true,
                host_mode: false,
            },
        );
        transport.connect();

        docs.insert(
            doc_name.to_string(),
            ManagedDocument {
                transport: Arc::clone(&transport) as Arc<dyn DocumentTransport>,
                refcount: 1,
                debounce_generation: Arc::new(AtomicU64::new(0)),
            },
        );
        Arc::clone(&docs.get(doc_name).unwrap().transport)
    }

    /// Release one reference to `doc_name`. Once the refcount drops to zero,
    /// any pending debounced save is flushed, the engine's CRDT state is
    /// saved, and only then is the connection torn down.
    pub async fn release_document(self: &Arc<Self>, doc_name: &str) -> Result<()> {
        let should_teardown = {
            let mut docs = self.documents.lock().await;
            match docs.get_mut(doc_name) {
                Some(entry) => {
                    entry.refcount = entry.refcount.saturating_sub(1);
                    entry.refcount == 0
                }
                None => return Ok(()),
            }
        };

        if should_teardown {
            // Bump the generation first so an in-flight debounce task (if any)
            // sees itself as stale and becomes a no-op once we flush below.
            if let Some(entry) = self.documents.lock().await.get(doc_name) {
                entry.debounce_generation.fetch_add(1, Ordering::SeqCst);
            }
            self.flush_markdown_save(doc_name).await;
            self.engine.save_crdt_state().await?;

            let entry = self.documents.lock().await.remove(doc_name);
            if let Some(entry) = entry {
                entry.transport.teardown().await?;
            }
        }
        Ok(())
    }

    /// Notify the manager that `doc_name` changed locally. Arms (or
    /// re-arms) the 5s debounced save timer.
    pub async fn notify_local_edit(self: &Arc<Self>, doc_name: &str) {
        let generation = {
            let docs = self.documents.lock().await;
            match docs.get(doc_name) {
                Some(entry) => entry.debounce_generation.fetch_add(1, Ordering::SeqCst) + 1,
                None => return,
            }
        };

        let this = Arc::clone(self);
        let doc_name = doc_name.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(SAVE_DEBOUNCE).await;
            let still_current = {
                let docs = this.documents.lock().await;
                match docs.get(&doc_name) {
                    Some(entry) => entry.debounce_generation.load(Ordering::SeqCst) == generation,
                    None => false,
                }
            };
            if !still_current {
                return;
            }
            this.flush_markdown_save(&doc_name).await;
        });
    }

    /// Save `doc_name`'s body content to disk, then hand the current
    /// CRDT-rendered content to the markdown-save callback, if one is
    /// registered.
    async fn flush_markdown_save(&self, doc_name: &str) {
        if let Err(e) = self.engine.save_body_doc(doc_name).await {
            log::warn!("[session manager] failed to save {doc_name}: {e}");
            return;
        }
        let content = match self.engine.get_body_content(doc_name).await {
            Ok(Some(content)) => content,
            Ok(None) => return,
            Err(e) => {
                log::warn!(
                    "[session manager] failed to read {doc_name} for markdown-save hook: {e}"
                );
                return;
            }
        };
        if let Ok(guard) = self.on_markdown_save.try_lock() {
            if let Some(cb) = guard.as_ref() {
                cb(content);
            }
        }
    }

    /// Reconfigure the server URL (e.g. the share/session code changed).
    /// Every currently open document is torn down and reopened, with its
    /// refcount preserved, against the new URL.
    pub async fn reconfigure(self: &Arc<Self>, server_url: String) -> Result<()> {
        *self.server_url.lock().await = server_url.clone();

        let old: Vec<(String, ManagedDocument)> =
            self.documents.lock().await.drain().collect();

        for (name, entry) in old {
            entry.transport.teardown().await?;

            let transport = SingleDocTransport::new(
                Arc::clone(&self.engine),
                SingleDocConfig {
                    server_url: server_url.clone(),
                    doc_name: name.clone(),
                    session_code: None,
                    owner_id: None,
                    token: None,
                    write_to_disk: true,
                    host_mode: false,
                },
            );
            transport.connect();
            self.documents.lock().await.insert(
                name,
                ManagedDocument {
                    transport: transport as Arc<dyn DocumentTransport>,
                    refcount: entry.refcount,
                    debounce_generation: Arc::new(AtomicU64::new(0)),
                },
            );
        }
        Ok(())
    }

    /// Tear down every open document, saving state first. Call on process
    /// exit.
    pub async fn shutdown_all(&self) -> Result<()> {
        let mut docs = self.documents.lock().await;
        for (_, entry) in docs.drain() {
            entry.transport.teardown().await?;
        }
        self.engine.save_crdt_state().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_debounce_is_five_seconds() {
        assert_eq!(SAVE_DEBOUNCE, Duration::from_secs(5));
    }
}
