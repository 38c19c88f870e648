//! Top-level configuration for a sync session.
//!
//! Individual transport components (`SingleDocConfig`, `BodyTransportConfig`,
//! `UnifiedTransportConfig`, `P2pConfig`) take their own narrower config
//! structs; `SyncConfig` is what a host application typically builds from
//! user settings and environment, then derives the others from.

use serde::{Deserialize, Serialize};

/// Which wire protocol a sync session should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// One WebSocket per document (`/sync?doc=`).
    SingleDoc,
    /// One WebSocket multiplexing every body document in a workspace
    /// (`/sync?doc={workspace}&multiplexed=true`).
    MultiplexedBody,
    /// One WebSocket multiplexing the workspace document and every body
    /// document (`/sync2`).
    Unified,
}

/// Top-level sync configuration, typically built once per workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Base server URL, e.g. `https://sync.example.com`.
    pub server_url: String,
    /// Workspace id to sync.
    pub workspace_id: String,
    /// Bearer auth token (session token or share token).
    #[serde(default)]
    pub auth_token: Option<String>,
    /// Active P2P/share session code, if any.
    #[serde(default)]
    pub session_code: Option<String>,
    /// Whether synced changes should be written to disk (false for one-shot
    /// / guest preview mode).
    #[serde(default = "default_write_to_disk")]
    pub write_to_disk: bool,
    /// Which transport variant to use for this session.
    pub transport: TransportKind,
    /// Whether the encrypted P2P fallback is enabled alongside the server
    /// transport.
    #[serde(default)]
    pub p2p_enabled: bool,
}

fn default_write_to_disk() -> bool {
    true
}

impl SyncConfig {
    /// Derive a [`crate::crdt::SingleDocConfig`] for `doc_name` from this
    /// session configuration.
    pub fn single_doc_config(&self, doc_name: &str) -> crate::crdt::SingleDocConfig {
        crate::crdt::SingleDocConfig {
            server_url: self.server_url.clone(),
            doc_name: doc_name.to_string(),
            session_code: self.session_code.clone(),
            owner_id: None,
            token: self.auth_token.clone(),
            write_to_disk: self.write_to_disk,
            host_mode: false,
        }
    }

    /// Derive a [`crate::crdt::BodyTransportConfig`] from this session
    /// configuration.
    pub fn body_transport_config(&self) -> crate::crdt::BodyTransportConfig {
        crate::crdt::BodyTransportConfig {
            server_url: self.server_url.clone(),
            workspace_id: self.workspace_id.clone(),
            write_to_disk: self.write_to_disk,
        }
    }

    /// Derive a [`crate::crdt::UnifiedTransportConfig`] from this session
    /// configuration.
    pub fn unified_transport_config(&self) -> crate::crdt::UnifiedTransportConfig {
        crate::crdt::UnifiedTransportConfig {
            server_url: self.server_url.clone(),
            workspace_id: self.workspace_id.clone(),
            auth_token: self.auth_token.clone(),
            write_to_disk: self.write_to_disk,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_with_defaults() {
        let json = r#"{"server_url":"https://sync.example.com","workspace_id":"ws1","transport":"unified"}"#;
        let config: SyncConfig = serde_json::from_str(json).unwrap();
        assert!(config.write_to_disk);
        assert!(config.auth_token.is_none());
        assert_eq!(config.transport, TransportKind::Unified);
    }

    #[test]
    fn derives_single_doc_config() {
        let config = SyncConfig {
            server_url: "wss://sync.example.com/sync".to_string(),
            workspace_id: "ws1".to_string(),
            auth_token: Some("tok".to_string()),
            session_code: None,
            write_to_disk: true,
            transport: TransportKind::SingleDoc,
            p2p_enabled: false,
        };
        let doc_config = config.single_doc_config("workspace:ws1");
        assert_eq!(doc_config.doc_name, "workspace:ws1");
        assert_eq!(doc_config.token.as_deref(), Some("tok"));
    }
}
