//! Client-side sync core: frame codecs, the CRDT engine adaptor contract,
//! and the transport components built on top of it.

pub mod body_transport;
pub mod control_message;
pub mod engine;
pub mod frame;
pub mod p2p;
pub mod reconnect;
pub mod session_manager;
pub mod single_doc;
pub mod sync_types;
pub mod unified;
mod ws;

pub use body_transport::{BodyTransport, BodyTransportConfig};
pub use control_message::{ClientControlMessage, ControlMessage};
pub use engine::{BodySyncOutcome, EngineEvent, EngineEventCallback, SyncEngine, WorkspaceSyncOutcome};
pub use frame::{
    DocIdKind, FrameError, decode_varuint7, encode_varuint7, format_body_doc_id,
    format_workspace_doc_id, frame_body_message_v1, frame_message_v2, parse_doc_id,
    unframe_body_message_v1, unframe_message_v2,
};
pub use p2p::{
    ConflictResolution, ConflictResolver, P2pBridge, P2pConfig, STORAGE_KEY_P2P_ENABLED,
    STORAGE_KEY_P2P_SYNC_CODE, generate_session_code,
};
pub use reconnect::{MAX_RECONNECT_ATTEMPTS, backoff_delay};
pub use session_manager::{DocumentTransport, MarkdownSaveCallback, SessionManager};
pub use single_doc::{SingleDocConfig, SingleDocTransport};
pub use sync_types::{SyncEvent, SyncEventCallback, SyncSessionConfig, SyncStatus};
pub use unified::{IncomingEvent, SessionAction, UnifiedSession, UnifiedTransport, UnifiedTransportConfig};
pub use ws::{WsEvent, WsHandle};
