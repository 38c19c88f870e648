//! # `quillsync`
//!
//! Client-side synchronization core for a collaborative note-taking
//! workspace: framed binary WebSocket transports, a CRDT engine adaptor
//! contract, handshake/session state machines, a debounced session manager,
//! and an encrypted peer-to-peer fallback.
//!
//! The CRDT engine itself — state-vector math, update merging, on-disk
//! materialization — is treated as an external collaborator behind the
//! [`crdt::SyncEngine`] trait; this crate owns the wire protocol and the
//! connection lifecycle around it, not the CRDT implementation.

#![warn(missing_docs)]

/// Session configuration shared across transport components.
pub mod config;

/// Sync error type.
pub mod error;

/// Filesystem abstraction used by the CRDT engine adaptor's disk-persistence
/// side.
pub mod fs;

/// Frame codecs, the engine adaptor contract, and the transport components
/// (single-doc, multiplexed body, unified v2, session manager, P2P bridge).
pub mod crdt;
