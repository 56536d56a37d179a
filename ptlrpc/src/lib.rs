//! # ptlrpc
//!
//! Client-side request/reply engine for a cluster filesystem.
//!
//! This crate provides:
//! - **Connections**: per-peer recovery level, sending/delayed/dying request
//!   lists and commit tracking
//! - **Client endpoints**: logical call channels bounding in-flight calls
//! - **Call engine**: send, wait with deadline, resend, restart and commit GC
//! - **Replay**: serial re-issue of uncommitted requests after failover
//! - **Wire envelope**: fixed little-endian header protected by CRC32C
//! - **Bulk descriptors**: page lists attached to requests for data movement
//!
//! ## Request lifecycle
//!
//! ```text
//! prepare ──► [gated on delayed list] ──► sent (sending list) ──► replied
//!                                            │    ▲                 │
//!                                  timeout ──┘    └── resend        ▼
//!                                                         commit GC / replay
//! ```
//!
//! A replied request stays on its connection's sending list until the peer
//! reports it committed, so it can be replayed if the peer fails over first.

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

// Re-export core types for convenience
pub use ptlrpc_core::{
    ClassHash, CodecError, HashError, HashOps, JsonCodec, MessageCodec, Nid, ObdUuid, ProcessId,
    TimeProvider, TokioTimeProvider, UuidError,
};

/// Bulk transfer descriptors.
pub mod bulk;

/// Client endpoints and the caller-facing call API.
pub mod client;

/// Runtime configuration.
pub mod config;

/// Connections, their request lists and the connection registry.
pub mod connection;

mod engine;

/// Error types for the call path.
pub mod error;

/// Exports keyed by client uuid and nid.
pub mod export;

mod interrupt;

/// Replay and recovery driver.
pub mod replay;

/// Requests and their lifecycle state.
pub mod request;

/// Transport collaborator and provider bundle.
pub mod transport;

/// Message envelope wire format.
pub mod wire;

// Client exports
pub use client::{ClientEndpoint, Reply};

// Configuration exports
pub use config::RpcConfig;

// Connection exports
pub use connection::{
    ConnHashOps, ConnLevel, Connection, ConnectionMetrics, ConnectionRegistry, PeerResolver,
    UuidTable,
};

// Error exports
pub use error::{CallError, CallResult, ConfigError, ResolveError};

// Export exports
pub use export::{Export, ExportTable, NidExportOps, UuidExportOps};

pub use interrupt::Interrupt;

// Replay exports
pub use replay::{Recovery, RecoveryNotifier};

// Request exports
pub use request::{Request, RequestState};

// Transport exports
pub use transport::{Outgoing, Providers, TokioProviders, Transport, TransportError};

// Bulk exports
pub use bulk::{page_debug_check, page_debug_setup, BulkDesc, BulkError, BulkPage, PAGE_SIZE};

// Wire format exports
pub use wire::{
    Message, MsgHeader, MsgType, WireError, HEADER_SIZE, MAGIC, MAX_BODY_SIZE, VERSION,
};
