//! # ptlrpc-core
//!
//! Core abstractions shared by the ptlrpc client runtime:
//!
//! - **Identifiers**: [`Nid`], [`ProcessId`] and [`ObdUuid`] name remote peers
//! - **Provider traits**: [`TimeProvider`] for sleeps and deadlines
//! - **Codec trait**: [`MessageCodec`] for typed request and reply bodies
//! - **Class hash**: [`ClassHash`], the two-level locked registry that maps
//!   peer keys to reference-counted exports and connections
//!
//! ## Class Hash
//!
//! The registry is generic over a [`HashOps`] implementation that supplies the
//! hash function, the key comparison and the reference acquire/release hooks.
//! Tables may be *unique* (one live entry per key) or *multi* (several entries
//! share a key); both modes use the same bucket scan.

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

mod codec;
pub mod hash;
mod time;
mod types;

// Codec exports
pub use codec::{CodecError, JsonCodec, MessageCodec};

// Provider trait exports
pub use time::{TimeError, TimeProvider, TokioTimeProvider};

// Class hash exports
pub use hash::{djb2, ClassHash, HashError, HashOps};

// Core type exports
pub use types::{Nid, NidParseError, ObdUuid, ProcessId, UuidError, LNET_SERVER_PID, UUID_MAX};
