use ptlrpc_core::{HashError, ObdUuid};
use thiserror::Error;

use crate::transport::TransportError;
use crate::wire::{WireError, MAX_BODY_SIZE};

/// `EINVAL`, reported when an error reply carries no status of its own.
pub const EINVAL: i32 = 22;

/// Outcome of a failed call.
///
/// Every way [`ClientEndpoint::send_and_wait`](crate::ClientEndpoint::send_and_wait)
/// can fail is one of these variants.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    /// No reply arrived within the RPC timeout.
    #[error("request timed out")]
    TimedOut,

    /// The caller interrupted the wait.
    #[error("request interrupted")]
    Interrupted,

    /// The peer replied with a non-zero status.
    #[error("remote status {0}")]
    RemoteStatus(i32),

    /// The transport refused the request. Never retried.
    #[error("transport failed: {0}")]
    TransportFailed(#[from] TransportError),

    /// The reply envelope could not be unpacked.
    #[error("malformed reply: {0}")]
    Unpacked(#[from] WireError),

    /// Recovery asked the caller to restart the call from scratch.
    #[error("request restarted by recovery")]
    Restarted,

    /// The request body is larger than a peer accepts. Nothing was sent.
    #[error("request body of {0} bytes exceeds {MAX_BODY_SIZE}")]
    BodyTooLarge(usize),

    /// The owning client endpoint was cleaned up.
    #[error("client endpoint cleaned up")]
    Aborted,
}

/// Result type for call operations.
pub type CallResult<T> = Result<T, CallError>;

/// Invalid [`RpcConfig`](crate::RpcConfig) values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// The RPC timeout is zero.
    #[error("rpc timeout must be non-zero")]
    ZeroTimeout,

    /// The in-flight bound is zero, no call could ever proceed.
    #[error("max rpcs in flight must be non-zero")]
    ZeroInFlight,

    /// The registry hash size is not a power of two.
    #[error("registry hash size {0} is not a non-zero power of two")]
    HashSize(u32),
}

/// Errors resolving a uuid to a connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    /// No peer is known for the uuid.
    #[error("cannot find peer {0}")]
    UnknownUuid(ObdUuid),

    /// The registry refused the operation.
    #[error("registry error: {0}")]
    Registry(#[from] HashError),
}
