use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use ptlrpc_core::{ProcessId, TimeProvider, TokioTimeProvider};
use thiserror::Error;

use crate::connection::Connection;

/// Errors reported by a [`Transport`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The peer cannot be reached.
    #[error("peer {0} unreachable")]
    Unreachable(ProcessId),

    /// The transport is shut down.
    #[error("transport closed")]
    Closed,

    /// Any other send failure.
    #[error("send failed: {0}")]
    SendFailed(String),
}

/// A packed request handed to the transport.
#[derive(Debug, Clone)]
pub struct Outgoing {
    /// Sequence id the reply will carry.
    pub xid: u64,
    /// Portal the peer services requests on.
    pub request_portal: u32,
    /// Portal the reply should be delivered to.
    pub reply_portal: u32,
    /// Wire bytes.
    pub bytes: Bytes,
}

/// The collaborator that moves bytes to a peer.
///
/// Replies travel the other way through
/// [`Connection::deliver_reply`], which the transport calls when a buffer
/// arrives for an xid it has seen go out.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send `msg` to the peer of `conn`.
    async fn send(&self, conn: &Connection, msg: Outgoing) -> Result<(), TransportError>;
}

/// Bundle of the providers the engine needs.
pub trait Providers: Clone + Send + Sync + 'static {
    /// Transport type.
    type Transport: Transport;

    /// Time provider type for deadlines.
    type Time: TimeProvider;

    /// Get the transport instance.
    fn transport(&self) -> &Self::Transport;

    /// Get the time provider instance.
    fn time(&self) -> &Self::Time;
}

/// Production providers: any transport plus Tokio time.
#[derive(Debug)]
pub struct TokioProviders<N> {
    transport: Arc<N>,
    time: TokioTimeProvider,
}

impl<N> TokioProviders<N> {
    /// Bundle `transport` with a Tokio time provider.
    pub fn new(transport: N) -> Self {
        Self::from_arc(Arc::new(transport))
    }

    /// Bundle a shared transport.
    pub fn from_arc(transport: Arc<N>) -> Self {
        Self {
            transport,
            time: TokioTimeProvider::new(),
        }
    }
}

impl<N> Clone for TokioProviders<N> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            time: self.time.clone(),
        }
    }
}

impl<N: Transport> Providers for TokioProviders<N> {
    type Transport = N;
    type Time = TokioTimeProvider;

    fn transport(&self) -> &Self::Transport {
        &self.transport
    }

    fn time(&self) -> &Self::Time {
        &self.time
    }
}
