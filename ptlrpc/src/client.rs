use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use ptlrpc_core::{CodecError, MessageCodec};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, info};

use crate::config::RpcConfig;
use crate::connection::Connection;
use crate::error::ConfigError;
use crate::request::{Request, RequestInner, RequestState};
use crate::transport::Providers;
use crate::wire::{Message, MsgHeader};

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// A logical call channel to one connection.
///
/// Requests are serviced on `request_portal` and answered on
/// `reply_portal`. At most [`RpcConfig::max_rpcs_in_flight`] calls are
/// outstanding at once; further callers wait for a permit.
pub struct ClientEndpoint<P: Providers> {
    id: u64,
    pub(crate) name: String,
    request_portal: u32,
    reply_portal: u32,
    conn: Arc<Connection>,
    pub(crate) permits: Arc<Semaphore>,
    pub(crate) config: RpcConfig,
    pub(crate) providers: P,
    cleaned: AtomicBool,
}

impl<P: Providers> ClientEndpoint<P> {
    /// Create an endpoint bound to `conn`.
    ///
    /// # Errors
    ///
    /// Returns the first invalid value in `config`.
    pub fn new(
        name: impl Into<String>,
        request_portal: u32,
        reply_portal: u32,
        conn: Arc<Connection>,
        providers: P,
        config: RpcConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let name = name.into();
        let id = NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed);
        debug!(client = %name, id, peer = %conn.peer(), "client endpoint created");

        Ok(Self {
            id,
            name,
            request_portal,
            reply_portal,
            permits: Arc::new(Semaphore::new(config.max_rpcs_in_flight)),
            conn,
            config,
            providers,
            cleaned: AtomicBool::new(false),
        })
    }

    /// Endpoint name, used in log output.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Connection the endpoint sends on.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// Active configuration.
    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    /// In-flight permits currently free.
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Build a request for `opc` carrying `body`.
    ///
    /// The request requires [`ConnLevel::Full`](crate::ConnLevel::Full) until
    /// told otherwise.
    pub fn prepare(&self, opc: u32, body: impl Into<Bytes>) -> Request {
        Request::new(RequestInner::new(
            self.id,
            self.request_portal,
            self.reply_portal,
            Arc::clone(&self.conn),
            opc,
            body.into(),
        ))
    }

    /// Build a request whose body is `body` encoded with `codec`.
    pub fn prepare_typed<C, T>(&self, codec: &C, opc: u32, body: &T) -> Result<Request, CodecError>
    where
        C: MessageCodec,
        T: Serialize,
    {
        Ok(self.prepare(opc, codec.encode(body)?))
    }

    /// Forcibly retire every request this endpoint owns.
    ///
    /// Waiting callers observe [`CallError::Aborted`](crate::CallError::Aborted)
    /// and later calls fail the same way. Idempotent.
    pub fn cleanup(&self) {
        if self.cleaned.swap(true, Ordering::AcqRel) {
            return;
        }
        self.permits.close();

        let retired = self.conn.take_client_requests(self.id);
        for req in &retired {
            req.transition(|s| s != RequestState::Replied, RequestState::Failed);
        }
        info!(client = %self.name, retired = retired.len(), "client cleaned up");
    }
}

impl<P: Providers> Drop for ClientEndpoint<P> {
    fn drop(&mut self) {
        self.cleanup();
    }
}

impl<P: Providers> std::fmt::Debug for ClientEndpoint<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientEndpoint")
            .field("name", &self.name)
            .field("request_portal", &self.request_portal)
            .field("reply_portal", &self.reply_portal)
            .field("peer", &self.conn.peer())
            .finish_non_exhaustive()
    }
}

/// A successful reply.
#[derive(Debug, Clone)]
pub struct Reply {
    header: MsgHeader,
    body: Bytes,
}

impl Reply {
    pub(crate) fn new(msg: Message) -> Self {
        Self {
            header: msg.header,
            body: msg.body,
        }
    }

    /// Reply envelope header.
    pub fn header(&self) -> &MsgHeader {
        &self.header
    }

    /// Transaction number the peer assigned.
    pub fn transno(&self) -> u64 {
        self.header.transno
    }

    /// Reply body.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Decode the body with `codec`.
    pub fn decode<C, T>(&self, codec: &C) -> Result<T, CodecError>
    where
        C: MessageCodec,
        T: DeserializeOwned,
    {
        codec.decode(&self.body)
    }
}
