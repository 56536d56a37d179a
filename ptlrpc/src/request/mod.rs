//! A single RPC and its lifecycle.
//!
//! The caller owns a [`Request`] handle; the connection's lists own further
//! shared references to the same [`RequestInner`]. The caller's share is given
//! up with [`Request::finish`], the lists' share by commit GC, cleanup or
//! retirement. Memory goes away when both are gone.

mod state;

pub use state::RequestState;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;

use crate::bulk::BulkDesc;
use crate::connection::{ConnLevel, Connection};
use crate::interrupt::Interrupt;
use crate::wire::{Message, MsgHeader};

/// Shared request state.
pub(crate) struct RequestInner {
    pub(crate) opc: u32,
    pub(crate) client: u64,
    pub(crate) request_portal: u32,
    pub(crate) reply_portal: u32,
    pub(crate) body: Bytes,
    pub(crate) conn: Arc<Connection>,
    pub(crate) interrupt: Interrupt,
    level: Mutex<ConnLevel>,
    xid: AtomicU64,
    transno: Mutex<Option<u64>>,
    state: watch::Sender<RequestState>,
    replay: AtomicBool,
    caller_done: AtomicBool,
    reply: Mutex<Option<Bytes>>,
    bulk: Mutex<Option<BulkDesc>>,
}

impl RequestInner {
    pub(crate) fn new(
        client: u64,
        request_portal: u32,
        reply_portal: u32,
        conn: Arc<Connection>,
        opc: u32,
        body: Bytes,
    ) -> Arc<Self> {
        Arc::new(Self {
            opc,
            client,
            request_portal,
            reply_portal,
            body,
            conn,
            interrupt: Interrupt::new(),
            level: Mutex::new(ConnLevel::Full),
            xid: AtomicU64::new(0),
            transno: Mutex::new(None),
            state: watch::Sender::new(RequestState::New),
            replay: AtomicBool::new(false),
            caller_done: AtomicBool::new(false),
            reply: Mutex::new(None),
            bulk: Mutex::new(None),
        })
    }

    pub(crate) fn xid(&self) -> u64 {
        self.xid.load(Ordering::Acquire)
    }

    pub(crate) fn set_xid(&self, xid: u64) {
        self.xid.store(xid, Ordering::Release);
    }

    pub(crate) fn transno(&self) -> Option<u64> {
        *self.transno.lock()
    }

    pub(crate) fn set_transno(&self, transno: u64) {
        *self.transno.lock() = Some(transno);
    }

    pub(crate) fn level(&self) -> ConnLevel {
        *self.level.lock()
    }

    pub(crate) fn set_level(&self, level: ConnLevel) {
        *self.level.lock() = level;
    }

    pub(crate) fn state(&self) -> RequestState {
        *self.state.borrow()
    }

    pub(crate) fn set_state(&self, state: RequestState) {
        self.state.send_replace(state);
    }

    /// Move to `to` if the current state satisfies `from`.
    pub(crate) fn transition<F>(&self, from: F, to: RequestState) -> bool
    where
        F: FnOnce(RequestState) -> bool,
    {
        self.state.send_if_modified(|state| {
            if from(*state) {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<RequestState> {
        self.state.subscribe()
    }

    pub(crate) fn is_replay(&self) -> bool {
        self.replay.load(Ordering::Acquire)
    }

    pub(crate) fn set_replay(&self, replay: bool) {
        self.replay.store(replay, Ordering::Release);
    }

    pub(crate) fn caller_done(&self) -> bool {
        self.caller_done.load(Ordering::Acquire)
    }

    pub(crate) fn store_reply(&self, bytes: Bytes) {
        *self.reply.lock() = Some(bytes);
    }

    pub(crate) fn reply(&self) -> Option<Bytes> {
        self.reply.lock().clone()
    }

    /// Wire bytes for a send under `xid`.
    pub(crate) fn pack(&self, xid: u64) -> Bytes {
        let header = MsgHeader::request(self.opc, xid, self.transno().unwrap_or(0));
        Message::new(header, self.body.clone()).pack()
    }

    /// Ask the waiting caller to retransmit.
    pub(crate) fn resend(&self) -> bool {
        if !self.transition(RequestState::is_outstanding, RequestState::Resend) {
            return false;
        }
        debug!(xid = self.xid(), opc = self.opc, "resend request");
        self.set_level(ConnLevel::Recovering);
        true
    }

    /// Ask the waiting caller to restart the call.
    pub(crate) fn restart(&self) -> bool {
        if !self.transition(RequestState::is_outstanding, RequestState::Restart) {
            return false;
        }
        debug!(xid = self.xid(), opc = self.opc, "restart request");
        true
    }
}

/// Wait until `rx` reports a state that ends a reply wait.
pub(crate) async fn wait_wake(rx: &mut watch::Receiver<RequestState>) -> RequestState {
    loop {
        let state = *rx.borrow_and_update();
        if state.is_wake() {
            return state;
        }
        // The sender lives in the request, which the waiter holds.
        if rx.changed().await.is_err() {
            return RequestState::Failed;
        }
    }
}

/// Caller handle for one RPC.
///
/// Dropping the handle calls [`finish`](Self::finish).
pub struct Request {
    inner: Arc<RequestInner>,
}

impl Request {
    pub(crate) fn new(inner: Arc<RequestInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &Arc<RequestInner> {
        &self.inner
    }

    /// Operation code.
    pub fn opc(&self) -> u32 {
        self.inner.opc
    }

    /// Sequence id of the latest send, zero before the first one.
    pub fn xid(&self) -> u64 {
        self.inner.xid()
    }

    /// Transaction number from the reply, if one arrived.
    pub fn transno(&self) -> Option<u64> {
        self.inner.transno()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> RequestState {
        self.inner.state()
    }

    /// Minimum connection level required to send.
    pub fn level(&self) -> ConnLevel {
        self.inner.level()
    }

    /// Set the minimum connection level required to send.
    ///
    /// Setup and recovery calls lower this so they can run before the
    /// connection is fully established.
    pub fn set_level(&self, level: ConnLevel) {
        self.inner.set_level(level);
    }

    /// Pin the request for replay: commit GC will keep it.
    pub fn set_replay(&self) {
        self.inner.set_replay(true);
    }

    /// Unpin the request.
    pub fn clear_replay(&self) {
        self.inner.set_replay(false);
    }

    /// Whether the request is pinned for replay.
    pub fn is_replay(&self) -> bool {
        self.inner.is_replay()
    }

    /// Connection the request is bound to.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.inner.conn
    }

    /// Handle that interrupts the caller's wait.
    pub fn interrupt_handle(&self) -> Interrupt {
        self.inner.interrupt.clone()
    }

    /// Attach a bulk descriptor, returning the previous one.
    pub fn attach_bulk(&self, desc: BulkDesc) -> Option<BulkDesc> {
        self.inner.bulk.lock().replace(desc)
    }

    /// Detach the bulk descriptor.
    pub fn take_bulk(&self) -> Option<BulkDesc> {
        self.inner.bulk.lock().take()
    }

    /// Whether a bulk descriptor is attached.
    pub fn has_bulk(&self) -> bool {
        self.inner.bulk.lock().is_some()
    }

    /// Give up the caller's reference.
    ///
    /// Idempotent. A request still needed on the sending list stays there
    /// until commit GC or replay discards it.
    pub fn finish(&self) {
        if self.inner.caller_done.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.reply.lock().take();
        self.inner.conn.release_caller(&self.inner);
        debug!(xid = self.inner.xid(), opc = self.inner.opc, "request finished");
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        self.finish();
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("opc", &self.inner.opc)
            .field("xid", &self.inner.xid())
            .field("transno", &self.inner.transno())
            .field("state", &self.inner.state())
            .field("replay", &self.inner.is_replay())
            .finish()
    }
}
