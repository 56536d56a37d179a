//! Per-peer connection state.
//!
//! A [`Connection`] keeps three ordered request lists under one lock:
//!
//! - **sending**: sent requests, awaiting a reply or commit
//! - **delayed**: requests gated on the connection level
//! - **dying**: committed requests whose caller still holds them
//!
//! Requests are only ever appended to the tail of the sending list, so it is
//! ordered by transaction number and commit GC can stop at the first
//! uncommitted entry.

mod metrics;
mod registry;

pub use metrics::ConnectionMetrics;
pub use registry::{ConnHashOps, ConnectionRegistry, PeerResolver, UuidTable};

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use ptlrpc_core::{ObdUuid, ProcessId};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::replay::RecoveryNotifier;
use crate::request::{RequestInner, RequestState};
use crate::wire::MsgHeader;

/// Recovery level of a connection.
///
/// A request may be sent once the connection level is at least the request's
/// required level. Ordinary requests require [`ConnLevel::Full`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConnLevel {
    /// Created, never connected.
    New,
    /// Connection setup in progress.
    Connecting,
    /// A failure was detected; only recovery traffic may flow.
    Recovering,
    /// Fully established.
    Full,
}

type RequestList = VecDeque<Arc<RequestInner>>;

struct ConnState {
    sending: RequestList,
    delayed: RequestList,
    dying: RequestList,
    /// Requests awaiting a reply, by the xid of their latest send.
    replies: HashMap<u64, Arc<RequestInner>>,
    xid_out: u64,
    last_xid: u64,
    last_committed: u64,
    metrics: ConnectionMetrics,
}

/// One remote peer.
pub struct Connection {
    peer: RwLock<ProcessId>,
    remote_uuid: RwLock<Option<ObdUuid>>,
    epoch: AtomicU64,
    level: watch::Sender<ConnLevel>,
    state: Mutex<ConnState>,
    recovery: RwLock<Option<Arc<dyn RecoveryNotifier>>>,
}

fn unlink(list: &mut RequestList, req: &Arc<RequestInner>) -> Option<Arc<RequestInner>> {
    let pos = list.iter().position(|r| Arc::ptr_eq(r, req))?;
    list.remove(pos)
}

impl ConnState {
    fn unlink_any(&mut self, req: &Arc<RequestInner>) -> Option<Arc<RequestInner>> {
        unlink(&mut self.sending, req)
            .or_else(|| unlink(&mut self.delayed, req))
            .or_else(|| unlink(&mut self.dying, req))
    }

    fn unregister_reply(&mut self, req: &Arc<RequestInner>) {
        let xid = req.xid();
        if self.replies.get(&xid).is_some_and(|r| Arc::ptr_eq(r, req)) {
            self.replies.remove(&xid);
        }
    }

    fn next_xid(&mut self, req: &Arc<RequestInner>) -> u64 {
        self.unregister_reply(req);
        self.xid_out += 1;
        let xid = self.xid_out;
        req.set_xid(xid);
        self.replies.insert(xid, Arc::clone(req));
        xid
    }

    fn record_commit(&mut self, req: &RequestInner, header: &MsgHeader) {
        req.set_transno(header.transno);
        self.last_xid = self.last_xid.max(header.last_xid);
        self.last_committed = self.last_committed.max(header.last_committed);
    }

    /// Remove committed requests from the head of the sending list.
    ///
    /// Returns the requests nobody else holds; the caller drops them once the
    /// connection lock is released.
    fn free_committed(&mut self) -> Vec<Arc<RequestInner>> {
        let mut freed = Vec::new();
        let mut i = 0;

        while i < self.sending.len() {
            let req = &self.sending[i];

            if req.is_replay() {
                debug!(xid = req.xid(), "keeping request for replay");
                i += 1;
                continue;
            }

            // Still awaiting its reply.
            let Some(transno) = req.transno() else {
                i += 1;
                continue;
            };

            if transno > self.last_committed {
                break;
            }

            debug!(
                xid = req.xid(),
                transno,
                last_committed = self.last_committed,
                "request committed"
            );
            let Some(req) = self.sending.remove(i) else {
                break;
            };
            self.metrics.record_committed();
            if req.caller_done() {
                freed.push(req);
            } else {
                self.dying.push_back(req);
            }
        }

        freed
    }
}

impl Connection {
    /// Create a connection to `peer` at level [`ConnLevel::New`].
    pub fn new(peer: ProcessId) -> Self {
        Self {
            peer: RwLock::new(peer),
            remote_uuid: RwLock::new(None),
            epoch: AtomicU64::new(0),
            level: watch::Sender::new(ConnLevel::New),
            state: Mutex::new(ConnState {
                sending: VecDeque::new(),
                delayed: VecDeque::new(),
                dying: VecDeque::new(),
                replies: HashMap::new(),
                xid_out: 0,
                last_xid: 0,
                last_committed: 0,
                metrics: ConnectionMetrics::new(),
            }),
            recovery: RwLock::new(None),
        }
    }

    /// Peer address.
    pub fn peer(&self) -> ProcessId {
        *self.peer.read()
    }

    pub(crate) fn set_peer(&self, peer: ProcessId) {
        *self.peer.write() = peer;
    }

    /// Uuid of the remote target, once resolved by uuid.
    pub fn remote_uuid(&self) -> Option<ObdUuid> {
        self.remote_uuid.read().clone()
    }

    pub(crate) fn set_remote_uuid(&self, uuid: ObdUuid) {
        *self.remote_uuid.write() = Some(uuid);
    }

    /// Number of times the connection was (re)bound to a uuid.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    pub(crate) fn bump_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Current recovery level.
    pub fn level(&self) -> ConnLevel {
        *self.level.borrow()
    }

    /// Change the recovery level, waking gated requests it now admits.
    pub fn set_level(&self, level: ConnLevel) {
        let old = self.level.send_replace(level);
        if old != level {
            info!(peer = %self.peer(), ?old, new = ?level, "connection level changed");
        }
    }

    /// Resolve once the level is at least `level`.
    pub async fn wait_for_level(&self, level: ConnLevel) {
        let mut rx = self.level.subscribe();
        loop {
            if *rx.borrow_and_update() >= level {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Install the collaborator told about request timeouts.
    pub fn set_recovery(&self, notifier: Arc<dyn RecoveryNotifier>) {
        *self.recovery.write() = Some(notifier);
    }

    /// Remove the recovery collaborator.
    pub fn clear_recovery(&self) {
        self.recovery.write().take();
    }

    pub(crate) fn notify_possible_failure(self: &Arc<Self>) {
        let notifier = self.recovery.read().clone();
        match notifier {
            Some(notifier) => notifier.notify_possible_failure(self),
            None => debug!(peer = %self.peer(), "no recovery notifier installed"),
        }
    }

    /// Highest transaction number the peer reported committed.
    pub fn last_committed(&self) -> u64 {
        self.state.lock().last_committed
    }

    /// Last xid the peer reported seeing.
    pub fn last_xid(&self) -> u64 {
        self.state.lock().last_xid
    }

    /// Snapshot of the traffic counters.
    pub fn metrics(&self) -> ConnectionMetrics {
        self.state.lock().metrics.clone()
    }

    /// Number of requests on the sending list.
    pub fn sending_len(&self) -> usize {
        self.state.lock().sending.len()
    }

    /// Number of requests on the delayed list.
    pub fn delayed_len(&self) -> usize {
        self.state.lock().delayed.len()
    }

    /// Number of requests on the dying list.
    pub fn dying_len(&self) -> usize {
        self.state.lock().dying.len()
    }

    /// Transaction numbers on the sending list, head first.
    pub fn sending_transnos(&self) -> Vec<Option<u64>> {
        self.state.lock().sending.iter().map(|r| r.transno()).collect()
    }

    /// Xids on the sending list, head first.
    pub fn sending_xids(&self) -> Vec<u64> {
        self.state.lock().sending.iter().map(|r| r.xid()).collect()
    }

    /// Hand a reply buffer to the request sent under `xid`.
    ///
    /// Returns false if no request is waiting on that xid, for example a late
    /// reply to a send that has since been superseded.
    pub fn deliver_reply(&self, xid: u64, bytes: Bytes) -> bool {
        let req = {
            let mut st = self.state.lock();
            let Some(req) = st.replies.remove(&xid) else {
                debug!(peer = %self.peer(), xid, "reply for unknown xid dropped");
                return false;
            };
            st.metrics.record_reply(bytes.len());
            req
        };

        req.store_reply(bytes);
        if !req.transition(RequestState::is_outstanding, RequestState::Replied) {
            debug!(xid, state = ?req.state(), "reply for request no longer waiting");
        }
        true
    }

    /// Run commit GC against the current commit point.
    ///
    /// Returns how many requests left the sending list.
    pub fn free_committed(&self) -> usize {
        let (count, freed) = {
            let mut st = self.state.lock();
            let before = st.sending.len();
            let freed = st.free_committed();
            (before - st.sending.len(), freed)
        };
        drop(freed);
        count
    }

    /// Move `req` to the tail of the delayed list.
    pub(crate) fn delay(&self, req: &Arc<RequestInner>) {
        let mut st = self.state.lock();
        let req = st.unlink_any(req).unwrap_or_else(|| Arc::clone(req));
        req.set_state(RequestState::Delayed);
        st.delayed.push_back(req);
    }

    /// Take `req` off the delayed list.
    pub(crate) fn undelay(&self, req: &Arc<RequestInner>) {
        let removed = unlink(&mut self.state.lock().delayed, req);
        drop(removed);
    }

    /// Assign a fresh xid, register for the reply and append to the sending
    /// list.
    pub(crate) fn prepare_send(&self, req: &Arc<RequestInner>) -> u64 {
        let mut st = self.state.lock();
        let req = st.unlink_any(req).unwrap_or_else(|| Arc::clone(req));
        let xid = st.next_xid(&req);
        req.set_state(RequestState::InFlight);
        st.sending.push_back(req);
        xid
    }

    /// Assign a fresh xid for a replay, leaving the list position alone.
    pub(crate) fn prepare_replay(&self, req: &Arc<RequestInner>) -> u64 {
        let mut st = self.state.lock();
        let xid = st.next_xid(req);
        req.set_state(RequestState::InFlight);
        xid
    }

    /// Stop waiting for a replay reply. The request keeps its list position.
    pub(crate) fn abandon_replay(&self, req: &Arc<RequestInner>) {
        self.state.lock().unregister_reply(req);
    }

    pub(crate) fn record_sent(&self, bytes: usize) {
        self.state.lock().metrics.record_sent(bytes);
    }

    pub(crate) fn record_timeout(&self) {
        self.state.lock().metrics.record_timeout();
    }

    /// Stop waiting for a reply to `req` and take it off every list.
    pub(crate) fn retire(&self, req: &Arc<RequestInner>, send_failed: bool) {
        let removed = {
            let mut st = self.state.lock();
            st.unregister_reply(req);
            if send_failed {
                st.metrics.record_send_failure();
            }
            st.unlink_any(req)
        };
        drop(removed);
    }

    /// Record a reply's transaction number and commit point, then run GC.
    pub(crate) fn commit(&self, req: &RequestInner, header: &MsgHeader) {
        let freed = {
            let mut st = self.state.lock();
            st.record_commit(req, header);
            st.free_committed()
        };
        drop(freed);
    }

    /// Record a replay reply. GC waits until the whole replay pass is done.
    pub(crate) fn record_replay(&self, req: &RequestInner, header: &MsgHeader) {
        let mut st = self.state.lock();
        st.record_commit(req, header);
        st.metrics.record_replay();
    }

    /// Replay-pinned requests on the sending list, head first.
    pub(crate) fn replayable(&self) -> Vec<Arc<RequestInner>> {
        self.state
            .lock()
            .sending
            .iter()
            .filter(|r| r.is_replay())
            .cloned()
            .collect()
    }

    /// Requests on the sending list still awaiting a reply.
    pub(crate) fn outstanding(&self) -> Vec<Arc<RequestInner>> {
        self.state
            .lock()
            .sending
            .iter()
            .filter(|r| r.state().is_outstanding())
            .cloned()
            .collect()
    }

    pub(crate) fn record_resends(&self, count: usize) {
        self.state.lock().metrics.resends += count as u64;
    }

    /// Unpin replayed requests that are now committed and free them, then
    /// run ordinary commit GC.
    ///
    /// Returns how many requests left the sending list.
    pub(crate) fn discard_committed_replays(&self) -> usize {
        let (count, freed) = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            let last_committed = st.last_committed;
            let mut freed = Vec::new();
            let before = st.sending.len();

            for req in std::mem::take(&mut st.sending) {
                let committed = req.transno().is_some_and(|t| t <= last_committed);
                if req.is_replay() && committed {
                    debug!(xid = req.xid(), transno = ?req.transno(), "discarding replayed request");
                    req.set_replay(false);
                    st.metrics.record_committed();
                    if req.caller_done() {
                        freed.push(req);
                    } else {
                        st.dying.push_back(req);
                    }
                } else {
                    st.sending.push_back(req);
                }
            }
            freed.extend(st.free_committed());
            (before - st.sending.len(), freed)
        };
        drop(freed);
        count
    }

    /// The caller is done with `req`: drop it from dying or delayed.
    pub(crate) fn release_caller(&self, req: &Arc<RequestInner>) {
        let released = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            unlink(&mut st.dying, req).or_else(|| unlink(&mut st.delayed, req))
        };
        drop(released);
    }

    /// Remove every request owned by `client` from all lists.
    pub(crate) fn take_client_requests(&self, client: u64) -> Vec<Arc<RequestInner>> {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        let mut taken = Vec::new();

        for (list, name) in [
            (&mut st.sending, "sending"),
            (&mut st.delayed, "delayed"),
            (&mut st.dying, "dying"),
        ] {
            list.retain(|req| {
                if req.client != client {
                    return true;
                }
                if name == "dying" {
                    warn!(xid = req.xid(), opc = req.opc, "request on the dying list at cleanup");
                } else {
                    debug!(xid = req.xid(), list = name, "cleaning request");
                }
                taken.push(Arc::clone(req));
                false
            });
        }
        st.replies.retain(|_, req| req.client != client);
        taken
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer())
            .field("remote_uuid", &self.remote_uuid())
            .field("level", &self.level())
            .field("epoch", &self.epoch())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Request;
    use crate::wire::MsgHeader;
    use ptlrpc_core::Nid;

    fn conn() -> Arc<Connection> {
        Arc::new(Connection::new(ProcessId::server(Nid::new(0, 1))))
    }

    fn request(conn: &Arc<Connection>, client: u64) -> Request {
        Request::new(RequestInner::new(
            client,
            12,
            10,
            Arc::clone(conn),
            36,
            Bytes::from_static(b"body"),
        ))
    }

    /// Send `req` and fake a reply carrying `transno` and `last_committed`.
    fn send_and_commit(conn: &Connection, req: &Request, transno: u64, last_committed: u64) {
        let xid = conn.prepare_send(req.inner());
        assert!(conn.deliver_reply(xid, Bytes::new()));
        let header = MsgHeader::request(req.opc(), xid, 0);
        let reply = MsgHeader::reply_to(&header, 0)
            .with_transno(transno)
            .with_commit(xid, last_committed);
        conn.commit(req.inner(), &reply);
    }

    #[test]
    fn test_send_order_matches_xid_order() {
        let conn = conn();
        let a = request(&conn, 1);
        let b = request(&conn, 1);

        let xa = conn.prepare_send(a.inner());
        let xb = conn.prepare_send(b.inner());

        assert!(xa < xb);
        assert_eq!(conn.sending_xids(), vec![xa, xb]);
        assert_eq!(a.state(), RequestState::InFlight);
    }

    #[test]
    fn test_resend_moves_to_tail_with_fresh_xid() {
        let conn = conn();
        let a = request(&conn, 1);
        let b = request(&conn, 1);
        let first = conn.prepare_send(a.inner());
        conn.prepare_send(b.inner());

        let second = conn.prepare_send(a.inner());
        assert!(second > first);
        assert_eq!(conn.sending_len(), 2);
        assert_eq!(conn.sending_xids().last(), Some(&second));
        // The old xid no longer matches anything.
        assert!(!conn.deliver_reply(first, Bytes::new()));
    }

    #[test]
    fn test_free_committed_stops_at_first_uncommitted() {
        let conn = conn();
        let reqs: Vec<_> = (0..4).map(|_| request(&conn, 1)).collect();
        for (req, transno) in reqs.iter().zip([3, 4, 8, 9]) {
            send_and_commit(&conn, req, transno, 0);
        }
        assert_eq!(conn.sending_len(), 4);

        send_and_commit(&conn, &request(&conn, 1), 10, 5);
        assert_eq!(
            conn.sending_transnos(),
            vec![Some(8), Some(9), Some(10)]
        );
        assert_eq!(conn.last_committed(), 5);
    }

    #[test]
    fn test_free_committed_keeps_replay_and_unreplied() {
        let conn = conn();
        let pinned = request(&conn, 1);
        pinned.set_replay();
        send_and_commit(&conn, &pinned, 1, 0);

        let waiting = request(&conn, 1);
        conn.prepare_send(waiting.inner());

        let plain = request(&conn, 1);
        send_and_commit(&conn, &plain, 2, 2);

        assert_eq!(conn.sending_transnos(), vec![Some(1), None]);
        for transno in conn.sending_transnos().into_iter().flatten() {
            assert!(transno > conn.last_committed() || pinned.is_replay());
        }
    }

    #[test]
    fn test_committed_request_waits_on_dying_until_finished() {
        let conn = conn();
        let req = request(&conn, 1);
        send_and_commit(&conn, &req, 1, 1);

        assert_eq!(conn.sending_len(), 0);
        assert_eq!(conn.dying_len(), 1);

        req.finish();
        assert_eq!(conn.dying_len(), 0);
        req.finish();
        assert_eq!(conn.dying_len(), 0);
    }

    #[test]
    fn test_finished_request_freed_by_gc() {
        let conn = conn();
        let req = request(&conn, 1);
        send_and_commit(&conn, &req, 4, 0);
        let inner = Arc::clone(req.inner());
        drop(req);

        assert_eq!(conn.sending_len(), 1);
        conn.state.lock().last_committed = 4;
        assert_eq!(conn.free_committed(), 1);
        assert_eq!(conn.dying_len(), 0);
        assert_eq!(Arc::strong_count(&inner), 1);
    }

    #[test]
    fn test_deliver_reply_marks_replied() {
        let conn = conn();
        let req = request(&conn, 1);
        let xid = conn.prepare_send(req.inner());

        assert!(conn.deliver_reply(xid, Bytes::from_static(b"reply")));
        assert_eq!(req.state(), RequestState::Replied);
        assert_eq!(req.inner().reply(), Some(Bytes::from_static(b"reply")));
        assert!(!conn.deliver_reply(xid, Bytes::new()));
        assert_eq!(conn.metrics().replies_received, 1);
    }

    #[test]
    fn test_take_client_requests() {
        let conn = conn();
        let mine = request(&conn, 1);
        let theirs = request(&conn, 2);
        let gated = request(&conn, 1);
        conn.prepare_send(mine.inner());
        conn.prepare_send(theirs.inner());
        conn.delay(gated.inner());

        let taken = conn.take_client_requests(1);
        assert_eq!(taken.len(), 2);
        assert_eq!(conn.sending_len(), 1);
        assert_eq!(conn.delayed_len(), 0);
        assert!(!conn.deliver_reply(mine.xid(), Bytes::new()));
        assert!(conn.deliver_reply(theirs.xid(), Bytes::new()));
    }

    #[test]
    fn test_request_on_one_list_at_a_time() {
        let conn = conn();
        let req = request(&conn, 1);
        conn.delay(req.inner());
        assert_eq!(conn.delayed_len(), 1);

        conn.prepare_send(req.inner());
        assert_eq!(conn.delayed_len(), 0);
        assert_eq!(conn.sending_len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_level() {
        let conn = conn();
        let waiter = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.wait_for_level(ConnLevel::Full).await })
        };

        conn.set_level(ConnLevel::Recovering);
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        conn.set_level(ConnLevel::Full);
        waiter.await.expect("waiter should finish");
    }

    #[test]
    fn test_epoch_and_uuid() {
        let conn = conn();
        assert_eq!(conn.epoch(), 0);
        assert_eq!(conn.bump_epoch(), 1);
        conn.set_remote_uuid(ObdUuid::new("ost1_UUID").expect("uuid"));
        assert_eq!(conn.remote_uuid().map(|u| u.to_string()), Some("ost1_UUID".to_string()));
    }
}
