//! Replay of uncommitted requests and the recovery driver.
//!
//! After a peer fails over it has lost every operation it had not yet
//! committed. Requests pinned for replay stay on the connection's sending list
//! past their reply, so [`Recovery::replay`] can re-issue them, one at a time
//! and in transaction order, before ordinary traffic resumes.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::connection::{ConnLevel, Connection};
use crate::error::CallError;
use crate::interrupt::Interrupt;
use crate::request::{wait_wake, RequestInner, RequestState};
use crate::transport::{Outgoing, Providers, Transport};
use crate::wire::Message;

/// Collaborator told when a request times out.
///
/// The call engine only reports the symptom; deciding whether the peer is
/// really gone, and driving [`Recovery`] if so, is up to the implementation.
pub trait RecoveryNotifier: Send + Sync + 'static {
    /// A request on `conn` missed its deadline.
    fn notify_possible_failure(&self, conn: &Arc<Connection>);
}

/// Drives replay, resend and restart on a connection.
#[derive(Debug, Clone)]
pub struct Recovery<P: Providers> {
    providers: P,
    interrupt: Interrupt,
}

impl<P: Providers> Recovery<P> {
    /// Create a recovery driver sending through `providers`.
    pub fn new(providers: P) -> Self {
        Self {
            providers,
            interrupt: Interrupt::new(),
        }
    }

    /// Handle that aborts a replay pass blocked on a reply.
    pub fn interrupt_handle(&self) -> Interrupt {
        self.interrupt.clone()
    }

    /// Replay every pinned request on `conn`, head first.
    ///
    /// Each replay gets a fresh xid and waits for its reply with no deadline.
    /// Afterwards pinned requests the peer now reports committed are
    /// discarded and ordinary commit GC runs. Returns the number of requests
    /// replayed.
    ///
    /// # Panics
    ///
    /// Panics if the peer answers a replay with a non-zero status: the peer's
    /// state has diverged from ours and cannot be repaired here.
    pub async fn replay(&self, conn: &Arc<Connection>) -> Result<usize, CallError> {
        let pending = conn.replayable();
        info!(peer = %conn.peer(), count = pending.len(), "replay started");

        for req in &pending {
            self.replay_one(conn, req).await?;
        }

        let discarded = conn.discard_committed_replays();
        info!(
            peer = %conn.peer(),
            replayed = pending.len(),
            discarded,
            last_committed = conn.last_committed(),
            "replay finished"
        );
        Ok(pending.len())
    }

    async fn replay_one(&self, conn: &Arc<Connection>, req: &Arc<RequestInner>) -> Result<(), CallError> {
        let xid = conn.prepare_replay(req);
        let bytes = req.pack(xid);
        let len = bytes.len();
        debug!(xid, opc = req.opc, transno = ?req.transno(), "replaying request");

        let msg = Outgoing {
            xid,
            request_portal: req.request_portal,
            reply_portal: req.reply_portal,
            bytes,
        };
        if let Err(e) = self.providers.transport().send(conn, msg).await {
            error!(xid, opc = req.opc, error = %e, "replay send failed");
            conn.abandon_replay(req);
            req.set_state(RequestState::Failed);
            return Err(CallError::TransportFailed(e));
        }
        conn.record_sent(len);

        let mut rx = req.subscribe();
        let state = tokio::select! {
            biased;
            state = wait_wake(&mut rx) => state,
            _ = self.interrupt.triggered() => {
                warn!(xid, opc = req.opc, "replay interrupted");
                RequestState::Interrupted
            }
        };

        match state {
            RequestState::Replied => {}
            RequestState::Failed => {
                conn.abandon_replay(req);
                return Err(CallError::Aborted);
            }
            other => {
                debug!(xid, state = ?other, "replay woken without a reply");
                conn.abandon_replay(req);
                req.transition(|s| !s.is_wake(), RequestState::Interrupted);
                return Err(CallError::Interrupted);
            }
        }

        let Some(reply) = req.reply() else {
            conn.abandon_replay(req);
            return Err(CallError::Aborted);
        };
        let msg = Message::unpack(&reply).map_err(|e| {
            error!(xid, opc = req.opc, error = %e, "unpack replay reply failed");
            CallError::Unpacked(e)
        })?;

        if msg.header.status != 0 {
            error!(
                xid,
                opc = req.opc,
                status = msg.header.status,
                "replay returned an error status"
            );
            panic!(
                "replay of xid {} opc {} returned status {}",
                xid, req.opc, msg.header.status
            );
        }

        conn.record_replay(req, &msg.header);
        debug!(
            xid,
            transno = msg.header.transno,
            last_committed = msg.header.last_committed,
            "replay acknowledged"
        );
        Ok(())
    }

    /// Ask every caller waiting on `conn` to retransmit.
    ///
    /// Returns the number of requests marked.
    pub fn resend_inflight(&self, conn: &Connection) -> usize {
        let marked = conn.outstanding().iter().filter(|req| req.resend()).count();
        conn.record_resends(marked);
        if marked > 0 {
            info!(peer = %conn.peer(), marked, "requests marked for resend");
        }
        marked
    }

    /// Wake every caller waiting on `conn` with [`CallError::Restarted`].
    ///
    /// Returns the number of requests woken.
    pub fn restart_inflight(&self, conn: &Connection) -> usize {
        let woken = conn.outstanding().iter().filter(|req| req.restart()).count();
        if woken > 0 {
            info!(peer = %conn.peer(), woken, "requests restarted");
        }
        woken
    }

    /// Full recovery of a reconnected peer.
    ///
    /// Holds ordinary traffic back at [`ConnLevel::Recovering`], replays,
    /// resends what was in flight, then raises the level to
    /// [`ConnLevel::Full`], which releases gated callers.
    pub async fn recover(&self, conn: &Arc<Connection>) -> Result<(), CallError> {
        conn.set_level(ConnLevel::Recovering);
        self.replay(conn).await?;
        self.resend_inflight(conn);
        conn.set_level(ConnLevel::Full);
        info!(peer = %conn.peer(), "recovery complete");
        Ok(())
    }
}
