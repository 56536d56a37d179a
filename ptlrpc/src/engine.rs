//! The call engine: gate, send, wait, resend and reply processing.

use std::sync::Arc;

use ptlrpc_core::TimeProvider;
use tracing::{debug, error, info, warn};

use crate::client::{ClientEndpoint, Reply};
use crate::connection::ConnLevel;
use crate::error::CallError;
use crate::request::{wait_wake, Request, RequestInner, RequestState};
use crate::transport::{Outgoing, Providers, Transport};
use crate::wire::{Message, MAX_BODY_SIZE};

/// How a reply wait ended.
enum Wake {
    Replied,
    Resend,
    Restart,
    Aborted,
    TimedOut,
    Interrupted,
}

impl Wake {
    fn from_state(state: RequestState) -> Self {
        match state {
            RequestState::Replied => Self::Replied,
            RequestState::Resend => Self::Resend,
            RequestState::Restart => Self::Restart,
            _ => Self::Aborted,
        }
    }
}

/// Retires the request when a call is dropped before it completes.
struct CallGuard<'a> {
    req: &'a Arc<RequestInner>,
    armed: bool,
}

impl<'a> CallGuard<'a> {
    fn new(req: &'a Arc<RequestInner>) -> Self {
        Self { req, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let req = self.req;
        if req.transition(
            |s| s.is_outstanding() || s == RequestState::Delayed,
            RequestState::Interrupted,
        ) {
            debug!(xid = req.xid(), opc = req.opc, "call dropped before completion");
        }
        req.conn.retire(req, false);
    }
}

impl<P: Providers> ClientEndpoint<P> {
    /// Send `request` and wait for its reply.
    ///
    /// The request first waits on the delayed list while its required level is
    /// above the connection's. It then takes an in-flight permit and is sent.
    /// If the RPC timeout passes without a reply, the connection drops to
    /// [`ConnLevel::Recovering`] and recovery is notified; a request below
    /// [`ConnLevel::Full`] fails with [`CallError::TimedOut`] right away, any
    /// other keeps waiting for recovery to resend or restart it. The caller's
    /// [`Interrupt`](crate::Interrupt) is honoured while gated and after a
    /// timeout. An interrupt during the first wait, before any timeout, is a
    /// caller bug and panics.
    ///
    /// Dropping the returned future takes the request off every list, so a
    /// cancelled call never lingers awaiting commit.
    ///
    /// On a reply the connection records the peer's commit point and frees
    /// committed requests before the reply status is checked.
    pub async fn send_and_wait(&self, request: &Request) -> Result<Reply, CallError> {
        let req = request.inner();
        debug!(
            client = %self.name,
            opc = req.opc,
            level = ?req.level(),
            conn_level = ?req.conn.level(),
            "queue wait"
        );

        if req.body.len() > MAX_BODY_SIZE {
            error!(
                client = %self.name,
                opc = req.opc,
                size = req.body.len(),
                "request body too large"
            );
            return Err(CallError::BodyTooLarge(req.body.len()));
        }

        let guard = CallGuard::new(req);
        self.gate(req).await?;

        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| CallError::Aborted)?;

        loop {
            self.transmit(req).await?;

            match self.wait_reply(req).await {
                Wake::Replied => break,
                Wake::Resend => {
                    debug!(client = %self.name, xid = req.xid(), opc = req.opc, "resending request");
                }
                Wake::Restart => {
                    warn!(client = %self.name, xid = req.xid(), opc = req.opc, "request restarted");
                    req.conn.retire(req, false);
                    return Err(CallError::Restarted);
                }
                Wake::Aborted => return Err(CallError::Aborted),
                Wake::TimedOut => {
                    req.conn.retire(req, false);
                    return Err(CallError::TimedOut);
                }
                Wake::Interrupted => {
                    req.set_state(RequestState::Interrupted);
                    req.conn.retire(req, false);
                    return Err(CallError::Interrupted);
                }
            }
        }

        drop(permit);
        guard.disarm();
        self.complete(req)
    }

    /// Hold the request on the delayed list until the connection admits it.
    async fn gate(&self, req: &Arc<RequestInner>) -> Result<(), CallError> {
        let conn = &req.conn;
        let required = req.level();
        if required <= conn.level() {
            return Ok(());
        }

        warn!(
            client = %self.name,
            opc = req.opc,
            ?required,
            conn_level = ?conn.level(),
            "waiting for recovery"
        );
        conn.delay(req);

        let mut rx = req.subscribe();
        let outcome = tokio::select! {
            _ = conn.wait_for_level(required) => Ok(()),
            _ = req.interrupt.triggered() => {
                req.set_state(RequestState::Interrupted);
                Err(CallError::Interrupted)
            }
            _ = wait_wake(&mut rx) => Err(CallError::Aborted),
        };
        conn.undelay(req);

        match &outcome {
            Ok(()) => info!(client = %self.name, opc = req.opc, "resumed"),
            Err(e) => warn!(client = %self.name, opc = req.opc, error = %e, "gated request abandoned"),
        }
        outcome
    }

    async fn transmit(&self, req: &Arc<RequestInner>) -> Result<u64, CallError> {
        let conn = &req.conn;
        let xid = conn.prepare_send(req);
        let bytes = req.pack(xid);
        let len = bytes.len();

        debug!(
            client = %self.name,
            xid,
            opc = req.opc,
            transno = ?req.transno(),
            "sending request"
        );
        let msg = Outgoing {
            xid,
            request_portal: req.request_portal,
            reply_portal: req.reply_portal,
            bytes,
        };

        if let Err(e) = self.providers.transport().send(conn, msg).await {
            error!(client = %self.name, xid, opc = req.opc, error = %e, "send failed");
            conn.retire(req, true);
            req.set_state(RequestState::Failed);
            return Err(CallError::TransportFailed(e));
        }

        conn.record_sent(len);
        Ok(xid)
    }

    async fn wait_reply(&self, req: &Arc<RequestInner>) -> Wake {
        let mut rx = req.subscribe();

        let waited = tokio::select! {
            biased;
            waited = self
                .providers
                .time()
                .timeout(self.config.rpc_timeout, wait_wake(&mut rx)) => waited,
            _ = req.interrupt.triggered() => return self.interrupted(req),
        };
        if let Ok(state) = waited {
            return Wake::from_state(state);
        }

        if !self.expire(req) {
            return Wake::TimedOut;
        }

        tokio::select! {
            biased;
            state = wait_wake(&mut rx) => Wake::from_state(state),
            _ = req.interrupt.triggered() => self.interrupted(req),
        }
    }

    /// Handle an expired deadline. Returns whether the caller keeps waiting.
    fn expire(&self, req: &Arc<RequestInner>) -> bool {
        if !req.transition(|s| s == RequestState::InFlight, RequestState::TimedOut) {
            // Woken at the deadline; the next wait returns at once.
            return true;
        }

        let conn = &req.conn;
        error!(
            client = %self.name,
            peer = %conn.peer(),
            xid = req.xid(),
            opc = req.opc,
            "request timed out"
        );
        conn.record_timeout();
        conn.set_level(ConnLevel::Recovering);
        conn.notify_possible_failure();

        // Setup and recovery calls give up instead of waiting for recovery.
        req.level() >= ConnLevel::Full
    }

    fn interrupted(&self, req: &Arc<RequestInner>) -> Wake {
        let state = req.state();
        if matches!(
            state,
            RequestState::New | RequestState::Delayed | RequestState::InFlight
        ) {
            error!(xid = req.xid(), opc = req.opc, ?state, "interrupted before timing out");
            panic!(
                "request xid {} interrupted in state {:?} without a timeout",
                req.xid(),
                state
            );
        }
        warn!(client = %self.name, xid = req.xid(), opc = req.opc, "request interrupted");
        Wake::Interrupted
    }

    fn complete(&self, req: &Arc<RequestInner>) -> Result<Reply, CallError> {
        let conn = &req.conn;
        let Some(bytes) = req.reply() else {
            error!(client = %self.name, xid = req.xid(), "woken without a reply");
            conn.retire(req, false);
            return Err(CallError::Aborted);
        };

        let msg = match Message::unpack(&bytes) {
            Ok(msg) => msg,
            Err(e) => {
                error!(client = %self.name, xid = req.xid(), opc = req.opc, error = %e, "unpack reply failed");
                conn.retire(req, false);
                return Err(CallError::Unpacked(e));
            }
        };

        let header = &msg.header;
        debug!(
            client = %self.name,
            xid = req.xid(),
            status = header.status,
            transno = header.transno,
            last_committed = header.last_committed,
            "got reply"
        );
        conn.commit(req, header);

        if let Err(status) = msg.check_status() {
            if status < 0 {
                warn!(client = %self.name, xid = req.xid(), opc = req.opc, status, "remote status");
            } else {
                debug!(client = %self.name, xid = req.xid(), opc = req.opc, status, "remote status");
            }
            return Err(CallError::RemoteStatus(status));
        }

        Ok(Reply::new(msg))
    }
}
