//! Shared fixtures for the integration tests.
//!
//! A [`LoopbackTransport`] hands every outgoing request to a [`FakeServer`]
//! the test drives by hand: it receives requests and answers them through
//! [`Connection::deliver_reply`], picking the transaction number, commit point
//! and status of every reply.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use ptlrpc::{
    ClientEndpoint, ConnLevel, Connection, Message, MsgHeader, MsgType, Nid, Outgoing, ProcessId,
    Recovery, RecoveryNotifier, RpcConfig, TokioProviders, Transport, TransportError,
};
use tokio::sync::mpsc;

/// Request portal used by the test client.
pub const REQUEST_PORTAL: u32 = 12;
/// Reply portal used by the test client.
pub const REPLY_PORTAL: u32 = 10;

/// Providers used throughout the tests.
pub type TestProviders = TokioProviders<LoopbackTransport>;

/// Install a subscriber once per test binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Transport that queues requests for the fake server.
pub struct LoopbackTransport {
    tx: mpsc::UnboundedSender<Outgoing>,
    failing: AtomicBool,
}

impl LoopbackTransport {
    /// Create the transport and the receiving end for the server.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Outgoing>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Self {
            tx,
            failing: AtomicBool::new(false),
        };
        (transport, rx)
    }

    /// Make every following send fail as unreachable.
    pub fn fail_sends(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send(&self, conn: &Connection, msg: Outgoing) -> Result<(), TransportError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransportError::Unreachable(conn.peer()));
        }
        self.tx.send(msg).map_err(|_| TransportError::Closed)
    }
}

/// Hand-driven peer.
pub struct FakeServer {
    rx: mpsc::UnboundedReceiver<Outgoing>,
    conn: Arc<Connection>,
}

impl FakeServer {
    /// Next request the client sent.
    pub async fn recv(&mut self) -> Message {
        let out = self.rx.recv().await.expect("transport closed");
        assert_eq!(out.request_portal, REQUEST_PORTAL);
        assert_eq!(out.reply_portal, REPLY_PORTAL);
        let msg = Message::unpack(&out.bytes).expect("request should unpack");
        assert_eq!(msg.header.xid, out.xid);
        assert_eq!(msg.header.msg_type, MsgType::Request);
        msg
    }

    /// A request already sent, if any.
    pub fn try_recv(&mut self) -> Option<Message> {
        self.rx
            .try_recv()
            .ok()
            .map(|out| Message::unpack(&out.bytes).expect("request should unpack"))
    }

    /// Answer `request` successfully.
    pub fn reply(&self, request: &Message, transno: u64, last_committed: u64) -> bool {
        self.reply_status(request, 0, transno, last_committed)
    }

    /// Answer `request` with `status`.
    pub fn reply_status(
        &self,
        request: &Message,
        status: i32,
        transno: u64,
        last_committed: u64,
    ) -> bool {
        let header = MsgHeader::reply_to(&request.header, status)
            .with_transno(transno)
            .with_commit(request.header.xid, last_committed);
        self.reply_header(header)
    }

    /// Answer with a prepared header.
    pub fn reply_header(&self, header: MsgHeader) -> bool {
        let xid = header.xid;
        let bytes = Message::new(header, Bytes::from_static(b"ok")).pack();
        self.conn.deliver_reply(xid, bytes)
    }

    /// An error-type reply to `request` carrying `status`.
    pub fn error_header(request: &Message, status: i32) -> MsgHeader {
        let mut header = MsgHeader::reply_to(&request.header, status);
        header.msg_type = MsgType::Err;
        header
    }

    /// Deliver arbitrary bytes for `xid`.
    pub fn reply_raw(&self, xid: u64, bytes: Bytes) -> bool {
        self.conn.deliver_reply(xid, bytes)
    }
}

/// Counts failure reports.
#[derive(Debug, Default)]
pub struct CountingNotifier {
    reports: AtomicUsize,
}

impl CountingNotifier {
    /// Reports received so far.
    pub fn count(&self) -> usize {
        self.reports.load(Ordering::SeqCst)
    }
}

impl RecoveryNotifier for CountingNotifier {
    fn notify_possible_failure(&self, conn: &Arc<Connection>) {
        tracing::debug!(peer = %conn.peer(), "possible failure reported");
        self.reports.fetch_add(1, Ordering::SeqCst);
    }
}

/// A connected client, its server and the recovery pieces.
pub struct Setup {
    pub client: ClientEndpoint<TestProviders>,
    pub server: FakeServer,
    pub conn: Arc<Connection>,
    pub transport: Arc<LoopbackTransport>,
    pub recovery: Recovery<TestProviders>,
    pub notifier: Arc<CountingNotifier>,
}

/// Peer the test connection points at.
pub fn server_peer() -> ProcessId {
    ProcessId::server(Nid::new(0, 0x0a00_0001))
}

/// Build a client on a fully established connection.
pub fn setup(config: RpcConfig) -> Setup {
    init_tracing();

    let conn = Arc::new(Connection::new(server_peer()));
    conn.set_level(ConnLevel::Full);
    let notifier = Arc::new(CountingNotifier::default());
    conn.set_recovery(notifier.clone());

    let (transport, rx) = LoopbackTransport::new();
    let transport = Arc::new(transport);
    let providers = TestProviders::from_arc(Arc::clone(&transport));

    let client = ClientEndpoint::new(
        "test-client",
        REQUEST_PORTAL,
        REPLY_PORTAL,
        Arc::clone(&conn),
        providers.clone(),
        config,
    )
    .expect("valid config");

    Setup {
        client,
        server: FakeServer {
            rx,
            conn: Arc::clone(&conn),
        },
        conn,
        transport,
        recovery: Recovery::new(providers),
        notifier,
    }
}

/// Sleep in small steps until `cond` holds.
pub async fn wait_until<F>(mut cond: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..10_000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("condition never held");
}
