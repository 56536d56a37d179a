//! Counters for request traffic on a connection.

use std::time::Instant;

/// Metrics for a connection.
#[derive(Debug, Clone)]
pub struct ConnectionMetrics {
    /// Total number of transmissions, resends and replays included
    pub requests_sent: u64,

    /// Total number of replies matched to a waiting request
    pub replies_received: u64,

    /// Total number of requests that hit their deadline
    pub timeouts: u64,

    /// Total number of requests recovery asked to resend
    pub resends: u64,

    /// Total number of requests replayed
    pub replays: u64,

    /// Total number of requests removed by commit GC
    pub committed: u64,

    /// Total number of transmissions the transport refused
    pub send_failures: u64,

    /// Total bytes handed to the transport
    pub bytes_sent: u64,

    /// Total bytes of matched replies
    pub bytes_received: u64,

    /// Time when the connection was created
    pub created_at: Instant,

    /// Time of the last timeout (None if none occurred)
    pub last_timeout: Option<Instant>,
}

impl Default for ConnectionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionMetrics {
    /// Create new metrics instance.
    pub fn new() -> Self {
        Self {
            requests_sent: 0,
            replies_received: 0,
            timeouts: 0,
            resends: 0,
            replays: 0,
            committed: 0,
            send_failures: 0,
            bytes_sent: 0,
            bytes_received: 0,
            created_at: Instant::now(),
            last_timeout: None,
        }
    }

    /// Record a transmission.
    pub fn record_sent(&mut self, bytes: usize) {
        self.requests_sent += 1;
        self.bytes_sent += bytes as u64;
    }

    /// Record a transmission the transport refused.
    pub fn record_send_failure(&mut self) {
        self.send_failures += 1;
    }

    /// Record a matched reply.
    pub fn record_reply(&mut self, bytes: usize) {
        self.replies_received += 1;
        self.bytes_received += bytes as u64;
    }

    /// Record a request deadline expiring.
    pub fn record_timeout(&mut self) {
        self.timeouts += 1;
        self.last_timeout = Some(Instant::now());
    }

    /// Record a resend request from recovery.
    pub fn record_resend(&mut self) {
        self.resends += 1;
    }

    /// Record a completed replay.
    pub fn record_replay(&mut self) {
        self.replays += 1;
    }

    /// Record a request leaving the sending list as committed.
    pub fn record_committed(&mut self) {
        self.committed += 1;
    }
}
