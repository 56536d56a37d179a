/// Lifecycle state of a request.
///
/// Replay eligibility is tracked separately: a request in any state may also
/// be pinned for replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestState {
    /// Prepared, never sent.
    New,
    /// Waiting on the delayed list for the connection level.
    Delayed,
    /// Sent, awaiting a reply.
    InFlight,
    /// The deadline passed without a reply.
    TimedOut,
    /// Recovery asked for a retransmission.
    Resend,
    /// Recovery asked the caller to restart the call.
    Restart,
    /// A reply arrived.
    Replied,
    /// The caller gave up on the wait.
    Interrupted,
    /// Retired without a usable reply.
    Failed,
}

impl RequestState {
    /// States that end a reply wait.
    pub fn is_wake(self) -> bool {
        matches!(
            self,
            Self::Replied | Self::Resend | Self::Restart | Self::Failed
        )
    }

    /// Sent and not yet answered.
    pub fn is_outstanding(self) -> bool {
        matches!(self, Self::InFlight | Self::TimedOut)
    }
}
