//! Connection-level and per-stream flow control credit.
//!
//! Both levels follow the same shape: a `max` the peer is allowed to send up to, and `used`,
//! the count of bytes we've actually seen. `on_bytes_received` folds the two together and
//! reports whether a window update is worth sending, following the same "send a new limit once
//! the peer's used half of what we last advertised" heuristic as stream-level credit.

use crate::TransportError;

#[derive(Debug, Clone)]
pub struct FlowControl {
    /// Total bytes the peer may send before this local limit, inclusive.
    max_data: u64,
    /// Bytes actually received so far.
    received: u64,
    /// The limit we last told the peer about.
    sent_max_data: u64,
}

impl FlowControl {
    pub fn new(initial_max_data: u64) -> Self {
        Self {
            max_data: initial_max_data,
            received: 0,
            sent_max_data: initial_max_data,
        }
    }

    /// Accounts for `len` newly received bytes at `offset`. Fails with `FlowControlError` if
    /// this pushes `received` past `max_data`.
    pub fn on_bytes_received(&mut self, offset: u64, len: u64) -> Result<(), TransportError> {
        let end = offset
            .checked_add(len)
            .ok_or(TransportError::FlowControlError)?;
        if end > self.max_data {
            return Err(TransportError::FlowControlError);
        }
        self.received = self.received.max(end);
        Ok(())
    }

    /// Raises the local limit by `increment`, as happens when the application frees up receive
    /// buffer space.
    pub fn grant_additional_window(&mut self, increment: u64) {
        self.max_data = self.max_data.saturating_add(increment);
    }

    /// Returns `Some(new_limit)` if the local limit has grown past what was last advertised and
    /// the peer has consumed enough of the previous window to justify telling them, and records
    /// that limit as sent.
    pub fn poll_max_data(&mut self) -> Option<u64> {
        if self.max_data <= self.sent_max_data {
            return None;
        }
        let remaining = self.sent_max_data.saturating_sub(self.received);
        if self.sent_max_data == 0 || remaining < self.sent_max_data / 2 {
            self.sent_max_data = self.max_data;
            return Some(self.max_data);
        }
        None
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn max_data(&self) -> u64 {
        self.max_data
    }
}

/// Send-side credit: how much this endpoint is still allowed to send, mirroring the peer's
/// advertised `max_data`.
#[derive(Debug, Clone)]
pub struct SendLimiter {
    max_data: u64,
    sent: u64,
}

impl SendLimiter {
    pub fn new(initial_max_data: u64) -> Self {
        Self {
            max_data: initial_max_data,
            sent: 0,
        }
    }

    pub fn available(&self) -> u64 {
        self.max_data.saturating_sub(self.sent)
    }

    pub fn is_blocked(&self) -> bool {
        self.available() == 0
    }

    pub fn record_sent(&mut self, len: u64) {
        self.sent += len;
        debug_assert!(self.sent <= self.max_data);
    }

    /// Bytes already sent on this limiter's stream or connection, i.e. the offset the next
    /// chunk queued against it should start at.
    pub fn sent(&self) -> u64 {
        self.sent
    }

    /// Raises the send limit on receipt of a peer `MAX_DATA`/`MAX_STREAM_DATA` frame. QUIC
    /// permits these to arrive out of order or be duplicated, so a lower value than what we
    /// already know about is simply ignored.
    pub fn on_max_data_frame(&mut self, new_limit: u64) {
        self.max_data = self.max_data.max(new_limit);
    }
}

/// Two ceilings per direction: a stream's own send credit and whatever connection-level credit
/// remains. Clamps `desired` additional bytes to whichever is tighter, so a caller can never
/// queue more than both limits jointly allow.
pub fn increase_flow_control_limit(desired: u64, stream_ceiling: u64, connection_credit: u64) -> u64 {
    desired.min(stream_ceiling).min(connection_credit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn receiving_past_limit_is_an_error() {
        let mut fc = FlowControl::new(100);
        assert!(fc.on_bytes_received(0, 100).is_ok());
        assert_eq!(
            fc.on_bytes_received(100, 1).unwrap_err(),
            TransportError::FlowControlError
        );
    }

    #[test]
    fn window_update_fires_past_halfway() {
        let mut fc = FlowControl::new(100);
        assert_eq!(fc.poll_max_data(), None);
        fc.on_bytes_received(0, 60).unwrap();
        assert_eq!(fc.poll_max_data(), None);
        fc.grant_additional_window(100);
        assert_eq!(fc.poll_max_data(), Some(200));
        // Having just advertised 200, we shouldn't immediately advertise again.
        assert_eq!(fc.poll_max_data(), None);
    }

    #[test]
    fn send_limiter_blocks_at_zero_credit() {
        let mut limiter = SendLimiter::new(10);
        limiter.record_sent(10);
        assert!(limiter.is_blocked());
        limiter.on_max_data_frame(20);
        assert!(!limiter.is_blocked());
        assert_eq!(limiter.available(), 10);
    }

    #[test]
    fn stale_max_data_frame_is_ignored() {
        let mut limiter = SendLimiter::new(10);
        limiter.on_max_data_frame(5);
        assert_eq!(limiter.available(), 10);
    }

    #[test]
    fn sent_tracks_bytes_recorded() {
        let mut limiter = SendLimiter::new(100);
        assert_eq!(limiter.sent(), 0);
        limiter.record_sent(30);
        assert_eq!(limiter.sent(), 30);
    }

    #[test]
    fn increase_flow_control_limit_clamps_to_tightest_ceiling() {
        assert_eq!(increase_flow_control_limit(50, 100, 100), 50);
        assert_eq!(increase_flow_control_limit(50, 10, 100), 10);
        assert_eq!(increase_flow_control_limit(50, 100, 5), 5);
    }
}
