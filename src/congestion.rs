//! Congestion control: the `Controller` trait seam, and a NewReno implementation (RFC 9002 §7).

use std::fmt::Debug;

/// Per-packet-number-space-agnostic congestion state, driven by the loss detector's view of
/// what's in flight, acked, and lost.
pub trait Controller: Send + Debug {
    /// A packet of `bytes` was just sent and is now in flight.
    fn on_sent(&mut self, now_millis: u64, bytes: u64);

    /// One or more packets, sent no later than `largest_sent_time`, were acknowledged.
    fn on_ack(&mut self, now_millis: u64, sent_time: u64, bytes: u64, in_persistent_congestion: bool);

    /// A packet sent at `sent_time` of size `bytes` is now considered lost.
    fn on_congestion_event(&mut self, now_millis: u64, sent_time: u64);

    /// Whether `bytes` additional bytes may be sent without exceeding the congestion window.
    fn can_send(&self, bytes_in_flight: u64, bytes: u64) -> bool {
        bytes_in_flight + bytes <= self.congestion_window()
    }

    fn congestion_window(&self) -> u64;

    /// Clears any memory of packets sent before `sent_time` -- used when a packet-number space
    /// is discarded (e.g. Initial keys dropped once Handshake completes).
    fn discard(&mut self, sent_time: u64);

    fn clone_box(&self) -> Box<dyn Controller>;
}

/// Builds a fresh `Controller` for a new connection, so a `TransportConfig` can be shared
/// across many connections while still handing each its own independent controller state.
pub trait ControllerFactory: Send + Sync {
    fn build(&self) -> Box<dyn Controller>;
}

const MAX_DATAGRAM_SIZE: u64 = 1200;
pub const INITIAL_WINDOW: u64 = 10 * MAX_DATAGRAM_SIZE; // RFC 9002 §7.2
const MINIMUM_WINDOW: u64 = 2 * MAX_DATAGRAM_SIZE;
const LOSS_REDUCTION_FACTOR: f64 = 0.5;

#[derive(Debug, Clone, Copy)]
pub struct NewRenoConfig {
    pub initial_window: u64,
    pub minimum_window: u64,
    pub loss_reduction_factor: f64,
}

impl Default for NewRenoConfig {
    fn default() -> Self {
        Self {
            initial_window: INITIAL_WINDOW,
            minimum_window: MINIMUM_WINDOW,
            loss_reduction_factor: LOSS_REDUCTION_FACTOR,
        }
    }
}

/// RFC 9002 §7 NewReno: slow start until the first loss or ECN signal, then linear congestion
/// avoidance, with a recovery period that suppresses window reduction for losses already
/// accounted for.
#[derive(Debug, Clone)]
pub struct NewReno {
    config: NewRenoConfig,
    window: u64,
    ssthresh: u64,
    /// The send time of the most recent packet marked lost or acked as a congestion event;
    /// while not in recovery from some later loss, reentering with an overlapping loss is a
    /// no-op.
    recovery_start_time: Option<u64>,
}

impl NewReno {
    pub fn new(config: NewRenoConfig) -> Self {
        Self {
            window: config.initial_window,
            ssthresh: u64::max_value(),
            recovery_start_time: None,
            config,
        }
    }

    fn in_slow_start(&self) -> bool {
        self.window < self.ssthresh
    }

    fn in_recovery(&self, sent_time: u64) -> bool {
        self.recovery_start_time
            .map_or(false, |start| sent_time <= start)
    }
}

impl Default for NewReno {
    fn default() -> Self {
        Self::new(NewRenoConfig::default())
    }
}

impl Controller for NewReno {
    fn on_sent(&mut self, _now_millis: u64, _bytes: u64) {}

    fn on_ack(
        &mut self,
        _now_millis: u64,
        sent_time: u64,
        bytes: u64,
        _in_persistent_congestion: bool,
    ) {
        if self.in_recovery(sent_time) {
            return;
        }
        if self.in_slow_start() {
            self.window += bytes;
        } else {
            // Congestion avoidance: one max-sized datagram's worth of growth per window fully
            // acknowledged.
            self.window += MAX_DATAGRAM_SIZE * bytes / self.window.max(1);
        }
    }

    fn on_congestion_event(&mut self, now_millis: u64, sent_time: u64) {
        if self.in_recovery(sent_time) {
            return;
        }
        self.recovery_start_time = Some(now_millis);
        self.window = ((self.window as f64) * self.config.loss_reduction_factor) as u64;
        self.window = self.window.max(self.config.minimum_window);
        self.ssthresh = self.window;
    }

    fn can_send(&self, bytes_in_flight: u64, bytes: u64) -> bool {
        bytes_in_flight + bytes <= self.window
    }

    fn congestion_window(&self) -> u64 {
        self.window
    }

    fn discard(&mut self, _sent_time: u64) {}

    fn clone_box(&self) -> Box<dyn Controller> {
        Box::new(self.clone())
    }
}

pub struct NewRenoFactory(NewRenoConfig);

impl NewRenoFactory {
    pub fn new(config: NewRenoConfig) -> Self {
        Self(config)
    }
}

impl Default for NewRenoFactory {
    fn default() -> Self {
        Self(NewRenoConfig::default())
    }
}

impl ControllerFactory for NewRenoFactory {
    fn build(&self) -> Box<dyn Controller> {
        Box::new(NewReno::new(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slow_start_grows_window_by_full_acked_bytes() {
        let mut cc = NewReno::default();
        let start = cc.congestion_window();
        cc.on_ack(0, 0, 1200, false);
        assert_eq!(cc.congestion_window(), start + 1200);
    }

    #[test]
    fn loss_halves_the_window_and_sets_ssthresh() {
        let mut cc = NewReno::default();
        let before = cc.congestion_window();
        cc.on_congestion_event(100, 50);
        assert_eq!(cc.congestion_window(), (before as f64 * 0.5) as u64);
        assert_eq!(cc.ssthresh, cc.congestion_window());
    }

    #[test]
    fn window_never_drops_below_minimum() {
        let mut cc = NewReno::new(NewRenoConfig {
            initial_window: 3000,
            ..NewRenoConfig::default()
        });
        cc.on_congestion_event(0, 0);
        assert!(cc.congestion_window() >= MINIMUM_WINDOW);
    }

    #[test]
    fn a_second_loss_already_in_recovery_is_ignored() {
        let mut cc = NewReno::default();
        cc.on_congestion_event(100, 50);
        let window_after_first = cc.congestion_window();
        // A packet sent before the recovery period began, newly detected lost: already covered.
        cc.on_congestion_event(200, 10);
        assert_eq!(cc.congestion_window(), window_after_first);
    }

    #[test]
    fn can_send_respects_window() {
        let cc = NewReno::new(NewRenoConfig {
            initial_window: 1000,
            ..NewRenoConfig::default()
        });
        assert!(cc.can_send(900, 100));
        assert!(!cc.can_send(900, 101));
    }
}
