//! Per-packet-number-space loss detection (RFC 9002 §6): sent-packet tracking, the
//! packet-threshold and time-threshold algorithms, and PTO derivation.

use std::collections::BTreeMap;

use crate::frame::Frame;
use crate::packet::EncryptionLevel;

/// The number of packets beyond the largest acked that must arrive before an older unacked
/// packet is declared lost by the packet-threshold rule (RFC 9002 §6.1.1).
pub const PACKET_THRESHOLD: u64 = 3;
/// Fraction of the smoothed RTT an unacked packet may sit for before the time-threshold rule
/// (RFC 9002 §6.1.2) fires: `9/8 * max(smoothed_rtt, latest_rtt)`.
const TIME_THRESHOLD_NUMERATOR: u64 = 9;
const TIME_THRESHOLD_DENOMINATOR: u64 = 8;
const GRANULARITY_MILLIS: u64 = 1;

#[derive(Debug, Clone)]
pub struct SentPacket {
    pub time_sent: u64,
    pub size: u64,
    pub ack_eliciting: bool,
    pub in_flight: bool,
    pub frames: Vec<Frame>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RttEstimator {
    pub latest_rtt: u64,
    pub smoothed_rtt: u64,
    pub rttvar: u64,
    pub min_rtt: u64,
    has_sample: bool,
}

impl RttEstimator {
    /// Updates the estimate from one newly-acked packet's measured RTT, following RFC 9002
    /// §5.3's first-sample/subsequent-sample split.
    pub fn update(&mut self, rtt_sample: u64, ack_delay: u64, max_ack_delay: u64) {
        self.latest_rtt = rtt_sample;
        if !self.has_sample {
            self.has_sample = true;
            self.min_rtt = rtt_sample;
            self.smoothed_rtt = rtt_sample;
            self.rttvar = rtt_sample / 2;
            return;
        }
        self.min_rtt = self.min_rtt.min(rtt_sample);
        let ack_delay = ack_delay.min(max_ack_delay);
        let adjusted_rtt = if rtt_sample >= self.min_rtt + ack_delay {
            rtt_sample - ack_delay
        } else {
            rtt_sample
        };
        let rttvar_sample = if self.smoothed_rtt > adjusted_rtt {
            self.smoothed_rtt - adjusted_rtt
        } else {
            adjusted_rtt - self.smoothed_rtt
        };
        self.rttvar = (3 * self.rttvar + rttvar_sample) / 4;
        self.smoothed_rtt = (7 * self.smoothed_rtt + adjusted_rtt) / 8;
    }

    pub fn pto_duration(&self) -> u64 {
        self.smoothed_rtt + (4 * self.rttvar).max(GRANULARITY_MILLIS)
    }
}

/// Tracks in-flight packets and detects losses for exactly one packet-number space (Initial,
/// Handshake, or Application).
#[derive(Debug, Default)]
pub struct LossDetector {
    sent_packets: BTreeMap<u64, SentPacket>,
    largest_acked: Option<u64>,
    time_of_last_ack_eliciting_packet: Option<u64>,
    /// Earliest time at which an unacked packet will become time-threshold lost, if any.
    loss_time: Option<u64>,
    pub pto_count: u32,
}

pub struct AckOutcome {
    pub acked: Vec<SentPacket>,
    pub newly_lost: Vec<(u64, SentPacket)>,
}

impl LossDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_packet_sent(&mut self, packet_number: u64, packet: SentPacket) {
        if packet.ack_eliciting {
            self.time_of_last_ack_eliciting_packet = Some(packet.time_sent);
        }
        self.sent_packets.insert(packet_number, packet);
    }

    pub fn ack_eliciting_in_flight(&self) -> bool {
        self.sent_packets.values().any(|p| p.ack_eliciting)
    }

    /// The ack-eliciting packets still tracked as sent but neither acked nor declared lost.
    pub fn unacked(&self) -> Vec<&SentPacket> {
        self.sent_packets.values().filter(|p| p.ack_eliciting).collect()
    }

    pub fn no_ack_received(&self) -> bool {
        self.largest_acked.is_none()
    }

    /// Processes one ACK frame's ranges (each `(start, end)` half-open, as yielded by
    /// `frame::Ack::iter`). Each sent packet is removed from tracking exactly once, whether
    /// because it was acked or because this call newly detects it as lost.
    pub fn on_ack_received(
        &mut self,
        ranges: impl Iterator<Item = (u64, u64)>,
        largest_acked: u64,
        now_millis: u64,
        rtt: &mut RttEstimator,
        ack_delay: u64,
        max_ack_delay: u64,
    ) -> AckOutcome {
        self.largest_acked = Some(
            self.largest_acked
                .map_or(largest_acked, |prev| prev.max(largest_acked)),
        );

        let mut acked = Vec::new();
        for (start, end) in ranges {
            for pn in start..end {
                if let Some(packet) = self.sent_packets.remove(&pn) {
                    acked.push(packet);
                }
            }
        }

        if let Some(largest) = acked.iter().map(|p| p.time_sent).max() {
            if largest_acked == self.largest_acked.unwrap_or(0) {
                let rtt_sample = now_millis.saturating_sub(largest);
                rtt.update(rtt_sample, ack_delay, max_ack_delay);
            }
        }

        let newly_lost = self.detect_lost_packets(now_millis, rtt);
        if !acked.is_empty() {
            self.pto_count = 0;
        }
        AckOutcome { acked, newly_lost }
    }

    /// RFC 9002 §6.1: a packet is lost if a later packet, sent at least `PACKET_THRESHOLD`
    /// packet numbers ahead, has been acked (packet-threshold), or if enough time has passed
    /// since it was sent relative to the RTT estimate (time-threshold).
    fn detect_lost_packets(
        &mut self,
        now_millis: u64,
        rtt: &RttEstimator,
    ) -> Vec<(u64, SentPacket)> {
        let largest_acked = match self.largest_acked {
            Some(l) => l,
            None => return Vec::new(),
        };
        let loss_delay = (TIME_THRESHOLD_NUMERATOR
            * rtt.smoothed_rtt.max(rtt.latest_rtt)
            / TIME_THRESHOLD_DENOMINATOR)
            .max(GRANULARITY_MILLIS);

        let mut lost = Vec::new();
        self.loss_time = None;
        // RFC 9002 §6.1: a packet sent after the largest acked has not had a chance to be
        // acked yet and must never be declared lost, by either rule.
        let lost_pns: Vec<u64> = self
            .sent_packets
            .iter()
            .filter(|(&pn, packet)| {
                pn <= largest_acked
                    && (pn + PACKET_THRESHOLD <= largest_acked
                        || packet.time_sent + loss_delay <= now_millis)
            })
            .map(|(&pn, _)| pn)
            .collect();

        for pn in lost_pns {
            if let Some(packet) = self.sent_packets.remove(&pn) {
                lost.push((pn, packet));
            }
        }

        for (_, packet) in self.sent_packets.iter().filter(|(&pn, _)| pn <= largest_acked) {
            let candidate_loss_time = packet.time_sent + loss_delay;
            self.loss_time = Some(match self.loss_time {
                Some(t) => t.min(candidate_loss_time),
                None => candidate_loss_time,
            });
        }

        lost
    }

    pub fn loss_time(&self) -> Option<u64> {
        self.loss_time
    }

    /// Drops every sent packet still in flight, as happens when this space's keys are
    /// discarded (Initial keys after the handshake completes, for instance). Resets
    /// `largest_acked` too, so `no_ack_received()` reports `true` again: a discarded space's
    /// prior ack state no longer describes anything this space still tracks.
    pub fn discard(&mut self) -> Vec<SentPacket> {
        self.loss_time = None;
        self.time_of_last_ack_eliciting_packet = None;
        self.largest_acked = None;
        self.sent_packets.drain().map(|(_, p)| p).collect()
    }

    pub fn pto_time(&self, pto_duration: u64) -> Option<u64> {
        self.time_of_last_ack_eliciting_packet
            .map(|t| t + pto_duration * 2u64.pow(self.pto_count.min(16)))
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum PnSpace {
    Initial,
    Handshake,
    Application,
}

impl PnSpace {
    pub fn for_level(level: EncryptionLevel) -> Self {
        match level {
            EncryptionLevel::Initial => PnSpace::Initial,
            EncryptionLevel::Handshake => PnSpace::Handshake,
            EncryptionLevel::ZeroRtt | EncryptionLevel::Application => PnSpace::Application,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(time_sent: u64) -> SentPacket {
        SentPacket {
            time_sent,
            size: 100,
            ack_eliciting: true,
            in_flight: true,
            frames: vec![Frame::Ping],
        }
    }

    #[test]
    fn packet_threshold_loss() {
        let mut ld = LossDetector::new();
        for pn in 0..5 {
            ld.on_packet_sent(pn, packet(pn * 10));
        }
        let mut rtt = RttEstimator::default();
        let outcome = ld.on_ack_received(vec![(4, 5)].into_iter(), 4, 100, &mut rtt, 0, 25);
        // Packet 0 is >= PACKET_THRESHOLD behind packet 4 (largest acked) and must be lost.
        assert!(outcome.newly_lost.iter().any(|(pn, _)| *pn == 0));
        assert!(!outcome.newly_lost.iter().any(|(pn, _)| *pn == 3));
    }

    #[test]
    fn acked_packets_are_removed_exactly_once() {
        let mut ld = LossDetector::new();
        ld.on_packet_sent(0, packet(0));
        let mut rtt = RttEstimator::default();
        let outcome = ld.on_ack_received(vec![(0, 1)].into_iter(), 0, 50, &mut rtt, 0, 25);
        assert_eq!(outcome.acked.len(), 1);
        assert!(!ld.ack_eliciting_in_flight());
    }

    #[test]
    fn rtt_first_sample_sets_smoothed_equal_to_latest() {
        let mut rtt = RttEstimator::default();
        rtt.update(100, 0, 25);
        assert_eq!(rtt.smoothed_rtt, 100);
        assert_eq!(rtt.latest_rtt, 100);
    }

    #[test]
    fn discard_drains_all_in_flight_packets() {
        let mut ld = LossDetector::new();
        ld.on_packet_sent(0, packet(0));
        ld.on_packet_sent(1, packet(1));
        let mut rtt = RttEstimator::default();
        ld.on_ack_received(vec![(1, 2)].into_iter(), 1, 10, &mut rtt, 0, 25);
        assert!(!ld.no_ack_received());
        let drained = ld.discard();
        assert_eq!(drained.len(), 1);
        assert!(!ld.ack_eliciting_in_flight());
        assert!(ld.no_ack_received());
    }

    #[test]
    fn packet_sent_after_largest_acked_is_never_lost() {
        let mut ld = LossDetector::new();
        for pn in 0..5 {
            ld.on_packet_sent(pn, packet(0));
        }
        let mut rtt = RttEstimator::default();
        // Ack only packet 0; packets 1..4 were all sent after it and must survive regardless
        // of how much time has passed, since they haven't even had a chance to be acked yet.
        let outcome = ld.on_ack_received(vec![(0, 1)].into_iter(), 0, 10_000, &mut rtt, 0, 25);
        assert!(outcome.newly_lost.is_empty());
    }

    #[test]
    fn unacked_reports_only_ack_eliciting_packets() {
        let mut ld = LossDetector::new();
        ld.on_packet_sent(0, packet(0));
        ld.on_packet_sent(
            1,
            SentPacket {
                time_sent: 0,
                size: 50,
                ack_eliciting: false,
                in_flight: false,
                frames: vec![Frame::Padding],
            },
        );
        assert_eq!(ld.unacked().len(), 1);
    }
}
