//! The sender façade: queues frames for transmission against a packet-number space and wires
//! lost-packet callbacks back to whatever queued them (the CID manager, stream state, etc).

use std::collections::VecDeque;

use crate::congestion::Controller;
use crate::frame::Frame;
use crate::loss::PnSpace;
use crate::packet::EncryptionLevel;

/// A frame queued for the next packet built at a given encryption level, with an optional
/// callback invoked if that frame is later declared lost so its owner can requeue it.
pub struct Queued {
    pub frame: Frame,
    pub level: EncryptionLevel,
    pub on_lost: Option<Box<dyn FnOnce() + Send>>,
}

/// Buffers frames awaiting transmission, independent of any one packet-number space's loss
/// state, and owns the per-connection congestion controller.
pub struct Sender {
    queue: VecDeque<Queued>,
    initial_token: Vec<u8>,
    controller: Box<dyn Controller>,
}

impl Sender {
    pub fn new(controller: Box<dyn Controller>) -> Self {
        Self {
            queue: VecDeque::new(),
            initial_token: Vec::new(),
            controller,
        }
    }

    /// Queues `frame` for the given encryption level. If it's later lost, `on_lost` runs once.
    pub fn send_with_callback(
        &mut self,
        frame: Frame,
        level: EncryptionLevel,
        on_lost: impl FnOnce() + Send + 'static,
    ) {
        self.queue.push_back(Queued {
            frame,
            level,
            on_lost: Some(Box::new(on_lost)),
        });
    }

    pub fn send(&mut self, frame: Frame, level: EncryptionLevel) {
        self.queue.push_back(Queued {
            frame,
            level,
            on_lost: None,
        });
    }

    pub fn pop_for_level(&mut self, level: EncryptionLevel) -> Option<Queued> {
        let pos = self.queue.iter().position(|q| q.level == level)?;
        self.queue.remove(pos)
    }

    pub fn has_pending(&self, level: EncryptionLevel) -> bool {
        self.queue.iter().any(|q| q.level == level)
    }

    /// Sets the address-validation token carried on every Initial packet after a Retry, or the
    /// token a NEW_TOKEN frame handed us for a future connection.
    pub fn set_initial_token(&mut self, token: Vec<u8>) {
        self.initial_token = token;
    }

    pub fn initial_token(&self) -> &[u8] {
        &self.initial_token
    }

    pub fn get_congestion_controller(&self) -> &dyn Controller {
        self.controller.as_ref()
    }

    pub fn get_congestion_controller_mut(&mut self) -> &mut dyn Controller {
        self.controller.as_mut()
    }
}

/// Maps an `EncryptionLevel` to the packet-number space it shares keys with (0-RTT and 1-RTT
/// both use the Application space's packet numbers).
pub fn space_for(level: EncryptionLevel) -> PnSpace {
    PnSpace::for_level(level)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::congestion::NewReno;

    fn sender() -> Sender {
        Sender::new(Box::new(NewReno::default()))
    }

    #[test]
    fn pop_returns_only_matching_level() {
        let mut s = sender();
        s.send(Frame::Ping, EncryptionLevel::Initial);
        s.send(Frame::HandshakeDone, EncryptionLevel::Application);
        let popped = s.pop_for_level(EncryptionLevel::Application).unwrap();
        assert!(matches!(popped.frame, Frame::HandshakeDone));
        assert!(s.has_pending(EncryptionLevel::Initial));
        assert!(!s.has_pending(EncryptionLevel::Application));
    }

    #[test]
    fn lost_callback_runs_exactly_once() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let mut s = sender();
        let called = Arc::new(AtomicBool::new(false));
        let called_clone = called.clone();
        s.send_with_callback(Frame::Ping, EncryptionLevel::Initial, move || {
            called_clone.store(true, Ordering::SeqCst)
        });
        let queued = s.pop_for_level(EncryptionLevel::Initial).unwrap();
        queued.on_lost.unwrap()();
        assert!(called.load(Ordering::SeqCst));
    }
}
