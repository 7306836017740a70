//! Connection identifiers and the manager that tracks their sequence-numbered lifecycle.

use std::collections::VecDeque;
use std::fmt;
use std::ops::Deref;

use rand::Rng;

use crate::frame;
use crate::{TransportError, MAX_CID_SIZE};

/// An opaque QUIC connection identifier, 0..20 bytes.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct ConnectionId {
    len: u8,
    bytes: [u8; MAX_CID_SIZE],
}

impl ConnectionId {
    pub fn new(bytes: &[u8]) -> Self {
        debug_assert!(bytes.len() <= MAX_CID_SIZE);
        let mut buf = [0; MAX_CID_SIZE];
        buf[..bytes.len()].copy_from_slice(bytes);
        Self {
            len: bytes.len() as u8,
            bytes: buf,
        }
    }

    pub fn random<R: Rng>(rng: &mut R, len: usize) -> Self {
        debug_assert!(len <= MAX_CID_SIZE);
        let mut buf = [0; MAX_CID_SIZE];
        rng.fill_bytes(&mut buf[..len]);
        Self {
            len: len as u8,
            bytes: buf,
        }
    }

    pub fn is_empty(self) -> bool {
        self.len == 0
    }
}

impl Deref for ConnectionId {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.bytes[..self.len as usize].fmt(f)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for byte in self.iter() {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Generates connection IDs for the local endpoint to hand out.
///
/// A trait rather than an inlined `ConnectionId::random` call so tests can supply a
/// deterministic generator.
pub trait ConnectionIdGenerator: Send {
    fn generate(&mut self) -> ConnectionId;
    fn cid_len(&self) -> usize;
}

pub struct RandomConnectionIdGenerator {
    rng: rand::rngs::OsRng,
    len: usize,
}

impl RandomConnectionIdGenerator {
    pub fn new(len: usize) -> Self {
        Self {
            rng: rand::rngs::OsRng::new().expect("failed to initialize RNG"),
            len,
        }
    }
}

impl ConnectionIdGenerator for RandomConnectionIdGenerator {
    fn generate(&mut self) -> ConnectionId {
        ConnectionId::random(&mut self.rng, self.len)
    }

    fn cid_len(&self) -> usize {
        self.len
    }
}

/// Lifecycle status of one entry in a `CidManager` table, per the data model's NEW/USED/RETIRED
/// progression. Never regresses.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CidStatus {
    New,
    Used,
    Retired,
}

struct CidEntry {
    cid: ConnectionId,
    status: CidStatus,
    stateless_reset_token: Option<[u8; 16]>,
}

/// Tracks local (source) and remote (destination) connection IDs by sequence number, their
/// NEW/USED/RETIRED status, and the peer's `active_connection_id_limit`.
pub struct CidManager {
    source_cids: Vec<(u64, CidEntry)>,
    destination_cids: Vec<(u64, CidEntry)>,
    next_source_seq: u64,
    retire_prior_to: u64,
    dest_retire_prior_to: u64,
    peer_active_cid_limit: u64,
    /// NewConnectionIdFrames that still need to be transmitted.
    pub pending_new_cids: VecDeque<frame::NewConnectionId>,
    /// RetireConnectionIdFrames that still need to be transmitted.
    pub pending_retires: VecDeque<u64>,
}

impl CidManager {
    pub fn new(gen: &mut dyn ConnectionIdGenerator, initial_dst: ConnectionId) -> Self {
        let first_local = gen.generate();
        let mut mgr = Self {
            source_cids: Vec::new(),
            destination_cids: Vec::new(),
            next_source_seq: 0,
            retire_prior_to: 0,
            dest_retire_prior_to: 0,
            peer_active_cid_limit: 2,
            pending_new_cids: VecDeque::new(),
            pending_retires: VecDeque::new(),
        };
        mgr.insert_source(first_local, CidStatus::New);
        mgr.destination_cids.push((
            0,
            CidEntry {
                cid: initial_dst,
                status: CidStatus::Used,
                stateless_reset_token: None,
            },
        ));
        mgr
    }

    fn insert_source(&mut self, cid: ConnectionId, status: CidStatus) -> u64 {
        let seq = self.next_source_seq;
        self.next_source_seq += 1;
        self.source_cids.push((
            seq,
            CidEntry {
                cid,
                status,
                stateless_reset_token: None,
            },
        ));
        seq
    }

    pub fn set_peer_active_cid_limit(&mut self, limit: u64) {
        self.peer_active_cid_limit = limit;
    }

    fn active_source_count(&self) -> usize {
        self.source_cids
            .iter()
            .filter(|(_, e)| e.status != CidStatus::Retired)
            .count()
    }

    /// Generates `count` new source CIDs, queuing NEW_CONNECTION_ID frames for each, honoring
    /// `retire_prior_to` as the threshold communicated to the peer.
    pub fn new_connection_ids(
        &mut self,
        gen: &mut dyn ConnectionIdGenerator,
        count: usize,
        retire_prior_to: u64,
    ) -> Vec<ConnectionId> {
        self.retire_prior_to = self.retire_prior_to.max(retire_prior_to);
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            let cid = gen.generate();
            let seq = self.insert_source(cid, CidStatus::New);
            self.pending_new_cids.push_back(frame::NewConnectionId {
                sequence: seq,
                retire_prior_to: self.retire_prior_to,
                cid,
                stateless_reset_token: [0; 16],
            });
            out.push(cid);
        }
        out
    }

    /// A packet arrived addressed to one of our local CIDs. Marks it USED the first time, and
    /// tops up the pool if the peer's active-CID limit still has headroom.
    pub fn on_local_cid_used(&mut self, gen: &mut dyn ConnectionIdGenerator, cid: &ConnectionId) {
        let mut first_use = false;
        for (_, entry) in &mut self.source_cids {
            if &entry.cid == cid {
                if entry.status == CidStatus::New {
                    entry.status = CidStatus::Used;
                    first_use = true;
                }
                break;
            }
        }
        if first_use && (self.active_source_count() as u64) < self.peer_active_cid_limit {
            self.new_connection_ids(gen, 1, self.retire_prior_to);
        }
    }

    /// Records a peer CID announced via NEW_CONNECTION_ID, honoring reordering against
    /// `retire_prior_to`. Returns an error if the frame violates `retire_prior_to <= sequence`.
    pub fn record_peer_cid(
        &mut self,
        sequence: u64,
        retire_prior_to: u64,
        cid: ConnectionId,
        stateless_reset_token: [u8; 16],
    ) -> Result<(), TransportError> {
        if retire_prior_to > sequence {
            return Err(TransportError::ProtocolViolation);
        }
        if sequence < self.dest_retire_prior_to {
            // Reordered with a later NEW_CONNECTION_ID that already raised the retire threshold.
            self.pending_retires.push_back(sequence);
        } else {
            self.destination_cids.push((
                sequence,
                CidEntry {
                    cid,
                    status: CidStatus::New,
                    stateless_reset_token: Some(stateless_reset_token),
                },
            ));
        }
        self.dest_retire_prior_to = self.dest_retire_prior_to.max(retire_prior_to);
        Ok(())
    }

    /// Marks a local source CID retired after the peer asked us to via RETIRE_CONNECTION_ID; if
    /// headroom remains under the peer's limit, a replacement is queued.
    pub fn retire_source_cid(&mut self, gen: &mut dyn ConnectionIdGenerator, sequence: u64) {
        for (seq, entry) in &mut self.source_cids {
            if *seq == sequence {
                entry.status = CidStatus::Retired;
                break;
            }
        }
        if (self.active_source_count() as u64) < self.peer_active_cid_limit {
            self.new_connection_ids(gen, 1, self.retire_prior_to);
        }
    }

    /// Queues a RETIRE_CONNECTION_ID frame for one of our destination (peer) CIDs.
    pub fn retire_destination_cid(&mut self, sequence: u64) {
        for (seq, entry) in &mut self.destination_cids {
            if *seq == sequence {
                entry.status = CidStatus::Retired;
            }
        }
        self.pending_retires.push_back(sequence);
    }

    pub fn current_destination_cid(&self) -> ConnectionId {
        self.destination_cids
            .iter()
            .rev()
            .find(|(_, e)| e.status != CidStatus::Retired)
            .map(|(_, e)| e.cid)
            .expect("at least one destination cid must remain live")
    }

    pub fn current_source_cid(&self) -> ConnectionId {
        self.source_cids
            .iter()
            .rev()
            .find(|(_, e)| e.status != CidStatus::Retired)
            .map(|(_, e)| e.cid)
            .expect("at least one source cid must remain live")
    }

    /// Replaces the destination CID at sequence 0, as happens when a Retry supplies a new one.
    pub fn set_initial_destination_cid(&mut self, cid: ConnectionId) {
        if let Some((_, entry)) = self.destination_cids.iter_mut().find(|(seq, _)| *seq == 0) {
            entry.cid = cid;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SequentialGen(u8);
    impl ConnectionIdGenerator for SequentialGen {
        fn generate(&mut self) -> ConnectionId {
            self.0 += 1;
            ConnectionId::new(&[self.0; 4])
        }
        fn cid_len(&self) -> usize {
            4
        }
    }

    #[test]
    fn first_use_tops_up_pool() {
        let mut gen = SequentialGen(0);
        let dst = ConnectionId::new(&[0xaa; 4]);
        let mut mgr = CidManager::new(&mut gen, dst);
        mgr.set_peer_active_cid_limit(2);
        let first = mgr.current_source_cid();
        assert_eq!(mgr.pending_new_cids.len(), 0);
        mgr.on_local_cid_used(&mut gen, &first);
        assert_eq!(mgr.pending_new_cids.len(), 1);
        // Using the same CID again is a no-op.
        mgr.on_local_cid_used(&mut gen, &first);
        assert_eq!(mgr.pending_new_cids.len(), 1);
    }

    #[test]
    fn reordered_new_connection_id_retires_immediately() {
        let mut gen = SequentialGen(0);
        let dst = ConnectionId::new(&[0xaa; 4]);
        let mut mgr = CidManager::new(&mut gen, dst);
        // Advance the retire threshold via sequence 5.
        mgr.record_peer_cid(5, 3, ConnectionId::new(&[5; 4]), [0; 16])
            .unwrap();
        // A reordered, older sequence arrives after: it must be retired, not stored.
        mgr.record_peer_cid(1, 0, ConnectionId::new(&[1; 4]), [0; 16])
            .unwrap();
        assert_eq!(mgr.pending_retires.iter().collect::<Vec<_>>(), vec![&1]);
    }

    #[test]
    fn retire_prior_to_exceeding_sequence_is_a_violation() {
        let mut gen = SequentialGen(0);
        let dst = ConnectionId::new(&[0xaa; 4]);
        let mut mgr = CidManager::new(&mut gen, dst);
        let err = mgr
            .record_peer_cid(1, 2, ConnectionId::new(&[1; 4]), [0; 16])
            .unwrap_err();
        assert_eq!(err, TransportError::ProtocolViolation);
    }

    #[test]
    fn retire_source_cid_replenishes_under_limit() {
        let mut gen = SequentialGen(0);
        let dst = ConnectionId::new(&[0xaa; 4]);
        let mut mgr = CidManager::new(&mut gen, dst);
        mgr.set_peer_active_cid_limit(2);
        mgr.retire_source_cid(&mut gen, 0);
        assert_eq!(mgr.pending_new_cids.len(), 1);
    }
}
