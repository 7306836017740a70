//! The connection state machine: phase transitions, Retry/Version-Negotiation handling,
//! transport-parameter validation, and the frame handlers that tie the rest of the crate
//! together.

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};
use slog::{debug, o, trace, warn, Logger};

use crate::builder::ClientConfig;
use crate::cid::{CidManager, ConnectionIdGenerator};
use crate::congestion::Controller;
use crate::flow_control::{self, FlowControl, SendLimiter};
use crate::frame::{self, Frame};
use crate::loss::{LossDetector, PnSpace, RttEstimator, SentPacket};
use crate::packet::{self, EncryptionLevel, Header};
use crate::qlog::{self, Sink};
use crate::sender::Sender;
use crate::tls::TlsSession;
use crate::transport_parameters::TransportParameters;
use crate::{ConnectError, ConnectionId, Directionality, Side, StreamId, TransportError};

/// Where a connection sits in the handshake/close lifecycle (§3's `ConnectionStatus`).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionState {
    Idle,
    Handshaking,
    Connected,
    Closing,
    Draining,
    Closed,
}

/// Notifications the connection surfaces to whatever drives its event loop. Datagram I/O and
/// the TLS record layer live outside this crate, so those are represented as requests rather
/// than side effects this type performs itself.
#[derive(Debug)]
pub enum Event {
    Connected,
    HandshakeDataReady { level: EncryptionLevel, data: Vec<u8> },
    /// A packet was received whose header parsed cleanly but whose payload is still protected;
    /// the caller must remove header protection and decrypt it (the TLS engine's job) and feed
    /// the resulting frames back via [`Connection::on_packet_authenticated`].
    NeedsDecryption { space: PnSpace, packet_number_hint: u64 },
    ConnectionLost(ConnectError),
}

/// Maps an encryption level to the qlog `packet_type` string its packets are logged under.
fn packet_type_name(level: EncryptionLevel) -> &'static str {
    match level {
        EncryptionLevel::Initial => "initial",
        EncryptionLevel::Handshake => "handshake",
        EncryptionLevel::ZeroRtt => "0RTT",
        EncryptionLevel::Application => "1RTT",
    }
}

/// Same mapping, from the packet-number space a lost packet was tracked under. The Application
/// space is shared by 0-RTT and 1-RTT packets; since 0-RTT is out of scope for this client, a
/// lost packet found there is always reported as 1-RTT.
fn packet_type_name_for_space(space: PnSpace) -> &'static str {
    match space {
        PnSpace::Initial => "initial",
        PnSpace::Handshake => "handshake",
        PnSpace::Application => "1RTT",
    }
}

struct SpaceState {
    loss: LossDetector,
    next_packet_number: u64,
    received: crate::range_set::RangeSet,
}

impl Default for SpaceState {
    fn default() -> Self {
        Self {
            loss: LossDetector::new(),
            next_packet_number: 0,
            received: crate::range_set::RangeSet::new(),
        }
    }
}

struct Spaces {
    initial: SpaceState,
    handshake: SpaceState,
    application: SpaceState,
}

impl Default for Spaces {
    fn default() -> Self {
        Self {
            initial: SpaceState::default(),
            handshake: SpaceState::default(),
            application: SpaceState::default(),
        }
    }
}

impl Spaces {
    fn get_mut(&mut self, space: PnSpace) -> &mut SpaceState {
        match space {
            PnSpace::Initial => &mut self.initial,
            PnSpace::Handshake => &mut self.handshake,
            PnSpace::Application => &mut self.application,
        }
    }

    fn get(&self, space: PnSpace) -> &SpaceState {
        match space {
            PnSpace::Initial => &self.initial,
            PnSpace::Handshake => &self.handshake,
            PnSpace::Application => &self.application,
        }
    }
}

/// A client-side QUIC connection attempt.
pub struct Connection {
    state: ConnectionState,
    version: crate::Version,
    cid_generator: Box<dyn ConnectionIdGenerator>,
    cid_mgr: CidManager,
    original_destination_cid: ConnectionId,
    retry_source_cid: Option<ConnectionId>,
    retried: bool,
    first_server_packet_processed: bool,

    local_params: TransportParameters,
    peer_params: Option<TransportParameters>,

    spaces: Spaces,
    rtt: RttEstimator,
    conn_flow_control: FlowControl,
    conn_send_limiter: Option<SendLimiter>,
    stream_recv_flow: HashMap<StreamId, FlowControl>,
    stream_send_flow: HashMap<StreamId, SendLimiter>,
    next_bidi_stream_index: u64,
    next_uni_stream_index: u64,

    sender: Sender,
    tls: Option<Box<dyn TlsSession>>,
    qlog: Box<dyn Sink>,
    logger: Logger,

    idle_timeout_deadline: Option<u64>,
    close_reason: Option<(u64, Vec<u8>)>,
    close_sent: bool,
}

impl Connection {
    pub fn new(config: &ClientConfig, now_millis: u64) -> Self {
        let mut cid_generator = (config.cid_generator_factory)();
        let original_destination_cid = cid_generator.generate();
        let cid_mgr = CidManager::new(&mut *cid_generator, original_destination_cid);

        let mut local_params = TransportParameters {
            max_idle_timeout: config.transport.max_idle_timeout,
            initial_max_data: config.transport.initial_max_data,
            initial_max_stream_data_bidi_local: config.transport.initial_max_stream_data_bidi_local,
            initial_max_stream_data_bidi_remote: config.transport.initial_max_stream_data_bidi_remote,
            initial_max_stream_data_uni: config.transport.initial_max_stream_data_uni,
            initial_max_streams_bidi: config.transport.initial_max_streams_bidi,
            initial_max_streams_uni: config.transport.initial_max_streams_uni,
            active_connection_id_limit: config.transport.active_connection_id_limit,
            ..TransportParameters::default()
        };
        local_params.initial_source_connection_id = Some(cid_mgr.current_source_cid());

        let conn_flow_control = FlowControl::new(config.transport.initial_max_data);
        let controller = config.transport.congestion_controller_factory.build();

        Self {
            state: ConnectionState::Idle,
            version: config.version,
            cid_generator,
            cid_mgr,
            original_destination_cid,
            retry_source_cid: None,
            retried: false,
            first_server_packet_processed: false,
            local_params,
            peer_params: None,
            spaces: Spaces::default(),
            rtt: RttEstimator::default(),
            conn_flow_control,
            conn_send_limiter: None,
            stream_recv_flow: HashMap::new(),
            stream_send_flow: HashMap::new(),
            next_bidi_stream_index: 0,
            next_uni_stream_index: 0,
            sender: Sender::new(controller),
            tls: None,
            qlog: Box::new(qlog::NullSink),
            logger: config.logger.new(o!("role" => "client")),
            idle_timeout_deadline: Some(now_millis + config.transport.max_idle_timeout),
            close_reason: None,
            close_sent: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn set_qlog_sink(&mut self, sink: Box<dyn Sink>) {
        self.qlog = sink;
    }

    /// Begins the handshake. `alpn` must be non-empty and not all whitespace.
    pub fn connect(&mut self, now_millis: u64, alpn: &str) -> Result<(), ConnectError> {
        if alpn.trim().is_empty() {
            return Err(ConnectError::InvalidArgument);
        }
        self.state = ConnectionState::Handshaking;
        self.idle_timeout_deadline = Some(now_millis + self.local_params.max_idle_timeout);
        self.qlog.log(qlog::Event::connection_started(
            now_millis as f64,
            self.cid_mgr.current_source_cid().to_string(),
            self.original_destination_cid.to_string(),
        ));
        if let Some(tls) = self.tls.as_mut() {
            if let Some(bytes) = tls.write_handshake() {
                self.queue_crypto(EncryptionLevel::Initial, Bytes::from(bytes));
            }
        }
        Ok(())
    }

    fn queue_crypto(&mut self, level: EncryptionLevel, data: Bytes) {
        self.sender.send(
            Frame::Crypto(frame::Crypto { offset: 0, data }),
            level,
        );
    }

    /// Processes one received datagram's leading packet. Coalesced trailing packets are left
    /// in `datagram` for a subsequent call once the caller has stripped the packet this call
    /// consumed; decrypted-payload packets are surfaced as [`Event::NeedsDecryption`] since
    /// removing header protection and opening the AEAD box is the TLS engine's job.
    pub fn handle_datagram(
        &mut self,
        now_millis: u64,
        datagram: &mut BytesMut,
    ) -> Result<Vec<Event>, TransportError> {
        let cid_len = self.cid_mgr.current_source_cid().len();
        let header = packet::decode(datagram, cid_len)?;
        self.idle_timeout_deadline = Some(now_millis + self.effective_idle_timeout());

        match header {
            Header::VersionNegotiate {
                supported_versions, ..
            } => Ok(self.on_version_negotiation(&supported_versions)),
            Header::Retry {
                version,
                src_cid,
                token,
                integrity_tag,
                header_and_token,
                ..
            } => Ok(self.on_retry(version, src_cid, &token, integrity_tag, &header_and_token)),
            Header::Initial { dst_cid, .. } => {
                self.on_server_packet_header(dst_cid);
                Ok(vec![Event::NeedsDecryption {
                    space: PnSpace::Initial,
                    packet_number_hint: self.spaces.get(PnSpace::Initial).next_packet_number,
                }])
            }
            Header::Handshake { dst_cid, .. } => {
                self.on_server_packet_header(dst_cid);
                Ok(vec![Event::NeedsDecryption {
                    space: PnSpace::Handshake,
                    packet_number_hint: self.spaces.get(PnSpace::Handshake).next_packet_number,
                }])
            }
            Header::ZeroRtt { .. } => Err(TransportError::InvalidPacket),
            Header::Short { dst_cid, .. } => {
                self.on_server_packet_header(dst_cid);
                Ok(vec![Event::NeedsDecryption {
                    space: PnSpace::Application,
                    packet_number_hint: self.spaces.get(PnSpace::Application).next_packet_number,
                }])
            }
        }
    }

    fn on_server_packet_header(&mut self, dst_cid: ConnectionId) {
        self.first_server_packet_processed = true;
        self.cid_mgr.on_local_cid_used(&mut *self.cid_generator, &dst_cid);
    }

    fn effective_idle_timeout(&self) -> u64 {
        let local = self.local_params.max_idle_timeout;
        let peer = self
            .peer_params
            .as_ref()
            .map(|p| p.max_idle_timeout)
            .unwrap_or(0);
        match (local, peer) {
            (0, 0) => u64::max_value(),
            (0, p) => p,
            (l, 0) => l,
            (l, p) => l.min(p),
        }
    }

    /// RFC 9000 §6: a VN packet received after any server packet has been processed, or one
    /// that lists our own version, is ignored outright.
    fn on_version_negotiation(&mut self, supported_versions: &[crate::Version]) -> Vec<Event> {
        if self.first_server_packet_processed {
            return Vec::new();
        }
        if supported_versions.contains(&self.version) {
            return Vec::new();
        }
        debug!(self.logger, "version negotiation received"; "offered" => supported_versions.len());
        vec![Event::ConnectionLost(ConnectError::UnsupportedVersion(
            self.version.0,
        ))]
    }

    /// At most one Retry is ever processed, and only before any other server packet.
    fn on_retry(
        &mut self,
        version: crate::Version,
        src_cid: ConnectionId,
        token: &[u8],
        integrity_tag: [u8; 16],
        header_and_token: &[u8],
    ) -> Vec<Event> {
        if self.retried || self.first_server_packet_processed {
            return Vec::new();
        }
        let expected = packet::retry_integrity_tag(version, &self.original_destination_cid, header_and_token);
        if expected != integrity_tag {
            warn!(self.logger, "retry integrity tag mismatch");
            return Vec::new();
        }

        self.retried = true;
        self.retry_source_cid = Some(src_cid);
        self.cid_mgr.set_initial_destination_cid(src_cid);
        self.sender.set_initial_token(token.to_vec());
        trace!(self.logger, "retry accepted"; "token_len" => token.len());

        // Re-drive the Initial: the packet number space starts over, since everything sent
        // before the Retry was addressed to a destination CID the server has now replaced.
        self.spaces.initial = SpaceState::default();
        if let Some(tls) = self.tls.as_mut() {
            if let Some(bytes) = tls.write_handshake() {
                self.queue_crypto(EncryptionLevel::Initial, Bytes::from(bytes));
            }
        }
        Vec::new()
    }

    /// Applies the peer's transport parameters. Must be called exactly once, during the
    /// handshake, with the CID the peer's first flight actually used as `peer_first_flight_src_cid`.
    pub fn set_peer_transport_parameters(
        &mut self,
        raw: &[u8],
        peer_first_flight_src_cid: ConnectionId,
    ) -> Result<(), TransportError> {
        let params = TransportParameters::parse(raw)?;
        params.validate_against_cids(
            peer_first_flight_src_cid,
            self.original_destination_cid,
            self.retry_source_cid,
        )?;

        self.conn_send_limiter = Some(SendLimiter::new(params.initial_max_data));
        self.cid_mgr.set_peer_active_cid_limit(params.active_connection_id_limit);
        self.peer_params = Some(params);
        Ok(())
    }

    /// Feeds frames already decrypted and authenticated by the caller back into the connection.
    pub fn on_packet_authenticated(
        &mut self,
        now_millis: u64,
        space: PnSpace,
        packet_number: u64,
        frames: Vec<Frame>,
    ) -> Result<(), TransportError> {
        self.spaces.get_mut(space).received.insert_one(packet_number);
        for f in frames {
            self.handle_frame(now_millis, space, f)?;
        }
        Ok(())
    }

    fn handle_frame(&mut self, now_millis: u64, space: PnSpace, frame: Frame) -> Result<(), TransportError> {
        match frame {
            Frame::Padding | Frame::Ping => Ok(()),
            Frame::Ack(ack) => self.handle_ack(now_millis, space, ack),
            Frame::MaxData(limit) => {
                if let Some(limiter) = self.conn_send_limiter.as_mut() {
                    limiter.on_max_data_frame(limit);
                }
                Ok(())
            }
            Frame::MaxStreamData { id, offset } => {
                self.stream_send_flow
                    .entry(id)
                    .or_insert_with(|| SendLimiter::new(0))
                    .on_max_data_frame(offset);
                Ok(())
            }
            Frame::NewConnectionId(f) => self.cid_mgr.record_peer_cid(
                f.sequence,
                f.retire_prior_to,
                f.cid,
                f.stateless_reset_token,
            ),
            Frame::RetireConnectionId { sequence } => {
                self.cid_mgr.retire_source_cid(&mut *self.cid_generator, sequence);
                Ok(())
            }
            Frame::ConnectionClose(cc) => {
                self.on_peer_close(now_millis, cc.error_code, cc.reason.to_vec());
                Ok(())
            }
            Frame::HandshakeDone => {
                if self.state == ConnectionState::Handshaking {
                    self.state = ConnectionState::Connected;
                }
                Ok(())
            }
            Frame::Crypto(c) => {
                if let Some(tls) = self.tls.as_mut() {
                    tls.read_handshake(&c.data)?;
                    if let Some(bytes) = tls.write_handshake() {
                        self.queue_crypto(EncryptionLevel::Initial, Bytes::from(bytes));
                    }
                }
                Ok(())
            }
            Frame::ResetStream(_) | Frame::StopSending(_) => Ok(()),
            Frame::Stream(s) => {
                let len = s.data.len() as u64;
                let id = s.id;
                let fc = self
                    .stream_recv_flow
                    .entry(id)
                    .or_insert_with(|| FlowControl::new(self.local_params.initial_max_stream_data_bidi_local));
                let before = fc.received();
                fc.on_bytes_received(s.offset, len)?;
                let newly_received = fc.received().saturating_sub(before);
                if let Some(new_limit) = fc.poll_max_data() {
                    self.sender.send(
                        Frame::MaxStreamData { id, offset: new_limit },
                        EncryptionLevel::Application,
                    );
                }
                if newly_received > 0 {
                    let conn_offset = self.conn_flow_control.received();
                    self.conn_flow_control.on_bytes_received(conn_offset, newly_received)?;
                    if let Some(new_conn_limit) = self.conn_flow_control.poll_max_data() {
                        self.sender.send(Frame::MaxData(new_conn_limit), EncryptionLevel::Application);
                    }
                }
                Ok(())
            }
            Frame::NewToken { .. } => Ok(()),
            Frame::DataBlocked { .. } | Frame::StreamDataBlocked { .. } | Frame::StreamsBlocked { .. } => Ok(()),
            Frame::MaxStreams { .. } => Ok(()),
            Frame::PathChallenge(v) => {
                self.sender.send(Frame::PathResponse(v), EncryptionLevel::Application);
                Ok(())
            }
            Frame::PathResponse(_) => Ok(()),
        }
    }

    fn handle_ack(&mut self, now_millis: u64, space: PnSpace, ack: frame::Ack) -> Result<(), TransportError> {
        let ack_delay_exponent = self
            .peer_params
            .as_ref()
            .map(|p| p.ack_delay_exponent)
            .unwrap_or(3);
        let max_ack_delay = self.peer_params.as_ref().map(|p| p.max_ack_delay).unwrap_or(25);
        let ack_delay_millis = (ack.delay << ack_delay_exponent) / 1000;
        let ranges: Vec<(u64, u64)> = ack.iter().collect();
        let largest = ack.largest;

        let outcome = {
            let rtt = &mut self.rtt;
            let space_state = self.spaces.get_mut(space);
            space_state.loss.on_ack_received(
                ranges.into_iter(),
                largest,
                now_millis,
                rtt,
                ack_delay_millis,
                max_ack_delay,
            )
        };

        let controller = self.sender.get_congestion_controller_mut();
        for packet in &outcome.acked {
            if packet.in_flight {
                controller.on_ack(now_millis, packet.time_sent, packet.size, false);
            }
        }
        for (_, packet) in &outcome.newly_lost {
            if packet.in_flight {
                controller.on_congestion_event(now_millis, packet.time_sent);
            }
        }
        for (pn, _) in &outcome.newly_lost {
            self.qlog.log(qlog::Event::packet_lost(
                now_millis as f64,
                packet_type_name_for_space(space),
                *pn,
            ));
        }
        Ok(())
    }

    /// Receiving a ConnectionClose while Connected triggers exactly one reply ConnectionClose
    /// and moves to Draining; if we'd already sent our own (we're in Closing), the peer's close
    /// is not re-replied to, per "only one ConnectionClose frame is sent per direction".
    fn on_peer_close(&mut self, now_millis: u64, error_code: u64, reason: Vec<u8>) {
        if self.state == ConnectionState::Closed || self.state == ConnectionState::Draining {
            return;
        }
        if !self.close_sent {
            self.send_close_frame(now_millis, error_code, &reason);
        } else {
            self.close_reason = Some((error_code, reason));
        }
        self.state = ConnectionState::Draining;
    }

    /// Builds and enqueues the one ConnectionClose frame this connection will ever send,
    /// shared by both the locally initiated `close()` and the reply to a peer's ConnectionClose.
    fn send_close_frame(&mut self, now_millis: u64, error_code: u64, reason: &[u8]) {
        self.sender.send(
            Frame::ConnectionClose(frame::ConnectionClose {
                error_code,
                frame_type: Some(0),
                reason: Bytes::from(reason.to_vec()),
            }),
            EncryptionLevel::Application,
        );
        self.close_sent = true;
        self.close_reason = Some((error_code, reason.to_vec()));
        self.qlog.log(qlog::Event::connection_closed(
            now_millis as f64,
            error_code,
            String::from_utf8_lossy(reason).into_owned(),
        ));
    }

    /// Closes the connection, sending exactly one `ConnectionClose` the first time this is
    /// called. Subsequent calls (and inbound `ConnectionClose` frames already handled) are
    /// no-ops.
    pub fn close(&mut self, now_millis: u64, error_code: u64, reason: &[u8]) {
        if self.close_sent || self.state == ConnectionState::Closed {
            return;
        }
        self.send_close_frame(now_millis, error_code, reason);
        self.state = ConnectionState::Closing;
    }

    /// Fires the idle timeout: runs the same bookkeeping as a local timeout error and moves
    /// straight to Closed, with no final ConnectionClose (nobody would receive it).
    pub fn on_idle_timeout(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.close_reason = self.close_reason.take().or(Some((0, Vec::new())));
        self.state = ConnectionState::Closed;
    }

    pub fn poll_idle_timeout(&self) -> Option<u64> {
        self.idle_timeout_deadline
    }

    /// Allocates the next client-initiated stream ID of the requested directionality.
    pub fn create_stream(&mut self, dir: Directionality) -> Result<StreamId, ConnectError> {
        if self.state != ConnectionState::Connected {
            return Err(ConnectError::InvalidArgument);
        }
        let index = match dir {
            Directionality::Bi => {
                let i = self.next_bidi_stream_index;
                self.next_bidi_stream_index += 1;
                i
            }
            Directionality::Uni => {
                let i = self.next_uni_stream_index;
                self.next_uni_stream_index += 1;
                i
            }
        };
        Ok(StreamId::new(Side::Client, dir, index))
    }

    /// Queues up to `data.len()` bytes of stream data, clamped to whichever is tighter: the
    /// peer's advertised per-stream send credit or its connection-level credit (§4.6). Returns
    /// the number of bytes actually queued, which may be less than `data.len()`; a caller
    /// holding back the remainder retries once the peer raises its limits.
    pub fn send_stream_data(&mut self, id: StreamId, data: Bytes, fin: bool) -> usize {
        let stream_ceiling = self
            .stream_send_flow
            .entry(id)
            .or_insert_with(|| SendLimiter::new(0))
            .available();
        let connection_credit = self
            .conn_send_limiter
            .as_ref()
            .map(SendLimiter::available)
            .unwrap_or(0);
        let allowed = flow_control::increase_flow_control_limit(
            data.len() as u64,
            stream_ceiling,
            connection_credit,
        ) as usize;
        if allowed == 0 {
            return 0;
        }

        let offset = self.stream_send_flow[&id].sent();
        let chunk = data.slice(0, allowed);
        self.stream_send_flow.get_mut(&id).unwrap().record_sent(allowed as u64);
        if let Some(limiter) = self.conn_send_limiter.as_mut() {
            limiter.record_sent(allowed as u64);
        }
        self.sender.send(
            Frame::Stream(frame::Stream {
                id,
                offset,
                fin: fin && allowed == data.len(),
                data: chunk,
            }),
            EncryptionLevel::Application,
        );
        allowed
    }

    /// Drains every frame currently queued at `level` into one outgoing packet: assigns the
    /// next packet number in the corresponding space, registers it with that space's loss
    /// detector and (if it counts against bytes-in-flight) the congestion controller, and logs a
    /// qlog `packet_sent` event. Returns the packet number and encoded frame bytes for the
    /// caller to wrap in a QUIC packet header and have the TLS engine protect; `None` if nothing
    /// is queued at this level.
    pub fn poll_transmit(&mut self, now_millis: u64, level: EncryptionLevel) -> Option<(u64, Vec<u8>)> {
        let mut queued = Vec::new();
        while let Some(q) = self.sender.pop_for_level(level) {
            queued.push(q);
        }
        if queued.is_empty() {
            return None;
        }

        let space = PnSpace::for_level(level);
        let ack_eliciting = queued.iter().any(|q| q.frame.is_ack_eliciting());
        let only_close = queued.len() == 1 && matches!(queued[0].frame, Frame::ConnectionClose(_));
        let in_flight = ack_eliciting && !only_close;

        let mut buf = Vec::new();
        let frames: Vec<Frame> = queued.iter().map(|q| q.frame.clone()).collect();
        for q in &queued {
            q.frame.encode(&mut buf);
        }
        let size = buf.len() as u64;

        let packet_number = {
            let space_state = self.spaces.get_mut(space);
            let pn = space_state.next_packet_number;
            space_state.next_packet_number += 1;
            space_state.loss.on_packet_sent(
                pn,
                SentPacket {
                    time_sent: now_millis,
                    size,
                    ack_eliciting,
                    in_flight,
                    frames,
                },
            );
            pn
        };
        if in_flight {
            self.sender.get_congestion_controller_mut().on_sent(now_millis, size);
        }

        self.qlog.log(qlog::Event::packet_sent(
            now_millis as f64,
            packet_type_name(level),
            packet_number,
            size,
        ));

        Some((packet_number, buf))
    }

    pub fn original_destination_cid(&self) -> ConnectionId {
        self.original_destination_cid
    }

    pub fn retry_source_cid(&self) -> Option<ConnectionId> {
        self.retry_source_cid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ClientConfigBuilder;

    fn config() -> ClientConfig {
        let mut b = ClientConfigBuilder::new();
        b.uri("example.com", &[b"h3"]).unwrap();
        b.build()
    }

    #[test]
    fn connect_rejects_blank_alpn() {
        let mut conn = Connection::new(&config(), 0);
        assert!(matches!(conn.connect(0, "   "), Err(ConnectError::InvalidArgument)));
    }

    #[test]
    fn connect_moves_to_handshaking() {
        let mut conn = Connection::new(&config(), 0);
        conn.connect(0, "h3").unwrap();
        assert_eq!(conn.state(), ConnectionState::Handshaking);
    }

    #[test]
    fn retry_with_valid_tag_is_accepted_exactly_once() {
        let mut conn = Connection::new(&config(), 0);
        conn.connect(0, "h3").unwrap();
        let odcid = conn.original_destination_cid();
        let src = ConnectionId::new(&[0x0b; 4]);
        let header_and_token: Vec<u8> = {
            let mut h = vec![0xff, 0, 0, 0, 1, odcid.len() as u8];
            h.extend_from_slice(&odcid);
            h.push(src.len() as u8);
            h.extend_from_slice(&src);
            h.extend_from_slice(&[1, 2, 3]);
            h
        };
        let tag = packet::retry_integrity_tag(crate::Version::V1, &odcid, &header_and_token);

        conn.on_retry(crate::Version::V1, src, &[1, 2, 3], tag, &header_and_token);
        assert!(conn.retried);
        assert_eq!(conn.retry_source_cid(), Some(src));
        assert_eq!(conn.sender.initial_token(), &[1, 2, 3]);

        // A second Retry, even with a correct tag, must be ignored.
        let other_src = ConnectionId::new(&[0x0c; 4]);
        conn.on_retry(crate::Version::V1, other_src, &[9], tag, &header_and_token);
        assert_eq!(conn.retry_source_cid(), Some(src));
    }

    #[test]
    fn retry_with_bad_tag_is_ignored() {
        let mut conn = Connection::new(&config(), 0);
        conn.connect(0, "h3").unwrap();
        let odcid = conn.original_destination_cid();
        let src = ConnectionId::new(&[0x0b; 4]);
        conn.on_retry(crate::Version::V1, src, &[1, 2, 3], [0xaa; 16], b"garbage");
        assert!(!conn.retried);
        assert_eq!(conn.retry_source_cid(), None);
    }

    #[test]
    fn create_stream_ids_follow_client_bidi_sequence() {
        let mut conn = Connection::new(&config(), 0);
        conn.connect(0, "h3").unwrap();
        conn.state = ConnectionState::Connected;
        let a = conn.create_stream(Directionality::Bi).unwrap();
        let b = conn.create_stream(Directionality::Bi).unwrap();
        assert_eq!(a.0, 0);
        assert_eq!(b.0, 4);
    }

    #[test]
    fn close_is_idempotent() {
        let mut conn = Connection::new(&config(), 0);
        conn.connect(0, "h3").unwrap();
        conn.state = ConnectionState::Connected;
        conn.close(0, 0, b"bye");
        assert!(conn.sender.has_pending(EncryptionLevel::Application));
        let _ = conn.sender.pop_for_level(EncryptionLevel::Application);
        conn.close(1, 0, b"bye again");
        assert!(!conn.sender.has_pending(EncryptionLevel::Application));
    }

    #[test]
    fn peer_close_triggers_one_reply_and_drains() {
        let mut conn = Connection::new(&config(), 0);
        conn.connect(0, "h3").unwrap();
        conn.state = ConnectionState::Connected;

        conn.on_peer_close(0, 42, b"done".to_vec());
        assert_eq!(conn.state(), ConnectionState::Draining);
        assert!(conn.sender.has_pending(EncryptionLevel::Application));
        let queued = conn.sender.pop_for_level(EncryptionLevel::Application).unwrap();
        assert!(matches!(queued.frame, Frame::ConnectionClose(ref cc) if cc.error_code == 42));
        assert!(!conn.sender.has_pending(EncryptionLevel::Application));

        // A second peer close must not queue another reply.
        conn.on_peer_close(1, 7, b"again".to_vec());
        assert!(!conn.sender.has_pending(EncryptionLevel::Application));
    }

    #[test]
    fn peer_close_after_local_close_does_not_double_send() {
        let mut conn = Connection::new(&config(), 0);
        conn.connect(0, "h3").unwrap();
        conn.state = ConnectionState::Connected;

        conn.close(0, 0, b"bye");
        let _ = conn.sender.pop_for_level(EncryptionLevel::Application);
        conn.on_peer_close(1, 1, b"also bye".to_vec());
        assert_eq!(conn.state(), ConnectionState::Draining);
        assert!(!conn.sender.has_pending(EncryptionLevel::Application));
    }

    #[test]
    fn send_stream_data_clamps_to_connection_credit() {
        let mut conn = Connection::new(&config(), 0);
        conn.connect(0, "h3").unwrap();
        conn.state = ConnectionState::Connected;
        conn.conn_send_limiter = Some(SendLimiter::new(5));
        let id = conn.create_stream(Directionality::Bi).unwrap();
        conn.stream_send_flow.insert(id, SendLimiter::new(100));

        let queued = conn.send_stream_data(id, Bytes::from_static(b"hello world"), false);
        assert_eq!(queued, 5);
        let frame = conn.sender.pop_for_level(EncryptionLevel::Application).unwrap();
        assert!(matches!(frame.frame, Frame::Stream(ref s) if s.data.len() == 5 && s.offset == 0));
    }

    #[test]
    fn poll_transmit_assigns_increasing_packet_numbers_and_logs_qlog() {
        let mut conn = Connection::new(&config(), 0);
        conn.connect(0, "h3").unwrap();
        conn.state = ConnectionState::Connected;
        conn.set_qlog_sink(Box::new(qlog::BufferingSink::default()));

        conn.close(0, 0, b"bye");
        let (pn, buf) = conn.poll_transmit(0, EncryptionLevel::Application).unwrap();
        assert_eq!(pn, 0);
        assert!(!buf.is_empty());
        assert!(conn.poll_transmit(0, EncryptionLevel::Application).is_none());
    }

    #[test]
    fn transport_parameter_mismatch_closes_with_0x08() {
        let mut conn = Connection::new(&config(), 0);
        conn.connect(0, "h3").unwrap();
        let mut buf = BytesMut::new();
        let bogus_params = TransportParameters::default();
        bogus_params.write(ConnectionId::new(&[9; 4]), &mut buf);
        let err = conn
            .set_peer_transport_parameters(&buf, ConnectionId::new(&[1; 4]))
            .unwrap_err();
        assert_eq!(err, TransportError::TransportParameterError);
    }
}
