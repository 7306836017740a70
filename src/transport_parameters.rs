//! QUIC transport parameters: the values exchanged during the handshake that govern flow
//! control, connection ID policy, and timeouts, plus the validation an endpoint that went
//! through Retry must apply to what the peer sends back.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::cid::ConnectionId;
use crate::coding::{get_bytes, VarInt};
use crate::TransportError;

macro_rules! tp_ids {
    ($($name:ident = $val:expr,)*) => {
        $(const $name: u64 = $val;)*
    };
}

tp_ids! {
    ID_ORIGINAL_DESTINATION_CONNECTION_ID = 0x00,
    ID_MAX_IDLE_TIMEOUT = 0x01,
    ID_INITIAL_MAX_DATA = 0x04,
    ID_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL = 0x05,
    ID_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE = 0x06,
    ID_INITIAL_MAX_STREAM_DATA_UNI = 0x07,
    ID_INITIAL_MAX_STREAMS_BIDI = 0x08,
    ID_INITIAL_MAX_STREAMS_UNI = 0x09,
    ID_ACK_DELAY_EXPONENT = 0x0a,
    ID_MAX_ACK_DELAY = 0x0b,
    ID_ACTIVE_CONNECTION_ID_LIMIT = 0x0e,
    ID_INITIAL_SOURCE_CONNECTION_ID = 0x0f,
    ID_RETRY_SOURCE_CONNECTION_ID = 0x10,
}

/// The subset of RFC 9000 §18.2 transport parameters this client cares about. Parameters this
/// client doesn't act on (e.g. `disable_active_migration`, `preferred_address`) are parsed and
/// discarded rather than rejected, per the "ignore what you don't understand" extensibility
/// rule.
#[derive(Debug, Clone)]
pub struct TransportParameters {
    pub max_idle_timeout: u64,
    pub initial_max_data: u64,
    pub initial_max_stream_data_bidi_local: u64,
    pub initial_max_stream_data_bidi_remote: u64,
    pub initial_max_stream_data_uni: u64,
    pub initial_max_streams_bidi: u64,
    pub initial_max_streams_uni: u64,
    pub ack_delay_exponent: u64,
    pub max_ack_delay: u64,
    pub active_connection_id_limit: u64,
    pub original_destination_connection_id: Option<ConnectionId>,
    pub initial_source_connection_id: Option<ConnectionId>,
    pub retry_source_connection_id: Option<ConnectionId>,
}

impl Default for TransportParameters {
    fn default() -> Self {
        Self {
            max_idle_timeout: 30_000,
            initial_max_data: 1 << 20,
            initial_max_stream_data_bidi_local: 1 << 20,
            initial_max_stream_data_bidi_remote: 1 << 20,
            initial_max_stream_data_uni: 1 << 20,
            initial_max_streams_bidi: 100,
            initial_max_streams_uni: 100,
            ack_delay_exponent: 3,
            max_ack_delay: 25,
            active_connection_id_limit: 4,
            original_destination_connection_id: None,
            initial_source_connection_id: None,
            retry_source_connection_id: None,
        }
    }
}

impl TransportParameters {
    /// Encodes this client's own offered parameters. `initial_source_connection_id` is always
    /// sent by a client; `original_destination_connection_id` and `retry_source_connection_id`
    /// are server-only and therefore never emitted here.
    pub fn write(&self, initial_source_cid: ConnectionId, buf: &mut BytesMut) {
        write_varint_param(buf, ID_MAX_IDLE_TIMEOUT, self.max_idle_timeout);
        write_varint_param(buf, ID_INITIAL_MAX_DATA, self.initial_max_data);
        write_varint_param(
            buf,
            ID_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL,
            self.initial_max_stream_data_bidi_local,
        );
        write_varint_param(
            buf,
            ID_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE,
            self.initial_max_stream_data_bidi_remote,
        );
        write_varint_param(
            buf,
            ID_INITIAL_MAX_STREAM_DATA_UNI,
            self.initial_max_stream_data_uni,
        );
        write_varint_param(buf, ID_INITIAL_MAX_STREAMS_BIDI, self.initial_max_streams_bidi);
        write_varint_param(buf, ID_INITIAL_MAX_STREAMS_UNI, self.initial_max_streams_uni);
        write_varint_param(buf, ID_ACK_DELAY_EXPONENT, self.ack_delay_exponent);
        write_varint_param(buf, ID_MAX_ACK_DELAY, self.max_ack_delay);
        write_varint_param(
            buf,
            ID_ACTIVE_CONNECTION_ID_LIMIT,
            self.active_connection_id_limit,
        );
        write_cid_param(buf, ID_INITIAL_SOURCE_CONNECTION_ID, &initial_source_cid);
    }

    /// Parses the peer's encoded transport parameters, applying the wire-format rules but not
    /// yet the Retry-aware CID checks -- those require context this function doesn't have, and
    /// are applied separately by `validate_against_cids`.
    pub fn parse(raw: &[u8]) -> Result<Self, TransportError> {
        let mut buf = Bytes::from(raw.to_vec());
        let mut params = TransportParameters::default();

        while buf.has_remaining() {
            let id = VarInt::decode(&mut buf)
                .ok_or(TransportError::TransportParameterError)?
                .0;
            let len = VarInt::decode(&mut buf)
                .ok_or(TransportError::TransportParameterError)?
                .0 as usize;
            if buf.remaining() < len {
                return Err(TransportError::TransportParameterError);
            }
            let mut value = buf.split_to(len);

            match id {
                ID_MAX_IDLE_TIMEOUT => params.max_idle_timeout = read_varint(&mut value)?,
                ID_INITIAL_MAX_DATA => params.initial_max_data = read_varint(&mut value)?,
                ID_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL => {
                    params.initial_max_stream_data_bidi_local = read_varint(&mut value)?
                }
                ID_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE => {
                    params.initial_max_stream_data_bidi_remote = read_varint(&mut value)?
                }
                ID_INITIAL_MAX_STREAM_DATA_UNI => {
                    params.initial_max_stream_data_uni = read_varint(&mut value)?
                }
                ID_INITIAL_MAX_STREAMS_BIDI => {
                    params.initial_max_streams_bidi = read_varint(&mut value)?
                }
                ID_INITIAL_MAX_STREAMS_UNI => {
                    params.initial_max_streams_uni = read_varint(&mut value)?
                }
                ID_ACK_DELAY_EXPONENT => params.ack_delay_exponent = read_varint(&mut value)?,
                ID_MAX_ACK_DELAY => params.max_ack_delay = read_varint(&mut value)?,
                ID_ACTIVE_CONNECTION_ID_LIMIT => {
                    params.active_connection_id_limit = read_varint(&mut value)?
                }
                ID_ORIGINAL_DESTINATION_CONNECTION_ID => {
                    params.original_destination_connection_id = Some(ConnectionId::new(&value));
                }
                ID_INITIAL_SOURCE_CONNECTION_ID => {
                    params.initial_source_connection_id = Some(ConnectionId::new(&value));
                }
                ID_RETRY_SOURCE_CONNECTION_ID => {
                    params.retry_source_connection_id = Some(ConnectionId::new(&value));
                }
                _ => {} // unknown parameter: ignored per the extensibility rule
            }
        }

        Ok(params)
    }

    /// Applies the CID-echo rules a client must check once transport parameters arrive:
    ///
    /// - `initial_source_connection_id` must equal the source CID the peer actually used on its
    ///   first flight.
    /// - `original_destination_connection_id` must equal the CID the client originally sent its
    ///   first Initial to.
    /// - `retry_source_connection_id` must be present iff a Retry occurred, and if present must
    ///   equal the source CID carried on that Retry packet.
    pub fn validate_against_cids(
        &self,
        peer_first_flight_src_cid: ConnectionId,
        original_destination_cid: ConnectionId,
        retry_source_cid: Option<ConnectionId>,
    ) -> Result<(), TransportError> {
        if self.initial_source_connection_id != Some(peer_first_flight_src_cid) {
            return Err(TransportError::TransportParameterError);
        }
        if self.original_destination_connection_id != Some(original_destination_cid) {
            return Err(TransportError::TransportParameterError);
        }
        if self.retry_source_connection_id != retry_source_cid {
            return Err(TransportError::TransportParameterError);
        }
        Ok(())
    }
}

fn write_varint_param(buf: &mut BytesMut, id: u64, value: u64) {
    VarInt(id).encode(buf);
    let v = VarInt(value);
    VarInt(v.size() as u64).encode(buf);
    v.encode(buf);
}

fn write_cid_param(buf: &mut BytesMut, id: u64, cid: &ConnectionId) {
    VarInt(id).encode(buf);
    VarInt(cid.len() as u64).encode(buf);
    buf.put_slice(cid);
}

fn read_varint(buf: &mut Bytes) -> Result<u64, TransportError> {
    VarInt::decode(buf)
        .map(u64::from)
        .ok_or(TransportError::TransportParameterError)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_basic_params() {
        let mut params = TransportParameters::default();
        params.initial_max_data = 12345;
        params.active_connection_id_limit = 8;
        let cid = ConnectionId::new(&[1, 2, 3, 4]);

        let mut buf = BytesMut::new();
        params.write(cid, &mut buf);
        let parsed = TransportParameters::parse(&buf).unwrap();

        assert_eq!(parsed.initial_max_data, 12345);
        assert_eq!(parsed.active_connection_id_limit, 8);
        assert_eq!(parsed.initial_source_connection_id, Some(cid));
    }

    #[test]
    fn unknown_parameter_is_ignored() {
        let mut buf = BytesMut::new();
        VarInt(0x9999).encode(&mut buf); // reserved/unassigned id
        VarInt(3).encode(&mut buf);
        buf.put_slice(&[1, 2, 3]);
        write_varint_param(&mut buf, ID_INITIAL_MAX_DATA, 42);

        let parsed = TransportParameters::parse(&buf).unwrap();
        assert_eq!(parsed.initial_max_data, 42);
    }

    #[test]
    fn validate_rejects_odcid_mismatch() {
        let mut params = TransportParameters::default();
        let src = ConnectionId::new(&[1; 4]);
        params.initial_source_connection_id = Some(src);
        params.original_destination_connection_id = Some(ConnectionId::new(&[2; 8]));

        let err = params
            .validate_against_cids(src, ConnectionId::new(&[3; 8]), None)
            .unwrap_err();
        assert_eq!(err, TransportError::TransportParameterError);
    }

    #[test]
    fn validate_requires_retry_source_cid_when_retried() {
        let mut params = TransportParameters::default();
        let src = ConnectionId::new(&[1; 4]);
        let odcid = ConnectionId::new(&[2; 8]);
        params.initial_source_connection_id = Some(src);
        params.original_destination_connection_id = Some(odcid);
        // No retry_source_connection_id set, but caller says a Retry happened.
        let err = params
            .validate_against_cids(src, odcid, Some(ConnectionId::new(&[9; 4])))
            .unwrap_err();
        assert_eq!(err, TransportError::TransportParameterError);
    }
}
