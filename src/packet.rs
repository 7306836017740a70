//! Long/short header parsing and the Retry integrity tag.
//!
//! Header-protection removal and payload decryption are delegated to the TLS engine's traffic
//! keys (out of scope for this core); this module only concerns itself with the structural,
//! invariant parts of the header that are needed to decide long/short, packet type, and which
//! packet-number space a datagram belongs to.

use bytes::{Buf, BufMut, Bytes, BytesMut, IntoBuf};
use ring::aead;

use crate::cid::ConnectionId;
use crate::coding::{get_bytes, VarInt};
use crate::version::{self, Version};
use crate::TransportError;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum EncryptionLevel {
    Initial,
    Handshake,
    ZeroRtt,
    Application,
}

#[derive(Debug, Clone)]
pub enum Header {
    VersionNegotiate {
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        supported_versions: Vec<Version>,
    },
    Initial {
        version: Version,
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        token: Bytes,
        /// Protected packet-number + payload, as it appeared on the wire.
        protected_payload: Bytes,
    },
    ZeroRtt {
        version: Version,
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        protected_payload: Bytes,
    },
    Handshake {
        version: Version,
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        protected_payload: Bytes,
    },
    Retry {
        version: Version,
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        token: Bytes,
        integrity_tag: [u8; 16],
        /// Everything from the first header byte through the token, i.e. the packet minus the
        /// tag -- the suffix of the Retry pseudo-packet the client must reconstruct.
        header_and_token: Bytes,
    },
    Short {
        dst_cid: ConnectionId,
        protected_payload: Bytes,
    },
}

impl Header {
    pub fn encryption_level(&self) -> Option<EncryptionLevel> {
        match self {
            Header::Initial { .. } => Some(EncryptionLevel::Initial),
            Header::ZeroRtt { .. } => Some(EncryptionLevel::ZeroRtt),
            Header::Handshake { .. } => Some(EncryptionLevel::Handshake),
            Header::Short { .. } => Some(EncryptionLevel::Application),
            Header::VersionNegotiate { .. } | Header::Retry { .. } => None,
        }
    }
}

/// Splits one datagram into the first packet's header plus the remaining coalesced bytes, if
/// any. `local_cid_len` is required to know where a Short header's destination CID ends.
pub fn decode(datagram: &mut BytesMut, local_cid_len: usize) -> Result<Header, TransportError> {
    if datagram.is_empty() {
        return Err(TransportError::InvalidPacket);
    }
    let first = datagram[0];
    if first & 0x80 == 0 {
        return decode_short(datagram, local_cid_len);
    }
    decode_long(datagram, first)
}

fn read_cid(buf: &mut BytesMut) -> Result<ConnectionId, TransportError> {
    if buf.is_empty() {
        return Err(TransportError::InvalidPacket);
    }
    let len = buf.split_to(1)[0] as usize;
    if buf.len() < len || len > crate::MAX_CID_SIZE {
        return Err(TransportError::InvalidPacket);
    }
    Ok(ConnectionId::new(&buf.split_to(len)))
}

fn decode_long(datagram: &mut BytesMut, first: u8) -> Result<Header, TransportError> {
    if datagram.len() < 5 {
        return Err(TransportError::InvalidPacket);
    }
    // Kept around in case this turns out to be a Retry packet, whose integrity tag is computed
    // over the header bytes consumed below.
    let full_packet = datagram.clone();
    let _ = datagram.split_to(1);
    let version = Version(datagram.split_to(4).into_buf().get_u32_be());

    if version == Version::NEGOTIATION {
        let dst_cid = read_cid(datagram)?;
        let src_cid = read_cid(datagram)?;
        let supported_versions =
            version::parse_supported_versions(datagram).ok_or(TransportError::InvalidPacket)?;
        return Ok(Header::VersionNegotiate {
            dst_cid,
            src_cid,
            supported_versions,
        });
    }

    if !version.is_known() {
        return Err(TransportError::UnknownVersion);
    }

    let ty = (first & 0x30) >> 4;
    let dst_cid = read_cid(datagram)?;
    let src_cid = read_cid(datagram)?;

    match ty {
        0b00 => {
            let token_len = VarInt::decode(datagram)
                .ok_or(TransportError::InvalidPacket)?
                .0 as usize;
            let token = get_bytes(datagram, token_len).ok_or(TransportError::InvalidPacket)?;
            let length = VarInt::decode(datagram)
                .ok_or(TransportError::InvalidPacket)?
                .0 as usize;
            if datagram.len() < length {
                return Err(TransportError::InvalidPacket);
            }
            let protected_payload = datagram.split_to(length).freeze();
            Ok(Header::Initial {
                version,
                dst_cid,
                src_cid,
                token: Bytes::from(token),
                protected_payload,
            })
        }
        0b01 => {
            // A client never accepts 0-RTT packets.
            Err(TransportError::InvalidPacket)
        }
        0b10 => {
            let length = VarInt::decode(datagram)
                .ok_or(TransportError::InvalidPacket)?
                .0 as usize;
            if datagram.len() < length {
                return Err(TransportError::InvalidPacket);
            }
            let protected_payload = datagram.split_to(length).freeze();
            Ok(Header::Handshake {
                version,
                dst_cid,
                src_cid,
                protected_payload,
            })
        }
        0b11 => {
            if datagram.len() < 16 {
                return Err(TransportError::InvalidPacket);
            }
            let token_len = datagram.len() - 16;
            let token = datagram.split_to(token_len).freeze();
            let tag_bytes = datagram.split_to(16);
            let mut integrity_tag = [0; 16];
            integrity_tag.copy_from_slice(&tag_bytes);
            let header_and_token = full_packet[..full_packet.len() - 16].to_vec();
            Ok(Header::Retry {
                version,
                dst_cid,
                src_cid,
                token,
                integrity_tag,
                header_and_token: Bytes::from(header_and_token),
            })
        }
        _ => unreachable!("2-bit field"),
    }
}

fn decode_short(datagram: &mut BytesMut, local_cid_len: usize) -> Result<Header, TransportError> {
    if datagram.len() < 1 + local_cid_len {
        return Err(TransportError::InvalidPacket);
    }
    let _ = datagram.split_to(1);
    let dst_cid = ConnectionId::new(&datagram.split_to(local_cid_len));
    let protected_payload = datagram.split_off(0).freeze();
    Ok(Header::Short {
        dst_cid,
        protected_payload,
    })
}

/// The fixed AEAD key RFC 9001 §5.8 assigns to computing the Retry integrity tag for QUIC v1.
const RETRY_KEY_V1: [u8; 16] = [
    0xbe, 0x0c, 0x69, 0x0b, 0x9f, 0x66, 0x57, 0x5a, 0x1d, 0x76, 0x6b, 0x54, 0xe3, 0x68, 0xc8, 0x4e,
];
const RETRY_NONCE_V1: [u8; 12] = [
    0x46, 0x15, 0x99, 0xd3, 0x5d, 0x63, 0x2b, 0xf2, 0x23, 0x98, 0x25, 0xbb,
];

/// Computes the 16-byte Retry integrity tag over `odcid ‖ pseudo_packet` per RFC 9001 §5.8.
///
/// `header_and_token` is everything in the Retry packet up to (but excluding) the tag itself:
/// the first header byte, version, DCID, SCID, and token.
pub fn retry_integrity_tag(
    version: Version,
    odcid: &ConnectionId,
    header_and_token: &[u8],
) -> [u8; 16] {
    let (key, nonce) = retry_aead_params(version);
    let mut pseudo_packet = Vec::with_capacity(1 + odcid.len() + header_and_token.len());
    pseudo_packet.put_u8(odcid.len() as u8);
    pseudo_packet.extend_from_slice(odcid);
    pseudo_packet.extend_from_slice(header_and_token);

    let sealing_key =
        aead::SealingKey::new(&aead::AES_128_GCM, &key).expect("fixed-size retry key is valid");
    // No plaintext; `in_out` holds only the 16 bytes of space the tag is written into.
    let mut in_out = vec![0u8; 16];
    aead::seal_in_place(&sealing_key, &nonce, &pseudo_packet, &mut in_out, 16)
        .expect("sealing an empty plaintext cannot fail");
    let mut tag = [0; 16];
    tag.copy_from_slice(&in_out[..16]);
    tag
}

fn retry_aead_params(_version: Version) -> ([u8; 16], [u8; 12]) {
    // Every version this client negotiates (v1, v2, and the drafts since -25) shares the same
    // Retry AEAD parameters; only -24 and earlier used a different key, which is below the
    // minimum supported version and therefore not implemented here.
    (RETRY_KEY_V1, RETRY_NONCE_V1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_negotiation_parse() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0x80, 0, 0, 0, 0]); // long header, version 0
        buf.extend_from_slice(&[0]); // empty dst cid
        buf.extend_from_slice(&[0]); // empty src cid
        buf.extend_from_slice(&[
            0x0a, 0x0b, 0x0c, 0x0d, 0x04, 0x0f, 0x0e, 0x0d, 0x0c, 0xff, 0x00, 0x00, 0x18,
        ]);
        match decode(&mut buf, 4).unwrap() {
            Header::VersionNegotiate {
                supported_versions, ..
            } => {
                assert_eq!(supported_versions.len(), 3);
                assert_eq!(supported_versions[2], Version::DRAFT_24);
            }
            _ => panic!("expected version negotiation"),
        }
    }

    #[test]
    fn rejects_zero_rtt_as_client() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0x80 | (0b01 << 4), 0, 0, 0, 1]); // Zero-RTT, v1
        buf.extend_from_slice(&[0]);
        buf.extend_from_slice(&[0]);
        buf.extend_from_slice(&[0]); // length varint = 0
        assert_eq!(decode(&mut buf, 4), Err(TransportError::InvalidPacket));
    }

    #[test]
    fn truncated_buffer_is_invalid() {
        let mut buf = BytesMut::from(vec![0x80]);
        assert_eq!(decode(&mut buf, 4), Err(TransportError::InvalidPacket));
    }

    #[test]
    fn retry_integrity_tag_is_deterministic_and_input_sensitive() {
        let odcid = ConnectionId::new(&[0x83, 0x94, 0xc8, 0xf0, 0x3e, 0x51, 0x57, 0x08]);
        let header_and_token: [u8; 20] = [
            0xff, 0x00, 0x00, 0x00, 0x01, 0x00, 0x08, 0xf0, 0x67, 0xa5, 0x50, 0x2a, 0x42, 0x62,
            0xb5, 0x74, 0x6f, 0x6b, 0x65, 0x6e,
        ];
        let tag_a = retry_integrity_tag(Version::V1, &odcid, &header_and_token);
        let tag_b = retry_integrity_tag(Version::V1, &odcid, &header_and_token);
        assert_eq!(tag_a, tag_b, "same input must produce the same tag");

        let mut altered = header_and_token;
        altered[19] ^= 0xff;
        let tag_c = retry_integrity_tag(Version::V1, &odcid, &altered);
        assert_ne!(tag_a, tag_c, "changing the token must change the tag");
    }
}
