//! Typed QUIC frames: parsing, serialization, and the ack-eliciting predicate loss detection and
//! the sender façade both depend on.

use bytes::{Buf, BufMut, Bytes};

use crate::cid::ConnectionId;
use crate::coding::{get_bytes, VarInt};
use crate::range_set::RangeSet;
use crate::{Directionality, StreamId};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FrameType {
    Padding,
    Ping,
    Ack,
    ResetStream,
    StopSending,
    Crypto,
    NewToken,
    Stream,
    MaxData,
    MaxStreamData,
    MaxStreams,
    DataBlocked,
    StreamDataBlocked,
    StreamsBlocked,
    NewConnectionId,
    RetireConnectionId,
    PathChallenge,
    PathResponse,
    ConnectionClose,
    HandshakeDone,
}

#[derive(Debug, Clone)]
pub struct Ack {
    pub largest: u64,
    /// Ack delay, in the sender's measured units, still to be multiplied by the peer's
    /// `ack_delay_exponent` by the caller.
    pub delay: u64,
    pub ranges: RangeSet,
}

impl Ack {
    /// Iterates all acknowledged packet numbers as half-open ranges, most recent first.
    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.ranges.iter()
    }
}

#[derive(Debug, Clone)]
pub struct ResetStream {
    pub id: StreamId,
    pub error_code: u64,
    pub final_size: u64,
}

#[derive(Debug, Clone)]
pub struct StopSending {
    pub id: StreamId,
    pub error_code: u64,
}

#[derive(Debug, Clone)]
pub struct Crypto {
    pub offset: u64,
    pub data: Bytes,
}

#[derive(Debug, Clone)]
pub struct Stream {
    pub id: StreamId,
    pub offset: u64,
    pub fin: bool,
    pub data: Bytes,
}

#[derive(Debug, Clone)]
pub struct NewConnectionId {
    pub sequence: u64,
    pub retire_prior_to: u64,
    pub cid: ConnectionId,
    pub stateless_reset_token: [u8; 16],
}

#[derive(Debug, Clone)]
pub struct ConnectionClose {
    pub error_code: u64,
    /// `Some` for a transport-level close (frame type 0x1c), `None` for an application close
    /// (0x1d).
    pub frame_type: Option<u64>,
    pub reason: Bytes,
}

#[derive(Debug, Clone)]
pub enum Frame {
    Padding,
    Ping,
    Ack(Ack),
    ResetStream(ResetStream),
    StopSending(StopSending),
    Crypto(Crypto),
    NewToken { token: Bytes },
    Stream(Stream),
    MaxData(u64),
    MaxStreamData { id: StreamId, offset: u64 },
    MaxStreams { dir: Directionality, count: u64 },
    DataBlocked { offset: u64 },
    StreamDataBlocked { id: StreamId, offset: u64 },
    StreamsBlocked { dir: Directionality, count: u64 },
    NewConnectionId(NewConnectionId),
    RetireConnectionId { sequence: u64 },
    PathChallenge(u64),
    PathResponse(u64),
    ConnectionClose(ConnectionClose),
    HandshakeDone,
}

impl Frame {
    pub fn ty(&self) -> FrameType {
        match self {
            Frame::Padding => FrameType::Padding,
            Frame::Ping => FrameType::Ping,
            Frame::Ack(_) => FrameType::Ack,
            Frame::ResetStream(_) => FrameType::ResetStream,
            Frame::StopSending(_) => FrameType::StopSending,
            Frame::Crypto(_) => FrameType::Crypto,
            Frame::NewToken { .. } => FrameType::NewToken,
            Frame::Stream(_) => FrameType::Stream,
            Frame::MaxData(_) => FrameType::MaxData,
            Frame::MaxStreamData { .. } => FrameType::MaxStreamData,
            Frame::MaxStreams { .. } => FrameType::MaxStreams,
            Frame::DataBlocked { .. } => FrameType::DataBlocked,
            Frame::StreamDataBlocked { .. } => FrameType::StreamDataBlocked,
            Frame::StreamsBlocked { .. } => FrameType::StreamsBlocked,
            Frame::NewConnectionId(_) => FrameType::NewConnectionId,
            Frame::RetireConnectionId { .. } => FrameType::RetireConnectionId,
            Frame::PathChallenge(_) => FrameType::PathChallenge,
            Frame::PathResponse(_) => FrameType::PathResponse,
            Frame::ConnectionClose(_) => FrameType::ConnectionClose,
            Frame::HandshakeDone => FrameType::HandshakeDone,
        }
    }

    /// True unless this frame is one of the three the loss detector never counts towards
    /// ack-eliciting accounting: ACK, PADDING, and CONNECTION_CLOSE.
    pub fn is_ack_eliciting(&self) -> bool {
        !matches!(
            self,
            Frame::Ack(_) | Frame::Padding | Frame::ConnectionClose(_)
        )
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        match self {
            Frame::Padding => buf.put_u8(0x00),
            Frame::Ping => buf.put_u8(0x01),
            Frame::Ack(ack) => {
                buf.put_u8(0x02);
                VarInt(ack.largest).encode(buf);
                VarInt(ack.delay).encode(buf);
                let ranges: Vec<(u64, u64)> = ack.ranges.iter().collect();
                VarInt(ranges.len().saturating_sub(1) as u64).encode(buf);
                // First block: largest down to the start of the top range.
                let (top_start, top_end) = *ranges.last().expect("ack must cover >=1 range");
                debug_assert_eq!(top_end - 1, ack.largest);
                VarInt(top_end - 1 - top_start).encode(buf);
                let mut prev_start = top_start;
                for &(start, end) in ranges.iter().rev().skip(1) {
                    let gap = prev_start - end - 1;
                    VarInt(gap).encode(buf);
                    VarInt(end - 1 - start).encode(buf);
                    prev_start = start;
                }
            }
            Frame::ResetStream(f) => {
                buf.put_u8(0x04);
                VarInt(f.id.0).encode(buf);
                VarInt(f.error_code).encode(buf);
                VarInt(f.final_size).encode(buf);
            }
            Frame::StopSending(f) => {
                buf.put_u8(0x05);
                VarInt(f.id.0).encode(buf);
                VarInt(f.error_code).encode(buf);
            }
            Frame::Crypto(f) => {
                buf.put_u8(0x06);
                VarInt(f.offset).encode(buf);
                VarInt(f.data.len() as u64).encode(buf);
                buf.put_slice(&f.data);
            }
            Frame::NewToken { token } => {
                buf.put_u8(0x07);
                VarInt(token.len() as u64).encode(buf);
                buf.put_slice(token);
            }
            Frame::Stream(f) => {
                let ty = 0x08 | 0x04 /* OFF */ | if f.fin { 0x01 } else { 0 } | 0x02 /* LEN */;
                buf.put_u8(ty);
                VarInt(f.id.0).encode(buf);
                VarInt(f.offset).encode(buf);
                VarInt(f.data.len() as u64).encode(buf);
                buf.put_slice(&f.data);
            }
            Frame::MaxData(v) => {
                buf.put_u8(0x10);
                VarInt(*v).encode(buf);
            }
            Frame::MaxStreamData { id, offset } => {
                buf.put_u8(0x11);
                VarInt(id.0).encode(buf);
                VarInt(*offset).encode(buf);
            }
            Frame::MaxStreams { dir, count } => {
                buf.put_u8(if *dir == Directionality::Bi { 0x12 } else { 0x13 });
                VarInt(*count).encode(buf);
            }
            Frame::DataBlocked { offset } => {
                buf.put_u8(0x14);
                VarInt(*offset).encode(buf);
            }
            Frame::StreamDataBlocked { id, offset } => {
                buf.put_u8(0x15);
                VarInt(id.0).encode(buf);
                VarInt(*offset).encode(buf);
            }
            Frame::StreamsBlocked { dir, count } => {
                buf.put_u8(if *dir == Directionality::Bi { 0x16 } else { 0x17 });
                VarInt(*count).encode(buf);
            }
            Frame::NewConnectionId(f) => {
                buf.put_u8(0x18);
                VarInt(f.sequence).encode(buf);
                VarInt(f.retire_prior_to).encode(buf);
                buf.put_u8(f.cid.len() as u8);
                buf.put_slice(&f.cid);
                buf.put_slice(&f.stateless_reset_token);
            }
            Frame::RetireConnectionId { sequence } => {
                buf.put_u8(0x19);
                VarInt(*sequence).encode(buf);
            }
            Frame::PathChallenge(v) => {
                buf.put_u8(0x1a);
                buf.put_u64_be(*v);
            }
            Frame::PathResponse(v) => {
                buf.put_u8(0x1b);
                buf.put_u64_be(*v);
            }
            Frame::ConnectionClose(f) => {
                buf.put_u8(if f.frame_type.is_some() { 0x1c } else { 0x1d });
                VarInt(f.error_code).encode(buf);
                if let Some(ft) = f.frame_type {
                    VarInt(ft).encode(buf);
                }
                VarInt(f.reason.len() as u64).encode(buf);
                buf.put_slice(&f.reason);
            }
            Frame::HandshakeDone => buf.put_u8(0x1e),
        }
    }
}

/// Iterates the frames within one decrypted packet payload, stopping at the first frame that
/// fails to parse (a `FRAME_ENCODING_ERROR` the caller surfaces as `TransportError`).
pub struct Iter {
    buf: Bytes,
}

impl Iter {
    pub fn new(payload: Bytes) -> Self {
        Self { buf: payload }
    }
}

impl Iterator for Iter {
    type Item = Result<Frame, ()>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.buf.has_remaining() {
            return None;
        }
        Some(decode_one(&mut self.buf))
    }
}

fn decode_one(buf: &mut Bytes) -> Result<Frame, ()> {
    let ty = buf.get_u8();
    match ty {
        0x00 => Ok(Frame::Padding),
        0x01 => Ok(Frame::Ping),
        0x02 | 0x03 => {
            let largest = VarInt::decode(buf).ok_or(())?.0;
            let delay = VarInt::decode(buf).ok_or(())?.0;
            let block_count = VarInt::decode(buf).ok_or(())?.0;
            let first_block = VarInt::decode(buf).ok_or(())?.0;
            let mut ranges = RangeSet::new();
            let mut end = largest + 1;
            let mut start = end - first_block - 1;
            ranges.insert(start..end);
            for _ in 0..block_count {
                let gap = VarInt::decode(buf).ok_or(())?.0;
                let len = VarInt::decode(buf).ok_or(())?.0;
                end = start.checked_sub(gap + 1).ok_or(())?;
                start = end.checked_sub(len + 1).ok_or(())?;
                ranges.insert(start..end);
            }
            if ty == 0x03 {
                // ECN counts: three varints we don't act on.
                VarInt::decode(buf).ok_or(())?;
                VarInt::decode(buf).ok_or(())?;
                VarInt::decode(buf).ok_or(())?;
            }
            Ok(Frame::Ack(Ack {
                largest,
                delay,
                ranges,
            }))
        }
        0x04 => Ok(Frame::ResetStream(ResetStream {
            id: StreamId(VarInt::decode(buf).ok_or(())?.0),
            error_code: VarInt::decode(buf).ok_or(())?.0,
            final_size: VarInt::decode(buf).ok_or(())?.0,
        })),
        0x05 => Ok(Frame::StopSending(StopSending {
            id: StreamId(VarInt::decode(buf).ok_or(())?.0),
            error_code: VarInt::decode(buf).ok_or(())?.0,
        })),
        0x06 => {
            let offset = VarInt::decode(buf).ok_or(())?.0;
            let len = VarInt::decode(buf).ok_or(())?.0 as usize;
            if buf.remaining() < len {
                return Err(());
            }
            Ok(Frame::Crypto(Crypto {
                offset,
                data: buf.split_to(len),
            }))
        }
        0x07 => {
            let len = VarInt::decode(buf).ok_or(())?.0 as usize;
            if buf.remaining() < len {
                return Err(());
            }
            Ok(Frame::NewToken {
                token: buf.split_to(len),
            })
        }
        0x08..=0x0f => {
            let off = ty & 0x04 != 0;
            let len_present = ty & 0x02 != 0;
            let fin = ty & 0x01 != 0;
            let id = StreamId(VarInt::decode(buf).ok_or(())?.0);
            let offset = if off { VarInt::decode(buf).ok_or(())?.0 } else { 0 };
            let data = if len_present {
                let len = VarInt::decode(buf).ok_or(())?.0 as usize;
                if buf.remaining() < len {
                    return Err(());
                }
                buf.split_to(len)
            } else {
                buf.split_to(buf.remaining())
            };
            Ok(Frame::Stream(Stream {
                id,
                offset,
                fin,
                data,
            }))
        }
        0x10 => Ok(Frame::MaxData(VarInt::decode(buf).ok_or(())?.0)),
        0x11 => Ok(Frame::MaxStreamData {
            id: StreamId(VarInt::decode(buf).ok_or(())?.0),
            offset: VarInt::decode(buf).ok_or(())?.0,
        }),
        0x12 | 0x13 => Ok(Frame::MaxStreams {
            dir: if ty == 0x12 {
                Directionality::Bi
            } else {
                Directionality::Uni
            },
            count: VarInt::decode(buf).ok_or(())?.0,
        }),
        0x14 => Ok(Frame::DataBlocked {
            offset: VarInt::decode(buf).ok_or(())?.0,
        }),
        0x15 => Ok(Frame::StreamDataBlocked {
            id: StreamId(VarInt::decode(buf).ok_or(())?.0),
            offset: VarInt::decode(buf).ok_or(())?.0,
        }),
        0x16 | 0x17 => Ok(Frame::StreamsBlocked {
            dir: if ty == 0x16 {
                Directionality::Bi
            } else {
                Directionality::Uni
            },
            count: VarInt::decode(buf).ok_or(())?.0,
        }),
        0x18 => {
            let sequence = VarInt::decode(buf).ok_or(())?.0;
            let retire_prior_to = VarInt::decode(buf).ok_or(())?.0;
            let len = buf.get_u8() as usize;
            let cid_bytes = get_bytes(buf, len).ok_or(())?;
            let token_bytes = get_bytes(buf, 16).ok_or(())?;
            let mut token = [0; 16];
            token.copy_from_slice(&token_bytes);
            Ok(Frame::NewConnectionId(NewConnectionId {
                sequence,
                retire_prior_to,
                cid: ConnectionId::new(&cid_bytes),
                stateless_reset_token: token,
            }))
        }
        0x19 => Ok(Frame::RetireConnectionId {
            sequence: VarInt::decode(buf).ok_or(())?.0,
        }),
        0x1a => {
            if buf.remaining() < 8 {
                return Err(());
            }
            Ok(Frame::PathChallenge(buf.get_u64_be()))
        }
        0x1b => {
            if buf.remaining() < 8 {
                return Err(());
            }
            Ok(Frame::PathResponse(buf.get_u64_be()))
        }
        0x1c | 0x1d => {
            let error_code = VarInt::decode(buf).ok_or(())?.0;
            let frame_type = if ty == 0x1c {
                Some(VarInt::decode(buf).ok_or(())?.0)
            } else {
                None
            };
            let len = VarInt::decode(buf).ok_or(())?.0 as usize;
            if buf.remaining() < len {
                return Err(());
            }
            Ok(Frame::ConnectionClose(ConnectionClose {
                error_code,
                frame_type,
                reason: buf.split_to(len),
            }))
        }
        0x1e => Ok(Frame::HandshakeDone),
        _ => Err(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_eliciting_excludes_ack_padding_close() {
        assert!(!Frame::Padding.is_ack_eliciting());
        assert!(!Frame::Ack(Ack {
            largest: 0,
            delay: 0,
            ranges: RangeSet::new()
        })
        .is_ack_eliciting());
        assert!(!Frame::ConnectionClose(ConnectionClose {
            error_code: 0,
            frame_type: None,
            reason: Bytes::new(),
        })
        .is_ack_eliciting());
        assert!(Frame::Ping.is_ack_eliciting());
        assert!(Frame::HandshakeDone.is_ack_eliciting());
    }

    #[test]
    fn ack_frame_roundtrip_single_range() {
        let mut ranges = RangeSet::new();
        ranges.insert(1..5);
        let ack = Ack {
            largest: 4,
            delay: 10,
            ranges,
        };
        let mut buf = Vec::new();
        Frame::Ack(ack).encode(&mut buf);
        let mut frames = Iter::new(Bytes::from(buf));
        match frames.next().unwrap().unwrap() {
            Frame::Ack(decoded) => {
                assert_eq!(decoded.largest, 4);
                assert_eq!(decoded.delay, 10);
                assert_eq!(decoded.ranges.iter().collect::<Vec<_>>(), vec![(1, 5)]);
            }
            _ => panic!("expected ack"),
        }
    }

    #[test]
    fn stream_frame_roundtrip() {
        let f = Stream {
            id: StreamId(4),
            offset: 16,
            fin: true,
            data: Bytes::from_static(b"hello"),
        };
        let mut buf = Vec::new();
        Frame::Stream(f).encode(&mut buf);
        match Iter::new(Bytes::from(buf)).next().unwrap().unwrap() {
            Frame::Stream(s) => {
                assert_eq!(s.id, StreamId(4));
                assert_eq!(s.offset, 16);
                assert!(s.fin);
                assert_eq!(&s.data[..], b"hello");
            }
            _ => panic!("expected stream"),
        }
    }

    #[test]
    fn unknown_frame_type_is_an_error() {
        let mut frames = Iter::new(Bytes::from_static(&[0xff]));
        assert!(frames.next().unwrap().is_err());
    }
}
