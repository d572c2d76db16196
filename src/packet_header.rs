use std::fmt::{Debug, Formatter};
use anyhow::bail;
use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use crate::seqn::OffsetToWire;

/// Protocol version carried in the first byte of every message
pub const PROTOCOL_VERSION: u8 = 0x11;

/// Largest sequence number a data segment can carry: offsets start at zero and images are
///  limited to this size
pub const MAX_SEQ: u32 = 0x7fff_ffff;
/// Sequence number of the client's ACK for the image message, completing the handshake
pub const SYN_SEQ: u32 = u32::MAX;
/// Sequence number of FIN segments and of their ACKs
pub const FIN_SEQ: u32 = u32::MAX - 1;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum SegmentKind {
    Ack = 0x11,
    Data = 0x20,
    Fec = 0x60,
    Fin = 0xa0,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SegmentHeader {
    pub kind: SegmentKind,
    pub size: u16,
    pub seqn: u32,
}

impl SegmentHeader {
    pub const SERIALIZED_LEN: usize =
        size_of::<u8>()         // version
        + size_of::<u8>()       // kind
        + size_of::<u16>()      // size
        + size_of::<u32>();     // seqn

    pub fn new(kind: SegmentKind, size: u16, seqn: u32) -> SegmentHeader {
        SegmentHeader { kind, size, seqn }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(self.kind.into());
        buf.put_u16(self.size);
        buf.put_u32(self.seqn);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<SegmentHeader> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            bail!("segment header too short: {} bytes", buf.remaining());
        }

        let version = buf.get_u8();
        if version != PROTOCOL_VERSION {
            bail!("unsupported protocol version {:x}", version);
        }
        let kind = SegmentKind::try_from(buf.get_u8())?;
        let size = buf.get_u16();
        let seqn = buf.get_u32();

        Ok(SegmentHeader { kind, size, seqn })
    }
}

/// A segment decoded from a datagram, with its payload borrowed from the receive buffer
#[derive(Clone, Eq, PartialEq)]
pub enum Segment<'a> {
    Data { seqn: u32, payload: &'a [u8] },
    Fec { seqn: u32, payload: &'a [u8] },
    Ack { seqn: u32 },
    Fin,
}

impl Debug for Segment<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Segment::Data { seqn, payload } => write!(f, "DATA{{@{}:{}}}", seqn, payload.len()),
            Segment::Fec { seqn, payload } => write!(f, "FEC{{@{}:{}}}", seqn, payload.len()),
            Segment::Ack { seqn: SYN_SEQ } => write!(f, "ACK{{SYN}}"),
            Segment::Ack { seqn: FIN_SEQ } => write!(f, "ACK{{FIN}}"),
            Segment::Ack { seqn } => write!(f, "ACK{{{}}}", seqn),
            Segment::Fin => write!(f, "FIN"),
        }
    }
}

impl <'a> Segment<'a> {
    /// Decodes a complete datagram. The header's `size` must match the number of payload bytes
    ///  actually received; DATA and FEC segments must carry a payload, ACK and FIN must not.
    pub fn decode(datagram: &'a [u8]) -> anyhow::Result<Segment<'a>> {
        let mut buf = datagram;
        let header = SegmentHeader::deser(&mut buf)?;
        let payload = buf;

        if payload.len() != header.size as usize {
            bail!("{:?} segment announces {} payload bytes but carries {}", header.kind, header.size, payload.len());
        }

        let segment = match header.kind {
            SegmentKind::Data | SegmentKind::Fec if payload.is_empty() => {
                bail!("{:?} segment without payload", header.kind);
            }
            SegmentKind::Data => Segment::Data { seqn: header.seqn, payload },
            SegmentKind::Fec => Segment::Fec { seqn: header.seqn, payload },
            SegmentKind::Ack | SegmentKind::Fin if !payload.is_empty() => {
                bail!("{:?} segment with payload", header.kind);
            }
            SegmentKind::Ack => Segment::Ack { seqn: header.seqn },
            SegmentKind::Fin => Segment::Fin,
        };
        Ok(segment)
    }

    pub fn kind(&self) -> SegmentKind {
        match self {
            Segment::Data { .. } => SegmentKind::Data,
            Segment::Fec { .. } => SegmentKind::Fec,
            Segment::Ack { .. } => SegmentKind::Ack,
            Segment::Fin => SegmentKind::Fin,
        }
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        match self {
            Segment::Data { seqn, payload } | Segment::Fec { seqn, payload } => {
                // payloads are bounded by the maximum segment size
                SegmentHeader::new(self.kind(), payload.len().wire_len(), *seqn).ser(buf);
                buf.put_slice(payload);
            }
            Segment::Ack { seqn } => SegmentHeader::new(SegmentKind::Ack, 0, *seqn).ser(buf),
            Segment::Fin => SegmentHeader::new(SegmentKind::Fin, 0, FIN_SEQ).ser(buf),
        }
    }
}
