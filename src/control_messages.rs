//! The messages exchanged during the handshake: the client's query for an image, and the server's
//!  image message describing the image (or why it can not be served).

use anyhow::bail;
use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tracing::debug;
use crate::config::SessionParams;
use crate::packet_header::{SegmentKind, PROTOCOL_VERSION};

/// Message type of a query
pub const SYN_QUERY: u8 = 0x10;
pub const FOUND: u8 = 0x02;
pub const NOT_FOUND: u8 = 0x04;

/// Fixed length of the (NUL terminated) image name field in a query
pub const MAX_NAME_LEN: usize = 256;

/// The sub-codes of an ERROR image message. They share the message type byte with
///  [FOUND] and [NOT_FOUND].
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ErrorCode {
    Generic = 0x08,
    WrongSize = 0x09,
    WrongVersion = 0x0a,
    WrongType = 0x0b,
    BadName = 0x0c,
    Busy = 0x0d,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ImageFormat {
    GrayScale = 1,
    GrayScaleAlpha = 2,
    Rgb = 3,
    Rgba = 4,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ImageGeometry {
    /// bytes per pixel
    pub depth: u8,
    pub format: ImageFormat,
    pub width: u16,
    pub height: u16,
}

impl ImageGeometry {
    /// The number of bytes in the image's pixel buffer
    pub fn img_size(&self) -> u64 {
        self.width as u64 * self.height as u64 * self.depth as u64
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct QueryMessage {
    pub mss: u16,
    pub rwnd: u8,
    pub fwnd: u8,
    pub name: String,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum QueryDecision {
    Serve(QueryMessage),
    /// ACKs are left over from an earlier session and get no reply
    Ignore,
    Reject(ErrorCode),
}

impl QueryMessage {
    pub const SERIALIZED_LEN: usize =
        size_of::<u8>()         // version
        + size_of::<u8>()       // type
        + size_of::<u16>()      // mss
        + size_of::<u8>()       // rwnd
        + size_of::<u8>()       // fwnd
        + MAX_NAME_LEN;         // name

    pub fn new(name: &str, params: &SessionParams) -> anyhow::Result<QueryMessage> {
        if name.is_empty() || name.len() >= MAX_NAME_LEN || name.contains('\0') {
            bail!("image name must have between 1 and {} bytes and no NUL characters", MAX_NAME_LEN - 1);
        }

        Ok(QueryMessage {
            mss: params.mss,
            rwnd: params.rwnd,
            fwnd: params.fwnd,
            name: name.to_string(),
        })
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(SYN_QUERY);
        buf.put_u16(self.mss);
        buf.put_u8(self.rwnd);
        buf.put_u8(self.fwnd);

        let name = &self.name.as_bytes()[..self.name.len().min(MAX_NAME_LEN - 1)];
        buf.put_slice(name);
        buf.put_bytes(0, MAX_NAME_LEN - name.len());
    }

    /// Classifies a datagram that arrived at the server's query port
    pub fn decide(datagram: &[u8]) -> QueryDecision {
        if datagram.len() >= 2 && datagram[1] == u8::from(SegmentKind::Ack) {
            return QueryDecision::Ignore;
        }
        if datagram.len() != Self::SERIALIZED_LEN {
            return QueryDecision::Reject(ErrorCode::WrongSize);
        }

        let mut buf = datagram;
        if buf.get_u8() != PROTOCOL_VERSION {
            return QueryDecision::Reject(ErrorCode::WrongVersion);
        }
        if buf.get_u8() != SYN_QUERY {
            return QueryDecision::Reject(ErrorCode::WrongType);
        }
        let mss = buf.get_u16();
        let rwnd = buf.get_u8();
        let fwnd = buf.get_u8();

        let name = match Self::parse_name(buf) {
            Some(name) => name,
            None => return QueryDecision::Reject(ErrorCode::BadName),
        };

        if let Err(e) = SessionParams::new(mss, rwnd, fwnd) {
            debug!("rejecting query for {}: {}", name, e);
            return QueryDecision::Reject(ErrorCode::Generic);
        }

        QueryDecision::Serve(QueryMessage { mss, rwnd, fwnd, name })
    }

    /// The name must be NUL terminated inside its field, and must not address anything outside
    ///  the image directory
    fn parse_name(raw: &[u8]) -> Option<String> {
        let len = raw.iter().position(|&b| b == 0)?;
        let name = std::str::from_utf8(&raw[..len]).ok()?;
        if name.is_empty() || name.contains('/') || name.contains('\\') || name.starts_with('.') {
            return None;
        }
        Some(name.to_string())
    }

    pub fn session_params(&self) -> anyhow::Result<SessionParams> {
        SessionParams::new(self.mss, self.rwnd, self.fwnd)
    }
}

/// The server's answer to a query, the 'image message'
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MetadataReply {
    Found(ImageGeometry),
    NotFound,
    Error(ErrorCode),
}

impl MetadataReply {
    pub const SERIALIZED_LEN: usize =
        size_of::<u8>()         // version
        + size_of::<u8>()       // type
        + size_of::<u8>()       // depth
        + size_of::<u8>()       // format
        + size_of::<u16>()      // width
        + size_of::<u16>();     // height

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(PROTOCOL_VERSION);
        match self {
            MetadataReply::Found(geometry) => {
                buf.put_u8(FOUND);
                buf.put_u8(geometry.depth);
                buf.put_u8(geometry.format.into());
                buf.put_u16(geometry.width);
                buf.put_u16(geometry.height);
            }
            MetadataReply::NotFound => {
                buf.put_u8(NOT_FOUND);
                buf.put_bytes(0, 6);
            }
            MetadataReply::Error(code) => {
                buf.put_u8((*code).into());
                buf.put_bytes(0, 6);
            }
        }
    }

    pub fn deser(datagram: &[u8]) -> anyhow::Result<MetadataReply> {
        if datagram.len() != Self::SERIALIZED_LEN {
            bail!("image message has wrong size {}", datagram.len());
        }

        let mut buf = datagram;
        let version = buf.get_u8();
        if version != PROTOCOL_VERSION {
            bail!("image message has unsupported version {:x}", version);
        }

        let reply = match buf.get_u8() {
            FOUND => {
                let depth = buf.get_u8();
                let format = ImageFormat::try_from(buf.get_u8())?;
                let width = buf.get_u16();
                let height = buf.get_u16();
                MetadataReply::Found(ImageGeometry { depth, format, width, height })
            }
            NOT_FOUND => MetadataReply::NotFound,
            other => MetadataReply::Error(ErrorCode::try_from(other)?),
        };
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use rstest::rstest;

    fn query_bytes(version: u8, tpe: u8, mss: u16, rwnd: u8, fwnd: u8, name: &[u8]) -> Vec<u8> {
        let mut result = vec![version, tpe];
        result.extend_from_slice(&mss.to_be_bytes());
        result.push(rwnd);
        result.push(fwnd);
        result.extend_from_slice(name);
        result.resize(QueryMessage::SERIALIZED_LEN, 0);
        result
    }

    #[test]
    fn test_query_ser() {
        let params = SessionParams::new(1036, 12, 4).unwrap();
        let query = QueryMessage::new("ShipatSea.tga", &params).unwrap();

        let mut buf = BytesMut::new();
        query.ser(&mut buf);
        assert_eq!(buf.len(), 262);
        assert_eq!(buf.as_ref(), query_bytes(0x11, 0x10, 1036, 12, 4, b"ShipatSea.tga").as_slice());

        assert_eq!(QueryMessage::decide(&buf), QueryDecision::Serve(query));
    }

    #[rstest]
    #[case::empty("")]
    #[case::too_long(&"x".repeat(256))]
    #[case::nul("a\0b")]
    fn test_query_new_invalid_name(#[case] name: &str) {
        let params = SessionParams::new(1036, 12, 4).unwrap();
        assert!(QueryMessage::new(name, &params).is_err());
    }

    #[rstest]
    #[case::ack(vec![0x11, 0x11, 0, 0, 0xff, 0xff, 0xff, 0xff], QueryDecision::Ignore)]
    #[case::ack_any_size(vec![0x11, 0x11], QueryDecision::Ignore)]
    #[case::too_short(vec![0x11, 0x10, 0, 0], QueryDecision::Reject(ErrorCode::WrongSize))]
    #[case::empty(vec![], QueryDecision::Reject(ErrorCode::WrongSize))]
    #[case::wrong_version(query_bytes(0x12, 0x10, 1036, 12, 4, b"a.tga"), QueryDecision::Reject(ErrorCode::WrongVersion))]
    #[case::wrong_type(query_bytes(0x11, 0x20, 1036, 12, 4, b"a.tga"), QueryDecision::Reject(ErrorCode::WrongType))]
    #[case::empty_name(query_bytes(0x11, 0x10, 1036, 12, 4, b""), QueryDecision::Reject(ErrorCode::BadName))]
    #[case::unterminated_name(query_bytes(0x11, 0x10, 1036, 12, 4, &[b'x'; 256]), QueryDecision::Reject(ErrorCode::BadName))]
    #[case::path(query_bytes(0x11, 0x10, 1036, 12, 4, b"../secret.tga"), QueryDecision::Reject(ErrorCode::BadName))]
    #[case::sub_dir(query_bytes(0x11, 0x10, 1036, 12, 4, b"dir/a.tga"), QueryDecision::Reject(ErrorCode::BadName))]
    #[case::mss_too_small(query_bytes(0x11, 0x10, 39, 12, 4, b"a.tga"), QueryDecision::Reject(ErrorCode::Generic))]
    #[case::fwnd_not_below_rwnd(query_bytes(0x11, 0x10, 1036, 4, 4, b"a.tga"), QueryDecision::Reject(ErrorCode::Generic))]
    fn test_query_decide_invalid(#[case] raw: Vec<u8>, #[case] expected: QueryDecision) {
        assert_eq!(QueryMessage::decide(&raw), expected);
    }

    #[rstest]
    #[case::found(
        MetadataReply::Found(ImageGeometry { depth: 3, format: ImageFormat::Rgb, width: 640, height: 0x1e0 }),
        vec![0x11, 0x02, 3, 3, 0x02, 0x80, 0x01, 0xe0])]
    #[case::not_found(MetadataReply::NotFound, vec![0x11, 0x04, 0, 0, 0, 0, 0, 0])]
    #[case::busy(MetadataReply::Error(ErrorCode::Busy), vec![0x11, 0x0d, 0, 0, 0, 0, 0, 0])]
    #[case::wrong_size(MetadataReply::Error(ErrorCode::WrongSize), vec![0x11, 0x09, 0, 0, 0, 0, 0, 0])]
    fn test_metadata_ser(#[case] reply: MetadataReply, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        reply.ser(&mut buf);
        assert_eq!(buf.as_ref(), expected.as_slice());
        assert_eq!(MetadataReply::deser(&buf).unwrap(), reply);
    }

    #[rstest]
    #[case::too_short(vec![0x11, 0x02, 3, 3, 0x02, 0x80, 0x01])]
    #[case::wrong_version(vec![0x10, 0x02, 3, 3, 0x02, 0x80, 0x01, 0xe0])]
    #[case::unknown_format(vec![0x11, 0x02, 3, 7, 0x02, 0x80, 0x01, 0xe0])]
    #[case::unknown_type(vec![0x11, 0x20, 0, 0, 0, 0, 0, 0])]
    fn test_metadata_deser_invalid(#[case] raw: Vec<u8>) {
        assert!(MetadataReply::deser(&raw).is_err());
    }

    #[rstest]
    #[case(ImageGeometry { depth: 4, format: ImageFormat::Rgba, width: 640, height: 480 }, 1_228_800)]
    #[case(ImageGeometry { depth: 1, format: ImageFormat::GrayScale, width: 0, height: 480 }, 0)]
    #[case(ImageGeometry { depth: 4, format: ImageFormat::Rgba, width: u16::MAX, height: u16::MAX }, 17_179_344_900)]
    fn test_img_size(#[case] geometry: ImageGeometry, #[case] expected: u64) {
        assert_eq!(geometry.img_size(), expected);
    }
}
