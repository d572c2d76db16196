//! Reading and writing TGA files: true color and gray scale, uncompressed or run-length encoded,
//!  no color maps. Pixels are kept in the file's byte order and orientation.

use anyhow::{anyhow, bail};
use bytes::{BufMut, Bytes};
use crate::control_messages::{ImageFormat, ImageGeometry};

const HEADER_LEN: usize = 18;

const TYPE_TRUE_COLOR: u8 = 2;
const TYPE_GRAY_SCALE: u8 = 3;
const TYPE_RLE_TRUE_COLOR: u8 = 10;
const TYPE_RLE_GRAY_SCALE: u8 = 11;

pub fn decode(raw: &[u8]) -> anyhow::Result<(ImageGeometry, Bytes)> {
    if raw.len() < HEADER_LEN {
        bail!("TGA file too short: {} bytes", raw.len());
    }

    let id_len = raw[0] as usize;
    let color_map_type = raw[1];
    let image_type = raw[2];
    let width = u16::from_le_bytes([raw[12], raw[13]]);
    let height = u16::from_le_bytes([raw[14], raw[15]]);
    let bits_per_pixel = raw[16];
    let alpha_bits = raw[17] & 0x0f;

    if color_map_type != 0 {
        bail!("TGA files with color maps are not supported");
    }
    if !matches!(bits_per_pixel, 8 | 16 | 24 | 32) {
        bail!("unsupported pixel depth of {} bits", bits_per_pixel);
    }

    let format = match (image_type, alpha_bits > 0) {
        (TYPE_TRUE_COLOR | TYPE_RLE_TRUE_COLOR, false) => ImageFormat::Rgb,
        (TYPE_TRUE_COLOR | TYPE_RLE_TRUE_COLOR, true) => ImageFormat::Rgba,
        (TYPE_GRAY_SCALE | TYPE_RLE_GRAY_SCALE, false) => ImageFormat::GrayScale,
        (TYPE_GRAY_SCALE | TYPE_RLE_GRAY_SCALE, true) => ImageFormat::GrayScaleAlpha,
        _ => bail!("unsupported TGA image type {}", image_type),
    };

    let geometry = ImageGeometry {
        depth: bits_per_pixel / 8,
        format,
        width,
        height,
    };

    let data = raw.get(HEADER_LEN + id_len..)
        .ok_or_else(|| anyhow!("TGA image id exceeds the file"))?;
    let img_size = geometry.img_size() as usize;

    let pixels = if image_type == TYPE_RLE_TRUE_COLOR || image_type == TYPE_RLE_GRAY_SCALE {
        decode_rle(data, geometry.depth as usize, img_size)?
    }
    else {
        data.get(..img_size)
            .ok_or_else(|| anyhow!("TGA pixel data truncated: {} of {} bytes", data.len(), img_size))?
            .to_vec()
    };

    Ok((geometry, Bytes::from(pixels)))
}

fn decode_rle(mut data: &[u8], depth: usize, img_size: usize) -> anyhow::Result<Vec<u8>> {
    let mut pixels = Vec::with_capacity(img_size);

    while pixels.len() < img_size {
        let (&packet_header, rest) = data.split_first()
            .ok_or_else(|| anyhow!("RLE pixel data truncated"))?;
        let count = (packet_header & 0x7f) as usize + 1;

        let packet_len = if packet_header & 0x80 != 0 { depth } else { count * depth };
        if rest.len() < packet_len {
            bail!("RLE pixel data truncated");
        }
        let (packet, rest) = rest.split_at(packet_len);

        if packet_header & 0x80 != 0 {
            for _ in 0..count {
                pixels.extend_from_slice(packet);
            }
        }
        else {
            pixels.extend_from_slice(packet);
        }
        data = rest;
    }

    // a run may extend beyond the last pixel
    pixels.truncate(img_size);
    Ok(pixels)
}

/// Writes an uncompressed TGA file
pub fn encode(geometry: &ImageGeometry, pixels: &[u8], buf: &mut impl BufMut) {
    let (image_type, alpha_bits) = match geometry.format {
        ImageFormat::Rgb => (TYPE_TRUE_COLOR, 0),
        ImageFormat::Rgba => (TYPE_TRUE_COLOR, 8),
        ImageFormat::GrayScale => (TYPE_GRAY_SCALE, 0),
        ImageFormat::GrayScaleAlpha => (TYPE_GRAY_SCALE, 8),
    };

    buf.put_u8(0);              // id length
    buf.put_u8(0);              // no color map
    buf.put_u8(image_type);
    buf.put_bytes(0, 5);        // color map specification
    buf.put_u16_le(0);          // x origin
    buf.put_u16_le(0);          // y origin
    buf.put_u16_le(geometry.width);
    buf.put_u16_le(geometry.height);
    buf.put_u8(geometry.depth * 8);
    buf.put_u8(alpha_bits);
    buf.put_slice(pixels);
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use rstest::rstest;

    fn header(image_type: u8, width: u16, height: u16, bits: u8, descriptor: u8, id_len: u8) -> Vec<u8> {
        let mut result = vec![id_len, 0, image_type, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        result.extend_from_slice(&width.to_le_bytes());
        result.extend_from_slice(&height.to_le_bytes());
        result.push(bits);
        result.push(descriptor);
        result
    }

    #[rstest]
    #[case::rgb(2, 24, 0, ImageFormat::Rgb, 3)]
    #[case::rgba(2, 32, 8, ImageFormat::Rgba, 4)]
    #[case::gray(3, 8, 0, ImageFormat::GrayScale, 1)]
    #[case::gray_alpha(3, 16, 8, ImageFormat::GrayScaleAlpha, 2)]
    fn test_decode_uncompressed(#[case] image_type: u8, #[case] bits: u8, #[case] descriptor: u8, #[case] format: ImageFormat, #[case] depth: u8) {
        let mut raw = header(image_type, 3, 2, bits, descriptor, 2);
        raw.extend_from_slice(b"id");
        let pixels: Vec<u8> = (0..6 * depth).collect();
        raw.extend_from_slice(&pixels);
        raw.extend_from_slice(b"footer");

        let (geometry, decoded) = decode(&raw).unwrap();
        assert_eq!(geometry, ImageGeometry { depth, format, width: 3, height: 2 });
        assert_eq!(decoded.as_ref(), pixels.as_slice());
    }

    #[test]
    fn test_decode_rle() {
        let mut raw = header(10, 5, 1, 24, 0, 0);
        // run of 3 pixels, then 2 raw pixels
        raw.extend_from_slice(&[0x82, 1, 2, 3]);
        raw.extend_from_slice(&[0x01, 4, 5, 6, 7, 8, 9]);

        let (geometry, decoded) = decode(&raw).unwrap();
        assert_eq!(geometry.img_size(), 15);
        assert_eq!(decoded.as_ref(), &[1, 2, 3, 1, 2, 3, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
    }

    #[rstest]
    #[case::too_short(vec![0; 17])]
    #[case::color_map({ let mut h = header(2, 1, 1, 24, 0, 0); h[1] = 1; h.extend_from_slice(&[0; 3]); h })]
    #[case::color_mapped_type({ let mut h = header(1, 1, 1, 8, 0, 0); h.push(0); h })]
    #[case::odd_depth({ let mut h = header(2, 1, 1, 15, 0, 0); h.extend_from_slice(&[0; 2]); h })]
    #[case::truncated_pixels({ let mut h = header(2, 2, 2, 24, 0, 0); h.extend_from_slice(&[0; 11]); h })]
    #[case::truncated_rle({ let mut h = header(10, 2, 1, 24, 0, 0); h.extend_from_slice(&[0x81, 1, 2]); h })]
    #[case::id_beyond_end(header(2, 0, 0, 24, 0, 5))]
    fn test_decode_invalid(#[case] raw: Vec<u8>) {
        assert!(decode(&raw).is_err());
    }

    #[test]
    fn test_encode_is_readable() {
        let geometry = ImageGeometry { depth: 4, format: ImageFormat::Rgba, width: 2, height: 2 };
        let pixels: Vec<u8> = (0..16).collect();

        let mut buf = BytesMut::new();
        encode(&geometry, &pixels, &mut buf);
        assert_eq!(buf.len(), HEADER_LEN + 16);
        assert_eq!(&buf[..HEADER_LEN], header(2, 2, 2, 32, 8, 0).as_slice());

        let (decoded_geometry, decoded) = decode(&buf).unwrap();
        assert_eq!(decoded_geometry, geometry);
        assert_eq!(decoded.as_ref(), pixels.as_slice());
    }
}
