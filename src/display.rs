use std::path::Path;
use bytes::BytesMut;
use tracing::info;
use crate::control_messages::ImageGeometry;
use crate::tga;

/// Receives the image buffer after every processed datagram. Implementations must return
///  quickly, the receiver does not process datagrams while they run.
pub trait ImageDisplay {
    /// `received` is the number of contiguously received bytes from the start of the image
    fn on_update(&mut self, image: &[u8], geometry: &ImageGeometry, received: usize);
}

pub struct NullDisplay;

impl ImageDisplay for NullDisplay {
    fn on_update(&mut self, _image: &[u8], _geometry: &ImageGeometry, _received: usize) {
    }
}

/// Logs progress in steps of ten percent
#[derive(Default)]
pub struct ProgressDisplay {
    last_reported: Option<usize>,
}

impl ProgressDisplay {
    pub fn new() -> ProgressDisplay {
        Default::default()
    }
}

impl ImageDisplay for ProgressDisplay {
    fn on_update(&mut self, image: &[u8], _geometry: &ImageGeometry, received: usize) {
        let percent = if image.is_empty() { 100 } else { received * 100 / image.len() };
        let step = percent / 10;
        if self.last_reported.map_or(true, |last| step > last) {
            info!("received {}% ({} of {} bytes)", step * 10, received, image.len());
            self.last_reported = Some(step);
        }
    }
}

/// Stores a received image as an uncompressed TGA file
pub fn save_tga(path: &Path, geometry: &ImageGeometry, pixels: &[u8]) -> anyhow::Result<()> {
    let mut buf = BytesMut::with_capacity(pixels.len() + 18);
    tga::encode(geometry, pixels, &mut buf);
    std::fs::write(path, &buf)?;
    info!("wrote {:?}", path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_messages::ImageFormat;

    #[test]
    fn test_progress_steps() {
        let geometry = ImageGeometry { depth: 1, format: ImageFormat::GrayScale, width: 100, height: 1 };
        let image = vec![0u8; 100];
        let mut display = ProgressDisplay::new();

        display.on_update(&image, &geometry, 0);
        assert_eq!(display.last_reported, Some(0));
        display.on_update(&image, &geometry, 9);
        assert_eq!(display.last_reported, Some(0));
        display.on_update(&image, &geometry, 35);
        assert_eq!(display.last_reported, Some(3));
        display.on_update(&image, &geometry, 100);
        assert_eq!(display.last_reported, Some(10));
    }

    #[test]
    fn test_save_tga() {
        let path = std::env::temp_dir().join(format!("netimg-display-{}.tga", std::process::id()));
        let geometry = ImageGeometry { depth: 2, format: ImageFormat::GrayScaleAlpha, width: 1, height: 2 };

        save_tga(&path, &geometry, &[1, 2, 3, 4]).unwrap();
        let (decoded_geometry, pixels) = tga::decode(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(decoded_geometry, geometry);
        assert_eq!(pixels.as_ref(), &[1, 2, 3, 4]);

        std::fs::remove_file(&path).ok();
    }
}
