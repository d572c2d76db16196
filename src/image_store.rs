use std::io::ErrorKind;
use std::path::PathBuf;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tracing::debug;
use crate::control_messages::ImageGeometry;
use crate::tga;

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct StoredImage {
    pub geometry: ImageGeometry,
    pub pixels: Bytes,
}

/// The server's source of images. `Ok(None)` means there is no image by that name.
pub trait ImageStore: Send + Sync {
    fn load(&self, name: &str) -> anyhow::Result<Option<StoredImage>>;
}

#[derive(Default)]
pub struct InMemoryImageStore {
    images: FxHashMap<String, StoredImage>,
}

impl InMemoryImageStore {
    pub fn new() -> InMemoryImageStore {
        Default::default()
    }

    pub fn insert(&mut self, name: &str, geometry: ImageGeometry, pixels: impl Into<Bytes>) {
        self.images.insert(name.to_string(), StoredImage {
            geometry,
            pixels: pixels.into(),
        });
    }
}

impl ImageStore for InMemoryImageStore {
    fn load(&self, name: &str) -> anyhow::Result<Option<StoredImage>> {
        Ok(self.images.get(name).cloned())
    }
}

/// Serves the TGA files in a directory, reading them on every query
pub struct DirectoryImageStore {
    dir: PathBuf,
}

impl DirectoryImageStore {
    pub fn new(dir: impl Into<PathBuf>) -> DirectoryImageStore {
        DirectoryImageStore { dir: dir.into() }
    }
}

impl ImageStore for DirectoryImageStore {
    fn load(&self, name: &str) -> anyhow::Result<Option<StoredImage>> {
        let path = self.dir.join(name);
        let raw = match std::fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("no image file {:?}", path);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let (geometry, pixels) = tga::decode(&raw)?;
        debug!("loaded {:?}: {:?}", path, geometry);
        Ok(Some(StoredImage { geometry, pixels }))
    }
}
