//! Raw POSIX file access: one positioned syscall per sector

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs2::FileExt as _;

use super::{Geometry, ImageHandle, MediumError, MediumResult};

pub struct PosixImage {
    file: File,
    path: PathBuf,
    geometry: Geometry,
    writable: bool,
}

impl PosixImage {
    /// Open the image, preferring read-write. A file we may not write
    /// becomes a write-protected medium rather than an error.
    pub fn open(path: &Path, geometry: Geometry) -> Result<Self> {
        let (file, writable) = match OpenOptions::new().read(true).write(true).open(path) {
            Ok(f) => (f, true),
            Err(_) => (
                File::open(path)
                    .with_context(|| format!("Failed to open image {}", path.display()))?,
                false,
            ),
        };

        file.try_lock_exclusive()
            .with_context(|| format!("Image {} is in use", path.display()))?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
            geometry,
            writable,
        })
    }

    pub const fn writable(&self) -> bool {
        self.writable
    }

    /// Byte-span read for the track cache.
    pub(super) fn read_span(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
        self.file.read_exact_at(buf, offset)
    }

    /// Byte-span write for the track cache.
    pub(super) fn write_span(&self, offset: u64, buf: &[u8]) -> std::io::Result<()> {
        self.file.write_all_at(buf, offset)
    }
}

impl ImageHandle for PosixImage {
    fn geometry(&self) -> Geometry {
        self.geometry
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn read_only(&self) -> bool {
        !self.writable || self.geometry.cd_raw
    }

    fn read_sector(&mut self, block: u64, buf: &mut [u8]) -> MediumResult<()> {
        if !self.geometry.contains(block) {
            return Err(MediumError::OutOfRange(block));
        }
        debug_assert_eq!(buf.len(), self.geometry.sector_size());

        self.file
            .read_exact_at(buf, self.geometry.byte_offset(block))
            .map_err(|e| {
                log::error!("Sector read {} failed: {}", block, e);
                MediumError::UnrecoveredRead(block)
            })
    }

    fn write_sector(&mut self, block: u64, buf: &[u8]) -> MediumResult<()> {
        if !self.geometry.contains(block) {
            return Err(MediumError::OutOfRange(block));
        }
        if !self.writable || self.geometry.cd_raw {
            return Err(MediumError::WriteProtected);
        }
        debug_assert_eq!(buf.len(), self.geometry.sector_size());

        self.file
            .write_all_at(buf, self.geometry.byte_offset(block))
            .map_err(|e| {
                log::error!("Sector write {} failed: {}", block, e);
                MediumError::WriteFault(block)
            })
    }

    fn flush(&mut self) -> MediumResult<()> {
        if !self.writable {
            return Ok(());
        }
        self.file.sync_data().map_err(|e| {
            log::error!("Image sync failed: {}", e);
            MediumError::WriteFault(0)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn geometry(blocks: u64) -> Geometry {
        Geometry {
            sector_size_log2: 9,
            blocks,
            blocks_per_track: 8,
            image_offset: 0,
            cd_raw: false,
        }
    }

    #[test]
    fn read_write_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img.hds");
        fs::write(&path, vec![0u8; 512 * 4]).unwrap();

        let mut img = PosixImage::open(&path, geometry(4)).unwrap();
        let data = [0xA5u8; 512];
        img.write_sector(2, &data).unwrap();

        let mut back = [0u8; 512];
        img.read_sector(2, &mut back).unwrap();
        assert_eq!(back, data);

        // Untouched sector stays zero
        img.read_sector(1, &mut back).unwrap();
        assert_eq!(back, [0u8; 512]);
    }

    #[test]
    fn out_of_range_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img.hds");
        fs::write(&path, vec![0u8; 512 * 4]).unwrap();

        let mut img = PosixImage::open(&path, geometry(4)).unwrap();
        let mut buf = [0u8; 512];
        assert!(matches!(
            img.read_sector(4, &mut buf),
            Err(MediumError::OutOfRange(4))
        ));
    }

    #[test]
    fn image_offset_respected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img.hds");
        let mut contents = vec![0u8; 512 * 3 + 512];
        contents[512..1024].iter_mut().for_each(|b| *b = 0x42);
        fs::write(&path, &contents).unwrap();

        let g = Geometry {
            image_offset: 512,
            blocks: 3,
            ..geometry(3)
        };
        let mut img = PosixImage::open(&path, g).unwrap();
        let mut buf = [0u8; 512];
        img.read_sector(0, &mut buf).unwrap();
        assert_eq!(buf, [0x42u8; 512]);
    }
}
