//! Memory-mapped file access
//!
//! The image is mapped shared read-write; sector I/O is a memcpy and the
//! kernel writes dirty pages back at its own pace. `flush()` is an msync
//! so SYNCHRONIZE CACHE means what it says.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use fs2::FileExt;
use memmap2::MmapMut;

use super::{Geometry, ImageHandle, MediumError, MediumResult};

pub struct MappedImage {
    map: MmapMut,
    path: PathBuf,
    geometry: Geometry,
}

impl MappedImage {
    pub fn open(path: &Path, geometry: Geometry) -> Result<Self> {
        let f = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open image {}", path.display()))?;

        f.try_lock_exclusive()
            .with_context(|| format!("Image {} is in use", path.display()))?;

        let map = unsafe {
            MmapMut::map_mut(&f)
                .with_context(|| format!("Failed to map image {}", path.display()))?
        };

        let needed = geometry.byte_offset(geometry.blocks - 1) + geometry.sector_size() as u64;
        if (map.len() as u64) < needed {
            bail!(
                "Image {} shorter than its geometry ({} < {})",
                path.display(),
                map.len(),
                needed
            );
        }

        Ok(Self {
            map,
            path: path.to_path_buf(),
            geometry,
        })
    }
}

impl ImageHandle for MappedImage {
    fn geometry(&self) -> Geometry {
        self.geometry
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn read_only(&self) -> bool {
        self.geometry.cd_raw
    }

    fn read_sector(&mut self, block: u64, buf: &mut [u8]) -> MediumResult<()> {
        if !self.geometry.contains(block) {
            return Err(MediumError::OutOfRange(block));
        }
        let off = self.geometry.byte_offset(block) as usize;
        buf.copy_from_slice(&self.map[off..off + self.geometry.sector_size()]);
        Ok(())
    }

    fn write_sector(&mut self, block: u64, buf: &[u8]) -> MediumResult<()> {
        if !self.geometry.contains(block) {
            return Err(MediumError::OutOfRange(block));
        }
        if self.geometry.cd_raw {
            return Err(MediumError::WriteProtected);
        }
        let off = self.geometry.byte_offset(block) as usize;
        self.map[off..off + self.geometry.sector_size()].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&mut self) -> MediumResult<()> {
        self.map.flush().map_err(|e| {
            log::error!("msync failed: {}", e);
            MediumError::WriteFault(0)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn mapped_roundtrip_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img.hds");
        fs::write(&path, vec![0u8; 512 * 4]).unwrap();

        let g = Geometry {
            sector_size_log2: 9,
            blocks: 4,
            blocks_per_track: 8,
            image_offset: 0,
            cd_raw: false,
        };

        {
            let mut img = MappedImage::open(&path, g).unwrap();
            img.write_sector(3, &[0x5Au8; 512]).unwrap();
            img.flush().unwrap();
        }

        // The bytes must be visible to plain file I/O after msync
        let contents = fs::read(&path).unwrap();
        assert_eq!(&contents[512 * 3..], &[0x5Au8; 512][..]);
    }

    #[test]
    fn short_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img.hds");
        fs::write(&path, vec![0u8; 512]).unwrap();

        let g = Geometry {
            sector_size_log2: 9,
            blocks: 4,
            blocks_per_track: 8,
            image_offset: 0,
            cd_raw: false,
        };
        assert!(MappedImage::open(&path, g).is_err());
    }
}
