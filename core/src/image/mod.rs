//! Backing image access: raw POSIX I/O, memory mapping, track caching
//!
//! Every attached block device owns exactly one [`ImageHandle`]; the
//! variants differ only in how bytes reach the file. Faults are surfaced
//! as [`MediumError`] so the logical unit can turn them into sense data
//! without knowing the access mode.

pub mod cache;
pub mod mapped;
pub mod posix;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use cache::TrackCache;
use mapped::MappedImage;
use posix::PosixImage;

/// CD raw frame: 16-byte header, 2048 bytes of user data, 288-byte
/// EDC/ECC trailer
pub const CDRAW_FRAME_SIZE: u64 = 2352;
pub const CDRAW_HEADER_SIZE: u64 = 16;
pub const CDRAW_DATA_SIZE: u64 = 2048;

/// Default data span of one cache track
const TRACK_DATA_BYTES: u64 = 64 * 1024;

/// T98Next hard disk images carry a 512-byte preamble
const NHD_SIGNATURE: &[u8] = b"T98HDDIMAGE.R0";
const NHD_PREAMBLE: u64 = 512;

/// Faults surfaced to the initiator as MEDIUM ERROR sense data
#[derive(Debug, thiserror::Error)]
pub enum MediumError {
    #[error("unrecovered read error at block {0}")]
    UnrecoveredRead(u64),
    #[error("write fault at block {0}")]
    WriteFault(u64),
    #[error("block {0} out of range")]
    OutOfRange(u64),
    #[error("medium is write-protected")]
    WriteProtected,
}

pub type MediumResult<T> = std::result::Result<T, MediumError>;

/// Fixed layout parameters of one image
#[derive(Debug, Clone, Copy)]
pub struct Geometry {
    /// log2 of the sector size (8..=12 for 256..4096)
    pub sector_size_log2: u32,
    /// Total addressable blocks
    pub blocks: u64,
    /// Sectors per cache track
    pub blocks_per_track: u32,
    /// Bytes before the first sector (preamble formats)
    pub image_offset: u64,
    /// Image carries 2352-byte raw CD frames
    pub cd_raw: bool,
}

impl Geometry {
    pub const fn sector_size(&self) -> usize {
        1 << self.sector_size_log2
    }

    pub const fn track_of(&self, block: u64) -> u64 {
        block / self.blocks_per_track as u64
    }

    /// File offset of a sector's data
    pub const fn byte_offset(&self, block: u64) -> u64 {
        if self.cd_raw {
            self.image_offset + block * CDRAW_FRAME_SIZE + CDRAW_HEADER_SIZE
        } else {
            self.image_offset + (block << self.sector_size_log2)
        }
    }

    pub const fn contains(&self, block: u64) -> bool {
        block < self.blocks
    }
}

/// How the backing file is accessed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum AccessMode {
    /// One syscall per sector
    #[default]
    Raw,
    /// memcpy against a shared mapping
    Mapped,
    /// Track-granular write-back cache over raw I/O
    Cached,
}

/// Sector-granular access to one backing image
pub trait ImageHandle: Send {
    fn geometry(&self) -> Geometry;
    fn path(&self) -> &Path;

    /// The file cannot be written (permissions or raw CD frames).
    fn read_only(&self) -> bool {
        false
    }

    fn read_sector(&mut self, block: u64, buf: &mut [u8]) -> MediumResult<()>;
    fn write_sector(&mut self, block: u64, buf: &[u8]) -> MediumResult<()>;

    /// Push every pending write to the backing file.
    fn flush(&mut self) -> MediumResult<()>;
}

/// Open `path` with the requested access mode. Mapped access silently
/// degrades to raw when the file cannot be mapped writable.
pub fn open_image(path: &Path, geometry: Geometry, mode: AccessMode) -> Result<Box<dyn ImageHandle>> {
    log::info!(
        "Opening image {} ({} blocks of {}, {})",
        path.display(),
        geometry.blocks,
        geometry.sector_size(),
        mode
    );

    Ok(match mode {
        AccessMode::Raw => Box::new(PosixImage::open(path, geometry)?),
        AccessMode::Mapped => match MappedImage::open(path, geometry) {
            Ok(img) => Box::new(img),
            Err(e) => {
                log::warn!("Cannot map {} ({e:#}), falling back to raw", path.display());
                Box::new(PosixImage::open(path, geometry)?)
            }
        },
        AccessMode::Cached => Box::new(TrackCache::new(PosixImage::open(path, geometry)?)),
    })
}

/// Attach-time overrides from the `.properties` sidecar
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageProperties {
    pub vendor: Option<String>,
    pub product: Option<String>,
    pub revision: Option<String>,
    pub block_size: Option<usize>,
}

impl ImageProperties {
    /// Load `<image>.properties` next to the image, if present.
    pub fn load_for(image: &Path) -> Result<Self> {
        let mut sidecar = image.as_os_str().to_owned();
        sidecar.push(".properties");
        let sidecar = PathBuf::from(sidecar);

        if !sidecar.exists() {
            return Ok(Self::default());
        }
        let data = fs::read(&sidecar)
            .with_context(|| format!("Failed to read {}", sidecar.display()))?;
        serde_json::from_slice(&data)
            .with_context(|| format!("Malformed properties file {}", sidecar.display()))
    }
}

/// Device class suggested by an image file extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaHint {
    HardDisk,
    Mo,
    Cd,
}

pub fn media_hint(path: &Path) -> Option<MediaHint> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "hds" | "hdf" | "hdi" | "hdn" | "nhd" | "hda" => Some(MediaHint::HardDisk),
        "mos" => Some(MediaHint::Mo),
        "iso" => Some(MediaHint::Cd),
        _ => None,
    }
}

/// Derive the image geometry from the file itself: preamble detection,
/// raw-CD heuristics and the block size (possibly overridden by the
/// sidecar or the attach request).
pub fn probe_geometry(path: &Path, block_size: usize) -> Result<Geometry> {
    if !block_size.is_power_of_two() || !(256..=4096).contains(&block_size) {
        bail!("Unsupported block size {block_size}");
    }

    let meta = fs::metadata(path)
        .with_context(|| format!("Cannot stat image {}", path.display()))?;
    let size = meta.len();

    let mut image_offset = 0u64;
    let mut cd_raw = false;
    let mut sector_size_log2 = block_size.trailing_zeros();

    if media_hint(path) == Some(MediaHint::Cd) {
        // Raw images are frame-aligned but not data-aligned
        if size % CDRAW_FRAME_SIZE == 0 && size % CDRAW_DATA_SIZE != 0 {
            cd_raw = true;
            sector_size_log2 = CDRAW_DATA_SIZE.trailing_zeros();
        }
    } else {
        use std::io::Read;

        let mut head = [0u8; NHD_SIGNATURE.len()];
        let mut f = fs::File::open(path)
            .with_context(|| format!("Cannot open image {}", path.display()))?;
        if f.read(&mut head).unwrap_or(0) == head.len() && &head[..] == NHD_SIGNATURE {
            image_offset = NHD_PREAMBLE;
        }
    }

    let payload = size.saturating_sub(image_offset);
    let blocks = if cd_raw {
        payload / CDRAW_FRAME_SIZE
    } else {
        payload >> sector_size_log2
    };
    if blocks == 0 {
        bail!("Image {} holds no complete sector", path.display());
    }

    let blocks_per_track = (TRACK_DATA_BYTES >> sector_size_log2).max(1) as u32;

    Ok(Geometry {
        sector_size_log2,
        blocks,
        blocks_per_track,
        image_offset,
        cd_raw,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn geometry_offsets() {
        let g = Geometry {
            sector_size_log2: 9,
            blocks: 100,
            blocks_per_track: 128,
            image_offset: 0,
            cd_raw: false,
        };
        assert_eq!(g.sector_size(), 512);
        assert_eq!(g.byte_offset(0), 0);
        assert_eq!(g.byte_offset(3), 1536);
        assert_eq!(g.track_of(127), 0);
        assert_eq!(g.track_of(128), 1);
    }

    #[test]
    fn geometry_cdraw_offsets() {
        let g = Geometry {
            sector_size_log2: 11,
            blocks: 16,
            blocks_per_track: 32,
            image_offset: 0,
            cd_raw: true,
        };
        assert_eq!(g.byte_offset(0), 16);
        assert_eq!(g.byte_offset(1), 2352 + 16);
    }

    #[test]
    fn probe_plain_hd_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.hds");
        fs::write(&path, vec![0u8; 512 * 16]).unwrap();

        let g = probe_geometry(&path, 512).unwrap();
        assert_eq!(g.blocks, 16);
        assert_eq!(g.sector_size(), 512);
        assert!(!g.cd_raw);
        assert_eq!(g.image_offset, 0);
    }

    #[test]
    fn probe_nhd_preamble() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.nhd");
        let mut f = fs::File::create(&path).unwrap();
        let mut preamble = vec![0u8; 512];
        preamble[..NHD_SIGNATURE.len()].copy_from_slice(NHD_SIGNATURE);
        f.write_all(&preamble).unwrap();
        f.write_all(&vec![0u8; 512 * 8]).unwrap();
        drop(f);

        let g = probe_geometry(&path, 512).unwrap();
        assert_eq!(g.image_offset, 512);
        assert_eq!(g.blocks, 8);
    }

    #[test]
    fn probe_raw_cd_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.iso");
        fs::write(&path, vec![0u8; 2352 * 4]).unwrap();

        let g = probe_geometry(&path, 2048).unwrap();
        assert!(g.cd_raw);
        assert_eq!(g.blocks, 4);
        assert_eq!(g.sector_size(), 2048);
    }

    #[test]
    fn probe_rejects_odd_block_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.hds");
        fs::write(&path, vec![0u8; 4096]).unwrap();
        assert!(probe_geometry(&path, 500).is_err());
        assert!(probe_geometry(&path, 8192).is_err());
    }

    #[test]
    fn media_hints() {
        assert_eq!(media_hint(Path::new("a.hds")), Some(MediaHint::HardDisk));
        assert_eq!(media_hint(Path::new("a.MOS")), Some(MediaHint::Mo));
        assert_eq!(media_hint(Path::new("a.iso")), Some(MediaHint::Cd));
        assert_eq!(media_hint(Path::new("a.img")), None);
    }
}
