//! Track-granular write-back cache over raw file access
//!
//! Sectors are cached in whole-track slots. A serial counter orders the
//! slots for LRU eviction; dirty slots are written back before their slot
//! is reused and on every explicit flush. At most one slot ever holds a
//! given track.

use std::path::Path;

use itertools::Itertools;

use super::posix::PosixImage;
use super::{Geometry, ImageHandle, MediumError, MediumResult};

pub const DEFAULT_SLOTS: usize = 16;

struct TrackSlot {
    track: u64,
    /// Sector data, `valid_sectors * sector_size` bytes
    buf: Vec<u8>,
    dirty: bool,
    serial: u64,
}

pub struct TrackCache {
    backing: PosixImage,
    slots: Vec<Option<TrackSlot>>,
    serial: u64,
}

impl TrackCache {
    pub fn new(backing: PosixImage) -> Self {
        Self::with_slots(backing, DEFAULT_SLOTS)
    }

    pub fn with_slots(backing: PosixImage, count: usize) -> Self {
        assert!(count > 0);
        Self {
            backing,
            slots: (0..count).map(|_| None).collect(),
            serial: 0,
        }
    }

    /// (track, dirty, serial) of a slot, for diagnostics and tests
    pub fn slot_info(&self, index: usize) -> Option<(u64, bool, u64)> {
        self.slots
            .get(index)?
            .as_ref()
            .map(|s| (s.track, s.dirty, s.serial))
    }

    fn bump(&mut self) -> u64 {
        self.serial += 1;
        self.serial
    }

    fn geometry(&self) -> Geometry {
        ImageHandle::geometry(&self.backing)
    }

    fn sectors_in_track(&self, track: u64) -> u64 {
        let g = self.geometry();
        let first = track * u64::from(g.blocks_per_track);
        (g.blocks - first).min(u64::from(g.blocks_per_track))
    }

    fn find_slot(&self, track: u64) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|s| s.track == track))
    }

    fn lru_index(&self, dirty: bool) -> Option<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|s| (i, s)))
            .filter(|(_, s)| s.dirty == dirty)
            .min_by_key(|(_, s)| s.serial)
            .map(|(i, _)| i)
    }

    /// A free slot, or the LRU victim. Dirty slots are only chosen when
    /// no clean slot exists, and the victim is flushed first.
    fn claim_slot(&mut self) -> MediumResult<usize> {
        if let Some(free) = self.slots.iter().position(Option::is_none) {
            return Ok(free);
        }

        if let Some(idx) = self.lru_index(false) {
            self.slots[idx] = None;
            return Ok(idx);
        }

        let idx = self.lru_index(true).expect("all slots occupied yet none found");
        self.flush_slot(idx)?;
        self.slots[idx] = None;
        Ok(idx)
    }

    /// Load an entire track into a slot and return the slot index.
    fn load_track(&mut self, track: u64) -> MediumResult<usize> {
        let idx = self.claim_slot()?;

        let g = self.geometry();
        let sector_size = g.sector_size();
        let sectors = self.sectors_in_track(track);
        let first_block = track * u64::from(g.blocks_per_track);
        let mut buf = vec![0u8; sectors as usize * sector_size];

        if g.cd_raw {
            // Raw frames are not contiguous user data; pull them one
            // sector at a time
            for s in 0..sectors {
                let off = g.byte_offset(first_block + s);
                let chunk = &mut buf[s as usize * sector_size..][..sector_size];
                self.backing.read_span(off, chunk).map_err(|e| {
                    log::error!("Track {} load failed: {}", track, e);
                    MediumError::UnrecoveredRead(first_block + s)
                })?;
            }
        } else {
            self.backing
                .read_span(g.byte_offset(first_block), &mut buf)
                .map_err(|e| {
                    log::error!("Track {} load failed: {}", track, e);
                    MediumError::UnrecoveredRead(first_block)
                })?;
        }

        let serial = self.bump();
        self.slots[idx] = Some(TrackSlot {
            track,
            buf,
            dirty: false,
            serial,
        });
        Ok(idx)
    }

    fn flush_slot(&mut self, idx: usize) -> MediumResult<()> {
        let g = self.geometry();
        let Some(slot) = self.slots[idx].as_mut() else {
            return Ok(());
        };
        if !slot.dirty {
            return Ok(());
        }

        let first_block = slot.track * u64::from(g.blocks_per_track);
        self.backing
            .write_span(g.byte_offset(first_block), &slot.buf)
            .map_err(|e| {
                log::error!("Track {} write-back failed: {}", slot.track, e);
                MediumError::WriteFault(first_block)
            })?;
        slot.dirty = false;
        Ok(())
    }

    fn slot_for(&mut self, block: u64) -> MediumResult<usize> {
        let track = self.geometry().track_of(block);
        match self.find_slot(track) {
            Some(idx) => Ok(idx),
            None => self.load_track(track),
        }
    }
}

impl ImageHandle for TrackCache {
    fn geometry(&self) -> Geometry {
        ImageHandle::geometry(&self.backing)
    }

    fn path(&self) -> &Path {
        self.backing.path()
    }

    fn read_only(&self) -> bool {
        self.backing.read_only()
    }

    fn read_sector(&mut self, block: u64, buf: &mut [u8]) -> MediumResult<()> {
        let g = self.geometry();
        if !g.contains(block) {
            return Err(MediumError::OutOfRange(block));
        }

        let idx = self.slot_for(block)?;
        let serial = self.bump();
        let slot = self.slots[idx].as_mut().expect("slot vanished");

        let within = (block - slot.track * u64::from(g.blocks_per_track)) as usize;
        buf.copy_from_slice(&slot.buf[within * g.sector_size()..][..g.sector_size()]);
        slot.serial = serial;
        Ok(())
    }

    fn write_sector(&mut self, block: u64, buf: &[u8]) -> MediumResult<()> {
        let g = self.geometry();
        if !g.contains(block) {
            return Err(MediumError::OutOfRange(block));
        }
        if g.cd_raw || !self.backing.writable() {
            return Err(MediumError::WriteProtected);
        }

        let idx = self.slot_for(block)?;
        let serial = self.bump();
        let slot = self.slots[idx].as_mut().expect("slot vanished");

        let within = (block - slot.track * u64::from(g.blocks_per_track)) as usize;
        slot.buf[within * g.sector_size()..][..g.sector_size()].copy_from_slice(buf);
        slot.dirty = true;
        slot.serial = serial;
        Ok(())
    }

    /// Write back every dirty slot in track order, then sync the file.
    fn flush(&mut self) -> MediumResult<()> {
        let dirty: Vec<usize> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().filter(|s| s.dirty).map(|s| (s.track, i)))
            .sorted_unstable()
            .map(|(_, i)| i)
            .collect();

        for idx in dirty {
            self.flush_slot(idx)?;
        }
        self.backing.flush()
    }
}

impl Drop for TrackCache {
    fn drop(&mut self) {
        if let Err(e) = ImageHandle::flush(self) {
            log::error!("Cache write-back on close failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;

    fn make_image(dir: &tempfile::TempDir, blocks: u64) -> (PathBuf, Geometry) {
        let path = dir.path().join("img.hds");
        fs::write(&path, vec![0u8; 512 * blocks as usize]).unwrap();
        let g = Geometry {
            sector_size_log2: 9,
            blocks,
            blocks_per_track: 4,
            image_offset: 0,
            cd_raw: false,
        };
        (path, g)
    }

    #[test]
    fn read_after_write_within_session() {
        let dir = tempfile::tempdir().unwrap();
        let (path, g) = make_image(&dir, 32);
        let mut cache = TrackCache::new(PosixImage::open(&path, g).unwrap());

        for block in [0u64, 3, 7, 31] {
            let data = [block as u8 ^ 0x5A; 512];
            cache.write_sector(block, &data).unwrap();
            let mut back = [0u8; 512];
            cache.read_sector(block, &mut back).unwrap();
            assert_eq!(back, data, "block {block}");
        }
    }

    #[test]
    fn dirty_eviction_writes_back() {
        let dir = tempfile::tempdir().unwrap();
        let (path, g) = make_image(&dir, 32);
        let mut cache = TrackCache::with_slots(PosixImage::open(&path, g).unwrap(), 2);

        // Fill both slots dirty, then touch a third track: the LRU dirty
        // slot (track 0) must be written back to make room
        cache.write_sector(1, &[0xEEu8; 512]).unwrap();
        cache.write_sector(5, &[0xDDu8; 512]).unwrap();
        let mut buf = [0u8; 512];
        cache.read_sector(8, &mut buf).unwrap();

        // Observed on disk while the cache is still open
        let contents = fs::read(&path).unwrap();
        assert_eq!(&contents[512..1024], &[0xEEu8; 512][..]);
    }

    #[test]
    fn close_flushes_remaining_dirty_slots() {
        let dir = tempfile::tempdir().unwrap();
        let (path, g) = make_image(&dir, 32);
        let mut cache = TrackCache::new(PosixImage::open(&path, g).unwrap());

        cache.write_sector(2, &[0xABu8; 512]).unwrap();
        drop(cache);

        let contents = fs::read(&path).unwrap();
        assert_eq!(&contents[1024..1536], &[0xABu8; 512][..]);
    }

    #[test]
    fn flush_writes_all_dirty_slots() {
        let dir = tempfile::tempdir().unwrap();
        let (path, g) = make_image(&dir, 32);
        let mut cache = TrackCache::new(PosixImage::open(&path, g).unwrap());

        cache.write_sector(0, &[0x11u8; 512]).unwrap();
        cache.write_sector(9, &[0x22u8; 512]).unwrap();
        cache.flush().unwrap();

        drop(cache);
        let contents = fs::read(&path).unwrap();
        assert_eq!(&contents[0..512], &[0x11u8; 512][..]);
        assert_eq!(&contents[512 * 9..512 * 10], &[0x22u8; 512][..]);
    }

    #[test]
    fn clean_slots_evicted_before_dirty() {
        let dir = tempfile::tempdir().unwrap();
        let (path, g) = make_image(&dir, 32);
        let mut cache = TrackCache::with_slots(PosixImage::open(&path, g).unwrap(), 2);

        // Slot A dirty (track 0), slot B clean (track 1)
        cache.write_sector(0, &[1u8; 512]).unwrap();
        let mut buf = [0u8; 512];
        cache.read_sector(4, &mut buf).unwrap();

        // Loading track 2 must evict the clean slot, keeping track 0
        cache.read_sector(8, &mut buf).unwrap();

        let cached_tracks: Vec<u64> = (0..2).filter_map(|i| cache.slot_info(i)).map(|(t, _, _)| t).collect();
        assert!(cached_tracks.contains(&0), "dirty track evicted too early");
        assert!(cached_tracks.contains(&2));
    }

    #[test]
    fn at_most_one_slot_per_track() {
        let dir = tempfile::tempdir().unwrap();
        let (path, g) = make_image(&dir, 32);
        let mut cache = TrackCache::new(PosixImage::open(&path, g).unwrap());

        let mut buf = [0u8; 512];
        for _ in 0..10 {
            cache.read_sector(5, &mut buf).unwrap();
            cache.write_sector(6, &[3u8; 512]).unwrap();
        }
        let count = (0..DEFAULT_SLOTS)
            .filter_map(|i| cache.slot_info(i))
            .filter(|(t, _, _)| *t == 1)
            .count();
        assert_eq!(count, 1);
    }
}
