//! SCSI CD-ROM drive

use anyhow::Result;

use super::sense::{SenseKey, ASC_INVALID_FIELD_IN_CDB, ASC_MEDIUM_NOT_PRESENT};
use super::{
    unknown_opcode, DeviceClass, LogicalUnit, UnitCmdResult, UnitCore,
};
use crate::bus::StatusCode;
use crate::image::{ImageHandle, MediumResult};
use crate::LatchingEvent;

const TRACK_LEADOUT: u8 = 0xAA;

pub struct ScsiCdrom {
    core: UnitCore,
    /// Logical block size presented to the initiator; the image always
    /// carries 2048-byte sectors
    block_size: usize,
    /// Media change since the last GET EVENT STATUS poll
    event_media: LatchingEvent,
}

impl ScsiCdrom {
    const VALID_BLOCKSIZES: [usize; 2] = [512, 2048];

    pub fn new(id: u8, lun: u8) -> Self {
        let mut core = UnitCore::new(DeviceClass::Cd, id, lun);
        // Read-only medium regardless of file permissions
        core.protected = true;
        Self {
            core,
            block_size: 2048,
            event_media: LatchingEvent::default(),
        }
    }

    pub fn with_image(id: u8, lun: u8, image: Box<dyn ImageHandle>) -> Self {
        let mut cd = Self::new(id, lun);
        cd.core.image = Some(image);
        cd
    }

    fn read_toc(&mut self, cdb: &[u8]) -> Result<UnitCmdResult> {
        if self.core.image.is_none() {
            self.core
                .set_sense(SenseKey::NotReady, ASC_MEDIUM_NOT_PRESENT);
            return Ok(UnitCmdResult::Status(StatusCode::CheckCondition));
        }

        let format = cdb[9] >> 6;
        let track = cdb[6];
        let alloc_len = usize::from(u16::from_be_bytes([cdb[7], cdb[8]]));

        match format {
            0 => match track {
                // Full TOC: one data track plus lead-out
                0 | 1 => {
                    let mut result = vec![0u8; 0x14];
                    result[1] = 0x12;
                    result[2] = 1;
                    result[3] = 1;

                    // Track descriptor for track 1: digital data
                    result[5] = 0x14;
                    result[6] = 1;
                    // Start block 0

                    // Lead-out descriptor
                    result[13] = 0x14;
                    result[14] = TRACK_LEADOUT;
                    let leadout = self.capacity().map_or(0, |(b, _)| b as u32);
                    result[16..20].copy_from_slice(&leadout.to_be_bytes());

                    result.truncate(alloc_len);
                    Ok(UnitCmdResult::DataIn(result))
                }
                TRACK_LEADOUT => {
                    let mut result = vec![0u8; 12];
                    result[1] = 0x0A;
                    result[2] = 1;
                    result[3] = 1;
                    result[5] = 0x14;
                    result[6] = TRACK_LEADOUT;
                    let leadout = self.capacity().map_or(0, |(b, _)| b as u32);
                    result[8..12].copy_from_slice(&leadout.to_be_bytes());

                    result.truncate(alloc_len);
                    Ok(UnitCmdResult::DataIn(result))
                }
                _ => {
                    self.core
                        .set_sense(SenseKey::IllegalRequest, ASC_INVALID_FIELD_IN_CDB);
                    Ok(UnitCmdResult::Status(StatusCode::CheckCondition))
                }
            },
            1 => {
                // Session TOC
                let mut result = vec![0u8; 12];
                result[1] = 0x0A;
                result[2] = 1;
                result[3] = 1;
                result[5] = 0x14;
                result[6] = 1;

                result.truncate(alloc_len);
                Ok(UnitCmdResult::DataIn(result))
            }
            _ => {
                log::error!("Unknown READ TOC format: {}", format);
                self.core
                    .set_sense(SenseKey::IllegalRequest, ASC_INVALID_FIELD_IN_CDB);
                Ok(UnitCmdResult::Status(StatusCode::CheckCondition))
            }
        }
    }

    fn event_status(&mut self, cdb: &[u8]) -> Result<UnitCmdResult> {
        // Only polled operation is carried
        if cdb[1] & 0x01 == 0 {
            self.core
                .set_sense(SenseKey::IllegalRequest, ASC_INVALID_FIELD_IN_CDB);
            return Ok(UnitCmdResult::Status(StatusCode::CheckCondition));
        }

        let alloc_len = usize::from(u16::from_be_bytes([cdb[7], cdb[8]]));
        let want_media_class = cdb[4] & (1 << 4) != 0;

        let mut result = vec![0u8; 8];
        if want_media_class {
            // Event data length, media class, supported classes
            result[1] = 0x06;
            result[2] = 0x04;
            result[3] = 1 << 4;
            // New media / no change
            result[4] = if self.event_media.get_clear() { 0x02 } else { 0x00 };
            // Media present
            result[5] = if self.core.image.is_some() { 0x02 } else { 0x00 };
        } else {
            // No supported event class requested
            result[1] = 0x02;
            result[2] = 0x80;
            result[3] = 1 << 4;
            result.truncate(4);
        }

        result.truncate(alloc_len);
        Ok(UnitCmdResult::DataIn(result))
    }

    fn native_size(&self) -> usize {
        self.core
            .image
            .as_ref()
            .map_or(2048, |i| i.geometry().sector_size())
    }

    /// Multiplier between image sectors and the presented block size.
    /// Never below 1: a block size above the native sector size is
    /// refused at MODE SELECT time.
    fn scale(&self) -> u64 {
        (self.native_size() / self.block_size).max(1) as u64
    }
}

impl LogicalUnit for ScsiCdrom {
    fn core(&self) -> &UnitCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut UnitCore {
        &mut self.core
    }

    fn capacity(&self) -> Option<(u64, usize)> {
        let g = self.core.image.as_ref()?.geometry();
        Some((g.blocks * self.scale(), self.block_size))
    }

    fn read_block(&mut self, lba: u64, buf: &mut [u8]) -> MediumResult<()> {
        let scale = self.scale();
        if scale == 1 {
            return self
                .core
                .image
                .as_mut()
                .ok_or(crate::image::MediumError::UnrecoveredRead(lba))?
                .read_sector(lba, buf);
        }

        // 512-byte addressing over 2048-byte sectors
        let img = self
            .core
            .image
            .as_mut()
            .ok_or(crate::image::MediumError::UnrecoveredRead(lba))?;
        let native = img.geometry().sector_size();
        let mut sector = vec![0u8; native];
        img.read_sector(lba / scale, &mut sector)?;
        let within = (lba % scale) as usize * self.block_size;
        buf.copy_from_slice(&sector[within..within + self.block_size]);
        Ok(())
    }

    fn set_block_size(&mut self, size: usize) -> bool {
        if Self::VALID_BLOCKSIZES.contains(&size) && size <= self.native_size() {
            self.block_size = size;
            return true;
        }
        false
    }

    fn ms_density(&self) -> u8 {
        // User data only, 2048 bytes
        1
    }

    fn ms_media_type(&self) -> u8 {
        // 120 mm CD-ROM
        2
    }

    fn insert_media(&mut self, image: Box<dyn ImageHandle>) -> Result<()> {
        self.event_media.set();
        self.core.image = Some(image);
        self.core.sense = Default::default();
        self.core
            .raise_attention(super::sense::ASC_NOT_READY_TO_READY);
        Ok(())
    }

    fn eject_media(&mut self, force: bool) -> Result<()> {
        if self.core.locked && !force {
            anyhow::bail!("Medium removal is prevented");
        }
        self.event_media.set();
        self.core.image = None;
        Ok(())
    }

    fn specific_cmd(&mut self, cdb: &[u8], _outdata: Option<&[u8]>) -> Result<UnitCmdResult> {
        match cdb[0] {
            // READ TOC
            0x43 => self.read_toc(cdb),
            // GET EVENT STATUS NOTIFICATION
            0x4A => self.event_status(cdb),
            _ => unknown_opcode(self, cdb[0]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{open_image, probe_geometry, AccessMode};
    use std::fs;

    fn cd_with_iso(sectors: usize) -> (tempfile::TempDir, ScsiCdrom) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.iso");
        fs::write(&path, vec![0u8; 2048 * sectors]).unwrap();
        let g = probe_geometry(&path, 2048).unwrap();
        let img = open_image(&path, g, AccessMode::Raw).unwrap();
        let cd = ScsiCdrom::with_image(0, 0, img);
        (dir, cd)
    }

    #[test]
    fn inquiry_reports_cdrom() {
        let (_dir, mut cd) = cd_with_iso(4);
        let UnitCmdResult::DataIn(data) = cd.cmd(&[0x12, 0, 0, 0, 36, 0], None).unwrap() else {
            panic!("expected data");
        };
        assert_eq!(data[0], 0x05);
        assert_eq!(data[1], 0x80);
    }

    #[test]
    fn writes_rejected() {
        let (_dir, mut cd) = cd_with_iso(4);
        let res = cd.cmd(&[0x2A, 0, 0, 0, 0, 0, 0, 0, 1, 0], None).unwrap();
        assert!(matches!(
            res,
            UnitCmdResult::Status(StatusCode::CheckCondition)
        ));
        assert_eq!(cd.core().sense.key, SenseKey::DataProtect);
    }

    #[test]
    fn read_toc_track_one() {
        let (_dir, mut cd) = cd_with_iso(4);
        let UnitCmdResult::DataIn(data) = cd
            .cmd(&[0x43, 0, 0, 0, 0, 0, 1, 0, 0xFF, 0], None)
            .unwrap()
        else {
            panic!("expected data");
        };
        assert_eq!(data[1], 0x12);
        assert_eq!(data[6], 1);
        assert_eq!(data[14], TRACK_LEADOUT);
        // Lead-out starts past the last block
        assert_eq!(&data[16..20], &4u32.to_be_bytes());
    }

    #[test]
    fn read_toc_without_media() {
        let mut cd = ScsiCdrom::new(0, 0);
        let res = cd
            .cmd(&[0x43, 0, 0, 0, 0, 0, 1, 0, 0xFF, 0], None)
            .unwrap();
        assert!(matches!(
            res,
            UnitCmdResult::Status(StatusCode::CheckCondition)
        ));
        assert_eq!(cd.core().sense.key, SenseKey::NotReady);
    }

    #[test]
    fn block_size_switch_rescales_capacity() {
        let (_dir, mut cd) = cd_with_iso(4);
        assert_eq!(cd.capacity(), Some((4, 2048)));

        assert!(cd.set_block_size(512));
        assert_eq!(cd.capacity(), Some((16, 512)));

        assert!(!cd.set_block_size(1024));
    }

    #[test]
    fn event_status_latches_media_change() {
        let (_dir, mut cd) = cd_with_iso(4);
        cd.eject_media(false).unwrap();

        let UnitCmdResult::DataIn(data) = cd
            .cmd(&[0x4A, 1, 0, 0, 1 << 4, 0, 0, 0, 0xFF, 0], None)
            .unwrap()
        else {
            panic!("expected data");
        };
        assert_eq!(data[4], 0x02);
        assert_eq!(data[5], 0x00);

        // The latch clears after one poll
        let UnitCmdResult::DataIn(data) = cd
            .cmd(&[0x4A, 1, 0, 0, 1 << 4, 0, 0, 0, 0xFF, 0], None)
            .unwrap()
        else {
            panic!("expected data");
        };
        assert_eq!(data[4], 0x00);
    }
}
