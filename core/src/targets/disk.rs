//! Disk targets: fixed hard disk, removable disk, magneto-optical
//!
//! The three classes share the block command set entirely; they differ
//! only in the removable bit, the media lifecycle and their INQUIRY
//! identity, all of which the shared dispatcher derives from the class.

use anyhow::{bail, Result};

use super::{unknown_opcode, DeviceClass, LogicalUnit, UnitCmdResult, UnitCore};
use crate::image::ImageHandle;

pub struct ScsiDisk {
    core: UnitCore,
}

impl ScsiDisk {
    pub fn new(class: DeviceClass, id: u8, lun: u8) -> Result<Self> {
        if !matches!(class, DeviceClass::Hd | DeviceClass::Rm | DeviceClass::Mo) {
            bail!("Not a disk class: {class}");
        }
        Ok(Self {
            core: UnitCore::new(class, id, lun),
        })
    }

    pub fn with_image(
        class: DeviceClass,
        id: u8,
        lun: u8,
        image: Box<dyn ImageHandle>,
    ) -> Result<Self> {
        let mut disk = Self::new(class, id, lun)?;
        disk.core.image = Some(image);
        Ok(disk)
    }
}

impl LogicalUnit for ScsiDisk {
    fn core(&self) -> &UnitCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut UnitCore {
        &mut self.core
    }

    fn specific_cmd(&mut self, cdb: &[u8], _outdata: Option<&[u8]>) -> Result<UnitCmdResult> {
        unknown_opcode(self, cdb[0])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::StatusCode;
    use crate::image::{open_image, probe_geometry, AccessMode};
    use crate::targets::sense::SenseKey;
    use std::fs;

    fn disk_with_image(blocks: usize) -> (tempfile::TempDir, ScsiDisk) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.hds");
        fs::write(&path, vec![0u8; 512 * blocks]).unwrap();
        let g = probe_geometry(&path, 512).unwrap();
        let img = open_image(&path, g, AccessMode::Raw).unwrap();
        let disk = ScsiDisk::with_image(DeviceClass::Hd, 0, 0, img).unwrap();
        (dir, disk)
    }

    #[test]
    fn test_unit_ready_with_media() {
        let (_dir, mut disk) = disk_with_image(16);
        let res = disk.cmd(&[0x00, 0, 0, 0, 0, 0], None).unwrap();
        assert!(matches!(
            res,
            UnitCmdResult::Status(StatusCode::Good)
        ));
    }

    #[test]
    fn test_unit_ready_without_media() {
        let mut disk = ScsiDisk::new(DeviceClass::Rm, 0, 0).unwrap();
        let res = disk.cmd(&[0x00, 0, 0, 0, 0, 0], None).unwrap();
        assert!(matches!(
            res,
            UnitCmdResult::Status(StatusCode::CheckCondition)
        ));
        assert_eq!(disk.core().sense.key, SenseKey::NotReady);
    }

    #[test]
    fn inquiry_identity() {
        let (_dir, mut disk) = disk_with_image(16);
        let UnitCmdResult::DataIn(data) = disk.cmd(&[0x12, 0, 0, 0, 0xFF, 0], None).unwrap()
        else {
            panic!("expected data");
        };
        assert_eq!(data.len(), 36);
        assert_eq!(data[0], 0x00);
        assert_eq!(data[1], 0x00);
        assert_eq!(data[2], 0x05);
        assert_eq!(data[3], 0x02);
        assert_eq!(data[4], 0x1F);
        assert_eq!(&data[8..16], b"SLATE   ");
    }

    #[test]
    fn removable_bit_set_for_removable_classes() {
        let mut disk = ScsiDisk::new(DeviceClass::Mo, 0, 0).unwrap();
        let UnitCmdResult::DataIn(data) = disk.cmd(&[0x12, 0, 0, 0, 36, 0], None).unwrap() else {
            panic!("expected data");
        };
        assert_eq!(data[0], 0x07);
        assert_eq!(data[1], 0x80);
    }

    #[test]
    fn read_capacity_reports_last_lba() {
        let (_dir, mut disk) = disk_with_image(16);
        let UnitCmdResult::DataIn(data) = disk.cmd(&[0x25, 0, 0, 0, 0, 0, 0, 0, 0, 0], None).unwrap()
        else {
            panic!("expected data");
        };
        assert_eq!(&data[0..4], &15u32.to_be_bytes());
        assert_eq!(&data[4..8], &512u32.to_be_bytes());
    }

    #[test]
    fn read10_setup_and_bounds() {
        let (_dir, mut disk) = disk_with_image(16);

        let res = disk
            .cmd(&[0x28, 0, 0, 0, 0, 0, 0, 0, 1, 0], None)
            .unwrap();
        assert!(matches!(
            res,
            UnitCmdResult::ReadBlocks { lba: 0, count: 1 }
        ));

        // Zero transfer length completes without data
        let res = disk
            .cmd(&[0x28, 0, 0, 0, 0, 0, 0, 0, 0, 0], None)
            .unwrap();
        assert!(matches!(res, UnitCmdResult::Status(StatusCode::Good)));

        // Out of range
        let res = disk
            .cmd(&[0x28, 0, 0, 0, 0, 16, 0, 0, 1, 0], None)
            .unwrap();
        assert!(matches!(
            res,
            UnitCmdResult::Status(StatusCode::CheckCondition)
        ));
        assert_eq!(disk.core().sense.key, SenseKey::IllegalRequest);
        assert_eq!(disk.core().sense.asc, 0x2100);
    }

    #[test]
    fn read6_zero_length_means_256() {
        let (_dir, mut disk) = disk_with_image(512);
        let res = disk.cmd(&[0x08, 0, 0, 0, 0, 0], None).unwrap();
        assert!(matches!(
            res,
            UnitCmdResult::ReadBlocks { lba: 0, count: 256 }
        ));
    }

    #[test]
    fn write_protected_disk_rejects_writes() {
        let (_dir, mut disk) = disk_with_image(16);
        disk.core_mut().protected = true;
        let res = disk
            .cmd(&[0x2A, 0, 0, 0, 0, 0, 0, 0, 1, 0], None)
            .unwrap();
        assert!(matches!(
            res,
            UnitCmdResult::Status(StatusCode::CheckCondition)
        ));
        assert_eq!(disk.core().sense.key, SenseKey::DataProtect);
    }

    #[test]
    fn unknown_opcode_sets_sense() {
        let (_dir, mut disk) = disk_with_image(16);
        let res = disk.cmd(&[0x3C, 0, 0, 0, 0, 0, 0, 0, 0, 0], None).unwrap();
        assert!(matches!(
            res,
            UnitCmdResult::Status(StatusCode::CheckCondition)
        ));
        assert_eq!(disk.core().sense.key, SenseKey::IllegalRequest);
        assert_eq!(disk.core().sense.asc, 0x2000);
    }

    #[test]
    fn sense_cleared_by_next_command() {
        let (_dir, mut disk) = disk_with_image(16);
        disk.cmd(&[0x3C, 0, 0, 0, 0, 0, 0, 0, 0, 0], None).unwrap();
        assert_eq!(disk.core().sense.key, SenseKey::IllegalRequest);

        disk.cmd(&[0x00, 0, 0, 0, 0, 0], None).unwrap();
        assert!(disk.core().sense.is_clear());
    }

    #[test]
    fn request_sense_reports_and_clears() {
        let (_dir, mut disk) = disk_with_image(16);
        disk.cmd(&[0x3C, 0, 0, 0, 0, 0, 0, 0, 0, 0], None).unwrap();

        let UnitCmdResult::DataIn(data) = disk.cmd(&[0x03, 0, 0, 0, 18, 0], None).unwrap() else {
            panic!("expected sense data");
        };
        assert_eq!(data[2], 0x05);
        assert_eq!(data[12], 0x20);
        assert!(disk.core().sense.is_clear());
    }

    #[test]
    fn unit_attention_reported_once() {
        let (_dir, mut disk) = disk_with_image(16);
        disk.reset();

        // INQUIRY passes through without touching the attention
        let res = disk.cmd(&[0x12, 0, 0, 0, 36, 0], None).unwrap();
        assert!(matches!(res, UnitCmdResult::DataIn(_)));

        // First other command reports it
        let res = disk.cmd(&[0x00, 0, 0, 0, 0, 0], None).unwrap();
        assert!(matches!(
            res,
            UnitCmdResult::Status(StatusCode::CheckCondition)
        ));
        assert_eq!(disk.core().sense.key, SenseKey::UnitAttention);
        assert_eq!(disk.core().sense.asc, 0x2900);

        // And it is gone afterwards
        let res = disk.cmd(&[0x00, 0, 0, 0, 0, 0], None).unwrap();
        assert!(matches!(res, UnitCmdResult::Status(StatusCode::Good)));
    }

    #[test]
    fn mode_sense_pages() {
        let (_dir, mut disk) = disk_with_image(16);

        // Single page
        let UnitCmdResult::DataIn(data) = disk.cmd(&[0x1A, 0, 0x01, 0, 0xFF, 0], None).unwrap()
        else {
            panic!("expected data");
        };
        // Header + block descriptor + page
        assert_eq!(data[3], 8);
        assert_eq!(data[4 + 8], 0x01);
        assert_eq!(data[0] as usize, data.len() - 1);

        // All pages
        let UnitCmdResult::DataIn(all) = disk.cmd(&[0x1A, 0, 0x3F, 0, 0xFF, 0], None).unwrap()
        else {
            panic!("expected data");
        };
        assert!(all.len() > data.len());

        // Unsupported page
        let res = disk.cmd(&[0x1A, 0, 0x19, 0, 0xFF, 0], None).unwrap();
        assert!(matches!(
            res,
            UnitCmdResult::Status(StatusCode::CheckCondition)
        ));
    }

    #[test]
    fn mode_sense_apple_vendor_page() {
        let (_dir, mut disk) = disk_with_image(16);
        let UnitCmdResult::DataIn(data) = disk.cmd(&[0x1A, 0x08, 0x30, 0, 0xFF, 0], None).unwrap()
        else {
            panic!("expected data");
        };
        // DBD set: page follows the 4-byte header directly
        assert_eq!(data[4], 0x30);
        assert_eq!(&data[6..12], b"APPLE ");
    }
}
