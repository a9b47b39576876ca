//! Logical units: per-LUN device behavior
//!
//! Every attached device implements [`LogicalUnit`]. The shared command
//! set (INQUIRY, sense, block I/O, mode pages, medium control) lives in
//! one dispatcher; classes override single commands or add their own via
//! `specific_cmd`. Handlers never touch the bus: they return a
//! [`UnitCmdResult`] and the controller moves the bytes.

pub mod bridge;
pub mod cdrom;
pub mod daynaport;
pub mod disk;
pub mod hostservices;
pub mod printer;
pub mod sense;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::bus::StatusCode;
use crate::image::{ImageHandle, ImageProperties, MediumError, MediumResult};
use sense::{
    SenseData, SenseKey, ASC_INVALID_COMMAND_OPERATION_CODE, ASC_INVALID_FIELD_IN_CDB,
    ASC_INVALID_FIELD_IN_PARAMETER_LIST, ASC_LBA_OUT_OF_RANGE, ASC_MEDIUM_NOT_PRESENT,
    ASC_MEDIUM_REMOVAL_PREVENTED, ASC_NOT_READY_TO_READY,
};

/// Maximum logical units behind one target ID
pub const LUN_MAX: u8 = 32;

/// Device classes, with their control-plane shorthand
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    /// Fixed hard disk
    Hd,
    /// Removable disk
    Rm,
    /// Magneto-optical
    Mo,
    /// CD-ROM
    Cd,
    /// DaynaPort SCSI/Link Ethernet
    Dp,
    /// Printer
    Lp,
    /// Host bridge
    Br,
    /// Host services
    Hs,
}

impl DeviceClass {
    /// SCSI peripheral device type reported by INQUIRY
    pub const fn peripheral_type(self) -> u8 {
        match self {
            Self::Hd | Self::Rm => 0x00,
            Self::Lp => 0x02,
            Self::Dp | Self::Hs => 0x03,
            Self::Cd => 0x05,
            Self::Mo => 0x07,
            Self::Br => 0x09,
        }
    }

    pub const fn removable(self) -> bool {
        matches!(self, Self::Rm | Self::Mo | Self::Cd)
    }

    /// Classes backed by an image file
    pub const fn block_device(self) -> bool {
        matches!(self, Self::Hd | Self::Rm | Self::Mo | Self::Cd)
    }

    const fn default_product(self) -> &'static str {
        match self {
            Self::Hd => "HARDDISK",
            Self::Rm => "REMOVABLE DISK",
            Self::Mo => "MO DISK",
            Self::Cd => "CD-ROM DRIVE",
            Self::Dp => "SCSI/Link",
            Self::Lp => "SCSI PRINTER",
            Self::Br => "HOST BRIDGE",
            Self::Hs => "HOST SERVICES",
        }
    }
}

/// Result of one dispatched command
pub enum UnitCmdResult {
    /// Turn to the Status phase immediately
    Status(StatusCode),
    /// Return data to the initiator
    DataIn(Vec<u8>),
    /// Expect this many bytes from the initiator, then re-dispatch with
    /// the payload
    DataOut(usize),
    /// Block transfer to the initiator, pumped per block
    ReadBlocks { lba: u64, count: u32 },
    /// Block transfer from the initiator, pumped per block
    WriteBlocks { lba: u64, count: u32 },
}

/// Class-independent state every logical unit carries
pub struct UnitCore {
    pub class: DeviceClass,
    pub id: u8,
    pub lun: u8,
    pub vendor: String,
    pub product: String,
    pub revision: String,
    pub image: Option<Box<dyn ImageHandle>>,
    pub sense: SenseData,
    /// Pending unit attention (ASC), reported once
    pub attention: Option<u16>,
    /// Soft write protection from the control plane
    pub protected: bool,
    pub locked: bool,
    pub stopped: bool,
}

impl UnitCore {
    pub fn new(class: DeviceClass, id: u8, lun: u8) -> Self {
        Self {
            class,
            id,
            lun,
            vendor: "SLATE".into(),
            product: class.default_product().into(),
            revision: "0100".into(),
            image: None,
            sense: SenseData::default(),
            attention: None,
            protected: false,
            locked: false,
            stopped: false,
        }
    }

    pub fn apply_properties(&mut self, props: &ImageProperties) {
        if let Some(v) = &props.vendor {
            self.vendor = v.clone();
        }
        if let Some(p) = &props.product {
            self.product = p.clone();
        }
        if let Some(r) = &props.revision {
            self.revision = r.clone();
        }
    }

    pub fn set_sense(&mut self, key: SenseKey, asc: u16) {
        self.sense = SenseData::new(key, asc);
    }

    pub fn raise_attention(&mut self, asc: u16) {
        self.attention = Some(asc);
    }

    pub fn write_protected(&self) -> bool {
        self.protected || self.image.as_ref().is_some_and(|i| i.read_only())
    }
}

/// One device behind a (target ID, LUN) address
pub trait LogicalUnit: Send {
    fn core(&self) -> &UnitCore;
    fn core_mut(&mut self) -> &mut UnitCore;

    /// Class-specific commands; the shared dispatcher falls through here
    /// for anything it does not know.
    fn specific_cmd(&mut self, cdb: &[u8], outdata: Option<&[u8]>) -> Result<UnitCmdResult>;

    /// Commands the class takes over from the shared dispatcher.
    fn overrides_common(&self, _opcode: u8) -> bool {
        false
    }

    fn class(&self) -> DeviceClass {
        self.core().class
    }

    /// (blocks, block_size) for block devices with media present.
    fn capacity(&self) -> Option<(u64, usize)> {
        let g = self.core().image.as_ref()?.geometry();
        Some((g.blocks, g.sector_size()))
    }

    fn read_block(&mut self, lba: u64, buf: &mut [u8]) -> MediumResult<()> {
        self.core_mut()
            .image
            .as_mut()
            .ok_or(MediumError::UnrecoveredRead(lba))?
            .read_sector(lba, buf)
    }

    fn write_block(&mut self, lba: u64, buf: &[u8]) -> MediumResult<()> {
        if self.core().write_protected() {
            return Err(MediumError::WriteProtected);
        }
        self.core_mut()
            .image
            .as_mut()
            .ok_or(MediumError::WriteFault(lba))?
            .write_sector(lba, buf)
    }

    fn flush_media(&mut self) -> MediumResult<()> {
        match self.core_mut().image.as_mut() {
            Some(img) => img.flush(),
            None => Ok(()),
        }
    }

    /// DataIn pacing: pause after this many bytes for slow host adapters.
    fn send_pacing(&self) -> Option<usize> {
        None
    }

    /// START STOP UNIT; classes reinterpret this (eject, host shutdown).
    fn start_stop(&mut self, cdb: &[u8]) -> Result<UnitCmdResult> {
        default_start_stop(self, cdb)
    }

    /// One complete mode page (header included), or None when the class
    /// does not carry it.
    fn mode_page(&self, page: u8) -> Option<Vec<u8>> {
        default_mode_page(self, page)
    }

    /// Pages enumerated for MODE SENSE 0x3F, ascending.
    fn mode_pages_supported(&self) -> &'static [u8] {
        &[0x01, 0x02, 0x03, 0x04, 0x08, 0x30]
    }

    /// Accept a block size change from MODE SELECT.
    fn set_block_size(&mut self, size: usize) -> bool {
        self.capacity().is_some_and(|(_, cur)| cur == size)
    }

    fn ms_density(&self) -> u8 {
        0
    }

    fn ms_media_type(&self) -> u8 {
        0
    }

    fn ms_device_specific(&self) -> u8 {
        if self.core().write_protected() {
            0x80
        } else {
            0
        }
    }

    /// Control plane: load media into the unit.
    fn insert_media(&mut self, image: Box<dyn ImageHandle>) -> Result<()> {
        let core = self.core_mut();
        core.image = Some(image);
        core.sense = SenseData::default();
        core.raise_attention(ASC_NOT_READY_TO_READY);
        Ok(())
    }

    /// Control plane: remove media. Fails while locked unless forced.
    fn eject_media(&mut self, force: bool) -> Result<()> {
        let core = self.core_mut();
        if core.locked && !force {
            anyhow::bail!("Medium removal is prevented");
        }
        if let Some(mut img) = core.image.take() {
            if let Err(e) = img.flush() {
                log::error!("Flush on eject failed: {}", e);
            }
        }
        Ok(())
    }

    /// Bus or BUS DEVICE RESET: drop reservations and latch attention.
    fn reset(&mut self) {
        let core = self.core_mut();
        core.sense = SenseData::default();
        core.locked = false;
        core.raise_attention(sense::ASC_POWER_ON_OR_RESET);
    }

    /// Entry point for the controller.
    fn cmd(&mut self, cdb: &[u8], outdata: Option<&[u8]>) -> Result<UnitCmdResult> {
        dispatch(self, cdb, outdata)
    }
}

/// CHECK CONDITION shorthand
fn check_condition<T: LogicalUnit + ?Sized>(
    unit: &mut T,
    key: SenseKey,
    asc: u16,
) -> Result<UnitCmdResult> {
    unit.core_mut().set_sense(key, asc);
    Ok(UnitCmdResult::Status(StatusCode::CheckCondition))
}

fn good() -> Result<UnitCmdResult> {
    Ok(UnitCmdResult::Status(StatusCode::Good))
}

/// Media presence gate for block commands
fn media<T: LogicalUnit + ?Sized>(unit: &mut T) -> Option<(u64, usize)> {
    match unit.capacity() {
        Some(c) => Some(c),
        None => {
            unit.core_mut()
                .set_sense(SenseKey::NotReady, ASC_MEDIUM_NOT_PRESENT);
            None
        }
    }
}

const fn lba6(cdb: &[u8]) -> u64 {
    ((cdb[1] as u64 & 0x1F) << 16) | ((cdb[2] as u64) << 8) | cdb[3] as u64
}

fn lba10(cdb: &[u8]) -> u64 {
    u64::from(u32::from_be_bytes([cdb[2], cdb[3], cdb[4], cdb[5]]))
}

fn count10(cdb: &[u8]) -> u64 {
    u64::from(u16::from_be_bytes([cdb[7], cdb[8]]))
}

fn lba16(cdb: &[u8]) -> u64 {
    u64::from_be_bytes([
        cdb[2], cdb[3], cdb[4], cdb[5], cdb[6], cdb[7], cdb[8], cdb[9],
    ])
}

fn count16(cdb: &[u8]) -> u64 {
    u64::from(u32::from_be_bytes([cdb[10], cdb[11], cdb[12], cdb[13]]))
}

fn read_cmd<T: LogicalUnit + ?Sized>(
    unit: &mut T,
    lba: u64,
    count: u64,
) -> Result<UnitCmdResult> {
    let Some((blocks, _)) = media(unit) else {
        return Ok(UnitCmdResult::Status(StatusCode::CheckCondition));
    };
    if count == 0 {
        // Zero-length transfers complete without a data phase
        return good();
    }
    if lba.checked_add(count).is_none_or(|end| end > blocks) {
        unit.core_mut().sense = SenseData::with_info(SenseKey::IllegalRequest, ASC_LBA_OUT_OF_RANGE, lba);
        return Ok(UnitCmdResult::Status(StatusCode::CheckCondition));
    }
    Ok(UnitCmdResult::ReadBlocks {
        lba,
        count: count as u32,
    })
}

fn write_cmd<T: LogicalUnit + ?Sized>(
    unit: &mut T,
    lba: u64,
    count: u64,
) -> Result<UnitCmdResult> {
    let Some((blocks, _)) = media(unit) else {
        return Ok(UnitCmdResult::Status(StatusCode::CheckCondition));
    };
    if unit.core().write_protected() {
        return check_condition(unit, SenseKey::DataProtect, sense::ASC_WRITE_PROTECTED);
    }
    if count == 0 {
        return good();
    }
    if lba.checked_add(count).is_none_or(|end| end > blocks) {
        unit.core_mut().sense = SenseData::with_info(SenseKey::IllegalRequest, ASC_LBA_OUT_OF_RANGE, lba);
        return Ok(UnitCmdResult::Status(StatusCode::CheckCondition));
    }
    Ok(UnitCmdResult::WriteBlocks {
        lba,
        count: count as u32,
    })
}

fn seek_cmd<T: LogicalUnit + ?Sized>(unit: &mut T, lba: u64) -> Result<UnitCmdResult> {
    let Some((blocks, _)) = media(unit) else {
        return Ok(UnitCmdResult::Status(StatusCode::CheckCondition));
    };
    if lba >= blocks {
        unit.core_mut().sense = SenseData::with_info(SenseKey::IllegalRequest, ASC_LBA_OUT_OF_RANGE, lba);
        return Ok(UnitCmdResult::Status(StatusCode::CheckCondition));
    }
    good()
}

/// Standard 36-byte INQUIRY page
fn inquiry<T: LogicalUnit + ?Sized>(unit: &mut T, cdb: &[u8]) -> Result<UnitCmdResult> {
    // Vital product data pages are not carried
    if cdb[1] & 0x01 != 0 {
        return check_condition(unit, SenseKey::IllegalRequest, ASC_INVALID_FIELD_IN_CDB);
    }

    let allocation = usize::from(u16::from_be_bytes([cdb[3], cdb[4]]));
    let core = unit.core();

    let mut data = vec![0u8; 36];
    data[0] = core.class.peripheral_type();
    data[1] = if core.class.removable() { 0x80 } else { 0x00 };
    // SPC-3, response data format 2
    data[2] = 0x05;
    data[3] = 0x02;
    // Additional length
    data[4] = 0x1F;

    fill_padded(&mut data[8..16], &core.vendor);
    fill_padded(&mut data[16..32], &core.product);
    fill_padded(&mut data[32..36], &core.revision);

    data.truncate(allocation.min(36));
    Ok(UnitCmdResult::DataIn(data))
}

/// Space-padded ASCII field
pub(crate) fn fill_padded(dst: &mut [u8], src: &str) {
    for (d, s) in dst.iter_mut().zip(src.bytes().chain(std::iter::repeat(b' '))) {
        *d = s;
    }
}

fn read_capacity10<T: LogicalUnit + ?Sized>(unit: &mut T) -> Result<UnitCmdResult> {
    let Some((blocks, block_size)) = media(unit) else {
        return Ok(UnitCmdResult::Status(StatusCode::CheckCondition));
    };
    let last = (blocks - 1).min(u64::from(u32::MAX)) as u32;

    let mut data = vec![0u8; 8];
    data[0..4].copy_from_slice(&last.to_be_bytes());
    data[4..8].copy_from_slice(&(block_size as u32).to_be_bytes());
    Ok(UnitCmdResult::DataIn(data))
}

fn read_capacity16<T: LogicalUnit + ?Sized>(unit: &mut T, cdb: &[u8]) -> Result<UnitCmdResult> {
    let Some((blocks, block_size)) = media(unit) else {
        return Ok(UnitCmdResult::Status(StatusCode::CheckCondition));
    };
    let allocation = u32::from_be_bytes([cdb[10], cdb[11], cdb[12], cdb[13]]) as usize;

    let mut data = vec![0u8; 32];
    data[0..8].copy_from_slice(&(blocks - 1).to_be_bytes());
    data[8..12].copy_from_slice(&(block_size as u32).to_be_bytes());
    data.truncate(allocation.min(32));
    Ok(UnitCmdResult::DataIn(data))
}

/// Default START STOP UNIT: spin state plus load/eject for removables
fn default_start_stop<T: LogicalUnit + ?Sized>(unit: &mut T, cdb: &[u8]) -> Result<UnitCmdResult> {
    let start = cdb[4] & 0x01 != 0;
    let loej = cdb[4] & 0x02 != 0;

    unit.core_mut().stopped = !start;

    if loej && !start {
        if unit.core().locked {
            return check_condition(unit, SenseKey::IllegalRequest, ASC_MEDIUM_REMOVAL_PREVENTED);
        }
        if unit.class().removable() {
            unit.eject_media(false)?;
        }
    }
    good()
}

/// Wrap a page payload with its code and length
pub(crate) fn page(code: u8, payload: &[u8]) -> Vec<u8> {
    let mut p = Vec::with_capacity(payload.len() + 2);
    p.push(code);
    p.push(payload.len() as u8);
    p.extend_from_slice(payload);
    p
}

/// The standard block-device page set. Geometry pages are synthesized
/// from the capacity: 8 heads, 25 sectors per track.
pub(crate) fn default_mode_page<T: LogicalUnit + ?Sized>(unit: &T, code: u8) -> Option<Vec<u8>> {
    const HEADS: u64 = 8;
    const SECTORS_PER_TRACK: u64 = 25;

    match code {
        // Read-write error recovery
        0x01 => Some(page(0x01, &[0u8; 10])),
        // Disconnect-reconnect
        0x02 => Some(page(0x02, &[0u8; 14])),
        // Format device
        0x03 => {
            let (_, block_size) = unit.capacity()?;
            let mut p = [0u8; 22];
            p[10..12].copy_from_slice(&(SECTORS_PER_TRACK as u16).to_be_bytes());
            p[12..14].copy_from_slice(&(block_size as u16).to_be_bytes());
            // Interleave 1
            p[15] = 1;
            if unit.class().removable() {
                p[20] = 0x20;
            }
            Some(page(0x03, &p))
        }
        // Rigid disk geometry
        0x04 => {
            let (blocks, _) = unit.capacity()?;
            let cylinders = (blocks / (HEADS * SECTORS_PER_TRACK)).max(1);
            let mut p = [0u8; 22];
            p[0..3].copy_from_slice(&(cylinders as u32).to_be_bytes()[1..4]);
            p[3] = HEADS as u8;
            // Rotation rate
            p[18..20].copy_from_slice(&7200u16.to_be_bytes());
            Some(page(0x04, &p))
        }
        // Caching
        0x08 => Some(page(0x08, &[0u8; 10])),
        // Apple vendor page, kept for legacy host drivers
        0x30 => {
            let mut p = [0u8; 22];
            p.copy_from_slice(b"APPLE COMPUTER, INC   ");
            Some(page(0x30, &p))
        }
        _ => None,
    }
}

fn mode_sense<T: LogicalUnit + ?Sized>(
    unit: &mut T,
    cdb: &[u8],
    long_form: bool,
) -> Result<UnitCmdResult> {
    let dbd = cdb[1] & 0x08 != 0;
    let page_code = cdb[2] & 0x3F;
    let allocation = if long_form {
        usize::from(u16::from_be_bytes([cdb[7], cdb[8]]))
    } else {
        usize::from(cdb[4])
    };

    // Collect the pages first: an unsupported page is an error before
    // any header is built
    let mut pages = Vec::new();
    if page_code == 0x3F {
        for &code in unit.mode_pages_supported() {
            if let Some(p) = unit.mode_page(code) {
                pages.extend_from_slice(&p);
            }
        }
    } else {
        match unit.mode_page(page_code) {
            Some(p) => pages.extend_from_slice(&p),
            None => {
                return check_condition(unit, SenseKey::IllegalRequest, ASC_INVALID_FIELD_IN_CDB)
            }
        }
    }

    // Block descriptor for block devices, unless disabled
    let mut descriptor = Vec::new();
    if !dbd {
        if let Some((blocks, block_size)) = unit.capacity() {
            descriptor.extend_from_slice(&[unit.ms_density(), 0, 0, 0]);
            let count = blocks.min(0xFF_FFFF) as u32;
            descriptor[1..4].copy_from_slice(&count.to_be_bytes()[1..4]);
            // Bytes 4..8: reserved byte plus the block length in 24 bits
            descriptor.extend_from_slice(&(block_size as u32).to_be_bytes());
        }
    }

    let mut data = if long_form {
        let mut d = vec![0u8; 8];
        d[2] = unit.ms_media_type();
        d[3] = unit.ms_device_specific();
        d[6..8].copy_from_slice(&(descriptor.len() as u16).to_be_bytes());
        d
    } else {
        vec![
            0,
            unit.ms_media_type(),
            unit.ms_device_specific(),
            descriptor.len() as u8,
        ]
    };
    data.extend_from_slice(&descriptor);
    data.extend_from_slice(&pages);

    // Patch the mode data length
    if long_form {
        let len = (data.len() - 2) as u16;
        data[0..2].copy_from_slice(&len.to_be_bytes());
    } else {
        data[0] = (data.len() - 1) as u8;
    }

    data.truncate(allocation);
    Ok(UnitCmdResult::DataIn(data))
}

fn mode_select<T: LogicalUnit + ?Sized>(
    unit: &mut T,
    cdb: &[u8],
    outdata: Option<&[u8]>,
    long_form: bool,
) -> Result<UnitCmdResult> {
    let length = if long_form {
        usize::from(u16::from_be_bytes([cdb[7], cdb[8]]))
    } else {
        usize::from(cdb[4])
    };

    let Some(data) = outdata else {
        if length == 0 {
            return good();
        }
        return Ok(UnitCmdResult::DataOut(length));
    };

    // Honor a block size change in the descriptor; page contents beyond
    // that are accepted and ignored
    let header = if long_form { 8 } else { 4 };
    if data.len() < header {
        return check_condition(
            unit,
            SenseKey::IllegalRequest,
            sense::ASC_PARAMETER_LIST_LENGTH_ERROR,
        );
    }
    let bd_len = if long_form {
        usize::from(u16::from_be_bytes([data[6], data[7]]))
    } else {
        usize::from(data[3])
    };
    if bd_len >= 8 && data.len() >= header + 8 {
        let bd = &data[header..header + 8];
        let size = usize::from(u16::from_be_bytes([bd[6], bd[7]])) | (usize::from(bd[5]) << 16);
        if size != 0 && !unit.set_block_size(size) {
            return check_condition(
                unit,
                SenseKey::IllegalRequest,
                ASC_INVALID_FIELD_IN_PARAMETER_LIST,
            );
        }
    }
    good()
}

/// The shared dispatcher: sense discipline, unit attention, and the
/// common command set.
pub(crate) fn dispatch<T: LogicalUnit + ?Sized>(
    unit: &mut T,
    cdb: &[u8],
    outdata: Option<&[u8]>,
) -> Result<UnitCmdResult> {
    let op = cdb[0];

    // Any command other than REQUEST SENSE enters with clean sense and
    // rearms it on failure
    if op != 0x03 {
        unit.core_mut().sense = SenseData::default();
    }

    // A pending unit attention is reported exactly once, to the first
    // command that is not INQUIRY or REQUEST SENSE
    if !matches!(op, 0x03 | 0x12) {
        if let Some(asc) = unit.core_mut().attention.take() {
            unit.core_mut().sense = SenseData::new(SenseKey::UnitAttention, asc);
            return Ok(UnitCmdResult::Status(StatusCode::CheckCondition));
        }
    }

    if unit.overrides_common(op) {
        return unit.specific_cmd(cdb, outdata);
    }

    match op {
        // TEST UNIT READY
        0x00 => {
            if unit.class().block_device() && unit.core().image.is_none() {
                return check_condition(unit, SenseKey::NotReady, ASC_MEDIUM_NOT_PRESENT);
            }
            good()
        }
        // REZERO UNIT
        0x01 => seek_cmd(unit, 0),
        // REQUEST SENSE
        0x03 => {
            let allocation = match cdb[4] {
                0 => 4,
                n => usize::from(n),
            };
            let data = std::mem::take(&mut unit.core_mut().sense).to_fixed(allocation);
            Ok(UnitCmdResult::DataIn(data))
        }
        // FORMAT UNIT
        0x04 => {
            if media(unit).is_none() {
                return Ok(UnitCmdResult::Status(StatusCode::CheckCondition));
            }
            good()
        }
        // REASSIGN BLOCKS
        0x07 => {
            if media(unit).is_none() {
                return Ok(UnitCmdResult::Status(StatusCode::CheckCondition));
            }
            good()
        }
        // READ(6); zero length means 256 in group 0
        0x08 => {
            let count = match cdb[4] {
                0 => 256,
                n => u64::from(n),
            };
            read_cmd(unit, lba6(cdb), count)
        }
        // WRITE(6)
        0x0A => {
            let count = match cdb[4] {
                0 => 256,
                n => u64::from(n),
            };
            write_cmd(unit, lba6(cdb), count)
        }
        // SEEK(6)
        0x0B => seek_cmd(unit, lba6(cdb)),
        // INQUIRY
        0x12 => inquiry(unit, cdb),
        // MODE SELECT(6)
        0x15 => mode_select(unit, cdb, outdata, false),
        // RESERVE / RELEASE UNIT
        0x16 | 0x17 => good(),
        // MODE SENSE(6)
        0x1A => mode_sense(unit, cdb, false),
        // START STOP UNIT
        0x1B => unit.start_stop(cdb),
        // SEND DIAGNOSTIC; only the default self-test is carried
        0x1D => {
            if cdb[1] & 0x04 != 0 {
                good()
            } else {
                check_condition(unit, SenseKey::IllegalRequest, ASC_INVALID_FIELD_IN_CDB)
            }
        }
        // PREVENT ALLOW MEDIUM REMOVAL
        0x1E => {
            unit.core_mut().locked = cdb[4] & 0x01 != 0;
            good()
        }
        // READ CAPACITY(10)
        0x25 => read_capacity10(unit),
        // READ(10); zero length means no transfer
        0x28 => read_cmd(unit, lba10(cdb), count10(cdb)),
        // WRITE(10)
        0x2A => write_cmd(unit, lba10(cdb), count10(cdb)),
        // SEEK(10)
        0x2B => seek_cmd(unit, lba10(cdb)),
        // WRITE AND VERIFY(10)
        0x2E => write_cmd(unit, lba10(cdb), count10(cdb)),
        // VERIFY(10)
        0x2F => {
            let lba = lba10(cdb);
            let count = count10(cdb);
            let Some((blocks, _)) = media(unit) else {
                return Ok(UnitCmdResult::Status(StatusCode::CheckCondition));
            };
            if count != 0 && lba.checked_add(count).is_none_or(|end| end > blocks) {
                unit.core_mut().sense =
                    SenseData::with_info(SenseKey::IllegalRequest, ASC_LBA_OUT_OF_RANGE, lba);
                return Ok(UnitCmdResult::Status(StatusCode::CheckCondition));
            }
            good()
        }
        // SYNCHRONIZE CACHE(10)
        0x35 => match unit.flush_media() {
            Ok(()) => good(),
            Err(e) => {
                unit.core_mut().sense = SenseData::from(e);
                Ok(UnitCmdResult::Status(StatusCode::CheckCondition))
            }
        },
        // MODE SELECT(10)
        0x55 => mode_select(unit, cdb, outdata, true),
        // MODE SENSE(10)
        0x5A => mode_sense(unit, cdb, true),
        // READ(16)
        0x88 => read_cmd(unit, lba16(cdb), count16(cdb)),
        // WRITE(16)
        0x8A => write_cmd(unit, lba16(cdb), count16(cdb)),
        // SERVICE ACTION IN(16): READ CAPACITY(16)
        0x9E => {
            if cdb[1] & 0x1F == 0x10 {
                read_capacity16(unit, cdb)
            } else {
                check_condition(unit, SenseKey::IllegalRequest, ASC_INVALID_FIELD_IN_CDB)
            }
        }
        _ => unit.specific_cmd(cdb, outdata),
    }
}

/// The logical units behind one target ID.
///
/// Units are created and destroyed by the control plane; the controller
/// only ever borrows them for the duration of a command.
#[derive(Default)]
pub struct TargetUnits {
    units: [Option<Box<dyn LogicalUnit>>; LUN_MAX as usize],
}

impl TargetUnits {
    pub fn unit(&self, lun: u8) -> Option<&dyn LogicalUnit> {
        self.units.get(usize::from(lun))?.as_deref()
    }

    pub fn unit_mut(&mut self, lun: u8) -> Option<&mut (dyn LogicalUnit + 'static)> {
        match self.units.get_mut(usize::from(lun)) {
            Some(Some(u)) => Some(u.as_mut()),
            _ => None,
        }
    }

    pub fn attach(&mut self, lun: u8, unit: Box<dyn LogicalUnit>) -> Result<()> {
        if lun >= LUN_MAX {
            anyhow::bail!("LUN {lun} out of range");
        }
        let slot = &mut self.units[usize::from(lun)];
        if slot.is_some() {
            anyhow::bail!("LUN {lun} is occupied");
        }
        *slot = Some(unit);
        Ok(())
    }

    pub fn detach(&mut self, lun: u8) -> Option<Box<dyn LogicalUnit>> {
        self.units.get_mut(usize::from(lun))?.take()
    }

    pub fn has_units(&self) -> bool {
        self.units.iter().any(Option::is_some)
    }

    pub fn luns(&self) -> impl Iterator<Item = u8> + '_ {
        self.units
            .iter()
            .enumerate()
            .filter(|(_, u)| u.is_some())
            .map(|(lun, _)| lun as u8)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Box<dyn LogicalUnit>> {
        self.units.iter_mut().flatten()
    }
}

/// All targets on the bus, one entry per SCSI ID
pub struct DeviceMap {
    targets: [TargetUnits; 8],
}

impl Default for DeviceMap {
    fn default() -> Self {
        Self {
            targets: std::array::from_fn(|_| TargetUnits::default()),
        }
    }
}

impl DeviceMap {
    pub fn target(&self, id: u8) -> &TargetUnits {
        &self.targets[usize::from(id & 7)]
    }

    pub fn target_mut(&mut self, id: u8) -> &mut TargetUnits {
        &mut self.targets[usize::from(id & 7)]
    }

    /// (id, lun) of every attached unit
    pub fn addresses(&self) -> Vec<(u8, u8)> {
        let mut out = Vec::new();
        for id in 0..8u8 {
            for lun in self.target(id).luns() {
                out.push((id, lun));
            }
        }
        out
    }
}

/// Fallback for class handlers: unknown opcode
pub(crate) fn unknown_opcode<T: LogicalUnit + ?Sized>(
    unit: &mut T,
    opcode: u8,
) -> Result<UnitCmdResult> {
    log::warn!(
        "Unsupported command {:02X} for {} unit {}:{}",
        opcode,
        unit.core().class,
        unit.core().id,
        unit.core().lun
    );
    check_condition(
        unit,
        SenseKey::IllegalRequest,
        ASC_INVALID_COMMAND_OPERATION_CODE,
    )
}
