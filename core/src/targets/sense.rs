//! Sense data: structured failure information for REQUEST SENSE

use num_derive::{FromPrimitive, ToPrimitive};

use crate::image::MediumError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, FromPrimitive, ToPrimitive)]
pub enum SenseKey {
    #[default]
    NoSense = 0x00,
    RecoveredError = 0x01,
    NotReady = 0x02,
    MediumError = 0x03,
    HardwareError = 0x04,
    IllegalRequest = 0x05,
    UnitAttention = 0x06,
    DataProtect = 0x07,
    AbortedCommand = 0x0B,
}

// Additional sense codes, ASC in the high byte and ASCQ in the low byte
pub const ASC_NO_ADDITIONAL_SENSE: u16 = 0x0000;
pub const ASC_WRITE_FAULT: u16 = 0x0C00;
pub const ASC_UNRECOVERED_READ_ERROR: u16 = 0x1100;
pub const ASC_PARAMETER_LIST_LENGTH_ERROR: u16 = 0x1A00;
pub const ASC_INVALID_COMMAND_OPERATION_CODE: u16 = 0x2000;
pub const ASC_LBA_OUT_OF_RANGE: u16 = 0x2100;
pub const ASC_INVALID_FIELD_IN_CDB: u16 = 0x2400;
pub const ASC_LOGICAL_UNIT_NOT_SUPPORTED: u16 = 0x2500;
pub const ASC_INVALID_FIELD_IN_PARAMETER_LIST: u16 = 0x2600;
pub const ASC_WRITE_PROTECTED: u16 = 0x2700;
pub const ASC_NOT_READY_TO_READY: u16 = 0x2800;
pub const ASC_POWER_ON_OR_RESET: u16 = 0x2900;
pub const ASC_MEDIUM_NOT_PRESENT: u16 = 0x3A00;
pub const ASC_MEDIUM_REMOVAL_PREVENTED: u16 = 0x5302;

/// Pending sense of one logical unit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SenseData {
    pub key: SenseKey,
    /// ASC << 8 | ASCQ
    pub asc: u16,
    /// Faulting LBA, reported through the information field
    pub info: Option<u64>,
}

impl SenseData {
    pub const fn new(key: SenseKey, asc: u16) -> Self {
        Self {
            key,
            asc,
            info: None,
        }
    }

    pub const fn with_info(key: SenseKey, asc: u16, lba: u64) -> Self {
        Self {
            key,
            asc,
            info: Some(lba),
        }
    }

    pub fn is_clear(&self) -> bool {
        *self == Self::default()
    }

    /// Fixed-format sense data, truncated to the allocation length.
    pub fn to_fixed(&self, allocation: usize) -> Vec<u8> {
        let mut data = vec![0u8; 18];

        // Current error, fixed format; valid bit when the information
        // field carries an LBA
        data[0] = 0x70 | if self.info.is_some() { 0x80 } else { 0 };
        data[2] = self.key as u8;
        if let Some(lba) = self.info {
            data[3..7].copy_from_slice(&(lba as u32).to_be_bytes());
        }
        // Additional sense length
        data[7] = 10;
        data[12] = (self.asc >> 8) as u8;
        data[13] = (self.asc & 0xFF) as u8;

        data.truncate(allocation.min(18).max(4));
        data
    }
}

impl From<MediumError> for SenseData {
    fn from(e: MediumError) -> Self {
        match e {
            MediumError::UnrecoveredRead(lba) => {
                Self::with_info(SenseKey::MediumError, ASC_UNRECOVERED_READ_ERROR, lba)
            }
            MediumError::WriteFault(lba) => {
                Self::with_info(SenseKey::MediumError, ASC_WRITE_FAULT, lba)
            }
            MediumError::OutOfRange(lba) => {
                Self::with_info(SenseKey::IllegalRequest, ASC_LBA_OUT_OF_RANGE, lba)
            }
            MediumError::WriteProtected => Self::new(SenseKey::DataProtect, ASC_WRITE_PROTECTED),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_format_layout() {
        let sense = SenseData::new(SenseKey::IllegalRequest, ASC_INVALID_COMMAND_OPERATION_CODE);
        let data = sense.to_fixed(18);
        assert_eq!(data.len(), 18);
        assert_eq!(data[0], 0x70);
        assert_eq!(data[2], 0x05);
        assert_eq!(data[7], 10);
        assert_eq!(data[12], 0x20);
        assert_eq!(data[13], 0x00);
    }

    #[test]
    fn info_field_carries_lba() {
        let sense = SenseData::from(MediumError::UnrecoveredRead(0x1234));
        let data = sense.to_fixed(18);
        assert_eq!(data[0], 0xF0);
        assert_eq!(&data[3..7], &[0, 0, 0x12, 0x34]);
        assert_eq!(data[2], 0x03);
        assert_eq!(data[12], 0x11);
    }

    #[test]
    fn truncates_to_allocation() {
        let sense = SenseData::new(SenseKey::NoSense, ASC_NO_ADDITIONAL_SENSE);
        assert_eq!(sense.to_fixed(8).len(), 8);
        assert_eq!(sense.to_fixed(255).len(), 18);
    }
}
