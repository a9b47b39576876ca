//! Host bridge device
//!
//! Presents the communications-device identity legacy host drivers probe
//! for. Only the probe surface (INQUIRY, TEST UNIT READY) is carried;
//! the vendor message transport answers ILLEGAL REQUEST so drivers fall
//! back cleanly instead of hanging on a half-implemented protocol.

use anyhow::Result;

use super::sense::{SenseKey, ASC_INVALID_FIELD_IN_CDB};
use super::{DeviceClass, LogicalUnit, UnitCmdResult, UnitCore};
use crate::bus::StatusCode;

pub struct ScsiBridge {
    core: UnitCore,
}

impl ScsiBridge {
    pub fn new(id: u8, lun: u8) -> Self {
        let mut core = UnitCore::new(DeviceClass::Br, id, lun);
        core.product = "RASCSI BRIDGE".into();
        Self { core }
    }
}

impl LogicalUnit for ScsiBridge {
    fn core(&self) -> &UnitCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut UnitCore {
        &mut self.core
    }

    fn overrides_common(&self, opcode: u8) -> bool {
        // GET MESSAGE(10) / SEND MESSAGE(10)
        matches!(opcode, 0x28 | 0x2A)
    }

    fn specific_cmd(&mut self, cdb: &[u8], _outdata: Option<&[u8]>) -> Result<UnitCmdResult> {
        log::warn!("Bridge message transport not carried (opcode {:02X})", cdb[0]);
        self.core
            .set_sense(SenseKey::IllegalRequest, ASC_INVALID_FIELD_IN_CDB);
        Ok(UnitCmdResult::Status(StatusCode::CheckCondition))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inquiry_reports_communications_device() {
        let mut br = ScsiBridge::new(6, 0);
        let UnitCmdResult::DataIn(data) = br.cmd(&[0x12, 0, 0, 0, 36, 0], None).unwrap() else {
            panic!("expected data");
        };
        assert_eq!(data[0], 0x09);
        assert_eq!(&data[16..29], b"RASCSI BRIDGE");
    }

    #[test]
    fn message_transport_rejected() {
        let mut br = ScsiBridge::new(6, 0);
        let res = br
            .cmd(&[0x28, 0, 0, 0, 0, 0, 0, 0, 1, 0], None)
            .unwrap();
        assert!(matches!(
            res,
            UnitCmdResult::Status(StatusCode::CheckCondition)
        ));
        assert_eq!(br.core().sense.key, SenseKey::IllegalRequest);
    }
}
