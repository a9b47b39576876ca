//! Host services device
//!
//! Lets vintage initiators read the host's real-time clock (mode page
//! 0x20) and request a host shutdown or restart through START STOP UNIT.
//! The unit never performs the action itself; it hands a [`SystemAction`]
//! to the daemon, which honors it at BusFree.

use anyhow::Result;
use chrono::{Datelike, Local, Timelike};
use crossbeam_channel::Sender;

use super::{page, unknown_opcode, DeviceClass, LogicalUnit, UnitCmdResult, UnitCore};
use crate::bus::StatusCode;

/// Actions an initiator may request from the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemAction {
    StopEmulator,
    StopHost,
    RestartHost,
}

pub struct ScsiHostServices {
    core: UnitCore,
    actions: Sender<SystemAction>,
}

impl ScsiHostServices {
    pub fn new(id: u8, lun: u8, actions: Sender<SystemAction>) -> Self {
        let mut core = UnitCore::new(DeviceClass::Hs, id, lun);
        core.product = "Host Services".into();
        Self { core, actions }
    }
}

impl LogicalUnit for ScsiHostServices {
    fn core(&self) -> &UnitCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut UnitCore {
        &mut self.core
    }

    fn mode_pages_supported(&self) -> &'static [u8] {
        &[0x20]
    }

    fn mode_page(&self, code: u8) -> Option<Vec<u8>> {
        match code {
            // Host real-time clock
            0x20 => {
                let now = Local::now();
                let payload = [
                    // Interface version
                    0x01,
                    0x00,
                    (now.year() - 1900) as u8,
                    now.month() as u8,
                    now.day() as u8,
                    now.hour() as u8,
                    now.minute() as u8,
                    now.second() as u8,
                ];
                Some(page(0x20, &payload))
            }
            _ => None,
        }
    }

    /// START STOP UNIT selects the host action through the start/load
    /// bit combination.
    fn start_stop(&mut self, cdb: &[u8]) -> Result<UnitCmdResult> {
        let start = cdb[4] & 0x01 != 0;
        let load = cdb[4] & 0x02 != 0;

        let action = match (start, load) {
            (false, false) => Some(SystemAction::StopEmulator),
            (false, true) => Some(SystemAction::StopHost),
            (true, true) => Some(SystemAction::RestartHost),
            (true, false) => None,
        };

        if let Some(action) = action {
            log::info!("Initiator requested {action:?}");
            let _ = self.actions.send(action);
        }
        Ok(UnitCmdResult::Status(StatusCode::Good))
    }

    fn specific_cmd(&mut self, cdb: &[u8], _outdata: Option<&[u8]>) -> Result<UnitCmdResult> {
        unknown_opcode(self, cdb[0])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit() -> (ScsiHostServices, crossbeam_channel::Receiver<SystemAction>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (ScsiHostServices::new(7, 0, tx), rx)
    }

    #[test]
    fn clock_page_layout() {
        let (mut hs, _rx) = unit();
        let UnitCmdResult::DataIn(data) = hs.cmd(&[0x1A, 0x08, 0x20, 0, 0xFF, 0], None).unwrap()
        else {
            panic!("expected data");
        };
        // DBD: page directly after the 4-byte header
        assert_eq!(data[4], 0x20);
        assert_eq!(data[5], 8);
        assert_eq!(data[6], 0x01);
        // Month is 1..=12
        assert!((1..=12).contains(&data[9]));
    }

    #[test]
    fn start_stop_requests_host_actions() {
        let (mut hs, rx) = unit();

        hs.cmd(&[0x1B, 0, 0, 0, 0b00, 0], None).unwrap();
        assert_eq!(rx.try_recv().unwrap(), SystemAction::StopEmulator);

        hs.cmd(&[0x1B, 0, 0, 0, 0b10, 0], None).unwrap();
        assert_eq!(rx.try_recv().unwrap(), SystemAction::StopHost);

        hs.cmd(&[0x1B, 0, 0, 0, 0b11, 0], None).unwrap();
        assert_eq!(rx.try_recv().unwrap(), SystemAction::RestartHost);

        // Plain start is a no-op
        hs.cmd(&[0x1B, 0, 0, 0, 0b01, 0], None).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn always_ready() {
        let (mut hs, _rx) = unit();
        let res = hs.cmd(&[0x00, 0, 0, 0, 0, 0], None).unwrap();
        assert!(matches!(res, UnitCmdResult::Status(StatusCode::Good)));
    }
}
