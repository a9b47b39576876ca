//! SCSI printer
//!
//! PRINT data accumulates in a spool file; SYNCHRONIZE BUFFER closes the
//! spool and hands it to the host print command. There is no medium, so
//! the unit is always ready.

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::process::Command;

use anyhow::Result;

use super::sense::{SenseKey, ASC_INVALID_FIELD_IN_CDB};
use super::{unknown_opcode, DeviceClass, LogicalUnit, UnitCmdResult, UnitCore};
use crate::bus::StatusCode;

/// Host command used to print the spool; `%f` expands to the file path
pub const DEFAULT_PRINT_CMD: &str = "lp -oraw %f";

pub struct ScsiPrinter {
    core: UnitCore,
    print_cmd: String,
    spool: Option<(PathBuf, File)>,
    job_serial: u32,
}

impl ScsiPrinter {
    pub fn new(id: u8, lun: u8) -> Self {
        Self {
            core: UnitCore::new(DeviceClass::Lp, id, lun),
            print_cmd: DEFAULT_PRINT_CMD.into(),
            spool: None,
            job_serial: 0,
        }
    }

    pub fn set_print_cmd(&mut self, cmd: &str) {
        self.print_cmd = cmd.into();
    }

    fn spool_file(&mut self) -> std::io::Result<&mut File> {
        if self.spool.is_none() {
            self.job_serial += 1;
            let path = std::env::temp_dir().join(format!(
                "slate-print-{}-{}.job",
                std::process::id(),
                self.job_serial
            ));
            let file = File::create(&path)?;
            log::info!("Opened print spool {}", path.display());
            self.spool = Some((path, file));
        }
        Ok(&mut self.spool.as_mut().unwrap().1)
    }

    /// PRINT: append the payload to the spool.
    fn print(&mut self, cdb: &[u8], outdata: Option<&[u8]>) -> Result<UnitCmdResult> {
        let length = (usize::from(cdb[2]) << 16) | (usize::from(cdb[3]) << 8) | usize::from(cdb[4]);
        if length == 0 {
            return Ok(UnitCmdResult::Status(StatusCode::Good));
        }

        let Some(data) = outdata else {
            return Ok(UnitCmdResult::DataOut(length));
        };

        match self.spool_file().and_then(|f| f.write_all(data)) {
            Ok(()) => Ok(UnitCmdResult::Status(StatusCode::Good)),
            Err(e) => {
                log::error!("Spool write failed: {}", e);
                self.discard_spool();
                self.core
                    .set_sense(SenseKey::AbortedCommand, super::sense::ASC_WRITE_FAULT);
                Ok(UnitCmdResult::Status(StatusCode::CheckCondition))
            }
        }
    }

    /// SYNCHRONIZE BUFFER: hand the spool to the host print command.
    fn synchronize_buffer(&mut self) -> Result<UnitCmdResult> {
        let Some((path, file)) = self.spool.take() else {
            self.core
                .set_sense(SenseKey::IllegalRequest, ASC_INVALID_FIELD_IN_CDB);
            return Ok(UnitCmdResult::Status(StatusCode::CheckCondition));
        };
        drop(file);

        let cmd = self.print_cmd.replace("%f", &path.to_string_lossy());
        log::info!("Printing spool: {}", cmd);

        let result = Command::new("sh").arg("-c").arg(&cmd).status();
        let _ = std::fs::remove_file(&path);

        match result {
            Ok(status) if status.success() => Ok(UnitCmdResult::Status(StatusCode::Good)),
            Ok(status) => {
                log::error!("Print command exited with {}", status);
                self.core
                    .set_sense(SenseKey::AbortedCommand, super::sense::ASC_NO_ADDITIONAL_SENSE);
                Ok(UnitCmdResult::Status(StatusCode::CheckCondition))
            }
            Err(e) => {
                log::error!("Print command failed to start: {}", e);
                self.core
                    .set_sense(SenseKey::AbortedCommand, super::sense::ASC_NO_ADDITIONAL_SENSE);
                Ok(UnitCmdResult::Status(StatusCode::CheckCondition))
            }
        }
    }

    fn discard_spool(&mut self) {
        if let Some((path, file)) = self.spool.take() {
            drop(file);
            let _ = std::fs::remove_file(&path);
        }
    }
}

impl LogicalUnit for ScsiPrinter {
    fn core(&self) -> &UnitCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut UnitCore {
        &mut self.core
    }

    fn overrides_common(&self, opcode: u8) -> bool {
        // WRITE(6) is PRINT, START STOP is STOP PRINT
        matches!(opcode, 0x0A | 0x1B)
    }

    fn specific_cmd(&mut self, cdb: &[u8], outdata: Option<&[u8]>) -> Result<UnitCmdResult> {
        match cdb[0] {
            // PRINT
            0x0A => self.print(cdb, outdata),
            // SYNCHRONIZE BUFFER
            0x10 => self.synchronize_buffer(),
            // STOP PRINT: abandon the current job
            0x1B => {
                self.discard_spool();
                Ok(UnitCmdResult::Status(StatusCode::Good))
            }
            _ => unknown_opcode(self, cdb[0]),
        }
    }
}

impl Drop for ScsiPrinter {
    fn drop(&mut self) {
        self.discard_spool();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn always_ready() {
        let mut lp = ScsiPrinter::new(6, 0);
        let res = lp.cmd(&[0x00, 0, 0, 0, 0, 0], None).unwrap();
        assert!(matches!(res, UnitCmdResult::Status(StatusCode::Good)));
    }

    #[test]
    fn print_requests_data_then_spools() {
        let mut lp = ScsiPrinter::new(6, 0);

        let res = lp.cmd(&[0x0A, 0, 0, 0, 16, 0], None).unwrap();
        let UnitCmdResult::DataOut(expect) = res else {
            panic!("expected dataout");
        };
        assert_eq!(expect, 16);

        let res = lp.cmd(&[0x0A, 0, 0, 0, 16, 0], Some(b"%!PS sixteen by.")).unwrap();
        assert!(matches!(res, UnitCmdResult::Status(StatusCode::Good)));
        assert!(lp.spool.is_some());

        // STOP PRINT abandons the spool
        lp.cmd(&[0x1B, 0, 0, 0, 0, 0], None).unwrap();
        assert!(lp.spool.is_none());
    }

    #[test]
    fn synchronize_without_job_is_rejected() {
        let mut lp = ScsiPrinter::new(6, 0);
        let res = lp.cmd(&[0x10, 0, 0, 0, 0, 0], None).unwrap();
        assert!(matches!(
            res,
            UnitCmdResult::Status(StatusCode::CheckCondition)
        ));
        assert_eq!(lp.core().sense.key, SenseKey::IllegalRequest);
    }

    #[test]
    fn synchronize_runs_print_command() {
        let mut lp = ScsiPrinter::new(6, 0);
        // A print command that just consumes the file
        lp.set_print_cmd("cat %f > /dev/null");

        lp.cmd(&[0x0A, 0, 0, 0, 5, 0], Some(b"hello")).unwrap();
        let res = lp.cmd(&[0x10, 0, 0, 0, 0, 0], None).unwrap();
        assert!(matches!(res, UnitCmdResult::Status(StatusCode::Good)));
        assert!(lp.spool.is_none());
    }

    #[test]
    fn reserve_release_succeed() {
        let mut lp = ScsiPrinter::new(6, 0);
        for op in [0x16u8, 0x17] {
            let res = lp.cmd(&[op, 0, 0, 0, 0, 0], None).unwrap();
            assert!(matches!(res, UnitCmdResult::Status(StatusCode::Good)));
        }
    }

    #[test]
    fn send_diagnostic_needs_selftest() {
        let mut lp = ScsiPrinter::new(6, 0);
        let res = lp.cmd(&[0x1D, 0x04, 0, 0, 0, 0], None).unwrap();
        assert!(matches!(res, UnitCmdResult::Status(StatusCode::Good)));

        let res = lp.cmd(&[0x1D, 0x00, 0, 0, 0, 0], None).unwrap();
        assert!(matches!(
            res,
            UnitCmdResult::Status(StatusCode::CheckCondition)
        ));
    }
}
