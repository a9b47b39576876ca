//! DaynaPort SCSI/Link Ethernet adapter
//!
//! READ(6) and WRITE(6) are repurposed by the DaynaPort protocol as
//! packet retrieve/send. Frames cross to the host side over a bounded
//! channel pair so the reactor never blocks on the network. The driver
//! needs a pause after the 6-byte read header before the payload bytes
//! arrive; that is the bus layer's pacing delay.

use anyhow::Result;
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use rand::Rng;

use super::sense::{SenseKey, ASC_INVALID_FIELD_IN_CDB};
use super::{unknown_opcode, DeviceClass, LogicalUnit, UnitCmdResult, UnitCore};
use crate::bus::StatusCode;

/// Maximum packets buffered in each direction
const PACKET_QUEUE_SIZE: usize = 512;

/// Maximum Ethernet frame accepted
const ETH_FRAME_MAX: usize = 1514;

/// Length/flags header preceding each retrieved packet
const READ_HEADER_SIZE: usize = 6;

#[derive(Default)]
struct LinkStats {
    frame_alignment_errors: u32,
    crc_errors: u32,
    frames_lost: u32,
}

pub struct ScsiDaynaPort {
    core: UnitCore,
    mac: [u8; 6],
    enabled: bool,
    /// Emulator -> host tap
    tx: Option<Sender<Vec<u8>>>,
    /// Host tap -> emulator
    rx: Option<Receiver<Vec<u8>>>,
    stats: LinkStats,
}

impl ScsiDaynaPort {
    pub fn new(id: u8, lun: u8) -> Self {
        let mut core = UnitCore::new(DeviceClass::Dp, id, lun);
        core.vendor = "Dayna".into();
        core.product = "SCSI/Link".into();
        core.revision = "1.4a".into();

        let mut rng = rand::rng();
        Self {
            core,
            mac: [0x00, 0x80, 0x19, rng.random(), rng.random(), rng.random()],
            enabled: false,
            tx: None,
            rx: None,
            stats: LinkStats::default(),
        }
    }

    pub const fn mac_address(&self) -> [u8; 6] {
        self.mac
    }

    /// Wire the adapter to a host-side tap. Returns the tap's handles:
    /// a sender for frames destined to the initiator and a receiver for
    /// frames the initiator transmits.
    pub fn connect(&mut self) -> (Sender<Vec<u8>>, Receiver<Vec<u8>>) {
        let (host_tx, emu_rx) = crossbeam_channel::bounded(PACKET_QUEUE_SIZE);
        let (emu_tx, host_rx) = crossbeam_channel::bounded(PACKET_QUEUE_SIZE);
        self.rx = Some(emu_rx);
        self.tx = Some(emu_tx);
        (host_tx, host_rx)
    }

    /// READ(6): poll for one received frame.
    fn read_packet(&mut self, cdb: &[u8]) -> Result<UnitCmdResult> {
        let requested = usize::from(u16::from_be_bytes([cdb[3], cdb[4]]));

        let empty_header = || UnitCmdResult::DataIn(vec![0u8; READ_HEADER_SIZE]);
        if !self.enabled || requested < READ_HEADER_SIZE {
            return Ok(empty_header());
        }

        let packet = match self.rx.as_ref().map(Receiver::try_recv) {
            Some(Ok(p)) => p,
            Some(Err(TryRecvError::Empty)) | None => return Ok(empty_header()),
            Some(Err(TryRecvError::Disconnected)) => {
                log::warn!("DaynaPort tap disconnected");
                return Ok(empty_header());
            }
        };

        if packet.len() > ETH_FRAME_MAX {
            self.stats.frames_lost += 1;
            return Ok(empty_header());
        }

        let more = self.rx.as_ref().is_some_and(|rx| !rx.is_empty());

        let mut data = Vec::with_capacity(READ_HEADER_SIZE + packet.len());
        data.extend_from_slice(&(packet.len() as u16).to_be_bytes());
        data.extend_from_slice(&[0, 0, 0, if more { 0x10 } else { 0x00 }]);
        data.extend_from_slice(&packet);
        Ok(UnitCmdResult::DataIn(data))
    }

    /// WRITE(6): transmit one frame. Format 0x80 appends a four byte
    /// trailer per frame which is stripped before transmission.
    fn write_packet(&mut self, cdb: &[u8], outdata: Option<&[u8]>) -> Result<UnitCmdResult> {
        let length = usize::from(u16::from_be_bytes([cdb[3], cdb[4]]));
        let format = cdb[5];
        let expect = match format {
            0x00 => length,
            0x80 => length + 4,
            _ => {
                self.core
                    .set_sense(SenseKey::IllegalRequest, ASC_INVALID_FIELD_IN_CDB);
                return Ok(UnitCmdResult::Status(StatusCode::CheckCondition));
            }
        };

        let Some(data) = outdata else {
            return Ok(UnitCmdResult::DataOut(expect));
        };

        let frame = &data[..length.min(data.len())];
        if self.enabled {
            if let Some(tx) = &self.tx {
                if tx.try_send(frame.to_vec()).is_err() {
                    self.stats.frames_lost += 1;
                }
            }
        }
        Ok(UnitCmdResult::Status(StatusCode::Good))
    }

    /// RETRIEVE STATISTICS: MAC address plus three error counters.
    fn retrieve_statistics(&mut self, cdb: &[u8]) -> Result<UnitCmdResult> {
        let allocation = usize::from(cdb[4]);

        let mut data = Vec::with_capacity(18);
        data.extend_from_slice(&self.mac);
        data.extend_from_slice(&self.stats.frame_alignment_errors.to_be_bytes());
        data.extend_from_slice(&self.stats.crc_errors.to_be_bytes());
        data.extend_from_slice(&self.stats.frames_lost.to_be_bytes());
        data.truncate(allocation);
        Ok(UnitCmdResult::DataIn(data))
    }

    /// SET INTERFACE MODE: only the MAC change subfunction is carried.
    fn set_interface_mode(&mut self, cdb: &[u8], outdata: Option<&[u8]>) -> Result<UnitCmdResult> {
        match cdb[5] {
            0x04 => {
                let Some(data) = outdata else {
                    return Ok(UnitCmdResult::DataOut(6));
                };
                if data.len() >= 6 {
                    self.mac.copy_from_slice(&data[..6]);
                    log::info!("DaynaPort MAC set to {:02X?}", self.mac);
                }
                Ok(UnitCmdResult::Status(StatusCode::Good))
            }
            mode => {
                log::debug!("Ignoring SET INTERFACE MODE subfunction {mode:02X}");
                Ok(UnitCmdResult::Status(StatusCode::Good))
            }
        }
    }

    /// ENABLE/DISABLE INTERFACE.
    fn enable_interface(&mut self, cdb: &[u8]) -> Result<UnitCmdResult> {
        self.enabled = cdb[5] & 0x80 != 0;
        if self.enabled {
            // Drop frames that queued up while the interface was down
            if let Some(rx) = &self.rx {
                while rx.try_recv().is_ok() {}
            }
        }
        log::info!(
            "DaynaPort interface {}",
            if self.enabled { "enabled" } else { "disabled" }
        );
        Ok(UnitCmdResult::Status(StatusCode::Good))
    }
}

impl LogicalUnit for ScsiDaynaPort {
    fn core(&self) -> &UnitCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut UnitCore {
        &mut self.core
    }

    fn overrides_common(&self, opcode: u8) -> bool {
        // READ(6)/WRITE(6) are packet transfer in the DaynaPort protocol
        matches!(opcode, 0x08 | 0x0A)
    }

    fn send_pacing(&self) -> Option<usize> {
        Some(READ_HEADER_SIZE)
    }

    fn specific_cmd(&mut self, cdb: &[u8], outdata: Option<&[u8]>) -> Result<UnitCmdResult> {
        match cdb[0] {
            // READ(6): retrieve packet
            0x08 => self.read_packet(cdb),
            // RETRIEVE STATISTICS
            0x09 => self.retrieve_statistics(cdb),
            // WRITE(6): send packet
            0x0A => self.write_packet(cdb, outdata),
            // SET INTERFACE MODE
            0x0C => self.set_interface_mode(cdb, outdata),
            // ENABLE/DISABLE INTERFACE
            0x0E => self.enable_interface(cdb),
            _ => unknown_opcode(self, cdb[0]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enabled_adapter() -> (ScsiDaynaPort, Sender<Vec<u8>>, Receiver<Vec<u8>>) {
        let mut dp = ScsiDaynaPort::new(4, 0);
        let (host_tx, host_rx) = dp.connect();
        dp.cmd(&[0x0E, 0, 0, 0, 0, 0x80], None).unwrap();
        (dp, host_tx, host_rx)
    }

    #[test]
    fn inquiry_reports_processor_device() {
        let mut dp = ScsiDaynaPort::new(4, 0);
        let UnitCmdResult::DataIn(data) = dp.cmd(&[0x12, 0, 0, 0, 36, 0], None).unwrap() else {
            panic!("expected data");
        };
        assert_eq!(data[0], 0x03);
        assert_eq!(&data[8..13], b"Dayna");
    }

    #[test]
    fn read_empty_queue_returns_bare_header() {
        let (mut dp, _tx, _rx) = enabled_adapter();
        let UnitCmdResult::DataIn(data) = dp.cmd(&[0x08, 0, 0, 0x05, 0xF4, 0], None).unwrap()
        else {
            panic!("expected data");
        };
        assert_eq!(data, vec![0u8; READ_HEADER_SIZE]);
    }

    #[test]
    fn read_returns_queued_packet_with_header() {
        let (mut dp, host_tx, _rx) = enabled_adapter();
        host_tx.send(vec![0xAA; 60]).unwrap();

        let UnitCmdResult::DataIn(data) = dp.cmd(&[0x08, 0, 0, 0x05, 0xF4, 0], None).unwrap()
        else {
            panic!("expected data");
        };
        assert_eq!(&data[0..2], &60u16.to_be_bytes());
        assert_eq!(data[5], 0x00);
        assert_eq!(&data[6..], &[0xAA; 60][..]);
    }

    #[test]
    fn more_packets_flag() {
        let (mut dp, host_tx, _rx) = enabled_adapter();
        host_tx.send(vec![1; 20]).unwrap();
        host_tx.send(vec![2; 20]).unwrap();

        let UnitCmdResult::DataIn(data) = dp.cmd(&[0x08, 0, 0, 0x05, 0xF4, 0], None).unwrap()
        else {
            panic!("expected data");
        };
        assert_eq!(data[5], 0x10);
    }

    #[test]
    fn write_forwards_frame() {
        let (mut dp, _tx, host_rx) = enabled_adapter();

        let frame = vec![0x55u8; 64];
        let res = dp.cmd(&[0x0A, 0, 0, 0, 64, 0], None).unwrap();
        let UnitCmdResult::DataOut(expect) = res else {
            panic!("expected dataout");
        };
        assert_eq!(expect, 64);

        let res = dp.cmd(&[0x0A, 0, 0, 0, 64, 0], Some(&frame)).unwrap();
        assert!(matches!(res, UnitCmdResult::Status(StatusCode::Good)));
        assert_eq!(host_rx.try_recv().unwrap(), frame);
    }

    #[test]
    fn statistics_carry_mac() {
        let (mut dp, _tx, _rx) = enabled_adapter();
        let mac = dp.mac_address();
        let UnitCmdResult::DataIn(data) = dp.cmd(&[0x09, 0, 0, 0, 18, 0], None).unwrap() else {
            panic!("expected data");
        };
        assert_eq!(data.len(), 18);
        assert_eq!(&data[0..6], &mac);
    }

    #[test]
    fn pacing_follows_the_read_header() {
        let dp = ScsiDaynaPort::new(4, 0);
        assert_eq!(dp.send_pacing(), Some(READ_HEADER_SIZE));
    }
}
