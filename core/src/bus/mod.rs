//! SCSI bus: signals, phases, byte handshakes
//!
//! The bus layer is deliberately infallible: handshakes report how many
//! bytes actually moved and the controller decides what a short transfer
//! means. Only RST carries hard failure semantics, and that surfaces as a
//! phase observation, not an error value.

pub mod gpio;
pub mod soft;

use std::time::Duration;

use anyhow::Result;
use num_derive::{FromPrimitive, ToPrimitive};

use crate::hal::irq::IrqController;
use crate::hal::SelEvent;

/// Named SCSI control signals. DAT and its parity line are handled as a
/// byte, not per-signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::IntoStaticStr)]
pub enum Signal {
    Bsy,
    Sel,
    Atn,
    Ack,
    Rst,
    Msg,
    Cd,
    Io,
    Req,
    Dp,
}

/// SCSI bus phases
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::IntoStaticStr, strum::Display)]
pub enum BusPhase {
    BusFree,
    Arbitration,
    Selection,
    Reselection,
    Command,
    /// Target -> Initiator
    DataIn,
    /// Initiator -> Target
    DataOut,
    Status,
    MsgIn,
    MsgOut,
    /// Fault indicator, never a stable operating state
    Reserved,
}

/// Phase decode for a busy bus, indexed by (MSG, C/D, I/O) packed MSB
/// first into three bits.
///
/// |MSG|C/D|I/O| Phase
/// | 0 | 0 | 0 | DATA OUT
/// | 0 | 0 | 1 | DATA IN
/// | 0 | 1 | 0 | COMMAND
/// | 0 | 1 | 1 | STATUS
/// | 1 | 0 | 0 | RESERVED
/// | 1 | 0 | 1 | RESERVED
/// | 1 | 1 | 0 | MESSAGE OUT
/// | 1 | 1 | 1 | MESSAGE IN
pub const PHASE_TABLE: [BusPhase; 8] = [
    BusPhase::DataOut,
    BusPhase::DataIn,
    BusPhase::Command,
    BusPhase::Status,
    BusPhase::Reserved,
    BusPhase::Reserved,
    BusPhase::MsgOut,
    BusPhase::MsgIn,
];

/// Bus operation modes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusMode {
    Target,
    Initiator,
    Monitor,
}

/// Status bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum StatusCode {
    Good = 0x00,
    CheckCondition = 0x02,
    Busy = 0x08,
    ReservationConflict = 0x18,
}

// Message bytes
pub const MSG_COMMAND_COMPLETE: u8 = 0x00;
pub const MSG_ABORT: u8 = 0x06;
pub const MSG_REJECT: u8 = 0x07;
pub const MSG_NO_OPERATION: u8 = 0x08;
pub const MSG_BUS_DEVICE_RESET: u8 = 0x0C;
pub const MSG_IDENTIFY: u8 = 0x80;

/// Bus settle time inserted after DAT is sampled, unless strict compliance
/// is selected
pub const BUS_SETTLE_DELAY_NS: u64 = 400;

/// Post-byte pacing for host adapters that cannot keep up with
/// back-to-back DataIn bytes (DaynaPort driver)
pub const SEND_DATA_PACING_NS: u64 = 100_000;

/// How long a handshake waits for the other side before truncating
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);

/// The ACSI prefix byte: ICD-aware Atari host adapters prepend $1F to the
/// CDB to reach the full SCSI command set; it is stripped before dispatch.
pub const ACSI_PREFIX: u8 = 0x1F;

/// CDB length for an opcode, by command group.
///
/// The four architected groups map to fixed lengths; the reserved gap
/// (0x7E..0x7F) and the vendor range (0xC0..) classify as unknown (0),
/// which the controller answers with CHECK CONDITION.
pub const fn cdb_len(opcode: u8) -> usize {
    match opcode {
        0x00..=0x1F => 6,
        0x20..=0x7D => 10,
        0x7E | 0x7F => 0,
        0x80..=0x9F => 16,
        0xA0..=0xBF => 12,
        _ => 0,
    }
}

/// One atomic observation of all eleven signal lines plus the data byte.
///
/// Every field is decoded from a single pin register read, so no line can
/// be seen partially updated relative to another.
#[derive(Debug, Clone, Copy, Default)]
pub struct DataSample {
    pub raw: u32,
    pub timestamp: u64,
    pub bsy: bool,
    pub sel: bool,
    pub atn: bool,
    pub ack: bool,
    pub rst: bool,
    pub msg: bool,
    pub cd: bool,
    pub io: bool,
    pub req: bool,
    pub dp: bool,
    pub dat: u8,
}

impl DataSample {
    /// Classify the bus phase. Total over all signal combinations.
    pub const fn phase(&self) -> BusPhase {
        if self.sel {
            return BusPhase::Selection;
        }
        if !self.bsy {
            return BusPhase::BusFree;
        }

        let mci = ((self.msg as usize) << 2) | ((self.cd as usize) << 1) | (self.io as usize);
        PHASE_TABLE[mci]
    }

    /// True when DAT plus DP carry an odd number of ones.
    pub const fn parity_ok(&self) -> bool {
        (self.dat.count_ones() + self.dp as u32) % 2 == 1
    }
}

/// A physical or simulated SCSI bus attachment.
///
/// Handshakes return the number of bytes actually transferred; partial
/// transfers are not retried here.
pub trait ScsiBus: Send {
    /// Latch a fresh snapshot of all signals.
    fn acquire(&mut self) -> DataSample;

    /// Signal state from the last snapshot.
    fn get_signal(&self, sig: Signal) -> bool;

    /// Drive or release one of our output signals.
    fn set_signal(&mut self, sig: Signal, asserted: bool);

    /// Drive the data lines (parity included).
    fn set_dat(&mut self, dat: u8);

    /// Turn the data transceivers around.
    fn set_dat_direction(&mut self, output: bool);

    /// Release every driven signal.
    fn release(&mut self);

    /// Classify the current phase from a fresh snapshot.
    fn phase(&mut self) -> BusPhase {
        self.acquire().phase()
    }

    /// Block until SEL transitions or the timeout elapses.
    fn wait_event_select(&mut self, timeout: Option<Duration>) -> Result<SelEvent>;

    /// Poll until `sig` reaches `asserted`. Gives up after
    /// [`HANDSHAKE_TIMEOUT`] or when RST is observed; returns whether the
    /// signal reached the requested state.
    fn wait_signal(&mut self, sig: Signal, asserted: bool) -> bool;

    /// Target side: receive a complete CDB during the Command phase.
    /// Returns the number of bytes received, 0 for unknown opcodes.
    fn command_handshake(&mut self, cdb: &mut [u8; 16]) -> usize;

    /// Receive `buf.len()` bytes (DataOut / MsgOut side).
    fn receive_handshake(&mut self, buf: &mut [u8]) -> usize;

    /// Send `buf` (DataIn / MsgIn / Status side). `pace_after` inserts the
    /// DaynaPort pacing delay once that many bytes have been sent.
    fn send_handshake(&mut self, buf: &[u8], pace_after: Option<usize>) -> usize;

    /// Interrupt masking handle, also used by balance audits.
    fn irq(&self) -> IrqController;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(bsy: bool, sel: bool, msg: bool, cd: bool, io: bool) -> DataSample {
        DataSample {
            bsy,
            sel,
            msg,
            cd,
            io,
            ..Default::default()
        }
    }

    #[test]
    fn phase_selection_beats_everything() {
        for bits in 0..0b1000 {
            let s = sample(true, true, bits & 4 != 0, bits & 2 != 0, bits & 1 != 0);
            assert_eq!(s.phase(), BusPhase::Selection);
        }
    }

    #[test]
    fn phase_busfree_when_idle() {
        assert_eq!(sample(false, false, false, false, false).phase(), BusPhase::BusFree);
        // MCI lines are ignored without BSY
        assert_eq!(sample(false, false, true, true, true).phase(), BusPhase::BusFree);
    }

    #[test]
    fn phase_table_is_total() {
        let expect = [
            BusPhase::DataOut,
            BusPhase::DataIn,
            BusPhase::Command,
            BusPhase::Status,
            BusPhase::Reserved,
            BusPhase::Reserved,
            BusPhase::MsgOut,
            BusPhase::MsgIn,
        ];
        for mci in 0..8usize {
            let s = sample(true, false, mci & 4 != 0, mci & 2 != 0, mci & 1 != 0);
            assert_eq!(s.phase(), expect[mci], "mci = {mci:03b}");
        }
    }

    #[test]
    fn cdb_len_covers_every_opcode() {
        for op in 0..=255u8 {
            let len = cdb_len(op);
            match op {
                0x00..=0x1F => assert_eq!(len, 6),
                0x20..=0x7D => assert_eq!(len, 10),
                0x80..=0x9F => assert_eq!(len, 16),
                0xA0..=0xBF => assert_eq!(len, 12),
                _ => assert_eq!(len, 0, "opcode {op:02X} must classify unknown"),
            }
            assert!(matches!(len, 0 | 6 | 10 | 12 | 16));
        }
    }

    #[test]
    fn parity_is_odd() {
        let mut s = DataSample::default();
        s.dat = 0x00;
        s.dp = true;
        assert!(s.parity_ok());
        s.dat = 0x01;
        s.dp = false;
        assert!(s.parity_ok());
        s.dat = 0x03;
        s.dp = false;
        assert!(!s.parity_ok());
    }
}
