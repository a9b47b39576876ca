//! Soft bus: an in-memory scripted initiator
//!
//! Stands in for the GPIO attachment when no bus hardware is present.
//! The script plays the initiator side: selection, message bytes, a CDB
//! and DataOut payloads are queued up front, and everything the target
//! sends is recorded per phase. Controller behavior is exercised against
//! this; it makes no real-time guarantees.

use std::collections::VecDeque;
use std::time::Duration;

use anyhow::Result;

use super::{cdb_len, BusPhase, DataSample, ScsiBus, Signal, ACSI_PREFIX};
use crate::hal::irq::IrqController;
use crate::hal::SelEvent;

#[derive(Default)]
pub struct SoftBus {
    // Signal levels as seen on the bus
    bsy: bool,
    sel: bool,
    atn: bool,
    rst: bool,
    msg: bool,
    cd: bool,
    io: bool,
    dat: u8,
    dp: bool,
    dat_output: bool,

    // Scripted initiator
    command: VecDeque<u8>,
    msg_out: VecDeque<u8>,
    data_out: VecDeque<u8>,
    /// Assert RST after this many DataOut bytes have been handshaked
    rst_after_data: Option<usize>,
    data_handshaked: usize,

    /// Everything the target sent, per phase
    sent: Vec<(BusPhase, Vec<u8>)>,

    timestamp: u64,
    irq: Option<IrqController>,
}

impl SoftBus {
    pub fn new() -> Self {
        Self {
            irq: Some(IrqController::noop()),
            ..Default::default()
        }
    }

    /// Script a selection: the initiator drives its own ID and the
    /// target's ID onto DAT and raises SEL (plus ATN when it has a
    /// message to send). Leftovers from a previous, possibly truncated
    /// command are discarded.
    pub fn select(&mut self, initiator_id: u8, target_id: u8, atn: bool) {
        self.command.clear();
        self.msg_out.clear();
        self.data_out.clear();
        self.rst_after_data = None;
        self.data_handshaked = 0;

        self.sel = true;
        self.bsy = false;
        self.atn = atn;
        self.dat = (1 << initiator_id) | (1 << target_id);
        self.dp = self.dat.count_ones() % 2 == 0;
    }

    pub fn queue_message_out(&mut self, bytes: &[u8]) {
        self.msg_out.extend(bytes);
    }

    pub fn queue_command(&mut self, cdb: &[u8]) {
        self.command.extend(cdb);
    }

    pub fn queue_data_out(&mut self, bytes: &[u8]) {
        self.data_out.extend(bytes);
    }

    pub fn rst_after_data_bytes(&mut self, n: usize) {
        self.rst_after_data = Some(n);
    }

    pub fn assert_rst(&mut self) {
        self.rst = true;
    }

    pub fn clear_rst(&mut self) {
        self.rst = false;
    }

    /// Concatenated bytes the target sent during `phase`.
    pub fn sent(&self, phase: BusPhase) -> Vec<u8> {
        self.sent
            .iter()
            .filter(|(p, _)| *p == phase)
            .flat_map(|(_, b)| b.iter().copied())
            .collect()
    }

    /// The status byte of the most recent Status phase, if any.
    pub fn last_status(&self) -> Option<u8> {
        self.sent
            .iter()
            .rev()
            .find(|(p, _)| *p == BusPhase::Status)
            .and_then(|(_, b)| b.first().copied())
    }

    pub fn clear_log(&mut self) {
        self.sent.clear();
    }

    const fn current_phase(&self) -> BusPhase {
        let s = self.snapshot();
        s.phase()
    }

    const fn snapshot(&self) -> DataSample {
        DataSample {
            raw: 0,
            timestamp: self.timestamp,
            bsy: self.bsy,
            sel: self.sel,
            atn: self.atn,
            ack: false,
            rst: self.rst,
            msg: self.msg,
            cd: self.cd,
            io: self.io,
            req: false,
            dp: self.dp,
            dat: self.dat,
        }
    }

    fn pop_command_byte(&mut self) -> Option<u8> {
        self.command.pop_front()
    }
}

impl ScsiBus for SoftBus {
    fn acquire(&mut self) -> DataSample {
        self.timestamp += 1;
        self.snapshot()
    }

    fn get_signal(&self, sig: Signal) -> bool {
        match sig {
            Signal::Bsy => self.bsy,
            Signal::Sel => self.sel,
            Signal::Atn => self.atn,
            Signal::Ack => false,
            Signal::Rst => self.rst,
            Signal::Msg => self.msg,
            Signal::Cd => self.cd,
            Signal::Io => self.io,
            Signal::Req => false,
            Signal::Dp => self.dp,
        }
    }

    fn set_signal(&mut self, sig: Signal, asserted: bool) {
        match sig {
            Signal::Bsy => {
                self.bsy = asserted;
                // The initiator releases SEL once the target responds
                if asserted && self.sel {
                    self.sel = false;
                }
            }
            Signal::Msg => self.msg = asserted,
            Signal::Cd => self.cd = asserted,
            Signal::Io => self.io = asserted,
            Signal::Atn => self.atn = asserted,
            Signal::Rst => self.rst = asserted,
            // REQ/ACK timing is collapsed into the handshake calls
            Signal::Req | Signal::Ack | Signal::Sel | Signal::Dp => (),
        }
    }

    fn set_dat(&mut self, dat: u8) {
        self.dat = dat;
        self.dp = dat.count_ones() % 2 == 0;
    }

    fn set_dat_direction(&mut self, output: bool) {
        self.dat_output = output;
    }

    fn release(&mut self) {
        self.bsy = false;
        self.msg = false;
        self.cd = false;
        self.io = false;
        self.dat_output = false;
    }

    fn wait_event_select(&mut self, _timeout: Option<Duration>) -> Result<SelEvent> {
        Ok(if self.sel {
            SelEvent::Edge
        } else {
            SelEvent::Timeout
        })
    }

    fn wait_signal(&mut self, sig: Signal, asserted: bool) -> bool {
        if self.rst && sig != Signal::Rst {
            return false;
        }
        self.get_signal(sig) == asserted
    }

    fn command_handshake(&mut self, cdb: &mut [u8; 16]) -> usize {
        let Some(mut first) = self.pop_command_byte() else {
            return 0;
        };
        if first == ACSI_PREFIX {
            match self.pop_command_byte() {
                Some(b) => first = b,
                None => return 0,
            }
        }
        cdb[0] = first;

        let count = cdb_len(cdb[0]);
        if count == 0 {
            return 0;
        }

        let mut received = 1;
        while received < count {
            match self.pop_command_byte() {
                Some(b) => cdb[received] = b,
                None => break,
            }
            received += 1;
        }
        received
    }

    fn receive_handshake(&mut self, buf: &mut [u8]) -> usize {
        let phase = self.current_phase();
        let mut received = 0;

        for slot in &mut *buf {
            if self.rst {
                break;
            }
            let byte = match phase {
                BusPhase::MsgOut => {
                    let b = self.msg_out.pop_front();
                    // The initiator keeps ATN until its last message byte
                    if self.msg_out.is_empty() {
                        self.atn = false;
                    }
                    b
                }
                _ => {
                    if self.rst_after_data == Some(self.data_handshaked) {
                        self.rst = true;
                        break;
                    }
                    let b = self.data_out.pop_front();
                    if b.is_some() {
                        self.data_handshaked += 1;
                    }
                    b
                }
            };
            match byte {
                Some(b) => *slot = b,
                None => break,
            }
            received += 1;
        }
        received
    }

    fn send_handshake(&mut self, buf: &[u8], _pace_after: Option<usize>) -> usize {
        if self.rst {
            return 0;
        }
        let phase = self.current_phase();
        self.sent.push((phase, buf.to_vec()));
        buf.len()
    }

    fn irq(&self) -> IrqController {
        self.irq.clone().unwrap_or_else(IrqController::noop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_sets_id_bits() {
        let mut bus = SoftBus::new();
        bus.select(7, 2, false);
        let s = bus.acquire();
        assert_eq!(s.phase(), BusPhase::Selection);
        assert_eq!(s.dat, 0b1000_0100);
        assert!(s.parity_ok());
    }

    #[test]
    fn bsy_response_clears_sel() {
        let mut bus = SoftBus::new();
        bus.select(7, 2, false);
        bus.set_signal(Signal::Bsy, true);
        assert!(!bus.get_signal(Signal::Sel));
        assert!(bus.get_signal(Signal::Bsy));
    }

    #[test]
    fn command_handshake_strips_acsi_prefix() {
        let mut bus = SoftBus::new();
        bus.queue_command(&[ACSI_PREFIX, 0x12, 0x00, 0x00, 0x00, 0xFF, 0x00]);
        let mut cdb = [0u8; 16];
        let n = bus.command_handshake(&mut cdb);
        assert_eq!(n, 6);
        assert_eq!(cdb[0], 0x12);
        assert_eq!(cdb[4], 0xFF);
    }

    #[test]
    fn command_handshake_unknown_opcode() {
        let mut bus = SoftBus::new();
        bus.queue_command(&[0xFF, 0, 0, 0, 0, 0]);
        let mut cdb = [0u8; 16];
        assert_eq!(bus.command_handshake(&mut cdb), 0);
    }
}
