//! Byte handshake engine over a GPIO pin driver
//!
//! Target-side handshakes drive REQ and sample against ACK; initiator-side
//! handshakes drive ACK against REQ and re-classify the phase on every
//! byte. Each REQ/ACK pair runs with kernel interrupts masked; the scoped
//! guard restores them on every exit path.

use std::time::{Duration, Instant};

use anyhow::Result;

use super::{
    cdb_len, BusMode, BusPhase, DataSample, ScsiBus, Signal, ACSI_PREFIX, BUS_SETTLE_DELAY_NS,
    HANDSHAKE_TIMEOUT, SEND_DATA_PACING_NS,
};
use crate::hal::irq::IrqController;
use crate::hal::systimer::SysTimer;
use crate::hal::{PinDriver, SelEvent};

pub struct GpioBus<P: PinDriver> {
    pins: P,
    timer: SysTimer,
    mode: BusMode,
}

impl<P: PinDriver> GpioBus<P> {
    pub fn new(pins: P, timer: SysTimer, mode: BusMode) -> Self {
        let mut bus = Self { pins, timer, mode };
        bus.release();
        bus
    }

    pub const fn mode(&self) -> BusMode {
        self.mode
    }

    /// Post-sample settle time. Strict compliance trusts the initiator's
    /// deskew instead.
    fn settle_delay(&self) {
        if !cfg!(feature = "compliant_handshake") {
            self.timer.sleep_ns(BUS_SETTLE_DELAY_NS);
        }
    }

    /// One target-side REQ/ACK byte receive. Returns the sampled byte, or
    /// None when the initiator never completed the ACK transition.
    fn recv_byte(&mut self) -> Option<u8> {
        self.pins.set(Signal::Req, true);
        let ack = self.wait_signal(Signal::Ack, true);

        self.settle_delay();
        self.pins.acquire();
        let byte = self.pins.dat();

        self.pins.set(Signal::Req, false);
        if !ack || !self.wait_signal(Signal::Ack, false) {
            return None;
        }
        Some(byte)
    }

    /// One target-side REQ/ACK byte send.
    fn send_byte(&mut self, byte: u8) -> bool {
        self.pins.set_dat(byte);

        if !self.wait_signal(Signal::Ack, false) {
            return false;
        }

        self.pins.set(Signal::Req, true);
        let ack = self.wait_signal(Signal::Ack, true);
        self.pins.set(Signal::Req, false);

        ack
    }
}

impl<P: PinDriver> ScsiBus for GpioBus<P> {
    fn acquire(&mut self) -> DataSample {
        let raw = self.pins.acquire();
        DataSample {
            raw,
            timestamp: self.timer.now_ns(),
            bsy: self.pins.get(Signal::Bsy),
            sel: self.pins.get(Signal::Sel),
            atn: self.pins.get(Signal::Atn),
            ack: self.pins.get(Signal::Ack),
            rst: self.pins.get(Signal::Rst),
            msg: self.pins.get(Signal::Msg),
            cd: self.pins.get(Signal::Cd),
            io: self.pins.get(Signal::Io),
            req: self.pins.get(Signal::Req),
            dp: self.pins.dp(),
            dat: self.pins.dat(),
        }
    }

    fn get_signal(&self, sig: Signal) -> bool {
        self.pins.get(sig)
    }

    fn set_signal(&mut self, sig: Signal, asserted: bool) {
        self.pins.set(sig, asserted);
    }

    fn set_dat(&mut self, dat: u8) {
        self.pins.set_dat(dat);
    }

    fn set_dat_direction(&mut self, output: bool) {
        self.pins.set_dat_direction(output);
    }

    fn release(&mut self) {
        self.pins.release_all();
    }

    fn wait_event_select(&mut self, timeout: Option<Duration>) -> Result<SelEvent> {
        self.pins.wait_event_select(timeout)
    }

    fn wait_signal(&mut self, sig: Signal, asserted: bool) -> bool {
        let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
        loop {
            self.pins.acquire();
            if self.pins.get(sig) == asserted {
                return true;
            }
            // A reset aborts any wait
            if self.pins.get(Signal::Rst) {
                return false;
            }
            if Instant::now() >= deadline {
                return false;
            }
        }
    }

    fn command_handshake(&mut self, cdb: &mut [u8; 16]) -> usize {
        debug_assert_eq!(self.mode, BusMode::Target);

        let irq = self.pins.irq();
        let _guard = irq.disable();

        let Some(first) = self.recv_byte() else {
            return 0;
        };
        cdb[0] = first;

        // ICD-aware Atari host adapters prepend $1F to reach the full
        // command set; take the real opcode from the next byte.
        if cdb[0] == ACSI_PREFIX {
            let Some(opcode) = self.recv_byte() else {
                return 0;
            };
            cdb[0] = opcode;
        }

        let count = cdb_len(cdb[0]);
        if count == 0 {
            // Unknown opcode
            return 0;
        }

        let mut received = 1;
        while received < count {
            match self.recv_byte() {
                Some(b) => cdb[received] = b,
                None => break,
            }
            received += 1;
        }
        received
    }

    fn receive_handshake(&mut self, buf: &mut [u8]) -> usize {
        let irq = self.pins.irq();
        let _guard = irq.disable();

        let mut received = 0;

        if self.mode == BusMode::Target {
            for slot in &mut *buf {
                match self.recv_byte() {
                    Some(b) => *slot = b,
                    None => break,
                }
                received += 1;
            }
        } else {
            let phase = self.acquire().phase();
            for slot in &mut *buf {
                if !self.wait_signal(Signal::Req, true) {
                    break;
                }
                if self.acquire().phase() != phase {
                    break;
                }

                self.settle_delay();
                self.pins.acquire();
                *slot = self.pins.dat();

                self.pins.set(Signal::Ack, true);
                let req = self.wait_signal(Signal::Req, false);
                self.pins.set(Signal::Ack, false);

                if !req || self.acquire().phase() != phase {
                    break;
                }
                received += 1;
            }
        }

        received
    }

    fn send_handshake(&mut self, buf: &[u8], pace_after: Option<usize>) -> usize {
        let irq = self.pins.irq();
        let mut guard = Some(irq.disable());

        let mut sent = 0;

        if self.mode == BusMode::Target {
            for &byte in buf {
                if pace_after == Some(sent) && sent != 0 {
                    // Let the kernel breathe while the host adapter
                    // catches up
                    guard.take();
                    self.timer.sleep_ns(SEND_DATA_PACING_NS);
                    guard = Some(irq.disable());
                }

                if !self.send_byte(byte) {
                    break;
                }
                sent += 1;
            }

            self.wait_signal(Signal::Ack, false);
        } else {
            let phase = self.acquire().phase();
            for (i, &byte) in buf.iter().enumerate() {
                self.pins.set_dat(byte);

                if !self.wait_signal(Signal::Req, true) {
                    break;
                }

                // Drop ATN along with the final MESSAGE OUT byte
                if phase == BusPhase::MsgOut && i == buf.len() - 1 {
                    self.pins.set(Signal::Atn, false);
                }

                if self.acquire().phase() != phase {
                    break;
                }

                self.pins.set(Signal::Ack, true);
                let req = self.wait_signal(Signal::Req, false);
                self.pins.set(Signal::Ack, false);

                if !req || self.acquire().phase() != phase {
                    break;
                }
                sent += 1;
            }
        }

        drop(guard);
        sent
    }

    fn irq(&self) -> IrqController {
        self.pins.irq()
    }
}
