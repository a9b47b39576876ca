//! Per-target-ID phase state machine
//!
//! One controller exists per addressed SCSI ID. `process()` is entered
//! when the orchestrator observes a Selection naming this ID and walks
//! the whole phase sequence to BusFree, driving the target side of every
//! handshake. Logical units decide *what* to answer; the controller owns
//! *how* the bytes move.

pub mod orchestrator;

use num_traits::ToPrimitive;

use crate::bus::{
    cdb_len, BusPhase, DataSample, ScsiBus, Signal, StatusCode, MSG_ABORT, MSG_BUS_DEVICE_RESET,
    MSG_COMMAND_COMPLETE, MSG_IDENTIFY, MSG_NO_OPERATION, MSG_REJECT,
};
use crate::targets::sense::{
    SenseKey, ASC_INVALID_COMMAND_OPERATION_CODE, ASC_LOGICAL_UNIT_NOT_SUPPORTED,
};
use crate::targets::{LogicalUnit, TargetUnits, UnitCmdResult};

/// How a command sequence ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    /// Walked to BusFree normally
    Complete,
    /// RST observed; bus released, units attention-latched
    Reset,
    /// Handshake died (initiator gone); bus released
    Abandoned,
}

pub struct Controller {
    target_id: u8,
    phase: BusPhase,
    initiator_id: Option<u8>,
    /// LUN from IDENTIFY, valid for the current selection only
    identify_lun: Option<u8>,
    cdb: [u8; 16],
    status: StatusCode,
    message: u8,
    /// Transfer bookkeeping for the block pump
    blocks_remaining: u32,
    next_block: u64,
    /// One-block transfer buffer, reused across commands
    buffer: Vec<u8>,
}

impl Controller {
    pub fn new(target_id: u8) -> Self {
        Self {
            target_id,
            phase: BusPhase::BusFree,
            initiator_id: None,
            identify_lun: None,
            cdb: [0; 16],
            status: StatusCode::Good,
            message: MSG_COMMAND_COMPLETE,
            blocks_remaining: 0,
            next_block: 0,
            buffer: Vec::new(),
        }
    }

    pub const fn target_id(&self) -> u8 {
        self.target_id
    }

    pub const fn phase(&self) -> BusPhase {
        self.phase
    }

    pub fn initiator_id(&self) -> Option<u8> {
        self.initiator_id
    }

    /// Entry point: a Selection naming this target was observed.
    /// Walks the phase sequence to BusFree.
    pub fn process<B: ScsiBus>(
        &mut self,
        bus: &mut B,
        units: &mut TargetUnits,
        sample: DataSample,
    ) {
        match self.run(bus, units, sample) {
            Outcome::Complete => (),
            Outcome::Reset => {
                log::info!("Target {}: bus reset", self.target_id);
                self.reset(bus, units);
            }
            Outcome::Abandoned => {
                log::warn!("Target {}: initiator abandoned the command", self.target_id);
                self.bus_free(bus);
            }
        }
    }

    /// RST handling: release everything, latch attention on every unit.
    pub fn reset<B: ScsiBus>(&mut self, bus: &mut B, units: &mut TargetUnits) {
        for unit in units.iter_mut() {
            unit.reset();
        }
        self.buffer.clear();
        self.bus_free(bus);
    }

    fn run<B: ScsiBus>(
        &mut self,
        bus: &mut B,
        units: &mut TargetUnits,
        sample: DataSample,
    ) -> Outcome {
        if !self.selection(bus, sample) {
            self.bus_free(bus);
            return Outcome::Abandoned;
        }

        // Message Out precedes Command when the initiator holds ATN
        if bus.acquire().atn {
            match self.msg_out(bus, units) {
                MsgOutcome::Proceed => (),
                MsgOutcome::BusFree => {
                    self.bus_free(bus);
                    return Outcome::Complete;
                }
                MsgOutcome::Reset => return Outcome::Reset,
            }
        }

        match self.command(bus, units) {
            Some(outcome) => return outcome,
            None => (),
        }

        if bus.acquire().rst {
            return Outcome::Reset;
        }

        self.status_phase(bus);
        self.msg_in(bus);
        self.bus_free(bus);
        Outcome::Complete
    }

    /// Respond to selection: latch the initiator ID from the other DAT
    /// bit, assert BSY, wait for SEL to fall.
    fn selection<B: ScsiBus>(&mut self, bus: &mut B, sample: DataSample) -> bool {
        let others = sample.dat & !(1 << self.target_id);
        self.initiator_id = (others != 0).then(|| others.trailing_zeros() as u8);
        self.identify_lun = None;
        self.status = StatusCode::Good;
        self.message = MSG_COMMAND_COMPLETE;
        self.phase = BusPhase::Selection;

        bus.set_signal(Signal::Bsy, true);
        if !bus.wait_signal(Signal::Sel, false) {
            return false;
        }
        true
    }

    fn set_phase_signals<B: ScsiBus>(&mut self, bus: &mut B, phase: BusPhase) {
        self.phase = phase;
        let (msg, cd, io) = match phase {
            BusPhase::DataOut => (false, false, false),
            BusPhase::DataIn => (false, false, true),
            BusPhase::Command => (false, true, false),
            BusPhase::Status => (false, true, true),
            BusPhase::MsgOut => (true, true, false),
            BusPhase::MsgIn => (true, true, true),
            _ => return,
        };
        bus.set_signal(Signal::Msg, msg);
        bus.set_signal(Signal::Cd, cd);
        bus.set_signal(Signal::Io, io);
        bus.set_dat_direction(io);
    }

    fn bus_free<B: ScsiBus>(&mut self, bus: &mut B) {
        bus.release();
        self.phase = BusPhase::BusFree;
        self.blocks_remaining = 0;
        self.next_block = 0;
    }

    /// Message Out: consume message bytes while ATN is held.
    fn msg_out<B: ScsiBus>(&mut self, bus: &mut B, units: &mut TargetUnits) -> MsgOutcome {
        self.set_phase_signals(bus, BusPhase::MsgOut);

        loop {
            let mut byte = [0u8; 1];
            if bus.receive_handshake(&mut byte) != 1 {
                return if bus.acquire().rst {
                    MsgOutcome::Reset
                } else {
                    MsgOutcome::BusFree
                };
            }

            match byte[0] {
                m if m & MSG_IDENTIFY != 0 => {
                    self.identify_lun = Some(m & 0x1F);
                }
                MSG_ABORT => {
                    log::debug!("Target {}: ABORT message", self.target_id);
                    return MsgOutcome::BusFree;
                }
                MSG_BUS_DEVICE_RESET => {
                    log::info!("Target {}: BUS DEVICE RESET", self.target_id);
                    for unit in units.iter_mut() {
                        unit.reset();
                    }
                    return MsgOutcome::BusFree;
                }
                MSG_NO_OPERATION => (),
                m => {
                    // Unknown message: answer MESSAGE REJECT, then carry on
                    log::warn!("Target {}: rejecting message {:02X}", self.target_id, m);
                    self.set_phase_signals(bus, BusPhase::MsgIn);
                    bus.send_handshake(&[MSG_REJECT], None);
                    self.set_phase_signals(bus, BusPhase::MsgOut);
                }
            }

            if !bus.acquire().atn {
                return MsgOutcome::Proceed;
            }
        }
    }

    /// Command phase: receive the CDB and execute it. Returns an early
    /// outcome, or None to continue into Status.
    fn command<B: ScsiBus>(&mut self, bus: &mut B, units: &mut TargetUnits) -> Option<Outcome> {
        self.set_phase_signals(bus, BusPhase::Command);

        self.cdb = [0; 16];
        let received = bus.command_handshake(&mut self.cdb);

        if received == 0 {
            if bus.acquire().rst {
                return Some(Outcome::Reset);
            }
            // Unknown opcode (or a dead handshake on the very first byte)
            log::warn!(
                "Target {}: unknown or aborted command {:02X}",
                self.target_id,
                self.cdb[0]
            );
            self.check_condition_on(
                units,
                SenseKey::IllegalRequest,
                ASC_INVALID_COMMAND_OPERATION_CODE,
            );
            return None;
        }

        let expected = cdb_len(self.cdb[0]);
        if received < expected {
            if bus.acquire().rst {
                return Some(Outcome::Reset);
            }
            // Truncated transfer: bus transient
            log::warn!(
                "Target {}: short CDB ({} of {})",
                self.target_id,
                received,
                expected
            );
            self.check_condition_on(units, SenseKey::AbortedCommand, 0);
            return None;
        }

        self.execute(bus, units)
    }

    /// The effective LUN: IDENTIFY wins, the CDB field is the fallback.
    fn effective_lun(&self) -> u8 {
        self.identify_lun.unwrap_or(self.cdb[1] >> 5)
    }

    /// Record CHECK CONDITION with sense on the addressed unit (when it
    /// exists; a missing unit answers REQUEST SENSE statelessly).
    fn check_condition_on(&mut self, units: &mut TargetUnits, key: SenseKey, asc: u16) {
        self.status = StatusCode::CheckCondition;
        if let Some(unit) = units.unit_mut(self.effective_lun()) {
            unit.core_mut().set_sense(key, asc);
        }
    }

    fn execute<B: ScsiBus>(&mut self, bus: &mut B, units: &mut TargetUnits) -> Option<Outcome> {
        let lun = self.effective_lun();
        let op = self.cdb[0];

        // REPORT LUNS needs the whole unit table
        if op == 0xA0 {
            return self.report_luns(bus, units);
        }

        let Some(unit) = units.unit_mut(lun) else {
            return self.invalid_lun(bus, lun);
        };

        let cdb = self.cdb;
        let result = match unit.cmd(&cdb, None) {
            Ok(r) => r,
            Err(e) => {
                log::error!("Target {}: command {:02X} failed: {:#}", self.target_id, op, e);
                self.status = StatusCode::CheckCondition;
                return None;
            }
        };

        self.run_result(bus, unit, result, 0)
    }

    /// Carry out one dispatch result. DataOut results re-enter the unit
    /// with the received payload; `depth` guards against a handler that
    /// never terminates.
    fn run_result<B: ScsiBus>(
        &mut self,
        bus: &mut B,
        unit: &mut (dyn LogicalUnit + 'static),
        result: UnitCmdResult,
        depth: u8,
    ) -> Option<Outcome> {
        match result {
            UnitCmdResult::Status(s) => {
                self.status = s;
                None
            }
            UnitCmdResult::DataIn(data) => {
                self.status = StatusCode::Good;
                let out = self.data_in(bus, &data, unit.send_pacing());
                if out.is_none() && self.status == StatusCode::CheckCondition {
                    unit.core_mut().set_sense(SenseKey::AbortedCommand, 0);
                }
                out
            }
            UnitCmdResult::DataOut(length) => {
                if depth > 0 {
                    log::error!("Nested DataOut from unit dispatch");
                    self.status = StatusCode::CheckCondition;
                    return None;
                }
                match self.data_out(bus, length) {
                    DataOutResult::Complete(data) => {
                        let cdb = self.cdb;
                        match unit.cmd(&cdb, Some(&data)) {
                            Ok(r) => self.run_result(bus, unit, r, depth + 1),
                            Err(e) => {
                                log::error!("Target {}: data-out completion failed: {:#}", self.target_id, e);
                                self.status = StatusCode::CheckCondition;
                                None
                            }
                        }
                    }
                    DataOutResult::Reset => Some(Outcome::Reset),
                    DataOutResult::Short => {
                        self.check_condition_transient(unit);
                        None
                    }
                }
            }
            UnitCmdResult::ReadBlocks { lba, count } => self.pump_in(bus, unit, lba, count),
            UnitCmdResult::WriteBlocks { lba, count } => self.pump_out(bus, unit, lba, count),
        }
    }

    fn check_condition_transient(&mut self, unit: &mut (dyn LogicalUnit + 'static)) {
        self.status = StatusCode::CheckCondition;
        unit.core_mut().set_sense(SenseKey::AbortedCommand, 0);
    }

    /// Single-buffer DataIn transfer (INQUIRY, sense, mode pages, ...)
    fn data_in<B: ScsiBus>(
        &mut self,
        bus: &mut B,
        data: &[u8],
        pacing: Option<usize>,
    ) -> Option<Outcome> {
        if data.is_empty() {
            return None;
        }
        self.set_phase_signals(bus, BusPhase::DataIn);
        let sent = bus.send_handshake(data, pacing);
        if sent < data.len() {
            if bus.acquire().rst {
                return Some(Outcome::Reset);
            }
            self.status = StatusCode::CheckCondition;
        }
        None
    }

    /// Single-buffer DataOut transfer
    fn data_out<B: ScsiBus>(&mut self, bus: &mut B, length: usize) -> DataOutResult {
        if length == 0 {
            return DataOutResult::Complete(Vec::new());
        }
        self.set_phase_signals(bus, BusPhase::DataOut);
        let mut data = vec![0u8; length];
        let received = bus.receive_handshake(&mut data);
        if received < length {
            if bus.acquire().rst {
                return DataOutResult::Reset;
            }
            return DataOutResult::Short;
        }
        DataOutResult::Complete(data)
    }

    /// Block pump, target to initiator. One handshake loop per block;
    /// the unit refills the buffer between blocks.
    fn pump_in<B: ScsiBus>(
        &mut self,
        bus: &mut B,
        unit: &mut (dyn LogicalUnit + 'static),
        lba: u64,
        count: u32,
    ) -> Option<Outcome> {
        let Some((_, block_size)) = unit.capacity() else {
            self.status = StatusCode::CheckCondition;
            return None;
        };

        self.status = StatusCode::Good;
        self.blocks_remaining = count;
        self.next_block = lba;
        self.buffer.resize(block_size, 0);
        self.set_phase_signals(bus, BusPhase::DataIn);

        let pacing = unit.send_pacing();
        while self.blocks_remaining > 0 {
            if let Err(e) = unit.read_block(self.next_block, &mut self.buffer) {
                unit.core_mut().sense = e.into();
                self.status = StatusCode::CheckCondition;
                return None;
            }

            let sent = bus.send_handshake(&self.buffer, pacing);
            if sent < block_size {
                if bus.acquire().rst {
                    return Some(Outcome::Reset);
                }
                // Phase mismatch or dead initiator ends the pump
                self.check_condition_transient(unit);
                return None;
            }

            self.next_block += 1;
            self.blocks_remaining -= 1;
        }
        None
    }

    /// Block pump, initiator to target. A truncated block is never
    /// written to the medium.
    fn pump_out<B: ScsiBus>(
        &mut self,
        bus: &mut B,
        unit: &mut (dyn LogicalUnit + 'static),
        lba: u64,
        count: u32,
    ) -> Option<Outcome> {
        let Some((_, block_size)) = unit.capacity() else {
            self.status = StatusCode::CheckCondition;
            return None;
        };

        self.status = StatusCode::Good;
        self.blocks_remaining = count;
        self.next_block = lba;
        self.buffer.resize(block_size, 0);
        self.set_phase_signals(bus, BusPhase::DataOut);

        while self.blocks_remaining > 0 {
            let received = bus.receive_handshake(&mut self.buffer);
            if received < block_size {
                if bus.acquire().rst {
                    return Some(Outcome::Reset);
                }
                self.check_condition_transient(unit);
                return None;
            }

            if let Err(e) = unit.write_block(self.next_block, &self.buffer) {
                unit.core_mut().sense = e.into();
                self.status = StatusCode::CheckCondition;
                return None;
            }

            self.next_block += 1;
            self.blocks_remaining -= 1;
        }
        None
    }

    /// REPORT LUNS: synthesized from the unit table.
    fn report_luns<B: ScsiBus>(&mut self, bus: &mut B, units: &mut TargetUnits) -> Option<Outcome> {
        let luns: Vec<u8> = units.luns().collect();
        if luns.is_empty() {
            return self.invalid_lun(bus, self.effective_lun());
        }

        let allocation =
            u32::from_be_bytes([self.cdb[6], self.cdb[7], self.cdb[8], self.cdb[9]]) as usize;

        let mut data = vec![0u8; 8 + luns.len() * 8];
        data[0..4].copy_from_slice(&((luns.len() * 8) as u32).to_be_bytes());
        for (i, lun) in luns.iter().enumerate() {
            data[8 + i * 8 + 1] = *lun;
        }
        data.truncate(allocation.min(data.len()));

        self.status = StatusCode::Good;
        self.data_in(bus, &data, None)
    }

    /// Commands to a LUN nobody answers for. INQUIRY and REQUEST SENSE
    /// have architected stateless answers; everything else is CHECK
    /// CONDITION.
    fn invalid_lun<B: ScsiBus>(&mut self, bus: &mut B, lun: u8) -> Option<Outcome> {
        match self.cdb[0] {
            // INQUIRY: peripheral qualifier "not capable", device type none
            0x12 => {
                let allocation = usize::from(u16::from_be_bytes([self.cdb[3], self.cdb[4]]));
                let mut data = vec![0u8; 36];
                data[0] = 0x7F;
                data[2] = 0x05;
                data[3] = 0x02;
                data[4] = 0x1F;
                data.truncate(allocation.min(36));
                self.status = StatusCode::Good;
                self.data_in(bus, &data, None)
            }
            // REQUEST SENSE: LOGICAL UNIT NOT SUPPORTED
            0x03 => {
                let allocation = match self.cdb[4] {
                    0 => 4,
                    n => usize::from(n),
                };
                let sense = crate::targets::sense::SenseData::new(
                    SenseKey::IllegalRequest,
                    ASC_LOGICAL_UNIT_NOT_SUPPORTED,
                );
                self.status = StatusCode::Good;
                let data = sense.to_fixed(allocation);
                self.data_in(bus, &data, None)
            }
            _ => {
                log::warn!("Target {}: command to missing LUN {}", self.target_id, lun);
                self.status = StatusCode::CheckCondition;
                None
            }
        }
    }

    /// Status phase: one status byte.
    fn status_phase<B: ScsiBus>(&mut self, bus: &mut B) {
        self.set_phase_signals(bus, BusPhase::Status);
        let byte = self.status.to_u8().unwrap_or(StatusCode::Good as u8);
        bus.send_handshake(&[byte], None);
    }

    /// Message In: COMMAND COMPLETE closes every sequence.
    fn msg_in<B: ScsiBus>(&mut self, bus: &mut B) {
        self.set_phase_signals(bus, BusPhase::MsgIn);
        bus.send_handshake(&[self.message], None);
    }
}

enum MsgOutcome {
    Proceed,
    BusFree,
    Reset,
}

enum DataOutResult {
    Complete(Vec<u8>),
    Reset,
    Short,
}
