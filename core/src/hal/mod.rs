//! Hardware access layer: board profiles, GPIO pin control, timers

pub mod board;
pub mod gpio;
pub mod irq;
pub mod regs;
pub mod systimer;

use anyhow::Result;
use std::time::Duration;

use crate::bus::Signal;
use irq::IrqController;

/// Outcome of waiting for a SEL edge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelEvent {
    /// SEL transitioned
    Edge,
    /// Wait timed out with no transition
    Timeout,
}

/// Per-signal GPIO access for one physical bus attachment.
///
/// `acquire()` latches the entire pin level register in a single read;
/// `get()` and `dat()` decode from that latch so that every signal observed
/// after one `acquire()` belongs to the same bus snapshot.
pub trait PinDriver: Send {
    /// Latch all pin levels in one register read and return the raw word.
    fn acquire(&mut self) -> u32;

    /// Last raw word latched by [`Self::acquire`].
    fn raw(&self) -> u32;

    /// Decode a signal from the latched snapshot.
    fn get(&self, sig: Signal) -> bool;

    /// Decode the data byte from the latched snapshot.
    fn dat(&self) -> u8;

    /// Decode the data parity line from the latched snapshot.
    fn dp(&self) -> bool;

    /// Drive (or release) a single output signal.
    fn set(&mut self, sig: Signal, asserted: bool);

    /// Drive the 8 data lines plus parity in one operation.
    fn set_dat(&mut self, dat: u8);

    /// Switch the data bus transceivers between send and receive.
    fn set_dat_direction(&mut self, output: bool);

    /// Release every driven signal and return the data bus to receive.
    fn release_all(&mut self);

    /// Block until SEL transitions, or until the timeout elapses.
    ///
    /// Uses an interrupt-backed descriptor where the platform provides one
    /// and falls back to polling the level register otherwise.
    fn wait_event_select(&mut self, timeout: Option<Duration>) -> Result<SelEvent>;

    /// Handle for scoping kernel interrupts around a byte handshake.
    fn irq(&self) -> IrqController;
}
