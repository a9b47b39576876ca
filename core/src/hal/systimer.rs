//! High resolution timer
//!
//! Handshake pacing needs sleeps far below the kernel scheduler resolution
//! (~20 µs); those are busy-waited against the SoC's free-running counter.
//! Longer sleeps are handed to the kernel.

use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;

use super::board::SocProfile;
use super::regs::RegWindow;

/// Sleeps at or above this go through the kernel
const SCHEDULER_FLOOR_NS: u64 = 20_000;

/// ARM timer block: control register and free-running counter
const ARMT_CONTROL: usize = 0x40C;
const ARMT_FREERUN: usize = 0x420;
/// Free-running counter enable in the control register
const ARMT_CTRL_FREE_ENABLE: u32 = 1 << 9;

pub enum SysTimer {
    Raspberry(RaspberryTimer),
    Portable(PortableTimer),
}

impl SysTimer {
    /// Probe for the SoC timer block; degrade to the portable clock when
    /// the register window cannot be mapped (non-Pi hosts, missing
    /// privileges). The portable clock skips sub-microsecond sleeps, which
    /// reduces bus compliance on fast initiators.
    pub fn new(soc: &SocProfile) -> Self {
        match RaspberryTimer::new(soc) {
            Ok(t) => Self::Raspberry(t),
            Err(e) => {
                log::warn!("Hardware timer unavailable ({e:#}), using portable clock");
                Self::Portable(PortableTimer::new())
            }
        }
    }

    pub fn portable() -> Self {
        Self::Portable(PortableTimer::new())
    }

    /// Monotonic timestamp in nanoseconds
    pub fn now_ns(&self) -> u64 {
        match self {
            Self::Raspberry(t) => t.now_ns(),
            Self::Portable(t) => t.now_ns(),
        }
    }

    /// Sleep for at least `ns` nanoseconds without overshooting by more
    /// than one counter tick.
    pub fn sleep_ns(&self, ns: u64) {
        match self {
            Self::Raspberry(t) => t.sleep_ns(ns),
            Self::Portable(t) => t.sleep_ns(ns),
        }
    }

    pub fn sleep_us(&self, us: u64) {
        self.sleep_ns(us * 1000);
    }
}

/// Busy-wait timer backed by the ARM free-running counter
pub struct RaspberryTimer {
    armt: RegWindow,
    /// Nanoseconds per counter tick
    tick_ns: u64,
    epoch: Instant,
}

impl RaspberryTimer {
    fn new(soc: &SocProfile) -> Result<Self> {
        let armt = RegWindow::map(
            Path::new("/dev/mem"),
            soc.peripheral_base + SocProfile::ARMTIMER_OFFSET,
            0x1000,
        )?;

        // Enable the free-running counter, prescaler 1. It is clocked from
        // the APB bus at half the core frequency.
        armt.write(ARMT_CONTROL, armt.read(ARMT_CONTROL) | ARMT_CTRL_FREE_ENABLE);
        let tick_ns = 2_000_000_000 / u64::from(soc.core_freq);

        log::info!("ARM free-running counter mapped, {tick_ns} ns/tick");

        Ok(Self {
            armt,
            tick_ns: tick_ns.max(1),
            epoch: Instant::now(),
        })
    }

    fn now_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    fn sleep_ns(&self, ns: u64) {
        // Below one tick there is nothing to wait for
        if ns < self.tick_ns {
            return;
        }
        if ns >= SCHEDULER_FLOOR_NS {
            thread::sleep(Duration::from_nanos(ns));
            return;
        }

        let ticks = ns.div_ceil(self.tick_ns) as u32;
        let start = self.armt.read(ARMT_FREERUN);
        while self.armt.read(ARMT_FREERUN).wrapping_sub(start) < ticks {
            std::hint::spin_loop();
        }
    }
}

/// Portable fallback: monotonic clock, spin for short waits
pub struct PortableTimer {
    epoch: Instant,
}

impl PortableTimer {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    fn now_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    fn sleep_ns(&self, ns: u64) {
        // Sub-microsecond waits are skipped entirely; the monotonic clock
        // cannot resolve them reliably.
        if ns < 1_000 {
            return;
        }
        if ns >= SCHEDULER_FLOOR_NS {
            thread::sleep(Duration::from_nanos(ns));
            return;
        }

        let deadline = self.epoch.elapsed() + Duration::from_nanos(ns);
        while self.epoch.elapsed() < deadline {
            std::hint::spin_loop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn portable_now_monotonic() {
        let t = PortableTimer::new();
        let a = t.now_ns();
        let b = t.now_ns();
        assert!(b >= a);
    }

    #[test]
    fn portable_short_sleep_returns() {
        let t = PortableTimer::new();
        let before = t.now_ns();
        t.sleep_ns(5_000);
        assert!(t.now_ns() - before >= 5_000);
    }

    #[test]
    fn portable_subtick_sleep_is_noop() {
        let t = PortableTimer::new();
        // Must not panic or stall
        t.sleep_ns(400);
    }
}
