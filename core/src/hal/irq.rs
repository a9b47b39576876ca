//! Scoped kernel interrupt masking
//!
//! Byte handshakes run with interrupts masked so the kernel cannot steal
//! the core between REQ and the initiator's ACK. Masking is expressed as a
//! guard: the mask is dropped on every exit path, including unwinds, and a
//! depth counter keeps nested guards balanced.

use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;

use super::board::SocProfile;
use super::regs::RegWindow;

// Legacy interrupt controller (BCM2835..2837)
const IRQ_ENABLE_1: usize = 0x10;
const IRQ_ENABLE_2: usize = 0x14;
const IRQ_ENABLE_BASIC: usize = 0x18;
const IRQ_DISABLE_1: usize = 0x1C;
const IRQ_DISABLE_2: usize = 0x20;
const IRQ_DISABLE_BASIC: usize = 0x24;

// GIC CPU interface (BCM2711)
const GICC_PMR: usize = 0x04;

enum IrqRegs {
    Legacy {
        irpctl: RegWindow,
        saved: Mutex<[u32; 3]>,
    },
    Gic {
        gicc: RegWindow,
        saved: Mutex<u32>,
    },
}

struct IrqInner {
    depth: AtomicU32,
    disables: AtomicU64,
    enables: AtomicU64,
    regs: Option<IrqRegs>,
}

impl IrqInner {
    fn mask(&self) {
        match &self.regs {
            Some(IrqRegs::Legacy { irpctl, saved }) => {
                let mut s = saved.lock().unwrap();
                *s = [
                    irpctl.read(IRQ_ENABLE_1),
                    irpctl.read(IRQ_ENABLE_2),
                    irpctl.read(IRQ_ENABLE_BASIC),
                ];
                irpctl.write(IRQ_DISABLE_1, 0xFFFF_FFFF);
                irpctl.write(IRQ_DISABLE_2, 0xFFFF_FFFF);
                irpctl.write(IRQ_DISABLE_BASIC, 0xFFFF_FFFF);
            }
            Some(IrqRegs::Gic { gicc, saved }) => {
                let mut s = saved.lock().unwrap();
                *s = gicc.read(GICC_PMR);
                gicc.write(GICC_PMR, 0);
            }
            None => (),
        }
    }

    fn unmask(&self) {
        match &self.regs {
            Some(IrqRegs::Legacy { irpctl, saved }) => {
                let s = saved.lock().unwrap();
                irpctl.write(IRQ_ENABLE_1, s[0]);
                irpctl.write(IRQ_ENABLE_2, s[1]);
                irpctl.write(IRQ_ENABLE_BASIC, s[2]);
            }
            Some(IrqRegs::Gic { gicc, saved }) => {
                let s = saved.lock().unwrap();
                gicc.write(GICC_PMR, *s);
            }
            None => (),
        }
    }
}

/// Cloneable handle to the interrupt controller of the local core
#[derive(Clone)]
pub struct IrqController {
    inner: Arc<IrqInner>,
}

impl IrqController {
    /// Map the platform interrupt controller. Failure is not fatal: the
    /// emulator still runs, with handshakes exposed to preemption.
    pub fn probe(soc: &SocProfile) -> Self {
        let regs = Self::map_regs(soc)
            .map_err(|e| log::warn!("IRQ control unavailable ({e:#}), handshakes unmasked"))
            .ok();
        Self::with_regs(regs)
    }

    /// Controller that masks nothing: soft bus and tests
    pub fn noop() -> Self {
        Self::with_regs(None)
    }

    fn with_regs(regs: Option<IrqRegs>) -> Self {
        Self {
            inner: Arc::new(IrqInner {
                depth: AtomicU32::new(0),
                disables: AtomicU64::new(0),
                enables: AtomicU64::new(0),
                regs,
            }),
        }
    }

    fn map_regs(soc: &SocProfile) -> Result<IrqRegs> {
        let dev = Path::new("/dev/mem");
        if soc.has_gic {
            let gicc = RegWindow::map(dev, SocProfile::GIC_CPU_BASE, 0x1000)?;
            Ok(IrqRegs::Gic {
                gicc,
                saved: Mutex::new(0),
            })
        } else {
            let irpctl = RegWindow::map(
                dev,
                soc.peripheral_base + SocProfile::IRQCTL_OFFSET,
                0x1000,
            )?;
            Ok(IrqRegs::Legacy {
                irpctl,
                saved: Mutex::new([0; 3]),
            })
        }
    }

    /// Mask interrupts until the returned guard drops.
    pub fn disable(&self) -> IrqGuard {
        if self.inner.depth.fetch_add(1, Ordering::AcqRel) == 0 {
            self.inner.mask();
        }
        self.inner.disables.fetch_add(1, Ordering::Relaxed);
        IrqGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Current nesting depth; zero means interrupts are live.
    pub fn depth(&self) -> u32 {
        self.inner.depth.load(Ordering::Acquire)
    }

    /// Lifetime (disable, enable) counts, for balance audits.
    pub fn audit(&self) -> (u64, u64) {
        (
            self.inner.disables.load(Ordering::Relaxed),
            self.inner.enables.load(Ordering::Relaxed),
        )
    }
}

pub struct IrqGuard {
    inner: Arc<IrqInner>,
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        self.inner.enables.fetch_add(1, Ordering::Relaxed);
        if self.inner.depth.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.unmask();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_balances_depth() {
        let irq = IrqController::noop();
        assert_eq!(irq.depth(), 0);
        {
            let _a = irq.disable();
            assert_eq!(irq.depth(), 1);
            {
                let _b = irq.disable();
                assert_eq!(irq.depth(), 2);
            }
            assert_eq!(irq.depth(), 1);
        }
        assert_eq!(irq.depth(), 0);

        let (dis, en) = irq.audit();
        assert_eq!(dis, 2);
        assert_eq!(en, 2);
    }

    #[test]
    fn guard_releases_on_panic() {
        let irq = IrqController::noop();
        let irq2 = irq.clone();
        let result = std::panic::catch_unwind(move || {
            let _g = irq2.disable();
            panic!("mid-handshake fault");
        });
        assert!(result.is_err());
        assert_eq!(irq.depth(), 0);
        let (dis, en) = irq.audit();
        assert_eq!(dis, en);
    }
}
