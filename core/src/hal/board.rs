//! Board profiles: GPIO pin assignments and peripheral base addresses

use std::fs;

/// GPIO pin assignment for one interface board revision.
///
/// All numbers are BCM GPIO numbers. The standard (FULLSPEC) board routes
/// the data lines through direction-controlled transceivers; `tad`, `ind`
/// and `dtd` select the transceiver direction for the target, initiator and
/// data groups respectively, `enb` gates the whole interface.
#[derive(Debug, Clone, Copy)]
pub struct BoardProfile {
    pub dt: [u8; 8],
    pub dp: u8,
    pub atn: u8,
    pub rst: u8,
    pub ack: u8,
    pub req: u8,
    pub msg: u8,
    pub cd: u8,
    pub io: u8,
    pub bsy: u8,
    pub sel: u8,
    pub act: u8,
    pub enb: u8,
    pub ind: u8,
    pub tad: u8,
    pub dtd: u8,
}

/// Standard full-spec board pinout
pub const STANDARD: BoardProfile = BoardProfile {
    dt: [10, 11, 12, 13, 14, 15, 16, 17],
    dp: 18,
    atn: 19,
    rst: 20,
    ack: 21,
    req: 22,
    msg: 23,
    cd: 24,
    io: 25,
    bsy: 26,
    sel: 27,
    act: 4,
    enb: 5,
    ind: 6,
    tad: 7,
    dtd: 8,
};

impl BoardProfile {
    /// Every pin the profile claims, for direction/pull setup.
    pub fn all_pins(&self) -> impl Iterator<Item = u8> + '_ {
        self.dt
            .iter()
            .copied()
            .chain([
                self.dp, self.atn, self.rst, self.ack, self.req, self.msg, self.cd, self.io,
                self.bsy, self.sel, self.act, self.enb, self.ind, self.tad, self.dtd,
            ])
    }

    /// Input signal pins that are latched by `acquire()`.
    pub fn input_pins(&self) -> impl Iterator<Item = u8> + '_ {
        self.dt.iter().copied().chain([
            self.dp, self.atn, self.rst, self.ack, self.req, self.msg, self.cd, self.io, self.bsy,
            self.sel,
        ])
    }
}

/// SoC peripheral window, derived from the device tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocProfile {
    /// Physical base of the peripheral window
    pub peripheral_base: u64,
    /// ARM core clock in Hz, for free-running counter tick conversion
    pub core_freq: u32,
    /// True when the SoC carries a GIC (Pi 4 family) rather than the
    /// legacy interrupt controller
    pub has_gic: bool,
}

impl SocProfile {
    pub const GPIO_OFFSET: u64 = 0x20_0000;
    pub const SYSTIMER_OFFSET: u64 = 0x3000;
    pub const ARMTIMER_OFFSET: u64 = 0xB000;
    pub const IRQCTL_OFFSET: u64 = 0xB200;
    pub const QA7_BASE: u64 = 0x4000_0000;
    pub const GIC_DIST_BASE: u64 = 0xFF84_1000;
    pub const GIC_CPU_BASE: u64 = 0xFF84_2000;

    /// Detect the peripheral window from `/proc/device-tree/soc/ranges`.
    ///
    /// The ranges cell layout differs between SoC generations; the base is
    /// the first non-zero 32-bit word past the child address. Falls back to
    /// the BCM2711 window when the device tree is unreadable.
    pub fn detect() -> Self {
        let ranges = fs::read("/proc/device-tree/soc/ranges").unwrap_or_default();

        let word = |idx: usize| -> u64 {
            let off = idx * 4;
            if ranges.len() < off + 4 {
                return 0;
            }
            u64::from(u32::from_be_bytes([
                ranges[off],
                ranges[off + 1],
                ranges[off + 2],
                ranges[off + 3],
            ]))
        };

        let base = match word(1) {
            0 => word(2),
            b => b,
        };

        match base {
            0x2000_0000 => Self {
                peripheral_base: base,
                core_freq: 250_000_000,
                has_gic: false,
            },
            0x3F00_0000 => Self {
                peripheral_base: base,
                core_freq: 400_000_000,
                has_gic: false,
            },
            0xFE00_0000 => Self {
                peripheral_base: base,
                core_freq: 500_000_000,
                has_gic: true,
            },
            _ => {
                log::warn!("Unrecognized peripheral base {base:#X}, assuming BCM2711 layout");
                Self {
                    peripheral_base: 0xFE00_0000,
                    core_freq: 500_000_000,
                    has_gic: true,
                }
            }
        }
    }
}
