//! Raspberry Pi GPIO pin driver
//!
//! Drives the interface board through the BCM GPIO block mapped from
//! `/dev/mem` (falling back to `/dev/gpiomem`). The full-spec board's
//! transceivers invert, so a high GPIO level is an asserted SCSI signal
//! and no inversion happens in software.

use std::fs::File;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd};
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use super::board::{BoardProfile, SocProfile};
use super::irq::IrqController;
use super::regs::RegWindow;
use super::{PinDriver, SelEvent};
use crate::bus::Signal;

// GPIO block register offsets
const GPFSEL0: usize = 0x00;
const GPSET0: usize = 0x1C;
const GPCLR0: usize = 0x28;
const GPLEV0: usize = 0x34;
const GPPUD: usize = 0x94;
const GPPUDCLK0: usize = 0x98;
const GPIO_PUP_PDN_CNTRL0: usize = 0xE4;

const FSEL_INPUT: u32 = 0b000;
const FSEL_OUTPUT: u32 = 0b001;

// Linux gpiochip character device event interface
const GPIOHANDLE_REQUEST_INPUT: u32 = 1 << 0;
const GPIOEVENT_REQUEST_BOTH_EDGES: u32 = 0x3;

#[repr(C)]
struct GpioEventRequest {
    lineoffset: u32,
    handleflags: u32,
    eventflags: u32,
    consumer_label: [u8; 32],
    fd: i32,
}

nix::ioctl_readwrite!(gpio_get_lineevent, 0xB4, 0x04, GpioEventRequest);

/// Interrupt-backed SEL edge source
struct SelEventFd {
    fd: OwnedFd,
}

impl SelEventFd {
    fn open(sel_pin: u8) -> Result<Self> {
        let chip = File::open("/dev/gpiochip0").context("Failed to open /dev/gpiochip0")?;

        let mut req = GpioEventRequest {
            lineoffset: u32::from(sel_pin),
            handleflags: GPIOHANDLE_REQUEST_INPUT,
            eventflags: GPIOEVENT_REQUEST_BOTH_EDGES,
            consumer_label: [0; 32],
            fd: -1,
        };
        req.consumer_label[..8].copy_from_slice(b"slate-se");

        unsafe {
            gpio_get_lineevent(chip.as_raw_fd(), &raw mut req)
                .context("GPIO_GET_LINEEVENT failed")?;
        }
        if req.fd < 0 {
            bail!("GPIO_GET_LINEEVENT returned no descriptor");
        }

        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(req.fd) },
        })
    }

    /// Returns true when an edge arrived within the timeout.
    fn wait(&self, timeout: Option<Duration>) -> Result<bool> {
        let mut fds = [PollFd::new(self.fd.as_fd(), PollFlags::POLLIN)];
        let t = match timeout {
            Some(d) => {
                let ms = d.as_millis().min(u128::from(u16::MAX)) as u16;
                PollTimeout::from(ms)
            }
            None => PollTimeout::NONE,
        };
        if poll(&mut fds, t)? == 0 {
            return Ok(false);
        }

        // Drain one gpioevent_data record
        let mut ev = [0u8; 16];
        let n = unsafe { libc::read(self.fd.as_raw_fd(), ev.as_mut_ptr().cast(), ev.len()) };
        if n < 0 {
            bail!("SEL event read failed: {}", std::io::Error::last_os_error());
        }
        Ok(true)
    }
}

pub struct RpiPins {
    board: BoardProfile,
    gpio: RegWindow,
    irq: IrqController,
    /// Last GPLEV0 snapshot
    signals: u32,
    /// Precomputed GPSET/GPCLR words per data byte, parity included
    tbl_set: [u32; 256],
    tbl_clr: [u32; 256],
    sel_event: Option<SelEventFd>,
    /// True when the Pi 4 pull register layout applies
    pup_pdn: bool,
}

impl RpiPins {
    pub fn new(board: BoardProfile) -> Result<Self> {
        let soc = SocProfile::detect();

        let gpio = RegWindow::map(
            Path::new("/dev/mem"),
            soc.peripheral_base + SocProfile::GPIO_OFFSET,
            0x1000,
        )
        .or_else(|e| {
            log::debug!("/dev/mem GPIO map failed ({e:#}), trying /dev/gpiomem");
            RegWindow::map(Path::new("/dev/gpiomem"), 0, 0x1000)
        })
        .context("Cannot access the GPIO interface")?;

        let irq = IrqController::probe(&soc);

        let sel_event = SelEventFd::open(board.sel)
            .map_err(|e| log::warn!("SEL event fd unavailable ({e:#}), polling instead"))
            .ok();

        let (tbl_set, tbl_clr) = Self::make_dat_tables(&board);

        let mut pins = Self {
            board,
            gpio,
            irq,
            signals: 0,
            tbl_set,
            tbl_clr,
            sel_event,
            pup_pdn: soc.has_gic,
        };
        pins.init_pins();
        Ok(pins)
    }

    /// Precompute the set/clear register words for every data byte value.
    /// Parity is odd: DP is driven so the nine lines carry an odd number
    /// of ones.
    fn make_dat_tables(board: &BoardProfile) -> ([u32; 256], [u32; 256]) {
        let mut set = [0u32; 256];
        let mut clr = [0u32; 256];
        for val in 0..256usize {
            let byte = val as u8;
            let parity = byte.count_ones() % 2 == 0;
            for (bit, &pin) in board.dt.iter().enumerate() {
                if byte & (1 << bit) != 0 {
                    set[val] |= 1 << pin;
                } else {
                    clr[val] |= 1 << pin;
                }
            }
            if parity {
                set[val] |= 1 << board.dp;
            } else {
                clr[val] |= 1 << board.dp;
            }
        }
        (set, clr)
    }

    fn init_pins(&mut self) {
        // Everything starts released: inputs except the transceiver
        // controls and the activity LED.
        for pin in self.board.input_pins().collect::<Vec<_>>() {
            self.pin_config(pin, FSEL_INPUT);
            self.pull_config(pin, 0);
        }
        for pin in [
            self.board.act,
            self.board.enb,
            self.board.ind,
            self.board.tad,
            self.board.dtd,
        ] {
            self.pin_config(pin, FSEL_OUTPUT);
        }

        // Target mode: target-group transceivers face out, initiator group
        // and data face in; enable the interface.
        self.pin_write(self.board.tad, true);
        self.pin_write(self.board.ind, false);
        self.pin_write(self.board.dtd, false);
        self.pin_write(self.board.enb, true);
        self.pin_write(self.board.act, false);

        // Target output signals become outputs, released
        for sig in [Signal::Bsy, Signal::Msg, Signal::Cd, Signal::Io, Signal::Req] {
            let pin = self.signal_pin(sig);
            self.pin_config(pin, FSEL_OUTPUT);
            self.pin_write(pin, false);
        }
    }

    const fn signal_pin(&self, sig: Signal) -> u8 {
        match sig {
            Signal::Bsy => self.board.bsy,
            Signal::Sel => self.board.sel,
            Signal::Atn => self.board.atn,
            Signal::Ack => self.board.ack,
            Signal::Rst => self.board.rst,
            Signal::Msg => self.board.msg,
            Signal::Cd => self.board.cd,
            Signal::Io => self.board.io,
            Signal::Req => self.board.req,
            Signal::Dp => self.board.dp,
        }
    }

    fn pin_config(&mut self, pin: u8, mode: u32) {
        let reg = GPFSEL0 + (usize::from(pin) / 10) * 4;
        let shift = (u32::from(pin) % 10) * 3;
        let cur = self.gpio.read(reg);
        self.gpio.write(reg, (cur & !(0b111 << shift)) | (mode << shift));
    }

    fn pull_config(&mut self, pin: u8, mode: u32) {
        if self.pup_pdn {
            // BCM2711: direct control register, 2 bits per pin
            let reg = GPIO_PUP_PDN_CNTRL0 + (usize::from(pin) / 16) * 4;
            let shift = (u32::from(pin) % 16) * 2;
            let cur = self.gpio.read(reg);
            self.gpio.write(reg, (cur & !(0b11 << shift)) | (mode << shift));
        } else {
            // Legacy: clocked sequence against GPPUD
            self.gpio.write(GPPUD, mode);
            thread::sleep(Duration::from_micros(5));
            self.gpio.write(GPPUDCLK0, 1 << pin);
            thread::sleep(Duration::from_micros(5));
            self.gpio.write(GPPUD, 0);
            self.gpio.write(GPPUDCLK0, 0);
        }
    }

    fn pin_write(&mut self, pin: u8, level: bool) {
        if level {
            self.gpio.write(GPSET0, 1 << pin);
        } else {
            self.gpio.write(GPCLR0, 1 << pin);
        }
    }
}

impl PinDriver for RpiPins {
    fn acquire(&mut self) -> u32 {
        self.signals = self.gpio.read(GPLEV0);
        self.signals
    }

    fn raw(&self) -> u32 {
        self.signals
    }

    fn get(&self, sig: Signal) -> bool {
        (self.signals >> self.signal_pin(sig)) & 1 != 0
    }

    fn dat(&self) -> u8 {
        let mut val = 0u8;
        for (bit, &pin) in self.board.dt.iter().enumerate() {
            if (self.signals >> pin) & 1 != 0 {
                val |= 1 << bit;
            }
        }
        val
    }

    fn dp(&self) -> bool {
        (self.signals >> self.board.dp) & 1 != 0
    }

    fn set(&mut self, sig: Signal, asserted: bool) {
        let pin = self.signal_pin(sig);
        self.pin_write(pin, asserted);
    }

    fn set_dat(&mut self, dat: u8) {
        self.gpio.write(GPCLR0, self.tbl_clr[usize::from(dat)]);
        self.gpio.write(GPSET0, self.tbl_set[usize::from(dat)]);
    }

    fn set_dat_direction(&mut self, output: bool) {
        self.pin_write(self.board.dtd, output);
        let mode = if output { FSEL_OUTPUT } else { FSEL_INPUT };
        for pin in self.board.dt {
            self.pin_config(pin, mode);
        }
        self.pin_config(self.board.dp, mode);
    }

    fn release_all(&mut self) {
        for sig in [Signal::Bsy, Signal::Msg, Signal::Cd, Signal::Io, Signal::Req] {
            self.set(sig, false);
        }
        self.set_dat_direction(false);
        let act = self.board.act;
        self.pin_write(act, false);
    }

    fn wait_event_select(&mut self, timeout: Option<Duration>) -> Result<SelEvent> {
        if let Some(ev) = &self.sel_event {
            return Ok(if ev.wait(timeout)? {
                SelEvent::Edge
            } else {
                SelEvent::Timeout
            });
        }

        // Polled fallback: watch the level register for a SEL change
        let start = Instant::now();
        let initial = (self.acquire() >> self.board.sel) & 1;
        loop {
            if (self.acquire() >> self.board.sel) & 1 != initial {
                return Ok(SelEvent::Edge);
            }
            if let Some(t) = timeout {
                if start.elapsed() >= t {
                    return Ok(SelEvent::Timeout);
                }
            }
            thread::sleep(Duration::from_micros(20));
        }
    }

    fn irq(&self) -> IrqController {
        self.irq.clone()
    }
}
