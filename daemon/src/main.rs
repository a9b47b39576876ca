//! slated: GPIO SCSI target emulator daemon
//!
//! Owns the reactor thread (bus + controllers + device map) and the
//! control-plane socket. Signals only set a flag; the reactor notices it
//! at BusFree and performs the teardown itself.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::*;

use slate_core::bus::gpio::GpioBus;
use slate_core::bus::soft::SoftBus;
use slate_core::bus::BusMode;
use slate_core::control::{ControlRequest, ControlServer, ServerState, DEFAULT_SOCKET};
use slate_core::controller::orchestrator::Orchestrator;
use slate_core::hal::board;
use slate_core::hal::gpio::RpiPins;
use slate_core::hal::systimer::SysTimer;
use slate_core::image::AccessMode;
use slate_core::targets::DeviceClass;

#[derive(Parser)]
#[command(name = "slated", version, about = "GPIO SCSI target emulator")]
#[command(after_help = r#"DEVICE SPECS:
    Positional arguments attach devices at startup, written as
    ID[:LUN]=[TYPE:]FILE, with TYPE one of hd, rm, mo, cd, dp, lp, br, hs.
    The type is inferred from the file extension when omitted.

    slated 0=harddisk.hds 2=cd:image.iso 4=dp 6=lp
"#)]
struct Args {
    /// Log level (error, warn, info, debug, trace)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: String,

    /// Default image folder
    #[arg(short = 'F', long, default_value = "/var/lib/slate/images")]
    image_folder: PathBuf,

    /// Control socket path
    #[arg(short = 'P', long, default_value = DEFAULT_SOCKET)]
    socket: PathBuf,

    /// Comma-separated SCSI IDs withheld from attachment
    #[arg(short = 'r', long)]
    reserved_ids: Option<String>,

    /// Image access mode: raw, mapped or cached
    #[arg(long, default_value = "raw")]
    access_mode: String,

    /// Run against the in-memory soft bus instead of GPIO hardware
    #[arg(long)]
    soft_bus: bool,

    /// Devices to attach at startup (see DEVICE SPECS)
    attach: Vec<String>,
}

/// Written by the signal handler, watched by a bridge thread
static SIGNAL_SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_signum: libc::c_int) {
    SIGNAL_SHUTDOWN.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() -> Result<()> {
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

    let action = SigAction::new(
        SigHandler::Handler(on_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe {
        sigaction(Signal::SIGINT, &action)?;
        sigaction(Signal::SIGTERM, &action)?;
    }
    Ok(())
}

/// Best-effort SCHED_FIFO for the reactor; refusal is logged, not fatal.
fn elevate_priority() {
    let param = libc::sched_param { sched_priority: 10 };
    let rc = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &raw const param) };
    if rc == 0 {
        info!("Reactor running with SCHED_FIFO priority 10");
    } else {
        warn!("Cannot set realtime priority (running unprivileged?)");
    }
}

/// Parse one `ID[:LUN]=[TYPE:]FILE` attach spec into a control request.
fn parse_attach_spec(spec: &str) -> Result<ControlRequest> {
    let (address, target) = spec
        .split_once('=')
        .with_context(|| format!("Malformed device spec '{spec}' (expected ID[:LUN]=FILE)"))?;

    let (id, lun) = match address.split_once(':') {
        Some((id, lun)) => (id.parse()?, lun.parse()?),
        None => (address.parse()?, 0),
    };

    // A bare type or leading `type:` wins; otherwise infer from the
    // file extension
    let (class, file) = if let Ok(class) = target.parse::<DeviceClass>() {
        (class, "")
    } else {
        match target.split_once(':') {
            Some((t, rest)) if t.parse::<DeviceClass>().is_ok() => {
                (t.parse::<DeviceClass>().unwrap(), rest)
            }
            _ => {
                let class = match slate_core::image::media_hint(std::path::Path::new(target)) {
                    Some(slate_core::image::MediaHint::Cd) => DeviceClass::Cd,
                    Some(slate_core::image::MediaHint::Mo) => DeviceClass::Mo,
                    _ => DeviceClass::Hd,
                };
                (class, target)
            }
        }
    };

    let file = (!file.is_empty()).then(|| PathBuf::from(file));
    if file.is_none() && class.block_device() && class != DeviceClass::Rm {
        bail!("Device spec '{spec}' needs an image file");
    }

    Ok(ControlRequest::Attach {
        id,
        lun,
        class,
        file,
        block_size: None,
        name: None,
    })
}

fn run(args: &Args) -> Result<()> {
    let access_mode: AccessMode = args
        .access_mode
        .parse()
        .map_err(|_| anyhow::anyhow!("Unknown access mode '{}'", args.access_mode))?;

    let shutdown = Arc::new(AtomicBool::new(false));
    install_signal_handlers()?;
    {
        // Bridge the async-signal flag into the reactor's shutdown flag
        let shutdown = shutdown.clone();
        thread::spawn(move || loop {
            if SIGNAL_SHUTDOWN.load(Ordering::SeqCst) {
                shutdown.store(true, Ordering::SeqCst);
                return;
            }
            thread::sleep(Duration::from_millis(100));
        });
    }

    let (actions_tx, actions_rx) = crossbeam_channel::unbounded();
    let mut state = ServerState::new(args.image_folder.clone(), access_mode, actions_tx);

    if let Some(reserved) = &args.reserved_ids {
        let ids: Vec<u8> = reserved
            .split(',')
            .filter(|s| !s.is_empty())
            .map(str::parse)
            .collect::<Result<_, _>>()
            .context("Malformed reserved ID list")?;
        state
            .apply(&ControlRequest::ReservedIds { ids: Some(ids) })
            .map_err(|e| anyhow::anyhow!("{e}"))?;
    }

    for spec in &args.attach {
        let request = parse_attach_spec(spec)?;
        state
            .apply(&request)
            .map_err(|e| anyhow::anyhow!("Cannot attach '{spec}': {e}"))?;
    }

    let mut server = ControlServer::new(&args.socket);
    server.start()?;

    elevate_priority();

    if args.soft_bus {
        warn!("Soft bus selected: no hardware, monitor/testing operation only");
        let mut orchestrator = Orchestrator::new(
            SoftBus::new(),
            state,
            server.receiver(),
            actions_rx,
            shutdown,
        );
        orchestrator.run()?;
    } else {
        let pins = RpiPins::new(board::STANDARD)
            .context("Cannot open the GPIO interface (is this a Pi, and are we privileged?)")?;
        let soc = slate_core::hal::board::SocProfile::detect();
        let timer = SysTimer::new(&soc);
        let bus = GpioBus::new(pins, timer, BusMode::Target);
        let mut orchestrator =
            Orchestrator::new(bus, state, server.receiver(), actions_rx, shutdown);
        orchestrator.run()?;
    }

    server.stop();
    info!("slated exiting");
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();

    env_logger::Builder::new()
        .parse_filters(&args.log_level)
        .format_timestamp_millis()
        .init();

    info!("slated {} starting", slate_core::build_version());

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            // Startup failures (no /dev/mem, no GPIO) abort with a
            // diagnostic
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attach_spec_with_explicit_type() {
        let req = parse_attach_spec("2:1=cd:image.iso").unwrap();
        let ControlRequest::Attach { id, lun, class, file, .. } = req else {
            panic!("wrong request");
        };
        assert_eq!((id, lun), (2, 1));
        assert_eq!(class, DeviceClass::Cd);
        assert_eq!(file.unwrap(), PathBuf::from("image.iso"));
    }

    #[test]
    fn attach_spec_infers_from_extension() {
        let req = parse_attach_spec("0=disk.hds").unwrap();
        let ControlRequest::Attach { id, class, .. } = req else {
            panic!("wrong request");
        };
        assert_eq!(id, 0);
        assert_eq!(class, DeviceClass::Hd);

        let req = parse_attach_spec("3=image.iso").unwrap();
        let ControlRequest::Attach { class, .. } = req else {
            panic!("wrong request");
        };
        assert_eq!(class, DeviceClass::Cd);
    }

    #[test]
    fn attach_spec_fileless_devices() {
        for spec in ["4=dp", "4=dp:"] {
            let req = parse_attach_spec(spec).unwrap();
            let ControlRequest::Attach { class, file, .. } = req else {
                panic!("wrong request");
            };
            assert_eq!(class, DeviceClass::Dp);
            assert!(file.is_none());
        }
    }

    #[test]
    fn attach_spec_rejects_garbage() {
        assert!(parse_attach_spec("nonsense").is_err());
        assert!(parse_attach_spec("0=").is_err());
    }
}
