//! slatectl: control CLI for the slate SCSI target daemon
//!
//! Exit codes follow errno conventions: EINVAL for argument problems,
//! ENOTCONN when the daemon socket is unreachable, EIO when the daemon
//! rejects the request.

use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::process::exit;

use anyhow::{bail, Context, Result};
use clap::Parser;

use slate_core::control::proto::{read_frame, write_frame};
use slate_core::control::{ControlRequest, ControlResponse, ControlResult, DEFAULT_SOCKET};
use slate_core::targets::DeviceClass;

#[derive(Parser)]
#[command(name = "slatectl", version, about = "Control the slate SCSI target daemon")]
#[command(after_help = r#"EXAMPLES:
    slatectl -i 0 -c attach -t hd -f harddisk.hds      Attach a hard disk
    slatectl -i 2 -c attach -t cd                      Attach an empty CD drive
    slatectl -i 2 -c insert -f image.iso               Insert a CD image
    slatectl -i 2 -c eject                             Eject the medium
    slatectl -i 0 -c detach                            Detach a device
    slatectl --list                                    Show attached devices
    slatectl --create scratch.hds --size 10485760      Create a blank image
    slatectl --log-level debug                         Change the log level
    slatectl --shutdown                                Stop the daemon
"#)]
struct Cli {
    /// Control socket path
    #[arg(short = 's', long, default_value = DEFAULT_SOCKET)]
    socket: PathBuf,

    /// Target SCSI ID (0-7)
    #[arg(short = 'i', long)]
    id: Option<u8>,

    /// Logical unit number (0-31)
    #[arg(short = 'u', long, default_value_t = 0)]
    lun: u8,

    /// Operation: attach, detach, insert, eject, protect, unprotect
    #[arg(short = 'c', long)]
    command: Option<String>,

    /// Device type: hd, rm, mo, cd, dp, lp, br, hs
    #[arg(short = 't', long)]
    device_type: Option<String>,

    /// Image file
    #[arg(short = 'f', long)]
    file: Option<PathBuf>,

    /// Identity override VENDOR:PRODUCT:REVISION
    #[arg(short = 'n', long)]
    name: Option<String>,

    /// Block size (256, 512, 1024, 2048, 4096)
    #[arg(short = 'b', long)]
    block_size: Option<usize>,

    /// List attached devices
    #[arg(long)]
    list: bool,

    /// Show server information
    #[arg(long)]
    server_info: bool,

    /// Set the server log level
    #[arg(long)]
    log_level: Option<String>,

    /// Set reserved IDs (comma separated; empty string clears)
    #[arg(long)]
    reserved_ids: Option<String>,

    /// Create a blank image in the default folder (requires --size)
    #[arg(long)]
    create: Option<String>,

    /// Size in bytes for --create
    #[arg(long)]
    size: Option<u64>,

    /// Delete an image from the default folder
    #[arg(long)]
    delete: Option<String>,

    /// Rename an image, written FROM:TO
    #[arg(long)]
    rename: Option<String>,

    /// Set or query the default image folder
    #[arg(long)]
    default_folder: Option<Option<PathBuf>>,

    /// Stop the bus reactor
    #[arg(long)]
    stop: bool,

    /// Shut the daemon down
    #[arg(long)]
    shutdown: bool,

    /// Print raw JSON responses
    #[arg(long)]
    json: bool,
}

fn build_request(cli: &Cli) -> Result<ControlRequest> {
    if cli.list {
        return Ok(ControlRequest::DevicesInfo);
    }
    if cli.server_info {
        return Ok(ControlRequest::ServerInfo);
    }
    if let Some(level) = &cli.log_level {
        return Ok(ControlRequest::LogLevel {
            level: level.clone(),
        });
    }
    if let Some(ids) = &cli.reserved_ids {
        let ids = ids
            .split(',')
            .filter(|s| !s.is_empty())
            .map(str::parse)
            .collect::<Result<Vec<u8>, _>>()
            .context("Malformed reserved ID list")?;
        return Ok(ControlRequest::ReservedIds { ids: Some(ids) });
    }
    if let Some(file) = &cli.create {
        let size = cli.size.context("--create requires --size")?;
        return Ok(ControlRequest::CreateImage {
            file: file.clone(),
            size,
        });
    }
    if let Some(file) = &cli.delete {
        return Ok(ControlRequest::DeleteImage { file: file.clone() });
    }
    if let Some(spec) = &cli.rename {
        let (from, to) = spec
            .split_once(':')
            .context("--rename expects FROM:TO")?;
        return Ok(ControlRequest::RenameImage {
            from: from.into(),
            to: to.into(),
        });
    }
    if let Some(folder) = &cli.default_folder {
        return Ok(ControlRequest::DefaultImageFolder {
            path: folder.clone(),
        });
    }
    if cli.stop {
        return Ok(ControlRequest::StopBus);
    }
    if cli.shutdown {
        return Ok(ControlRequest::Shutdown);
    }

    // Per-device operations need an ID and a command
    let id = cli.id.context("Missing -i ID")?;
    let command = cli.command.as_deref().context("Missing -c COMMAND")?;
    let lun = cli.lun;

    let parse_class = |cli: &Cli| -> Result<DeviceClass> {
        let t = cli.device_type.as_deref().context("Missing -t TYPE")?;
        t.parse()
            .map_err(|_| anyhow::anyhow!("Unknown device type '{t}'"))
    };

    // One-letter shortcuts are accepted like the full words
    Ok(match command {
        "attach" | "a" => ControlRequest::Attach {
            id,
            lun,
            class: parse_class(cli)?,
            file: cli.file.clone(),
            block_size: cli.block_size,
            name: cli.name.clone(),
        },
        "detach" | "d" => ControlRequest::Detach { id, lun },
        "insert" | "i" => ControlRequest::Insert {
            id,
            lun,
            file: cli.file.clone().context("Missing -f FILE")?,
        },
        "eject" | "e" => ControlRequest::Eject { id, lun },
        "protect" | "p" => ControlRequest::Protect { id, lun },
        "unprotect" | "u" => ControlRequest::Unprotect { id, lun },
        other => bail!("Unknown command '{other}'"),
    })
}

fn print_response(response: &ControlResponse, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(response)?);
        return Ok(());
    }

    match response {
        ControlResponse::Ok => println!("OK"),
        ControlResponse::Devices { devices } => {
            if devices.is_empty() {
                println!("No devices attached");
                return Ok(());
            }
            println!("ID:LUN  TYPE  SIZE        STATUS      FILE");
            for d in devices {
                let size = d.blocks * d.block_size as u64;
                let mut flags = Vec::new();
                if !d.media_present {
                    flags.push("no media");
                }
                if d.protected {
                    flags.push("protected");
                }
                if d.locked {
                    flags.push("locked");
                }
                let status = if flags.is_empty() {
                    "ready".to_string()
                } else {
                    flags.join(",")
                };
                println!(
                    "{:>2}:{:<3}  {:<4}  {:>10}  {:<10}  {}",
                    d.id,
                    d.lun,
                    d.class.to_string(),
                    size,
                    status,
                    d.file
                        .as_ref()
                        .map_or(String::new(), |f| f.display().to_string()),
                );
            }
        }
        ControlResponse::Server {
            version,
            image_folder,
            reserved_ids,
            log_level,
        } => {
            println!("Server version: {version}");
            println!("Image folder:   {}", image_folder.display());
            println!("Reserved IDs:   {reserved_ids:?}");
            println!("Log level:      {log_level}");
        }
        ControlResponse::ReservedIds { ids } => println!("Reserved IDs: {ids:?}"),
        ControlResponse::ImageFolder { path } => println!("{}", path.display()),
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();

    let request = match build_request(&cli) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Error: {e:#}");
            exit(libc::EINVAL);
        }
    };

    let stream = match UnixStream::connect(&cli.socket) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Cannot reach server at {}: {e}", cli.socket.display());
            exit(libc::ENOTCONN);
        }
    };

    let result: Result<ControlResult> = (|| {
        let mut writer = stream.try_clone()?;
        let mut reader = std::io::BufReader::new(stream);
        write_frame(&mut writer, &request)?;
        Ok(read_frame(&mut reader)?)
    })();

    match result {
        Ok(Ok(response)) => {
            if let Err(e) = print_response(&response, cli.json) {
                eprintln!("Error: {e:#}");
                exit(libc::EIO);
            }
        }
        Ok(Err(server_error)) => {
            eprintln!("Error: {server_error}");
            exit(libc::EIO);
        }
        Err(e) => {
            eprintln!("Connection error: {e:#}");
            exit(libc::ENOTCONN);
        }
    }
}
