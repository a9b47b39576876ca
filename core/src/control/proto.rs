//! Control-plane protocol: length-prefixed JSON frames
//!
//! Each frame is a big-endian u32 byte count followed by one JSON
//! message. Requests mutate or query the device map; every request gets
//! exactly one `Result`-shaped reply.

use std::io::{Read, Write};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::targets::DeviceClass;

/// Upper bound on one frame, to keep a broken peer from ballooning us
const MAX_FRAME: u32 = 1 << 20;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ControlRequest {
    Attach {
        id: u8,
        #[serde(default)]
        lun: u8,
        class: DeviceClass,
        #[serde(default)]
        file: Option<PathBuf>,
        #[serde(default)]
        block_size: Option<usize>,
        /// "VENDOR:PRODUCT:REVISION" override
        #[serde(default)]
        name: Option<String>,
    },
    Detach {
        id: u8,
        #[serde(default)]
        lun: u8,
    },
    Insert {
        id: u8,
        #[serde(default)]
        lun: u8,
        file: PathBuf,
    },
    Eject {
        id: u8,
        #[serde(default)]
        lun: u8,
    },
    Protect {
        id: u8,
        #[serde(default)]
        lun: u8,
    },
    Unprotect {
        id: u8,
        #[serde(default)]
        lun: u8,
    },
    DevicesInfo,
    ServerInfo,
    LogLevel {
        level: String,
    },
    /// With `ids` set: replace the reservation set. Without: query it.
    ReservedIds {
        #[serde(default)]
        ids: Option<Vec<u8>>,
    },
    CreateImage {
        file: String,
        size: u64,
    },
    DeleteImage {
        file: String,
    },
    RenameImage {
        from: String,
        to: String,
    },
    /// With `path` set: change the folder. Without: query it.
    DefaultImageFolder {
        #[serde(default)]
        path: Option<PathBuf>,
    },
    /// Soft-stop the reactor at the next BusFree
    StopBus,
    /// Stop the whole daemon
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: u8,
    pub lun: u8,
    pub class: DeviceClass,
    pub file: Option<PathBuf>,
    pub blocks: u64,
    pub block_size: usize,
    pub removable: bool,
    pub protected: bool,
    pub locked: bool,
    pub media_present: bool,
    pub vendor: String,
    pub product: String,
    pub revision: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ControlResponse {
    Ok,
    Devices {
        devices: Vec<DeviceInfo>,
    },
    Server {
        version: String,
        image_folder: PathBuf,
        reserved_ids: Vec<u8>,
        log_level: String,
    },
    ReservedIds {
        ids: Vec<u8>,
    },
    ImageFolder {
        path: PathBuf,
    },
}

/// Structured rejection; the bus is never affected by these.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "error", rename_all = "snake_case")]
pub enum ControlError {
    #[error("SCSI ID {id} is out of range")]
    InvalidId { id: u8 },
    #[error("LUN {lun} is out of range")]
    InvalidLun { lun: u8 },
    #[error("SCSI ID {id} is reserved")]
    ReservedId { id: u8 },
    #[error("No device at {id}:{lun}")]
    NoDevice { id: u8, lun: u8 },
    #[error("A device already occupies {id}:{lun}")]
    Occupied { id: u8, lun: u8 },
    #[error("Device class {class} requires an image file")]
    FileRequired { class: DeviceClass },
    #[error("Operation is not supported by this device")]
    Unsupported,
    #[error("Image error: {message}")]
    Image { message: String },
    #[error("Invalid request: {message}")]
    Invalid { message: String },
}

pub type ControlResult = Result<ControlResponse, ControlError>;

pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, msg: &T) -> Result<()> {
    let payload = serde_json::to_vec(msg)?;
    if payload.len() as u32 > MAX_FRAME {
        bail!("Frame too large: {} bytes", payload.len());
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes())?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

pub fn read_frame<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<T> {
    let mut len = [0u8; 4];
    reader
        .read_exact(&mut len)
        .context("Connection closed before frame header")?;
    let len = u32::from_be_bytes(len);
    if len > MAX_FRAME {
        bail!("Frame too large: {len} bytes");
    }

    let mut payload = vec![0u8; len as usize];
    reader
        .read_exact(&mut payload)
        .context("Connection closed mid-frame")?;
    serde_json::from_slice(&payload).context("Malformed frame payload")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn frame_roundtrip() {
        let req = ControlRequest::Attach {
            id: 2,
            lun: 0,
            class: DeviceClass::Hd,
            file: Some(PathBuf::from("disk.hds")),
            block_size: Some(512),
            name: None,
        };

        let mut buf = Vec::new();
        write_frame(&mut buf, &req).unwrap();

        // Header carries the payload length
        let len = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        assert_eq!(len as usize, buf.len() - 4);

        let back: ControlRequest = read_frame(&mut Cursor::new(&buf)).unwrap();
        match back {
            ControlRequest::Attach { id, class, .. } => {
                assert_eq!(id, 2);
                assert_eq!(class, DeviceClass::Hd);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn result_roundtrip() {
        let res: ControlResult = Err(ControlError::Occupied { id: 1, lun: 0 });
        let mut buf = Vec::new();
        write_frame(&mut buf, &res).unwrap();
        let back: ControlResult = read_frame(&mut Cursor::new(&buf)).unwrap();
        assert!(matches!(back, Err(ControlError::Occupied { id: 1, lun: 0 })));
    }

    #[test]
    fn oversized_frame_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_FRAME + 1).to_be_bytes());
        let res: Result<ControlRequest> = read_frame(&mut Cursor::new(&buf));
        assert!(res.is_err());
    }
}
