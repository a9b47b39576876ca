//! Control plane: Unix-socket protocol, server thread, request handling
//!
//! Mutations reach the device map only through the reactor's mailbox
//! drain, between bus commands. A control client therefore never
//! observes (or causes) a half-executed SCSI command.

pub mod handler;
pub mod proto;
pub mod server;

pub use handler::ServerState;
pub use proto::{
    ControlError, ControlRequest, ControlResponse, ControlResult, DeviceInfo,
};
pub use server::{ControlMessage, ControlServer, DEFAULT_SOCKET};
