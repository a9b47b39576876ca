//! Control-plane socket server
//!
//! A listener thread accepts Unix socket connections and forwards each
//! decoded request into a mailbox. The reactor drains the mailbox only
//! between commands, so control operations never race a transfer; the
//! per-request bounded channel carries the reply back to the connection
//! thread.

use std::fs;
use std::io::{BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Result;
use crossbeam_channel::{Receiver, Sender};
use log::*;

use super::proto::{read_frame, write_frame, ControlRequest, ControlResult};

/// Default location of the control socket
pub const DEFAULT_SOCKET: &str = "/var/run/slate.sock";

/// Message from the server to the reactor
pub enum ControlMessage {
    Request {
        request: ControlRequest,
        response_tx: Sender<ControlResult>,
    },
    Shutdown,
}

pub struct ControlServer {
    socket_path: PathBuf,
    running: Arc<AtomicBool>,
    listener_thread: Option<JoinHandle<()>>,
    request_tx: Sender<ControlMessage>,
    request_rx: Receiver<ControlMessage>,
}

impl ControlServer {
    pub fn new(socket_path: &Path) -> Self {
        let (request_tx, request_rx) = crossbeam_channel::unbounded();
        Self {
            socket_path: socket_path.to_path_buf(),
            running: Arc::new(AtomicBool::new(false)),
            listener_thread: None,
            request_tx,
            request_rx,
        }
    }

    /// The mailbox the reactor drains at phase boundaries.
    pub fn receiver(&self) -> Receiver<ControlMessage> {
        self.request_rx.clone()
    }

    pub fn start(&mut self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);

        if self.socket_path.exists() {
            fs::remove_file(&self.socket_path)?;
        }
        let listener = UnixListener::bind(&self.socket_path)?;
        listener.set_nonblocking(true)?;

        info!("Control server listening on {}", self.socket_path.display());

        let running = self.running.clone();
        let request_tx = self.request_tx.clone();
        let socket_path = self.socket_path.clone();

        self.listener_thread = Some(thread::spawn(move || {
            Self::listen_loop(&listener, &running, &request_tx);
            let _ = fs::remove_file(&socket_path);
        }));

        Ok(())
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.request_tx.send(ControlMessage::Shutdown);

        if let Some(t) = self.listener_thread.take() {
            let _ = t.join();
        }
        if self.socket_path.exists() {
            let _ = fs::remove_file(&self.socket_path);
        }
    }

    fn listen_loop(
        listener: &UnixListener,
        running: &Arc<AtomicBool>,
        request_tx: &Sender<ControlMessage>,
    ) {
        while running.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, _)) => {
                    let tx = request_tx.clone();
                    thread::spawn(move || {
                        if let Err(e) = Self::handle_connection(stream, &tx) {
                            debug!("Control connection ended: {e:#}");
                        }
                    });
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(10));
                }
                Err(e) => {
                    error!("Control socket accept error: {e}");
                    thread::sleep(Duration::from_millis(100));
                }
            }
        }
    }

    fn handle_connection(stream: UnixStream, request_tx: &Sender<ControlMessage>) -> Result<()> {
        stream.set_read_timeout(Some(Duration::from_secs(30)))?;
        stream.set_write_timeout(Some(Duration::from_secs(30)))?;

        let mut reader = BufReader::new(stream.try_clone()?);
        let mut writer = stream;

        loop {
            let request: ControlRequest = match read_frame(&mut reader) {
                Ok(r) => r,
                // Peer hung up between requests
                Err(_) => return Ok(()),
            };

            let (response_tx, response_rx) = crossbeam_channel::bounded(1);
            request_tx.send(ControlMessage::Request {
                request,
                response_tx,
            })?;

            // The reactor answers between bus commands; a long transfer
            // can delay this but never indefinitely
            let response = response_rx
                .recv_timeout(Duration::from_secs(30))
                .unwrap_or_else(|_| {
                    Err(super::proto::ControlError::Invalid {
                        message: "Server busy".into(),
                    })
                });

            write_frame(&mut writer, &response)?;
            writer.flush()?;
        }
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        self.stop();
    }
}
