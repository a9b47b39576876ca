//! The reactor: waits on bus events, fans selections into controllers
//!
//! One thread owns the bus, every controller and the device map. Control
//! requests and host action requests are drained only between commands,
//! so a transfer in flight is never disturbed.

use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use crossbeam_channel::Receiver;
use log::*;

use super::Controller;
use crate::bus::{BusPhase, ScsiBus};
use crate::control::{ControlMessage, ControlRequest, ServerState};
use crate::hal::SelEvent;
use crate::targets::hostservices::SystemAction;

/// How long one reactor wait lasts before the mailbox is drained again
const SELECT_WAIT: Duration = Duration::from_millis(100);

pub struct Orchestrator<B: ScsiBus> {
    bus: B,
    controllers: [Option<Controller>; 8],
    state: ServerState,
    control_rx: Receiver<ControlMessage>,
    actions_rx: Receiver<SystemAction>,
    shutdown: Arc<AtomicBool>,
}

impl<B: ScsiBus> Orchestrator<B> {
    pub fn new(
        bus: B,
        state: ServerState,
        control_rx: Receiver<ControlMessage>,
        actions_rx: Receiver<SystemAction>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            bus,
            controllers: Default::default(),
            state,
            control_rx,
            actions_rx,
            shutdown,
        }
    }

    pub fn state(&self) -> &ServerState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut ServerState {
        &mut self.state
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    /// The reactor loop. Returns when a shutdown is requested, after an
    /// orderly teardown at BusFree.
    pub fn run(&mut self) -> Result<()> {
        self.bus.release();
        info!("Reactor running");

        loop {
            // Phase boundary: apply control traffic and host actions
            self.drain_control();
            self.drain_actions();

            if self.shutdown.load(Ordering::SeqCst) {
                self.teardown();
                return Ok(());
            }

            match self.bus.wait_event_select(Some(SELECT_WAIT))? {
                SelEvent::Timeout => continue,
                SelEvent::Edge => (),
            }

            let sample = self.bus.acquire();
            if sample.phase() != BusPhase::Selection || sample.bsy {
                continue;
            }
            if sample.rst {
                self.reset_all();
                continue;
            }

            // The selected target is our attached ID on DAT; the other
            // set bit is the initiator
            let Some(id) = (0..8u8).find(|&id| {
                sample.dat & (1 << id) != 0
                    && !self.state.reserved_ids[usize::from(id)]
                    && self.state.devices.target(id).has_units()
            }) else {
                continue;
            };

            let controller = self.controllers[usize::from(id)]
                .get_or_insert_with(|| Controller::new(id));
            controller.process(&mut self.bus, self.state.devices.target_mut(id), sample);
        }
    }

    /// RST seen outside a command: latch attention everywhere.
    fn reset_all(&mut self) {
        debug!("Reset observed at BusFree");
        for id in 0..8u8 {
            if let Some(c) = self.controllers[usize::from(id)].as_mut() {
                c.reset(&mut self.bus, self.state.devices.target_mut(id));
            }
        }
    }

    fn drain_control(&mut self) {
        while let Ok(msg) = self.control_rx.try_recv() {
            match msg {
                ControlMessage::Request {
                    request,
                    response_tx,
                } => {
                    if matches!(
                        request,
                        ControlRequest::Shutdown | ControlRequest::StopBus
                    ) {
                        info!("Shutdown requested via control plane");
                        self.shutdown.store(true, Ordering::SeqCst);
                    }
                    let response = self.state.apply(&request);
                    let _ = response_tx.send(response);
                }
                ControlMessage::Shutdown => {
                    self.shutdown.store(true, Ordering::SeqCst);
                }
            }
        }
    }

    fn drain_actions(&mut self) {
        while let Ok(action) = self.actions_rx.try_recv() {
            match action {
                SystemAction::StopEmulator => {
                    self.shutdown.store(true, Ordering::SeqCst);
                }
                SystemAction::StopHost => {
                    info!("Host shutdown requested by initiator");
                    spawn_host_command(&["shutdown", "-h", "now"]);
                }
                SystemAction::RestartHost => {
                    info!("Host restart requested by initiator");
                    spawn_host_command(&["shutdown", "-r", "now"]);
                }
            }
        }
    }

    /// Orderly teardown: flush every unit, release the bus.
    fn teardown(&mut self) {
        info!("Reactor shutting down");
        for (id, lun) in self.state.devices.addresses() {
            if let Some(unit) = self.state.devices.target_mut(id).unit_mut(lun) {
                if let Err(e) = unit.flush_media() {
                    error!("Flush of {id}:{lun} on shutdown failed: {e}");
                }
            }
        }
        self.bus.release();
    }
}

fn spawn_host_command(args: &[&str]) {
    match Command::new(args[0]).args(&args[1..]).spawn() {
        Ok(_) => (),
        Err(e) => error!("Failed to run {:?}: {}", args, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::soft::SoftBus;
    use crate::control::ControlResponse;
    use crate::image::AccessMode;
    use crate::targets::DeviceClass;
    use std::fs;
    use std::path::PathBuf;

    fn fixture() -> (
        tempfile::TempDir,
        Orchestrator<SoftBus>,
        crossbeam_channel::Sender<ControlMessage>,
        crossbeam_channel::Sender<SystemAction>,
        Arc<AtomicBool>,
    ) {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("disk.hds"), vec![0u8; 512 * 8]).unwrap();

        let (ctl_tx, ctl_rx) = crossbeam_channel::unbounded();
        let (actions_tx, actions_rx) = crossbeam_channel::unbounded();
        let state = ServerState::new(
            dir.path().to_path_buf(),
            AccessMode::Raw,
            actions_tx.clone(),
        );
        let shutdown = Arc::new(AtomicBool::new(false));
        let orch = Orchestrator::new(
            SoftBus::new(),
            state,
            ctl_rx,
            actions_rx,
            shutdown.clone(),
        );
        (dir, orch, ctl_tx, actions_tx, shutdown)
    }

    #[test]
    fn control_requests_applied_then_shutdown_honored() {
        let (_dir, mut orch, ctl_tx, _actions_tx, _shutdown) = fixture();

        let (attach_tx, attach_rx) = crossbeam_channel::bounded(1);
        ctl_tx
            .send(ControlMessage::Request {
                request: ControlRequest::Attach {
                    id: 1,
                    lun: 0,
                    class: DeviceClass::Hd,
                    file: Some(PathBuf::from("disk.hds")),
                    block_size: None,
                    name: None,
                },
                response_tx: attach_tx,
            })
            .unwrap();

        let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
        ctl_tx
            .send(ControlMessage::Request {
                request: ControlRequest::Shutdown,
                response_tx: stop_tx,
            })
            .unwrap();

        orch.run().unwrap();

        assert!(matches!(attach_rx.try_recv(), Ok(Ok(ControlResponse::Ok))));
        assert!(matches!(stop_rx.try_recv(), Ok(Ok(ControlResponse::Ok))));
        assert!(orch.state().devices.target(1).unit(0).is_some());
    }

    #[test]
    fn initiator_stop_request_ends_the_reactor() {
        let (_dir, mut orch, _ctl_tx, actions_tx, shutdown) = fixture();
        actions_tx.send(SystemAction::StopEmulator).unwrap();
        orch.run().unwrap();
        assert!(shutdown.load(Ordering::SeqCst));
    }
}
