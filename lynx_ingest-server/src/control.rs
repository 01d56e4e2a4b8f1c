use std::net::IpAddr;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use log::{error, info, warn};
use lynx_ingest_lib::{Acquisition, AcquisitionState, AcquisitionStatus};
use tokio::sync::oneshot;

type Reply<T> = oneshot::Sender<Result<T, String>>;

/// Everything the HTTP side may ask of the acquisition.
pub enum Command {
    Status(oneshot::Sender<AcquisitionStatus>),
    SetPort(String, Reply<u16>),
    SelectAddress(IpAddr, Reply<()>),
    Refresh(Reply<()>),
    Start(Reply<()>),
    Stop(Reply<()>),
}

/// Cloneable handle to the control thread.
#[derive(Clone)]
pub struct ControlHandle {
    tx: Sender<Command>,
}

impl ControlHandle {
    pub async fn status(&self) -> Option<AcquisitionStatus> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(Command::Status(reply)).ok()?;
        rx.await.ok()
    }

    /// Send a command and wait for its outcome.
    pub async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T, String> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .map_err(|_| "control thread has stopped".to_string())?;
        rx.await.map_err(|_| "control thread dropped the request".to_string())?
    }
}

/// Run `acq` on a dedicated thread that serializes every command and, while not
/// acquiring, checks for the input source every `interval`.
pub fn spawn(mut acq: Acquisition, interval: Duration) -> std::io::Result<ControlHandle> {
    let (tx, rx) = channel::bounded::<Command>(64);

    thread::Builder::new().name("lynx-control".into()).spawn(move || {
        let mut next_check = Instant::now();
        loop {
            let wait = next_check.saturating_duration_since(Instant::now());
            match rx.recv_timeout(wait) {
                Ok(cmd) => handle(&mut acq, cmd),
                Err(RecvTimeoutError::Timeout) => {
                    if acq.poll() != AcquisitionState::Acquiring {
                        acq.found_input_source();
                    }
                    next_check = Instant::now() + interval;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        info!("Control thread exiting");
        acq.stop_acquisition();
    })?;

    Ok(ControlHandle { tx })
}

fn handle(acq: &mut Acquisition, cmd: Command) {
    match cmd {
        Command::Status(reply) => {
            acq.poll();
            let _ = reply.send(acq.status());
        }
        Command::SetPort(text, reply) => {
            let result = acq.set_port_text(&text).map_err(|e| {
                warn!("Rejected port {:?}: {}", text, e);
                e.to_string()
            });
            let _ = reply.send(result);
        }
        Command::SelectAddress(ip, reply) => {
            let _ = reply.send(acq.select_address(ip).map_err(|e| e.to_string()));
        }
        Command::Refresh(reply) => {
            let result = if acq.request_refresh() {
                // run the check now instead of waiting for the next tick
                acq.found_input_source();
                Ok(())
            } else {
                Err("refresh is unavailable while acquiring".to_string())
            };
            let _ = reply.send(result);
        }
        Command::Start(reply) => {
            if acq.poll() == AcquisitionState::Idle {
                acq.found_input_source();
            }
            let _ = reply.send(acq.start_acquisition().map_err(|e| e.to_string()));
        }
        Command::Stop(reply) => {
            let result = if acq.stop_acquisition() {
                Ok(())
            } else {
                error!("Acquisition did not stop cleanly");
                Err("receive loop did not stop in time".to_string())
            };
            let _ = reply.send(result);
        }
    }
}
