//! Relay task: forwards one child's output and exit onto the shared outbox.
//!
//! Output keeps flowing after the exit is observed until both streams hit
//! end-of-stream or stay idle for the drain grace period; the exit report
//! is sent last and the task stops. Time spent waiting on the outbox does
//! not count against the grace.

use super::child::ChildOutput;
use super::pty::ExitState;
use crate::channel::Outbox;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};
use undine_core::Outbound;

/// Sent to the dispatcher once a child's exit has been forwarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reaped {
    pub id: String,
    pub serial: u64,
}

pub struct Relay {
    pub id: String,
    pub serial: u64,
    pub output: ChildOutput,
    pub outbox: Outbox,
    pub reaped: mpsc::UnboundedSender<Reaped>,
    pub drain_grace: Duration,
    pub shutdown: broadcast::Receiver<()>,
}

impl Relay {
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        let Relay {
            id,
            serial,
            output,
            outbox,
            reaped,
            drain_grace,
            mut shutdown,
        } = self;
        let ChildOutput {
            mut stdout,
            mut stderr,
            exit: mut exit_rx,
        } = output;

        let mut stdout_open = true;
        let mut stderr_open = true;
        let mut reaper_alive = true;
        let mut exit: Option<ExitState> = None;
        let mut drain_deadline = Instant::now();

        loop {
            let streams_done = !stdout_open && !stderr_open;
            if streams_done && (exit.is_some() || !reaper_alive) {
                break;
            }

            // Ready output always wins over the grace deadline.
            tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    debug!(uuid = %id, "relay stopped by shutdown");
                    return;
                }
                chunk = stdout.recv(), if stdout_open => match chunk {
                    Some(buf) => {
                        outbox.send(Outbound::Stdout { id: id.clone(), buf }).await;
                        drain_deadline = Instant::now() + drain_grace;
                    }
                    None => stdout_open = false,
                },
                chunk = stderr.recv(), if stderr_open => match chunk {
                    Some(buf) => {
                        outbox.send(Outbound::Stderr { id: id.clone(), buf }).await;
                        drain_deadline = Instant::now() + drain_grace;
                    }
                    None => stderr_open = false,
                },
                state = &mut exit_rx, if exit.is_none() && reaper_alive => match state {
                    Ok(state) => {
                        drain_deadline = Instant::now() + drain_grace;
                        exit = Some(state);
                    }
                    Err(_) => {
                        warn!(uuid = %id, "reaper stopped without an exit status");
                        reaper_alive = false;
                    }
                },
                _ = sleep_until(drain_deadline), if exit.is_some() => {
                    debug!(uuid = %id, "drain grace elapsed");
                    break;
                }
            }
        }

        match exit {
            Some(state) => {
                outbox.send(state.to_event(&id)).await;
                let _ = reaped.send(Reaped { id, serial });
            }
            None => {
                // Child is inert but may still be alive; keep its entry.
                warn!(uuid = %id, "relay finished without an exit report");
            }
        }
    }
}
