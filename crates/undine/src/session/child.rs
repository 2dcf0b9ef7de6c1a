//! Process supervisor: one spawned command and its pseudo-terminal.
//!
//! After a successful [`Child::exec`] four workers run per child: a reaper
//! waiting for termination, two output pumps (stdout, stderr) and a stdin
//! pump. They do blocking I/O on dedicated threads and talk to the async
//! side through bounded queues and a one-shot exit slot.

use super::pty::{self, ExitState, PtyProcess};
use nix::libc;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use undine_core::{Outbound, UndineError, UndineResult};

/// What the peer asked to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub id: String,
    pub program: String,
    pub args: Vec<String>,
}

/// Lifecycle of a [`Child`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildState {
    Created,
    Running,
    Exited,
    SpawnFailed,
}

/// Queue sizing for a child's workers.
#[derive(Debug, Clone, Copy)]
pub struct ChildOptions {
    pub queue_capacity: usize,
    pub read_chunk_size: usize,
}

impl Default for ChildOptions {
    fn default() -> Self {
        Self {
            queue_capacity: 1,
            read_chunk_size: 1024 * 1024,
        }
    }
}

/// Receiving ends handed to the relay after a successful spawn.
pub struct ChildOutput {
    pub stdout: mpsc::Receiver<Vec<u8>>,
    pub stderr: mpsc::Receiver<Vec<u8>>,
    pub exit: oneshot::Receiver<ExitState>,
}

pub struct Child {
    spec: CommandSpec,
    options: ChildOptions,
    state: ChildState,
    pid: Option<Pid>,
    stdin_tx: Option<mpsc::Sender<Vec<u8>>>,
    exited: Arc<AtomicBool>,
}

impl Child {
    /// Construct a supervisor; no OS resources are allocated yet.
    pub fn new(spec: CommandSpec, options: ChildOptions) -> Self {
        Self {
            spec,
            options,
            state: ChildState::Created,
            pid: None,
            stdin_tx: None,
            exited: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn spec(&self) -> &CommandSpec {
        &self.spec
    }

    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    pub fn state(&self) -> ChildState {
        if self.state == ChildState::Running && self.exited.load(Ordering::Acquire) {
            ChildState::Exited
        } else {
            self.state
        }
    }

    /// Spawn the process and start its workers.
    ///
    /// On failure the child is left in [`ChildState::SpawnFailed`] with no
    /// workers running.
    pub fn exec(&mut self) -> UndineResult<ChildOutput> {
        if self.state != ChildState::Created {
            return Err(UndineError::Other(format!(
                "child {} already started",
                self.spec.id
            )));
        }

        let proc = match pty::spawn(&self.spec.program, &self.spec.args) {
            Ok(proc) => proc,
            Err(e) => {
                self.state = ChildState::SpawnFailed;
                return Err(e);
            }
        };
        let PtyProcess {
            pid,
            output,
            input,
            errors,
        } = proc;

        let capacity = self.options.queue_capacity.max(1);
        let chunk = self.options.read_chunk_size.max(1);
        let (stdin_tx, stdin_rx) = mpsc::channel(capacity);
        let (stdout_tx, stdout_rx) = mpsc::channel(capacity);
        let (stderr_tx, stderr_rx) = mpsc::channel(capacity);
        let (exit_tx, exit_rx) = oneshot::channel();

        let id = self.spec.id.clone();
        let exited = self.exited.clone();
        let workers = [
            worker("reap", pid, {
                let id = id.clone();
                move || reap(pid, exit_tx, exited, id)
            }),
            worker("stdout", pid, {
                let id = id.clone();
                move || pump_output(output, stdout_tx, chunk, "stdout", id)
            }),
            worker("stderr", pid, {
                let id = id.clone();
                move || pump_output(errors, stderr_tx, chunk, "stderr", id)
            }),
            worker("stdin", pid, move || pump_input(input, stdin_rx, id)),
        ];
        if let Some(err) = workers.into_iter().find_map(Result::err) {
            warn!(uuid = %self.spec.id, error = %err, "failed to start child workers");
            let _ = signal::killpg(pid, Signal::SIGKILL);
            self.state = ChildState::SpawnFailed;
            return Err(UndineError::Spawn(format!("worker thread: {err}")));
        }

        self.pid = Some(pid);
        self.stdin_tx = Some(stdin_tx);
        self.state = ChildState::Running;

        Ok(ChildOutput {
            stdout: stdout_rx,
            stderr: stderr_rx,
            exit: exit_rx,
        })
    }

    /// Queue bytes for the child's terminal input, in arrival order.
    ///
    /// Waits while the queue is full.
    pub async fn write_stdin(&self, buf: Vec<u8>) -> UndineResult<()> {
        match self.state() {
            ChildState::Running => {}
            state => {
                return Err(UndineError::ChannelClosed(format!(
                    "child {} is {state:?}",
                    self.spec.id
                )))
            }
        }
        let tx = self
            .stdin_tx
            .as_ref()
            .ok_or_else(|| UndineError::ChannelClosed("stdin queue missing".into()))?;
        tx.send(buf)
            .await
            .map_err(|_| UndineError::ChannelClosed("stdin queue closed".into()))
    }

    /// Kill the child's process group if it is still running.
    pub fn kill(&self) -> UndineResult<()> {
        let Some(pid) = self.pid else {
            return Ok(());
        };
        if self.state() != ChildState::Running {
            return Ok(());
        }
        // setsid made the child a group leader; take descendants with it.
        signal::killpg(pid, Signal::SIGKILL)
            .or_else(|_| signal::kill(pid, Signal::SIGKILL))
            .map_err(|e| UndineError::Other(format!("kill failed: {e}")))?;
        info!(uuid = %self.spec.id, pid = pid.as_raw(), "child killed");
        Ok(())
    }
}

impl ExitState {
    /// Wire event for this exit, tagged with `id`.
    pub fn to_event(&self, id: &str) -> Outbound {
        Outbound::Exit {
            id: id.to_string(),
            success: self.success,
            message: self.message.clone(),
            systime: duration_nanos(self.sys_time),
            usertime: duration_nanos(self.user_time),
            code: self.code,
        }
    }
}

fn duration_nanos(d: std::time::Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

fn worker<F>(role: &str, pid: Pid, f: F) -> std::io::Result<()>
where
    F: FnOnce() + Send + 'static,
{
    std::thread::Builder::new()
        .name(format!("undine-{role}-{}", pid.as_raw()))
        .spawn(f)
        .map(|_| ())
}

fn reap(pid: Pid, exit_tx: oneshot::Sender<ExitState>, exited: Arc<AtomicBool>, id: String) {
    match pty::wait_for_exit(pid) {
        Ok(state) => {
            exited.store(true, Ordering::Release);
            info!(uuid = %id, pid = pid.as_raw(), status = %state.message, "child exited");
            if exit_tx.send(state).is_err() {
                debug!(uuid = %id, "exit state dropped, relay gone");
            }
        }
        Err(e) => {
            warn!(uuid = %id, pid = pid.as_raw(), error = %e, "process wait error");
        }
    }
}

/// Forward terminal output as chunks until end-of-stream.
///
/// Linux reports a hung-up master as `EIO`; that counts as end-of-stream.
fn pump_output(
    mut reader: File,
    tx: mpsc::Sender<Vec<u8>>,
    chunk: usize,
    stream: &'static str,
    id: String,
) {
    let mut buf = vec![0u8; chunk];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => {
                debug!(uuid = %id, stream, "end of stream");
                return;
            }
            Ok(n) => {
                if tx.blocking_send(buf[..n].to_vec()).is_err() {
                    debug!(uuid = %id, stream, "relay gone, stopping pump");
                    return;
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if e.raw_os_error() == Some(libc::EIO) => {
                debug!(uuid = %id, stream, "end of stream");
                return;
            }
            Err(e) => {
                warn!(uuid = %id, stream, error = %e, "read error");
                return;
            }
        }
    }
}

/// Write queued buffers to the terminal until the queue is dropped.
fn pump_input(mut writer: File, mut rx: mpsc::Receiver<Vec<u8>>, id: String) {
    while let Some(buf) = rx.blocking_recv() {
        if let Err(e) = writer.write_all(&buf).and_then(|()| writer.flush()) {
            warn!(uuid = %id, len = buf.len(), error = %e, "stdin write error");
        }
    }
    debug!(uuid = %id, "stdin queue closed");
}
