//! Dispatcher: decodes peer records one at a time and routes them.
//!
//! Owns the child registry. Spawns, stdin forwarding and host queries are
//! handled inline; each spawned child gets a relay task that feeds the
//! shared outbox. Only a broken input stream ends the loop for good.

use crate::channel::{self, Outbox, ReadEvent};
use crate::config::DaemonConfig;
use crate::heartbeat::{self, PingSignal};
use crate::host;
use crate::session::{Child, ChildOptions, CommandSpec, Reaped, Registry, Relay};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};
use undine_core::{Decoded, ErrorCode, Inbound, InboundKind, Outbound};

/// Why the daemon stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Shutdown {
    /// The peer closed the input stream.
    EndOfInput,
    /// The input stream is malformed or desynchronized.
    DecodeError(String),
    /// No ping arrived within the watchdog window.
    PingTimeout,
}

impl Shutdown {
    pub fn exit_code(&self) -> i32 {
        match self {
            Shutdown::EndOfInput => 0,
            Shutdown::DecodeError(_) | Shutdown::PingTimeout => 1,
        }
    }
}

struct Daemon {
    config: DaemonConfig,
    registry: Registry,
    outbox: Outbox,
    ping: PingSignal,
    reaped_tx: mpsc::UnboundedSender<Reaped>,
    shutdown_tx: broadcast::Sender<()>,
}

/// Serve the peer on `input` / `output` until the input ends or breaks.
pub async fn run<R, W>(config: DaemonConfig, input: R, output: W) -> Shutdown
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (shutdown_tx, _) = broadcast::channel(1);
    let (outbox, writer) = channel::spawn_writer(output, shutdown_tx.subscribe());
    let mut inbound = channel::spawn_reader(input, config.max_frame_len);
    let mut heartbeat = heartbeat::spawn(config.heartbeat.clone(), outbox.clone(), &shutdown_tx);
    let (reaped_tx, mut reaped_rx) = mpsc::unbounded_channel();

    let mut daemon = Daemon {
        registry: Registry::new(config.max_children),
        config,
        outbox,
        ping: heartbeat.signal.clone(),
        reaped_tx,
        shutdown_tx: shutdown_tx.clone(),
    };

    let reason = loop {
        tokio::select! {
            event = inbound.recv() => match event {
                Some(ReadEvent::Record(decoded)) => daemon.dispatch(decoded).await,
                Some(ReadEvent::Eof) | None => break Shutdown::EndOfInput,
                Some(ReadEvent::Failed(e)) => {
                    error!(code = e.error_code().as_str(), error = %e, "decode error");
                    daemon
                        .outbox
                        .send(Outbound::error("", ErrorCode::Fatal, e.to_string()))
                        .await;
                    break Shutdown::DecodeError(e.to_string());
                }
            },
            Some(reaped) = reaped_rx.recv() => {
                daemon.registry.remove(&reaped.id, reaped.serial);
            }
            Some(()) = heartbeat.expired.recv() => {
                error!("peer silent past the ping timeout, shutting down");
                break Shutdown::PingTimeout;
            }
        }
    };

    info!(
        reason = ?reason,
        stale_windows = heartbeat.stale_windows(),
        "dispatcher stopping"
    );
    let _ = shutdown_tx.send(());
    if !daemon.registry.is_empty() {
        info!(live = daemon.registry.len(), "killing live children");
        daemon.registry.shutdown();
    }
    drop(daemon);
    if let Err(e) = writer.await {
        warn!(error = %e, "writer task failed");
    }
    reason
}

impl Daemon {
    async fn dispatch(&mut self, decoded: Decoded) {
        let record = match decoded {
            Decoded::Record(record) => record,
            Decoded::Unrecognized { tag, reason } => {
                warn!(tag = ?tag, reason = %reason, "unknown packet");
                return;
            }
        };
        if record.kind() != InboundKind::Ping {
            debug!(kind = record.kind().tag(), uuid = ?record.id(), "packet received");
        }

        match record {
            Inbound::Command { id, command, args } => {
                self.spawn_command(CommandSpec {
                    id,
                    program: command,
                    args,
                })
                .await;
            }
            Inbound::Stdin { id, buf } => self.forward_stdin(&id, buf).await,
            Inbound::RequestReport { id } => {
                self.outbox.send(host::report(&id)).await;
            }
            Inbound::RequestChdir { id, dir } => {
                if let Err(e) = host::change_dir(&dir) {
                    warn!(uuid = %id, dir = %dir, error = %e, "chdir failed");
                }
                self.outbox.send(host::report(&id)).await;
            }
            Inbound::RequestGlob { id, pattern } => match host::glob(&pattern) {
                Ok(names) => {
                    self.outbox.send(Outbound::DirEntry { id, names }).await;
                }
                Err(e) => warn!(uuid = %id, error = %e, "glob failed"),
            },
            Inbound::Ping => self.ping.mark(),
        }
    }

    async fn spawn_command(&mut self, spec: CommandSpec) {
        let id = spec.id.clone();
        if let Err(e) = self.registry.admit(&id) {
            warn!(uuid = %id, code = e.error_code().as_str(), error = %e, "command rejected");
            self.outbox
                .send(Outbound::error(id, e.error_code(), e.to_string()))
                .await;
            return;
        }

        let mut child = Child::new(
            spec,
            ChildOptions {
                queue_capacity: self.config.queue_capacity,
                read_chunk_size: self.config.read_chunk_size,
            },
        );
        let output = match child.exec() {
            Ok(output) => output,
            Err(e) => {
                warn!(uuid = %id, code = e.error_code().as_str(), error = %e, "fork error");
                self.outbox
                    .send(Outbound::error(id, e.error_code(), e.to_string()))
                    .await;
                return;
            }
        };

        info!(
            uuid = %id,
            pid = ?child.pid().map(|p| p.as_raw()),
            program = %child.spec().program,
            "command started"
        );
        let serial = match self.registry.insert(child) {
            Ok(serial) => serial,
            Err(e) => {
                // admit() passed above and nothing ran in between.
                error!(uuid = %id, error = %e, "registry insert failed");
                return;
            }
        };
        Relay {
            id,
            serial,
            output,
            outbox: self.outbox.clone(),
            reaped: self.reaped_tx.clone(),
            drain_grace: self.config.drain_grace,
            shutdown: self.shutdown_tx.subscribe(),
        }
        .spawn();
    }

    async fn forward_stdin(&self, id: &str, buf: Vec<u8>) {
        let child = match self.registry.get(id) {
            Ok(child) => child,
            Err(e) => {
                warn!(len = buf.len(), error = %e, "stdin packet dropped");
                return;
            }
        };
        if let Err(e) = child.write_stdin(buf).await {
            warn!(uuid = %id, error = %e, "stdin dropped");
        }
    }
}
