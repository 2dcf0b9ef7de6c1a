//! The peer channel: one inbound reader task and one outbound writer task.
//!
//! Every producer of outbound events holds an [`Outbox`]; the writer task is
//! the only code that touches the output stream, so frames never interleave.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use undine_core::{decode_inbound, frame_encode, Decoded, FrameDecoder, Outbound, UndineError};

/// Read buffer size for the inbound stream.
const READ_BUF_SIZE: usize = 64 * 1024;

/// Outbound queue depth shared by all producers.
const OUTBOX_CAPACITY: usize = 64;

/// Handle for queueing events to the writer task.
#[derive(Clone)]
pub struct Outbox {
    tx: mpsc::Sender<Outbound>,
}

impl Outbox {
    /// Build an outbox and the receiving end the writer drains.
    pub fn pair(capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Queue an event. Returns false if the writer is gone.
    pub async fn send(&self, event: Outbound) -> bool {
        match self.tx.send(event).await {
            Ok(()) => true,
            Err(e) => {
                debug!(uuid = ?e.0.id(), "writer closed, event dropped");
                false
            }
        }
    }
}

/// Start the writer task over `output`.
///
/// On shutdown the writer stops accepting events, writes whatever was
/// already queued, flushes and exits.
pub fn spawn_writer<W>(
    output: W,
    shutdown: broadcast::Receiver<()>,
) -> (Outbox, JoinHandle<()>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (outbox, rx) = Outbox::pair(OUTBOX_CAPACITY);
    let handle = tokio::spawn(run_writer(output, rx, shutdown));
    (outbox, handle)
}

async fn run_writer<W>(
    mut output: W,
    mut rx: mpsc::Receiver<Outbound>,
    mut shutdown: broadcast::Receiver<()>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            biased;
            event = rx.recv() => match event {
                Some(event) => write_event(&mut output, &event).await,
                None => break,
            },
            _ = shutdown.recv() => {
                rx.close();
                while let Some(event) = rx.recv().await {
                    write_event(&mut output, &event).await;
                }
                break;
            }
        }
    }
    if let Err(e) = output.flush().await {
        debug!(error = %e, "final flush failed");
    }
    debug!("writer stopped");
}

/// Encode and write one frame. Failures are logged and swallowed.
async fn write_event<W>(output: &mut W, event: &Outbound)
where
    W: AsyncWrite + Unpin,
{
    let frame = match frame_encode(event) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(uuid = ?event.id(), error = %e, "encode error");
            return;
        }
    };
    let result = async {
        output.write_all(&frame).await?;
        output.flush().await
    }
    .await;
    if let Err(e) = result {
        warn!(uuid = ?event.id(), error = %e, "write error");
    }
}

/// What the reader task delivers to the dispatcher.
#[derive(Debug)]
pub enum ReadEvent {
    Record(Decoded),
    /// Input closed cleanly on a frame boundary.
    Eof,
    /// The stream is unusable from here on.
    Failed(UndineError),
}

/// Start the reader task over `input`.
///
/// Records are delivered one at a time; the task stops after `Eof` or
/// `Failed`.
pub fn spawn_reader<R>(input: R, max_frame_len: usize) -> mpsc::Receiver<ReadEvent>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(run_reader(input, max_frame_len, tx));
    rx
}

async fn run_reader<R>(mut input: R, max_frame_len: usize, tx: mpsc::Sender<ReadEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut decoder = FrameDecoder::with_max_frame_len(max_frame_len);
    let mut buf = vec![0u8; READ_BUF_SIZE];

    loop {
        let n = match input.read(&mut buf).await {
            Ok(0) => {
                let event = if decoder.pending() == 0 {
                    ReadEvent::Eof
                } else {
                    ReadEvent::Failed(UndineError::Codec(format!(
                        "input closed inside a frame ({} bytes pending)",
                        decoder.pending()
                    )))
                };
                let _ = tx.send(event).await;
                return;
            }
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                let _ = tx.send(ReadEvent::Failed(UndineError::Io(e))).await;
                return;
            }
        };

        let frames = match decoder.feed_raw(&buf[..n]) {
            Ok(frames) => frames,
            Err(e) => {
                let _ = tx.send(ReadEvent::Failed(e)).await;
                return;
            }
        };
        for payload in frames {
            let event = match decode_inbound(&payload) {
                Ok(decoded) => ReadEvent::Record(decoded),
                Err(e) => {
                    let _ = tx.send(ReadEvent::Failed(e)).await;
                    return;
                }
            };
            if tx.send(event).await.is_err() {
                debug!("dispatcher gone, reader stopping");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use undine_core::Inbound;

    #[tokio::test]
    async fn concurrent_producers_never_interleave_frames() {
        let (client, server) = tokio::io::duplex(256);
        let (shutdown_tx, _) = broadcast::channel(1);
        let (outbox, writer) = spawn_writer(server, shutdown_tx.subscribe());

        let mut producers = Vec::new();
        for p in 0..4u8 {
            let outbox = outbox.clone();
            producers.push(tokio::spawn(async move {
                for i in 0..50u8 {
                    let event = if p == 0 {
                        Outbound::Ping
                    } else {
                        Outbound::Stdout {
                            id: format!("p{p}"),
                            buf: vec![i; 300],
                        }
                    };
                    outbox.send(event).await;
                }
            }));
        }

        let reader = tokio::spawn(async move {
            let mut client = client;
            let mut decoder = FrameDecoder::new();
            let mut events: Vec<Outbound> = Vec::new();
            let mut buf = [0u8; 1024];
            loop {
                let n = client.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                events.extend(decoder.feed::<Outbound>(&buf[..n]).unwrap());
            }
            assert_eq!(decoder.pending(), 0);
            events
        });

        for p in producers {
            p.await.unwrap();
        }
        drop(outbox);
        writer.await.unwrap();

        let events = reader.await.unwrap();
        assert_eq!(events.len(), 200);
        for p in 1..4u8 {
            let id = format!("p{p}");
            let seq: Vec<u8> = events
                .iter()
                .filter_map(|e| match e {
                    Outbound::Stdout { id: eid, buf } if *eid == id => Some(buf[0]),
                    _ => None,
                })
                .collect();
            assert_eq!(seq, (0..50u8).collect::<Vec<_>>());
        }
    }

    #[tokio::test]
    async fn shutdown_drains_queued_events() {
        let (mut client, server) = tokio::io::duplex(4096);
        let (shutdown_tx, _) = broadcast::channel(1);
        let (outbox, writer) = spawn_writer(server, shutdown_tx.subscribe());

        outbox
            .send(Outbound::error("", undine_core::ErrorCode::Fatal, "bye"))
            .await;
        shutdown_tx.send(()).unwrap();
        writer.await.unwrap();
        assert!(!outbox.send(Outbound::Ping).await);

        let mut bytes = Vec::new();
        drop(outbox);
        client.read_to_end(&mut bytes).await.unwrap();
        let events: Vec<Outbound> = FrameDecoder::new().feed(&bytes).unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Outbound::Error { .. }));
    }

    #[tokio::test]
    async fn reader_decodes_then_reports_eof() {
        let mut bytes = frame_encode(&Inbound::Ping).unwrap();
        bytes.extend(frame_encode(&Inbound::RequestReport { id: "r".into() }).unwrap());
        let mut rx = spawn_reader(std::io::Cursor::new(bytes), 1024);

        assert!(matches!(
            rx.recv().await,
            Some(ReadEvent::Record(Decoded::Record(Inbound::Ping)))
        ));
        assert!(matches!(
            rx.recv().await,
            Some(ReadEvent::Record(Decoded::Record(Inbound::RequestReport { .. })))
        ));
        assert!(matches!(rx.recv().await, Some(ReadEvent::Eof)));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn truncated_input_is_a_failure() {
        let bytes = frame_encode(&Inbound::Ping).unwrap();
        let mut rx = spawn_reader(std::io::Cursor::new(bytes[..3].to_vec()), 1024);
        assert!(matches!(rx.recv().await, Some(ReadEvent::Failed(_))));
    }

    #[tokio::test]
    async fn oversized_frame_is_a_failure() {
        let mut rx = spawn_reader(std::io::Cursor::new(vec![0, 1, 0, 0, 0]), 1024);
        assert!(matches!(
            rx.recv().await,
            Some(ReadEvent::Failed(UndineError::FrameTooLarge { .. }))
        ));
    }
}
