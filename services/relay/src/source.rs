//! RTT source transport: framer and reconnect supervisor.
//!
//! The firmware side exposes a raw TCP byte stream of COBS frames delimited
//! by `0x00`. The framer splits that stream into owned frame buffers and
//! hands them to the transformer over a bounded queue. The supervisor owns
//! the dial/retry loop around one configured address; frames in flight when
//! a connection drops are lost, as is any partial frame left in the read
//! buffer.

use crate::config::SourceConfig;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_util::codec::{Decoder, FramedRead};
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Frame codec
// ---------------------------------------------------------------------------

/// Splits the byte stream on `0x00`, strips the delimiter, and skips empty
/// frames. Yields owned buffers so the rest of the pipeline never borrows
/// the read buffer.
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, Self::Error> {
        loop {
            let Some(pos) = src.iter().position(|b| *b == 0x00) else {
                return Ok(None);
            };
            let frame = src.split_to(pos + 1);
            if pos == 0 {
                // Consecutive delimiters produce empty frames; drop silently.
                continue;
            }
            return Ok(Some(frame.freeze().slice(0..pos)));
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Why one source connection ended.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("source closed the connection")]
    Disconnected,
    #[error("source read failed: {0}")]
    Read(std::io::Error),
}

// ---------------------------------------------------------------------------
// Framer
// ---------------------------------------------------------------------------

enum ReadOutcome {
    Frame(Bytes),
    Timeout,
    Eof,
    Failed(std::io::Error),
}

async fn read_next(
    framed: &mut FramedRead<TcpStream, FrameCodec>,
    deadline: Option<Duration>,
) -> ReadOutcome {
    let next = framed.next();
    let item = match deadline {
        Some(deadline) => match tokio::time::timeout(deadline, next).await {
            Ok(item) => item,
            Err(_) => return ReadOutcome::Timeout,
        },
        None => next.await,
    };
    match item {
        Some(Ok(frame)) => ReadOutcome::Frame(frame),
        Some(Err(e)) => ReadOutcome::Failed(e),
        None => ReadOutcome::Eof,
    }
}

/// Drive one connection: read frames until the stream fails or shutdown
/// fires. Returns `Ok(())` only on cooperative shutdown.
async fn run_framer(
    stream: TcpStream,
    cfg: &SourceConfig,
    frame_tx: &mpsc::Sender<Bytes>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), SourceError> {
    let mut framed = FramedRead::with_capacity(stream, FrameCodec, cfg.reader_buf);
    loop {
        let outcome = tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() { return Ok(()); }
                continue;
            }
            outcome = read_next(&mut framed, cfg.read_timeout) => outcome,
        };
        match outcome {
            // A pure deadline expiry is recoverable; keep reading.
            ReadOutcome::Timeout => continue,
            ReadOutcome::Eof => return Err(SourceError::Disconnected),
            ReadOutcome::Failed(e) => return Err(SourceError::Read(e)),
            ReadOutcome::Frame(frame) => {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() { return Ok(()); }
                    }
                    sent = frame_tx.send(frame) => {
                        if sent.is_err() {
                            // Transformer gone; only happens at teardown.
                            return Ok(());
                        }
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

/// Linear backoff in the consecutive dial-failure count, capped.
fn backoff_delay(failures: u32, interval: Duration, max: Duration) -> Duration {
    interval.saturating_mul(failures.max(1)).min(max)
}

/// Own the retry loop over the configured source address until shutdown.
///
/// Exactly one framer runs per successful dial; a success resets the
/// failure count. Dial, read, and backoff sleep are all aborted by shutdown.
pub async fn run_supervisor(
    cfg: SourceConfig,
    frame_tx: mpsc::Sender<Bytes>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut failures: u32 = 0;
    loop {
        if *shutdown.borrow() {
            return;
        }
        let dialed = tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() { return; }
                continue;
            }
            dialed = tokio::time::timeout(cfg.dial_timeout, TcpStream::connect(cfg.addr)) => dialed,
        };
        match dialed {
            Ok(Ok(stream)) => {
                info!(addr = %cfg.addr, "connected to source");
                failures = 0;
                match run_framer(stream, &cfg, &frame_tx, &mut shutdown).await {
                    Ok(()) => return,
                    Err(e) => warn!(addr = %cfg.addr, error = %e, "source connection ended"),
                }
            }
            Ok(Err(e)) => {
                failures = failures.saturating_add(1);
                warn!(addr = %cfg.addr, error = %e, failures, "dial failed");
            }
            Err(_) => {
                failures = failures.saturating_add(1);
                warn!(addr = %cfg.addr, failures, "dial timed out");
            }
        }
        let delay = backoff_delay(failures, cfg.reconnect_interval, cfg.reconnect_max);
        debug!(delay_ms = delay.as_millis() as u64, "reconnect backoff");
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() { return; }
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn test_cfg(addr: std::net::SocketAddr) -> SourceConfig {
        SourceConfig {
            addr,
            reconnect_interval: Duration::from_millis(10),
            reconnect_max: Duration::from_millis(100),
            dial_timeout: Duration::from_secs(1),
            read_timeout: None,
            reader_buf: 4096,
            frame_queue_size: 64,
        }
    }

    #[test]
    fn codec_splits_on_delimiter() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::from(&[0x04, 0xFF, 0x68, 0x69, 0x00, 0x02, 0x7E, 0x00][..]);
        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&first[..], &[0x04, 0xFF, 0x68, 0x69]);
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&second[..], &[0x02, 0x7E]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn codec_waits_for_complete_frame() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::from(&[0x04, 0xFF][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&[0x68, 0x69, 0x00]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame[..], &[0x04, 0xFF, 0x68, 0x69]);
    }

    #[test]
    fn codec_skips_empty_frames() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::from(&[0x00, 0x00, 0x02, 0x11, 0x00, 0x00][..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame[..], &[0x02, 0x11]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn backoff_is_linear_and_capped() {
        let interval = Duration::from_secs(1);
        let max = Duration::from_secs(30);
        assert_eq!(backoff_delay(0, interval, max), Duration::from_secs(1));
        assert_eq!(backoff_delay(1, interval, max), Duration::from_secs(1));
        assert_eq!(backoff_delay(5, interval, max), Duration::from_secs(5));
        assert_eq!(backoff_delay(40, interval, max), Duration::from_secs(30));
        assert_eq!(backoff_delay(u32::MAX, interval, max), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn framer_emits_frames_then_reports_disconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let writer = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            conn.write_all(&[0x04, 0xFF, 0x68, 0x69, 0x00]).await.unwrap();
            conn.write_all(&[0x02, 0x7E, 0x00]).await.unwrap();
            conn.shutdown().await.unwrap();
        });

        let cfg = test_cfg(addr);
        let stream = TcpStream::connect(addr).await.unwrap();
        let (frame_tx, mut frame_rx) = mpsc::channel(16);
        let (_shutdown_tx, mut shutdown) = watch::channel(false);
        let result = run_framer(stream, &cfg, &frame_tx, &mut shutdown).await;
        assert!(matches!(result, Err(SourceError::Disconnected)));
        writer.await.unwrap();

        assert_eq!(&frame_rx.recv().await.unwrap()[..], &[0x04, 0xFF, 0x68, 0x69]);
        assert_eq!(&frame_rx.recv().await.unwrap()[..], &[0x02, 0x7E]);
    }

    #[tokio::test]
    async fn framer_recovers_from_read_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let writer = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            // Stay idle past several read deadlines before writing.
            tokio::time::sleep(Duration::from_millis(80)).await;
            conn.write_all(&[0x02, 0x11, 0x00]).await.unwrap();
            conn.shutdown().await.unwrap();
        });

        let mut cfg = test_cfg(addr);
        cfg.read_timeout = Some(Duration::from_millis(10));
        let stream = TcpStream::connect(addr).await.unwrap();
        let (frame_tx, mut frame_rx) = mpsc::channel(16);
        let (_shutdown_tx, mut shutdown) = watch::channel(false);
        let result = run_framer(stream, &cfg, &frame_tx, &mut shutdown).await;
        assert!(matches!(result, Err(SourceError::Disconnected)));
        writer.await.unwrap();
        assert_eq!(&frame_rx.recv().await.unwrap()[..], &[0x02, 0x11]);
    }

    #[tokio::test]
    async fn supervisor_reconnects_after_connection_drop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            // First session drops after one frame; second delivers another.
            let (mut conn, _) = listener.accept().await.unwrap();
            conn.write_all(&[0x02, 0x01, 0x00]).await.unwrap();
            drop(conn);
            let (mut conn, _) = listener.accept().await.unwrap();
            conn.write_all(&[0x02, 0x02, 0x00]).await.unwrap();
            // Hold the second session open until the test ends.
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let cfg = test_cfg(addr);
        let (frame_tx, mut frame_rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown) = watch::channel(false);
        let supervisor = tokio::spawn(run_supervisor(cfg, frame_tx, shutdown));

        let first = tokio::time::timeout(Duration::from_secs(2), frame_rx.recv())
            .await
            .expect("first frame")
            .unwrap();
        assert_eq!(&first[..], &[0x02, 0x01]);
        let second = tokio::time::timeout(Duration::from_secs(2), frame_rx.recv())
            .await
            .expect("frame after reconnect")
            .unwrap();
        assert_eq!(&second[..], &[0x02, 0x02]);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), supervisor)
            .await
            .expect("supervisor should stop on shutdown")
            .unwrap();
        server.abort();
    }

    #[tokio::test]
    async fn supervisor_keeps_retrying_unreachable_address() {
        // Grab a port and close it again so nothing is listening.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let cfg = test_cfg(addr);
        let (frame_tx, _frame_rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown) = watch::channel(false);
        let supervisor = tokio::spawn(run_supervisor(cfg, frame_tx, shutdown));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!supervisor.is_finished(), "supervisor must keep retrying");
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), supervisor)
            .await
            .expect("supervisor should stop on shutdown")
            .unwrap();
    }
}
