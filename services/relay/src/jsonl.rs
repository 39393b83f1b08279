//! Newline-delimited JSON sink.
//!
//! Consumes one hub subscription and writes each record as a single line:
//! `{"ts": ..., "id": "0xNN", "payload_hex": "...", "text"|"data": ...}`. The
//! sink never buffers beyond the underlying writer. A failed line is skipped;
//! a dead writer (broken pipe class) stops the sink.

use crate::hub::Subscription;
use std::io::ErrorKind;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, warn};

fn is_terminal(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::BrokenPipe
            | ErrorKind::NotConnected
            | ErrorKind::UnexpectedEof
            | ErrorKind::StorageFull
    )
}

/// Drain the subscription into `writer` until the queue closes, shutdown
/// fires, or the writer dies.
pub async fn run_jsonl_sink<W>(
    mut writer: W,
    mut sub: Subscription,
    mut shutdown: watch::Receiver<bool>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let record = tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() { break; }
                continue;
            }
            record = sub.rx.recv() => match record {
                Some(record) => record,
                None => break,
            },
        };
        let mut line = match serde_json::to_string(&record.normalized()) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "record not serializable, line skipped");
                continue;
            }
        };
        line.push('\n');
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            if is_terminal(e.kind()) {
                warn!(error = %e, "jsonl writer gone, sink stopping");
                return;
            }
            warn!(error = %e, "jsonl line dropped");
        }
    }
    if let Err(e) = writer.flush().await {
        debug!(error = %e, "jsonl flush on shutdown failed");
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
