//! Consumers that drain an [`EventReceiver`].
//!
//! [`JsonLinesSink`] writes every event as one JSON object per line, which
//! is how the worker hands progress to whatever launched it. It runs until
//! every sender has been dropped.

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::channel::{EventReceiver, JobEvent};

/// Writes events as newline-delimited JSON.
pub struct JsonLinesSink;

impl JsonLinesSink {
    /// Run the forwarding loop until the channel closes.
    ///
    /// Write failures are logged and end the loop; the producer side is
    /// unaffected because sending never blocks.
    pub async fn run<W>(mut receiver: EventReceiver, mut out: W) -> usize
    where
        W: AsyncWrite + Unpin,
    {
        let mut written = 0;
        while let Some(event) = receiver.recv().await {
            if let Err(e) = Self::write_event(&mut out, &event).await {
                tracing::error!(error = %e, "Failed to forward job event");
                break;
            }
            written += 1;
        }
        if let Err(e) = out.flush().await {
            tracing::warn!(error = %e, "Failed to flush event output");
        }
        let dropped = receiver.dropped_logs();
        if dropped > 0 {
            tracing::warn!(dropped, "Log lines dropped under backpressure");
        }
        tracing::debug!(written, "Event channel closed, sink shutting down");
        written
    }

    async fn write_event<W>(out: &mut W, event: &JobEvent) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut line = serde_json::to_vec(event).map_err(std::io::Error::other)?;
        line.push(b'\n');
        out.write_all(&line).await
    }
}
