//! Minimal client over the framed socket.
//!
//! This is the seam the external CLI wrapper builds on and what the
//! integration tests drive. A background task splits incoming frames:
//! subscription stream frames (which carry both `event` and `context`)
//! land on one queue, request replies on another, so a subscribed client
//! can keep issuing requests.

use std::path::Path;
use std::time::Duration;

use ksi_core::{KsiError, KsiResult};
use tokio::net::UnixStream;
use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::mpsc;

use crate::error::TransportResult;
use crate::framing::{read_frame, write_frame};

/// A connected client.
pub struct TransportClient {
    writer: OwnedWriteHalf,
    replies: mpsc::Receiver<serde_json::Value>,
    stream_frames: mpsc::Receiver<serde_json::Value>,
    max_frame: usize,
}

impl std::fmt::Debug for TransportClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportClient").finish_non_exhaustive()
    }
}

impl TransportClient {
    /// Connect to the daemon socket.
    ///
    /// # Errors
    ///
    /// Returns [`crate::TransportError::Io`] if the connection fails.
    pub async fn connect(path: &Path) -> TransportResult<Self> {
        let stream = UnixStream::connect(path).await?;
        let (mut read_half, writer) = stream.into_split();
        let (reply_tx, replies) = mpsc::channel(64);
        let (stream_tx, stream_frames) = mpsc::channel(1024);
        let max_frame = 16 * 1024 * 1024;

        tokio::spawn(async move {
            while let Ok(Some(frame)) = read_frame(&mut read_half, max_frame).await {
                let is_stream = frame.get("event").is_some() && frame.get("context").is_some();
                let sent = if is_stream {
                    stream_tx.send(frame).await
                } else {
                    reply_tx.send(frame).await
                };
                if sent.is_err() {
                    break;
                }
            }
        });

        Ok(Self {
            writer,
            replies,
            stream_frames,
            max_frame,
        })
    }

    /// Send one request and await its reply frame.
    ///
    /// # Errors
    ///
    /// Returns `io` if the connection drops, or the decoded error frame
    /// as a [`KsiError`].
    pub async fn request(
        &mut self,
        event: &str,
        data: serde_json::Value,
    ) -> KsiResult<serde_json::Value> {
        write_frame(
            &mut self.writer,
            &serde_json::json!({"event": event, "data": data}),
        )
        .await
        .map_err(|e| KsiError::io(e.to_string()))?;
        let reply = self
            .replies
            .recv()
            .await
            .ok_or_else(|| KsiError::io("connection closed"))?;
        if let Some(error) = reply.get("error") {
            let err: ksi_core::ErrorBody = serde_json::from_value(error.clone())
                .map_err(|e| KsiError::io(format!("undecodable error frame: {e}")))?;
            return Err(KsiError::new(err.kind, err.message).retryable(err.retryable));
        }
        Ok(reply)
    }

    /// Await the next subscription stream frame.
    ///
    /// # Errors
    ///
    /// Returns `timeout` if nothing arrives within `timeout`.
    pub async fn next_stream_frame(&mut self, timeout: Duration) -> KsiResult<serde_json::Value> {
        match tokio::time::timeout(timeout, self.stream_frames.recv()).await {
            Err(_) => Err(KsiError::timeout("no stream frame arrived")),
            Ok(None) => Err(KsiError::io("connection closed")),
            Ok(Some(frame)) => Ok(frame),
        }
    }

    /// Await the next stream frame whose event name matches `event`,
    /// discarding others.
    ///
    /// # Errors
    ///
    /// Returns `timeout` when the deadline passes first.
    pub async fn wait_for_event(
        &mut self,
        event: &str,
        timeout: Duration,
    ) -> KsiResult<serde_json::Value> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .ok_or_else(|| KsiError::timeout(format!("no {event} frame arrived")))?;
            let frame = self.next_stream_frame(remaining).await?;
            if frame.get("event").and_then(|v| v.as_str()) == Some(event) {
                return Ok(frame);
            }
        }
    }

    /// The frame size cap this client accepts.
    #[must_use]
    pub fn max_frame(&self) -> usize {
        self.max_frame
    }
}
