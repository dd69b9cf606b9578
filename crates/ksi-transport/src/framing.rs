//! Length-delimited JSON framing.
//!
//! Protocol: 4-byte big-endian payload length, then UTF-8 JSON.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{TransportError, TransportResult};

/// Read one frame. Returns `None` on a clean EOF at a frame boundary.
///
/// # Errors
///
/// Returns [`TransportError::FrameTooLarge`] when the declared length
/// exceeds `max_bytes`, [`TransportError::Malformed`] for bad JSON and
/// [`TransportError::Io`] for stream failures.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_bytes: usize,
) -> TransportResult<Option<serde_json::Value>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {},
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_bytes {
        return Err(TransportError::FrameTooLarge {
            got: len,
            cap: max_bytes,
        });
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    serde_json::from_slice(&payload).map_err(|e| TransportError::Malformed(e.to_string()))
}

/// Write one frame.
///
/// # Errors
///
/// Returns [`TransportError::Io`] for stream failures.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    value: &serde_json::Value,
) -> TransportResult<()> {
    let payload = serde_json::to_vec(value).map_err(|e| TransportError::Malformed(e.to_string()))?;
    #[allow(clippy::cast_possible_truncation)]
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, &json!({"event": "system:health", "data": {}}))
            .await
            .unwrap();
        let frame = read_frame(&mut b, 1024).await.unwrap().unwrap();
        assert_eq!(frame["event"], "system:health");
    }

    #[tokio::test]
    async fn test_eof_is_none() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        assert!(read_frame(&mut b, 64).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversize_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        tokio::spawn(async move {
            let _ = a.write_all(&1_000_000u32.to_be_bytes()).await;
        });
        let err = read_frame(&mut b, 64).await.unwrap_err();
        assert!(matches!(err, TransportError::FrameTooLarge { .. }));
    }
}
