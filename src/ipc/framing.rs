//! Length-prefixed JSON frames.
//!
//! ```text
//! +--------+-----------------+
//! | Length | JSON document   |
//! | 4B BE  | Length bytes    |
//! +--------+-----------------+
//! ```

use crate::errors;
use anyhow::Context;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(message).context(errors::ipc::FAILED_TO_ENCODE)?;
    anyhow::ensure!(
        payload.len() <= MAX_FRAME_SIZE,
        errors::ipc::frame_too_large(payload.len())
    );

    writer
        .write_all(&(payload.len() as u32).to_be_bytes())
        .await
        .context(errors::ipc::FAILED_TO_WRITE)?;
    writer
        .write_all(&payload)
        .await
        .context(errors::ipc::FAILED_TO_WRITE)?;
    writer.flush().await.context(errors::ipc::FAILED_TO_WRITE)?;
    Ok(())
}

/// Reads one frame. `Ok(None)` means the peer closed the stream cleanly
/// between frames.
pub async fn read_frame<R, T>(reader: &mut R) -> anyhow::Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e).context(errors::ipc::FAILED_TO_READ),
    }

    let length = u32::from_be_bytes(header) as usize;
    anyhow::ensure!(length <= MAX_FRAME_SIZE, errors::ipc::frame_too_large(length));

    let mut payload = vec![0u8; length];
    reader
        .read_exact(&mut payload)
        .await
        .context(errors::ipc::TRUNCATED_FRAME)?;

    let message = serde_json::from_slice(&payload).context(errors::ipc::FAILED_TO_DECODE)?;
    Ok(Some(message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ping {
        seq: u32,
        body: String,
    }

    #[tokio::test]
    async fn test_frames_in_sequence() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, &Ping { seq: 1, body: "one".into() }).await.unwrap();
        write_frame(&mut a, &Ping { seq: 2, body: "two".into() }).await.unwrap();
        drop(a);

        let first: Ping = read_frame(&mut b).await.unwrap().unwrap();
        let second: Ping = read_frame(&mut b).await.unwrap().unwrap();
        assert_eq!(first.seq, 1);
        assert_eq!(second.body, "two");
        assert!(read_frame::<_, Ping>(&mut b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_length_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&((MAX_FRAME_SIZE as u32) + 1).to_be_bytes())
            .await
            .unwrap();
        let err = read_frame::<_, Ping>(&mut b).await.unwrap_err();
        assert!(err.to_string().contains("too large"));
    }

    #[tokio::test]
    async fn test_truncated_payload_is_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&10u32.to_be_bytes()).await.unwrap();
        a.write_all(b"{\"se").await.unwrap();
        drop(a);
        assert!(read_frame::<_, Ping>(&mut b).await.is_err());
    }
}
