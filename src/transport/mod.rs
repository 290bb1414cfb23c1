//! Moving batches between client and server.
//!
//! The protocol is strictly request/response: the client hands one batch to
//! [`Transport::exchange`] and gets the server's reply batch back. On byte
//! streams each batch travels as one frame:
//!
//! ```text
//! ┌──────────┬──────────────────────┐
//! │ len: u32 │ zstd(batch)          │
//! │ (BE)     │ (len bytes)          │
//! └──────────┴──────────────────────┘
//! ```

pub mod local;
pub mod process;

pub use local::LocalTransport;
pub use process::ProcessTransport;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest batch accepted on the wire, compressed or not (64MB)
pub const MAX_BATCH_SIZE: u32 = 64 * 1024 * 1024;

const ZSTD_LEVEL: i32 = 3;

/// One request/response round trip.
#[async_trait]
pub trait Transport: Send {
    async fn exchange(&mut self, request: Bytes) -> Result<Bytes>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Box<T> {
    async fn exchange(&mut self, request: Bytes) -> Result<Bytes> {
        (**self).exchange(request).await
    }
}

/// Write one compressed batch frame.
pub async fn write_batch<W: AsyncWrite + Unpin>(w: &mut W, batch: &[u8]) -> Result<()> {
    if batch.len() > MAX_BATCH_SIZE as usize {
        anyhow::bail!(
            "Batch size {} exceeds maximum allowed size {}",
            batch.len(),
            MAX_BATCH_SIZE
        );
    }
    let compressed = zstd::bulk::compress(batch, ZSTD_LEVEL).context("Failed to compress batch")?;
    w.write_u32(compressed.len() as u32)
        .await
        .context("Failed to write batch length")?;
    w.write_all(&compressed)
        .await
        .context("Failed to write batch")?;
    w.flush().await.context("Failed to flush batch")?;
    Ok(())
}

/// Read one compressed batch frame.
pub async fn read_batch<R: AsyncRead + Unpin>(r: &mut R) -> Result<Bytes> {
    let len = r.read_u32().await.context("Failed to read batch length")?;

    // Validate frame size before allocation
    if len > MAX_BATCH_SIZE {
        anyhow::bail!(
            "Batch size {} exceeds maximum allowed size {}",
            len,
            MAX_BATCH_SIZE
        );
    }

    let mut compressed = vec![0u8; len as usize];
    r.read_exact(&mut compressed)
        .await
        .context("Failed to read batch payload")?;
    let batch = zstd::bulk::decompress(&compressed, MAX_BATCH_SIZE as usize)
        .context("Failed to decompress batch")?;
    Ok(Bytes::from(batch))
}
