//! Paced chunked writes for BLE
//!
//! GATT writes are limited to small packets, so a payload is cut into
//! [`CHUNK_SIZE`]-byte pieces written in order with [`CHUNK_DELAY`] between
//! consecutive pieces.

use async_trait::async_trait;
use hublink_core::Result;
use std::time::Duration;

/// Maximum bytes per GATT write
pub const CHUNK_SIZE: usize = 20;

/// Pause between consecutive GATT writes
pub const CHUNK_DELAY: Duration = Duration::from_millis(15);

/// Destination of individual chunks
#[async_trait]
pub trait ChunkSink: Send + Sync {
    /// Write a single chunk
    async fn write_chunk(&self, chunk: &[u8]) -> Result<()>;
}

/// Write `data` in `chunk_size` pieces, sleeping `delay` between pieces.
///
/// No sleep happens before the first or after the last chunk. Returns the
/// number of chunks written; the first failing chunk aborts the write.
pub async fn write_chunked<S>(
    sink: &S,
    data: &[u8],
    chunk_size: usize,
    delay: Duration,
) -> Result<usize>
where
    S: ChunkSink + ?Sized,
{
    let chunk_size = chunk_size.max(1);
    let mut written = 0;

    for chunk in data.chunks(chunk_size) {
        if written > 0 && !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        sink.write_chunk(chunk).await?;
        written += 1;
    }

    Ok(written)
}
