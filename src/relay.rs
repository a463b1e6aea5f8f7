//! Bidirectional byte relay between two established connections

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

/// Per-direction copy buffer
pub const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Bytes copied in each direction by one relay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayTotals {
    pub a_to_b: u64,
    pub b_to_a: u64,
}

/// Copy `a -> b` and `b -> a` until one direction finishes, then close both.
///
/// When one direction ends (EOF or error) its end-of-stream is forwarded and
/// the other direction gets `grace` to finish before both connections are
/// shut down and dropped. Counts include bytes delivered before any error.
pub async fn run<A, B>(a: A, b: B, grace: Duration) -> RelayTotals
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);
    let mut totals = RelayTotals::default();

    {
        let forward = pump(&mut a_read, &mut b_write, &mut totals.a_to_b);
        let backward = pump(&mut b_read, &mut a_write, &mut totals.b_to_a);
        tokio::pin!(forward, backward);

        tokio::select! {
            result = &mut forward => {
                log_direction_end("a->b", result);
                match timeout(grace, &mut backward).await {
                    Ok(result) => log_direction_end("b->a", result),
                    Err(_) => tracing::debug!("Relay grace period elapsed (b->a)"),
                }
            }
            result = &mut backward => {
                log_direction_end("b->a", result);
                match timeout(grace, &mut forward).await {
                    Ok(result) => log_direction_end("a->b", result),
                    Err(_) => tracing::debug!("Relay grace period elapsed (a->b)"),
                }
            }
        }
    }

    let _ = a_write.shutdown().await;
    let _ = b_write.shutdown().await;

    totals
}

/// Copy until EOF, then forward the EOF with a write shutdown
async fn pump<R, W>(reader: &mut R, writer: &mut W, copied: &mut u64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            writer.shutdown().await?;
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        *copied += n as u64;
    }
}

fn log_direction_end(direction: &'static str, result: io::Result<()>) {
    match result {
        Ok(()) => tracing::trace!(direction, "Relay direction reached EOF"),
        Err(e) => tracing::debug!(direction, error = %e, "Relay direction failed"),
    }
}
