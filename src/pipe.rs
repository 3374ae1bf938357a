use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

/// Size of the per-direction copy buffer.
pub const PIPE_BUFFER_SIZE: usize = 4 * 1024;

/// Bytes moved in each direction by [`pipe`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PipeStats {
    pub a_to_b: u64,
    pub b_to_a: u64,
}

/// Splices `a` and `b` together until both directions are finished.
///
/// Each direction is its own unit of work. A clean end-of-stream on one side is
/// propagated as a half-close (the opposite write side is shut down) while the
/// other direction keeps flowing. A read or write error ends only the direction
/// it happened on; the other one converges when it observes the broken
/// connection. Both streams are dropped once this returns.
pub async fn pipe<A, B>(a: A, b: B) -> PipeStats
where
    A: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    let (a_read, a_write) = io::split(a);
    let (b_read, b_write) = io::split(b);

    let (a_to_b, b_to_a) = tokio::join!(
        transfer(a_read, b_write, "a->b"),
        transfer(b_read, a_write, "b->a")
    );

    PipeStats { a_to_b, b_to_a }
}

async fn transfer<R, W>(mut reader: R, mut writer: W, direction: &'static str) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; PIPE_BUFFER_SIZE];
    let mut amt = 0_u64;
    loop {
        let read_size = match reader.read(&mut buf).await {
            Ok(0) => {
                trace!(direction, "end of stream, half-closing");
                if let Err(err) = writer.shutdown().await {
                    debug!(direction, "shutdown error: {}", err);
                }
                return amt;
            }
            Ok(n) => n,
            Err(err) => {
                debug!(direction, "read error: {}", err);
                return amt;
            }
        };

        if let Err(err) = writer.write_all(&buf[..read_size]).await {
            debug!(direction, "write error: {}", err);
            return amt;
        }
        if let Err(err) = writer.flush().await {
            debug!(direction, "flush error: {}", err);
            return amt;
        }

        amt += read_size as u64;
    }
}
