//! Transport-oblivious bidirectional byte relay.
//!
//! This is the terminal stage of every tunnelled connection: once a
//! plaintext stream has been paired with a negotiated transport stream,
//! the relay just moves bytes until both directions are finished.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

/// Copy buffer size per direction.
const BUF_SIZE: usize = 8 * 1024;

/// Copy bytes between `a` and `b` in both directions.
///
/// When one side reaches EOF, the other side's write half is shut down,
/// so a half-close propagates through the relay.  The relay finishes
/// when both directions have reached EOF and been shut down, and yields
/// the number of bytes copied from `a` to `b` and from `b` to `a`.
///
/// On any I/O error the relay returns at once with that error; both
/// streams are dropped without a graceful close.  Cancelling the future
/// likewise drops both streams.
pub async fn relay<A, B>(a: A, b: B) -> io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);
    tokio::try_join!(
        copy_then_shutdown(a_read, b_write),
        copy_then_shutdown(b_read, a_write),
    )
}

/// Copy bytes from `reader` to `writer` until EOF, then shut the writer
/// down.  Returns the number of bytes copied.
async fn copy_then_shutdown<R, W>(
    mut reader: ReadHalf<R>,
    mut writer: WriteHalf<W>,
) -> io::Result<u64>
where
    R: AsyncRead,
    W: AsyncWrite,
{
    let mut buf = [0_u8; BUF_SIZE];
    let mut copied: u64 = 0;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        copied += n as u64;
    }
    writer.shutdown().await?;
    Ok(copied)
}
