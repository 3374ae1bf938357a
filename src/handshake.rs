//! The identifier exchange that opens every connection on the multiplex port.
//!
//! Both sides send the same frame once, before any payload:
//!
//! ```text
//! +-----+----------------+
//! | LEN |   IDENTIFIER   |
//! +-----+----------------+
//! |  1  | LEN (1 to 127) |
//! +-----+----------------+
//! ```
//!
//! The client writes its identifier first. The server answers with the same
//! frame only after it has found the identifier and reached the target, so an
//! echo is the confirmation that the tunnel is up. Unknown identifiers get no
//! answer at all.

use std::{future::Future, io, time::Duration};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::protocol::{TunnelId, TunnelIdError, MAX_TUNNEL_ID_LEN};

/// Upper bound for a whole handshake phase unless configured otherwise.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("invalid identifier header: {0}")]
    InvalidId(#[from] TunnelIdError),
    #[error("identifier header is not valid utf8")]
    InvalidUtf8,
    #[error("peer echoed identifier {received:?}, expected {sent:?}")]
    Mismatch { sent: TunnelId, received: TunnelId },
    #[error("handshake timed out")]
    TimedOut,
    #[error("Error in network operation")]
    Io(#[from] io::Error),
}

/// Reads one identifier frame.
pub async fn read_header<R>(conn: &mut R) -> Result<TunnelId, HandshakeError>
where
    R: AsyncRead + Unpin,
{
    let len = conn.read_u8().await? as usize;
    if len == 0 {
        return Err(TunnelIdError::Empty.into());
    }
    if len > MAX_TUNNEL_ID_LEN {
        return Err(TunnelIdError::TooLong(len).into());
    }

    let mut buf = vec![0; len];
    conn.read_exact(&mut buf).await?;
    let id = String::from_utf8(buf).map_err(|_| HandshakeError::InvalidUtf8)?;

    trace!("Received identifier header: {:?}", id);
    Ok(TunnelId::new(id)?)
}

/// Writes one identifier frame in a single write.
pub async fn write_header<W>(conn: &mut W, id: &TunnelId) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut frame = Vec::with_capacity(1 + id.len());
    frame.push(id.len() as u8);
    frame.extend_from_slice(id.as_bytes());

    conn.write_all(&frame).await?;
    conn.flush().await
}

/// Client half: announce `id`, then require the server to echo it back unchanged.
pub async fn client_handshake<S>(conn: &mut S, id: &TunnelId) -> Result<(), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_header(conn, id).await?;
    let echoed = read_header(conn).await?;
    if echoed != *id {
        return Err(HandshakeError::Mismatch {
            sent: id.clone(),
            received: echoed,
        });
    }
    Ok(())
}

/// Bounds a handshake step so a silent peer cannot pin its handler.
pub async fn with_timeout<F, T>(limit: Duration, step: F) -> Result<T, HandshakeError>
where
    F: Future<Output = Result<T, HandshakeError>>,
{
    tokio::time::timeout(limit, step)
        .await
        .map_err(|_| HandshakeError::TimedOut)?
}

#[cfg(test)]
mod tests {
    use tokio::io::duplex;

    use super::*;

    fn id(s: &str) -> TunnelId {
        TunnelId::new(s).unwrap()
    }

    #[tokio::test]
    async fn header_wire_format() {
        let mut out = Vec::new();
        write_header(&mut out, &id("abc")).await.unwrap();
        assert_eq!(out, [3, b'a', b'b', b'c']);

        let mut input: &[u8] = &[3, b'x', b'y', b'z', b'!'];
        assert_eq!(read_header(&mut input).await.unwrap(), id("xyz"));
        // nothing past the frame is consumed
        assert_eq!(input, b"!");
    }

    #[tokio::test]
    async fn rejects_bad_headers() {
        let mut zero: &[u8] = &[0];
        assert!(matches!(
            read_header(&mut zero).await,
            Err(HandshakeError::InvalidId(TunnelIdError::Empty))
        ));

        let mut long: &[u8] = &[200];
        assert!(matches!(
            read_header(&mut long).await,
            Err(HandshakeError::InvalidId(TunnelIdError::TooLong(200)))
        ));

        let mut short: &[u8] = &[5, b'a', b'b'];
        assert!(matches!(
            read_header(&mut short).await,
            Err(HandshakeError::Io(err)) if err.kind() == io::ErrorKind::UnexpectedEof
        ));

        let mut garbage: &[u8] = &[2, 0xff, 0xfe];
        assert!(matches!(
            read_header(&mut garbage).await,
            Err(HandshakeError::InvalidUtf8)
        ));
    }

    #[tokio::test]
    async fn client_accepts_matching_echo() {
        let (mut client, mut server) = duplex(256);
        let echo = tokio::spawn(async move {
            let got = read_header(&mut server).await.unwrap();
            write_header(&mut server, &got).await.unwrap();
            got
        });

        client_handshake(&mut client, &id("abc")).await.unwrap();
        assert_eq!(echo.await.unwrap(), id("abc"));
    }

    #[tokio::test]
    async fn client_detects_rogue_echo() {
        let (mut client, mut server) = duplex(256);
        tokio::spawn(async move {
            read_header(&mut server).await.unwrap();
            write_header(&mut server, &id("other")).await.unwrap();
        });

        match client_handshake(&mut client, &id("abc")).await {
            Err(HandshakeError::Mismatch { sent, received }) => {
                assert_eq!(sent, id("abc"));
                assert_eq!(received, id("other"));
            }
            other => panic!("expected mismatch, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let (mut client, _server) = duplex(256);
        let res = with_timeout(Duration::from_millis(50), read_header(&mut client)).await;
        assert!(matches!(res, Err(HandshakeError::TimedOut)));
    }
}
