//! Network utilities

use crate::Result;
use socket2::SockRef;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

#[inline]
pub fn configure_tcp_stream(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
    let sock = SockRef::from(stream);
    let _ = sock.set_keepalive(true);
}

/// Copy data between two streams bidirectionally.
///
/// Bytes flow verbatim in both directions until both sides have hit EOF; a
/// half-close on one side shuts down the write half of the other. Returns
/// `(a_to_b, b_to_a)` byte counts.
pub async fn copy_bidirectional<A, B>(a: &mut A, b: &mut B) -> Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (a_to_b, b_to_a) = tokio::io::copy_bidirectional(a, b).await?;
    Ok((a_to_b, b_to_a))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_copy_bidirectional_duplex() {
        let (mut client, mut near) = tokio::io::duplex(64);
        let (mut far, mut server) = tokio::io::duplex(64);

        let relay = tokio::spawn(async move { copy_bidirectional(&mut near, &mut far).await });

        client.write_all(b"ping").await.unwrap();
        client.shutdown().await.unwrap();

        let mut got = [0u8; 4];
        server.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"ping");

        server.write_all(b"pong").await.unwrap();
        server.shutdown().await.unwrap();

        let mut back = Vec::new();
        client.read_to_end(&mut back).await.unwrap();
        assert_eq!(back, b"pong");

        let (up, down) = relay.await.unwrap().unwrap();
        assert_eq!(up, 4);
        assert_eq!(down, 4);
    }
}
