//! Upstream CONNECT chaining
//!
//! Dials the upstream HTTP proxy and upgrades the connection to a transparent
//! byte pipe toward the target via the CONNECT method, injecting Basic
//! credentials when the proxy URL carries them.

use crate::common::net;
use crate::common::{ProxyUrl, TargetAddr};
use crate::{Error, Result};
use bytes::BytesMut;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Upstream dial timeout
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound on the CONNECT handshake. An upstream that never answers must not
/// park the session forever.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

const MAX_HEAD_SIZE: usize = 8 * 1024;

/// Per-session chain handler: dials the upstream proxy and performs the
/// CONNECT handshake toward one fixed target.
pub struct TcpChain {
    upstream: ProxyUrl,
    target: TargetAddr,
}

impl TcpChain {
    pub fn new(upstream: ProxyUrl, target: TargetAddr) -> Self {
        TcpChain { upstream, target }
    }

    pub fn target(&self) -> &TargetAddr {
        &self.target
    }

    /// Open the tunnel: dial the upstream and complete the CONNECT handshake.
    ///
    /// On success the returned stream is a transparent pipe to the target.
    /// Any bytes the upstream sent past the response head already belong to
    /// the tunnel and are returned alongside.
    pub async fn open(&self) -> Result<(TcpStream, BytesMut)> {
        let authority = self.upstream.authority();

        let mut stream = timeout(DIAL_TIMEOUT, TcpStream::connect(&authority))
            .await
            .map_err(|_| Error::timeout(format!("dialing upstream proxy {}", authority)))?
            .map_err(|e| Error::dial(format!("{}: {}", authority, e)))?;
        net::configure_tcp_stream(&stream);

        let early = timeout(HANDSHAKE_TIMEOUT, self.handshake(&mut stream))
            .await
            .map_err(|_| Error::timeout(format!("CONNECT handshake with {}", authority)))??;

        Ok((stream, early))
    }

    async fn handshake<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        stream: &mut S,
    ) -> Result<BytesMut> {
        let mut request = format!(
            "CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n",
            target = self.target
        );
        if let Some(auth) = self.upstream.basic_auth() {
            request.push_str(&format!("Proxy-Authorization: {}\r\n", auth));
        }
        request.push_str("\r\n");

        debug!(
            "sending CONNECT {} via {}",
            self.target,
            self.upstream.authority()
        );

        stream
            .write_all(request.as_bytes())
            .await
            .map_err(|e| Error::dial(format!("failed to send CONNECT request: {}", e)))?;
        stream.flush().await?;

        let (head, leftover) = read_http_head(stream).await?;
        let status_line = head.lines().next().unwrap_or("");
        let status = parse_status_code(status_line)?;

        if status != 200 {
            return Err(Error::connect_rejected(format!(
                "{} responded {:?}",
                self.upstream.authority(),
                status_line.trim()
            )));
        }

        debug!("CONNECT to {} established", self.target);
        Ok(leftover)
    }
}

/// Read an HTTP message head (through the blank line) with a bounded buffer.
///
/// Returns the head text and any bytes already read past it.
pub(crate) async fn read_http_head<S: AsyncRead + Unpin>(
    stream: &mut S,
) -> Result<(String, BytesMut)> {
    let mut buf = BytesMut::with_capacity(1024);
    loop {
        let n = stream.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(Error::protocol("connection closed before end of headers"));
        }
        if let Some(end) = find_header_end(&buf) {
            let leftover = buf.split_off(end);
            let head = String::from_utf8_lossy(&buf).into_owned();
            return Ok((head, leftover));
        }
        if buf.len() >= MAX_HEAD_SIZE {
            return Err(Error::protocol("HTTP head too large"));
        }
    }
}

/// Find end of HTTP headers (double CRLF)
pub(crate) fn find_header_end(data: &[u8]) -> Option<usize> {
    for i in 0..data.len().saturating_sub(3) {
        if &data[i..i + 4] == b"\r\n\r\n" {
            return Some(i + 4);
        }
    }
    None
}

/// Parse the numeric status code out of an HTTP status line.
fn parse_status_code(status_line: &str) -> Result<u16> {
    status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| Error::protocol(format!("malformed status line: {:?}", status_line)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_header_end() {
        assert_eq!(find_header_end(b"HTTP/1.1 200 OK\r\n\r\n"), Some(19));
        assert_eq!(
            find_header_end(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n"),
            Some(38)
        );
        assert_eq!(find_header_end(b"incomplete"), None);
    }

    #[test]
    fn test_parse_status_code() {
        assert_eq!(parse_status_code("HTTP/1.1 200 OK").unwrap(), 200);
        assert_eq!(
            parse_status_code("HTTP/1.1 407 Proxy Authentication Required").unwrap(),
            407
        );
        assert!(parse_status_code("garbage").is_err());
        assert!(parse_status_code("").is_err());
    }

    #[tokio::test]
    async fn test_read_http_head_keeps_leftover() {
        let data = b"HTTP/1.1 200 OK\r\n\r\ntunnel-bytes";
        let mut reader = &data[..];
        let (head, leftover) = read_http_head(&mut reader).await.unwrap();
        assert!(head.starts_with("HTTP/1.1 200 OK"));
        assert_eq!(&leftover[..], b"tunnel-bytes");
    }

    #[tokio::test]
    async fn test_read_http_head_rejects_truncation() {
        let data = b"HTTP/1.1 200 OK\r\n";
        let mut reader = &data[..];
        assert!(read_http_head(&mut reader).await.is_err());
    }
}
