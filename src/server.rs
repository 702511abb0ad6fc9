//! Local forward-proxy server backing the anonymizing API
//!
//! A minimal HTTP/1.1 forward proxy that requires no authentication from
//! downstream callers and forwards every request to one fixed upstream proxy,
//! injecting that proxy's Basic credentials. CONNECT requests are chained
//! through the upstream's own CONNECT method; plain requests are relayed with
//! a rewritten head.

use crate::chain::{read_http_head, TcpChain, DIAL_TIMEOUT};
use crate::common::net;
use crate::common::{ProxyUrl, TargetAddr};
use crate::registry::{ConnectionGuard, ConnectionSet};
use crate::{Error, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub(crate) async fn accept_loop(
    listener: TcpListener,
    upstream: Arc<ProxyUrl>,
    shutdown: CancellationToken,
    connections: Arc<ConnectionSet>,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((downstream, peer)) => {
                    let guard = connections.register();
                    let upstream = Arc::clone(&upstream);
                    tokio::spawn(run_session(upstream, downstream, peer, guard));
                }
                Err(e) => warn!("proxy accept error: {}", e),
            },
        }
    }
    debug!("anonymizing proxy listener stopped");
}

async fn run_session(
    upstream: Arc<ProxyUrl>,
    downstream: TcpStream,
    peer: SocketAddr,
    guard: ConnectionGuard,
) {
    let id = guard.id();
    debug!("[{}] proxy connection from {}", id, peer);

    tokio::select! {
        result = process(&upstream, downstream) => {
            if let Err(e) = result {
                debug!("[{}] proxy session error: {}", id, e);
            }
        }
        _ = guard.cancelled() => debug!("[{}] forcibly closed", id),
    }
}

async fn process(upstream: &ProxyUrl, mut downstream: TcpStream) -> Result<()> {
    net::configure_tcp_stream(&downstream);

    let (head, leftover) = read_http_head(&mut downstream).await?;
    let request_line = head.lines().next().unwrap_or("").to_string();

    let parts: Vec<&str> = request_line.split_whitespace().collect();
    if parts.len() < 3 {
        return Err(Error::protocol("invalid HTTP request line"));
    }
    let method = parts[0];
    let uri = parts[1];

    if method == "CONNECT" {
        let target = match TargetAddr::parse(uri) {
            Ok(target) => target,
            Err(e) => {
                downstream
                    .write_all(b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\n\r\n")
                    .await?;
                return Err(e);
            }
        };

        let chain = TcpChain::new(upstream.clone(), target);
        match chain.open().await {
            Ok((mut remote, early)) => {
                downstream
                    .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                    .await?;
                if !leftover.is_empty() {
                    remote.write_all(&leftover).await?;
                }
                if !early.is_empty() {
                    downstream.write_all(&early).await?;
                }
                let (sent, received) =
                    net::copy_bidirectional(&mut downstream, &mut remote).await?;
                debug!(
                    "CONNECT {} via {} done (sent: {}, received: {})",
                    uri,
                    upstream.authority(),
                    sent,
                    received
                );
                Ok(())
            }
            Err(e) => {
                let response = format!(
                    "HTTP/1.1 502 Bad Gateway\r\n\
                     Content-Type: text/plain\r\n\
                     Connection: close\r\n\r\n\
                     Connection failed: {}",
                    e
                );
                downstream.write_all(response.as_bytes()).await?;
                Err(e)
            }
        }
    } else {
        let authority = upstream.authority();
        let mut remote = timeout(DIAL_TIMEOUT, TcpStream::connect(&authority))
            .await
            .map_err(|_| Error::timeout(format!("dialing upstream proxy {}", authority)))?
            .map_err(|e| Error::dial(format!("{}: {}", authority, e)))?;
        net::configure_tcp_stream(&remote);

        let rewritten = rewrite_head(&head, upstream.basic_auth().as_deref())?;
        remote.write_all(rewritten.as_bytes()).await?;
        if !leftover.is_empty() {
            remote.write_all(&leftover).await?;
        }

        let (sent, received) = net::copy_bidirectional(&mut downstream, &mut remote).await?;
        debug!(
            "{} {} via {} done (sent: {}, received: {})",
            method, uri, authority, sent, received
        );
        Ok(())
    }
}

/// Rewrite a client request head for the upstream proxy: any downstream
/// `Proxy-Authorization` is stripped and the upstream's own credentials are
/// injected instead.
///
/// Only this first head is rewritten; everything after it is spliced raw.
/// `Connection: close` is therefore forced so a keep-alive client cannot send
/// a second, uncredentialed request down the same connection.
fn rewrite_head(head: &str, auth: Option<&str>) -> Result<String> {
    let mut lines = head.lines();
    let request_line = lines
        .next()
        .ok_or_else(|| Error::protocol("empty request"))?;

    let mut out = format!("{}\r\n", request_line);
    for line in lines {
        if line.is_empty() {
            break;
        }
        let name = line.split(':').next().unwrap_or("").trim();
        if name.eq_ignore_ascii_case("proxy-authorization")
            || name.eq_ignore_ascii_case("connection")
            || name.eq_ignore_ascii_case("proxy-connection")
        {
            continue;
        }
        out.push_str(line);
        out.push_str("\r\n");
    }
    if let Some(auth) = auth {
        out.push_str(&format!("Proxy-Authorization: {}\r\n", auth));
    }
    out.push_str("Connection: close\r\n\r\n");
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rewrite_head_injects_credentials() {
        let head = "GET http://example.com/ HTTP/1.1\r\n\
                    Host: example.com\r\n\
                    Proxy-Authorization: Basic c3RhbGU=\r\n\r\n";
        let out = rewrite_head(head, Some("Basic Zm9vOmJhcg==")).unwrap();
        assert!(out.starts_with("GET http://example.com/ HTTP/1.1\r\n"));
        assert!(out.contains("Host: example.com\r\n"));
        assert!(out.contains("Proxy-Authorization: Basic Zm9vOmJhcg==\r\n"));
        assert!(!out.contains("c3RhbGU="));
        assert!(out.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_rewrite_head_without_credentials() {
        let head = "GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let out = rewrite_head(head, None).unwrap();
        assert!(!out.to_ascii_lowercase().contains("proxy-authorization"));
    }

    #[test]
    fn test_rewrite_head_forces_connection_close() {
        let head = "GET http://example.com/ HTTP/1.1\r\n\
                    Host: example.com\r\n\
                    Connection: keep-alive\r\n\
                    Proxy-Connection: keep-alive\r\n\r\n";
        let out = rewrite_head(head, Some("Basic Zm9vOmJhcg==")).unwrap();
        assert!(!out.to_ascii_lowercase().contains("keep-alive"));
        assert!(!out.to_ascii_lowercase().contains("proxy-connection"));
        assert!(out.ends_with("Connection: close\r\n\r\n"));
        assert_eq!(out.matches("Connection:").count(), 1);
    }
}
