//! Raw TCP tunnels routed through an upstream HTTP proxy
//!
//! `create_tunnel` binds a local listener; every accepted connection is chained
//! to one fixed target through the upstream proxy's CONNECT method and then
//! spliced bidirectionally.

use crate::chain::TcpChain;
use crate::common::net;
use crate::common::{ProxyUrl, TargetAddr};
use crate::registry::{ConnectionGuard, ConnectionSet, ListenerEntry, Registry};
use crate::{Error, Result};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Options for [`create_tunnel`](crate::ProxyChain::create_tunnel).
#[derive(Debug, Clone, Default)]
pub struct TunnelOptions {
    /// Local port to bind. Mandatory; there is no implicit ephemeral fallback.
    pub port: u16,
    /// Hostname used in the externally reported address (default `localhost`).
    pub hostname: Option<String>,
    /// Extra consecutive ports to try when the requested one is taken.
    pub port_retries: u16,
}

impl TunnelOptions {
    pub fn new(port: u16) -> Self {
        TunnelOptions {
            port,
            ..Default::default()
        }
    }
}

pub(crate) async fn create_tunnel(
    registry: &Arc<Registry>,
    proxy_url: &str,
    target: &str,
    options: TunnelOptions,
) -> Result<String> {
    let target = TargetAddr::parse(target)?;
    let upstream = ProxyUrl::parse(proxy_url)?;

    let (listener, port) =
        bind_with_retries("0.0.0.0", options.port, options.port_retries).await?;
    let hostname = options
        .hostname
        .unwrap_or_else(|| "localhost".to_string());
    let key = format!("{}:{}", hostname, port);

    let entry = ListenerEntry::new();
    let shutdown = entry.shutdown_token();
    let connections = entry.connections();
    registry.insert_tunnel(key.clone(), entry);

    info!(
        "tunnel {} -> {} via {}",
        key,
        target,
        upstream.authority()
    );

    let chain = Arc::new(TcpChain::new(upstream, target));
    tokio::spawn(accept_loop(listener, chain, shutdown, connections));

    Ok(key)
}

/// Close a tunnel previously started by `create_tunnel`.
///
/// Unknown or already-closed paths return `Ok(false)`; a path missing its host
/// or port component is an error.
pub(crate) fn close_tunnel(
    registry: &Arc<Registry>,
    server_path: &str,
    close_connections: bool,
) -> Result<bool> {
    TargetAddr::parse(server_path)?;
    match registry.remove_tunnel(server_path) {
        None => Ok(false),
        Some(entry) => {
            entry.close(close_connections);
            info!("tunnel {} closed", server_path);
            Ok(true)
        }
    }
}

/// Bind a listener on `port`, walking up through `port + retries` on
/// address-in-use collisions.
pub(crate) async fn bind_with_retries(
    host: &str,
    port: u16,
    retries: u16,
) -> Result<(TcpListener, u16)> {
    if port == 0 {
        return Err(Error::config(
            "options.port must be specified; ephemeral ports are not selected automatically",
        ));
    }

    let mut attempt = 0u16;
    loop {
        let candidate = port
            .checked_add(attempt)
            .ok_or_else(|| Error::listen(format!("port retry overflowed past {}", port)))?;

        match TcpListener::bind((host, candidate)).await {
            Ok(listener) => return Ok((listener, candidate)),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse && attempt < retries => {
                debug!("port {} in use, trying the next one", candidate);
                attempt += 1;
            }
            Err(e) => {
                return Err(Error::listen(format!("{}:{}: {}", host, candidate, e)));
            }
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    chain: Arc<TcpChain>,
    shutdown: CancellationToken,
    connections: Arc<ConnectionSet>,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((downstream, peer)) => {
                    let guard = connections.register();
                    let chain = Arc::clone(&chain);
                    tokio::spawn(run_session(chain, downstream, peer, guard));
                }
                Err(e) => warn!("tunnel accept error: {}", e),
            },
        }
    }
    debug!("tunnel listener for {} stopped", chain.target());
}

/// Drive one tunnel session from accept to teardown.
///
/// A failure here terminates only this session; the listener and its sibling
/// sessions are untouched.
async fn run_session(
    chain: Arc<TcpChain>,
    mut downstream: TcpStream,
    peer: SocketAddr,
    guard: ConnectionGuard,
) {
    let id = guard.id();
    debug!("[{}] connection from {}", id, peer);
    net::configure_tcp_stream(&downstream);

    // The downstream socket is left untouched until the upstream tunnel is
    // confirmed; no byte may flow in either direction before then.
    let opened = tokio::select! {
        result = chain.open() => result,
        _ = guard.cancelled() => {
            debug!("[{}] forcibly closed before establishment", id);
            return;
        }
    };

    let (mut upstream, early) = match opened {
        Ok(pair) => pair,
        Err(e) => {
            // Drop the downstream socket unanswered: the caller observes a
            // plain connection failure, never the upstream's rejection body.
            debug!("[{}] chain to {} failed: {}", id, chain.target(), e);
            return;
        }
    };

    if !early.is_empty() {
        if let Err(e) = downstream.write_all(&early).await {
            debug!("[{}] downstream write failed: {}", id, e);
            return;
        }
    }

    tokio::select! {
        result = net::copy_bidirectional(&mut downstream, &mut upstream) => match result {
            Ok((sent, received)) => debug!(
                "[{}] session to {} done (sent: {}, received: {})",
                id, chain.target(), sent, received
            ),
            Err(e) => debug!("[{}] session to {} errored: {}", id, chain.target(), e),
        },
        _ = guard.cancelled() => debug!("[{}] forcibly closed", id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_default_to_no_port() {
        let options = TunnelOptions::default();
        assert_eq!(options.port, 0);
        assert_eq!(options.port_retries, 0);
        assert!(options.hostname.is_none());
    }

    #[tokio::test]
    async fn test_bind_rejects_missing_port() {
        let err = bind_with_retries("127.0.0.1", 0, 0).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_bind_retries_on_collision() {
        let (taken, port) = bind_with_retries("127.0.0.1", 23801, 50).await.unwrap();
        let (second, next) = bind_with_retries("127.0.0.1", port, 50).await.unwrap();
        assert!(next > port);
        drop(taken);
        drop(second);
    }
}
