//! Anonymizing proxy management
//!
//! Wraps an upstream proxy that requires credentials behind a local,
//! credential-free endpoint. A credential-free upstream is already anonymous
//! and is returned unchanged without starting anything.

use crate::common::ProxyUrl;
use crate::registry::{ListenerEntry, Registry};
use crate::server;
use crate::tunnel::bind_with_retries;
use crate::Result;
use std::sync::Arc;
use tracing::info;

/// Options for [`anonymize_proxy`](crate::ProxyChain::anonymize_proxy).
#[derive(Debug, Clone, Default)]
pub struct AnonymizeOptions {
    /// Local port to bind. Mandatory when the upstream carries credentials;
    /// there is no implicit ephemeral fallback.
    pub port: u16,
    /// Extra consecutive ports to try when the requested one is taken.
    pub port_retries: u16,
}

impl AnonymizeOptions {
    pub fn new(port: u16) -> Self {
        AnonymizeOptions {
            port,
            ..Default::default()
        }
    }
}

pub(crate) async fn anonymize_proxy(
    registry: &Arc<Registry>,
    proxy_url: &str,
    options: AnonymizeOptions,
) -> Result<String> {
    let upstream = ProxyUrl::parse(proxy_url)?;

    if !upstream.has_credentials() {
        return Ok(proxy_url.to_string());
    }

    let (listener, port) =
        bind_with_retries("127.0.0.1", options.port, options.port_retries).await?;

    let entry = ListenerEntry::new();
    let shutdown = entry.shutdown_token();
    let connections = entry.connections();
    let key = format!("http://127.0.0.1:{}", port);
    registry.insert_server(key.clone(), entry);

    info!("anonymized {} as {}", upstream.authority(), key);

    tokio::spawn(server::accept_loop(
        listener,
        Arc::new(upstream),
        shutdown,
        connections,
    ));

    Ok(key)
}

/// Close an anonymized proxy previously started by `anonymize_proxy`.
///
/// Returns `false` when no proxy is registered under the URL, including a
/// repeated close; `true` otherwise.
pub(crate) fn close_anonymized_proxy(
    registry: &Arc<Registry>,
    anonymized_proxy_url: &str,
    close_connections: bool,
) -> bool {
    match registry.remove_server(anonymized_proxy_url) {
        None => false,
        Some(entry) => {
            entry.close(close_connections);
            info!("anonymized proxy {} closed", anonymized_proxy_url);
            true
        }
    }
}
