//! Proxychain - anonymizing HTTP proxy chaining and CONNECT tunnels
//!
//! Two user-facing capabilities:
//! - **anonymize_proxy**: wrap an upstream proxy that requires Basic
//!   credentials behind a local, credential-free endpoint that injects the
//!   credentials on the client's behalf.
//! - **create_tunnel**: a raw TCP tunnel to a fixed `host:port` target routed
//!   through an upstream HTTP proxy via the `CONNECT` method.
//!
//! # Architecture
//!
//! ```text
//!            +-------------+        +-------------+
//! client --->| tunnel/     |        | server/     |<--- proxy client
//!            | (listener)  |        | (fwd proxy) |
//!            +------+------+        +------+------+
//!                   |                      |
//!            +------v----------------------v------+
//!            |            chain/                  |
//!            |  (upstream CONNECT handshake)      |
//!            +------+-----------------------------+
//!                   |
//!            +------v------+
//!            |  registry/  |
//!            | (sessions)  |
//!            +-------------+
//! ```
//!
//! All listeners and live sessions are tracked in a [`registry::Registry`]
//! owned by a [`ProxyChain`] instance, so independent instances never share
//! state and can be torn down in isolation.

pub mod anonymize;
pub mod chain;
pub mod common;
pub mod config;
pub mod registry;
pub mod server;
pub mod tunnel;

pub use anonymize::AnonymizeOptions;
pub use common::error::{Error, Result};
pub use common::{ProxyUrl, TargetAddr};
pub use config::Config;
pub use tunnel::TunnelOptions;

use registry::Registry;
use std::sync::Arc;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Proxy chain manager owning the listener/session registry.
pub struct ProxyChain {
    registry: Arc<Registry>,
}

impl ProxyChain {
    pub fn new() -> Self {
        ProxyChain {
            registry: Arc::new(Registry::new()),
        }
    }

    /// Parse and validate `proxy_url`. If it carries credentials, start a
    /// local forward proxy on `options.port` that injects them, and return the
    /// anonymous URL `http://127.0.0.1:<port>`. A credential-free URL is
    /// already anonymous and is returned unchanged with no listener started.
    pub async fn anonymize_proxy(
        &self,
        proxy_url: &str,
        options: AnonymizeOptions,
    ) -> Result<String> {
        anonymize::anonymize_proxy(&self.registry, proxy_url, options).await
    }

    /// Close an anonymized proxy by its exact URL. Returns `false` when
    /// nothing is registered under the URL (including a repeated close).
    pub fn close_anonymized_proxy(
        &self,
        anonymized_proxy_url: &str,
        close_connections: bool,
    ) -> bool {
        anonymize::close_anonymized_proxy(&self.registry, anonymized_proxy_url, close_connections)
    }

    /// Bind a local listener on `options.port` that tunnels every accepted
    /// connection to `target` through the upstream proxy's CONNECT method.
    /// Returns the external address, e.g. `"localhost:5555"`.
    pub async fn create_tunnel(
        &self,
        proxy_url: &str,
        target: &str,
        options: TunnelOptions,
    ) -> Result<String> {
        tunnel::create_tunnel(&self.registry, proxy_url, target, options).await
    }

    /// Close a tunnel by the address `create_tunnel` returned. `Ok(false)`
    /// when nothing is registered under that address; an error when the
    /// address lacks a host or port component.
    pub fn close_tunnel(&self, server_path: &str, close_connections: bool) -> Result<bool> {
        tunnel::close_tunnel(&self.registry, server_path, close_connections)
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Close every listener this instance started, forcing open connections
    /// shut.
    pub fn shutdown(&self) {
        self.registry.drain();
    }
}

impl Default for ProxyChain {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_instances_are_isolated() {
        let a = ProxyChain::new();
        let b = ProxyChain::new();
        assert!(!Arc::ptr_eq(a.registry(), b.registry()));
    }
}
