//! Fleet environment configuration.
//!
//! The deployment descriptor compiler materializes one environment per
//! process; this module consumes it as opaque configuration. JSON-valued
//! variables (`APP_SSLS`, `APP_LINKS`, `APP_NODES`) are parsed strictly:
//! a missing variable falls back to its default, a malformed one is an
//! error rather than a silent default.

use crate::error::{MeshError, MeshResult};
use serde::Deserialize;
use std::collections::HashMap;

/// TLS material referenced by `APP_SSLS`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SslPaths {
    /// Path to the private key PEM file.
    pub key: String,
    /// Path to the certificate PEM file.
    pub cert: String,
}

/// One peer node entry from `APP_NODES`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NodeEntry {
    /// Public host name of the node.
    pub host: String,
    /// Internal address peers dial.
    pub inip: String,
    /// Listen port.
    pub port: u16,
    /// Whether the node terminates TLS (peers dial `wss://`).
    #[serde(default)]
    pub ssls: bool,
}

impl NodeEntry {
    /// The WebSocket URL a peer client dials to reach this node.
    pub fn url(&self) -> String {
        let scheme = if self.ssls { "wss" } else { "ws" };
        format!("{scheme}://{}:{}", self.inip, self.port)
    }
}

/// The per-process environment produced by the fleet descriptor compiler.
#[derive(Debug, Clone)]
pub struct FleetEnv {
    /// Working directory (`APP_DIR`).
    pub dir: String,
    /// Environment name, e.g. `dev` or `production` (`APP_ENV`).
    pub env: String,
    /// Local node's application name (`APP_NAME`).
    pub name: String,
    /// Public host name (`APP_HOST`).
    pub host: String,
    /// Internal bind address (`APP_INIP`).
    pub inip: String,
    /// Listen port (`APP_PORT`).
    pub port: u16,
    /// TLS material, when the node terminates TLS (`APP_SSLS`).
    pub ssls: Option<SslPaths>,
    /// Peer group names this node links to (`APP_LINKS`).
    pub links: Vec<String>,
    /// Full node map, group name to node list (`APP_NODES`).
    pub nodes: HashMap<String, Vec<NodeEntry>>,
}

fn var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_json_var<T: serde::de::DeserializeOwned>(name: &str) -> MeshResult<Option<T>> {
    match var(name) {
        None => Ok(None),
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| MeshError::Config(format!("{name}: {e}"))),
    }
}

impl FleetEnv {
    /// Read the fleet environment of this process.
    pub fn from_env() -> MeshResult<Self> {
        let port = match var("APP_PORT") {
            None => 8080,
            Some(raw) => raw
                .parse::<u16>()
                .map_err(|e| MeshError::Config(format!("APP_PORT: {e}")))?,
        };
        Ok(Self {
            dir: var("APP_DIR").unwrap_or_else(|| ".".into()),
            env: var("APP_ENV").unwrap_or_else(|| "dev".into()),
            name: var("APP_NAME").unwrap_or_else(|| "node".into()),
            host: var("APP_HOST").unwrap_or_else(|| "localhost".into()),
            inip: var("APP_INIP").unwrap_or_else(|| "127.0.0.1".into()),
            port,
            ssls: parse_json_var("APP_SSLS")?,
            links: parse_json_var("APP_LINKS")?.unwrap_or_default(),
            nodes: parse_json_var("APP_NODES")?.unwrap_or_default(),
        })
    }

    /// The peer endpoints this node links to: one list per linked group,
    /// in `APP_LINKS` order. Groups named in `APP_LINKS` but absent from
    /// `APP_NODES` resolve to empty lists.
    pub fn linked_nodes(&self) -> HashMap<String, Vec<NodeEntry>> {
        self.links
            .iter()
            .map(|group| {
                let entries = self.nodes.get(group).cloned().unwrap_or_default();
                (group.clone(), entries)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn node_entry_urls() {
        let plain = NodeEntry {
            host: "a.example".into(),
            inip: "10.0.0.1".into(),
            port: 9000,
            ssls: false,
        };
        assert_eq!(plain.url(), "ws://10.0.0.1:9000");
        let tls = NodeEntry { ssls: true, ..plain };
        assert_eq!(tls.url(), "wss://10.0.0.1:9000");
    }

    #[test]
    fn node_map_parses_with_default_ssls() {
        let raw = json!({
            "chat": [
                {"host": "c1.example", "inip": "10.0.0.1", "port": 9001},
                {"host": "c2.example", "inip": "10.0.0.2", "port": 9002, "ssls": true}
            ]
        })
        .to_string();
        let nodes: HashMap<String, Vec<NodeEntry>> = serde_json::from_str(&raw).unwrap();
        assert_eq!(nodes["chat"].len(), 2);
        assert!(!nodes["chat"][0].ssls);
        assert!(nodes["chat"][1].ssls);
    }

    // Environment variables are process-global, so the env-reading paths are
    // exercised in a single test with unique values set up front.
    #[test]
    fn from_env_reads_and_validates() {
        std::env::set_var("APP_NAME", "gate");
        std::env::set_var("APP_PORT", "9100");
        std::env::set_var("APP_LINKS", "[\"chat\"]");
        std::env::set_var(
            "APP_NODES",
            json!({"chat": [{"host": "h", "inip": "127.0.0.1", "port": 9200}]}).to_string(),
        );

        let env = FleetEnv::from_env().unwrap();
        assert_eq!(env.name, "gate");
        assert_eq!(env.port, 9100);
        assert_eq!(env.links, vec!["chat".to_string()]);
        let linked = env.linked_nodes();
        assert_eq!(linked["chat"][0].url(), "ws://127.0.0.1:9200");

        std::env::set_var("APP_NODES", "{not json");
        assert!(FleetEnv::from_env().is_err());
        std::env::remove_var("APP_NODES");
        std::env::remove_var("APP_LINKS");
        std::env::remove_var("APP_PORT");
        std::env::remove_var("APP_NAME");
    }
}
