//! # Nodes Module
//!
//! Discovery, health tracking and selection of Lavalink nodes.
//!
//! Nodes come from three places, merged in this order: the operator's
//! override file, the `LAVALINK_*` pinned node and the public node lists.
//! Every candidate is health-checked before it is registered with the audio
//! client. A background sweep keeps re-checking them, demotes nodes after
//! three consecutive failures and evicts them after five, while a refresh
//! loop tops the pool back up.

pub mod manager;

pub use manager::{NodeManager, NodeSettings, NodeStats};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::sync::Arc;

use crate::audio::node::AudioNode;
use crate::config::DEFAULT_LAVALINK_PASSWORD;

/// Fallos seguidos tras los cuales un nodo deja de elegirse
pub const UNHEALTHY_AFTER: u32 = 3;
/// Fallos seguidos tras los cuales un nodo sale del pool
pub const EVICT_AFTER: u32 = 5;
/// Puntaje de un nodo que no debe elegirse
pub const UNHEALTHY_SCORE: f64 = 9999.0;

fn port_from_any<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Number(u16),
        Text(String),
    }

    match Port::deserialize(deserializer)? {
        Port::Number(port) => Ok(port),
        Port::Text(text) => text.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// Nodo tal como lo publican las listas y el archivo de override
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub host: String,
    #[serde(deserialize_with = "port_from_any")]
    pub port: u16,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub identifier: Option<String>,
    #[serde(default, alias = "restVersion")]
    pub version: Option<String>,
}

impl NodeDescriptor {
    /// Versión del protocolo, `v4` si la entrada no la indica
    pub fn version(&self) -> String {
        self.version
            .as_deref()
            .map(|v| v.trim().to_lowercase())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "v4".to_string())
    }

    /// Parsea un arreglo JSON de forma tolerante: las entradas inválidas se ignoran
    pub fn parse_list(values: Vec<serde_json::Value>) -> Vec<Self> {
        values
            .into_iter()
            .filter_map(|value| serde_json::from_value::<Self>(value).ok())
            .filter(|d| !d.host.trim().is_empty() && d.port != 0)
            .collect()
    }
}

/// Miembro del pool con su registro de salud
#[derive(Debug, Clone, PartialEq)]
pub struct NodeInfo {
    pub identifier: String,
    pub host: String,
    pub port: u16,
    pub password: String,
    pub secure: bool,
    pub version: String,
    /// Carga de CPU normalizada que reporta el nodo (0.0 - 1.0)
    pub load: f64,
    pub players: u32,
    pub latency_ms: f64,
    pub health_failures: u32,
    pub is_healthy: bool,
    pub last_health_check: Option<DateTime<Utc>>,
}

impl From<NodeDescriptor> for NodeInfo {
    fn from(d: NodeDescriptor) -> Self {
        let version = d.version();
        let identifier = d
            .identifier
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| format!("{}-{}", d.host, d.port));
        Self {
            identifier,
            host: d.host,
            port: d.port,
            password: d
                .password
                .unwrap_or_else(|| DEFAULT_LAVALINK_PASSWORD.to_string()),
            secure: d.secure,
            version,
            load: 0.0,
            players: 0,
            latency_ms: 0.0,
            health_failures: 0,
            is_healthy: true,
            last_health_check: None,
        }
    }
}

impl NodeInfo {
    /// Menor es mejor.
    ///
    /// `load*100 + players/500*50 + min(latency/10, 100) + failures*20`, o
    /// [`UNHEALTHY_SCORE`] para nodos no saludables.
    pub fn score(&self) -> f64 {
        if !self.is_healthy {
            return UNHEALTHY_SCORE;
        }
        self.load * 100.0
            + f64::from(self.players) / 500.0 * 50.0
            + (self.latency_ms / 10.0).min(100.0)
            + f64::from(self.health_failures) * 20.0
    }

    pub fn base_url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }

    pub fn websocket_url(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!("{}://{}:{}/v4/websocket", scheme, self.host, self.port)
    }

    /// Dos entradas con la misma clave son el mismo servidor
    pub fn endpoint_key(&self) -> (String, u16, bool) {
        (self.host.to_lowercase(), self.port, self.secure)
    }
}

/// Conecta los miembros del pool con el cliente de audio
#[async_trait]
pub trait NodeRegistry: Send + Sync {
    async fn register(&self, node: &NodeInfo) -> anyhow::Result<()>;

    async fn unregister(&self, identifier: &str);

    fn node(&self, identifier: &str) -> Option<Arc<dyn AudioNode>>;

    /// Si el stream de eventos del nodo está activo
    fn is_connected(&self, identifier: &str) -> bool;
}

/// Lo que el motor de reproducción necesita de la gestión de nodos
pub trait NodeSelector: Send + Sync {
    /// El nodo preferido mientras siga sano, si no el mejor
    fn select(&self, preferred: Option<&str>) -> Option<Arc<dyn AudioNode>>;

    /// El nodo con este identificador, sano o no
    fn get(&self, identifier: &str) -> Option<Arc<dyn AudioNode>>;

    fn report_failure(&self, identifier: &str);
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn node() -> NodeInfo {
        NodeInfo::from(NodeDescriptor {
            host: "lava.example".to_string(),
            port: 443,
            password: None,
            secure: true,
            identifier: None,
            version: None,
        })
    }

    #[test]
    fn descriptor_defaults() {
        let info = node();
        assert_eq!(info.identifier, "lava.example-443");
        assert_eq!(info.password, "youshallnotpass");
        assert_eq!(info.version, "v4");
        assert_eq!(info.base_url(), "https://lava.example:443");
        assert_eq!(info.websocket_url(), "wss://lava.example:443/v4/websocket");
    }

    #[test]
    fn score_combines_load_players_latency_and_failures() {
        let mut info = node();
        info.load = 0.5;
        info.players = 250;
        info.latency_ms = 120.0;
        info.health_failures = 1;
        // 50 + 25 + 12 + 20
        assert!((info.score() - 107.0).abs() < 1e-9);

        info.latency_ms = 5_000.0;
        assert!((info.score() - 195.0).abs() < 1e-9);

        info.is_healthy = false;
        assert_eq!(info.score(), UNHEALTHY_SCORE);
    }

    #[test]
    fn parses_lists_leniently() {
        let values: Vec<serde_json::Value> = serde_json::from_str(
            r#"[
                {"host": "a.example", "port": 2333, "password": "pw", "secure": false, "version": "v4"},
                {"host": "b.example", "port": "443", "secure": true, "identifier": "B", "restVersion": "v3"},
                {"port": 80},
                "garbage"
            ]"#,
        )
        .unwrap();

        let parsed = NodeDescriptor::parse_list(values);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[1].port, 443);
        assert_eq!(parsed[1].version(), "v3");
    }
}
