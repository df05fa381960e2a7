use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::interval_at;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    NodeDescriptor, NodeInfo, NodeRegistry, NodeSelector, EVICT_AFTER, UNHEALTHY_AFTER,
};
use crate::audio::node::AudioNode;
use crate::config::Config;
use crate::retry::RetryPolicy;

/// Parámetros de descubrimiento y salud
#[derive(Debug, Clone)]
pub struct NodeSettings {
    pub list_urls: Vec<String>,
    pub versions: Vec<String>,
    pub override_file: Option<PathBuf>,
    pub pinned: Option<NodeDescriptor>,
    pub max_nodes: usize,
    pub min_healthy: usize,
    pub health_interval: Duration,
    pub refresh_interval: Duration,
    pub health_timeout: Duration,
    pub fetch_timeout: Duration,
    pub retry: RetryPolicy,
}

impl NodeSettings {
    pub fn from_config(config: &Config) -> Self {
        let pinned = config.lavalink_host.as_ref().map(|host| NodeDescriptor {
            host: host.clone(),
            port: config.lavalink_port,
            password: Some(config.lavalink_password.clone()),
            secure: config.lavalink_secure,
            identifier: Some("pinned".to_string()),
            version: None,
        });

        Self {
            list_urls: config.node_list_urls.clone(),
            versions: config.node_versions.clone(),
            override_file: Some(config.nodes_override_file.clone()),
            pinned,
            max_nodes: config.max_nodes,
            min_healthy: config.min_healthy_nodes,
            health_interval: Duration::from_secs(config.node_health_interval),
            refresh_interval: Duration::from_secs(config.node_refresh_interval),
            health_timeout: config.health_timeout(),
            fetch_timeout: config.fetch_timeout(),
            retry: RetryPolicy::new(
                config.retry_attempts,
                Duration::from_millis(config.retry_base_delay_ms),
            ),
        }
    }
}

/// Estadísticas del pool para logs y el comando `/nodes`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeStats {
    pub total: usize,
    pub healthy: usize,
    pub players: u64,
    pub average_load: f64,
    pub average_latency_ms: f64,
}

impl std::fmt::Display for NodeStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{} nodos sanos, {} players, carga media {:.1}%, latencia media {:.0}ms",
            self.healthy,
            self.total,
            self.players,
            self.average_load * 100.0,
            self.average_latency_ms
        )
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatsResponse {
    players: u32,
    cpu: CpuStats,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CpuStats {
    lavalink_load: f64,
}

/// Resultado de una ronda de chequeos de salud
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub checked: usize,
    pub healthy: usize,
    pub evicted: Vec<String>,
}

/// Gestor de salud y selección de nodos.
///
/// El pool vive tras un lock síncrono que nunca se mantiene durante un
/// `.await`; el trabajo de red se hace sobre copias que luego se integran.
pub struct NodeManager {
    http: reqwest::Client,
    registry: Arc<dyn NodeRegistry>,
    nodes: RwLock<HashMap<String, NodeInfo>>,
    settings: NodeSettings,
}

impl NodeManager {
    pub fn new(settings: NodeSettings, registry: Arc<dyn NodeRegistry>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("akio/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("cannot build HTTP client")?;

        Ok(Self {
            http,
            registry,
            nodes: RwLock::new(HashMap::new()),
            settings,
        })
    }

    pub fn settings(&self) -> &NodeSettings {
        &self.settings
    }

    /// Foto del pool, mejores nodos primero
    pub fn nodes(&self) -> Vec<NodeInfo> {
        let mut nodes: Vec<NodeInfo> = self.nodes.read().values().cloned().collect();
        nodes.sort_by(|a, b| a.score().total_cmp(&b.score()).then_with(|| a.identifier.cmp(&b.identifier)));
        nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    pub fn healthy_count(&self) -> usize {
        self.nodes.read().values().filter(|n| n.is_healthy).count()
    }

    /// Obtiene candidatos de los endpoints de descubrimiento en orden de prioridad.
    ///
    /// Gana el primer endpoint con una lista no vacía. Nunca falla: si se
    /// agotan todos retorna una lista vacía.
    pub async fn fetch_candidate_nodes(&self) -> Vec<NodeDescriptor> {
        for url in &self.settings.list_urls {
            let fetched = self
                .settings
                .retry
                .run("lista de nodos", || self.fetch_list(url))
                .await;

            match fetched {
                Ok(nodes) if !nodes.is_empty() => {
                    info!("🌐 {} nodos candidatos desde {}", nodes.len(), url);
                    return nodes;
                }
                Ok(_) => warn!("📭 Lista de nodos vacía en {}", url),
                Err(e) => warn!("⚠️ No se pudo obtener la lista {}: {:#}", url, e),
            }
        }

        warn!("❌ Ningún endpoint de descubrimiento devolvió nodos");
        Vec::new()
    }

    async fn fetch_list(&self, url: &str) -> Result<Vec<NodeDescriptor>> {
        let values: Vec<serde_json::Value> = self
            .http
            .get(url)
            .timeout(self.settings.fetch_timeout)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(NodeDescriptor::parse_list(values))
    }

    /// Nodos del archivo de override. Sin archivo, ninguno
    pub fn load_override_nodes(&self) -> Vec<NodeDescriptor> {
        let Some(path) = &self.settings.override_file else {
            return Vec::new();
        };

        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!("⚠️ No se pudo leer {}: {}", path.display(), e);
                return Vec::new();
            }
        };

        match serde_json::from_str::<Vec<serde_json::Value>>(&raw) {
            Ok(values) => {
                let nodes = NodeDescriptor::parse_list(values);
                info!("📌 {} nodos en {}", nodes.len(), path.display());
                nodes
            }
            Err(e) => {
                warn!("⚠️ Archivo de nodos inválido {}: {}", path.display(), e);
                Vec::new()
            }
        }
    }

    async fn probe_version(&self, node: &NodeInfo) -> Result<Duration> {
        let url = format!("{}/version", node.base_url());
        let started = Instant::now();
        self.http
            .get(&url)
            .header("Authorization", &node.password)
            .timeout(self.settings.health_timeout)
            .send()
            .await?
            .error_for_status()?;
        Ok(started.elapsed())
    }

    fn record_probe(node: &mut NodeInfo, probe: Result<Duration>) -> bool {
        node.last_health_check = Some(Utc::now());
        match probe {
            Ok(latency) => {
                node.latency_ms = latency.as_secs_f64() * 1000.0;
                node.health_failures = node.health_failures.saturating_sub(1);
                node.is_healthy = true;
                debug!("💚 {} responde en {:.0}ms", node.identifier, node.latency_ms);
                true
            }
            Err(e) => {
                node.health_failures += 1;
                if node.health_failures >= UNHEALTHY_AFTER {
                    node.is_healthy = false;
                }
                warn!(
                    "💔 Chequeo fallido de {} ({} fallos): {:#}",
                    node.identifier, node.health_failures, e
                );
                false
            }
        }
    }

    /// Consulta el endpoint de versión del nodo y actualiza su registro de salud
    pub async fn check_health(&self, node: &mut NodeInfo) -> bool {
        let target: &NodeInfo = node;
        let probe = self
            .settings
            .retry
            .run("chequeo de salud", || self.probe_version(target))
            .await;
        Self::record_probe(node, probe)
    }

    async fn poll_stats(&self, node: &mut NodeInfo) {
        let url = format!("{}/v4/stats", node.base_url());
        let response = self
            .http
            .get(&url)
            .header("Authorization", &node.password)
            .timeout(self.settings.health_timeout)
            .send()
            .await
            .and_then(|r| r.error_for_status());

        let stats = match response {
            Ok(response) => response.json::<StatsResponse>().await,
            Err(e) => Err(e),
        };

        match stats {
            Ok(stats) => {
                node.players = stats.players;
                node.load = stats.cpu.lavalink_load;
            }
            Err(e) => debug!("📊 Sin estadísticas de {}: {}", node.identifier, e),
        }
    }

    /// Nodos seguros primero, orden aleatorio dentro de cada grupo
    fn order_candidates<R: Rng + ?Sized>(mut nodes: Vec<NodeInfo>, rng: &mut R) -> Vec<NodeInfo> {
        nodes.shuffle(rng);
        nodes.sort_by_key(|n| !n.secure);
        nodes
    }

    /// Chequea candidatos y registra hasta `limit` nodos sanos.
    ///
    /// Se ignoran versiones no soportadas y nodos ya presentes (mismo
    /// identificador o mismo host/puerto/secure). Retorna cuántos se agregaron.
    pub async fn add_nodes(&self, candidates: Vec<NodeDescriptor>, limit: usize) -> usize {
        if limit == 0 {
            return 0;
        }

        let fresh = {
            let pool = self.nodes.read();
            let mut seen_ids: HashSet<String> = pool.keys().cloned().collect();
            let mut seen_keys: HashSet<(String, u16, bool)> =
                pool.values().map(NodeInfo::endpoint_key).collect();

            let fresh: Vec<NodeInfo> = candidates
                .into_iter()
                .filter(|d| {
                    let version = d.version();
                    let supported = self.settings.versions.iter().any(|v| *v == version);
                    if !supported {
                        debug!("⏭️ {}:{} usa {} (no soportado)", d.host, d.port, version);
                    }
                    supported
                })
                .map(NodeInfo::from)
                .filter(|n| seen_keys.insert(n.endpoint_key()) && seen_ids.insert(n.identifier.clone()))
                .collect();
            fresh
        };

        let ordered = Self::order_candidates(fresh, &mut rand::thread_rng());

        let mut added = 0;
        for mut node in ordered {
            if added >= limit {
                break;
            }
            if !self.check_health(&mut node).await {
                continue;
            }
            if let Err(e) = self.registry.register(&node).await {
                warn!("⚠️ No se pudo registrar {}: {:#}", node.identifier, e);
                continue;
            }

            info!(
                "🎛️ Nodo {} agregado ({}, {:.0}ms)",
                node.identifier,
                node.base_url(),
                node.latency_ms
            );
            self.nodes.write().insert(node.identifier.clone(), node);
            added += 1;
        }

        added
    }

    /// Nodo sano con el menor puntaje
    pub fn get_best_node(&self) -> Option<NodeInfo> {
        self.ranked_healthy().into_iter().next()
    }

    fn ranked_healthy(&self) -> Vec<NodeInfo> {
        self.nodes()
            .into_iter()
            .filter(|n| n.is_healthy)
            .collect()
    }

    /// Marca el nodo como fallido y retorna el mejor restante
    pub fn handle_node_failure(&self, identifier: &str) -> Option<NodeInfo> {
        {
            let mut pool = self.nodes.write();
            if let Some(node) = pool.get_mut(identifier) {
                node.is_healthy = false;
                node.health_failures += 1;
                warn!(
                    "🚨 Nodo {} marcado como caído ({} fallos)",
                    identifier, node.health_failures
                );
            }
        }

        let fallback = self.get_best_node();
        match &fallback {
            Some(node) => info!("🔀 Usando {} como respaldo", node.identifier),
            None => warn!("❌ No quedan nodos sanos"),
        }
        fallback
    }

    /// Carga los nodos de override y fijo, luego completa el pool desde descubrimiento
    pub async fn bootstrap(&self) -> usize {
        let mut local = self.load_override_nodes();
        if let Some(pinned) = &self.settings.pinned {
            local.insert(0, pinned.clone());
        }

        let mut added = self.add_nodes(local, self.settings.max_nodes).await;

        let room = self.settings.max_nodes.saturating_sub(self.len());
        if room > 0 {
            let remote = self.fetch_candidate_nodes().await;
            added += self.add_nodes(remote, room).await;
        }

        info!("🎛️ Pool de nodos listo: {}", self.summary());
        added
    }

    /// Quita nodos enfermos cuando quedan pocos y rellena los lugares libres
    pub async fn refresh(&self) -> usize {
        if self.healthy_count() < self.settings.min_healthy {
            let dropped: Vec<String> = {
                let mut pool = self.nodes.write();
                let dead: Vec<String> = pool
                    .values()
                    .filter(|n| !n.is_healthy)
                    .map(|n| n.identifier.clone())
                    .collect();
                for id in &dead {
                    pool.remove(id);
                }
                dead
            };
            for id in &dropped {
                self.registry.unregister(id).await;
                info!("🗑️ Nodo caído {} descartado para refrescar el pool", id);
            }
        }

        let room = self.settings.max_nodes.saturating_sub(self.len());
        if room == 0 {
            return 0;
        }

        let candidates = self.fetch_candidate_nodes().await;
        let added = self.add_nodes(candidates, room).await;
        if added > 0 {
            info!("🔄 {} nodos nuevos tras refrescar", added);
        }
        added
    }

    /// Vuelve a chequear cada nodo, expulsando los que llegan a [`EVICT_AFTER`] fallos
    pub async fn health_sweep(&self) -> SweepReport {
        let snapshot: Vec<NodeInfo> = self.nodes.read().values().cloned().collect();

        let checks = snapshot.into_iter().map(|mut node| async move {
            let target = &node;
            let probe = self
                .settings
                .retry
                .run("chequeo de salud", || self.probe_version(target))
                .await
                .and_then(|latency| {
                    if self.registry.is_connected(&node.identifier) {
                        Ok(latency)
                    } else {
                        Err(anyhow::anyhow!("event socket is down"))
                    }
                });
            if Self::record_probe(&mut node, probe) {
                self.poll_stats(&mut node).await;
            }
            node
        });
        let checked = futures::future::join_all(checks).await;

        let mut report = SweepReport {
            checked: checked.len(),
            ..SweepReport::default()
        };
        {
            let mut pool = self.nodes.write();
            for node in checked {
                if node.health_failures >= EVICT_AFTER {
                    pool.remove(&node.identifier);
                    report.evicted.push(node.identifier);
                } else if let Some(slot) = pool.get_mut(&node.identifier) {
                    *slot = node;
                }
            }
            report.healthy = pool.values().filter(|n| n.is_healthy).count();
        }

        for id in &report.evicted {
            warn!("🗑️ Nodo {} expulsado tras {} fallos", id, EVICT_AFTER);
            self.registry.unregister(id).await;
        }

        if report.healthy < self.settings.min_healthy {
            info!(
                "📉 Solo {} nodos sanos (mínimo {}), refrescando",
                report.healthy, self.settings.min_healthy
            );
            self.refresh().await;
        }

        report
    }

    pub fn summary(&self) -> NodeStats {
        let pool = self.nodes.read();
        let healthy: Vec<&NodeInfo> = pool.values().filter(|n| n.is_healthy).collect();
        let count = healthy.len().max(1) as f64;

        NodeStats {
            total: pool.len(),
            healthy: healthy.len(),
            players: healthy.iter().map(|n| u64::from(n.players)).sum(),
            average_load: healthy.iter().map(|n| n.load).sum::<f64>() / count,
            average_latency_ms: healthy.iter().map(|n| n.latency_ms).sum::<f64>() / count,
        }
    }

    /// Arranca los ciclos de salud y refresco hasta que se active `shutdown`
    pub fn spawn_background(self: &Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let health = {
            let manager = Arc::clone(self);
            let shutdown = shutdown.clone();
            let period = self.settings.health_interval;
            tokio::spawn(async move {
                let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = ticker.tick() => {
                            let report = manager.health_sweep().await;
                            debug!(
                                "🩺 Barrido de salud: {}/{} sanos, {} expulsados",
                                report.healthy, report.checked, report.evicted.len()
                            );
                        }
                    }
                }
            })
        };

        let refresh = {
            let manager = Arc::clone(self);
            let period = self.settings.refresh_interval;
            tokio::spawn(async move {
                let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = ticker.tick() => {
                            manager.refresh().await;
                        }
                    }
                }
            })
        };

        vec![health, refresh]
    }
}

impl NodeSelector for NodeManager {
    fn select(&self, preferred: Option<&str>) -> Option<Arc<dyn AudioNode>> {
        if let Some(id) = preferred {
            let healthy = self.nodes.read().get(id).is_some_and(|n| n.is_healthy);
            if healthy {
                if let Some(node) = self.registry.node(id) {
                    return Some(node);
                }
            }
        }

        self.ranked_healthy()
            .into_iter()
            .find_map(|n| self.registry.node(&n.identifier))
    }

    fn get(&self, identifier: &str) -> Option<Arc<dyn AudioNode>> {
        self.registry.node(identifier)
    }

    fn report_failure(&self, identifier: &str) {
        self.handle_node_failure(identifier);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::UNHEALTHY_SCORE;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[derive(Default)]
    struct FakeRegistry {
        registered: Mutex<Vec<String>>,
        unregistered: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl NodeRegistry for FakeRegistry {
        async fn register(&self, node: &NodeInfo) -> anyhow::Result<()> {
            self.registered.lock().push(node.identifier.clone());
            Ok(())
        }

        async fn unregister(&self, identifier: &str) {
            self.unregistered.lock().push(identifier.to_string());
        }

        fn node(&self, _identifier: &str) -> Option<Arc<dyn AudioNode>> {
            None
        }

        fn is_connected(&self, _identifier: &str) -> bool {
            true
        }
    }

    /// Respondedor HTTP mínimo: `route(path)` retorna estado y cuerpo
    async fn serve(route: fn(&str) -> (u16, String)) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    let n = socket.read(&mut buf).await.unwrap_or(0);
                    let request = String::from_utf8_lossy(&buf[..n]);
                    let path = request.split_whitespace().nth(1).unwrap_or("/").to_string();
                    let (status, body) = route(&path);
                    let response = format!(
                        "HTTP/1.1 {} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        status,
                        body.len(),
                        body
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        addr
    }

    /// Acepta conexiones y nunca responde
    async fn black_hole() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });
        addr
    }

    fn settings() -> NodeSettings {
        NodeSettings {
            list_urls: Vec::new(),
            versions: vec!["v4".to_string()],
            override_file: None,
            pinned: None,
            max_nodes: 10,
            min_healthy: 0,
            health_interval: Duration::from_secs(300),
            refresh_interval: Duration::from_secs(600),
            health_timeout: Duration::from_millis(200),
            fetch_timeout: Duration::from_secs(2),
            retry: RetryPolicy::none(),
        }
    }

    fn manager(settings: NodeSettings) -> (Arc<FakeRegistry>, NodeManager) {
        let registry = Arc::new(FakeRegistry::default());
        let manager = NodeManager::new(settings, registry.clone()).unwrap();
        (registry, manager)
    }

    fn descriptor(host: &str, port: u16) -> NodeDescriptor {
        NodeDescriptor {
            host: host.to_string(),
            port,
            password: None,
            secure: false,
            identifier: None,
            version: Some("v4".to_string()),
        }
    }

    fn info(id: &str, load: f64, healthy: bool) -> NodeInfo {
        NodeInfo {
            identifier: id.to_string(),
            load,
            is_healthy: healthy,
            ..NodeInfo::from(descriptor(id, 2333))
        }
    }

    fn healthy_route(path: &str) -> (u16, String) {
        match path {
            "/version" => (200, "4.0.8".to_string()),
            "/v4/stats" => (
                200,
                r#"{"players": 12, "playingPlayers": 3, "cpu": {"cores": 4, "systemLoad": 0.2, "lavalinkLoad": 0.25}}"#
                    .to_string(),
            ),
            _ => (404, String::new()),
        }
    }

    #[tokio::test]
    async fn fetch_falls_through_endpoints_in_order() {
        fn route(path: &str) -> (u16, String) {
            match path {
                "/SSL" => (500, "oops".to_string()),
                "/All" => (200, "[]".to_string()),
                "/NonSSL" => (
                    200,
                    r#"[{"host": "a.example", "port": 2333}, {"host": "b.example", "port": 80}]"#.to_string(),
                ),
                _ => (404, String::new()),
            }
        }
        let addr = serve(route).await;
        let (_registry, manager) = manager(NodeSettings {
            list_urls: ["SSL", "All", "NonSSL"]
                .iter()
                .map(|p| format!("http://{addr}/{p}"))
                .collect(),
            ..settings()
        });

        let nodes = manager.fetch_candidate_nodes().await;
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].host, "a.example");
    }

    #[tokio::test]
    async fn fetch_never_fails() {
        let (_registry, manager) = manager(NodeSettings {
            list_urls: vec!["http://127.0.0.1:1/nothing".to_string()],
            ..settings()
        });
        assert!(manager.fetch_candidate_nodes().await.is_empty());
    }

    #[tokio::test]
    async fn successful_check_records_latency_and_heals() {
        let addr = serve(healthy_route).await;
        let (_registry, manager) = manager(settings());

        let mut node = NodeInfo::from(descriptor("127.0.0.1", addr.port()));
        node.health_failures = 2;

        assert!(manager.check_health(&mut node).await);
        assert!(node.is_healthy);
        assert_eq!(node.health_failures, 1);
        assert!(node.last_health_check.is_some());
    }

    #[tokio::test]
    async fn three_timeouts_make_a_node_unhealthy() {
        let addr = black_hole().await;
        let (_registry, manager) = manager(settings());
        let mut node = NodeInfo::from(descriptor("127.0.0.1", addr.port()));

        assert!(!manager.check_health(&mut node).await);
        assert!(!manager.check_health(&mut node).await);
        assert!(node.is_healthy);

        assert!(!manager.check_health(&mut node).await);
        assert_eq!(node.health_failures, 3);
        assert!(!node.is_healthy);
        assert_eq!(node.score(), UNHEALTHY_SCORE);
    }

    #[tokio::test]
    async fn add_nodes_filters_dedupes_and_respects_limit() {
        let addr = serve(healthy_route).await;
        let other = serve(healthy_route).await;
        let dead = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let (registry, manager) = manager(settings());

        let mut old = descriptor("127.0.0.1", addr.port());
        old.version = Some("v3".to_string());
        let candidates = vec![
            descriptor("127.0.0.1", addr.port()),
            descriptor("127.0.0.1", addr.port()),
            descriptor("127.0.0.1", other.port()),
            descriptor("127.0.0.1", dead),
            old,
        ];

        let added = manager.add_nodes(candidates.clone(), 10).await;
        assert_eq!(added, 2);
        assert_eq!(manager.len(), 2);
        assert_eq!(registry.registered.lock().len(), 2);

        // ya están en el pool
        assert_eq!(manager.add_nodes(candidates, 10).await, 0);
    }

    #[tokio::test]
    async fn add_nodes_stops_at_limit() {
        let addr = serve(healthy_route).await;
        let other = serve(healthy_route).await;
        let (_registry, manager) = manager(settings());
        let added = manager
            .add_nodes(
                vec![descriptor("127.0.0.1", addr.port()), descriptor("127.0.0.1", other.port())],
                1,
            )
            .await;
        assert_eq!(added, 1);
    }

    #[test]
    fn secure_candidates_come_first() {
        let mut nodes: Vec<NodeInfo> = (0..6).map(|i| info(&format!("n{i}"), 0.0, true)).collect();
        nodes[1].secure = true;
        nodes[4].secure = true;

        let ordered = NodeManager::order_candidates(nodes, &mut StdRng::seed_from_u64(3));
        assert!(ordered[0].secure && ordered[1].secure);
        assert!(ordered[2..].iter().all(|n| !n.secure));
    }

    #[test]
    fn best_node_and_failure_fallback() {
        let (_registry, manager) = manager(settings());
        {
            let mut pool = manager.nodes.write();
            for node in [info("busy", 0.9, true), info("idle", 0.1, true), info("down", 0.0, false)] {
                pool.insert(node.identifier.clone(), node);
            }
        }

        assert_eq!(manager.get_best_node().map(|n| n.identifier), Some("idle".to_string()));

        let fallback = manager.handle_node_failure("idle");
        assert_eq!(fallback.map(|n| n.identifier), Some("busy".to_string()));
        assert_eq!(manager.healthy_count(), 1);

        manager.handle_node_failure("busy");
        assert!(manager.get_best_node().is_none());
    }

    #[tokio::test]
    async fn sweep_evicts_nodes_past_threshold_and_reads_stats() {
        let addr = serve(healthy_route).await;
        let dead = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let (registry, manager) = manager(settings());
        {
            let mut pool = manager.nodes.write();
            let alive = NodeInfo::from(descriptor("127.0.0.1", addr.port()));
            let mut dying = NodeInfo::from(descriptor("127.0.0.1", dead));
            dying.health_failures = EVICT_AFTER - 1;
            dying.is_healthy = false;
            pool.insert(alive.identifier.clone(), alive);
            pool.insert(dying.identifier.clone(), dying);
        }

        let report = manager.health_sweep().await;
        assert_eq!(report.checked, 2);
        assert_eq!(report.healthy, 1);
        assert_eq!(report.evicted, vec![format!("127.0.0.1-{dead}")]);
        assert_eq!(*registry.unregistered.lock(), report.evicted);

        let best = manager.get_best_node().unwrap();
        assert_eq!(best.players, 12);
        assert!((best.load - 0.25).abs() < 1e-9);
    }

    #[tokio::test]
    async fn override_file_is_read_leniently() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nodes_override.json");
        let (_registry, manager) = manager(NodeSettings {
            override_file: Some(path.clone()),
            ..settings()
        });

        assert!(manager.load_override_nodes().is_empty());

        std::fs::write(&path, r#"[{"host": "mine.example", "port": 2333, "password": "pw"}]"#).unwrap();
        let nodes = manager.load_override_nodes();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].password.as_deref(), Some("pw"));

        std::fs::write(&path, "not json").unwrap();
        assert!(manager.load_override_nodes().is_empty());
    }

    #[tokio::test]
    async fn summary_averages_healthy_nodes() {
        let (_registry, manager) = manager(settings());
        {
            let mut pool = manager.nodes.write();
            let mut a = info("a", 0.2, true);
            a.players = 10;
            let mut b = info("b", 0.4, true);
            b.players = 30;
            pool.insert("a".into(), a);
            pool.insert("b".into(), b);
            pool.insert("c".into(), info("c", 0.9, false));
        }
        let stats = manager.summary();
        assert_eq!((stats.total, stats.healthy, stats.players), (3, 2, 40));
        assert!((stats.average_load - 0.3).abs() < 1e-9);
    }
}
