use anyhow::{Context, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Public node discovery endpoints, in priority order.
pub const DEFAULT_NODE_LIST_URLS: [&str; 3] = [
    "https://lavalink-list.ajieblogs.eu.org/SSL",
    "https://lavalink-list.ajieblogs.eu.org/All",
    "https://lavalink-list.ajieblogs.eu.org/NonSSL",
];

pub const DEFAULT_LAVALINK_PASSWORD: &str = "youshallnotpass";

/// Upper bound accepted by the audio node for player volume.
pub const MAX_VOLUME: u16 = 1000;

#[derive(Debug, Clone)]
pub struct Config {
    // Discord
    pub discord_token: String,
    pub application_id: u64,
    pub guild_id: Option<u64>, // Para comandos de desarrollo

    // Paths
    pub data_dir: PathBuf,
    pub queue_file: PathBuf,
    pub nodes_override_file: PathBuf,

    // Nodo fijo opcional
    pub lavalink_host: Option<String>,
    pub lavalink_port: u16,
    pub lavalink_password: String,
    pub lavalink_secure: bool,

    // Descubrimiento y salud de nodos
    pub node_list_urls: Vec<String>,
    pub node_versions: Vec<String>,
    pub max_nodes: usize,
    pub min_healthy_nodes: usize,
    pub node_health_interval: u64, // segundos
    pub node_refresh_interval: u64,
    pub health_timeout: u64,
    pub fetch_timeout: u64,
    pub resolve_timeout: u64,

    // Reintentos
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,

    // Reproducción
    pub search_prefixes: Vec<String>,
    pub default_volume: u16,
    pub max_queue_size: usize,
    pub max_playlist_size: usize,
    pub max_auto_advance: u32,
    pub idle_timeout: u64,
    pub default_eq_preset: String,

    // Caché
    pub cache_size: usize,
    pub cache_ttl: u64,
}

/// Reads `key` from the environment, falling back to `default` when unset or blank.
fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(val) if !val.trim().is_empty() => val
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {key}: {val}")),
        _ => Ok(default),
    }
}

fn env_list(key: &str, default: &[&str]) -> Vec<String> {
    match std::env::var(key) {
        Ok(val) if !val.trim().is_empty() => val
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        _ => default.iter().map(|s| s.to_string()).collect(),
    }
}

impl Config {
    /// Loads configuration from `.env` and the process environment.
    ///
    /// Creates the data directory and validates the result before returning,
    /// so callers can rely on every path and limit being usable.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self::from_env()?;

        // Create directories if they don't exist
        std::fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("cannot create {}", config.data_dir.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Builds a configuration from environment variables only.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let data_dir: PathBuf = env_or("DATA_DIR", defaults.data_dir.clone())?;
        let queue_file = std::env::var("QUEUE_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("queue_data.json"));
        let nodes_override_file = std::env::var("NODES_OVERRIDE_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("nodes_override.json"));

        Ok(Self {
            discord_token: std::env::var("DISCORD_TOKEN").context("DISCORD_TOKEN is not set")?,
            application_id: std::env::var("APPLICATION_ID")
                .context("APPLICATION_ID is not set")?
                .parse()?,
            guild_id: std::env::var("GUILD_ID").ok().and_then(|s| s.parse().ok()),

            data_dir,
            queue_file,
            nodes_override_file,

            lavalink_host: std::env::var("LAVALINK_HOST")
                .ok()
                .filter(|h| !h.trim().is_empty()),
            lavalink_port: env_or("LAVALINK_PORT", defaults.lavalink_port)?,
            lavalink_password: std::env::var("LAVALINK_PASSWORD")
                .unwrap_or_else(|_| DEFAULT_LAVALINK_PASSWORD.to_string()),
            lavalink_secure: env_or("LAVALINK_SECURE", defaults.lavalink_secure)?,

            node_list_urls: env_list("NODE_LIST_URLS", &DEFAULT_NODE_LIST_URLS),
            node_versions: env_list("NODE_VERSIONS", &["v4"])
                .into_iter()
                .map(|v| v.to_lowercase())
                .collect(),
            max_nodes: env_or("MAX_NODES", defaults.max_nodes)?,
            min_healthy_nodes: env_or("MIN_HEALTHY_NODES", defaults.min_healthy_nodes)?,
            node_health_interval: env_or("NODE_HEALTH_INTERVAL", defaults.node_health_interval)?,
            node_refresh_interval: env_or("NODE_REFRESH_INTERVAL", defaults.node_refresh_interval)?,
            health_timeout: env_or("HEALTH_TIMEOUT", defaults.health_timeout)?,
            fetch_timeout: env_or("FETCH_TIMEOUT", defaults.fetch_timeout)?,
            resolve_timeout: env_or("RESOLVE_TIMEOUT", defaults.resolve_timeout)?,

            retry_attempts: env_or("RETRY_ATTEMPTS", defaults.retry_attempts)?,
            retry_base_delay_ms: env_or("RETRY_BASE_DELAY_MS", defaults.retry_base_delay_ms)?,

            search_prefixes: env_list("SEARCH_PREFIXES", &["ytmsearch", "ytsearch", "scsearch"]),
            default_volume: env_or("DEFAULT_VOLUME", defaults.default_volume)?,
            max_queue_size: env_or("MAX_QUEUE_SIZE", defaults.max_queue_size)?,
            max_playlist_size: env_or("MAX_PLAYLIST_SIZE", defaults.max_playlist_size)?,
            max_auto_advance: env_or("MAX_AUTO_ADVANCE", defaults.max_auto_advance)?,
            idle_timeout: env_or("IDLE_TIMEOUT", defaults.idle_timeout)?,
            default_eq_preset: env_or("DEFAULT_EQ_PRESET", defaults.default_eq_preset)?,

            cache_size: env_or("CACHE_SIZE", defaults.cache_size)?,
            cache_ttl: env_or("CACHE_TTL", defaults.cache_ttl)?,
        })
    }

    /// Validates configuration values for correctness.
    ///
    /// # Validation Rules
    ///
    /// - Volume must be between 0 and 1000
    /// - At least one node source must exist (discovery list, override file or pinned node)
    /// - Pool, cache and queue sizes must be greater than 0
    /// - Every timeout and interval must be greater than 0
    /// - The equalizer preset must be a known one
    ///
    /// # Returns
    ///
    /// - `Ok(())`: All values are valid
    /// - `Err(anyhow::Error)`: Invalid configuration detected
    pub fn validate(&self) -> Result<()> {
        if self.default_volume > MAX_VOLUME {
            anyhow::bail!(
                "Default volume must be between 0 and {}, got: {}",
                MAX_VOLUME,
                self.default_volume
            );
        }

        if self.max_nodes == 0 {
            anyhow::bail!("Max nodes must be greater than 0");
        }

        if self.max_queue_size == 0 || self.max_playlist_size == 0 {
            anyhow::bail!("Queue and playlist limits must be greater than 0");
        }

        if self.cache_size == 0 {
            anyhow::bail!("Cache size must be greater than 0");
        }

        if self.search_prefixes.is_empty() {
            anyhow::bail!("At least one search prefix is required");
        }

        for (name, value) in [
            ("NODE_HEALTH_INTERVAL", self.node_health_interval),
            ("NODE_REFRESH_INTERVAL", self.node_refresh_interval),
            ("HEALTH_TIMEOUT", self.health_timeout),
            ("FETCH_TIMEOUT", self.fetch_timeout),
            ("RESOLVE_TIMEOUT", self.resolve_timeout),
            ("IDLE_TIMEOUT", self.idle_timeout),
        ] {
            if value == 0 {
                anyhow::bail!("{name} must be greater than 0");
            }
        }

        if self.retry_attempts == 0 {
            anyhow::bail!("Retry attempts must be at least 1");
        }

        if crate::audio::equalizer::EqPreset::from_name(&self.default_eq_preset).is_none() {
            anyhow::bail!("Unknown equalizer preset: {}", self.default_eq_preset);
        }

        Ok(())
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout)
    }

    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_secs(self.resolve_timeout)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout)
    }

    /// Returns a summary of the current configuration for logging.
    ///
    /// Never includes the bot token or node passwords.
    pub fn summary(&self) -> String {
        format!(
            "Config Summary:\n  \
            Discord: App ID {} (Guild: {})\n  \
            Storage: {}\n  \
            Nodes: max {}, min healthy {}, health every {}, refresh every {}\n  \
            Pinned node: {}\n  \
            Playback: {}% vol, {} queue, {} playlist, idle {}, EQ {}\n  \
            Search: {}",
            self.application_id,
            self.guild_id.map_or("global".to_string(), |id| id.to_string()),
            self.queue_file.display(),
            self.max_nodes,
            self.min_healthy_nodes,
            humantime::format_duration(Duration::from_secs(self.node_health_interval)),
            humantime::format_duration(Duration::from_secs(self.node_refresh_interval)),
            self.lavalink_host
                .as_ref()
                .map_or("none".to_string(), |h| format!("{}:{}", h, self.lavalink_port)),
            self.default_volume,
            self.max_queue_size,
            self.max_playlist_size,
            humantime::format_duration(self.idle_timeout()),
            self.default_eq_preset,
            self.search_prefixes.join(" → "),
        )
    }
}

/// Default configuration values.
///
/// Used as fallbacks when environment variables are not provided.
impl Default for Config {
    fn default() -> Self {
        let data_dir = PathBuf::from("./data");
        Self {
            // Discord (no defaults - must be provided)
            discord_token: String::new(),
            application_id: 0,
            guild_id: None,

            queue_file: data_dir.join("queue_data.json"),
            nodes_override_file: data_dir.join("nodes_override.json"),
            data_dir,

            lavalink_host: None,
            lavalink_port: 2333,
            lavalink_password: DEFAULT_LAVALINK_PASSWORD.to_string(),
            lavalink_secure: false,

            node_list_urls: DEFAULT_NODE_LIST_URLS.iter().map(|s| s.to_string()).collect(),
            node_versions: vec!["v4".to_string()],
            max_nodes: 10,
            min_healthy_nodes: 3,
            node_health_interval: 300, // 5 minutos
            node_refresh_interval: 600, // 10 minutos
            health_timeout: 10,
            fetch_timeout: 15,
            resolve_timeout: 10,

            retry_attempts: 3,
            retry_base_delay_ms: 500,

            search_prefixes: vec![
                "ytmsearch".to_string(),
                "ytsearch".to_string(),
                "scsearch".to_string(),
            ],
            default_volume: 70,
            max_queue_size: 1000,
            max_playlist_size: 500,
            max_auto_advance: 3,
            idle_timeout: 600, // 10 minutos
            default_eq_preset: "bass-boost".to_string(),

            cache_size: 256,
            cache_ttl: 3600,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.default_volume, 70);
        assert_eq!(config.node_list_urls.len(), 3);
        assert!(config.node_list_urls[0].ends_with("/SSL"));
    }

    #[test]
    fn rejects_out_of_range_volume() {
        let config = Config {
            default_volume: 1001,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unknown_preset_and_zero_timeouts() {
        let config = Config {
            default_eq_preset: "loudness-war".to_string(),
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            idle_timeout: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn summary_hides_secrets() {
        let config = Config {
            discord_token: "super-secret-token".to_string(),
            lavalink_host: Some("lava.local".to_string()),
            lavalink_password: "hunter2".to_string(),
            ..Config::default()
        };
        let summary = config.summary();
        assert!(!summary.contains("super-secret-token"));
        assert!(!summary.contains("hunter2"));
        assert!(summary.contains("lava.local:2333"));
    }
}
