//! Persistent application configuration model and defaults.

use std::path::PathBuf;
use std::sync::Arc;

use crate::cover_transport::TrustPolicy;
use crate::discovery::DEFAULT_SERVICE_TYPE;
use crate::model::EntityKind;
use crate::server_registry::{CoverUrlStrategy, HttpDirectory, QueryEndpoint, Server};

/// Root configuration persisted to `config.toml`.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Config {
    #[serde(default)]
    /// Library browsing preferences.
    pub library: LibraryConfig,
    #[serde(default)]
    /// MPD connection timeouts.
    pub connection: ConnectionConfig,
    #[serde(default)]
    /// Cover art download and disk cache settings.
    pub covers: CoversConfig,
    #[serde(default)]
    /// Zero-conf server discovery.
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    /// Manually configured servers.
    pub servers: Vec<ServerConfig>,
}

/// Library browsing preferences persisted between sessions.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct LibraryConfig {
    #[serde(default)]
    pub last_entity_kind: EntityKind,
    #[serde(default = "default_true")]
    pub prefetch_albums_on_connect: bool,
    #[serde(default)]
    pub search_diacritic_sensitive: bool,
    #[serde(default)]
    pub search_case_sensitive: bool,
    /// Allows `random` to pick and play an album.
    #[serde(default = "default_true")]
    pub random_album_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_io_timeout_secs")]
    pub io_timeout_secs: u64,
}

/// Cover art cache settings.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct CoversConfig {
    /// Cache directory. Empty selects the per-user cache directory.
    #[serde(default)]
    pub cache_dir: String,
    #[serde(default = "default_download_workers")]
    pub download_workers: u32,
    #[serde(default = "default_transfer_timeout_secs")]
    pub transfer_timeout_secs: u64,
    #[serde(default = "default_max_cover_size_mb")]
    pub max_cover_size_mb: u32,
    #[serde(default)]
    pub trust_policy: TrustPolicy,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_service_type")]
    pub service_type: String,
    /// Cover base URL given to discovered servers; `{host}` is replaced with
    /// the resolved address. Empty leaves discovered servers without covers.
    #[serde(default)]
    pub cover_url_template: String,
}

/// Where a configured server's covers are downloaded from.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CoverSourceConfig {
    HttpDirectory {
        base_url: String,
        #[serde(default = "default_cover_file_name")]
        file_name: String,
    },
    QueryEndpoint {
        endpoint: String,
        parameter: String,
    },
}

impl CoverSourceConfig {
    pub fn strategy(&self) -> Arc<dyn CoverUrlStrategy> {
        match self {
            Self::HttpDirectory {
                base_url,
                file_name,
            } => Arc::new(HttpDirectory {
                base_url: base_url.clone(),
                file_name: file_name.clone(),
            }),
            Self::QueryEndpoint {
                endpoint,
                parameter,
            } => Arc::new(QueryEndpoint {
                endpoint: endpoint.clone(),
                parameter: parameter.clone(),
            }),
        }
    }
}

/// A manually configured server. Passwords live in the OS keyring.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub name: String,
    pub hostname: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
    #[serde(default)]
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub covers: Option<CoverSourceConfig>,
}

impl ServerConfig {
    pub fn to_server(&self, password: Option<String>) -> Server {
        let mut server = Server::new(self.name.clone(), self.hostname.clone(), self.port)
            .with_password(password);
        if let Some(covers) = &self.covers {
            server = server.with_cover_strategy(covers.strategy());
        }
        server
    }
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            last_entity_kind: EntityKind::default(),
            prefetch_albums_on_connect: true,
            search_diacritic_sensitive: false,
            search_case_sensitive: false,
            random_album_enabled: true,
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            io_timeout_secs: default_io_timeout_secs(),
        }
    }
}

impl Default for CoversConfig {
    fn default() -> Self {
        Self {
            cache_dir: String::new(),
            download_workers: default_download_workers(),
            transfer_timeout_secs: default_transfer_timeout_secs(),
            max_cover_size_mb: default_max_cover_size_mb(),
            trust_policy: TrustPolicy::default(),
        }
    }
}

impl CoversConfig {
    /// Resolved cache directory, or `None` when no per-user cache directory exists.
    pub fn resolved_cache_dir(&self) -> Option<PathBuf> {
        let configured = self.cache_dir.trim();
        if !configured.is_empty() {
            return Some(PathBuf::from(configured));
        }
        dirs::cache_dir().map(|dir| dir.join("mpdshelf").join("covers"))
    }

    pub fn max_cover_bytes(&self) -> u64 {
        u64::from(self.max_cover_size_mb) * 1024 * 1024
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            service_type: default_service_type(),
            cover_url_template: String::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_connect_timeout_secs() -> u64 {
    5
}

fn default_io_timeout_secs() -> u64 {
    15
}

fn default_download_workers() -> u32 {
    4
}

fn default_transfer_timeout_secs() -> u64 {
    30
}

fn default_max_cover_size_mb() -> u32 {
    20
}

fn default_service_type() -> String {
    DEFAULT_SERVICE_TYPE.to_string()
}

fn default_cover_file_name() -> String {
    HttpDirectory::DEFAULT_FILE_NAME.to_string()
}

fn default_server_port() -> u16 {
    Server::DEFAULT_PORT
}

/// Clamps numeric settings and normalizes the server list.
///
/// Servers without a host are dropped, duplicates (same host and port) keep
/// their first entry, and at most one server stays marked active.
pub fn sanitize_config(config: Config) -> Config {
    let mut servers: Vec<ServerConfig> = Vec::with_capacity(config.servers.len());
    let mut seen_active = false;
    for mut server in config.servers {
        server.hostname = server.hostname.trim().to_string();
        if server.hostname.is_empty() {
            continue;
        }
        if server.port == 0 {
            server.port = Server::DEFAULT_PORT;
        }
        if servers.iter().any(|existing| {
            existing.port == server.port && existing.hostname.eq_ignore_ascii_case(&server.hostname)
        }) {
            continue;
        }
        if server.name.trim().is_empty() {
            server.name = server.hostname.clone();
        }
        if server.active {
            server.active = !seen_active;
            seen_active = true;
        }
        servers.push(server);
    }

    let service_type = if config.discovery.service_type.trim().is_empty() {
        default_service_type()
    } else {
        config.discovery.service_type.trim().to_string()
    };

    Config {
        library: config.library,
        connection: ConnectionConfig {
            connect_timeout_secs: config.connection.connect_timeout_secs.clamp(1, 120),
            io_timeout_secs: config.connection.io_timeout_secs.clamp(1, 600),
        },
        covers: CoversConfig {
            download_workers: config.covers.download_workers.clamp(1, 16),
            transfer_timeout_secs: config.covers.transfer_timeout_secs.clamp(1, 600),
            max_cover_size_mb: config.covers.max_cover_size_mb.clamp(1, 256),
            ..config.covers
        },
        discovery: DiscoveryConfig {
            service_type,
            ..config.discovery
        },
        servers,
    }
}

#[cfg(test)]
mod tests {
    use super::{
        sanitize_config, Config, CoverSourceConfig, ServerConfig, TrustPolicy,
        DEFAULT_SERVICE_TYPE,
    };
    use crate::model::EntityKind;

    fn server(hostname: &str, port: u16, active: bool) -> ServerConfig {
        ServerConfig {
            name: String::new(),
            hostname: hostname.to_string(),
            port,
            active,
            covers: None,
        }
    }

    #[test]
    fn test_default_config_has_expected_values() {
        let config = Config::default();

        assert_eq!(config.library.last_entity_kind, EntityKind::Albums);
        assert!(config.library.prefetch_albums_on_connect);
        assert!(!config.library.search_diacritic_sensitive);
        assert!(!config.library.search_case_sensitive);
        assert!(config.library.random_album_enabled);
        assert_eq!(config.connection.connect_timeout_secs, 5);
        assert_eq!(config.connection.io_timeout_secs, 15);
        assert!(config.covers.cache_dir.is_empty());
        assert_eq!(config.covers.download_workers, 4);
        assert_eq!(config.covers.transfer_timeout_secs, 30);
        assert_eq!(config.covers.max_cover_size_mb, 20);
        assert_eq!(config.covers.trust_policy, TrustPolicy::SystemRoots);
        assert!(config.discovery.enabled);
        assert_eq!(config.discovery.service_type, DEFAULT_SERVICE_TYPE);
        assert!(config.discovery.cover_url_template.is_empty());
        assert!(config.servers.is_empty());
    }

    #[test]
    fn test_partial_config_fills_missing_sections_with_defaults() {
        let parsed: Config = toml::from_str(
            r#"
[library]
last_entity_kind = "genres"

[[servers]]
hostname = "nas.local"
"#,
        )
        .expect("config should parse");

        assert_eq!(parsed.library.last_entity_kind, EntityKind::Genres);
        assert!(parsed.library.prefetch_albums_on_connect);
        assert_eq!(parsed.covers.download_workers, 4);
        assert_eq!(parsed.servers.len(), 1);
        assert_eq!(parsed.servers[0].port, 6600);
        assert!(!parsed.servers[0].active);
        assert!(parsed.servers[0].covers.is_none());
    }

    #[test]
    fn test_server_cover_sources_parse_and_build_strategies() {
        let parsed: Config = toml::from_str(
            r#"
[[servers]]
name = "Den"
hostname = "den.local"
covers = { kind = "http_directory", base_url = "http://den.local/music" }

[[servers]]
name = "Office"
hostname = "office.local"
port = 6601
covers = { kind = "query_endpoint", endpoint = "http://office.local/art.php", parameter = "dir" }
"#,
        )
        .expect("config should parse");

        assert_eq!(
            parsed.servers[0].covers,
            Some(CoverSourceConfig::HttpDirectory {
                base_url: "http://den.local/music".to_string(),
                file_name: "cover.jpg".to_string(),
            })
        );
        let den = parsed.servers[0].to_server(Some("secret".to_string()));
        assert_eq!(den.password.as_deref(), Some("secret"));
        assert_eq!(
            den.cover_url("Abba/Gold"),
            Some("http://den.local/music/Abba/Gold/cover.jpg".to_string())
        );
        let office = parsed.servers[1].to_server(None);
        assert_eq!(office.port, 6601);
        assert_eq!(
            office.cover_url("Abba/Gold"),
            Some("http://office.local/art.php?dir=Abba%2FGold".to_string())
        );
    }

    #[test]
    fn test_sanitize_config_clamps_values_and_normalizes_servers() {
        let mut input = Config::default();
        input.covers.download_workers = 0;
        input.covers.max_cover_size_mb = 10_000;
        input.connection.io_timeout_secs = 0;
        input.discovery.service_type = "  ".to_string();
        input.servers = vec![
            server("  ", 6600, true),
            server("nas.local", 0, true),
            server("NAS.local", 0, false),
            server("den.local", 6600, true),
        ];

        let sanitized = sanitize_config(input);
        assert_eq!(sanitized.covers.download_workers, 1);
        assert_eq!(sanitized.covers.max_cover_size_mb, 256);
        assert_eq!(sanitized.connection.io_timeout_secs, 1);
        assert_eq!(sanitized.discovery.service_type, DEFAULT_SERVICE_TYPE);
        assert_eq!(sanitized.servers.len(), 2);
        assert_eq!(sanitized.servers[0].hostname, "nas.local");
        assert_eq!(sanitized.servers[0].port, 6600);
        assert_eq!(sanitized.servers[0].name, "nas.local");
        assert!(sanitized.servers[0].active);
        assert!(!sanitized.servers[1].active);
    }

    #[test]
    fn test_resolved_cache_dir_prefers_configured_value() {
        let mut config = Config::default();
        config.covers.cache_dir = "/tmp/mpdshelf-covers".to_string();
        assert_eq!(
            config.covers.resolved_cache_dir(),
            Some(std::path::PathBuf::from("/tmp/mpdshelf-covers"))
        );
        assert_eq!(config.covers.max_cover_bytes(), 20 * 1024 * 1024);
    }

    #[test]
    fn test_system_config_template_matches_default_values() {
        let parsed: Config = toml::from_str(include_str!("../config/config.system.toml"))
            .expect("system config template should parse");
        assert_eq!(parsed, Config::default());
    }
}
