//! Known servers, the active selection, and per-server cover URL strategies.

use std::fmt;
use std::sync::Arc;

use log::{debug, info};

/// Builds the download URL for an album directory. `None` is final.
pub trait CoverUrlStrategy: Send + Sync + fmt::Debug {
    fn cover_url(&self, album_path: &str) -> Option<String>;
}

fn is_http_base(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Covers stored as a file inside each album directory, served over HTTP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpDirectory {
    pub base_url: String,
    pub file_name: String,
}

impl HttpDirectory {
    pub const DEFAULT_FILE_NAME: &'static str = "cover.jpg";

    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            file_name: Self::DEFAULT_FILE_NAME.to_string(),
        }
    }
}

impl CoverUrlStrategy for HttpDirectory {
    fn cover_url(&self, album_path: &str) -> Option<String> {
        if !is_http_base(&self.base_url) || self.file_name.is_empty() {
            return None;
        }
        let segments: Vec<String> = album_path
            .split('/')
            .filter(|segment| !segment.is_empty())
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect();
        if segments.is_empty() {
            return None;
        }
        Some(format!(
            "{}/{}/{}",
            self.base_url.trim_end_matches('/'),
            segments.join("/"),
            urlencoding::encode(&self.file_name)
        ))
    }
}

/// Covers served by an endpoint that takes the album path as a query parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryEndpoint {
    pub endpoint: String,
    pub parameter: String,
}

impl CoverUrlStrategy for QueryEndpoint {
    fn cover_url(&self, album_path: &str) -> Option<String> {
        if album_path.is_empty() || self.parameter.is_empty() || !is_http_base(&self.endpoint) {
            return None;
        }
        let separator = if self.endpoint.contains('?') { '&' } else { '?' };
        Some(format!(
            "{}{}{}={}",
            self.endpoint,
            separator,
            urlencoding::encode(&self.parameter),
            urlencoding::encode(album_path)
        ))
    }
}

/// A music server endpoint.
///
/// Two servers are the same entry when host and port match; the name and
/// credentials are presentation details.
#[derive(Debug, Clone)]
pub struct Server {
    pub name: String,
    pub hostname: String,
    pub port: u16,
    pub password: Option<String>,
    pub cover_strategy: Option<Arc<dyn CoverUrlStrategy>>,
}

impl Server {
    pub const DEFAULT_PORT: u16 = 6600;

    pub fn new(name: impl Into<String>, hostname: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            hostname: hostname.into(),
            port,
            password: None,
            cover_strategy: None,
        }
    }

    pub fn with_password(mut self, password: Option<String>) -> Self {
        self.password = password;
        self
    }

    pub fn with_cover_strategy(mut self, strategy: Arc<dyn CoverUrlStrategy>) -> Self {
        self.cover_strategy = Some(strategy);
        self
    }

    /// Cover URL for an album directory, or `None` when this server cannot serve one.
    pub fn cover_url(&self, album_path: &str) -> Option<String> {
        self.cover_strategy
            .as_ref()
            .and_then(|strategy| strategy.cover_url(album_path))
    }

    pub fn same_endpoint(&self, other: &Server) -> bool {
        self.port == other.port && self.hostname.eq_ignore_ascii_case(&other.hostname)
    }
}

impl PartialEq for Server {
    fn eq(&self, other: &Self) -> bool {
        self.same_endpoint(other)
    }
}

impl Eq for Server {}

impl fmt::Display for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}:{})", self.name, self.hostname, self.port)
    }
}

/// Configured and discovered servers plus the single active one.
#[derive(Debug, Default)]
pub struct ServerRegistry {
    configured: Vec<Server>,
    discovered: Vec<Server>,
    active: Option<Server>,
}

impl ServerRegistry {
    pub fn new(configured: Vec<Server>) -> Self {
        let mut registry = Self::default();
        for server in configured {
            if registry.contains_endpoint(&server) {
                debug!("ServerRegistry: skipping duplicate configured server {}", server);
                continue;
            }
            registry.configured.push(server);
        }
        registry
    }

    fn contains_endpoint(&self, server: &Server) -> bool {
        self.configured
            .iter()
            .chain(self.discovered.iter())
            .any(|known| known.same_endpoint(server))
    }

    /// Appends a discovered server unless its endpoint is already known.
    pub fn add_discovered(&mut self, server: Server) -> bool {
        if self.contains_endpoint(&server) {
            debug!("ServerRegistry: ignoring already known server {}", server);
            return false;
        }
        info!("ServerRegistry: discovered {}", server);
        self.discovered.push(server);
        true
    }

    /// Replaces the active server and returns the previous one.
    pub fn set_active(&mut self, server: Option<Server>) -> Option<Server> {
        match &server {
            Some(server) => info!("ServerRegistry: active server is now {}", server),
            None => info!("ServerRegistry: no active server"),
        }
        std::mem::replace(&mut self.active, server)
    }

    pub fn active_server(&self) -> Option<Server> {
        self.active.clone()
    }

    pub fn configured_servers(&self) -> Vec<Server> {
        self.configured.clone()
    }

    pub fn discovered_servers(&self) -> Vec<Server> {
        self.discovered.clone()
    }

    /// Configured servers first, then discovered ones in arrival order.
    pub fn all_servers(&self) -> Vec<Server> {
        self.configured
            .iter()
            .chain(self.discovered.iter())
            .cloned()
            .collect()
    }

    pub fn find_by_name(&self, name: &str) -> Option<Server> {
        self.configured
            .iter()
            .chain(self.discovered.iter())
            .find(|server| server.name == name)
            .cloned()
    }
}
