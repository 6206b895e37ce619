use hyper::Uri;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener and forwarding settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Process manager settings
    #[serde(default)]
    pub manager: ManagerConfig,

    /// Initial app list (replaceable at runtime through `/api/config`)
    #[serde(default)]
    pub apps: Vec<AppDescriptor>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Gateway port (default: 11994)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Query parameter that selects the app (default: "app")
    #[serde(default = "default_selector_param")]
    pub selector_param: String,

    /// Max time to wait for a backend response in seconds (default: 30)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Maximum idle connections per backend host (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Largest response body buffered for ETag computation (default: 64 MiB)
    #[serde(default = "default_max_buffered_body_bytes")]
    pub max_buffered_body_bytes: usize,
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            selector_param: default_selector_param(),
            request_timeout_secs: default_request_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            max_buffered_body_bytes: default_max_buffered_body_bytes(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ManagerConfig {
    /// Capacity of the switch job queue (default: 100)
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Grace period in seconds between the soft signal and the hard kill
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,

    /// Number of readiness windows before a switch is declared failed
    #[serde(default = "default_readiness_attempts")]
    pub readiness_attempts: u32,

    /// Length of one readiness window in seconds
    #[serde(default = "default_readiness_timeout")]
    pub readiness_timeout_secs: u64,

    /// Delay between readiness requests in milliseconds
    #[serde(default = "default_readiness_interval")]
    pub readiness_interval_ms: u64,

    /// Path requested on the backend while waiting for readiness
    #[serde(default = "default_readiness_path")]
    pub readiness_path: String,
}

impl ManagerConfig {
    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
            readiness_attempts: default_readiness_attempts(),
            readiness_timeout_secs: default_readiness_timeout(),
            readiness_interval_ms: default_readiness_interval(),
            readiness_path: default_readiness_path(),
        }
    }
}

/// A named backend app
///
/// # Security Warning
///
/// `entrypoint` is run through the system shell. Anyone who can write the
/// configuration file or reach `/api/config` can execute arbitrary commands
/// with the permissions of the gateway process.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct AppDescriptor {
    /// Unique app name, matched against the selector query parameter
    pub name: String,

    /// Base URL of the backend, e.g. `http://127.0.0.1:3000`
    pub url: String,

    /// Shell command line that starts the backend
    #[serde(alias = "command")]
    pub entrypoint: String,
}

impl AppDescriptor {
    pub fn new(name: &str, url: &str, entrypoint: &str) -> Self {
        Self {
            name: name.to_string(),
            url: url.to_string(),
            entrypoint: entrypoint.to_string(),
        }
    }

    /// Parse the base URL
    pub fn base_uri(&self) -> Result<Uri, String> {
        let uri: Uri = self
            .url
            .parse()
            .map_err(|e| format!("app '{}': invalid url '{}': {}", self.name, self.url, e))?;

        if uri.scheme_str() != Some("http") {
            return Err(format!("app '{}': url must use http://", self.name));
        }
        if uri.authority().is_none() {
            return Err(format!("app '{}': url has no host", self.name));
        }

        Ok(uri)
    }

    /// `host:port` of the backend, used for readiness polling and tunnels
    pub fn host(&self) -> Result<String, String> {
        let uri = self.base_uri()?;
        let authority = uri
            .authority()
            .ok_or_else(|| format!("app '{}': url has no host", self.name))?;

        Ok(match authority.port_u16() {
            Some(_) => authority.as_str().to_string(),
            None => format!("{}:80", authority.host()),
        })
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("app name must not be empty".to_string());
        }
        if self.entrypoint.trim().is_empty() {
            return Err(format!("app '{}': entrypoint must not be empty", self.name));
        }
        self.base_uri().map(|_| ())
    }
}

/// The replaceable app list, as exchanged on `/api/config`
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq, Eq)]
pub struct AppsDocument {
    #[serde(default)]
    pub apps: Vec<AppDescriptor>,
}

impl AppsDocument {
    pub fn validate(&self) -> Result<(), String> {
        let mut seen = HashSet::new();
        for app in &self.apps {
            app.validate()?;
            if !seen.insert(app.name.as_str()) {
                return Err(format!("duplicate app name '{}'", app.name));
            }
        }
        Ok(())
    }

    pub fn find(&self, name: &str) -> Option<&AppDescriptor> {
        self.apps.iter().find(|app| app.name == name)
    }
}

/// Shared app list, read on every request and replaced wholesale on update
#[derive(Debug, Clone, Default)]
pub struct AppStore {
    inner: Arc<RwLock<AppsDocument>>,
}

impl AppStore {
    pub fn new(doc: AppsDocument) -> Self {
        Self {
            inner: Arc::new(RwLock::new(doc)),
        }
    }

    /// Copy of the current document
    pub fn snapshot(&self) -> AppsDocument {
        self.inner.read().clone()
    }

    pub fn find(&self, name: &str) -> Option<AppDescriptor> {
        self.inner.read().find(name).cloned()
    }

    pub fn replace(&self, doc: AppsDocument) {
        *self.inner.write() = doc;
    }

    pub fn len(&self) -> usize {
        self.inner.read().apps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    11994
}

fn default_selector_param() -> String {
    "app".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_max_buffered_body_bytes() -> usize {
    64 * 1024 * 1024
}

fn default_queue_capacity() -> usize {
    100
}

fn default_shutdown_grace_period() -> u64 {
    30
}

fn default_readiness_attempts() -> u32 {
    1
}

fn default_readiness_timeout() -> u64 {
    50
}

fn default_readiness_interval() -> u64 {
    1000
}

fn default_readiness_path() -> String {
    "/".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.selector_param.is_empty() {
            anyhow::bail!("server.selector_param must not be empty");
        }
        if self.server.request_timeout_secs == 0 {
            anyhow::bail!("server.request_timeout_secs must be at least 1");
        }
        if self.manager.queue_capacity == 0 {
            anyhow::bail!("manager.queue_capacity must be at least 1");
        }
        if self.manager.readiness_attempts == 0 {
            anyhow::bail!("manager.readiness_attempts must be at least 1");
        }
        if self.manager.readiness_timeout_secs == 0 {
            anyhow::bail!("manager.readiness_timeout_secs must be at least 1");
        }
        if self.manager.readiness_interval_ms == 0 {
            anyhow::bail!("manager.readiness_interval_ms must be at least 1");
        }
        if !self.manager.readiness_path.starts_with('/') {
            anyhow::bail!("manager.readiness_path must start with '/'");
        }
        self.apps_document()
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid app list: {}", e))
    }

    pub fn apps_document(&self) -> AppsDocument {
        AppsDocument {
            apps: self.apps.clone(),
        }
    }
}
