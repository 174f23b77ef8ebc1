use serde::Deserialize;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// Upper bound accepted for `server.max_redirects`
const MAX_REDIRECT_LIMIT: usize = 50;

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Listener and forwarding settings
    #[serde(default)]
    pub server: ServerConfig,

    /// The single backend this proxy fronts
    pub backend: BackendConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Listen port (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Max time in seconds for the whole backend exchange, redirects included
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Maximum number of backend redirects followed per request (default: 10)
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,

    /// Largest inbound request body accepted, in bytes (default: 10 MiB)
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// Maximum idle connections kept to the backend (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl ServerConfig {
    /// Listener socket address built from `bind` and `port`
    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        let ip: IpAddr = self
            .bind
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid bind address '{}': {}", self.bind, e))?;
        Ok(SocketAddr::new(ip, self.port))
    }

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
            request_timeout_secs: default_request_timeout(),
            max_redirects: default_max_redirects(),
            max_body_bytes: default_max_body_bytes(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

/// How to launch the backend and where to reach it
///
/// # Security Warning
///
/// `command` and `args` are executed directly with the permissions of the
/// proxy process. Configuration files must be readable and writable only by
/// the service user.
#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    /// Executable to start the backend
    pub command: String,

    /// Arguments passed to the command (settings/profile flags included)
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory for the command
    pub working_dir: Option<String>,

    /// Extra environment variables for the backend
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Host the backend listens on (default: 127.0.0.1)
    #[serde(default = "default_backend_host")]
    pub host: String,

    /// Port the backend listens on (default: 8000)
    #[serde(default = "default_backend_port")]
    pub port: u16,

    /// Append backend stdout/stderr to this file instead of discarding it
    pub log_file: Option<String>,

    /// After launching, wait up to this long for the backend port to accept
    /// connections before forwarding. 0 forwards immediately.
    #[serde(default)]
    pub ready_timeout_ms: u64,

    /// Minimum delay between a failed or exited launch and the next attempt
    #[serde(default = "default_respawn_backoff")]
    pub respawn_backoff_ms: u64,
}

impl BackendConfig {
    /// Create a backend config with defaults for everything but the command
    pub fn new(command: &str, port: u16) -> Self {
        Self {
            command: command.to_string(),
            args: Vec::new(),
            working_dir: None,
            env: HashMap::new(),
            host: default_backend_host(),
            port,
            log_file: None,
            ready_timeout_ms: 0,
            respawn_backoff_ms: default_respawn_backoff(),
        }
    }

    /// Set arguments for this backend config (builder pattern)
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Set working directory (builder pattern)
    pub fn with_working_dir(mut self, dir: &str) -> Self {
        self.working_dir = Some(dir.to_string());
        self
    }

    /// `host:port` used as the outbound `Host` header
    pub fn authority(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// `http://host:port`, without trailing slash
    pub fn base_url(&self) -> String {
        format!("http://{}", self.authority())
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn respawn_backoff(&self) -> Duration {
        Duration::from_millis(self.respawn_backoff_ms)
    }

    /// Validate the backend configuration
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.command.trim().is_empty() {
            errors.push("backend: 'command' must not be empty".to_string());
        }
        if self.host.trim().is_empty() {
            errors.push("backend: 'host' must not be empty".to_string());
        }
        if self.port == 0 {
            errors.push("backend: 'port' must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

// Default value functions
fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    8080
}

fn default_request_timeout() -> u64 {
    30 // 30 seconds max for backend to respond
}

fn default_max_redirects() -> usize {
    10
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_backend_host() -> String {
    "127.0.0.1".to_string()
}

fn default_backend_port() -> u16 {
    8000
}

fn default_respawn_backoff() -> u64 {
    0 // relaunch on the very next request
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if let Err(backend_errors) = self.backend.validate() {
            errors.extend(backend_errors);
        }

        if self.server.bind.parse::<IpAddr>().is_err() {
            errors.push(format!("server: 'bind' is not an IP address: {}", self.server.bind));
        }

        if self.server.request_timeout_secs == 0 {
            errors.push("server: 'request_timeout_secs' must be greater than 0".to_string());
        }

        if self.server.max_redirects > MAX_REDIRECT_LIMIT {
            errors.push(format!(
                "server: 'max_redirects' must be at most {}",
                MAX_REDIRECT_LIMIT
            ));
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
