//! Server configuration

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ProxyError, Result};

/// Default path of the listening socket
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/nfp-cpp-proxy.sock";

/// Default capacity of the connection table (listener excluded)
pub const DEFAULT_MAX_CONNECTIONS: usize = 32;

/// Default listen backlog
pub const DEFAULT_LISTEN_BACKLOG: i32 = 5;

/// Default upper bound on a single READ/WRITE payload (16MB)
pub const DEFAULT_MAX_TRANSFER: u64 = 16 * 1024 * 1024;

/// Fallback page size when sysconf cannot report one
pub const FALLBACK_PAGE_SIZE: u64 = 4096;

/// System page size as reported by `sysconf(_SC_PAGESIZE)`
pub fn system_page_size() -> u64 {
    match nix::unistd::sysconf(nix::unistd::SysconfVar::PAGE_SIZE) {
        Ok(Some(size)) if size > 0 => size as u64,
        _ => FALLBACK_PAGE_SIZE,
    }
}

/// Configuration for a proxy server instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Filesystem path of the Unix domain socket
    pub socket_path: PathBuf,
    /// Maximum number of simultaneously connected clients
    pub max_connections: usize,
    /// Backlog passed to listen(2)
    pub listen_backlog: i32,
    /// Granularity of area offsets and sizes
    pub page_size: u64,
    /// Largest byte count accepted by one READ or WRITE
    pub max_transfer: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            listen_backlog: DEFAULT_LISTEN_BACKLOG,
            page_size: system_page_size(),
            max_transfer: DEFAULT_MAX_TRANSFER,
        }
    }
}

impl ProxyConfig {
    /// Create a configuration listening on `socket_path`
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            ..Default::default()
        }
    }

    /// Load a configuration from a JSON file; missing fields take defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::from_io(e, &format!("Failed to read config {}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Set the socket path
    pub fn with_socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.socket_path = path.into();
        self
    }

    /// Set the connection table capacity
    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// Set the listen backlog
    pub fn with_listen_backlog(mut self, backlog: i32) -> Self {
        self.listen_backlog = backlog;
        self
    }

    /// Set the page size used for area alignment
    pub fn with_page_size(mut self, page_size: u64) -> Self {
        self.page_size = page_size;
        self
    }

    /// Set the largest accepted transfer
    pub fn with_max_transfer(mut self, max_transfer: u64) -> Self {
        self.max_transfer = max_transfer;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.socket_path.as_os_str().is_empty() {
            return Err(ProxyError::invalid_parameter(
                "socket_path",
                "Socket path cannot be empty",
            ));
        }

        if self.max_connections == 0 {
            return Err(ProxyError::invalid_parameter(
                "max_connections",
                "At least one client connection must be allowed",
            ));
        }

        if self.listen_backlog <= 0 {
            return Err(ProxyError::invalid_parameter(
                "listen_backlog",
                "Listen backlog must be positive",
            ));
        }

        if self.page_size == 0 || !self.page_size.is_power_of_two() {
            return Err(ProxyError::invalid_parameter(
                "page_size",
                format!("Page size {} is not a power of two", self.page_size),
            ));
        }

        if self.max_transfer == 0 {
            return Err(ProxyError::invalid_parameter(
                "max_transfer",
                "Maximum transfer must be greater than 0",
            ));
        }

        Ok(())
    }
}
