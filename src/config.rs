use std::fs;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;

use serde::Deserialize;

use crate::error::ConfigError;

/// Read-only configuration snapshot, shared by both roles.
///
/// Recognized keys: `password`, `method`, `timeout`, and the
/// role-dependent listen/upstream address pair.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub password: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    pub local_address: Option<String>,
    pub local_port: Option<u16>,
    pub server: Option<String>,
    pub server_port: Option<u16>,
}

fn default_method() -> String {
    "table".to_owned()
}

fn default_timeout() -> u64 {
    300
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(path.display().to_string(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::Parse(path.display().to_string(), e))
    }

    /// Resolves the address this process should listen on, given its role.
    pub fn listen_address(&self, is_local: bool) -> Result<SocketAddr, ConfigError> {
        let (host, port) = if is_local {
            let host = self
                .local_address
                .clone()
                .ok_or(ConfigError::MissingLocalAddress)?;
            let port = self.local_port.ok_or(ConfigError::MissingLocalAddress)?;
            (host, port)
        } else {
            let host = self
                .server
                .clone()
                .ok_or(ConfigError::MissingServerAddress)?;
            let port = self.server_port.ok_or(ConfigError::MissingServerAddress)?;
            (host, port)
        };
        (host.as_str(), port)
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| ConfigError::UnresolvedListenAddress(host, port))
    }

    /// Address of the remote relay a local-role instance forwards to.
    pub fn remote_relay_address(&self) -> Option<(String, u16)> {
        Some((self.server.clone()?, self.server_port?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_in_method_and_timeout() {
        let cfg: Config = toml::from_str(
            r#"
            password = "hunter2"
            local_address = "127.0.0.1"
            local_port = 1080
            server = "example.com"
            server_port = 8388
            "#,
        )
        .unwrap();
        assert_eq!(cfg.method, "table");
        assert_eq!(cfg.timeout, 300);
    }

    #[test]
    fn local_role_requires_local_address() {
        let cfg = Config {
            password: "x".into(),
            method: "table".into(),
            timeout: 300,
            local_address: None,
            local_port: None,
            server: Some("example.com".into()),
            server_port: Some(8388),
        };
        assert!(cfg.listen_address(true).is_err());
        assert!(cfg.listen_address(false).is_ok());
    }
}
