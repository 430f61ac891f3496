use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:50051";

/// How long terminated jobs stay queryable before the registry reaps them.
const DEFAULT_JOB_TTL_SECS: u64 = 300;

/// Server configuration, loadable from a TOML file (`serve --config`).
/// Every key is optional; CLI flags override file values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Address to listen on.
    pub listen_addr: String,
    /// Server certificate (PEM).
    pub cert: PathBuf,
    /// Server private key (PEM).
    pub key: PathBuf,
    /// CA certificate clients must be signed by (PEM).
    pub ca: PathBuf,
    /// Retention of terminated jobs, in seconds.
    pub job_ttl_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            cert: PathBuf::from("certs/server.pem"),
            key: PathBuf::from("certs/server.key"),
            ca: PathBuf::from("certs/ca.pem"),
            job_ttl_secs: DEFAULT_JOB_TTL_SECS,
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    pub fn job_ttl(&self) -> Duration {
        Duration::from_secs(self.job_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let config = ServerConfig::default();
        assert_eq!(config.listen_addr, "0.0.0.0:50051");
        assert_eq!(config.job_ttl(), Duration::from_secs(300));
        assert_eq!(config.cert, PathBuf::from("certs/server.pem"));
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobworker.toml");
        std::fs::write(&path, "listen_addr = \"127.0.0.1:9000\"\njob_ttl_secs = 60\n")
            .unwrap();

        let config = ServerConfig::load(&path).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:9000");
        assert_eq!(config.job_ttl(), Duration::from_secs(60));
        assert_eq!(config.ca, PathBuf::from("certs/ca.pem"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobworker.toml");
        std::fs::write(&path, "listen_adr = \"typo\"\n").unwrap();

        assert!(ServerConfig::load(&path).is_err());
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(ServerConfig::load(Path::new("/nonexistent/jobworker.toml")).is_err());
    }
}
