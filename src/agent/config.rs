use super::stream::StreamOptions;
use super::types::ClientInfo;
use crate::client::tls::TlsVerification;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Agent settings, read from `agent.toml` and overridden from the command line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub token: String,
    pub agent_id: String,
    pub agent_name: String,
    pub queries: BTreeMap<String, String>,
    /// Milliseconds between heartbeats
    pub heartbeat_interval: u64,
    /// Seconds allowed for TCP connect plus TLS handshake
    pub connect_timeout: u64,
    pub tls_verification: TlsVerification,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            agent_id: String::new(),
            agent_name: "monitoring-agent".to_string(),
            queries: default_queries(),
            heartbeat_interval: 40_000,
            connect_timeout: 10,
            tls_verification: TlsVerification::default(),
        }
    }
}

pub fn default_queries() -> BTreeMap<String, String> {
    [
        ("dfw", "_monitoringagent._tcp.dfw1.prod.monitoring.api.rackspacecloud.com"),
        ("ord", "_monitoringagent._tcp.ord1.prod.monitoring.api.rackspacecloud.com"),
        ("lon", "_monitoringagent._tcp.lon3.prod.monitoring.api.rackspacecloud.com"),
    ]
    .into_iter()
    .map(|(dc, query)| (dc.to_string(), query.to_string()))
    .collect()
}

impl AgentConfig {
    /// `~/.monitoring-agent/agent.toml`
    pub fn default_path() -> Option<PathBuf> {
        home::home_dir().map(|home| home.join(".monitoring-agent").join("agent.toml"))
    }

    /// Load from `path`, or from the default location if it exists.
    ///
    /// An explicit path must exist. A missing default file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match Self::default_path() {
                Some(path) if path.exists() => path,
                _ => {
                    log::debug!("[config] no config file, using defaults");
                    return Ok(Self::default());
                }
            },
        };

        let contents = std::fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))?;
        let config: AgentConfig = toml::from_str(&contents).with_context(|| format!("failed to parse {}", path.display()))?;

        log::debug!("[config] loaded {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.token.trim().is_empty() || self.agent_id.trim().is_empty() {
            bail!("Token and/or AgentId are required");
        }
        if self.queries.is_empty() {
            bail!("at least one datacenter query is required");
        }
        if self.heartbeat_interval == 0 {
            bail!("heartbeat_interval must be greater than zero");
        }
        Ok(())
    }

    pub fn client_info(&self) -> ClientInfo {
        ClientInfo::new(self.agent_id.clone(), self.agent_name.clone(), self.token.clone())
    }

    pub fn stream_options(&self) -> StreamOptions {
        StreamOptions {
            queries: self.queries.clone(),
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.queries.len(), 3);
        assert!(config.queries["lon"].starts_with("_monitoringagent._tcp.lon3"));
        assert_eq!(config.stream_options().heartbeat_interval, Duration::from_secs(40));
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.tls_verification, TlsVerification::Insecure);
    }

    #[test]
    fn test_validate_requires_credentials() {
        let mut config = AgentConfig::default();
        let err = config.validate().unwrap_err();
        assert_eq!(err.to_string(), "Token and/or AgentId are required");

        config.token = "secret".into();
        assert!(config.validate().is_err());

        config.agent_id = "agent-1".into();
        assert!(config.validate().is_ok());

        config.queries.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
token = "secret"
agent_id = "agent-1"
heartbeat_interval = 5000
tls_verification = "webpki"

[queries]
iad = "_monitoringagent._tcp.iad.example.com"
"#
        )
        .unwrap();

        let config = AgentConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.token, "secret");
        assert_eq!(config.agent_name, "monitoring-agent");
        assert_eq!(config.heartbeat_interval, 5000);
        assert_eq!(config.connect_timeout, 10);
        assert_eq!(config.tls_verification, TlsVerification::Webpki);
        assert_eq!(config.queries.keys().collect::<Vec<_>>(), vec!["iad"]);
        assert!(config.validate().is_ok());

        let info = config.client_info();
        assert_eq!(info.agent_id, "agent-1");
        assert_eq!(info.token, "secret");
    }

    #[test]
    fn test_load_missing_explicit_path_fails() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(AgentConfig::load(Some(&missing)).is_err());
    }

    #[test]
    fn test_load_rejects_bad_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "heartbeat_interval = \"often\"").unwrap();
        assert!(AgentConfig::load(Some(file.path())).is_err());
    }
}
