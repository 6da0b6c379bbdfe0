// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use meshsig_net::{
    ConnectivityConfig, Multiaddr, NodeConfig, QuorumPolicy, RetryPolicy, SessionConfig,
};

use crate::error::{CliError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        };
        f.write_str(s)
    }
}

fn deserialize_path<'de, D>(deserializer: D) -> std::result::Result<Option<PathBuf>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer)
        .map(|opt| opt.map(|s| PathBuf::from(shellexpand::tilde(&s).as_ref())))
}

fn parse_multiaddr<E: serde::de::Error>(s: &str) -> std::result::Result<Multiaddr, E> {
    Multiaddr::parse(s).map_err(|e| E::custom(format!("Invalid multiaddr '{s}': {e}")))
}

fn deserialize_multiaddrs<'de, D>(deserializer: D) -> std::result::Result<Vec<Multiaddr>, D::Error>
where
    D: Deserializer<'de>,
{
    Vec::<String>::deserialize(deserializer)?
        .iter()
        .map(|s| parse_multiaddr(s))
        .collect()
}

fn deserialize_relay_addrs<'de, D>(deserializer: D) -> std::result::Result<Vec<Multiaddr>, D::Error>
where
    D: Deserializer<'de>,
{
    let addrs = deserialize_multiaddrs(deserializer)?;
    if let Some(addr) = addrs.iter().find(|a| !a.is_circuit_relay()) {
        return Err(serde::de::Error::custom(format!(
            "Invalid relay address: '{}'. Must contain /p2p-circuit",
            addr.as_str()
        )));
    }
    Ok(addrs)
}

fn deserialize_opt_multiaddr<'de, D>(deserializer: D) -> std::result::Result<Option<Multiaddr>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer)?
        .map(|s| parse_multiaddr(&s))
        .transpose()
}

fn deserialize_nonzero<'de, D, T>(deserializer: D) -> std::result::Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default + PartialEq,
{
    let opt = Option::<T>::deserialize(deserializer)?;
    if opt == Some(T::default()) {
        return Err(serde::de::Error::custom("value must be greater than 0"));
    }
    Ok(opt)
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default, deserialize_with = "deserialize_path")]
    pub cache_path: Option<PathBuf>,
    #[serde(default)]
    pub log_level: LogLevel,
    #[serde(default, deserialize_with = "deserialize_multiaddrs")]
    pub dialable_addrs: Vec<Multiaddr>,
    #[serde(default, deserialize_with = "deserialize_relay_addrs")]
    pub relay_addrs: Vec<Multiaddr>,
    #[serde(default, deserialize_with = "deserialize_opt_multiaddr")]
    pub webrtc_addr: Option<Multiaddr>,
    #[serde(default, deserialize_with = "deserialize_nonzero")]
    pub advertisement_ttl_secs: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_nonzero")]
    pub connect_timeout_secs: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_nonzero")]
    pub max_attempts: Option<u32>,
    #[serde(default, deserialize_with = "deserialize_nonzero")]
    pub base_delay_ms: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_nonzero")]
    pub session_ttl_secs: Option<u64>,
    #[serde(default)]
    pub allow_partial_connectivity: bool,
    #[serde(default, deserialize_with = "deserialize_nonzero")]
    pub min_connected_participants: Option<usize>,
}

impl Config {
    /// Load `path`, or the default location. A missing default file yields
    /// the defaults; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => {
                let path = Self::default_path()?;
                if path.exists() {
                    Self::from_file(&path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        const MAX_CONFIG_SIZE: u64 = 1024 * 1024;
        let metadata = std::fs::metadata(path).map_err(|e| {
            CliError::Config(format!("Failed to read {}: {e}", path.display()))
        })?;
        if metadata.len() > MAX_CONFIG_SIZE {
            return Err(CliError::Config("Config file too large".into()));
        }
        let content = std::fs::read_to_string(path).map_err(|e| {
            CliError::Config(format!("Failed to read {}: {e}", path.display()))
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| CliError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !self.allow_partial_connectivity && self.min_connected_participants.is_some() {
            return Err(CliError::Config(
                "min_connected_participants requires allow_partial_connectivity = true".into(),
            ));
        }
        if self.min_connected_participants == Some(1) {
            return Err(CliError::Config(
                "min_connected_participants must be at least 2".into(),
            ));
        }
        Ok(())
    }

    pub fn default_path() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|p| p.join("meshsig").join("config.toml"))
            .ok_or(CliError::HomeNotFound)
    }

    pub fn cache_path(&self) -> Result<PathBuf> {
        match &self.cache_path {
            Some(p) => Ok(p.clone()),
            None => dirs::data_dir()
                .map(|p| p.join("meshsig").join("discovery.redb"))
                .ok_or(CliError::HomeNotFound),
        }
    }

    pub fn connectivity(&self) -> ConnectivityConfig {
        let config = ConnectivityConfig::default();
        match self.connect_timeout_secs {
            Some(secs) => config.with_step_timeout(Duration::from_secs(secs)),
            None => config,
        }
    }

    pub fn retry(&self) -> RetryPolicy {
        let mut retry = RetryPolicy::default();
        if let Some(attempts) = self.max_attempts {
            retry = retry.with_max_attempts(attempts);
        }
        if let Some(ms) = self.base_delay_ms {
            retry = retry.with_base_delay(Duration::from_millis(ms));
        }
        retry
    }

    pub fn quorum(&self) -> QuorumPolicy {
        let quorum = QuorumPolicy::default().with_allow_partial_connectivity(self.allow_partial_connectivity);
        match self.min_connected_participants {
            Some(min) => quorum.with_min_connected_participants(min),
            None => quorum,
        }
    }

    pub fn session(&self) -> SessionConfig {
        let session = SessionConfig::default();
        match self.session_ttl_secs {
            Some(secs) => session.with_session_ttl(Duration::from_secs(secs)),
            None => session,
        }
    }

    pub fn node(&self) -> NodeConfig {
        let mut node = NodeConfig::default()
            .with_multiaddrs(self.dialable_addrs.clone())
            .with_relay_addrs(self.relay_addrs.clone())
            .with_webrtc_addr(self.webrtc_addr.clone())
            .with_connectivity(self.connectivity())
            .with_retry(self.retry())
            .with_quorum(self.quorum())
            .with_session(self.session());
        if let Some(secs) = self.advertisement_ttl_secs {
            node = node.with_advertisement_ttl(Duration::from_secs(secs));
        }
        node
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let content = r#"
cache_path = "~/.meshsig/discovery.redb"
log_level = "debug"
dialable_addrs = ["/ip4/192.0.2.1/tcp/4001/p2p/peer-a"]
relay_addrs = ["/dns4/relay.example/tcp/443/wss/p2p/relay/p2p-circuit/p2p/peer-a"]
webrtc_addr = "/ip4/192.0.2.1/udp/9090/webrtc-direct/p2p/peer-a"
advertisement_ttl_secs = 600
connect_timeout_secs = 5
max_attempts = 4
base_delay_ms = 250
session_ttl_secs = 120
allow_partial_connectivity = true
min_connected_participants = 3
"#;
        let config = Config::parse(content).unwrap();
        assert!(config.cache_path.is_some());
        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.dialable_addrs.len(), 1);
        assert_eq!(config.relay_addrs.len(), 1);
        assert!(config.webrtc_addr.is_some());

        assert_eq!(config.connectivity().step_timeout, Duration::from_secs(5));
        let retry = config.retry();
        assert_eq!(retry.max_attempts, 4);
        assert_eq!(retry.base_delay, Duration::from_millis(250));
        let quorum = config.quorum();
        assert!(quorum.allow_partial_connectivity);
        assert_eq!(quorum.min_connected_participants, 3);
        assert_eq!(config.session().session_ttl, Duration::from_secs(120));

        let node = config.node();
        assert_eq!(node.advertisement_ttl, Duration::from_secs(600));
        assert_eq!(node.multiaddrs, config.dialable_addrs);
        assert_eq!(node.retry, retry);
    }

    #[test]
    fn test_parse_empty_config() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.log_level, LogLevel::Info);
        assert!(config.relay_addrs.is_empty());
        assert!(!config.quorum().allow_partial_connectivity);
        assert_eq!(config.retry(), RetryPolicy::default());
    }

    #[test]
    fn test_invalid_multiaddr_rejected() {
        assert!(Config::parse(r#"dialable_addrs = ["ip4/1.2.3.4"]"#).is_err());
        assert!(Config::parse(r#"webrtc_addr = "/ip4//udp""#).is_err());
    }

    #[test]
    fn test_relay_addr_must_be_circuit() {
        let result = Config::parse(r#"relay_addrs = ["/ip4/192.0.2.1/tcp/4001"]"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(Config::parse(r#"relays = ["wss://relay.example"]"#).is_err());
    }

    #[test]
    fn test_zero_values_rejected() {
        for field in [
            "connect_timeout_secs",
            "advertisement_ttl_secs",
            "max_attempts",
            "base_delay_ms",
            "session_ttl_secs",
        ] {
            assert!(Config::parse(&format!("{field} = 0")).is_err(), "{field}");
        }
    }

    #[test]
    fn test_quorum_settings_validated() {
        assert!(Config::parse("min_connected_participants = 2").is_err());
        assert!(Config::parse(
            "allow_partial_connectivity = true\nmin_connected_participants = 1"
        )
        .is_err());
    }

    #[test]
    fn test_tilde_expansion() {
        let config = Config::parse(r#"cache_path = "~/custom/discovery.redb""#).unwrap();
        let path = config.cache_path().unwrap();
        assert!(!path.to_string_lossy().contains('~'));
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Config::load(Some(&dir.path().join("absent.toml"))).is_err());

        let path = dir.path().join("config.toml");
        std::fs::write(&path, "log_level = \"warn\"\n").unwrap();
        assert_eq!(Config::load(Some(&path)).unwrap().log_level, LogLevel::Warn);
    }
}
