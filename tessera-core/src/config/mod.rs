//! Node configuration
//!
//! Defaults, TOML files and `TESSERA_*` environment overrides.

use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;

mod error;

pub use error::ConfigError;

use crate::logging::LogLevel;

/// Main node configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub node: NodeConfig,
    pub peers: PeerConfig,
    pub sync: SyncConfig,
    pub consensus: ConsensusConfig,
    pub handshake: HandshakeConfig,
    pub logging: LoggingConfig,
}

/// Per-process settings of the running node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Protocol version announced to peers
    pub protocol_version: u32,

    /// Largest raw message accepted from the transport, in bytes
    pub max_message_size: usize,

    /// Depth of each peer's outbound queue
    pub outbound_queue: usize,

    /// Challenge every newly connected peer for its user identity
    pub identify_on_connect: bool,

    /// Upper bound on waiting for tasks during shutdown
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

/// Peer tier capacities
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    pub max_peers: usize,
    pub max_hub_peers: usize,
    pub max_important_peers: usize,
    pub max_member_peers: usize,
    pub max_pending_peers: usize,
    pub max_random_peers: usize,
}

/// Oplog anti-entropy timers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Base period of the per-category sync timer
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// Upper bound of the random delay added to every tick
    #[serde(with = "humantime_serde")]
    pub jitter: Duration,

    /// Period of the pending-oplog retry timer
    #[serde(with = "humantime_serde")]
    pub pending_interval: Duration,

    /// A category whose root hash stayed unchanged this long gets a full push
    #[serde(with = "humantime_serde")]
    pub force_sync_quiet_period: Duration,

    /// Maximum oplogs per data message
    pub batch_size: usize,
}

/// Master signature policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Distinct approved master signatures an oplog needs to become authoritative
    pub master_threshold: usize,
}

/// Identify / join handshake timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    #[serde(with = "humantime_serde")]
    pub identify_timeout: Duration,

    /// Identify attempts per connection before giving up
    pub identify_max_attempts: u32,

    /// First retry delay; doubles on every further attempt
    #[serde(with = "humantime_serde")]
    pub identify_backoff: Duration,

    /// Window for the requester's challenge-ack and for the whole join on the requester side
    #[serde(with = "humantime_serde")]
    pub join_timeout: Duration,

    /// Approve complete join requests without waiting for `confirm_join`
    pub auto_approve_join: bool,

    /// Lifetime of a freshly created op-key
    #[serde(with = "humantime_serde")]
    pub op_key_ttl: Duration,

    #[serde(with = "humantime_serde")]
    pub dial_history_ttl: Duration,

    pub dial_history_capacity: usize,

    /// Period of the housekeeping task (timeouts, expiry)
    #[serde(with = "humantime_serde")]
    pub gc_interval: Duration,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    pub json_format: bool,
    pub with_timestamp: bool,
    pub with_target: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            protocol_version: 1,
            max_message_size: 10 * 1024 * 1024, // 10 MiB
            outbound_queue: 256,
            identify_on_connect: true,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            max_peers: 350,
            max_hub_peers: 50,
            max_important_peers: 100,
            max_member_peers: 200,
            max_pending_peers: 50,
            max_random_peers: 25,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            jitter: Duration::from_secs(15),
            pending_interval: Duration::from_secs(30),
            force_sync_quiet_period: Duration::from_secs(600),
            batch_size: 200,
        }
    }
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self { master_threshold: 1 }
    }
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            identify_timeout: Duration::from_secs(10),
            identify_max_attempts: 3,
            identify_backoff: Duration::from_secs(5),
            join_timeout: Duration::from_secs(60),
            auto_approve_join: true,
            op_key_ttl: Duration::from_secs(24 * 3600),
            dial_history_ttl: Duration::from_secs(300),
            dial_history_capacity: 1024,
            gc_interval: Duration::from_secs(5),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            with_timestamp: true,
            with_target: true,
        }
    }
}

fn env_parse<T>(key: &str, target: &mut T) -> Result<(), ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Ok(raw) = env::var(key) {
        *target = raw
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                reason: e.to_string(),
            })?;
    }
    Ok(())
}

fn env_duration(key: &str, target: &mut Duration) -> Result<(), ConfigError> {
    if let Ok(raw) = env::var(key) {
        *target = humantime_serde::re::humantime::parse_duration(&raw)
            .map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                reason: e.to_string(),
            })?;
    }
    Ok(())
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// Variables follow the pattern `TESSERA_<SECTION>_<KEY>`, for example
    /// `TESSERA_PEERS_MAX_PEERS=100` or `TESSERA_SYNC_INTERVAL=30s`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay environment variables onto an existing configuration
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        env_parse("TESSERA_NODE_MAX_MESSAGE_SIZE", &mut self.node.max_message_size)?;
        env_parse("TESSERA_NODE_OUTBOUND_QUEUE", &mut self.node.outbound_queue)?;
        env_parse("TESSERA_NODE_IDENTIFY_ON_CONNECT", &mut self.node.identify_on_connect)?;
        env_duration("TESSERA_NODE_SHUTDOWN_TIMEOUT", &mut self.node.shutdown_timeout)?;

        env_parse("TESSERA_PEERS_MAX_PEERS", &mut self.peers.max_peers)?;
        env_parse("TESSERA_PEERS_MAX_HUB_PEERS", &mut self.peers.max_hub_peers)?;
        env_parse("TESSERA_PEERS_MAX_IMPORTANT_PEERS", &mut self.peers.max_important_peers)?;
        env_parse("TESSERA_PEERS_MAX_MEMBER_PEERS", &mut self.peers.max_member_peers)?;
        env_parse("TESSERA_PEERS_MAX_PENDING_PEERS", &mut self.peers.max_pending_peers)?;
        env_parse("TESSERA_PEERS_MAX_RANDOM_PEERS", &mut self.peers.max_random_peers)?;

        env_duration("TESSERA_SYNC_INTERVAL", &mut self.sync.interval)?;
        env_duration("TESSERA_SYNC_JITTER", &mut self.sync.jitter)?;
        env_duration(
            "TESSERA_SYNC_FORCE_SYNC_QUIET_PERIOD",
            &mut self.sync.force_sync_quiet_period,
        )?;
        env_parse("TESSERA_SYNC_BATCH_SIZE", &mut self.sync.batch_size)?;

        env_parse(
            "TESSERA_CONSENSUS_MASTER_THRESHOLD",
            &mut self.consensus.master_threshold,
        )?;

        env_duration("TESSERA_HANDSHAKE_JOIN_TIMEOUT", &mut self.handshake.join_timeout)?;
        env_parse(
            "TESSERA_HANDSHAKE_AUTO_APPROVE_JOIN",
            &mut self.handshake.auto_approve_join,
        )?;

        if let Ok(level) = env::var("TESSERA_LOG_LEVEL") {
            self.logging.level = level;
        }
        env_parse("TESSERA_LOG_JSON", &mut self.logging.json_format)?;

        Ok(())
    }

    /// Load configuration from a TOML file. Missing keys keep their defaults.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::FileReadError {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&contents)?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file(&self, path: impl AsRef<std::path::Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents).map_err(|source| ConfigError::FileWriteError {
            path: path.to_path_buf(),
            source,
        })?;

        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node.max_message_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_message_size must be greater than 0".to_string(),
            ));
        }
        if self.node.outbound_queue == 0 {
            return Err(ConfigError::ValidationFailed(
                "outbound_queue must be greater than 0".to_string(),
            ));
        }

        if self.peers.max_peers == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_peers must be greater than 0".to_string(),
            ));
        }
        if self.peers.max_random_peers == 0 {
            // every connection enters as random; zero would refuse all peers
            return Err(ConfigError::ValidationFailed(
                "max_random_peers must be greater than 0".to_string(),
            ));
        }

        if self.sync.interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "sync interval must be greater than 0".to_string(),
            ));
        }
        if self.sync.jitter >= self.sync.interval {
            return Err(ConfigError::ValidationFailed(
                "sync jitter must be smaller than the sync interval".to_string(),
            ));
        }
        if self.sync.batch_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "batch_size must be greater than 0".to_string(),
            ));
        }

        if self.consensus.master_threshold == 0 {
            return Err(ConfigError::ValidationFailed(
                "master_threshold must be at least 1".to_string(),
            ));
        }

        if self.handshake.identify_max_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "identify_max_attempts must be at least 1".to_string(),
            ));
        }
        if self.handshake.dial_history_capacity == 0 {
            return Err(ConfigError::ValidationFailed(
                "dial_history_capacity must be greater than 0".to_string(),
            ));
        }

        if LogLevel::parse(&self.logging.level).is_none() {
            return Err(ConfigError::ValidationFailed(format!(
                "Invalid log level: {}",
                self.logging.level
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.consensus.master_threshold, 1);
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.peers.max_peers = 0;
        assert!(config.validate().is_err());

        config = Config::default();
        config.sync.jitter = config.sync.interval;
        assert!(config.validate().is_err());

        config = Config::default();
        config.consensus.master_threshold = 0;
        assert!(config.validate().is_err());

        config = Config::default();
        config.logging.level = "invalid".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [peers]
            max_member_peers = 2

            [sync]
            interval = "30s"
            jitter = "2s"
            "#,
        )
        .unwrap();

        assert_eq!(config.peers.max_member_peers, 2);
        assert_eq!(config.peers.max_peers, PeerConfig::default().max_peers);
        assert_eq!(config.sync.interval, Duration::from_secs(30));
        assert_eq!(config.sync.batch_size, SyncConfig::default().batch_size);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tessera.toml");

        let mut config = Config::default();
        config.handshake.join_timeout = Duration::from_secs(5);
        config.save_to_file(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.handshake.join_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_missing_file() {
        let err = Config::from_file("/nonexistent/tessera.toml").unwrap_err();
        assert!(matches!(err, ConfigError::FileReadError { .. }));
    }

    #[test]
    fn test_env_override_parses_typed_values() {
        let key = "TESSERA_TEST_OUTBOUND_QUEUE";
        let mut queue: usize = 1;
        std::env::set_var(key, "42");
        env_parse(key, &mut queue).unwrap();
        assert_eq!(queue, 42);

        let mut flag = false;
        std::env::set_var(key, "true");
        env_parse(key, &mut flag).unwrap();
        assert!(flag);

        std::env::set_var(key, "lots");
        let err = env_parse(key, &mut queue).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: ref k, .. } if k == key));
        assert_eq!(queue, 42);
        std::env::remove_var(key);
    }
}
