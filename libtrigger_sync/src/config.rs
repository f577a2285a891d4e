use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::constants::{
    RECORD_PORT_OFFSET, STATUS_PORT_OFFSET, TOPIC_ALIVE, TOPIC_EXTERNAL_TRIGGER,
    TOPIC_NUMBER_WRITTEN, TOPIC_TRIGGER_RATE,
};
use super::error::ConfigError;

/// Parameters of the hyperactive channel workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HyperactiveConfig {
    pub observation_window_secs: f64,
    pub rate_messages_expected: usize,
    pub max_quiet_rate_hz: f64,
}

impl Default for HyperactiveConfig {
    fn default() -> Self {
        Self {
            observation_window_secs: 10.0,
            rate_messages_expected: 5,
            max_quiet_rate_hz: 1.0,
        }
    }
}

/// Parameters of the level trigger workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelTriggerConfig {
    pub records_per_channel: usize,
    pub auto_delay_ns: i64,
    pub collection_timeout_secs: f64,
}

impl Default for LevelTriggerConfig {
    fn default() -> Self {
        Self {
            records_per_channel: 40,
            auto_delay_ns: 50_000_000,
            collection_timeout_secs: 60.0,
        }
    }
}

/// Structure representing the application configuration. Contains the server address,
/// feed behavior, and workflow parameters.
/// Configs are seralizable and deserializable to YAML using serde and serde_yaml
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub host: String,
    pub base_port: u16,
    pub block_list_path: PathBuf,
    pub rpc_timeout_secs: f64,
    pub feed_poll_interval_ms: u64,
    pub always_deliver_topics: Vec<String>,
    pub quiet_topics: Vec<String>,
    pub verbose_message_limit: usize,
    pub hyperactive: HyperactiveConfig,
    pub level_triggers: LevelTriggerConfig,
    pub sync_grace_period_secs: f64,
    pub startup_timeout_secs: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: String::from("localhost"),
            base_port: 5500,
            block_list_path: PathBuf::from("~/.dastard/blocked_channels.json"),
            rpc_timeout_secs: 7.0,
            feed_poll_interval_ms: 100,
            always_deliver_topics: vec![
                String::from(TOPIC_ALIVE),
                String::from(TOPIC_TRIGGER_RATE),
            ],
            quiet_topics: vec![
                String::from(TOPIC_TRIGGER_RATE),
                String::from(TOPIC_NUMBER_WRITTEN),
                String::from(TOPIC_ALIVE),
                String::from(TOPIC_EXTERNAL_TRIGGER),
            ],
            verbose_message_limit: 15,
            hyperactive: HyperactiveConfig::default(),
            level_triggers: LevelTriggerConfig::default(),
            sync_grace_period_secs: 1.5,
            startup_timeout_secs: 5.0,
        }
    }
}

impl Config {
    /// Read the configuration in a YAML file
    /// Returns a Config if successful
    pub fn read_config_file(config_path: &Path) -> Result<Self, ConfigError> {
        if !config_path.exists() {
            return Err(ConfigError::BadFilePath(config_path.to_path_buf()));
        }

        let yaml_str = std::fs::read_to_string(config_path)?;

        Ok(serde_yaml::from_str::<Self>(&yaml_str)?)
    }

    /// Write the configuration to a YAML file
    pub fn write_config_file(&self, config_path: &Path) -> Result<(), ConfigError> {
        let yaml_str = serde_yaml::to_string(self)?;
        std::fs::write(config_path, yaml_str)?;
        Ok(())
    }

    pub fn rpc_port(&self) -> u16 {
        self.base_port
    }

    pub fn status_port(&self) -> u16 {
        self.base_port + STATUS_PORT_OFFSET
    }

    pub fn record_port(&self) -> u16 {
        self.base_port + RECORD_PORT_OFFSET
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.rpc_timeout_secs.max(0.0))
    }

    pub fn feed_poll_interval(&self) -> Duration {
        Duration::from_millis(self.feed_poll_interval_ms)
    }

    pub fn sync_grace_period(&self) -> Duration {
        Duration::from_secs_f64(self.sync_grace_period_secs.max(0.0))
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.startup_timeout_secs.max(0.0))
    }

    pub fn observation_window(&self) -> Duration {
        Duration::from_secs_f64(self.hyperactive.observation_window_secs.max(0.0))
    }

    pub fn collection_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.level_triggers.collection_timeout_secs.max(0.0))
    }

    /// The block list path with a leading `~` replaced by the home directory
    pub fn get_block_list_path(&self) -> PathBuf {
        expand_home(&self.block_list_path)
    }
}

fn expand_home(path: &Path) -> PathBuf {
    let home = match std::env::var_os("HOME") {
        Some(h) => PathBuf::from(h),
        None => return path.to_path_buf(),
    };
    match path.strip_prefix("~") {
        Ok(rest) => home.join(rest),
        Err(_) => path.to_path_buf(),
    }
}

//Unit tests
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ports_follow_base() {
        let config = Config {
            base_port: 6000,
            ..Default::default()
        };
        assert_eq!(config.rpc_port(), 6000);
        assert_eq!(config.status_port(), 6001);
        assert_eq!(config.record_port(), 6002);
        assert_eq!(config.sync_grace_period(), Duration::from_millis(1500));
    }

    #[test]
    fn test_default_topics() {
        let config = Config::default();
        assert_eq!(config.always_deliver_topics, vec!["ALIVE", "TRIGGERRATE"]);
        assert_eq!(
            config.quiet_topics,
            vec!["TRIGGERRATE", "NUMBERWRITTEN", "ALIVE", "EXTERNALTRIGGER"]
        );
    }

    #[test]
    fn test_yaml_round_trip_and_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let config = Config::default();
        config.write_config_file(&path).unwrap();
        assert_eq!(Config::read_config_file(&path).unwrap(), config);

        let yaml = [
            "host: daq.local",
            "hyperactive:",
            "  observation_window_secs: 5.0",
            "  rate_messages_expected: 3",
            "  max_quiet_rate_hz: 2.0",
        ]
        .join("\n");
        std::fs::write(&path, yaml).unwrap();
        let partial = Config::read_config_file(&path).unwrap();
        assert_eq!(partial.host, "daq.local");
        assert_eq!(partial.base_port, 5500);
        assert_eq!(partial.observation_window(), Duration::from_secs(5));

        assert!(matches!(
            Config::read_config_file(&dir.path().join("missing.yaml")),
            Err(ConfigError::BadFilePath(_))
        ));
    }

    #[test]
    fn test_home_expansion() {
        let config = Config::default();
        let path = config.get_block_list_path();
        if std::env::var_os("HOME").is_some() {
            assert!(!path.starts_with("~"));
        }
        assert!(path.ends_with(".dastard/blocked_channels.json"));
        assert_eq!(
            expand_home(Path::new("/tmp/b.json")),
            PathBuf::from("/tmp/b.json")
        );
    }
}
