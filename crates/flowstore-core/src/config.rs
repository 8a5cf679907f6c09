//! flowstore.toml configuration parser.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ids::{DeviceId, ReplicaId};

/// Largest table id space a device can advertise (one-byte local ids).
pub const MAX_TABLE_ID_SPACE: u16 = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub replica_id: ReplicaId,
    /// Directory for the redb backup store. In-memory only when unset.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default = "default_forward_timeout_ms")]
    pub forward_timeout_ms: u64,
    #[serde(default = "default_adapter_timeout_ms")]
    pub adapter_timeout_ms: u64,
    #[serde(default = "default_backup_timeout_ms")]
    pub backup_timeout_ms: u64,
    #[serde(default)]
    pub read_consistency: ReadConsistency,
    /// Local table ids per device when the device does not advertise its own.
    #[serde(default = "default_table_id_space")]
    pub table_id_space: u16,
    /// Operation outcomes remembered per device for idempotent resubmission.
    #[serde(default = "default_dedup_window")]
    pub dedup_window: usize,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

/// Where reads are served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadConsistency {
    /// Serve from the local (possibly backup) copy.
    Local,
    /// Ask the device's master.
    #[default]
    Forward,
}

/// A device this replica should claim when running standalone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub id: DeviceId,
    pub table_id_space: Option<u16>,
    #[serde(default)]
    pub backups: Vec<ReplicaId>,
}

fn default_forward_timeout_ms() -> u64 {
    5_000
}

fn default_adapter_timeout_ms() -> u64 {
    5_000
}

fn default_backup_timeout_ms() -> u64 {
    2_000
}

fn default_table_id_space() -> u16 {
    MAX_TABLE_ID_SPACE
}

fn default_dedup_window() -> usize {
    1024
}

impl StoreConfig {
    /// Defaults for everything but the replica id.
    pub fn new(replica_id: &str) -> Self {
        Self {
            replica_id: replica_id.to_string(),
            data_dir: None,
            forward_timeout_ms: default_forward_timeout_ms(),
            adapter_timeout_ms: default_adapter_timeout_ms(),
            backup_timeout_ms: default_backup_timeout_ms(),
            read_consistency: ReadConsistency::default(),
            table_id_space: default_table_id_space(),
            dedup_window: default_dedup_window(),
            devices: Vec::new(),
        }
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: StoreConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.replica_id.is_empty(), "replica_id must not be empty");
        check_space(self.table_id_space)?;
        for device in &self.devices {
            DeviceId::parse(device.id.as_str())?;
            if let Some(space) = device.table_id_space {
                check_space(space)?;
            }
        }
        anyhow::ensure!(self.forward_timeout_ms > 0, "forward_timeout_ms must be positive");
        anyhow::ensure!(self.adapter_timeout_ms > 0, "adapter_timeout_ms must be positive");
        Ok(())
    }

    pub fn forward_timeout(&self) -> Duration {
        Duration::from_millis(self.forward_timeout_ms)
    }

    pub fn adapter_timeout(&self) -> Duration {
        Duration::from_millis(self.adapter_timeout_ms)
    }

    pub fn backup_timeout(&self) -> Duration {
        Duration::from_millis(self.backup_timeout_ms)
    }

    /// Scaffold a config claiming one POF device.
    pub fn scaffold(replica_id: &str) -> Self {
        let mut config = Self::new(replica_id);
        config.data_dir = Some(PathBuf::from("/var/lib/flowstore"));
        config.devices.push(DeviceConfig {
            id: DeviceId::new("pof:0000000000000001"),
            table_id_space: Some(64),
            backups: Vec::new(),
        });
        config
    }
}

fn check_space(space: u16) -> anyhow::Result<()> {
    anyhow::ensure!(
        (1..=MAX_TABLE_ID_SPACE).contains(&space),
        "table_id_space must be within 1..={MAX_TABLE_ID_SPACE}, got {space}"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scaffold() {
        let config = StoreConfig::scaffold("replica-a");
        let toml_str = config.to_toml_string().unwrap();
        assert!(toml_str.contains("replica-a"));
        assert!(toml_str.contains("pof:0000000000000001"));

        let back = StoreConfig::from_toml(&toml_str).unwrap();
        assert_eq!(back.devices.len(), 1);
        assert_eq!(back.devices[0].table_id_space, Some(64));
    }

    #[test]
    fn test_parse_minimal() {
        let config = StoreConfig::from_toml(r#"replica_id = "r1""#).unwrap();
        assert_eq!(config.replica_id, "r1");
        assert_eq!(config.table_id_space, 256);
        assert_eq!(config.read_consistency, ReadConsistency::Forward);
        assert_eq!(config.forward_timeout(), Duration::from_secs(5));
        assert!(config.data_dir.is_none());
    }

    #[test]
    fn test_parse_full() {
        let toml_str = r#"
replica_id = "r2"
data_dir = "/tmp/flowstore"
forward_timeout_ms = 250
read_consistency = "local"
table_id_space = 16

[[devices]]
id = "of:00000000000000a1"
backups = ["r1", "r3"]
"#;
        let config = StoreConfig::from_toml(toml_str).unwrap();
        assert_eq!(config.forward_timeout(), Duration::from_millis(250));
        assert_eq!(config.read_consistency, ReadConsistency::Local);
        assert_eq!(config.devices[0].backups, vec!["r1", "r3"]);
        assert_eq!(config.devices[0].table_id_space, None);
    }

    #[test]
    fn test_rejects_oversized_space() {
        let err = StoreConfig::from_toml("replica_id = \"r1\"\ntable_id_space = 300").unwrap_err();
        assert!(err.to_string().contains("table_id_space"));
    }

    #[test]
    fn test_rejects_device_without_scheme() {
        let toml_str = r#"
replica_id = "r1"

[[devices]]
id = "0001"
"#;
        assert!(StoreConfig::from_toml(toml_str).is_err());
    }
}
