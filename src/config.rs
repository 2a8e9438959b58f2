//! Gateway configuration.
//!
//! Loaded once at startup from TOML (or JSON when the file ends in `.json`)
//! and threaded explicitly through the server. A Copy request loads a second
//! instance of the same shape describing the *source* installation.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{GatewayError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub socket_path: PathBuf,
    pub interconnect_socket_path: PathBuf,
    /// TCP port for the plain-text session listing; 0 disables it.
    pub stat_port: u16,
    pub log_level: String,

    /// Reacquire attempts per read before giving up.
    pub retry_limit: usize,
    pub retry_delay_ms: u64,
    /// Rounds for copy/delete batches.
    pub retry_rounds: usize,
    pub copy_concurrency: usize,
    /// Objects moved or deleted at once by garbage collection and the
    /// obsolete sweeps.
    pub delete_concurrency: usize,

    pub storage: StorageConfig,
    pub backup_storage: Option<StorageConfig>,
    pub crypto: Option<CryptoConfig>,
    pub vacuum: VacuumConfig,
    pub metadata: MetadataConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/tmp/chunkgw.sock"),
            interconnect_socket_path: PathBuf::from("/tmp/chunkgw.interconnect.sock"),
            stat_port: 7432,
            log_level: "info".to_string(),
            retry_limit: 100,
            retry_delay_ms: 1000,
            retry_rounds: 10,
            copy_concurrency: 200,
            delete_concurrency: 64,
            storage: StorageConfig::default(),
            backup_storage: None,
            crypto: None,
            vacuum: VacuumConfig::default(),
            metadata: MetadataConfig::default(),
        }
    }
}

impl GatewayConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Storage holding backup sentinels; falls back to the main storage.
    pub fn backup_storage(&self) -> &StorageConfig {
        self.backup_storage.as_ref().unwrap_or(&self.storage)
    }

    pub fn validate(&self) -> Result<()> {
        if self.retry_limit == 0 {
            return Err(GatewayError::config("retry_limit must be at least 1"));
        }
        if self.retry_rounds == 0 {
            return Err(GatewayError::config("retry_rounds must be at least 1"));
        }
        if self.copy_concurrency == 0 {
            return Err(GatewayError::config("copy_concurrency must be at least 1"));
        }
        if self.delete_concurrency == 0 {
            return Err(GatewayError::config("delete_concurrency must be at least 1"));
        }
        self.storage.validate()?;
        if let Some(backup) = &self.backup_storage {
            backup.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    #[default]
    Fs,
    S3,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub storage_type: StorageType,
    /// Root directory for `fs`, key prefix for `s3`.
    pub storage_prefix: String,
    pub storage_bucket: String,
    pub storage_endpoint: Option<String>,
    pub storage_region: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,

    /// Bytes per second shared by all streams; 0 means unlimited.
    pub storage_rate_limit: u64,
    pub enable_rate_limiter: bool,
    pub disable_server_side_copy: bool,

    /// Bucket per tablespace for `s3`. Requests naming a tablespace are
    /// routed to its bucket; `pg_default` always uses `storage_bucket`.
    pub tablespace_map: HashMap<String, String>,
}

impl StorageConfig {
    pub fn fs(root: impl Into<String>) -> Self {
        Self {
            storage_type: StorageType::Fs,
            storage_prefix: root.into(),
            ..Default::default()
        }
    }

    /// Effective limit for the rate governor, if any.
    pub fn rate_limit(&self) -> Option<u64> {
        (self.enable_rate_limiter && self.storage_rate_limit > 0).then_some(self.storage_rate_limit)
    }

    /// Two configs point at the same physical store when type, bucket and
    /// endpoint agree. Server-side copy is only possible within one store.
    pub fn same_store(&self, other: &StorageConfig) -> bool {
        self.storage_type == other.storage_type
            && self.storage_bucket == other.storage_bucket
            && self.storage_endpoint == other.storage_endpoint
            && (self.storage_type == StorageType::S3 || self.storage_prefix == other.storage_prefix)
    }

    fn validate(&self) -> Result<()> {
        if self.storage_type == StorageType::S3 && self.storage_bucket.is_empty() {
            return Err(GatewayError::config("s3 storage requires storage_bucket"));
        }
        Ok(())
    }
}

/// Reference to the encryption key. Two configs with the same reference are
/// considered to hold identical keys.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    pub key_path: Option<PathBuf>,
    pub key_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VacuumConfig {
    /// Bound garbage collection by the oldest backup still required.
    pub check_backup: bool,
}

impl Default for VacuumConfig {
    fn default() -> Self {
        Self { check_backup: true }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    pub host: String,
    pub user: String,
    pub password: Option<String>,
    /// Database holding the catalog schema; discovered when unset.
    pub database: Option<String>,
    pub catalog_schema: String,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            user: "gpadmin".to_string(),
            password: None,
            database: None,
            catalog_schema: "yezzey".to_string(),
        }
    }
}

/// Load a config file, picking the format from its extension.
pub fn load(path: &Path) -> Result<GatewayConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| GatewayError::config(format!("cannot read {}: {e}", path.display())))?;

    let config: GatewayConfig = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(&raw)
            .map_err(|e| GatewayError::config(format!("invalid {}: {e}", path.display())))?,
        _ => toml::from_str(&raw)
            .map_err(|e| GatewayError::config(format!("invalid {}: {e}", path.display())))?,
    };

    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_from_empty_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("gw.toml");
        fs::write(&path, "").unwrap();

        let config = load(&path).unwrap();
        assert_eq!(config, GatewayConfig::default());
        assert_eq!(config.retry_limit, 100);
        assert_eq!(config.copy_concurrency, 200);
        assert!(config.vacuum.check_backup);
        assert_eq!(config.storage.rate_limit(), None);
    }

    #[test]
    fn test_load_toml_sections() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("gw.toml");
        fs::write(
            &path,
            r#"
socket_path = "/run/gw.sock"
stat_port = 0

[storage]
storage_type = "s3"
storage_bucket = "backups"
storage_prefix = "wal-g/"
storage_rate_limit = 1048576
enable_rate_limiter = true

[crypto]
key_id = "ABCDEF"

[vacuum]
check_backup = false
"#,
        )
        .unwrap();

        let config = load(&path).unwrap();
        assert_eq!(config.socket_path, PathBuf::from("/run/gw.sock"));
        assert_eq!(config.stat_port, 0);
        assert_eq!(config.storage.storage_type, StorageType::S3);
        assert_eq!(config.storage.rate_limit(), Some(1048576));
        assert_eq!(config.crypto.unwrap().key_id.as_deref(), Some("ABCDEF"));
        assert!(!config.vacuum.check_backup);
        assert_eq!(config.backup_storage, None);
    }

    #[test]
    fn test_load_json_by_extension() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("gw.json");
        fs::write(&path, r#"{"storage": {"storage_prefix": "/data"}}"#).unwrap();

        let config = load(&path).unwrap();
        assert_eq!(config.storage.storage_prefix, "/data");
        assert_eq!(config.backup_storage().storage_prefix, "/data");
    }

    #[test]
    fn test_tablespace_map_and_delete_concurrency() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("gw.toml");
        fs::write(
            &path,
            r#"
delete_concurrency = 8

[storage]
storage_type = "s3"
storage_bucket = "main"

[storage.tablespace_map]
fast = "ssd-bucket"
"#,
        )
        .unwrap();

        let config = load(&path).unwrap();
        assert_eq!(config.delete_concurrency, 8);
        assert_eq!(
            config.storage.tablespace_map.get("fast").map(String::as_str),
            Some("ssd-bucket")
        );
        assert_eq!(GatewayConfig::default().delete_concurrency, 64);

        fs::write(&path, "delete_concurrency = 0\n").unwrap();
        assert!(matches!(load(&path), Err(GatewayError::Configuration(_))));
    }

    #[test]
    fn test_s3_without_bucket_rejected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("gw.toml");
        fs::write(&path, "[storage]\nstorage_type = \"s3\"\n").unwrap();

        let err = load(&path).unwrap_err();
        assert!(matches!(err, GatewayError::Configuration(_)));
    }

    #[test]
    fn test_missing_file_is_configuration_error() {
        let err = load(Path::new("/nonexistent/gw.toml")).unwrap_err();
        assert!(matches!(err, GatewayError::Configuration(_)));
    }

    #[test]
    fn test_same_store() {
        let a = StorageConfig::fs("/data");
        let b = StorageConfig::fs("/data");
        let c = StorageConfig::fs("/other");
        assert!(a.same_store(&b));
        assert!(!a.same_store(&c));
    }
}
