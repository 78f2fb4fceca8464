//! Node configuration loaded from the optional JSON config file at
//! `<home>/.geomys/geomys.conf`. A missing file yields all defaults; a
//! malformed file is a fatal startup error.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::utils::GeomysError;

/// Application configuration. Field names follow the on-disk JSON schema;
/// unknown fields are ignored and missing fields take defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Client-facing port (the cluster port is derived as this + 1000).
    pub internal_port: u16,

    /// Externally advertised port, if different from `internal_port`.
    pub external_port: u16,

    /// Default entry expiry in milliseconds.
    pub default_expiry: i64,

    /// Persistence backend selector.
    pub persistence: String,

    #[serde(rename = "replication_enabled")]
    pub replication: bool,

    pub node_id: i32,

    /// Whether this node should come up believing it is the leader.
    #[serde(rename = "leader_id")]
    pub is_leader: bool,

    #[serde(rename = "sharding_enabled")]
    pub sharding: bool,

    pub cluster_mode: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            internal_port: 6379,
            external_port: 0,
            default_expiry: 60000,
            persistence: "writethroughdisk".into(),
            replication: false,
            node_id: 0,
            is_leader: false,
            sharding: false,
            cluster_mode: false,
        }
    }
}

impl Config {
    /// Loads the config from the default location, returning defaults if
    /// the file does not exist.
    pub fn load_or_default() -> Result<Config, GeomysError> {
        let path = geomys_dir()?.join("geomys.conf");
        Self::load_from(&path)
    }

    /// Loads the config from the given path, returning defaults if the
    /// file does not exist.
    pub fn load_from(path: &Path) -> Result<Config, GeomysError> {
        match fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                GeomysError::Fatal(format!(
                    "malformed config file '{}': {}",
                    path.display(),
                    e
                ))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(Config::default())
            }
            Err(e) => Err(GeomysError::Fatal(format!(
                "cannot read config file '{}': {}",
                path.display(),
                e
            ))),
        }
    }
}

/// Resolves (and creates if missing) the `<home>/.geomys` state directory.
pub(crate) fn geomys_dir() -> Result<PathBuf, GeomysError> {
    let home = dirs::home_dir().ok_or_else(|| {
        GeomysError::Fatal("cannot determine home directory".into())
    })?;
    let dir = home.join(".geomys");
    fs::create_dir_all(&dir).map_err(|e| {
        GeomysError::Fatal(format!(
            "cannot create state directory '{}': {}",
            dir.display(),
            e
        ))
    })?;
    Ok(dir)
}

#[cfg(test)]
mod config_tests {
    use super::*;

    #[test]
    fn defaults_when_missing() -> Result<(), GeomysError> {
        let config =
            Config::load_from(Path::new("/tmp/geomys-no-such-file.conf"))?;
        assert_eq!(config, Config::default());
        assert_eq!(config.internal_port, 6379);
        assert_eq!(config.default_expiry, 60000);
        Ok(())
    }

    #[test]
    fn parse_partial_file() -> Result<(), GeomysError> {
        let path = Path::new("/tmp/test-geomys-partial.conf");
        fs::write(
            path,
            r#"{"internal_port": 7000, "cluster_mode": true, "node_id": 3}"#,
        )
        .unwrap();
        let config = Config::load_from(path)?;
        assert_eq!(config.internal_port, 7000);
        assert!(config.cluster_mode);
        assert_eq!(config.node_id, 3);
        // untouched fields keep defaults
        assert_eq!(config.default_expiry, 60000);
        assert!(!config.replication);
        Ok(())
    }

    #[test]
    fn renamed_fields_recognized() -> Result<(), GeomysError> {
        let path = Path::new("/tmp/test-geomys-renamed.conf");
        fs::write(
            path,
            r#"{"replication_enabled": true, "leader_id": true,
                "sharding_enabled": false}"#,
        )
        .unwrap();
        let config = Config::load_from(path)?;
        assert!(config.replication);
        assert!(config.is_leader);
        assert!(!config.sharding);
        Ok(())
    }

    #[test]
    fn malformed_file_is_fatal() {
        let path = Path::new("/tmp/test-geomys-malformed.conf");
        fs::write(path, "{not json").unwrap();
        match Config::load_from(path) {
            Err(GeomysError::Fatal(_)) => {}
            other => panic!("expected fatal error, got {:?}", other),
        }
    }
}
