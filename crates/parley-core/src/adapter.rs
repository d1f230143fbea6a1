//! Metadata describing a fine-tuned adapter directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{BridgeError, Result};

/// File inside an adapter directory holding its training configuration.
pub const ADAPTER_CONFIG_FILE: &str = "adapter_config.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterInfo {
    pub name: String,
    pub path: PathBuf,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl AdapterInfo {
    /// Describe the adapter stored in `dir`.
    ///
    /// The name is the directory's final component. `adapter_config.json`,
    /// when present, becomes the metadata map.
    pub async fn from_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let meta = match tokio::fs::metadata(dir).await {
            Ok(meta) if meta.is_dir() => meta,
            _ => return Err(BridgeError::not_found("adapter directory", dir)),
        };

        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| dir.display().to_string());
        let created = meta
            .created()
            .or_else(|_| meta.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        let config_path = dir.join(ADAPTER_CONFIG_FILE);
        let metadata = match tokio::fs::read_to_string(&config_path).await {
            Ok(contents) => serde_json::from_str(&contents).map_err(|e| {
                BridgeError::InvalidConfig(format!("{}: {e}", config_path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %config_path.display(), "adapter has no config file");
                HashMap::new()
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            name,
            path: dir.to_path_buf(),
            created,
            metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn from_dir_reads_name_and_metadata() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("legal-qa-v2");
        std::fs::create_dir(&dir).unwrap();
        std::fs::write(
            dir.join(ADAPTER_CONFIG_FILE),
            r#"{"base_model_name_or_path": "llama", "peft_type": "LORA", "r": 8}"#,
        )
        .unwrap();

        let info = AdapterInfo::from_dir(&dir).await.unwrap();
        assert_eq!(info.name, "legal-qa-v2");
        assert_eq!(info.path, dir);
        assert_eq!(info.metadata["peft_type"], "LORA");
        assert_eq!(info.metadata["r"], 8);
    }

    #[tokio::test]
    async fn missing_config_file_gives_empty_metadata() {
        let tmp = tempfile::tempdir().unwrap();
        let info = AdapterInfo::from_dir(tmp.path()).await.unwrap();
        assert!(info.metadata.is_empty());
    }

    #[tokio::test]
    async fn malformed_config_is_invalid() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(ADAPTER_CONFIG_FILE), "{not json").unwrap();
        let err = AdapterInfo::from_dir(tmp.path()).await.unwrap_err();
        assert!(matches!(err, BridgeError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn missing_directory_is_not_found() {
        let err = AdapterInfo::from_dir("/nonexistent/parley/adapter")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BridgeError::NotFound {
                what: "adapter directory",
                ..
            }
        ));
    }

    #[test]
    fn serde_roundtrip_defaults_metadata() {
        let json = r#"{"name":"a","path":"/tmp/a","created":"2024-05-01T12:00:00Z"}"#;
        let info: AdapterInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.name, "a");
        assert!(info.metadata.is_empty());
    }
}
