//! Per-launch model config: the base YAML with `adapter_path` pointed at the
//! selected adapter.

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Result;

static ADAPTER_PATH_KEY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^([ \t]*)adapter_path:.*$").expect("valid adapter_path regex")
});

/// Single-quoted YAML scalar; `'` is escaped by doubling.
fn yaml_quoted(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Rewrite every `adapter_path:` line in `contents`, or append one.
pub fn render_adapter_config(contents: &str, adapter_dir: &Path) -> String {
    let value = yaml_quoted(&adapter_dir.display().to_string());
    if ADAPTER_PATH_KEY.is_match(contents) {
        return ADAPTER_PATH_KEY
            .replace_all(contents, |caps: &Captures<'_>| {
                format!("{}adapter_path: {value}", &caps[1])
            })
            .into_owned();
    }
    let mut out = contents.to_string();
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(&format!("adapter_path: {value}\n"));
    out
}

/// A rendered config file that is removed when dropped.
#[derive(Debug)]
pub struct TempModelConfig {
    path: PathBuf,
}

impl TempModelConfig {
    /// Write `config_<random>.yaml` beside `base` with `adapter_path` set.
    pub async fn write(base: &Path, adapter_dir: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(base).await?;
        let dir = match base.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let path = dir.join(format!("config_{}.yaml", Uuid::new_v4().simple()));
        tokio::fs::write(&path, render_adapter_config(&contents, adapter_dir)).await?;
        debug!(path = %path.display(), "wrote temporary model config");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempModelConfig {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "failed to remove temporary model config");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replaces_existing_key() {
        let base = "model: llama\nadapter_path: old/path\nmax_tokens: 256\n";
        let out = render_adapter_config(base, Path::new("/adapters/new"));
        assert_eq!(
            out,
            "model: llama\nadapter_path: '/adapters/new'\nmax_tokens: 256\n"
        );
    }

    #[test]
    fn keeps_indentation_of_nested_key() {
        let base = "lora:\n  adapter_path: ''\n";
        let out = render_adapter_config(base, Path::new("/a"));
        assert_eq!(out, "lora:\n  adapter_path: '/a'\n");
    }

    #[test]
    fn appends_missing_key() {
        let out = render_adapter_config("model: llama", Path::new("/a"));
        assert_eq!(out, "model: llama\nadapter_path: '/a'\n");
        assert_eq!(
            render_adapter_config("", Path::new("/a")),
            "adapter_path: '/a'\n"
        );
    }

    #[test]
    fn dollar_signs_in_path_are_literal() {
        let out = render_adapter_config("adapter_path: x\n", Path::new("/tmp/$1"));
        assert_eq!(out, "adapter_path: '/tmp/$1'\n");
    }

    #[test]
    fn yaml_special_characters_are_quoted() {
        let out = render_adapter_config(
            "adapter_path: x\n",
            Path::new("/data/run: 2 #best/it's"),
        );
        assert_eq!(out, "adapter_path: '/data/run: 2 #best/it''s'\n");
    }

    #[tokio::test]
    async fn temp_config_lives_beside_base_and_is_removed_on_drop() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().join("config.yaml");
        std::fs::write(&base, "adapter_path: none\n").unwrap();

        let temp = TempModelConfig::write(&base, Path::new("/adapters/x"))
            .await
            .unwrap();
        let path = temp.path().to_path_buf();
        assert_eq!(path.parent(), Some(tmp.path()));
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("config_") && name.ends_with(".yaml"));
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "adapter_path: '/adapters/x'\n"
        );

        drop(temp);
        assert!(!path.exists());
    }
}
