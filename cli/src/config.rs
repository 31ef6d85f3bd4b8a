use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use haunts_core::BackendKind;
use haunts_core::sync::DEFAULT_SYNC_INTERVAL;

const CONFIG_FILE: &str = "config.toml";

/// Optional settings read from `config.toml` in the data directory.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    backend: Option<BackendKind>,
    remote_url: Option<String>,
    api_token: Option<String>,
    sync_interval_secs: Option<u64>,
}

#[derive(Debug)]
pub struct Config {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub backend: BackendKind,
    pub remote_url: Option<String>,
    pub api_token: Option<String>,
    pub sync_interval: Duration,
}

impl Config {
    pub fn load() -> Result<Self> {
        let proj_dirs =
            ProjectDirs::from("", "", "haunts").context("Could not determine home directory")?;

        let data_dir = proj_dirs.data_dir().to_path_buf();
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;

        let file = read_file_config(&data_dir.join(CONFIG_FILE))?;
        Self::resolve(data_dir, file, |key| std::env::var(key).ok())
    }

    /// Layer environment overrides on top of the config file.
    fn resolve(
        data_dir: PathBuf,
        file: FileConfig,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let var = |key: &str| env(key).filter(|v| !v.trim().is_empty());

        let backend = match var("HAUNTS_BACKEND") {
            Some(v) => v.parse().context("Invalid HAUNTS_BACKEND")?,
            None => file.backend.unwrap_or_default(),
        };

        let sync_interval = match var("HAUNTS_SYNC_INTERVAL_SECS") {
            Some(v) => Duration::from_secs(
                v.trim()
                    .parse()
                    .with_context(|| format!("Invalid HAUNTS_SYNC_INTERVAL_SECS: '{v}'"))?,
            ),
            None => file
                .sync_interval_secs
                .map_or(DEFAULT_SYNC_INTERVAL, Duration::from_secs),
        };
        if sync_interval.is_zero() {
            anyhow::bail!("Sync interval must be at least one second");
        }

        let remote_url = var("HAUNTS_REMOTE_URL")
            .or(file.remote_url)
            .map(|u| u.trim_end_matches('/').to_string());
        let api_token = var("HAUNTS_API_TOKEN").or(file.api_token);

        Ok(Config {
            db_path: data_dir.join(backend.file_name()),
            data_dir,
            backend,
            remote_url,
            api_token,
            sync_interval,
        })
    }
}

fn read_file_config(path: &Path) -> Result<FileConfig> {
    if !path.exists() {
        return Ok(FileConfig::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn resolve(file: FileConfig, vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Config::resolve(PathBuf::from("/data"), file, |key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = resolve(FileConfig::default(), &[]).unwrap();
        assert_eq!(config.backend, BackendKind::Sqlite);
        assert_eq!(config.db_path, PathBuf::from("/data/haunts.db"));
        assert_eq!(config.sync_interval, DEFAULT_SYNC_INTERVAL);
        assert!(config.remote_url.is_none());
        assert!(config.api_token.is_none());
    }

    #[test]
    fn test_file_values() {
        let file: FileConfig = toml::from_str(
            r#"
            backend = "kv"
            remote_url = "https://haunts.example/"
            api_token = "secret"
            sync_interval_secs = 120
            "#,
        )
        .unwrap();
        let config = resolve(file, &[]).unwrap();
        assert_eq!(config.backend, BackendKind::Kv);
        assert_eq!(config.db_path, PathBuf::from("/data/haunts.redb"));
        assert_eq!(config.remote_url.as_deref(), Some("https://haunts.example"));
        assert_eq!(config.api_token.as_deref(), Some("secret"));
        assert_eq!(config.sync_interval, Duration::from_secs(120));
    }

    #[test]
    fn test_env_overrides_file() {
        let file = FileConfig {
            backend: Some(BackendKind::Kv),
            api_token: Some("from-file".to_string()),
            ..FileConfig::default()
        };
        let config = resolve(
            file,
            &[
                ("HAUNTS_BACKEND", "sqlite"),
                ("HAUNTS_API_TOKEN", "from-env"),
                ("HAUNTS_SYNC_INTERVAL_SECS", "5"),
            ],
        )
        .unwrap();
        assert_eq!(config.backend, BackendKind::Sqlite);
        assert_eq!(config.api_token.as_deref(), Some("from-env"));
        assert_eq!(config.sync_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_blank_env_is_ignored() {
        let file = FileConfig {
            api_token: Some("from-file".to_string()),
            ..FileConfig::default()
        };
        let config = resolve(file, &[("HAUNTS_API_TOKEN", "  ")]).unwrap();
        assert_eq!(config.api_token.as_deref(), Some("from-file"));
    }

    #[test]
    fn test_invalid_values() {
        assert!(resolve(FileConfig::default(), &[("HAUNTS_BACKEND", "mongo")]).is_err());
        assert!(resolve(FileConfig::default(), &[("HAUNTS_SYNC_INTERVAL_SECS", "soon")]).is_err());
        assert!(resolve(FileConfig::default(), &[("HAUNTS_SYNC_INTERVAL_SECS", "0")]).is_err());
    }

    #[test]
    fn test_unknown_file_key_rejected() {
        assert!(toml::from_str::<FileConfig>("colour = \"blue\"").is_err());
    }

    #[test]
    fn test_read_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = read_file_config(&dir.path().join(CONFIG_FILE)).unwrap();
        assert!(file.backend.is_none());
    }

    #[test]
    fn test_read_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "backend = \"sqlite\"\n").unwrap();
        let file = read_file_config(&path).unwrap();
        assert_eq!(file.backend, Some(BackendKind::Sqlite));
    }
}
