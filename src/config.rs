//! Optional config file loading. Search order: ./comicdl.toml, then
//! $XDG_CONFIG_HOME/comicdl/config.toml (or ~/.config/comicdl/config.toml).

use serde::Deserialize;
use std::path::PathBuf;

/// Config file contents. All fields optional; only present keys override defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct Config {
    /// Directory for finished outputs (default `comics`). Paths are relative to CWD.
    pub output_dir: Option<PathBuf>,
    /// Directory holding the `tmp_<slug>` workspaces (default: CWD).
    pub workspace_dir: Option<PathBuf>,
    /// HTTP User-Agent header.
    pub user_agent: Option<String>,
    /// Delay in milliseconds between metadata requests.
    pub request_delay_ms: Option<u64>,
    /// Request timeout in seconds.
    pub timeout_secs: Option<u64>,
    /// Attempts per request or page for transient failures.
    pub retry_count: Option<u32>,
    /// Delay in milliseconds before each retry (e.g. [1000, 2000, 4000]); the last value is reused.
    pub retry_backoff_ms: Option<Vec<u64>>,
    /// Concurrent page downloads (default 4).
    pub download_workers: Option<usize>,
    /// Chapters processed concurrently (default 2).
    pub process_workers: Option<usize>,
}

/// Search order: (1) ./comicdl.toml, (2) $XDG_CONFIG_HOME/comicdl/config.toml.
/// Missing file returns Ok(None). Invalid TOML or I/O error reading a present file returns Err.
pub fn load_config() -> Result<Option<Config>, String> {
    let cwd = std::env::current_dir()
        .map_err(|e| format!("Cannot determine current directory: {}", e))?;
    let mut paths = vec![cwd.join("comicdl.toml")];
    if let Some(d) = dirs::config_dir() {
        paths.push(d.join("comicdl").join("config.toml"));
    }
    for path in &paths {
        if path.exists() {
            let s = std::fs::read_to_string(path)
                .map_err(|e| format!("Cannot read config {}: {}", path.display(), e))?;
            let config: Config = toml::from_str(&s)
                .map_err(|e| format!("Invalid config {}: {}", path.display(), e))?;
            config.validate().map_err(|e| format!("Invalid config {}: {}", path.display(), e))?;
            return Ok(Some(config));
        }
    }
    Ok(None)
}

impl Config {
    fn validate(&self) -> Result<(), String> {
        if self.download_workers == Some(0) {
            return Err("download_workers must be at least 1".to_string());
        }
        if self.process_workers == Some(0) {
            return Err("process_workers must be at least 1".to_string());
        }
        if self.retry_count == Some(0) {
            return Err("retry_count must be at least 1".to_string());
        }
        Ok(())
    }
}
