use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub data_root: PathBuf,
    pub worker_runtime_base_url: String,
    pub service_port: u16,
    pub default_worker_timeout_secs: u64,
    pub investigation_budget_max: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            data_root: PathBuf::from("./data"),
            worker_runtime_base_url: "http://127.0.0.1:8200".to_string(),
            service_port: 8787,
            default_worker_timeout_secs: 600,
            investigation_budget_max: 50,
        }
    }
}

impl EngineConfig {
    pub fn default_worker_timeout(&self) -> Duration {
        Duration::from_secs(self.default_worker_timeout_secs)
    }

    /// Mirrors `ProjectConfig::validate` but on the ceiling the engine will
    /// accept, not on a single project's chosen budget.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.investigation_budget_max > 50 {
            errors.push(format!(
                "investigation_budget_max {} exceeds the hard ceiling of 50",
                self.investigation_budget_max
            ));
        }

        if self.worker_runtime_base_url.is_empty() {
            errors.push("worker_runtime_base_url must not be empty".to_string());
        } else if !self.worker_runtime_base_url.starts_with("http://")
            && !self.worker_runtime_base_url.starts_with("https://")
        {
            errors.push(format!(
                "worker_runtime_base_url '{}' must start with http:// or https://",
                self.worker_runtime_base_url
            ));
        }

        if self.service_port == 0 {
            errors.push("service_port must be nonzero".to_string());
        }

        if self.default_worker_timeout_secs == 0 {
            errors.push("default_worker_timeout_secs must be > 0".to_string());
        }

        errors
    }
}

/// Load config from an explicit path (if provided) or fall back to
/// `{cwd}/strategos.toml`. When `config_path` is `Some`, the file MUST exist.
pub fn load_config_from(
    config_path: Option<&Path>,
    cwd: &Path,
) -> Result<EngineConfig, String> {
    match config_path {
        Some(path) => load_config_at(path),
        None => load_config(cwd),
    }
}

fn load_config_at(path: &Path) -> Result<EngineConfig, String> {
    if !path.exists() {
        return Err(format!("Config file not found: {}", path.display()));
    }

    let contents = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;

    let config: EngineConfig = toml::from_str(&contents)
        .map_err(|e| format!("Failed to parse {}: {}", path.display(), e))?;

    validate_or_err(&config)?;
    Ok(config)
}

pub fn load_config(cwd: &Path) -> Result<EngineConfig, String> {
    let config_path = cwd.join("strategos.toml");

    if !config_path.exists() {
        return Ok(EngineConfig::default());
    }

    let contents = std::fs::read_to_string(&config_path)
        .map_err(|e| format!("Failed to read {}: {}", config_path.display(), e))?;

    let config: EngineConfig = toml::from_str(&contents)
        .map_err(|e| format!("Failed to parse {}: {}", config_path.display(), e))?;

    validate_or_err(&config)?;
    Ok(config)
}

fn validate_or_err(config: &EngineConfig) -> Result<(), String> {
    let errors = config.validate();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(format!(
            "Config validation failed:\n{}",
            errors
                .iter()
                .map(|e| format!("  - {}", e))
                .collect::<Vec<_>>()
                .join("\n")
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_empty());
    }

    #[test]
    fn rejects_bad_base_url() {
        let mut cfg = EngineConfig::default();
        cfg.worker_runtime_base_url = "not-a-url".to_string();
        assert!(!cfg.validate().is_empty());
    }

    #[test]
    fn rejects_zero_port_and_timeout() {
        let mut cfg = EngineConfig::default();
        cfg.service_port = 0;
        cfg.default_worker_timeout_secs = 0;
        let errors = cfg.validate();
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn load_config_at_missing_path_errors() {
        let result = load_config_at(Path::new("/nonexistent/strategos.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn load_config_defaults_when_file_absent() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(dir.path()).unwrap();
        assert_eq!(config, EngineConfig::default());
    }
}
