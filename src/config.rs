//! Configuration for opguard.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (OPGUARD_HOME, OPGUARD_DB)
//! 2. Config file (.opguard/config.yaml)
//! 3. Defaults (~/.opguard)
//!
//! Config file discovery:
//! - Searches current directory and parents for .opguard/config.yaml
//! - Paths in config file are relative to the .opguard/ directory
//!
//! Library users build components from the settings structs directly; the
//! cached global is for the CLI.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::{
    HookSettings, IdempotencySettings, ObservabilitySettings, OrchestratorSettings,
    ValidationSettings,
};

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<Config, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub validation: ValidationSettings,
    #[serde(default)]
    pub idempotency: IdempotencySettings,
    #[serde(default)]
    pub hooks: HookSettings,
    #[serde(default)]
    pub observability: ObservabilitySettings,
    #[serde(default)]
    pub orchestrator: OrchestratorSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// State directory
    pub home: Option<String>,
    /// Idempotency database (default: <home>/idempotency.db)
    pub database: Option<String>,
    /// JSONL span export file; no file export when unset
    pub spans: Option<String>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub home: PathBuf,
    pub database: PathBuf,
    pub spans_file: Option<PathBuf>,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub validation: ValidationSettings,
    pub idempotency: IdempotencySettings,
    pub hooks: HookSettings,
    pub observability: ObservabilitySettings,
    pub orchestrator: OrchestratorSettings,
}

/// Find config file by searching `start` and its parents
fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(".opguard").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to `base`
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Environment overrides, read once per load
#[derive(Debug, Clone, Default)]
struct EnvOverrides {
    home: Option<PathBuf>,
    database: Option<PathBuf>,
}

impl EnvOverrides {
    fn from_env() -> Self {
        Self {
            home: std::env::var("OPGUARD_HOME").ok().map(PathBuf::from),
            database: std::env::var("OPGUARD_DB").ok().map(PathBuf::from),
        }
    }
}

/// Merge file contents, environment and defaults
fn resolve(
    config_file: Option<PathBuf>,
    file: ConfigFile,
    env: EnvOverrides,
    default_home: PathBuf,
) -> Config {
    // Paths in the file are relative to the .opguard/ directory
    let base = config_file
        .as_deref()
        .and_then(Path::parent)
        .unwrap_or(Path::new("."))
        .to_path_buf();

    let home = env
        .home
        .or_else(|| file.paths.home.as_deref().map(|p| resolve_path(&base, p)))
        .unwrap_or(default_home);

    let database = env
        .database
        .or_else(|| file.paths.database.as_deref().map(|p| resolve_path(&base, p)))
        .unwrap_or_else(|| home.join("idempotency.db"));

    let spans_file = file.paths.spans.as_deref().map(|p| resolve_path(&base, p));

    Config {
        home,
        database,
        spans_file,
        config_file,
        validation: file.validation,
        idempotency: file.idempotency,
        hooks: file.hooks,
        observability: file.observability,
        orchestrator: file.orchestrator,
    }
}

/// Load configuration from all sources
fn load_config() -> Result<Config> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".opguard");

    let cwd = std::env::current_dir().context("Failed to determine current directory")?;
    let config_file = find_config_file(&cwd);
    let file = match config_file {
        Some(ref path) => load_config_file(path)?,
        None => ConfigFile::default(),
    };

    Ok(resolve(config_file, file, EnvOverrides::from_env(), default_home))
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static Config> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<Config> {
    load_config()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_config(root: &Path, yaml: &str) -> PathBuf {
        let dir = root.join(".opguard");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "{}", yaml).unwrap();
        path
    }

    #[test]
    fn test_defaults_without_file() {
        let config = resolve(
            None,
            ConfigFile::default(),
            EnvOverrides::default(),
            PathBuf::from("/home/u/.opguard"),
        );

        assert_eq!(config.home, PathBuf::from("/home/u/.opguard"));
        assert_eq!(config.database, PathBuf::from("/home/u/.opguard/idempotency.db"));
        assert!(config.spans_file.is_none());
        assert_eq!(config.idempotency.ttl_seconds, 300);
        assert_eq!(config.orchestrator.max_concurrent, 1000);
    }

    #[test]
    fn test_config_file_parsing() {
        let temp = TempDir::new().unwrap();
        let path = write_config(
            temp.path(),
            r#"
version: "1"
paths:
  home: /var/lib/opguard
  spans: spans.jsonl
idempotency:
  ttl_seconds: 60
hooks:
  failure_threshold: 3
observability:
  slow_span_ms: 250
orchestrator:
  operation_timeout_ms: 5000
"#,
        );

        let file = load_config_file(&path).unwrap();
        assert_eq!(file.version.as_deref(), Some("1"));
        assert_eq!(file.idempotency.ttl_seconds, 60);
        // Unset fields keep their defaults
        assert_eq!(file.idempotency.failed_ttl_seconds, 3600);
        assert_eq!(file.hooks.failure_threshold, 3);
        assert_eq!(file.observability.slow_span_ms, 250);
        assert_eq!(file.orchestrator.operation_timeout_ms, 5000);

        let config = resolve(
            Some(path.clone()),
            file,
            EnvOverrides::default(),
            PathBuf::from("/unused"),
        );
        assert_eq!(config.home, PathBuf::from("/var/lib/opguard"));
        assert_eq!(config.database, PathBuf::from("/var/lib/opguard/idempotency.db"));
        assert_eq!(
            config.spans_file,
            Some(temp.path().join(".opguard").join("spans.jsonl"))
        );
    }

    #[test]
    fn test_env_overrides_file() {
        let file: ConfigFile = serde_yaml::from_str("paths:\n  home: /from/file\n").unwrap();
        let env = EnvOverrides {
            home: Some(PathBuf::from("/from/env")),
            database: Some(PathBuf::from("/db/keys.db")),
        };

        let config = resolve(None, file, env, PathBuf::from("/unused"));
        assert_eq!(config.home, PathBuf::from("/from/env"));
        assert_eq!(config.database, PathBuf::from("/db/keys.db"));
    }

    #[test]
    fn test_find_config_in_parent() {
        let temp = TempDir::new().unwrap();
        let path = write_config(temp.path(), "version: \"1\"");
        let nested = temp.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();

        assert_eq!(find_config_file(&nested), Some(path));
    }

    #[test]
    fn test_resolve_relative_path() {
        let base = PathBuf::from("/home/user/project");

        assert_eq!(
            resolve_path(&base, "/absolute/path"),
            PathBuf::from("/absolute/path")
        );
        assert_eq!(
            resolve_path(&base, "../sibling"),
            PathBuf::from("/home/user/project/../sibling")
        );
    }
}
