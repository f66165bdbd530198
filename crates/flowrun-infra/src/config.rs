//! Engine configuration loader.
//!
//! Reads a TOML file and deserializes it into [`EngineConfig`]. Falls back
//! to defaults when the file is missing or malformed.

use std::path::Path;

use flowrun_types::config::EngineConfig;

/// Load engine configuration from `path`.
///
/// - If the file does not exist, returns [`EngineConfig::default()`].
/// - If the file exists but fails to parse, logs a warning and returns the default.
/// - Otherwise returns the parsed config, with `max_concurrent_executions`
///   floored at 1.
pub async fn load_engine_config(path: &Path) -> EngineConfig {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config found at {}, using defaults", path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", path.display());
            return EngineConfig::default();
        }
    };

    let mut config = match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!("Failed to parse {}: {err}, using defaults", path.display());
            EngineConfig::default()
        }
    };
    config.max_concurrent_executions = config.max_concurrent_executions.max(1);
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn missing_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let config = load_engine_config(&tmp.path().join("flowrun.toml")).await;
        assert_eq!(config, EngineConfig::default());
    }

    #[tokio::test]
    async fn valid_toml_overrides_named_fields() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("flowrun.toml");
        tokio::fs::write(&path, "max_concurrent_executions = 3\nshutdown_grace_ms = 500\n")
            .await
            .unwrap();

        let config = load_engine_config(&path).await;
        assert_eq!(config.max_concurrent_executions, 3);
        assert_eq!(config.shutdown_grace_ms, 500);
        assert_eq!(config.max_trace_entries, EngineConfig::default().max_trace_entries);
    }

    #[tokio::test]
    async fn invalid_toml_returns_default() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("flowrun.toml");
        tokio::fs::write(&path, "this is not { valid toml !!!").await.unwrap();
        assert_eq!(load_engine_config(&path).await, EngineConfig::default());
    }

    #[tokio::test]
    async fn zero_concurrency_is_floored() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("flowrun.toml");
        tokio::fs::write(&path, "max_concurrent_executions = 0\n").await.unwrap();
        assert_eq!(load_engine_config(&path).await.max_concurrent_executions, 1);
    }
}
