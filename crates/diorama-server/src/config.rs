//! Service configuration: bind address, storage locations, and provider
//! credentials, loaded from a YAML file with `${ENV_VAR}` placeholders
//! resolved from the environment.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use diorama_provider::{ProviderConfig, ProviderKind};

fn default_bind() -> String {
    "0.0.0.0:8020".to_string()
}

fn default_database_path() -> PathBuf {
    PathBuf::from("data/diorama.db")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            database_path: default_database_path(),
            log_dir: default_log_dir(),
            // The default scene binds provider id "openai"; without a config
            // file the stub serves it so the binary runs keyless.
            providers: vec![ProviderConfig::new("openai", ProviderKind::Stub)],
        }
    }
}

impl ServiceConfig {
    /// Load from a YAML file, falling back to the keyless default when the
    /// file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let mut config: ServiceConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse yaml file: {}", path.display()))?;

        config.bind = resolve_env_var(&config.bind);
        for provider in &mut config.providers {
            if let Some(key) = provider.api_key.take() {
                let resolved = resolve_env_var(&key);
                provider.api_key = (!resolved.is_empty()).then_some(resolved);
            }
            if let Some(base) = provider.api_base.take() {
                provider.api_base = Some(resolve_env_var(&base));
            }
        }
        Ok(config)
    }
}

/// Substitute every `${NAME}` in `raw` with the value of the environment
/// variable `NAME`, empty when unset. Unterminated placeholders pass through
/// verbatim.
pub fn resolve_env_var(raw: &str) -> String {
    let mut output = String::new();
    let mut rest = raw;

    while let Some(start) = rest.find("${") {
        output.push_str(&rest[..start]);

        let candidate = &rest[start + 2..];
        let Some(end) = candidate.find('}') else {
            output.push_str(&rest[start..]);
            return output;
        };

        let key = &candidate[..end];
        output.push_str(&std::env::var(key).unwrap_or_default());
        rest = &candidate[end + 1..];
    }

    output.push_str(rest);
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use diorama_provider::ProviderKind;

    #[test]
    fn missing_file_falls_back_to_keyless_default() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = ServiceConfig::load(&tmp.path().join("absent.yaml")).unwrap();

        assert_eq!(config.bind, "0.0.0.0:8020");
        assert_eq!(config.providers.len(), 1);
        assert_eq!(config.providers[0].id, "openai");
        assert_eq!(config.providers[0].kind, ProviderKind::Stub);
    }

    #[test]
    fn env_placeholders_are_resolved() {
        std::env::set_var("DIORAMA_TEST_KEY", "sk-resolved");
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("diorama.yaml");
        std::fs::write(
            &path,
            "bind: \"127.0.0.1:9000\"\nproviders:\n  - id: openai\n    kind: openai\n    api_key: \"${DIORAMA_TEST_KEY}\"\n",
        )
        .unwrap();

        let config = ServiceConfig::load(&path).unwrap();
        assert_eq!(config.bind, "127.0.0.1:9000");
        assert_eq!(config.providers[0].api_key.as_deref(), Some("sk-resolved"));
    }

    #[test]
    fn unset_env_key_becomes_absent() {
        std::env::remove_var("DIORAMA_TEST_UNSET");
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("diorama.yaml");
        std::fs::write(
            &path,
            "providers:\n  - id: anthropic\n    kind: anthropic\n    api_key: \"${DIORAMA_TEST_UNSET}\"\n",
        )
        .unwrap();

        let config = ServiceConfig::load(&path).unwrap();
        assert_eq!(config.providers[0].api_key, None);
    }

    #[test]
    fn resolve_env_var_handles_mixed_text() {
        std::env::set_var("DIORAMA_TEST_HOST", "example.org");
        assert_eq!(
            resolve_env_var("https://${DIORAMA_TEST_HOST}/v1"),
            "https://example.org/v1"
        );
        assert_eq!(resolve_env_var("no placeholders"), "no placeholders");
        assert_eq!(resolve_env_var("broken ${OPEN"), "broken ${OPEN");
    }
}
