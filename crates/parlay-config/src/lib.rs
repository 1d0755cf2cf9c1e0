use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config failed: {0}")]
    Read(String),
    #[error("parse config failed: {0}")]
    Parse(String),
    #[error("schema load failed: {0}")]
    SchemaLoad(String),
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),
    #[error("unsupported config: {0}")]
    UnsupportedConfig(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: Server,
    pub store: Store,
    pub realtime: Realtime,
    pub generator: Generator,
    #[serde(default)]
    pub timing: Timing,
    #[serde(default)]
    pub policy: Policy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub listen_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Store {
    #[serde(rename = "type")]
    pub kind: String,
    pub sqlite_path: Option<String>,
}

/// The realtime notification channel: match notices and relayed messages are
/// posted here as GraphQL-shaped mutations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Realtime {
    pub endpoint: String,
    pub api_key_env: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Generator {
    pub endpoint: String,
    pub model: String,
    pub api_key_env: String,
    pub instructions_path: String,
    #[serde(default = "default_generator_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_cache_ttl_ms")]
    pub cache_ttl_ms: u64,
}

/// Typing-simulation knobs. The delay cap must stay below the host
/// invocation's own execution ceiling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timing {
    #[serde(default = "default_typing_speed_cps")]
    pub typing_speed_cps: f64,
    #[serde(default = "default_min_thinking_seconds")]
    pub min_thinking_seconds: f64,
    #[serde(default = "default_max_random_thinking_seconds")]
    pub max_random_thinking_seconds: f64,
    #[serde(default = "default_max_delay_seconds")]
    pub max_delay_seconds: f64,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            typing_speed_cps: default_typing_speed_cps(),
            min_thinking_seconds: default_min_thinking_seconds(),
            max_random_thinking_seconds: default_max_random_thinking_seconds(),
            max_delay_seconds: default_max_delay_seconds(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            history_limit: default_history_limit(),
        }
    }
}

fn default_generator_timeout_ms() -> u64 {
    30_000
}

fn default_cache_ttl_ms() -> u64 {
    300_000
}

fn default_typing_speed_cps() -> f64 {
    7.0
}

fn default_min_thinking_seconds() -> f64 {
    1.0
}

fn default_max_random_thinking_seconds() -> f64 {
    2.5
}

fn default_max_delay_seconds() -> f64 {
    15.0
}

fn default_history_limit() -> usize {
    30
}

pub fn load_and_validate(path: &str) -> Result<Config, ConfigError> {
    let config_text =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
    let value: serde_yaml::Value =
        serde_yaml::from_str(&config_text).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let instance = serde_json::to_value(value).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_against_schema(&instance)?;

    let cfg: Config =
        serde_json::from_value(instance).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_runtime_support(&cfg)?;
    Ok(cfg)
}

fn validate_against_schema(instance: &serde_json::Value) -> Result<(), ConfigError> {
    let schema_path = [
        std::path::PathBuf::from("config/config.schema.json"),
        std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .join("config/config.schema.json"),
    ]
    .into_iter()
    .find(|p| p.exists())
    .ok_or_else(|| {
        ConfigError::SchemaLoad(
            "config schema not found at config/config.schema.json or workspace config path"
                .to_string(),
        )
    })?;

    let schema_text =
        std::fs::read_to_string(schema_path).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    let schema: serde_json::Value =
        serde_json::from_str(&schema_text).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;

    let validator =
        jsonschema::validator_for(&schema).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    if let Err(first) = validator.validate(instance) {
        return Err(ConfigError::SchemaValidation(first.to_string()));
    }
    Ok(())
}

fn validate_runtime_support(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.store.kind != "memory" && cfg.store.kind != "sqlite" {
        return Err(ConfigError::UnsupportedConfig(format!(
            "store.type={} is not implemented; supported: memory, sqlite",
            cfg.store.kind
        )));
    }
    if cfg.store.kind == "memory" && cfg.store.sqlite_path.is_some() {
        return Err(ConfigError::UnsupportedConfig(
            "store.sqlite_path is not supported when store.type=memory".to_string(),
        ));
    }
    if cfg.store.kind == "sqlite"
        && cfg
            .store
            .sqlite_path
            .as_ref()
            .map(|v| v.trim().is_empty())
            .unwrap_or(true)
    {
        return Err(ConfigError::UnsupportedConfig(
            "store.sqlite_path is required when store.type=sqlite".to_string(),
        ));
    }
    if !(cfg.timing.typing_speed_cps > 0.0) {
        return Err(ConfigError::UnsupportedConfig(
            "timing.typing_speed_cps must be > 0".to_string(),
        ));
    }
    if cfg.timing.min_thinking_seconds < 0.0 || cfg.timing.max_random_thinking_seconds < 0.0 {
        return Err(ConfigError::UnsupportedConfig(
            "timing thinking seconds must be >= 0".to_string(),
        ));
    }
    if cfg.timing.max_delay_seconds < cfg.timing.min_thinking_seconds {
        return Err(ConfigError::UnsupportedConfig(
            "timing.max_delay_seconds must be >= timing.min_thinking_seconds".to_string(),
        ));
    }
    if cfg.policy.history_limit == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "policy.history_limit must be >= 1".to_string(),
        ));
    }
    if cfg.generator.timeout_ms == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "generator.timeout_ms must be >= 1".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn write_temp_config(contents: &str) -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before unix epoch")
            .as_nanos();
        let path = std::env::temp_dir().join(format!("parlay-config-test-{nanos}.yaml"));
        std::fs::write(&path, contents).expect("write temp config");
        path.to_string_lossy().to_string()
    }

    fn base_yaml() -> String {
        r#"
server:
  listen_addr: "127.0.0.1:0"

store:
  type: "memory"

realtime:
  endpoint: "http://127.0.0.1:9/graphql"
  api_key_env: "PARLAY_REALTIME_API_KEY"

generator:
  endpoint: "http://127.0.0.1:9/v1/responses"
  model: "gpt-5.2"
  api_key_env: "PARLAY_GENERATOR_API_KEY"
  instructions_path: "./config/instructions.txt"

timing:
  typing_speed_cps: 7.0
  min_thinking_seconds: 1.0
  max_random_thinking_seconds: 2.5
  max_delay_seconds: 15.0

policy:
  history_limit: 30
"#
        .to_string()
    }

    #[test]
    fn accepts_base_config_with_defaults() {
        let path = write_temp_config(&base_yaml());
        let cfg = load_and_validate(&path).expect("base config should be accepted");
        assert_eq!(cfg.store.kind, "memory");
        assert_eq!(cfg.generator.timeout_ms, 30_000);
        assert_eq!(cfg.policy.history_limit, 30);
    }

    #[test]
    fn supports_sqlite_store_type_with_path() {
        let path = write_temp_config(&base_yaml().replace(
            "type: \"memory\"",
            "type: \"sqlite\"\n  sqlite_path: \"./a.db\"",
        ));
        let cfg = load_and_validate(&path).expect("sqlite config should be accepted");
        assert_eq!(cfg.store.kind, "sqlite");
        assert_eq!(cfg.store.sqlite_path.as_deref(), Some("./a.db"));
    }

    #[test]
    fn rejects_sqlite_path_when_memory() {
        let path = write_temp_config(&base_yaml().replace(
            "type: \"memory\"",
            "type: \"memory\"\n  sqlite_path: \"./a.db\"",
        ));
        let err = load_and_validate(&path).expect_err("expected unsupported config");
        assert!(matches!(
            err,
            ConfigError::SchemaValidation(_) | ConfigError::UnsupportedConfig(_)
        ));
    }

    #[test]
    fn rejects_zero_typing_speed() {
        let path = write_temp_config(
            &base_yaml().replace("typing_speed_cps: 7.0", "typing_speed_cps: 0.0"),
        );
        let err = load_and_validate(&path).expect_err("expected unsupported config");
        assert!(matches!(
            err,
            ConfigError::SchemaValidation(_) | ConfigError::UnsupportedConfig(_)
        ));
    }

    #[test]
    fn rejects_delay_cap_below_minimum_thinking() {
        let path = write_temp_config(
            &base_yaml().replace("max_delay_seconds: 15.0", "max_delay_seconds: 0.5"),
        );
        let err = load_and_validate(&path).expect_err("expected unsupported config");
        assert!(matches!(err, ConfigError::UnsupportedConfig(_)));
    }

    #[test]
    fn rejects_unknown_store_kind() {
        let path = write_temp_config(&base_yaml().replace("\"memory\"", "\"dynamo\""));
        let err = load_and_validate(&path).expect_err("expected unsupported config");
        assert!(matches!(
            err,
            ConfigError::SchemaValidation(_) | ConfigError::UnsupportedConfig(_)
        ));
    }
}
