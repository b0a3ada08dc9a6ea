use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;

use crate::error::ConfigError;

/// Resource bucket a model belongs to. Each tier gets its own
/// [`crate::manager::EngineManager`] and idle watchdog, so one "heavy" and
/// one "light" model can coexist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Primary,
    Secondary,
}

/// Engine kinds this build knows how to drive. Validated at config load
/// time rather than per-request.
pub(crate) const KNOWN_ENGINE_KINDS: &[&str] = &["llama.cpp"];

#[derive(Debug, Clone, Deserialize)]
pub struct LocalTokenizerSpec {
    pub binary: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra tokens of overhead assumed per chat message, added on top of
    /// the raw tokenizer count.
    #[serde(default)]
    pub add_tokens_per_message: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Variant {
    pub binary: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub connect: String,
    pub context: u32,
    #[serde(default)]
    pub tokenize: bool,
    pub engine_startup_timeout: f64,
    pub health_check_timeout: f64,
    pub engine_idle_timeout: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Model {
    pub name: String,
    #[serde(default = "default_tier")]
    pub tier: Tier,
    pub engine_kind: String,
    #[serde(default)]
    pub local_tokenizer: Option<LocalTokenizerSpec>,
    pub variants: Vec<Variant>,
}

fn default_tier() -> Tier {
    Tier::Primary
}

impl Model {
    pub fn smallest_variant_index(&self) -> usize {
        0
    }

    /// First variant (ascending context, enforced at load) whose context is
    /// at least `required`.
    pub fn variant_for(&self, required: u32) -> Option<usize> {
        self.variants.iter().position(|v| v.context >= required)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_none_addr")]
    pub listen_v4: String,
    #[serde(default = "default_none_addr")]
    pub listen_v6: String,
    #[serde(default)]
    pub dumps_dir: Option<String>,
    #[serde(default)]
    pub clear_dumps_on_start: bool,
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

fn default_none_addr() -> String {
    "none".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub models: Vec<Model>,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let raw = std::fs::read_to_string(path)?;
        let cfg: Config = serde_yaml::from_str(&raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.server.listen_v4 == "none" && self.server.listen_v6 == "none" {
            return Err(ConfigError::Invalid(
                "at least one of server.listen_v4 / server.listen_v6 must be set".into(),
            ));
        }

        let mut seen = HashSet::new();
        for model in &self.models {
            if !seen.insert(model.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate model name '{}'",
                    model.name
                )));
            }
            if model.variants.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "model '{}' has no variants",
                    model.name
                )));
            }
            if !KNOWN_ENGINE_KINDS.contains(&model.engine_kind.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "model '{}' has unsupported engine_kind '{}'",
                    model.name, model.engine_kind
                )));
            }
            let mut last_context = 0u32;
            for (i, v) in model.variants.iter().enumerate() {
                if i > 0 && v.context < last_context {
                    return Err(ConfigError::Invalid(format!(
                        "model '{}' variants must be sorted by ascending context",
                        model.name
                    )));
                }
                last_context = v.context;
            }
        }
        Ok(())
    }

    pub fn model(&self, name: &str) -> Option<&Model> {
        self.models.iter().find(|m| m.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_cfg(contents: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f
    }

    const VALID: &str = r#"
server:
  listen_v4: "127.0.0.1:8080"
models:
  - name: alpha
    engine_kind: llama.cpp
    variants:
      - binary: /bin/engine
        connect: "http://127.0.0.1:9001"
        context: 4096
        engine_startup_timeout: 30.0
        health_check_timeout: 5.0
        engine_idle_timeout: 120.0
      - binary: /bin/engine
        connect: "http://127.0.0.1:9002"
        context: 32768
        engine_startup_timeout: 30.0
        health_check_timeout: 5.0
        engine_idle_timeout: 120.0
"#;

    #[test]
    fn loads_valid_config() {
        let f = write_cfg(VALID);
        let cfg = Config::load(f.path()).unwrap();
        assert_eq!(cfg.models.len(), 1);
        assert_eq!(cfg.models[0].variants.len(), 2);
        assert!(matches!(cfg.models[0].tier, Tier::Primary));
    }

    #[test]
    fn rejects_no_listen_address() {
        let f = write_cfg(
            r#"
server:
  listen_v4: "none"
models: []
"#,
        );
        assert!(Config::load(f.path()).is_err());
    }

    #[test]
    fn rejects_unsorted_variants() {
        let f = write_cfg(
            r#"
server:
  listen_v4: "127.0.0.1:8080"
models:
  - name: alpha
    engine_kind: llama.cpp
    variants:
      - binary: /bin/engine
        connect: "http://127.0.0.1:9001"
        context: 32768
        engine_startup_timeout: 30.0
        health_check_timeout: 5.0
        engine_idle_timeout: 120.0
      - binary: /bin/engine
        connect: "http://127.0.0.1:9002"
        context: 4096
        engine_startup_timeout: 30.0
        health_check_timeout: 5.0
        engine_idle_timeout: 120.0
"#,
        );
        assert!(Config::load(f.path()).is_err());
    }

    #[test]
    fn rejects_unknown_engine_kind() {
        let f = write_cfg(
            r#"
server:
  listen_v4: "127.0.0.1:8080"
models:
  - name: alpha
    engine_kind: unknown-engine
    variants:
      - binary: /bin/engine
        connect: "http://127.0.0.1:9001"
        context: 4096
        engine_startup_timeout: 30.0
        health_check_timeout: 5.0
        engine_idle_timeout: 120.0
"#,
        );
        assert!(Config::load(f.path()).is_err());
    }

    #[test]
    fn variant_for_picks_smallest_sufficient() {
        let f = write_cfg(VALID);
        let cfg = Config::load(f.path()).unwrap();
        let model = &cfg.models[0];
        assert_eq!(model.variant_for(0), Some(0));
        assert_eq!(model.variant_for(4096), Some(0));
        assert_eq!(model.variant_for(4097), Some(1));
        assert_eq!(model.variant_for(32768), Some(1));
        assert_eq!(model.variant_for(32769), None);
    }
}
