//! Static assistant configuration loading.
//!
//! Reads `config/assistant.yaml` and resolves environment variables.
//! The file supplies the per-mode default provider and model, per-provider
//! default endpoints, and default sampling parameters. It is the last layer
//! of preference resolution: anything the user persisted wins over it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::errors::InferenceError;
use super::types::{AiMode, ModelConfig, ModelParameters, ModelProvider};

/// Default Ollama endpoint.
pub const DEFAULT_OLLAMA_ENDPOINT: &str = "http://127.0.0.1:11434";

/// Env var pointing directly at a config file.
const CONFIG_ENV_VAR: &str = "ROROAI_CONFIG";

/// Config location relative to a project root.
const CONFIG_RELATIVE_PATH: &str = "config/assistant.yaml";

// ─── Public Types ────────────────────────────────────────────────────────────

/// Defaults for one operating mode.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModeDefaults {
    #[serde(default)]
    pub provider: Option<ModelProvider>,
    /// Preferred model per provider, by catalog id or backend model id.
    #[serde(default)]
    pub models: HashMap<ModelProvider, String>,
}

/// Defaults for one provider.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderDefaults {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModesConfig {
    #[serde(default)]
    pub qa: ModeDefaults,
    #[serde(default)]
    pub agent: ModeDefaults,
}

/// Default sampling parameters for models discovered without their own.
#[derive(Debug, Clone, Deserialize)]
pub struct SamplingDefaults {
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_stream")]
    pub stream: bool,
}

fn default_temperature() -> f32 {
    0.7
}
fn default_top_p() -> f32 {
    0.9
}
fn default_max_tokens() -> u32 {
    2048
}
fn default_stream() -> bool {
    true
}

impl Default for SamplingDefaults {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            top_p: default_top_p(),
            max_tokens: default_max_tokens(),
            stream: default_stream(),
        }
    }
}

impl SamplingDefaults {
    /// Build a parameter set from these defaults.
    pub fn to_parameters(&self, context_window: Option<u32>) -> ModelParameters {
        ModelParameters {
            temperature: self.temperature,
            top_p: self.top_p,
            max_tokens: self.max_tokens,
            stream: self.stream,
            stop_sequences: None,
            context_window,
        }
    }
}

/// Top-level static configuration (mirrors `config/assistant.yaml`).
#[derive(Debug, Clone, Deserialize)]
pub struct StaticConfig {
    #[serde(default)]
    pub modes: ModesConfig,
    #[serde(default)]
    pub providers: HashMap<ModelProvider, ProviderDefaults>,
    #[serde(default)]
    pub sampling: SamplingDefaults,
}

impl Default for StaticConfig {
    /// Built-in defaults: both modes prefer the local Ollama daemon.
    fn default() -> Self {
        let ollama_mode = ModeDefaults {
            provider: Some(ModelProvider::Ollama),
            models: HashMap::new(),
        };
        let mut providers = HashMap::new();
        providers.insert(
            ModelProvider::Ollama,
            ProviderDefaults {
                endpoint: Some(DEFAULT_OLLAMA_ENDPOINT.to_string()),
                api_key: None,
            },
        );
        Self {
            modes: ModesConfig {
                qa: ollama_mode.clone(),
                agent: ollama_mode,
            },
            providers,
            sampling: SamplingDefaults::default(),
        }
    }
}

impl StaticConfig {
    pub fn mode(&self, mode: AiMode) -> &ModeDefaults {
        match mode {
            AiMode::Qa => &self.modes.qa,
            AiMode::Agent => &self.modes.agent,
        }
    }

    /// Configured default provider for a mode.
    pub fn default_provider(&self, mode: AiMode) -> Option<ModelProvider> {
        self.mode(mode).provider
    }

    /// Configured model key for a mode/provider pairing.
    pub fn model_for(&self, mode: AiMode, provider: ModelProvider) -> Option<&str> {
        self.mode(mode).models.get(&provider).map(String::as_str)
    }

    /// Configured default endpoint for a provider.
    pub fn endpoint_for(&self, provider: ModelProvider) -> Option<&str> {
        self.providers
            .get(&provider)
            .and_then(|p| p.endpoint.as_deref())
            .filter(|e| !e.trim().is_empty())
    }

    /// Configured API key for a provider.
    pub fn api_key_for(&self, provider: ModelProvider) -> Option<&str> {
        self.providers
            .get(&provider)
            .and_then(|p| p.api_key.as_deref())
            .filter(|k| !k.is_empty())
    }

    /// Catalog entries for models declared by hand for OpenAI-compatible
    /// servers, which have no discovery endpoint of their own.
    ///
    /// Only providers with a configured endpoint contribute entries.
    pub fn configured_models(&self) -> Vec<ModelConfig> {
        let mut models: Vec<ModelConfig> = Vec::new();
        for mode in [AiMode::Qa, AiMode::Agent] {
            for (&provider, model_id) in &self.mode(mode).models {
                if !matches!(provider, ModelProvider::OpenAiCompatible | ModelProvider::LlamaCpp) {
                    continue;
                }
                let Some(endpoint) = self.endpoint_for(provider) else {
                    continue;
                };

                let id = format!("{provider}-{model_id}");
                if let Some(existing) = models.iter_mut().find(|m| m.id == id) {
                    if !existing.recommended_for.contains(&mode) {
                        existing.recommended_for.push(mode);
                    }
                    continue;
                }
                models.push(ModelConfig {
                    id,
                    name: model_id.clone(),
                    provider,
                    model_id: model_id.clone(),
                    parameters: self.sampling.to_parameters(None),
                    endpoint: Some(endpoint.to_string()),
                    api_key: self.api_key_for(provider).map(String::from),
                    is_available: true,
                    size_bytes: None,
                    recommended_for: vec![mode],
                });
            }
        }
        models.sort_by(|a, b| a.id.cmp(&b.id));
        models
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Locate the static config file.
///
/// Checks `ROROAI_CONFIG` first, then searches upward from `start` for
/// `config/assistant.yaml`.
pub fn find_config_path(start: &Path) -> Result<PathBuf, InferenceError> {
    // 1. Check env var
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        let candidate = PathBuf::from(expand_tilde(&path));
        if candidate.exists() {
            return Ok(candidate);
        }
        tracing::warn!(path = %candidate.display(), "{CONFIG_ENV_VAR} points to a missing file");
    }

    // 2. Walk upward from `start`
    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(CONFIG_RELATIVE_PATH);
        if candidate.exists() {
            return Ok(candidate);
        }
        if !dir.pop() {
            break;
        }
    }

    Err(InferenceError::ConfigError {
        reason: format!("could not find {CONFIG_RELATIVE_PATH}"),
    })
}

/// Load and parse the static configuration file.
///
/// Performs environment-variable interpolation on string values matching
/// `${VAR_NAME}` or `${VAR_NAME:-default}`.
pub fn load_static_config(path: &Path) -> Result<StaticConfig, InferenceError> {
    let raw = std::fs::read_to_string(path).map_err(|e| InferenceError::ConfigError {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;

    parse_static_config(&raw)
}

/// Parse static configuration from YAML text.
pub fn parse_static_config(raw: &str) -> Result<StaticConfig, InferenceError> {
    let interpolated = interpolate_env_vars(raw);

    serde_yaml::from_str(&interpolated).map_err(|e| InferenceError::ConfigError {
        reason: format!("failed to parse config: {e}"),
    })
}

/// Find and load the config, falling back to built-in defaults.
///
/// A missing file is normal; a file that fails to parse is logged and
/// replaced by defaults rather than aborting startup.
pub fn load_or_default(start: &Path) -> StaticConfig {
    let path = match find_config_path(start) {
        Ok(p) => p,
        Err(_) => {
            tracing::info!("no assistant.yaml found, using built-in defaults");
            return StaticConfig::default();
        }
    };

    match load_static_config(&path) {
        Ok(cfg) => {
            tracing::info!(path = %path.display(), "loaded static assistant config");
            cfg
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "invalid assistant config, using defaults");
            StaticConfig::default()
        }
    }
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve a variable expression like `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    if let Some(idx) = expr.find(":-") {
        let var_name = &expr[..idx];
        let default = &expr[idx + 2..];
        std::env::var(var_name).unwrap_or_else(|_| expand_tilde(default))
    } else {
        std::env::var(expr).unwrap_or_default()
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interpolate_env_vars_with_default() {
        std::env::remove_var("__RORO_TEST_NONEXISTENT_VAR__");
        let input = "${__RORO_TEST_NONEXISTENT_VAR__:-http://localhost:9999}";
        assert_eq!(interpolate_env_vars(input), "http://localhost:9999");
    }

    #[test]
    fn test_interpolate_env_vars_with_value() {
        std::env::set_var("__RORO_TEST_ENDPOINT__", "http://gpu-box:11434");
        let input = "endpoint: ${__RORO_TEST_ENDPOINT__:-http://127.0.0.1:11434}";
        assert_eq!(interpolate_env_vars(input), "endpoint: http://gpu-box:11434");
        std::env::remove_var("__RORO_TEST_ENDPOINT__");
    }

    #[test]
    fn test_interpolate_no_vars() {
        let input = "plain text with no variables";
        assert_eq!(interpolate_env_vars(input), input);
    }

    #[test]
    fn test_expand_tilde() {
        let result = expand_tilde("~/models");
        assert!(!result.starts_with('~'), "tilde should be expanded");
        assert!(result.ends_with("/models"));
    }

    #[test]
    fn test_builtin_defaults_prefer_ollama() {
        let cfg = StaticConfig::default();
        assert_eq!(cfg.default_provider(AiMode::Qa), Some(ModelProvider::Ollama));
        assert_eq!(cfg.default_provider(AiMode::Agent), Some(ModelProvider::Ollama));
        assert_eq!(
            cfg.endpoint_for(ModelProvider::Ollama),
            Some(DEFAULT_OLLAMA_ENDPOINT)
        );
        assert_eq!(cfg.endpoint_for(ModelProvider::OpenAiCompatible), None);
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
            modes:
              qa:
                provider: ollama
                models:
                  ollama: "llama3.2:3b"
              agent:
                provider: openai-compatible
                models:
                  openai-compatible: gpt-4o-mini
            providers:
              openai-compatible:
                endpoint: "http://localhost:8080/v1"
            sampling:
              temperature: 0.2
        "#;
        let cfg = parse_static_config(yaml).unwrap();
        assert_eq!(cfg.model_for(AiMode::Qa, ModelProvider::Ollama), Some("llama3.2:3b"));
        assert_eq!(
            cfg.default_provider(AiMode::Agent),
            Some(ModelProvider::OpenAiCompatible)
        );
        assert_eq!(
            cfg.endpoint_for(ModelProvider::OpenAiCompatible),
            Some("http://localhost:8080/v1")
        );
        assert!((cfg.sampling.temperature - 0.2).abs() < f32::EPSILON);
        assert_eq!(cfg.sampling.max_tokens, 2048, "unset fields keep defaults");
    }

    #[test]
    fn test_configured_models_need_an_endpoint() {
        let yaml = r#"
            modes:
              qa:
                models:
                  ollama: "llama3.2:3b"
                  openai-compatible: gpt-4o-mini
                  llamacpp: qwen
              agent:
                models:
                  openai-compatible: gpt-4o-mini
            providers:
              openai-compatible:
                endpoint: "https://api.example.com/v1"
                api_key: sk-test
        "#;
        let cfg = parse_static_config(yaml).unwrap();
        let models = cfg.configured_models();

        assert_eq!(models.len(), 1, "ollama is discovered, llamacpp has no endpoint");
        let m = &models[0];
        assert_eq!(m.id, "openai-compatible-gpt-4o-mini");
        assert_eq!(m.endpoint.as_deref(), Some("https://api.example.com/v1"));
        assert_eq!(m.api_key.as_deref(), Some("sk-test"));
        assert!(m.recommended_for.contains(&AiMode::Qa));
        assert!(m.recommended_for.contains(&AiMode::Agent));
    }

    #[test]
    fn test_empty_endpoint_treated_as_unset() {
        std::env::remove_var("__RORO_TEST_UNSET_ENDPOINT__");
        let yaml = r#"
            providers:
              ollama:
                endpoint: "${__RORO_TEST_UNSET_ENDPOINT__}"
        "#;
        let cfg = parse_static_config(yaml).unwrap();
        assert_eq!(cfg.endpoint_for(ModelProvider::Ollama), None);
    }

    #[test]
    fn test_parse_rejects_unknown_provider() {
        let yaml = "modes:\n  qa:\n    provider: skynet\n";
        assert!(parse_static_config(yaml).is_err());
    }

    #[test]
    fn test_find_config_path_walks_upward() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("config")).unwrap();
        std::fs::write(root.path().join(CONFIG_RELATIVE_PATH), "modes: {}\n").unwrap();
        let nested = root.path().join("a/b/c");
        std::fs::create_dir_all(&nested).unwrap();

        let found = find_config_path(&nested).unwrap();
        assert_eq!(found, root.path().join(CONFIG_RELATIVE_PATH));
    }

    #[test]
    fn test_load_static_config_missing_file() {
        let result = load_static_config(Path::new("/nonexistent/assistant.yaml"));
        assert!(matches!(result, Err(InferenceError::ConfigError { .. })));
    }
}
