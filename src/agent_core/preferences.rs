//! Preference persistence and resolution.
//!
//! Which provider, model and endpoint a mode uses comes from three layers:
//! what the user persisted, the static `assistant.yaml`, and the live model
//! catalog. [`resolve`] walks them in a fixed order and returns an explicit
//! [`Resolution`]; it never synthesizes a model that is not in the catalog.
//!
//! Persisted selections live in a string key-value [`PreferenceStore`] and
//! are read and written only through [`PreferenceRecord`].

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};

use rusqlite::{params, Connection, OptionalExtension};

use super::errors::PreferenceError;
use crate::inference::config::StaticConfig;
use crate::inference::types::{AiMode, ModelConfig, ModelProvider};

// ─── Store ───────────────────────────────────────────────────────────────────

/// Persisted string key-value store.
pub trait PreferenceStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, PreferenceError>;
    fn set(&self, key: &str, value: &str) -> Result<(), PreferenceError>;
    fn remove(&self, key: &str) -> Result<(), PreferenceError>;
}

/// Process-local store for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct InMemoryPreferenceStore {
    values: Mutex<HashMap<String, String>>,
}

impl InMemoryPreferenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn values(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.values.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PreferenceStore for InMemoryPreferenceStore {
    fn get(&self, key: &str) -> Result<Option<String>, PreferenceError> {
        Ok(self.values().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), PreferenceError> {
        self.values().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), PreferenceError> {
        self.values().remove(key);
        Ok(())
    }
}

/// SQLite-backed store (`preferences.db` in the app data directory).
pub struct SqlitePreferenceStore {
    conn: Mutex<Connection>,
}

impl SqlitePreferenceStore {
    /// Open (or create) the store at the given path.
    ///
    /// Pass `":memory:"` for an in-memory database (tests).
    pub fn open(path: &str) -> Result<Self, PreferenceError> {
        let conn = Connection::open(path)?;

        // WAL so a CLI and a desktop shell can share the file
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS preferences (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PreferenceStore for SqlitePreferenceStore {
    fn get(&self, key: &str) -> Result<Option<String>, PreferenceError> {
        let value = self
            .conn()
            .query_row(
                "SELECT value FROM preferences WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), PreferenceError> {
        self.conn().execute(
            "INSERT INTO preferences (key, value, updated_at) VALUES (?1, ?2, datetime('now'))
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value],
        )?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), PreferenceError> {
        self.conn()
            .execute("DELETE FROM preferences WHERE key = ?1", params![key])?;
        Ok(())
    }
}

// ─── PreferenceRecord ────────────────────────────────────────────────────────

fn provider_key(mode: AiMode) -> String {
    format!("ai.{mode}.provider")
}

fn model_key(mode: AiMode) -> String {
    format!("ai.{mode}.model")
}

fn endpoint_key(mode: AiMode, provider: ModelProvider) -> String {
    format!("ai.{mode}.endpoint.{provider}")
}

fn parse_provider(key: &str, value: &str) -> Result<ModelProvider, PreferenceError> {
    ModelProvider::parse(value.trim()).ok_or_else(|| PreferenceError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

/// Everything the user pinned for one mode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreferenceRecord {
    pub provider: Option<ModelProvider>,
    pub model_id: Option<String>,
    /// Custom endpoints, per network-backed provider.
    pub endpoints: BTreeMap<ModelProvider, String>,
}

impl PreferenceRecord {
    /// Read the record for a mode. Store failures and unreadable values
    /// degrade to absence.
    pub fn load(store: &dyn PreferenceStore, mode: AiMode) -> Self {
        let read = |key: &str| match store.get(key) {
            Ok(v) => v.filter(|s| !s.trim().is_empty()),
            Err(e) => {
                tracing::warn!(key, error = %e, "preference read failed, treating as unset");
                None
            }
        };

        let key = provider_key(mode);
        let provider = read(&key).and_then(|tag| match parse_provider(&key, &tag) {
            Ok(p) => Some(p),
            Err(e) => {
                tracing::warn!(mode = %mode, error = %e, "ignoring persisted provider");
                None
            }
        });

        let endpoints = ModelProvider::ALL
            .into_iter()
            .filter(ModelProvider::is_network_backed)
            .filter_map(|p| read(&endpoint_key(mode, p)).map(|url| (p, url)))
            .collect();

        Self {
            provider,
            model_id: read(&model_key(mode)),
            endpoints,
        }
    }

    /// Write the record for a mode; absent fields are removed from the store.
    pub fn save(&self, store: &dyn PreferenceStore, mode: AiMode) -> Result<(), PreferenceError> {
        match self.provider {
            Some(p) => store.set(&provider_key(mode), p.as_str())?,
            None => store.remove(&provider_key(mode))?,
        }
        match &self.model_id {
            Some(id) => store.set(&model_key(mode), id)?,
            None => store.remove(&model_key(mode))?,
        }
        for provider in ModelProvider::ALL.into_iter().filter(ModelProvider::is_network_backed) {
            let key = endpoint_key(mode, provider);
            match self.endpoints.get(&provider) {
                Some(url) => store.set(&key, url)?,
                None => store.remove(&key)?,
            }
        }
        Ok(())
    }

    pub fn endpoint_for(&self, provider: ModelProvider) -> Option<&str> {
        self.endpoints.get(&provider).map(String::as_str)
    }
}

// ─── Resolution ──────────────────────────────────────────────────────────────

/// Which layer supplied the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelSource {
    Persisted,
    StaticConfig,
    DefaultProvider,
    Heuristic,
}

/// Which layer supplied the endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointSource {
    Persisted,
    Model,
    StaticConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// The provider does not run over the network.
    NotRequired,
    Url { url: String, source: EndpointSource },
    /// A network provider with no endpoint anywhere: resolved but unreachable.
    Unresolved,
}

/// A resolved provider/model/endpoint for one mode.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub provider: ModelProvider,
    pub model: ModelConfig,
    pub model_source: ModelSource,
    pub endpoint: Endpoint,
}

impl Selection {
    /// The model as it should be dispatched, carrying the resolved endpoint.
    pub fn effective_model(&self) -> ModelConfig {
        let mut model = self.model.clone();
        if let Endpoint::Url { url, .. } = &self.endpoint {
            model.endpoint = Some(url.clone());
        }
        model
    }

    pub fn is_reachable(&self) -> bool {
        !matches!(self.endpoint, Endpoint::Unresolved)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnresolvedReason {
    /// No models at all.
    EmptyCatalog,
    /// Models exist but none is usable for this mode.
    NoCandidate,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Resolved(Selection),
    Unresolved(UnresolvedReason),
}

impl Resolution {
    pub fn selection(&self) -> Option<&Selection> {
        match self {
            Resolution::Resolved(s) => Some(s),
            Resolution::Unresolved(_) => None,
        }
    }
}

/// Resolve provider, model and endpoint for `mode` from the persisted store,
/// the static config and the live catalog.
pub fn resolve(
    mode: AiMode,
    available: &[ModelConfig],
    store: &dyn PreferenceStore,
    config: &StaticConfig,
) -> Resolution {
    resolve_with_record(mode, available, &PreferenceRecord::load(store, mode), config)
}

/// [`resolve`] against an already-loaded record.
pub fn resolve_with_record(
    mode: AiMode,
    available: &[ModelConfig],
    record: &PreferenceRecord,
    config: &StaticConfig,
) -> Resolution {
    if available.is_empty() {
        return Resolution::Unresolved(UnresolvedReason::EmptyCatalog);
    }

    let Some((model, model_source)) = select_model(mode, available, record, config) else {
        tracing::info!(mode = %mode, catalog = available.len(), "no model resolvable for mode");
        return Resolution::Unresolved(UnresolvedReason::NoCandidate);
    };

    let provider = model.provider;
    let endpoint = if !provider.is_network_backed() {
        Endpoint::NotRequired
    } else if let Some(url) = record.endpoint_for(provider) {
        Endpoint::Url {
            url: url.to_string(),
            source: EndpointSource::Persisted,
        }
    } else if let Some(url) = model.endpoint.as_deref().filter(|e| !e.trim().is_empty()) {
        Endpoint::Url {
            url: url.to_string(),
            source: EndpointSource::Model,
        }
    } else if let Some(url) = config.endpoint_for(provider) {
        Endpoint::Url {
            url: url.to_string(),
            source: EndpointSource::StaticConfig,
        }
    } else {
        Endpoint::Unresolved
    };

    tracing::debug!(
        mode = %mode,
        provider = %provider,
        model = %model.id,
        source = ?model_source,
        endpoint = ?endpoint,
        "resolved model preference"
    );

    Resolution::Resolved(Selection {
        provider,
        model: model.clone(),
        model_source,
        endpoint,
    })
}

fn select_model<'a>(
    mode: AiMode,
    available: &'a [ModelConfig],
    record: &PreferenceRecord,
    config: &StaticConfig,
) -> Option<(&'a ModelConfig, ModelSource)> {
    let find = |key: &str| available.iter().find(|m| m.matches_key(key));

    // 1. Persisted model for this mode
    if let Some(model) = record.model_id.as_deref().and_then(find) {
        return Some((model, ModelSource::Persisted));
    }

    // 2. Static-config model for the mode/provider pairing
    let default_provider = record.provider.or_else(|| config.default_provider(mode));
    let configured = match default_provider {
        Some(p) => config.model_for(mode, p).and_then(find),
        None => ModelProvider::ALL
            .into_iter()
            .find_map(|p| config.model_for(mode, p).and_then(find)),
    };
    if let Some(model) = configured {
        return Some((model, ModelSource::StaticConfig));
    }

    // 3. First available model of the default provider
    if let Some(provider) = default_provider {
        if let Some(model) = available
            .iter()
            .find(|m| m.provider == provider && m.is_available)
        {
            return Some((model, ModelSource::DefaultProvider));
        }
    }

    // 4. Best default for the mode
    available
        .iter()
        .find(|m| m.is_available && m.recommended_for.contains(&mode))
        .or_else(|| available.iter().find(|m| m.is_available))
        .map(|m| (m, ModelSource::Heuristic))
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::config::parse_static_config;
    use crate::inference::types::ModelParameters;

    fn model(id: &str, provider: ModelProvider, recommended: &[AiMode]) -> ModelConfig {
        ModelConfig {
            id: id.into(),
            name: id.into(),
            provider,
            model_id: format!("{id}:latest"),
            parameters: ModelParameters::default(),
            endpoint: None,
            api_key: None,
            is_available: true,
            size_bytes: None,
            recommended_for: recommended.to_vec(),
        }
    }

    fn catalog() -> Vec<ModelConfig> {
        vec![
            model("ollama-small", ModelProvider::Ollama, &[AiMode::Qa]),
            model("ollama-big", ModelProvider::Ollama, &[AiMode::Agent, AiMode::Qa]),
            model("remote", ModelProvider::OpenAiCompatible, &[AiMode::Agent]),
            model("embedded", ModelProvider::Candle, &[AiMode::Qa]),
        ]
    }

    fn selected(resolution: &Resolution) -> &Selection {
        resolution.selection().expect("expected a resolved selection")
    }

    #[test]
    fn test_persisted_model_beats_static_config() {
        let config = parse_static_config(
            "modes:\n  qa:\n    provider: ollama\n    models:\n      ollama: ollama-small\n",
        )
        .unwrap();
        let record = PreferenceRecord {
            model_id: Some("ollama-big".into()),
            ..PreferenceRecord::default()
        };

        let resolution = resolve_with_record(AiMode::Qa, &catalog(), &record, &config);
        let sel = selected(&resolution);
        assert_eq!(sel.model.id, "ollama-big");
        assert_eq!(sel.model_source, ModelSource::Persisted);
    }

    #[test]
    fn test_persisted_model_missing_from_catalog_falls_through() {
        let config = parse_static_config(
            "modes:\n  qa:\n    provider: ollama\n    models:\n      ollama: ollama-small\n",
        )
        .unwrap();
        let record = PreferenceRecord {
            model_id: Some("deleted-model".into()),
            ..PreferenceRecord::default()
        };

        let resolution = resolve_with_record(AiMode::Qa, &catalog(), &record, &config);
        let sel = selected(&resolution);
        assert_eq!(sel.model.id, "ollama-small");
        assert_eq!(sel.model_source, ModelSource::StaticConfig);
    }

    #[test]
    fn test_static_config_matches_backend_model_id() {
        let config = parse_static_config(
            "modes:\n  agent:\n    provider: ollama\n    models:\n      ollama: \"ollama-big:latest\"\n",
        )
        .unwrap();
        let resolution =
            resolve_with_record(AiMode::Agent, &catalog(), &PreferenceRecord::default(), &config);
        assert_eq!(selected(&resolution).model.id, "ollama-big");
    }

    #[test]
    fn test_default_provider_first_available_model() {
        let mut models = catalog();
        models[0].is_available = false;
        let record = PreferenceRecord {
            provider: Some(ModelProvider::Ollama),
            ..PreferenceRecord::default()
        };

        let resolution =
            resolve_with_record(AiMode::Qa, &models, &record, &StaticConfig::default());
        let sel = selected(&resolution);
        assert_eq!(sel.model.id, "ollama-big", "unavailable models are skipped");
        assert_eq!(sel.model_source, ModelSource::DefaultProvider);
    }

    #[test]
    fn test_persisted_provider_overrides_configured_provider() {
        let record = PreferenceRecord {
            provider: Some(ModelProvider::OpenAiCompatible),
            ..PreferenceRecord::default()
        };
        let resolution =
            resolve_with_record(AiMode::Qa, &catalog(), &record, &StaticConfig::default());
        assert_eq!(selected(&resolution).model.id, "remote");
    }

    #[test]
    fn test_heuristic_prefers_recommended_for_mode() {
        let config = parse_static_config("modes: {}\n").unwrap();
        let models = vec![
            model("qa-only", ModelProvider::Ollama, &[AiMode::Qa]),
            model("agentic", ModelProvider::Ollama, &[AiMode::Agent]),
        ];
        let resolution =
            resolve_with_record(AiMode::Agent, &models, &PreferenceRecord::default(), &config);
        let sel = selected(&resolution);
        assert_eq!(sel.model.id, "agentic");
        assert_eq!(sel.model_source, ModelSource::Heuristic);
    }

    #[test]
    fn test_empty_catalog_is_unresolved() {
        let record = PreferenceRecord {
            provider: Some(ModelProvider::Ollama),
            model_id: Some("ollama-big".into()),
            ..PreferenceRecord::default()
        };
        let resolution = resolve_with_record(AiMode::Qa, &[], &record, &StaticConfig::default());
        assert_eq!(resolution, Resolution::Unresolved(UnresolvedReason::EmptyCatalog));
    }

    #[test]
    fn test_no_available_model_is_no_candidate() {
        let mut models = catalog();
        for m in &mut models {
            m.is_available = false;
        }
        let config = parse_static_config("modes: {}\n").unwrap();
        let resolution =
            resolve_with_record(AiMode::Qa, &models, &PreferenceRecord::default(), &config);
        assert_eq!(resolution, Resolution::Unresolved(UnresolvedReason::NoCandidate));
    }

    #[test]
    fn test_endpoint_chain() {
        let mut models = catalog();
        models[1].endpoint = Some("http://model-host:11434".into());
        let record = PreferenceRecord {
            model_id: Some("ollama-big".into()),
            ..PreferenceRecord::default()
        };
        let config = StaticConfig::default();

        // Model endpoint beats static config
        let sel = resolve_with_record(AiMode::Qa, &models, &record, &config);
        assert_eq!(
            selected(&sel).endpoint,
            Endpoint::Url {
                url: "http://model-host:11434".into(),
                source: EndpointSource::Model
            }
        );

        // Persisted endpoint for the provider beats both
        let mut pinned = record.clone();
        pinned
            .endpoints
            .insert(ModelProvider::Ollama, "http://gpu-box:11434".into());
        let sel = resolve_with_record(AiMode::Qa, &models, &pinned, &config);
        assert_eq!(
            selected(&sel).effective_model().endpoint.as_deref(),
            Some("http://gpu-box:11434")
        );

        // Static config is the last resort
        models[1].endpoint = None;
        let sel = resolve_with_record(AiMode::Qa, &models, &record, &config);
        assert_eq!(
            selected(&sel).endpoint,
            Endpoint::Url {
                url: crate::inference::config::DEFAULT_OLLAMA_ENDPOINT.into(),
                source: EndpointSource::StaticConfig
            }
        );
    }

    #[test]
    fn test_endpoint_unresolved_but_selection_kept() {
        let record = PreferenceRecord {
            model_id: Some("remote".into()),
            ..PreferenceRecord::default()
        };
        let resolution =
            resolve_with_record(AiMode::Agent, &catalog(), &record, &StaticConfig::default());
        let sel = selected(&resolution);
        assert_eq!(sel.model.id, "remote");
        assert_eq!(sel.endpoint, Endpoint::Unresolved);
        assert!(!sel.is_reachable());
    }

    #[test]
    fn test_embedded_provider_needs_no_endpoint() {
        let record = PreferenceRecord {
            model_id: Some("embedded".into()),
            ..PreferenceRecord::default()
        };
        let resolution =
            resolve_with_record(AiMode::Qa, &catalog(), &record, &StaticConfig::default());
        assert_eq!(selected(&resolution).endpoint, Endpoint::NotRequired);
    }

    #[test]
    fn test_record_round_trip_through_store() {
        let store = InMemoryPreferenceStore::new();
        let mut record = PreferenceRecord {
            provider: Some(ModelProvider::LlamaCpp),
            model_id: Some("qwen".into()),
            ..PreferenceRecord::default()
        };
        record
            .endpoints
            .insert(ModelProvider::LlamaCpp, "http://localhost:8080".into());
        record.save(&store, AiMode::Agent).unwrap();

        assert_eq!(
            store.get("ai.agent.endpoint.llamacpp").unwrap().as_deref(),
            Some("http://localhost:8080")
        );
        assert_eq!(PreferenceRecord::load(&store, AiMode::Agent), record);
        assert_eq!(PreferenceRecord::load(&store, AiMode::Qa), PreferenceRecord::default());

        record.model_id = None;
        record.save(&store, AiMode::Agent).unwrap();
        assert_eq!(store.get("ai.agent.model").unwrap(), None);
    }

    #[test]
    fn test_unknown_persisted_provider_degrades_to_absence() {
        let store = InMemoryPreferenceStore::new();
        store.set("ai.qa.provider", "skynet").unwrap();
        store.set("ai.qa.model", "  ").unwrap();
        let record = PreferenceRecord::load(&store, AiMode::Qa);
        assert_eq!(record, PreferenceRecord::default());
    }

    #[test]
    fn test_parse_provider_rejects_unknown_tag() {
        assert_eq!(
            parse_provider("ai.qa.provider", "openai-compatible").unwrap(),
            ModelProvider::OpenAiCompatible
        );
        let err = parse_provider("ai.qa.provider", "skynet").unwrap_err();
        assert!(matches!(
            &err,
            PreferenceError::InvalidValue { key, value } if key == "ai.qa.provider" && value == "skynet"
        ));
        assert_eq!(err.to_string(), "invalid value for preference 'ai.qa.provider': 'skynet'");
    }

    #[test]
    fn test_resolve_reads_from_store() {
        let store = InMemoryPreferenceStore::new();
        store.set("ai.qa.model", "remote").unwrap();
        let resolution = resolve(AiMode::Qa, &catalog(), &store, &StaticConfig::default());
        assert_eq!(selected(&resolution).model.id, "remote");
    }

    #[test]
    fn test_sqlite_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("preferences.db");
        let path = path.to_str().unwrap();

        {
            let store = SqlitePreferenceStore::open(path).unwrap();
            store.set("ai.qa.model", "ollama-small").unwrap();
            store.set("ai.qa.model", "ollama-big").unwrap();
            store.set("ai.qa.provider", "ollama").unwrap();
            store.remove("ai.qa.provider").unwrap();
        }

        let store = SqlitePreferenceStore::open(path).unwrap();
        assert_eq!(store.get("ai.qa.model").unwrap().as_deref(), Some("ollama-big"));
        assert_eq!(store.get("ai.qa.provider").unwrap(), None);
    }

    #[test]
    fn test_sqlite_store_in_memory() {
        let store = SqlitePreferenceStore::open(":memory:").unwrap();
        assert_eq!(store.get("missing").unwrap(), None);
        store.remove("missing").unwrap();
    }
}
