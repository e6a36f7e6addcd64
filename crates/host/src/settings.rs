//! Settings file precondition.
//!
//! The kernel reads `settings.json` from the user-data directory on startup.
//! Before the first launch the host checks that the file exists and matches
//! the shape the kernel expects; otherwise the bundled default file is copied
//! over it. Field-level semantics belong to the kernel.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid settings: {0}")]
    Schema(String),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub search_settings: SearchSettings,
    pub local_model_management: LocalModelManagement,
    pub conversation_settings: ConversationSettings,
    pub performance: Performance,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchSettings {
    pub search_limit: f64,
    pub embedding_config: ConfigList<EmbeddingConfig>,
    pub rerank_config: ConfigList<RerankConfig>,
}

#[derive(Debug, Deserialize)]
pub struct ConfigList<T> {
    pub configs: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddingConfig {
    pub name: String,
    pub model_name: String,
    pub input_length: f64,
    pub selected: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RerankConfig {
    pub model_name: String,
    pub selected: bool,
}

#[derive(Debug, Deserialize)]
pub struct LocalModelManagement {
    pub models: Vec<LocalModel>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelType {
    Embedding,
    Rerank,
    Generation,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalModel {
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub kind: ModelType,
    pub file_size: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSettings {
    pub generation_model: Vec<GenerationModel>,
    pub history_length: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationModel {
    pub name: String,
    pub model_name: String,
    pub url: String,
    pub set_api_key: bool,
    pub last_used: bool,
}

#[derive(Debug, Deserialize)]
pub struct Performance {
    #[serde(rename = "maxThreads")]
    pub max_threads: f64,
    #[serde(rename = "cuda available")]
    pub cuda_available: bool,
    #[serde(rename = "useCuda")]
    pub use_cuda: bool,
    #[serde(rename = "coreML available")]
    pub core_ml_available: bool,
    #[serde(rename = "useCoreML")]
    pub use_core_ml: bool,
}

/// Parse and check a settings document.
pub fn validate_settings(value: Value) -> Result<Settings, SettingsError> {
    let settings: Settings =
        serde_json::from_value(value).map_err(|e| SettingsError::Schema(e.to_string()))?;

    let mut embedding_names = HashSet::new();
    for cfg in &settings.search_settings.embedding_config.configs {
        require_non_empty(&cfg.name, "embedding config name")?;
        require_non_empty(&cfg.model_name, "embedding config modelName")?;
        if !embedding_names.insert(cfg.name.as_str()) {
            return Err(SettingsError::Schema(format!(
                "duplicate embedding config name {:?}",
                cfg.name
            )));
        }
    }

    let rerank = &settings.search_settings.rerank_config.configs;
    for cfg in rerank {
        require_non_empty(&cfg.model_name, "rerank config modelName")?;
    }
    require_single_selected(rerank.iter().map(|c| c.selected), "rerank config")?;

    let mut model_names = HashSet::new();
    for model in &settings.local_model_management.models {
        require_non_empty(&model.name, "local model name")?;
        require_non_empty(&model.path, "local model path")?;
        if !model_names.insert(model.name.as_str()) {
            return Err(SettingsError::Schema(format!(
                "duplicate local model name {:?}",
                model.name
            )));
        }
        if !Path::new(&model.path).is_dir() {
            return Err(SettingsError::Schema(format!(
                "local model {:?} path {:?} is not a directory",
                model.name, model.path
            )));
        }
    }

    let referenced = settings
        .search_settings
        .embedding_config
        .configs
        .iter()
        .map(|c| c.model_name.as_str())
        .chain(rerank.iter().map(|c| c.model_name.as_str()));
    for model_name in referenced {
        if !model_names.contains(model_name) {
            return Err(SettingsError::Schema(format!(
                "model {model_name:?} is not a local model"
            )));
        }
    }

    let mut generation_names = HashSet::new();
    let generation = &settings.conversation_settings.generation_model;
    for model in generation {
        require_non_empty(&model.name, "generation model name")?;
        require_non_empty(&model.model_name, "generation modelName")?;
        require_non_empty(&model.url, "generation model url")?;
        if !generation_names.insert(model.name.as_str()) {
            return Err(SettingsError::Schema(format!(
                "duplicate generation model name {:?}",
                model.name
            )));
        }
    }
    require_single_selected(generation.iter().map(|m| m.last_used), "generation model lastUsed")?;

    Ok(settings)
}

fn require_non_empty(value: &str, what: &str) -> Result<(), SettingsError> {
    if value.is_empty() {
        return Err(SettingsError::Schema(format!("{what} is empty")));
    }
    Ok(())
}

/// Exactly one flag set, unless there are none at all.
fn require_single_selected(
    flags: impl Iterator<Item = bool>,
    what: &str,
) -> Result<(), SettingsError> {
    let (total, selected) = flags.fold((0usize, 0usize), |(t, s), f| (t + 1, s + usize::from(f)));
    if total > 0 && selected != 1 {
        return Err(SettingsError::Schema(format!(
            "{what}: expected exactly one selected, found {selected}"
        )));
    }
    Ok(())
}

pub fn read_settings(path: &Path) -> Result<Settings, SettingsError> {
    validate_settings(read_json(path)?)
}

/// Parse a settings document without checking its shape.
pub fn read_json(path: &Path) -> Result<Value, SettingsError> {
    let raw = std::fs::read_to_string(path).map_err(|source| SettingsError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| SettingsError::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// Replace the `performance` section of the stored settings, leaving the rest untouched.
pub fn update_performance(path: &Path, performance: Value) -> Result<(), SettingsError> {
    let mut settings = read_json(path)?;
    let Some(sections) = settings.as_object_mut() else {
        return Err(SettingsError::Schema(format!(
            "{} is not a JSON object",
            path.display()
        )));
    };
    sections.insert("performance".to_string(), performance);
    write_json(path, &settings)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingsAction {
    Kept,
    CopiedMissing,
    CopiedInvalid(String),
}

/// Make sure `settings_path` holds usable settings, copying `default_path` over it if not.
pub fn ensure_settings(
    settings_path: &Path,
    default_path: &Path,
) -> Result<SettingsAction, SettingsError> {
    let action = if !settings_path.exists() {
        SettingsAction::CopiedMissing
    } else {
        match read_settings(settings_path) {
            Ok(_) => return Ok(SettingsAction::Kept),
            Err(e) => SettingsAction::CopiedInvalid(e.to_string()),
        }
    };

    match &action {
        SettingsAction::CopiedInvalid(reason) => warn!(
            component = "settings",
            event = "settings.invalid",
            path = %settings_path.display(),
            reason = %reason,
            "Settings invalid, restoring defaults"
        ),
        _ => info!(
            component = "settings",
            event = "settings.missing",
            path = %settings_path.display(),
            "Settings missing, installing defaults"
        ),
    }

    if let Some(parent) = settings_path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| SettingsError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    std::fs::copy(default_path, settings_path).map_err(|source| SettingsError::Io {
        path: default_path.to_path_buf(),
        source,
    })?;
    Ok(action)
}

/// Write a settings document as compact JSON.
pub fn write_json(path: &Path, value: &Value) -> Result<(), SettingsError> {
    let body = serde_json::to_vec(value).map_err(|source| SettingsError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    std::fs::write(path, body).map_err(|source| SettingsError::Io {
        path: path.to_path_buf(),
        source,
    })
}
