//! # Model Registry
//!
//! Resolves the configured keyword models once at startup and hands out
//! per-session classifiers built from them. The registry is immutable after
//! construction and shared by every session through an `Arc`.
//!
//! ## Resolution rules:
//! - An entry naming an existing file is used as-is; its keyword is the file
//!   stem (`alexa_v0.1.onnx` → `alexa_v0.1`)
//! - A bare name resolves to `<model_dir>/<name>.onnx`
//! - An empty list loads every `*.onnx` in `model_dir` except the shared
//!   feature models, sorted by file name
//!
//! Keyword order is registry order, and that is the order of the handshake.

use crate::classifier::{Classifier, ClassifierFactory};
use crate::config::{InferenceFramework, ModelsConfig};
use crate::error::{AppError, AppResult};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// File stems in `model_dir` that are pipeline stages, not keywords.
const FEATURE_MODEL_PREFIXES: [&str; 3] = ["melspectrogram", "embedding_model", "silero_vad"];

const MODEL_EXTENSION: &str = "onnx";

/// A keyword model located on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelSource {
    pub keyword: String,
    pub path: PathBuf,
}

/// Model bytes read once at startup and shared by every session.
#[derive(Debug, Clone)]
pub struct ModelBytes {
    pub keyword: String,
    pub path: PathBuf,
    pub bytes: Arc<[u8]>,
}

impl ModelBytes {
    pub fn read(keyword: impl Into<String>, path: &Path) -> AppResult<Self> {
        let bytes = fs::read(path).map_err(|e| {
            AppError::ModelLoad(format!("failed to read {}: {}", path.display(), e))
        })?;

        Ok(Self {
            keyword: keyword.into(),
            path: path.to_path_buf(),
            bytes: Arc::from(bytes),
        })
    }
}

/// Public description of one loaded model file.
#[derive(Debug, Clone, Serialize)]
pub struct ModelFileInfo {
    pub keyword: String,
    pub path: String,
    pub size_bytes: usize,
}

/// Summary served by the models endpoint.
#[derive(Debug, Serialize)]
pub struct RegistrySummary {
    pub backend: String,
    pub keywords: Vec<String>,
    pub models: Vec<ModelFileInfo>,
    pub loaded_at: DateTime<Utc>,
}

/// Startup-loaded model set and classifier factory.
pub struct ModelRegistry {
    factory: Box<dyn ClassifierFactory>,
    models: Vec<ModelFileInfo>,
    loaded_at: DateTime<Utc>,
}

impl ModelRegistry {
    /// Load every configured keyword model for the selected backend.
    pub fn load(config: &ModelsConfig, threads: usize) -> AppResult<Self> {
        match config.inference_framework {
            InferenceFramework::Tflite => Err(AppError::ConfigError(
                "inference_framework 'tflite' is not available in this build, use 'onnx'".to_string(),
            )),
            InferenceFramework::Onnx => Self::load_onnx(config, threads),
        }
    }

    #[cfg(feature = "onnx")]
    fn load_onnx(config: &ModelsConfig, threads: usize) -> AppResult<Self> {
        use crate::classifier::openwakeword::OpenWakeWordFactory;

        let sources = resolve_keyword_models(config)?;
        let keywords = sources
            .iter()
            .map(|source| ModelBytes::read(&source.keyword, &source.path))
            .collect::<AppResult<Vec<_>>>()?;

        let melspectrogram =
            ModelBytes::read("melspectrogram", &config.resolve(&config.melspectrogram_model))?;
        let embedding = ModelBytes::read("embedding", &config.resolve(&config.embedding_model))?;

        let models = keywords
            .iter()
            .map(|model| ModelFileInfo {
                keyword: model.keyword.clone(),
                path: model.path.display().to_string(),
                size_bytes: model.bytes.len(),
            })
            .collect();

        let factory = OpenWakeWordFactory::new(melspectrogram, embedding, keywords, threads)?;

        tracing::info!(
            keywords = ?factory.keywords(),
            threads,
            "Loaded openWakeWord models"
        );

        Ok(Self {
            factory: Box::new(factory),
            models,
            loaded_at: Utc::now(),
        })
    }

    #[cfg(not(feature = "onnx"))]
    fn load_onnx(config: &ModelsConfig, _threads: usize) -> AppResult<Self> {
        // Resolve anyway so a bad model list is reported before the feature hint
        let sources = resolve_keyword_models(config)?;
        Err(AppError::ConfigError(format!(
            "{} keyword model(s) configured but the server was built without the `onnx` feature",
            sources.len()
        )))
    }

    /// Build a registry around an already constructed factory.
    pub fn with_factory(factory: Box<dyn ClassifierFactory>) -> Self {
        Self {
            factory,
            models: Vec::new(),
            loaded_at: Utc::now(),
        }
    }

    pub fn keywords(&self) -> &[String] {
        self.factory.keywords()
    }

    pub fn backend(&self) -> &str {
        self.factory.backend()
    }

    /// New classifier instance for one session.
    pub fn create_classifier(&self) -> AppResult<Box<dyn Classifier>> {
        self.factory.create()
    }

    pub fn summary(&self) -> RegistrySummary {
        RegistrySummary {
            backend: self.backend().to_string(),
            keywords: self.keywords().to_vec(),
            models: self.models.clone(),
            loaded_at: self.loaded_at,
        }
    }
}

impl std::fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("backend", &self.backend())
            .field("keywords", &self.keywords())
            .finish()
    }
}

/// Turn the configured keyword list into model files, in registry order.
pub fn resolve_keyword_models(config: &ModelsConfig) -> AppResult<Vec<ModelSource>> {
    let sources = if config.wakeword_models.is_empty() {
        discover_keyword_models(Path::new(&config.model_dir))?
    } else {
        config
            .wakeword_models
            .iter()
            .map(|entry| resolve_entry(config, entry))
            .collect::<AppResult<Vec<_>>>()?
    };

    if sources.is_empty() {
        return Err(AppError::ModelLoad(format!(
            "no keyword models found in '{}'",
            config.model_dir
        )));
    }

    let mut seen = HashSet::new();
    for source in &sources {
        if !seen.insert(source.keyword.as_str()) {
            return Err(AppError::ConfigError(format!(
                "keyword '{}' is configured more than once",
                source.keyword
            )));
        }
    }

    Ok(sources)
}

fn resolve_entry(config: &ModelsConfig, entry: &str) -> AppResult<ModelSource> {
    let direct = PathBuf::from(entry);
    if direct.is_file() {
        return source_for(direct);
    }

    let by_name = config.resolve(&format!("{}.{}", entry, MODEL_EXTENSION));
    if by_name.is_file() {
        return Ok(ModelSource {
            keyword: entry.to_string(),
            path: by_name,
        });
    }

    Err(AppError::ModelLoad(format!(
        "keyword model '{}' not found (also tried {})",
        entry,
        by_name.display()
    )))
}

fn source_for(path: PathBuf) -> AppResult<ModelSource> {
    let keyword = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .filter(|stem| !stem.is_empty())
        .ok_or_else(|| {
            AppError::ModelLoad(format!("cannot derive a keyword name from {}", path.display()))
        })?
        .to_string();

    Ok(ModelSource { keyword, path })
}

fn discover_keyword_models(dir: &Path) -> AppResult<Vec<ModelSource>> {
    let entries = fs::read_dir(dir).map_err(|e| {
        AppError::ModelLoad(format!("cannot scan model directory {}: {}", dir.display(), e))
    })?;

    let mut paths = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        if path.extension().and_then(|ext| ext.to_str()) != Some(MODEL_EXTENSION) {
            continue;
        }
        let is_feature_model = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .map(|stem| FEATURE_MODEL_PREFIXES.iter().any(|prefix| stem.starts_with(prefix)))
            .unwrap_or(true);
        if !is_feature_model {
            paths.push(path);
        }
    }

    paths.sort();
    paths.into_iter().map(source_for).collect()
}
