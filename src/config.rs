//! # Configuration Management
//!
//! Loads the server configuration from several sources and freezes it for the
//! lifetime of the process. Nothing mutates the configuration after startup:
//! the model selection it describes is shared read-only by every session.
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Command-line flags (`--host`, `--port`, `--model-path`, ...)
//! 2. `HOST` / `PORT` environment variables (deployment platforms)
//! 3. Environment variables with the `APP_` prefix, `__` between sections
//!    (`APP_SERVER__PORT=9001`, `APP_MODELS__MODEL_DIR=/srv/models`)
//! 4. Configuration file (`config.toml`, or the file given with `--config`)
//! 5. Default values (defined in the Default impl)

use anyhow::{anyhow, Result};
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::path::PathBuf;

/// Command-line flags. Every flag is optional and overrides the layered
/// configuration when present.
#[derive(Debug, Default, Clone, Parser)]
#[command(name = "wakeword-server", version, about = "Streaming wake-word detection over WebSocket")]
pub struct CliArgs {
    /// Configuration file to read (without extension, like `config`)
    #[arg(long, default_value = "config")]
    pub config: String,

    /// Address to bind
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(long)]
    pub port: Option<u16>,

    /// Keyword model to load, by name or path (repeatable)
    #[arg(long = "model-path")]
    pub model_paths: Vec<String>,

    /// Directory holding the feature and keyword models
    #[arg(long)]
    pub model_dir: Option<String>,

    /// Inference backend
    #[arg(long, value_enum)]
    pub inference_framework: Option<InferenceFramework>,
}

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub models: ModelsConfig,
    pub audio: AudioConfig,
    pub performance: PerformanceConfig,
}

/// Where the HTTP server listens and where the WebSocket lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Path of the streaming endpoint, e.g. `/ws`
    pub ws_path: String,
}

/// Which classification backend runs and which keyword models it loads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    pub inference_framework: InferenceFramework,

    /// Directory searched for bare model names and for the feature models
    pub model_dir: String,

    /// Keyword models by name (`hey_jarvis`) or path. Empty loads every
    /// keyword model found in `model_dir`.
    pub wakeword_models: Vec<String>,

    /// Shared feature models, relative to `model_dir` unless absolute
    pub melspectrogram_model: String,
    pub embedding_model: String,
}

/// Limits on what a client may stream.
///
/// Control frames carrying an integer outside the sample-rate range are
/// treated like any other malformed control payload: logged and ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub min_sample_rate: u32,
    pub max_sample_rate: u32,
    /// Largest inbound message in bytes, applied to single frames and to
    /// reassembled fragmented messages
    pub max_frame_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    /// Upgrade requests beyond this many live sessions get a 503
    pub max_concurrent_sessions: usize,
    /// Intra-op threads per inference session
    pub classifier_threads: usize,
}

/// Supported inference backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum InferenceFramework {
    Onnx,
    Tflite,
}

impl fmt::Display for InferenceFramework {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InferenceFramework::Onnx => write!(f, "onnx"),
            InferenceFramework::Tflite => write!(f, "tflite"),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 9000,
                ws_path: "/ws".to_string(),
            },
            models: ModelsConfig {
                inference_framework: InferenceFramework::Onnx,
                model_dir: "models".to_string(),
                wakeword_models: Vec::new(),
                melspectrogram_model: "melspectrogram.onnx".to_string(),
                embedding_model: "embedding_model.onnx".to_string(),
            },
            audio: AudioConfig {
                min_sample_rate: 1_000,
                max_sample_rate: 384_000,
                max_frame_bytes: 4 * 1024 * 1024,
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 64,
                classifier_threads: 1,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from every source in priority order.
    pub fn load(cli: &CliArgs) -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name(&cli.config).required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("models.wakeword_models")
                    .try_parsing(true),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        if let Some(host) = &cli.host {
            settings = settings.set_override("server.host", host.clone())?;
        }
        if let Some(port) = cli.port {
            settings = settings.set_override("server.port", port as i64)?;
        }
        if !cli.model_paths.is_empty() {
            settings = settings.set_override("models.wakeword_models", cli.model_paths.clone())?;
        }
        if let Some(dir) = &cli.model_dir {
            settings = settings.set_override("models.model_dir", dir.clone())?;
        }
        if let Some(framework) = cli.inference_framework {
            settings = settings.set_override("models.inference_framework", framework.to_string())?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Reject configurations the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow!("Server port cannot be 0"));
        }

        if !self.server.ws_path.starts_with('/') || self.server.ws_path.len() < 2 {
            return Err(anyhow!(
                "WebSocket path must be an absolute path like /ws, got '{}'",
                self.server.ws_path
            ));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.performance.classifier_threads == 0 {
            return Err(anyhow!("Classifier threads must be greater than 0"));
        }

        if self.audio.min_sample_rate == 0 {
            return Err(anyhow!("Minimum sample rate must be greater than 0"));
        }

        if self.audio.min_sample_rate > self.audio.max_sample_rate {
            return Err(anyhow!(
                "Sample rate range is inverted: {} > {}",
                self.audio.min_sample_rate,
                self.audio.max_sample_rate
            ));
        }

        if self.audio.max_frame_bytes < 2 {
            return Err(anyhow!(
                "Max frame bytes must hold at least one sample, got {}",
                self.audio.max_frame_bytes
            ));
        }

        Ok(())
    }

    /// Address string handed to `HttpServer::bind`.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl ModelsConfig {
    /// Resolve a model file name against `model_dir` unless it is absolute.
    pub fn resolve(&self, file: &str) -> PathBuf {
        let path = PathBuf::from(file);
        if path.is_absolute() {
            path
        } else {
            PathBuf::from(&self.model_dir).join(path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.ws_path, "/ws");
        assert_eq!(config.models.inference_framework, InferenceFramework::Onnx);
        assert_eq!(config.audio.max_frame_bytes, 4_194_304);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.server.ws_path = "ws".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.min_sample_rate = 48_000;
        config.audio.max_sample_rate = 8_000;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.max_frame_bytes = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cli_overrides_defaults() {
        let cli = CliArgs::parse_from([
            "wakeword-server",
            "--config",
            "does-not-exist",
            "--port",
            "9100",
            "--model-path",
            "hey_jarvis",
            "--model-path",
            "/opt/models/alexa_v0.1.onnx",
            "--inference-framework",
            "tflite",
        ]);

        let config = AppConfig::load(&cli).unwrap();
        assert_eq!(config.server.port, 9100);
        assert_eq!(
            config.models.wakeword_models,
            vec!["hey_jarvis".to_string(), "/opt/models/alexa_v0.1.onnx".to_string()]
        );
        assert_eq!(config.models.inference_framework, InferenceFramework::Tflite);
    }

    #[test]
    fn test_resolve_model_paths() {
        let models = AppConfig::default().models;
        assert_eq!(
            models.resolve("embedding_model.onnx"),
            PathBuf::from("models").join("embedding_model.onnx")
        );
        assert_eq!(models.resolve("/abs/model.onnx"), PathBuf::from("/abs/model.onnx"));
    }
}
