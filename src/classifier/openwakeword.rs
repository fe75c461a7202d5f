//! openWakeWord streaming pipeline on ONNX Runtime.
//!
//! Three model stages run per 80 ms chunk of 16 kHz audio:
//!
//! | Stage          | Input            | Output         |
//! |----------------|------------------|----------------|
//! | melspectrogram | `[1, n]` f32     | `[.., frames, 32]` |
//! | embedding      | `[1, 76, 32, 1]` | `[.., 96]`     |
//! | keyword        | `[1, 16, 96]`    | `[1, 1]` score |
//!
//! The feature models are shared by every keyword. Each session owns its own
//! ONNX sessions and rolling buffers, built from bytes loaded once at startup.

use std::collections::VecDeque;

use ndarray::{ArrayD, IxDyn};
use ort::session::builder::SessionBuilder;
use ort::session::{Session, SessionInputValue};
use ort::value::Value;
use tracing::{debug, info};

use crate::classifier::registry::ModelBytes;
use crate::classifier::{ActivationResult, Classifier, ClassifierFactory};
use crate::error::{AppError, AppResult};

/// Samples per processing step (80 ms at 16 kHz).
pub const CHUNK_SAMPLES: usize = 1280;
/// Extra raw samples fed to the melspectrogram model for context.
const MEL_CONTEXT_SAMPLES: usize = 160 * 3;
const MEL_BINS: usize = 32;
/// Mel frames per embedding window.
const MEL_WINDOW: usize = 76;
/// Mel frames between consecutive embedding windows.
const MEL_STEP: usize = 8;
const MEL_BUFFER_FRAMES: usize = 10 * 97;
const EMBEDDING_DIM: usize = 96;
const FEATURE_BUFFER_FRAMES: usize = 120;
/// Embeddings per keyword prediction.
const FEATURE_FRAMES: usize = 16;
const RAW_BUFFER_SAMPLES: usize = 16_000 * 10;
/// Predictions forced to zero after a classifier is created.
const WARMUP_PREDICTIONS: usize = 5;
const SCORE_HISTORY: usize = 30;
/// Audio used to prefill the feature buffer (4 s).
const PREFILL_SAMPLES: usize = 16_000 * 4;

/// One ONNX model with a single f32 input.
struct OnnxModel {
    session: Session,
    input_name: String,
}

impl OnnxModel {
    fn from_bytes(model: &ModelBytes, threads: usize) -> AppResult<Self> {
        let session = SessionBuilder::new()
            .map_err(|e| model_error(model, e))?
            .with_intra_threads(threads)
            .map_err(|e| model_error(model, e))?
            .commit_from_memory(&model.bytes)
            .map_err(|e| model_error(model, e))?;

        let input_name = session
            .inputs()
            .first()
            .map(|input| input.name().to_string())
            .ok_or_else(|| {
                AppError::ModelLoad(format!("{} has no inputs", model.path.display()))
            })?;

        Ok(Self { session, input_name })
    }

    /// Run the model and return the first output flattened.
    fn run(&mut self, shape: &[usize], data: Vec<f32>) -> AppResult<Vec<f32>> {
        let array = ArrayD::from_shape_vec(IxDyn(shape), data)
            .map_err(|e| AppError::Classifier(e.to_string()))?;
        let value = Value::from_array(array)
            .map_err(|e: ort::Error| AppError::Classifier(e.to_string()))?;

        let inputs: Vec<(String, SessionInputValue<'_>)> =
            vec![(self.input_name.clone(), value.into())];

        let outputs = self
            .session
            .run(inputs)
            .map_err(|e| AppError::Classifier(e.to_string()))?;
        let (_, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| AppError::Classifier(e.to_string()))?;

        Ok(data.to_vec())
    }
}

fn model_error(model: &ModelBytes, err: impl std::fmt::Display) -> AppError {
    AppError::ModelLoad(format!("{}: {}", model.path.display(), err))
}

/// Tracks how many whole chunks are ready and keeps the leftover samples.
#[derive(Debug, Default)]
struct ChunkAccumulator {
    remainder: Vec<f32>,
    accumulated: usize,
}

impl ChunkAccumulator {
    /// Accept new samples; returns the samples that now belong to whole
    /// chunks and should be appended to the raw buffer.
    fn push(&mut self, samples: &[f32]) -> Vec<f32> {
        let mut incoming = std::mem::take(&mut self.remainder);
        incoming.extend_from_slice(samples);

        let total = self.accumulated + incoming.len();
        if total < CHUNK_SAMPLES {
            self.accumulated = total;
            return incoming;
        }

        let leftover = total % CHUNK_SAMPLES;
        let keep = incoming.len().saturating_sub(leftover);
        self.remainder = incoming.split_off(keep);
        self.accumulated += incoming.len();
        incoming
    }

    /// Number of buffered samples forming whole chunks, if any.
    fn ready(&self) -> Option<usize> {
        (self.accumulated >= CHUNK_SAMPLES && self.accumulated % CHUNK_SAMPLES == 0)
            .then_some(self.accumulated)
    }

    fn pending(&self) -> usize {
        self.accumulated
    }

    fn reset(&mut self) {
        self.accumulated = 0;
    }
}

/// Start index of the `i`-th most recent window of `len` rows ending
/// `step * i` rows before the end of a buffer of `total` rows.
fn window_start(total: usize, len: usize, step: usize, i: usize) -> Option<usize> {
    total.checked_sub(step * i)?.checked_sub(len)
}

fn trim_front<T>(buffer: &mut Vec<T>, cap: usize) {
    if buffer.len() > cap {
        let excess = buffer.len() - cap;
        buffer.drain(..excess);
    }
}

/// Melspectrogram and embedding stages with their rolling buffers.
struct FeatureExtractor {
    melspectrogram: OnnxModel,
    embedding: OnnxModel,
    accumulator: ChunkAccumulator,
    raw: Vec<f32>,
    mel: Vec<[f32; MEL_BINS]>,
    features: Vec<[f32; EMBEDDING_DIM]>,
}

impl FeatureExtractor {
    fn new(melspectrogram: OnnxModel, embedding: OnnxModel) -> AppResult<Self> {
        let mut extractor = Self {
            melspectrogram,
            embedding,
            accumulator: ChunkAccumulator::default(),
            raw: Vec::with_capacity(RAW_BUFFER_SAMPLES),
            mel: vec![[1.0; MEL_BINS]; MEL_WINDOW],
            features: Vec::with_capacity(FEATURE_BUFFER_FRAMES),
        };
        extractor.prefill()?;
        Ok(extractor)
    }

    /// Seed the feature buffer with embeddings of low-level noise so the
    /// first keyword windows are full.
    fn prefill(&mut self) -> AppResult<()> {
        let noise = pseudo_noise(PREFILL_SAMPLES, 1_000.0);
        let mel = self.melspectrogram(&noise)?;

        let mut start = 0;
        while start + MEL_WINDOW <= mel.len() {
            let embedding = self.embed(&mel[start..start + MEL_WINDOW])?;
            self.features.push(embedding);
            start += MEL_STEP;
        }
        trim_front(&mut self.features, FEATURE_BUFFER_FRAMES);
        Ok(())
    }

    fn melspectrogram(&mut self, samples: &[f32]) -> AppResult<Vec<[f32; MEL_BINS]>> {
        let output = self
            .melspectrogram
            .run(&[1, samples.len()], samples.to_vec())?;

        Ok(output
            .chunks_exact(MEL_BINS)
            .map(|frame| {
                let mut row = [0.0; MEL_BINS];
                for (dst, &x) in row.iter_mut().zip(frame) {
                    *dst = x / 10.0 + 2.0;
                }
                row
            })
            .collect())
    }

    fn embed(&mut self, window: &[[f32; MEL_BINS]]) -> AppResult<[f32; EMBEDDING_DIM]> {
        let data: Vec<f32> = window.iter().flatten().copied().collect();
        let output = self.embedding.run(&[1, MEL_WINDOW, MEL_BINS, 1], data)?;

        if output.len() < EMBEDDING_DIM {
            return Err(AppError::Classifier(format!(
                "embedding model returned {} values, expected {}",
                output.len(),
                EMBEDDING_DIM
            )));
        }
        let mut embedding = [0.0; EMBEDDING_DIM];
        embedding.copy_from_slice(&output[..EMBEDDING_DIM]);
        Ok(embedding)
    }

    /// Feed 16 kHz samples; returns how many samples were turned into
    /// features, or the pending count when no whole chunk was ready.
    fn push(&mut self, samples: &[f32]) -> AppResult<usize> {
        let whole = self.accumulator.push(samples);
        self.raw.extend_from_slice(&whole);
        trim_front(&mut self.raw, RAW_BUFFER_SAMPLES);

        let Some(ready) = self.accumulator.ready() else {
            return Ok(self.accumulator.pending());
        };

        let context = (ready + MEL_CONTEXT_SAMPLES).min(self.raw.len());
        let tail = self.raw[self.raw.len() - context..].to_vec();
        let frames = self.melspectrogram(&tail)?;
        self.mel.extend(frames);
        trim_front(&mut self.mel, MEL_BUFFER_FRAMES);

        let chunks = ready / CHUNK_SAMPLES;
        for i in (0..chunks).rev() {
            let Some(start) = window_start(self.mel.len(), MEL_WINDOW, MEL_STEP, i) else {
                continue;
            };
            let window = self.mel[start..start + MEL_WINDOW].to_vec();
            let embedding = self.embed(&window)?;
            self.features.push(embedding);
        }
        trim_front(&mut self.features, FEATURE_BUFFER_FRAMES);

        self.accumulator.reset();
        Ok(ready)
    }

    /// The 16 embeddings ending `offset` frames before the newest one.
    fn window(&self, offset: usize) -> Option<Vec<f32>> {
        let start = window_start(self.features.len(), FEATURE_FRAMES, 1, offset)?;
        Some(
            self.features[start..start + FEATURE_FRAMES]
                .iter()
                .flatten()
                .copied()
                .collect(),
        )
    }
}

/// One keyword model and its score history.
struct KeywordDetector {
    keyword: String,
    model: OnnxModel,
    history: VecDeque<f32>,
}

impl KeywordDetector {
    fn score(&mut self, window: Vec<f32>) -> AppResult<f32> {
        let output = self.model.run(&[1, FEATURE_FRAMES, EMBEDDING_DIM], window)?;
        match output.as_slice() {
            [score] => Ok(*score),
            other => Err(AppError::Classifier(format!(
                "keyword model '{}' returned {} scores, expected 1",
                self.keyword,
                other.len()
            ))),
        }
    }

    fn record(&mut self, score: f32) -> f32 {
        let reported = if self.history.len() < WARMUP_PREDICTIONS {
            0.0
        } else {
            score
        };
        self.history.push_back(reported);
        if self.history.len() > SCORE_HISTORY {
            self.history.pop_front();
        }
        reported
    }

    fn last(&self) -> f32 {
        self.history.back().copied().unwrap_or(0.0)
    }
}

/// Per-session openWakeWord classifier.
pub struct OpenWakeWordClassifier {
    features: FeatureExtractor,
    detectors: Vec<KeywordDetector>,
}

impl Classifier for OpenWakeWordClassifier {
    fn classify(&mut self, window: &[i16]) -> AppResult<ActivationResult> {
        let samples: Vec<f32> = window.iter().map(|&s| s as f32).collect();
        let prepared = self.features.push(&samples)?;

        let mut result = ActivationResult::new();
        for detector in &mut self.detectors {
            let score = if prepared > CHUNK_SAMPLES {
                let mut best: Option<f32> = None;
                for offset in (0..prepared / CHUNK_SAMPLES).rev() {
                    if let Some(features) = self.features.window(offset) {
                        let score = detector.score(features)?;
                        best = Some(best.map_or(score, |b| b.max(score)));
                    }
                }
                best.unwrap_or(0.0)
            } else if prepared == CHUNK_SAMPLES {
                match self.features.window(0) {
                    Some(features) => detector.score(features)?,
                    None => 0.0,
                }
            } else {
                detector.last()
            };

            let reported = detector.record(score);
            result.push(detector.keyword.clone(), reported);
        }

        Ok(result)
    }
}

/// Builds classifiers from the model bytes loaded at startup.
pub struct OpenWakeWordFactory {
    melspectrogram: ModelBytes,
    embedding: ModelBytes,
    models: Vec<ModelBytes>,
    keywords: Vec<String>,
    threads: usize,
}

impl OpenWakeWordFactory {
    /// Create the factory and build one classifier to validate every model,
    /// including that each keyword model yields a single score.
    pub fn new(
        melspectrogram: ModelBytes,
        embedding: ModelBytes,
        models: Vec<ModelBytes>,
        threads: usize,
    ) -> AppResult<Self> {
        let keywords = models.iter().map(|m| m.keyword.clone()).collect();
        let factory = Self {
            melspectrogram,
            embedding,
            models,
            keywords,
            threads,
        };

        let mut probe = factory.build()?;
        for detector in &mut probe.detectors {
            detector
                .score(vec![0.0; FEATURE_FRAMES * EMBEDDING_DIM])
                .map_err(|e| AppError::ModelLoad(e.to_string()))?;
        }
        info!(keywords = factory.keywords.len(), "Validated keyword models");

        Ok(factory)
    }

    fn build(&self) -> AppResult<OpenWakeWordClassifier> {
        let melspectrogram = OnnxModel::from_bytes(&self.melspectrogram, self.threads)?;
        let embedding = OnnxModel::from_bytes(&self.embedding, self.threads)?;
        let features = FeatureExtractor::new(melspectrogram, embedding)?;

        let detectors = self
            .models
            .iter()
            .map(|model| {
                Ok(KeywordDetector {
                    keyword: model.keyword.clone(),
                    model: OnnxModel::from_bytes(model, self.threads)?,
                    history: VecDeque::with_capacity(SCORE_HISTORY),
                })
            })
            .collect::<AppResult<Vec<_>>>()?;

        debug!(detectors = detectors.len(), "Built openWakeWord classifier");
        Ok(OpenWakeWordClassifier { features, detectors })
    }
}

impl ClassifierFactory for OpenWakeWordFactory {
    fn keywords(&self) -> &[String] {
        &self.keywords
    }

    fn backend(&self) -> &str {
        "onnx"
    }

    fn create(&self) -> AppResult<Box<dyn Classifier>> {
        Ok(Box::new(self.build()?))
    }
}

/// Deterministic noise in `[-amplitude, amplitude)` (xorshift32).
fn pseudo_noise(len: usize, amplitude: f32) -> Vec<f32> {
    let mut state: u32 = 0x9E37_79B9;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            (state as f32 / u32::MAX as f32) * 2.0 * amplitude - amplitude
        })
        .collect()
}
