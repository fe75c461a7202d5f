//! Sample-rate conversion for whole windows.
//!
//! Each audio frame is converted on its own, with no filter state carried to
//! the next frame. That makes every call a small offline conversion: the
//! window is pushed through a rubato `FastFixedIn` as a single chunk, the
//! resampler is flushed, its output delay is dropped and the result is trimmed
//! to `floor(n * target / source)` samples.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};

use crate::audio::processor::{float_to_pcm, pcm_to_float};
use crate::error::{AppError, AppResult};

/// Converts one sample window between rates.
pub trait Resample: Send {
    fn resample(&self, samples: &[i16], source_rate: u32, target_rate: u32) -> AppResult<Vec<i16>>;
}

/// Number of samples a window of `input_len` samples has after conversion.
pub fn output_len(input_len: usize, source_rate: u32, target_rate: u32) -> usize {
    (input_len as u64 * target_rate as u64 / source_rate as u64) as usize
}

/// Cubic polynomial resampler backed by rubato.
#[derive(Debug, Default, Clone, Copy)]
pub struct PolynomialResampler;

impl Resample for PolynomialResampler {
    fn resample(&self, samples: &[i16], source_rate: u32, target_rate: u32) -> AppResult<Vec<i16>> {
        if source_rate == 0 || target_rate == 0 {
            return Err(AppError::Resample(format!(
                "sample rates must be positive (from={} to={})",
                source_rate, target_rate
            )));
        }
        if source_rate == target_rate || samples.is_empty() {
            return Ok(samples.to_vec());
        }

        let expected = output_len(samples.len(), source_rate, target_rate);
        if expected == 0 {
            return Ok(Vec::new());
        }

        let ratio = target_rate as f64 / source_rate as f64;
        let mut resampler = FastFixedIn::<f32>::new(
            ratio,
            1.0, // fixed ratio
            PolynomialDegree::Cubic,
            samples.len(),
            1, // mono
        )
        .map_err(|e| AppError::Resample(format!("resampler init: {e}")))?;

        let delay = resampler.output_delay();
        let input = vec![pcm_to_float(samples)];

        let mut output = resampler
            .process(&input, None)
            .map_err(|e| AppError::Resample(format!("resampler process: {e}")))?
            .into_iter()
            .next()
            .unwrap_or_default();

        // Flush whatever is still inside the filter.
        let tail = resampler
            .process_partial(None::<&[Vec<f32>]>, None)
            .map_err(|e| AppError::Resample(format!("resampler flush: {e}")))?;
        if let Some(channel) = tail.into_iter().next() {
            output.extend(channel);
        }

        let mut converted: Vec<f32> = output.into_iter().skip(delay).take(expected).collect();
        converted.resize(expected, 0.0);

        tracing::trace!(
            source_rate,
            target_rate,
            input = samples.len(),
            output = converted.len(),
            "resampled window"
        );

        Ok(float_to_pcm(&converted))
    }
}
