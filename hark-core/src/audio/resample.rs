//! Sample-rate conversion to the model rate using a rubato `FastFixedIn`
//! resampler.
//!
//! The engine consumes 16 kHz mono f32. Callers holding PCM at another rate
//! convert it here before handing it to [`crate::State::pcm_to_mel`] or
//! [`crate::engine::full`].
//!
//! When the source rate already matches, `RateConverter` is a passthrough
//! and no rubato session is created at all.
//!
//! ```ignore
//! let pcm_16k = to_model_rate(&pcm_48k, 48_000)?;
//! ```

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::{debug, error};

use super::SAMPLE_RATE;
use crate::error::{HarkError, Result};

/// Input frames per rubato call for whole-buffer conversion.
const OFFLINE_CHUNK: usize = 1_024;

/// Streams f32 mono audio from one fixed sample rate to another.
pub struct RateConverter {
    /// `None` when source rate == target rate (passthrough mode).
    resampler: Option<FastFixedIn<f32>>,
    /// Holds partial input chunks between calls.
    input_buf: Vec<f32>,
    chunk_size: usize,
    /// Pre-allocated output buffer: `[1][output_frames_max]`.
    output_buf: Vec<Vec<f32>>,
}

impl RateConverter {
    /// # Errors
    /// `InvalidArgument` for zero rates, zero chunk size, or when rubato
    /// rejects the ratio.
    pub fn new(source_rate: u32, target_rate: u32, chunk_size: usize) -> Result<Self> {
        if source_rate == 0 || target_rate == 0 || chunk_size == 0 {
            return Err(HarkError::InvalidArgument(format!(
                "cannot resample {source_rate} Hz -> {target_rate} Hz in chunks of {chunk_size}"
            )));
        }
        if source_rate == target_rate {
            return Ok(Self {
                resampler: None,
                input_buf: Vec::new(),
                chunk_size,
                output_buf: Vec::new(),
            });
        }

        let ratio = target_rate as f64 / source_rate as f64;
        let resampler = FastFixedIn::<f32>::new(ratio, 1.0, PolynomialDegree::Cubic, chunk_size, 1)
            .map_err(|e| HarkError::InvalidArgument(format!("resampler init: {e}")))?;
        let output_buf = vec![vec![0f32; resampler.output_frames_max()]; 1];

        debug!(source_rate, target_rate, chunk_size, "resampler created");

        Ok(Self {
            resampler: Some(resampler),
            input_buf: Vec::new(),
            chunk_size,
            output_buf,
        })
    }

    /// Feed samples, returning whatever full chunks produced (may be empty).
    /// Any remainder is kept for the next call or [`RateConverter::flush`].
    ///
    /// # Errors
    /// `Backend` when rubato rejects a chunk. The chunk stays buffered.
    pub fn process(&mut self, samples: &[f32]) -> Result<Vec<f32>> {
        let Some(ref mut resampler) = self.resampler else {
            return Ok(samples.to_vec());
        };

        self.input_buf.extend_from_slice(samples);
        let mut result = Vec::new();
        while self.input_buf.len() >= self.chunk_size {
            let input_slice = &self.input_buf[..self.chunk_size];
            let (_consumed, produced) = resampler
                .process_into_buffer(&[input_slice], &mut self.output_buf, None)
                .map_err(resample_error)?;
            result.extend_from_slice(&self.output_buf[0][..produced]);
            self.input_buf.drain(..self.chunk_size);
        }
        Ok(result)
    }

    /// Push the buffered remainder through, zero-padded to a full chunk.
    ///
    /// # Errors
    /// `Backend` when rubato rejects the final chunk.
    pub fn flush(&mut self) -> Result<Vec<f32>> {
        let Some(ref mut resampler) = self.resampler else {
            return Ok(Vec::new());
        };
        let input: [&[f32]; 1] = [self.input_buf.as_slice()];
        let (_consumed, produced) = resampler
            .process_partial_into_buffer(Some(&input[..]), &mut self.output_buf, None)
            .map_err(resample_error)?;
        self.input_buf.clear();
        Ok(self.output_buf[0][..produced].to_vec())
    }

    /// Output frames of latency introduced by the resampler.
    pub fn output_delay(&self) -> usize {
        self.resampler.as_ref().map_or(0, |r| r.output_delay())
    }

    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }
}

/// Convert a whole buffer at `sample_rate` to 16 kHz, compensating for
/// resampler delay so the output is time-aligned with the input.
pub fn to_model_rate(samples: &[f32], sample_rate: u32) -> Result<Vec<f32>> {
    let mut rc = RateConverter::new(sample_rate, SAMPLE_RATE, OFFLINE_CHUNK)?;
    if rc.is_passthrough() {
        return Ok(samples.to_vec());
    }

    let expected =
        (samples.len() as u64 * SAMPLE_RATE as u64).div_ceil(sample_rate as u64) as usize;
    let delay = rc.output_delay();

    let mut out = rc.process(samples)?;
    out.extend(rc.flush()?);
    while out.len() < delay + expected {
        let tail = rc.flush()?;
        if tail.is_empty() {
            break;
        }
        out.extend(tail);
    }

    Ok(out.into_iter().skip(delay).take(expected).collect())
}

fn resample_error(e: rubato::ResampleError) -> HarkError {
    error!("resampler error: {e}");
    HarkError::Backend(format!("resampler: {e}"))
}
