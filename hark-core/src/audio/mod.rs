//! Log-mel feature frontend.
//!
//! ## Parameters (must match training)
//!
//! | Parameter       | Value          |
//! |-----------------|----------------|
//! | Sample rate     | 16 000 Hz      |
//! | Hann window     | 400 samples    |
//! | FFT size        | 400            |
//! | Frequency bins  | 201 (400/2+1)  |
//! | Hop length      | 160 (10 ms)    |
//! | Mel bands       | 80 or 128      |
//! | Mel range       | 0–8 000 Hz     |
//! | Window          | 3 000 frames (30 s) |
//!
//! The signal is reflect-padded by half a window on both sides. A 30 s
//! silent tail is appended so a 3 000-frame window can be read at any real
//! frame offset. Tail frames are never transformed; they hold the silence
//! floor directly.
//!
//! Frames are split into contiguous blocks, one per thread. Each frame is
//! computed independently, so the result does not depend on the thread count.

pub mod resample;

use std::sync::Arc;

use ndarray::{s, Array2, ArrayView2, ArrayViewMut2, Axis};
use rustfft::{num_complex::Complex, Fft, FftPlanner};
use tracing::debug;

use crate::error::{HarkError, Result};

pub const SAMPLE_RATE: u32 = 16_000;
pub const N_FFT: usize = 400;
pub const N_FREQS: usize = N_FFT / 2 + 1; // 201
pub const HOP_LENGTH: usize = 160;
/// Frames the encoder consumes per window (30 s).
pub const CHUNK_FRAMES: usize = 3_000;
pub const CHUNK_SAMPLES: usize = CHUNK_FRAMES * HOP_LENGTH;

const MEL_FMAX: f32 = 8_000.0;
/// `log10` of the power floor; value of every frame with no signal.
const LOG_FLOOR: f32 = -10.0;
/// Dynamic range kept below the loudest bin, in log10 units.
const DYNAMIC_RANGE: f32 = 8.0;

/// Immutable STFT + mel filter bank, built once per context.
pub struct MelFrontend {
    n_mels: usize,
    /// `[n_mels, N_FREQS]`
    filters: Array2<f32>,
    hann_window: Vec<f32>,
    fft: Arc<dyn Fft<f32>>,
}

impl MelFrontend {
    pub fn new(n_mels: usize) -> Self {
        Self {
            n_mels,
            filters: build_mel_filters(N_FFT, SAMPLE_RATE, n_mels, 0.0, MEL_FMAX),
            hann_window: build_hann_window(N_FFT),
            fft: FftPlanner::<f32>::new().plan_fft_forward(N_FFT),
        }
    }

    pub fn n_mels(&self) -> usize {
        self.n_mels
    }

    /// Compute the normalised log-mel spectrogram of 16 kHz mono `samples`.
    ///
    /// `samples` must not be empty; callers validate that at the boundary.
    pub fn compute(&self, samples: &[f32], n_threads: usize) -> MelSpectrogram {
        let centered = reflect_pad(samples, N_FFT / 2);
        let n_len_org = 1 + centered.len().saturating_sub(N_FFT) / HOP_LENGTH;
        let n_len = n_len_org + CHUNK_FRAMES;

        let mut data = Array2::<f32>::from_elem((self.n_mels, n_len), LOG_FLOOR);
        let n_threads = n_threads.clamp(1, n_len_org);
        let frames_per_thread = n_len_org.div_ceil(n_threads);

        {
            let mut active = data.slice_mut(s![.., ..n_len_org]);
            if n_threads == 1 {
                self.fill_frames(&centered, 0, active);
            } else {
                let centered = centered.as_slice();
                std::thread::scope(|scope| {
                    for (i, block) in active
                        .axis_chunks_iter_mut(Axis(1), frames_per_thread)
                        .enumerate()
                    {
                        scope.spawn(move || self.fill_frames(centered, i * frames_per_thread, block));
                    }
                });
            }
        }

        let max_val = data.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let floor = max_val - DYNAMIC_RANGE;
        data.mapv_inplace(|v| (v.max(floor) + 4.0) / 4.0);

        debug!(
            n_samples = samples.len(),
            n_len_org,
            n_mels = self.n_mels,
            n_threads,
            "computed log-mel spectrogram"
        );

        MelSpectrogram { data, n_len_org }
    }

    /// Fill `block` (`[n_mels, frames]`) with log10 mel power, starting at
    /// absolute frame `first_frame`.
    fn fill_frames(&self, centered: &[f32], first_frame: usize, mut block: ArrayViewMut2<'_, f32>) {
        let mut fft_buf = vec![Complex::new(0.0f32, 0.0); N_FFT];
        let mut scratch = vec![Complex::new(0.0f32, 0.0); self.fft.get_inplace_scratch_len()];

        for (j, mut column) in block.axis_iter_mut(Axis(1)).enumerate() {
            let start = (first_frame + j) * HOP_LENGTH;
            for (i, v) in fft_buf.iter_mut().enumerate() {
                let s = centered.get(start + i).copied().unwrap_or(0.0);
                *v = Complex::new(s * self.hann_window[i], 0.0);
            }
            self.fft.process_with_scratch(&mut fft_buf, &mut scratch);

            for (m, out) in column.iter_mut().enumerate() {
                let energy: f32 = self
                    .filters
                    .row(m)
                    .iter()
                    .zip(&fft_buf[..N_FREQS])
                    .map(|(w, c)| w * c.norm_sqr())
                    .sum();
                *out = energy.max(1e-10).log10();
            }
        }
    }
}

impl std::fmt::Debug for MelFrontend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MelFrontend")
            .field("n_mels", &self.n_mels)
            .finish_non_exhaustive()
    }
}

/// Normalised log-mel features, `[n_mels, n_len_org + CHUNK_FRAMES]`.
#[derive(Debug, Clone, PartialEq)]
pub struct MelSpectrogram {
    data: Array2<f32>,
    n_len_org: usize,
}

impl MelSpectrogram {
    /// Wrap externally computed features (`n_mels` rows of `n_len` frames,
    /// row-major). A silent tail is appended at the minimum input value.
    pub fn from_raw(data: Vec<f32>, n_len: usize, n_mels: usize) -> Result<Self> {
        if n_len == 0 || n_mels == 0 {
            return Err(HarkError::InvalidArgument(
                "mel dimensions must be non-zero".into(),
            ));
        }
        if data.len() != n_len * n_mels {
            return Err(HarkError::InvalidArgument(format!(
                "mel data holds {} values, expected {n_mels} x {n_len}",
                data.len()
            )));
        }
        let given = Array2::from_shape_vec((n_mels, n_len), data)
            .map_err(|e| HarkError::InvalidArgument(e.to_string()))?;
        let silence = given.iter().copied().fold(f32::INFINITY, f32::min);
        let mut padded = Array2::<f32>::from_elem((n_mels, n_len + CHUNK_FRAMES), silence);
        padded.slice_mut(s![.., ..n_len]).assign(&given);
        Ok(Self {
            data: padded,
            n_len_org: n_len,
        })
    }

    pub fn n_mels(&self) -> usize {
        self.data.nrows()
    }

    /// Frames covering real input.
    pub fn n_len_org(&self) -> usize {
        self.n_len_org
    }

    /// Frames including the silent tail.
    pub fn n_len(&self) -> usize {
        self.data.ncols()
    }

    pub fn data(&self) -> ArrayView2<'_, f32> {
        self.data.view()
    }

    /// The `CHUNK_FRAMES`-wide window starting at frame `offset`.
    pub fn window(&self, offset: usize) -> ArrayView2<'_, f32> {
        let start = offset.min(self.n_len_org);
        self.data.slice(s![.., start..start + CHUNK_FRAMES])
    }
}

fn build_hann_window(n: usize) -> Vec<f32> {
    use std::f32::consts::PI;
    (0..n)
        .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f32 / n as f32).cos()))
        .collect()
}

fn build_mel_filters(fft_size: usize, sr: u32, n_mels: usize, fmin: f32, fmax: f32) -> Array2<f32> {
    let n_freqs = fft_size / 2 + 1;
    let mel_min = hz_to_mel_slaney(fmin);
    let mel_max = hz_to_mel_slaney(fmax);

    let hz_pts: Vec<f32> = (0..=(n_mels + 1))
        .map(|i| mel_to_hz_slaney(mel_min + (mel_max - mel_min) * i as f32 / (n_mels + 1) as f32))
        .collect();
    let fft_freqs: Vec<f32> = (0..n_freqs)
        .map(|k| k as f32 * sr as f32 / fft_size as f32)
        .collect();

    let mut filters = Array2::<f32>::zeros((n_mels, n_freqs));
    for (m, mut row) in filters.axis_iter_mut(Axis(0)).enumerate() {
        let lower = hz_pts[m];
        let center = hz_pts[m + 1];
        let upper = hz_pts[m + 2];
        let down_denom = (center - lower).max(1e-10);
        let up_denom = (upper - center).max(1e-10);
        // Slaney area normalisation
        let enorm = 2.0 / (upper - lower).max(1e-10);

        for (w, &freq) in row.iter_mut().zip(&fft_freqs) {
            let tri = if freq >= lower && freq <= center {
                (freq - lower) / down_denom
            } else if freq > center && freq <= upper {
                (upper - freq) / up_denom
            } else {
                0.0
            };
            *w = (tri * enorm).max(0.0);
        }
    }
    filters
}

fn reflect_pad(samples: &[f32], pad: usize) -> Vec<f32> {
    if samples.is_empty() {
        return vec![0.0; pad * 2];
    }
    if samples.len() == 1 {
        return vec![samples[0]; 1 + pad * 2];
    }
    let n = samples.len() as isize;
    (-(pad as isize)..(n + pad as isize))
        .map(|i| samples[reflect_index(i, samples.len())])
        .collect()
}

fn reflect_index(mut i: isize, len: usize) -> usize {
    let max = len as isize - 1;
    while i < 0 || i > max {
        if i < 0 {
            i = -i;
        } else {
            i = 2 * max - i;
        }
    }
    i as usize
}

fn hz_to_mel_slaney(hz: f32) -> f32 {
    let f_sp = 200.0 / 3.0;
    let min_log_hz = 1_000.0;
    let min_log_mel = min_log_hz / f_sp;
    let logstep = (6.4_f32).ln() / 27.0;
    if hz >= min_log_hz {
        min_log_mel + (hz / min_log_hz).ln() / logstep
    } else {
        hz / f_sp
    }
}

fn mel_to_hz_slaney(mel: f32) -> f32 {
    let f_sp = 200.0 / 3.0;
    let min_log_hz = 1_000.0;
    let min_log_mel = min_log_hz / f_sp;
    let logstep = (6.4_f32).ln() / 27.0;
    if mel >= min_log_mel {
        min_log_hz * (logstep * (mel - min_log_mel)).exp()
    } else {
        mel * f_sp
    }
}
