//! Per-run mutable decoding state.
//!
//! A [`State`] belongs to exactly one [`Context`] and owns everything a run
//! mutates: the backend session, the mel matrix, the segment list, and the
//! per-run timings. States of the same context can decode on different
//! threads at the same time; a single state is used by one thread at a time
//! (`&mut self`).
//!
//! ```text
//! Init ──encode──► Encoded ──decode──► Decoding ──► Complete
//!   ▲                                     │  ├──► Aborted
//!   └──────── pcm_to_mel / set_mel ───────┘  └──► Failed
//! ```

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::audio::{MelSpectrogram, CHUNK_FRAMES};
use crate::context::Context;
use crate::error::{HarkError, Result};
use crate::inference::BackendSession;
use crate::logging;
use crate::vocab::TokenId;

/// Per-token decoding detail.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenData {
    pub id: TokenId,
    /// Most probable timestamp token at this step.
    pub tid: TokenId,
    /// Probability of `id`.
    pub p: f32,
    /// Log-probability of `id`.
    pub plog: f32,
    /// Probability of `tid`.
    pub pt: f32,
    /// Total probability mass on timestamp tokens.
    pub ptsum: f32,
    /// Interpolated start time in centiseconds, `-1` when not computed.
    pub t0: i64,
    /// Interpolated end time in centiseconds, `-1` when not computed.
    pub t1: i64,
}

/// A contiguous span of transcribed text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    /// Start time in centiseconds from the beginning of the input.
    pub t0: i64,
    /// End time in centiseconds; never before `t0`.
    pub t1: i64,
    pub text: String,
    /// Text tokens of the segment, in emission order.
    pub tokens: Vec<TokenData>,
    /// Probability of `<|nospeech|>` for the window that produced this segment.
    pub no_speech_prob: f32,
}

/// Lifecycle position of a [`State`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DecodePhase {
    Init,
    Encoded,
    Decoding,
    Complete,
    Aborted,
    Failed,
}

impl DecodePhase {
    /// Whether results from the last run can be read.
    pub fn has_results(self) -> bool {
        matches!(
            self,
            DecodePhase::Complete | DecodePhase::Aborted | DecodePhase::Decoding
        )
    }
}

/// Wall-clock spent in each stage of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Timings {
    pub mel: Duration,
    pub encode: Duration,
    pub decode: Duration,
    /// Logit filtering, ranking and sampling outside the backend.
    pub sample: Duration,
    pub n_encode: u32,
    pub n_decode: u32,
    pub n_sample: u32,
    /// Temperature-fallback retries.
    pub n_fallback: u32,
}

impl Timings {
    pub fn accumulate(&mut self, other: &Timings) {
        self.mel += other.mel;
        self.encode += other.encode;
        self.decode += other.decode;
        self.sample += other.sample;
        self.n_encode += other.n_encode;
        self.n_decode += other.n_decode;
        self.n_sample += other.n_sample;
        self.n_fallback += other.n_fallback;
    }
}

/// Mutable decoding session bound to one [`Context`].
pub struct State {
    pub(crate) ctx: Context,
    pub(crate) session: Box<dyn BackendSession>,
    pub(crate) mel: Option<MelSpectrogram>,
    pub(crate) phase: DecodePhase,
    pub(crate) segments: Vec<Segment>,
    pub(crate) lang_id: i32,
    pub(crate) lang_probs: Vec<f32>,
    pub(crate) timings: Timings,
}

impl State {
    pub(crate) fn new(ctx: Context) -> Result<Self> {
        let session = ctx.backend().new_session()?;
        Ok(Self {
            ctx,
            session,
            mel: None,
            phase: DecodePhase::Init,
            segments: Vec::new(),
            lang_id: -1,
            lang_probs: Vec::new(),
            timings: Timings::default(),
        })
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn phase(&self) -> DecodePhase {
        self.phase
    }

    /// Compute the log-mel spectrogram of 16 kHz mono `samples`.
    ///
    /// Replaces any previous mel matrix and drops the encoder output.
    ///
    /// `n_threads == 0` runs single-threaded.
    ///
    /// # Errors
    /// `InvalidArgument` for empty input.
    pub fn pcm_to_mel(&mut self, samples: &[f32], n_threads: usize) -> Result<()> {
        if samples.is_empty() {
            return Err(HarkError::InvalidArgument("no samples".into()));
        }
        let n_threads = n_threads.max(1);
        logging::scoped(|| {
            let started = Instant::now();
            let mel = self.ctx.frontend().compute(samples, n_threads);
            self.timings.mel += started.elapsed();
            self.install_mel(mel);
        });
        Ok(())
    }

    /// Install a caller-supplied mel matrix (`n_mels` rows of `n_len` frames,
    /// row-major) instead of computing one from PCM.
    ///
    /// # Errors
    /// `InvalidArgument` when `n_mels` differs from the model or the data
    /// length does not match.
    pub fn set_mel(&mut self, data: &[f32], n_len: usize, n_mels: usize) -> Result<()> {
        if n_mels != self.ctx.n_mels() {
            return Err(HarkError::InvalidArgument(format!(
                "model expects {} mel bands, got {n_mels}",
                self.ctx.n_mels()
            )));
        }
        let mel = MelSpectrogram::from_raw(data.to_vec(), n_len, n_mels)?;
        debug!(n_len, n_mels, "installed caller-supplied mel");
        self.install_mel(mel);
        Ok(())
    }

    fn install_mel(&mut self, mel: MelSpectrogram) {
        self.session.reset();
        self.mel = Some(mel);
        self.phase = DecodePhase::Init;
    }

    pub fn mel(&self) -> Option<&MelSpectrogram> {
        self.mel.as_ref()
    }

    /// Frames of real audio in the current mel matrix, `0` before any input.
    pub fn n_len(&self) -> usize {
        self.mel.as_ref().map_or(0, MelSpectrogram::n_len_org)
    }

    /// Run the encoder on the window starting at mel frame `offset`.
    ///
    /// # Errors
    /// `InvalidArgument` with no mel matrix or an offset past the audio;
    /// backend errors otherwise.
    pub fn encode(&mut self, offset: usize, n_threads: usize) -> Result<()> {
        let Some(mel) = self.mel.as_ref() else {
            return Err(HarkError::InvalidArgument(
                "no mel spectrogram: call pcm_to_mel or set_mel first".into(),
            ));
        };
        if offset >= mel.n_len_org().max(1) {
            return Err(HarkError::InvalidArgument(format!(
                "offset {offset} is past the end of {} frames",
                mel.n_len_org()
            )));
        }
        let started = Instant::now();
        let window = mel.window(offset);
        debug_assert_eq!(window.ncols(), CHUNK_FRAMES);
        self.session.encode(window, offset, n_threads)?;
        self.timings.encode += started.elapsed();
        self.timings.n_encode += 1;
        self.phase = DecodePhase::Encoded;
        Ok(())
    }

    pub(crate) fn clear_results(&mut self) {
        self.segments.clear();
        self.lang_id = -1;
        self.lang_probs.clear();
        self.timings = Timings {
            mel: self.timings.mel,
            ..Timings::default()
        };
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn n_segments(&self) -> usize {
        self.segments.len()
    }

    pub fn segment(&self, i: usize) -> Option<&Segment> {
        self.segments.get(i)
    }

    /// All segment texts concatenated.
    pub fn full_text(&self) -> String {
        self.segments.iter().map(|s| s.text.as_str()).collect()
    }

    /// Segments as a JSON array.
    pub fn segments_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.segments)?)
    }

    /// Language used (or detected) by the last run, `-1` if none.
    pub fn lang_id(&self) -> i32 {
        self.lang_id
    }

    /// Per-language probabilities from the last detection, indexed by id.
    pub fn lang_probs(&self) -> &[f32] {
        &self.lang_probs
    }

    pub fn timings(&self) -> Timings {
        self.timings
    }
}

impl std::fmt::Debug for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("State")
            .field("phase", &self.phase)
            .field("n_len", &self.n_len())
            .field("n_segments", &self.segments.len())
            .field("lang_id", &self.lang_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::stub::StubModel;
    use crate::params::ContextParams;

    fn state() -> State {
        Context::from_source(&StubModel::new(), ContextParams::default())
            .and_then(|ctx| ctx.create_state())
            .expect("stub state")
    }

    #[test]
    fn fresh_state_is_empty() {
        let state = state();
        assert_eq!(state.phase(), DecodePhase::Init);
        assert_eq!(state.n_len(), 0);
        assert_eq!(state.n_segments(), 0);
        assert_eq!(state.lang_id(), -1);
        assert!(state.segment(0).is_none());
    }

    #[test]
    fn pcm_to_mel_sets_frame_count() {
        let mut state = state();
        state.pcm_to_mel(&vec![0.0; 16_000], 2).unwrap();
        assert_eq!(state.n_len(), 101);
        assert!(state.timings().mel > Duration::ZERO);
    }

    #[test]
    fn pcm_to_mel_rejects_bad_input() {
        let mut state = state();
        assert!(matches!(
            state.pcm_to_mel(&[], 1),
            Err(HarkError::InvalidArgument(_))
        ));
    }

    #[test]
    fn pcm_to_mel_treats_zero_threads_as_one() {
        let samples: Vec<f32> = (0..8_000).map(|i| (i as f32 * 0.05).sin() * 0.4).collect();
        let mut single = state();
        single.pcm_to_mel(&samples, 1).unwrap();
        let mut zero = state();
        zero.pcm_to_mel(&samples, 0).unwrap();
        assert_eq!(zero.n_len(), single.n_len());
        assert_eq!(zero.mel().unwrap().data(), single.mel().unwrap().data());
    }

    #[test]
    fn set_mel_validates_band_count() {
        let mut state = state();
        assert!(state.set_mel(&[0.0; 128 * 10], 10, 128).is_err());
        state.set_mel(&[0.0; 80 * 10], 10, 80).unwrap();
        assert_eq!(state.n_len(), 10);
    }

    #[test]
    fn encode_needs_mel_and_valid_offset() {
        let mut state = state();
        assert!(state.encode(0, 1).is_err());
        state.pcm_to_mel(&vec![0.1; 32_000], 1).unwrap();
        state.encode(0, 1).unwrap();
        assert_eq!(state.phase(), DecodePhase::Encoded);
        assert_eq!(state.timings().n_encode, 1);
        assert!(state.encode(10_000, 1).is_err());
    }

    #[test]
    fn segments_serialize_camel_case() {
        let seg = Segment {
            t0: 0,
            t1: 150,
            text: " hi".into(),
            tokens: vec![],
            no_speech_prob: 0.0,
        };
        let json = serde_json::to_string(&seg).unwrap();
        assert!(json.contains("\"noSpeechProb\""));
        let back: Segment = serde_json::from_str(&json).unwrap();
        assert_eq!(back, seg);
    }
}
