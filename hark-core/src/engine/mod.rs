//! Full transcription runs.
//!
//! ## Lifecycle
//!
//! ```text
//! full(state, params, samples)
//!     └─► pcm_to_mel            → phase = Init
//!         └─► language          → detect (auto) or resolve the requested code
//!             └─► per window    → encode (Encoded), decode (Decoding), split
//!                 └─► done      → Complete | Aborted | Failed
//! ```
//!
//! Windows are 30 s of mel frames. One mel frame is 10 ms, so `seek` is also
//! the window start in centiseconds and timestamps need no conversion.
//!
//! Everything runs on the calling thread. Callbacks fire inline: progress
//! after each window, new-segment once per window that produced text, and
//! abort before each window and at every decode step.

mod window;

use std::time::Instant;

use tracing::{debug, info, warn};

use crate::audio::{MelSpectrogram, CHUNK_FRAMES};
use crate::decode::logits::TokenFilter;
use crate::decode::segments::{split_window, SplitOptions};
use crate::decode::{DecodeTask, StopReason};
use crate::error::{HarkError, Result};
use crate::logging;
use crate::params::FullParams;
use crate::state::{DecodePhase, State};
use crate::vocab::{TokenId, Vocab};

/// How a run ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    /// Stopped by the abort callback. Segments decoded so far are kept.
    Aborted,
}

/// Accepted decodes above this temperature do not feed the next prompt.
const PROMPT_RESET_TEMPERATURE: f32 = 0.5;

/// Transcribe 16 kHz mono `samples` into `state`.
///
/// Previous results on `state` are discarded first.
///
/// # Errors
/// `InvalidArgument` for empty input or unusable params, `UnknownLanguage`
/// for a language the model does not know, and backend errors from
/// inference. A failed state is left in [`DecodePhase::Failed`].
pub fn full(state: &mut State, params: &FullParams, samples: &[f32]) -> Result<RunStatus> {
    logging::scoped(|| {
        if samples.is_empty() {
            return Err(HarkError::InvalidArgument("no samples".into()));
        }
        params.validate()?;
        state.timings = Default::default();
        state.pcm_to_mel(samples, params.n_threads)?;
        full_from_mel(state, params)
    })
}

/// Transcribe the mel matrix already installed on `state` (via
/// [`State::pcm_to_mel`] or [`State::set_mel`]).
pub fn full_from_mel(state: &mut State, params: &FullParams) -> Result<RunStatus> {
    logging::scoped(|| {
        params.validate()?;
        state.clear_results();
        let result = run(state, params);
        if let Err(e) = &result {
            state.phase = DecodePhase::Failed;
            warn!(error = %e, "transcription failed");
        }
        state.ctx.timings().add(&state.timings);
        result
    })
}

/// Detect the spoken language of the 30 s window starting at `offset_ms`.
///
/// Returns the winning language id and the probability of every language,
/// indexed by id. Both are also stored on `state`.
///
/// # Errors
/// `InvalidArgument` with no mel matrix or an offset past the audio.
pub fn lang_auto_detect(
    state: &mut State,
    offset_ms: u64,
    n_threads: usize,
) -> Result<(i32, Vec<f32>)> {
    logging::scoped(|| {
        let seek = usize::try_from(offset_ms / 10).unwrap_or(usize::MAX);
        let lang_id = detect_language(state, seek, n_threads)?;
        Ok((lang_id, state.lang_probs.clone()))
    })
}

fn detect_language(state: &mut State, seek: usize, n_threads: usize) -> Result<i32> {
    let ctx = state.ctx.clone();
    let vocab = ctx.vocab();
    let n_len = state.n_len();
    if seek >= n_len {
        return Err(HarkError::InvalidArgument(format!(
            "offset frame {seek} is past the end of {n_len} frames"
        )));
    }
    state.encode(seek, n_threads)?;

    let started = Instant::now();
    let logits = state.session.logits(&[vocab.sot], n_threads)?;
    state.timings.decode += started.elapsed();
    state.timings.n_decode += 1;
    if logits.len() != vocab.n_vocab() {
        return Err(HarkError::Backend(format!(
            "backend returned {} logits, expected {}",
            logits.len(),
            vocab.n_vocab()
        )));
    }

    let probs = language_probs(vocab, &logits);
    let mut best = 0usize;
    for (i, &p) in probs.iter().enumerate() {
        if p > probs[best] {
            best = i;
        }
    }
    let lang_id = best as i32;
    info!(
        language = vocab.language_code(lang_id).unwrap_or("?"),
        p = probs.get(best).copied().unwrap_or(0.0),
        "auto-detected language"
    );
    state.lang_id = lang_id;
    state.lang_probs = probs;
    Ok(lang_id)
}

/// Softmax over the language tokens only.
fn language_probs(vocab: &Vocab, logits: &[f32]) -> Vec<f32> {
    let lang_logits: Vec<f32> = (0..=vocab.max_language_id())
        .map(|id| {
            vocab
                .language_token(id)
                .and_then(|t| logits.get(t as usize).copied())
                .filter(|l| !l.is_nan())
                .unwrap_or(f32::NEG_INFINITY)
        })
        .collect();
    let max = lang_logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if max == f32::NEG_INFINITY {
        return vec![0.0; lang_logits.len()];
    }
    let exp: Vec<f32> = lang_logits.iter().map(|&l| (l - max).exp()).collect();
    let sum: f32 = exp.iter().sum();
    exp.into_iter().map(|e| e / sum).collect()
}

/// Resolve the language id for a run, detecting it when asked to.
fn resolve_language(state: &mut State, params: &FullParams, seek: usize) -> Result<i32> {
    let ctx = state.ctx.clone();
    let vocab = ctx.vocab();
    if !vocab.is_multilingual() {
        if !params.is_auto_language() && params.language != "en" {
            warn!(
                language = %params.language,
                "model is English-only, ignoring requested language"
            );
        }
        return Ok(vocab.language_id("en").max(0));
    }
    if params.is_auto_language() || params.detect_language {
        return detect_language(state, seek, params.n_threads);
    }
    let id = vocab.language_id(&params.language);
    if id < 0 {
        return Err(HarkError::UnknownLanguage(params.language.clone()));
    }
    Ok(id)
}

/// Decoder prefix for one window.
fn build_prompt(
    vocab: &Vocab,
    past: &[TokenId],
    max_past: usize,
    lang_id: i32,
    translate: bool,
    no_timestamps: bool,
) -> Vec<TokenId> {
    let mut prompt = Vec::with_capacity(max_past + 5);
    if !past.is_empty() && max_past > 0 {
        prompt.push(vocab.prev);
        prompt.extend_from_slice(&past[past.len().saturating_sub(max_past)..]);
    }
    prompt.push(vocab.sot);
    if vocab.is_multilingual() {
        if let Some(lang) = vocab.language_token(lang_id) {
            prompt.push(lang);
        }
    }
    prompt.push(if translate {
        vocab.translate
    } else {
        vocab.transcribe
    });
    if no_timestamps {
        prompt.push(vocab.not);
    }
    prompt
}

struct Progress<'a> {
    params: &'a FullParams,
    last: i32,
}

impl Progress<'_> {
    fn report(&mut self, percent: i32) {
        let percent = percent.clamp(0, 100);
        if percent <= self.last {
            return;
        }
        self.last = percent;
        if self.params.print_progress {
            info!(progress = percent, "progress = {percent:3}%");
        }
        if let Some(cb) = &self.params.progress_callback {
            logging::host(|| cb(percent));
        }
    }
}

fn run(state: &mut State, params: &FullParams) -> Result<RunStatus> {
    let ctx = state.ctx.clone();
    let vocab = ctx.vocab();
    let Some(n_len) = state.mel.as_ref().map(MelSpectrogram::n_len_org) else {
        return Err(HarkError::InvalidArgument(
            "no mel spectrogram: call pcm_to_mel or set_mel first".into(),
        ));
    };

    let seek_start = usize::try_from(params.offset_ms / 10).unwrap_or(usize::MAX);
    let mut seek_end = n_len;
    if params.duration_ms > 0 {
        let duration = usize::try_from(params.duration_ms / 10).unwrap_or(usize::MAX);
        seek_end = seek_end.min(seek_start.saturating_add(duration));
    }
    if seek_start >= seek_end {
        debug!(seek_start, seek_end, "nothing to decode");
        state.phase = DecodePhase::Complete;
        return Ok(RunStatus::Completed);
    }

    let lang_id = resolve_language(state, params, seek_start)?;
    state.lang_id = lang_id;
    if params.detect_language {
        state.phase = DecodePhase::Complete;
        return Ok(RunStatus::Completed);
    }

    let translate = params.translate && vocab.is_multilingual();
    if params.translate && !translate {
        warn!("model is English-only, translation ignored");
    }

    let n_text_ctx = ctx.n_text_ctx();
    let max_past = (n_text_ctx / 2).saturating_sub(1);
    let ctx_bound = (n_text_ctx / 2).saturating_sub(4).max(1);
    let max_len = if params.max_tokens > 0 {
        params.max_tokens.min(ctx_bound)
    } else {
        ctx_bound
    };

    info!(
        strategy = %params.strategy(),
        language = vocab.language_code(lang_id).unwrap_or("?"),
        translate,
        n_threads = params.n_threads,
        frames = seek_end - seek_start,
        "transcription started"
    );

    let mut past: Vec<TokenId> = params.prompt_tokens.clone();
    let mut progress = Progress { params, last: 0 };
    let mut seek = seek_start;

    while seek < seek_end {
        if params.should_abort() {
            info!(seek, "aborted before window");
            state.phase = DecodePhase::Aborted;
            return Ok(RunStatus::Aborted);
        }

        let window_frames = (seek_end - seek).min(CHUNK_FRAMES);
        state.encode(seek, params.n_threads)?;
        state.phase = DecodePhase::Decoding;

        let prompt = build_prompt(
            vocab,
            &past,
            max_past,
            lang_id,
            translate,
            params.no_timestamps,
        );
        let task = DecodeTask {
            vocab,
            prompt: &prompt,
            filter: TokenFilter::new(vocab, params.no_timestamps, params.max_initial_ts),
            max_len,
        };
        let outcome = window::decode_window(state.session.as_mut(), params, &task, seek)?;

        let t = &mut state.timings;
        t.decode += outcome.backend;
        t.n_decode += outcome.n_backend;
        t.sample += outcome.elapsed.saturating_sub(outcome.backend);
        t.n_sample += outcome.n_sample;
        t.n_fallback += outcome.n_fallback;

        let aborted = outcome.decoded.reason == StopReason::Aborted;
        let hyp = &outcome.decoded.hypothesis;
        let split = split_window(
            vocab,
            ctx.detokenizer(),
            &hyp.tokens,
            &SplitOptions {
                seek,
                window_frames,
                no_timestamps: params.no_timestamps,
                flush_tail: aborted,
                token_timestamps: params.token_timestamps,
                no_speech_prob: hyp.no_speech_prob,
            },
        );
        debug!(
            seek,
            window_frames,
            tokens = hyp.tokens.len(),
            segments = split.segments.len(),
            seek_delta = split.seek_delta,
            temperature = outcome.temperature,
            reason = ?outcome.decoded.reason,
            "window decoded"
        );

        let first_new = state.segments.len();
        state.segments.extend(split.segments);
        if let Some(cb) = &params.new_segment_callback {
            logging::host(|| state.segments[first_new..].iter().for_each(|s| cb(s)));
        }

        if aborted {
            info!(seek, segments = state.segments.len(), "aborted during decode");
            state.phase = DecodePhase::Aborted;
            return Ok(RunStatus::Aborted);
        }

        if !params.no_context {
            if outcome.temperature > PROMPT_RESET_TEMPERATURE {
                past.clear();
            } else {
                past.extend(hyp.tokens.iter().map(|t| t.id));
            }
        }

        seek += split.seek_delta;
        let done = (seek.min(seek_end) - seek_start) * 100 / (seek_end - seek_start);
        progress.report(done as i32);
    }

    progress.report(100);
    state.phase = DecodePhase::Complete;
    info!(segments = state.segments.len(), "transcription complete");
    Ok(RunStatus::Completed)
}
