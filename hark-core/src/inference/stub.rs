//! `StubModel`: scripted backend that produces logits without real inference.
//!
//! Used by tests, the benchmark binary, and anyone wiring the engine up
//! before real weights are available. The logits it returns are driven by a
//! [`LogitScript`], so a test can steer decoding to any token sequence it
//! wants and check how the engine turns that sequence into segments.
//!
//! The default script, [`ScriptedText`], speaks three words per window:
//!
//! ```text
//! <|0.00|> w100 w200 w300 <|1.50|> <|endoftext|>
//! ```
//!
//! with each word id shifted by the window index, so successive windows are
//! distinguishable.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ndarray::ArrayView2;
use tracing::debug;

use crate::audio::CHUNK_FRAMES;
use crate::error::{HarkError, Result};
use crate::inference::{
    BackendSession, ComputeBackend, Detokenizer, LoadedModel, ModelHparams, ModelSource,
};
use crate::params::ContextParams;
use crate::vocab::{TokenId, Vocab};

/// Logit given to the token a script wants next. Everything else sits at 0.
pub const PEAK_LOGIT: f32 = 30.0;

/// What a script sees when asked for the next logits.
#[derive(Debug, Clone, Copy)]
pub struct StubStep<'a> {
    /// First mel frame of the encoded window.
    pub window_offset: usize,
    /// Full token sequence sent to the decoder (prompt + generated).
    pub tokens: &'a [TokenId],
    pub vocab: &'a Vocab,
}

impl<'a> StubStep<'a> {
    /// Index of the 30 s window being decoded, counted from frame 0.
    pub fn window_index(&self) -> usize {
        self.window_offset / CHUNK_FRAMES
    }

    /// `[.., <|startoftranscript|>]`: the engine is probing for the language.
    pub fn is_language_query(&self) -> bool {
        self.tokens.last() == Some(&self.vocab.sot)
    }

    /// Position just past the task token (and `<|notimestamps|>`, if present).
    fn generated_start(&self) -> Option<usize> {
        let vocab = self.vocab;
        let task = self
            .tokens
            .iter()
            .rposition(|&t| t == vocab.transcribe || t == vocab.translate)?;
        let mut start = task + 1;
        if self.tokens.get(start) == Some(&vocab.not) {
            start += 1;
        }
        Some(start)
    }

    /// Tokens the decoder has produced so far in this window.
    pub fn generated(&self) -> &'a [TokenId] {
        let tokens = self.tokens;
        match self.generated_start() {
            Some(start) => &tokens[start..],
            None => &[],
        }
    }

    pub fn no_timestamps(&self) -> bool {
        self.generated_start()
            .is_some_and(|start| start > 0 && self.tokens[start - 1] == self.vocab.not)
    }

    pub fn is_translating(&self) -> bool {
        self.tokens.contains(&self.vocab.translate)
    }
}

/// Fills a logit vector for one decoder step.
pub trait LogitScript: Send + Sync + 'static {
    /// `logits` arrives zeroed and has exactly `n_vocab` entries.
    fn fill(&self, step: &StubStep<'_>, logits: &mut [f32]);
}

impl<F> LogitScript for F
where
    F: Fn(&StubStep<'_>, &mut [f32]) + Send + Sync + 'static,
{
    fn fill(&self, step: &StubStep<'_>, logits: &mut [f32]) {
        self(step, logits)
    }
}

/// Default script: a fixed sentence per window, bracketed by timestamps.
#[derive(Debug, Clone)]
pub struct ScriptedText {
    /// Text tokens spoken in window 0; window `k` speaks `word + k`.
    pub words: Vec<TokenId>,
    /// Language reported when the engine asks for detection.
    pub language: &'static str,
    /// Duration given to each word, in centiseconds.
    pub word_cs: i64,
}

impl Default for ScriptedText {
    fn default() -> Self {
        Self {
            words: vec![100, 200, 300],
            language: "en",
            word_cs: 50,
        }
    }
}

impl ScriptedText {
    fn plan(&self, step: &StubStep<'_>) -> Vec<TokenId> {
        let vocab = step.vocab;
        let shift = step.window_index() as TokenId;
        let words = self.words.iter().map(|w| w + shift);
        if step.no_timestamps() {
            return words.chain([vocab.eot]).collect();
        }
        let end = vocab.timestamp_token(self.word_cs * self.words.len() as i64);
        std::iter::once(vocab.beg)
            .chain(words)
            .chain([end, vocab.eot])
            .collect()
    }
}

impl LogitScript for ScriptedText {
    fn fill(&self, step: &StubStep<'_>, logits: &mut [f32]) {
        let vocab = step.vocab;
        let target = if step.is_language_query() {
            vocab
                .language_token(vocab.language_id(self.language))
                .unwrap_or(vocab.eot)
        } else {
            self.plan(step)
                .get(step.generated().len())
                .copied()
                .unwrap_or(vocab.eot)
        };
        if let Some(slot) = usize::try_from(target).ok().and_then(|i| logits.get_mut(i)) {
            *slot = PEAK_LOGIT;
        }
    }
}

/// Call counters shared by every session of one stub backend.
#[derive(Debug, Default)]
pub struct StubStats {
    pub sessions: AtomicUsize,
    pub encodes: AtomicUsize,
    pub logits: AtomicUsize,
}

impl StubStats {
    pub fn encodes(&self) -> usize {
        self.encodes.load(Ordering::Relaxed)
    }

    pub fn logits(&self) -> usize {
        self.logits.load(Ordering::Relaxed)
    }

    pub fn sessions(&self) -> usize {
        self.sessions.load(Ordering::Relaxed)
    }
}

/// In-memory [`ModelSource`] backed by a [`LogitScript`].
#[derive(Clone)]
pub struct StubModel {
    hparams: ModelHparams,
    script: Arc<dyn LogitScript>,
    fail_after: Option<usize>,
    stats: Arc<StubStats>,
}

impl StubModel {
    /// Multilingual `base`-shaped stub with the default script.
    pub fn new() -> Self {
        Self::with_hparams(ModelHparams::base())
    }

    pub fn with_hparams(hparams: ModelHparams) -> Self {
        Self {
            hparams,
            script: Arc::new(ScriptedText::default()),
            fail_after: None,
            stats: Arc::new(StubStats::default()),
        }
    }

    /// English-only vocabulary (51 864 tokens).
    pub fn english_only() -> Self {
        Self::with_hparams(ModelHparams {
            n_vocab: crate::vocab::N_VOCAB_ENGLISH,
            ..ModelHparams::base()
        })
    }

    pub fn script(mut self, script: impl LogitScript) -> Self {
        self.script = Arc::new(script);
        self
    }

    /// Make every session fail its `n + 1`-th logits call.
    pub fn fail_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    pub fn hparams(&self) -> &ModelHparams {
        &self.hparams
    }

    pub fn stats(&self) -> Arc<StubStats> {
        Arc::clone(&self.stats)
    }
}

impl Default for StubModel {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelSource for StubModel {
    fn load(&self, params: &ContextParams) -> Result<LoadedModel> {
        let vocab = Vocab::new(self.hparams.n_vocab)?;
        debug!(
            n_vocab = self.hparams.n_vocab,
            use_gpu = params.use_gpu,
            "StubModel::load"
        );
        Ok(LoadedModel {
            hparams: self.hparams,
            backend: Arc::new(StubBackend {
                hparams: self.hparams,
                vocab: vocab.clone(),
                script: Arc::clone(&self.script),
                fail_after: self.fail_after,
                stats: Arc::clone(&self.stats),
            }),
            detokenizer: Arc::new(SyntheticTokens { vocab }),
        })
    }
}

struct StubBackend {
    hparams: ModelHparams,
    vocab: Vocab,
    script: Arc<dyn LogitScript>,
    fail_after: Option<usize>,
    stats: Arc<StubStats>,
}

impl ComputeBackend for StubBackend {
    fn name(&self) -> &str {
        "stub"
    }

    fn new_session(&self) -> Result<Box<dyn BackendSession>> {
        self.stats.sessions.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(StubSession {
            hparams: self.hparams,
            vocab: self.vocab.clone(),
            script: Arc::clone(&self.script),
            fail_after: self.fail_after,
            stats: Arc::clone(&self.stats),
            window_offset: None,
            calls: 0,
        }))
    }
}

struct StubSession {
    hparams: ModelHparams,
    vocab: Vocab,
    script: Arc<dyn LogitScript>,
    fail_after: Option<usize>,
    stats: Arc<StubStats>,
    window_offset: Option<usize>,
    calls: usize,
}

impl BackendSession for StubSession {
    fn encode(&mut self, mel: ArrayView2<'_, f32>, offset: usize, _n_threads: usize) -> Result<()> {
        if mel.dim() != (self.hparams.n_mels, CHUNK_FRAMES) {
            return Err(HarkError::InvalidArgument(format!(
                "encoder expects {} x {CHUNK_FRAMES} mel window, got {:?}",
                self.hparams.n_mels,
                mel.dim()
            )));
        }
        self.stats.encodes.fetch_add(1, Ordering::Relaxed);
        self.window_offset = Some(offset);
        Ok(())
    }

    fn logits(&mut self, tokens: &[TokenId], _n_threads: usize) -> Result<Vec<f32>> {
        let Some(window_offset) = self.window_offset else {
            return Err(HarkError::Backend("logits requested before encode".into()));
        };
        if self.fail_after.is_some_and(|n| self.calls >= n) {
            return Err(HarkError::Backend(format!(
                "stub failure injected after {} decoder calls",
                self.calls
            )));
        }
        self.calls += 1;
        self.stats.logits.fetch_add(1, Ordering::Relaxed);

        let mut logits = vec![0.0f32; self.hparams.n_vocab];
        let step = StubStep {
            window_offset,
            tokens,
            vocab: &self.vocab,
        };
        self.script.fill(&step, &mut logits);
        Ok(logits)
    }

    fn reset(&mut self) {
        self.window_offset = None;
        self.calls = 0;
    }
}

/// Readable pieces for every id: `" w<id>"` for text, `<|..|>` for control.
struct SyntheticTokens {
    vocab: Vocab,
}

impl Detokenizer for SyntheticTokens {
    fn token_text(&self, token: TokenId) -> Option<String> {
        let v = &self.vocab;
        if token < 0 || token as usize >= v.n_vocab() {
            return None;
        }
        let text = if v.is_text(token) {
            format!(" w{token}")
        } else if v.is_timestamp(token) {
            let cs = v.timestamp_cs(token);
            format!("<|{}.{:02}|>", cs / 100, cs % 100)
        } else if let Some(lang) = v.language_of_token(token).and_then(|id| v.language_code(id)) {
            format!("<|{lang}|>")
        } else {
            let name = match token {
                t if t == v.eot => "endoftext",
                t if t == v.sot => "startoftranscript",
                t if t == v.translate => "translate",
                t if t == v.transcribe => "transcribe",
                t if t == v.solm => "startoflm",
                t if t == v.prev => "startofprev",
                t if t == v.nosp => "nospeech",
                t if t == v.not => "notimestamps",
                _ => "unused",
            };
            format!("<|{name}|>")
        };
        Some(text)
    }
}
