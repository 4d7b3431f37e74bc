//! Immutable, shareable model context.
//!
//! A [`Context`] is a cheap `Arc` handle: cloning it shares the loaded
//! weights, vocabulary, and mel filter bank. Everything reachable through it
//! is read-only except the timing aggregate, which uses relaxed atomics in
//! the same way the engine counts diagnostics.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::audio::{MelFrontend, CHUNK_FRAMES};
use crate::error::{HarkError, Result};
use crate::inference::{
    ComputeBackend, Detokenizer, LoadedModel, ModelHparams, ModelSource, ModelType,
};
use crate::logging;
use crate::params::ContextParams;
use crate::state::{State, Timings};
use crate::vocab::{SpecialToken, TokenId, Vocab};

/// Running totals of every run that finished on any state of a context.
#[derive(Debug, Default)]
pub struct ContextTimings {
    load_us: AtomicU64,
    mel_us: AtomicU64,
    encode_us: AtomicU64,
    decode_us: AtomicU64,
    sample_us: AtomicU64,
    n_encode: AtomicU32,
    n_decode: AtomicU32,
    n_sample: AtomicU32,
    n_fallback: AtomicU32,
}

fn micros(d: Duration) -> u64 {
    u64::try_from(d.as_micros()).unwrap_or(u64::MAX)
}

impl ContextTimings {
    pub fn add(&self, t: &Timings) {
        self.mel_us.fetch_add(micros(t.mel), Ordering::Relaxed);
        self.encode_us.fetch_add(micros(t.encode), Ordering::Relaxed);
        self.decode_us.fetch_add(micros(t.decode), Ordering::Relaxed);
        self.sample_us.fetch_add(micros(t.sample), Ordering::Relaxed);
        self.n_encode.fetch_add(t.n_encode, Ordering::Relaxed);
        self.n_decode.fetch_add(t.n_decode, Ordering::Relaxed);
        self.n_sample.fetch_add(t.n_sample, Ordering::Relaxed);
        self.n_fallback.fetch_add(t.n_fallback, Ordering::Relaxed);
    }

    /// Zero the per-run totals. Load time is kept.
    pub fn reset(&self) {
        self.mel_us.store(0, Ordering::Relaxed);
        self.encode_us.store(0, Ordering::Relaxed);
        self.decode_us.store(0, Ordering::Relaxed);
        self.sample_us.store(0, Ordering::Relaxed);
        self.n_encode.store(0, Ordering::Relaxed);
        self.n_decode.store(0, Ordering::Relaxed);
        self.n_sample.store(0, Ordering::Relaxed);
        self.n_fallback.store(0, Ordering::Relaxed);
    }

    pub fn load_time(&self) -> Duration {
        Duration::from_micros(self.load_us.load(Ordering::Relaxed))
    }

    pub fn snapshot(&self) -> Timings {
        Timings {
            mel: Duration::from_micros(self.mel_us.load(Ordering::Relaxed)),
            encode: Duration::from_micros(self.encode_us.load(Ordering::Relaxed)),
            decode: Duration::from_micros(self.decode_us.load(Ordering::Relaxed)),
            sample: Duration::from_micros(self.sample_us.load(Ordering::Relaxed)),
            n_encode: self.n_encode.load(Ordering::Relaxed),
            n_decode: self.n_decode.load(Ordering::Relaxed),
            n_sample: self.n_sample.load(Ordering::Relaxed),
            n_fallback: self.n_fallback.load(Ordering::Relaxed),
        }
    }
}

struct ContextInner {
    params: ContextParams,
    hparams: ModelHparams,
    vocab: Vocab,
    frontend: MelFrontend,
    backend: Arc<dyn ComputeBackend>,
    detokenizer: Arc<dyn Detokenizer>,
    timings: ContextTimings,
}

/// Loaded model plus everything derived from it.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    /// Load a model and build a context around it.
    ///
    /// # Errors
    /// Whatever the source reports while loading, or `InvalidArgument` when
    /// the reported hyperparameters are unusable.
    pub fn from_source<S: ModelSource + ?Sized>(source: &S, params: ContextParams) -> Result<Self> {
        logging::scoped(|| {
            let started = Instant::now();
            let model = source.load(&params)?;
            let ctx = Self::from_model(model, params)?;
            ctx.inner
                .timings
                .load_us
                .store(micros(started.elapsed()), Ordering::Relaxed);
            Ok(ctx)
        })
    }

    /// Build a context around an already loaded model.
    pub fn from_model(model: LoadedModel, params: ContextParams) -> Result<Self> {
        let LoadedModel {
            hparams,
            backend,
            detokenizer,
        } = model;
        if hparams.n_mels == 0 || hparams.n_audio_ctx == 0 || hparams.n_text_ctx == 0 {
            return Err(HarkError::InvalidArgument(format!(
                "unusable model hyperparameters: {hparams:?}"
            )));
        }
        if hparams.n_audio_ctx * 2 != CHUNK_FRAMES {
            warn!(
                n_audio_ctx = hparams.n_audio_ctx,
                "encoder context differs from the 30 s window"
            );
        }
        let vocab = Vocab::new(hparams.n_vocab)?;

        info!(
            backend = backend.name(),
            n_vocab = hparams.n_vocab,
            n_mels = hparams.n_mels,
            model_type = %hparams.model_type(),
            multilingual = vocab.is_multilingual(),
            "context ready"
        );

        Ok(Self {
            inner: Arc::new(ContextInner {
                params,
                hparams,
                frontend: MelFrontend::new(hparams.n_mels),
                vocab,
                backend,
                detokenizer,
                timings: ContextTimings::default(),
            }),
        })
    }

    /// Allocate a new decoding state bound to this context.
    pub fn create_state(&self) -> Result<State> {
        State::new(self.clone())
    }

    /// Whether both handles refer to the same loaded model.
    pub fn same_as(&self, other: &Context) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn params(&self) -> &ContextParams {
        &self.inner.params
    }

    pub fn hparams(&self) -> &ModelHparams {
        &self.inner.hparams
    }

    pub fn vocab(&self) -> &Vocab {
        &self.inner.vocab
    }

    pub fn n_vocab(&self) -> usize {
        self.inner.hparams.n_vocab
    }

    pub fn n_text_ctx(&self) -> usize {
        self.inner.hparams.n_text_ctx
    }

    pub fn n_audio_ctx(&self) -> usize {
        self.inner.hparams.n_audio_ctx
    }

    pub fn n_mels(&self) -> usize {
        self.inner.hparams.n_mels
    }

    pub fn is_multilingual(&self) -> bool {
        self.inner.vocab.is_multilingual()
    }

    pub fn model_type(&self) -> ModelType {
        self.inner.hparams.model_type()
    }

    pub fn token(&self, kind: SpecialToken) -> TokenId {
        self.inner.vocab.token(kind)
    }

    /// Text of one token, `None` for ids outside the vocabulary.
    pub fn token_to_str(&self, token: TokenId) -> Option<String> {
        self.inner.detokenizer.token_text(token)
    }

    pub(crate) fn frontend(&self) -> &MelFrontend {
        &self.inner.frontend
    }

    pub(crate) fn backend(&self) -> &Arc<dyn ComputeBackend> {
        &self.inner.backend
    }

    pub(crate) fn detokenizer(&self) -> &dyn Detokenizer {
        self.inner.detokenizer.as_ref()
    }

    pub fn timings(&self) -> &ContextTimings {
        &self.inner.timings
    }

    pub fn reset_timings(&self) {
        self.inner.timings.reset();
    }

    /// Log a timing summary at `info`.
    pub fn print_timings(&self) {
        logging::scoped(|| {
            let t = self.inner.timings.snapshot();
            let per = |total: Duration, n: u32| {
                if n == 0 {
                    0.0
                } else {
                    total.as_secs_f64() * 1e3 / f64::from(n)
                }
            };
            info!(
                "load time = {:8.2} ms",
                self.inner.timings.load_time().as_secs_f64() * 1e3
            );
            info!("fallbacks = {:3}", t.n_fallback);
            info!("mel time = {:8.2} ms", t.mel.as_secs_f64() * 1e3);
            info!(
                "sample time = {:8.2} ms / {:5} runs ({:8.2} ms per run)",
                t.sample.as_secs_f64() * 1e3,
                t.n_sample,
                per(t.sample, t.n_sample)
            );
            info!(
                "encode time = {:8.2} ms / {:5} runs ({:8.2} ms per run)",
                t.encode.as_secs_f64() * 1e3,
                t.n_encode,
                per(t.encode, t.n_encode)
            );
            info!(
                "decode time = {:8.2} ms / {:5} runs ({:8.2} ms per run)",
                t.decode.as_secs_f64() * 1e3,
                t.n_decode,
                per(t.decode, t.n_decode)
            );
        });
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("backend", &self.inner.backend.name())
            .field("hparams", &self.inner.hparams)
            .field("params", &self.inner.params)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::stub::StubModel;

    fn ctx() -> Context {
        Context::from_source(&StubModel::new(), ContextParams::default()).expect("stub context")
    }

    #[test]
    fn getters_reflect_hparams() {
        let ctx = ctx();
        assert_eq!(ctx.n_vocab(), 51_865);
        assert_eq!(ctx.n_text_ctx(), 448);
        assert_eq!(ctx.n_audio_ctx(), 1_500);
        assert_eq!(ctx.n_mels(), 80);
        assert!(ctx.is_multilingual());
        assert_eq!(ctx.model_type(), ModelType::Base);
        assert_eq!(ctx.token(SpecialToken::Eot), 50_257);
    }

    #[test]
    fn clones_share_the_model() {
        let a = ctx();
        let b = a.clone();
        assert!(a.same_as(&b));
        assert!(!a.same_as(&ctx()));
    }

    #[test]
    fn unusable_hparams_are_rejected() {
        let source = StubModel::with_hparams(ModelHparams {
            n_mels: 0,
            ..ModelHparams::base()
        });
        assert!(Context::from_source(&source, ContextParams::default()).is_err());

        let tiny_vocab = StubModel::with_hparams(ModelHparams {
            n_vocab: 500,
            ..ModelHparams::base()
        });
        assert!(matches!(
            Context::from_source(&tiny_vocab, ContextParams::default()),
            Err(HarkError::InvalidArgument(_))
        ));
    }

    #[test]
    fn timings_accumulate_and_reset() {
        let ctx = ctx();
        let run = Timings {
            encode: Duration::from_millis(3),
            n_encode: 2,
            ..Timings::default()
        };
        ctx.timings().add(&run);
        ctx.timings().add(&run);
        let snap = ctx.timings().snapshot();
        assert_eq!(snap.n_encode, 4);
        assert_eq!(snap.encode, Duration::from_millis(6));
        ctx.reset_timings();
        assert_eq!(ctx.timings().snapshot(), Timings::default());
    }

    #[test]
    fn states_get_independent_sessions() {
        let model = StubModel::new();
        let stats = model.stats();
        let ctx = Context::from_source(&model, ContextParams::default()).unwrap();
        let _a = ctx.create_state().unwrap();
        let _b = ctx.create_state().unwrap();
        assert_eq!(stats.sessions(), 2);
    }
}
