//! Construction-time and per-run configuration.
//!
//! `FullParams` carries a strategy payload as a tagged enum so greedy and
//! beam-search settings can never be live at the same time.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{HarkError, Result};
use crate::logging;
use crate::state::Segment;
use crate::vocab::{LanguageTable, TokenId};

/// Default beam width.
pub const DEFAULT_BEAM_SIZE: usize = 5;
/// Default number of sampled candidates at non-zero temperature.
pub const DEFAULT_BEST_OF: usize = 5;

/// Called with the integer progress percentage (0–100).
pub type ProgressCallback = Arc<dyn Fn(i32) + Send + Sync>;
/// Polled at every step boundary; returning `true` stops decoding.
pub type AbortCallback = Arc<dyn Fn() -> bool + Send + Sync>;
/// Called once for every completed segment, in order.
pub type NewSegmentCallback = Arc<dyn Fn(&Segment) + Send + Sync>;

/// Device configuration copied into a context at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextParams {
    pub use_gpu: bool,
    pub flash_attn: bool,
    pub gpu_device: u32,
}

impl Default for ContextParams {
    fn default() -> Self {
        Self {
            use_gpu: true,
            flash_attn: true,
            gpu_device: 0,
        }
    }
}

/// Decoding strategy discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
pub enum SamplingStrategy {
    Greedy = 0,
    BeamSearch = 1,
}

impl SamplingStrategy {
    pub fn name(self) -> &'static str {
        match self {
            SamplingStrategy::Greedy => "greedy",
            SamplingStrategy::BeamSearch => "beam_search",
        }
    }
}

impl fmt::Display for SamplingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SamplingStrategy {
    type Err = HarkError;

    /// Exact, case-sensitive match on the canonical names.
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "greedy" => Ok(SamplingStrategy::Greedy),
            "beam_search" => Ok(SamplingStrategy::BeamSearch),
            other => Err(HarkError::UnknownStrategy(other.to_string())),
        }
    }
}

/// Strategy-specific settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StrategyParams {
    Greedy {
        /// Candidates sampled per attempt once temperature is above zero.
        best_of: usize,
    },
    BeamSearch {
        beam_size: usize,
        /// Consecutive non-improving steps tolerated once a hypothesis has
        /// finished. `0` disables the check.
        patience: u32,
    },
}

impl StrategyParams {
    pub fn defaults(strategy: SamplingStrategy) -> Self {
        match strategy {
            SamplingStrategy::Greedy => StrategyParams::Greedy {
                best_of: DEFAULT_BEST_OF,
            },
            SamplingStrategy::BeamSearch => StrategyParams::BeamSearch {
                beam_size: DEFAULT_BEAM_SIZE,
                patience: 0,
            },
        }
    }

    pub fn strategy(&self) -> SamplingStrategy {
        match self {
            StrategyParams::Greedy { .. } => SamplingStrategy::Greedy,
            StrategyParams::BeamSearch { .. } => SamplingStrategy::BeamSearch,
        }
    }
}

/// Per-run configuration.
#[derive(Clone)]
pub struct FullParams {
    pub strategy_params: StrategyParams,

    pub n_threads: usize,
    /// Translate to English instead of transcribing.
    pub translate: bool,
    /// Short code, full name, or `"auto"`.
    pub language: String,
    /// Stop after language detection.
    pub detect_language: bool,
    pub print_progress: bool,

    /// Do not feed the previous window's text back as a prompt.
    pub no_context: bool,
    pub no_timestamps: bool,
    /// Interpolate per-token start/end times inside each segment.
    pub token_timestamps: bool,

    pub offset_ms: u64,
    /// `0` processes until the end of the input.
    pub duration_ms: u64,
    /// Per-window token limit; `0` means bounded only by the text context.
    pub max_tokens: usize,
    /// Latest allowed first timestamp, in seconds. Finite and `>= 0`; `0` removes the bound.
    pub max_initial_ts: f32,

    pub temperature: f32,
    pub temperature_inc: f32,
    /// Retry at higher temperature when the average log-probability is below this.
    pub logprob_thold: f32,
    /// Retry at higher temperature when token entropy is below this (repetition).
    pub entropy_thold: f32,

    /// Pre-tokenized prompt placed after `<|startofprev|>`.
    pub prompt_tokens: Vec<TokenId>,

    pub progress_callback: Option<ProgressCallback>,
    pub abort_callback: Option<AbortCallback>,
    pub new_segment_callback: Option<NewSegmentCallback>,
}

impl FullParams {
    pub fn new(strategy: SamplingStrategy) -> Self {
        Self {
            strategy_params: StrategyParams::defaults(strategy),
            n_threads: default_n_threads(),
            translate: false,
            language: "auto".into(),
            detect_language: false,
            print_progress: true,
            no_context: true,
            no_timestamps: false,
            token_timestamps: false,
            offset_ms: 0,
            duration_ms: 0,
            max_tokens: 0,
            max_initial_ts: 1.0,
            temperature: 0.0,
            temperature_inc: 0.2,
            logprob_thold: -1.0,
            entropy_thold: 2.4,
            prompt_tokens: Vec::new(),
            progress_callback: None,
            abort_callback: None,
            new_segment_callback: None,
        }
    }

    pub fn strategy(&self) -> SamplingStrategy {
        self.strategy_params.strategy()
    }

    pub fn with_n_threads(mut self, n_threads: usize) -> Self {
        self.n_threads = n_threads;
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    pub fn with_translate(mut self, translate: bool) -> Self {
        self.translate = translate;
        self
    }

    pub fn with_print_progress(mut self, print_progress: bool) -> Self {
        self.print_progress = print_progress;
        self
    }

    pub fn with_beam_size(mut self, beam_size: usize) -> Self {
        if let StrategyParams::BeamSearch { patience, .. } = self.strategy_params {
            self.strategy_params = StrategyParams::BeamSearch {
                beam_size,
                patience,
            };
        }
        self
    }

    pub fn with_progress_callback(mut self, cb: impl Fn(i32) + Send + Sync + 'static) -> Self {
        self.progress_callback = Some(Arc::new(cb));
        self
    }

    pub fn with_abort_callback(mut self, cb: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.abort_callback = Some(Arc::new(cb));
        self
    }

    pub fn with_new_segment_callback(
        mut self,
        cb: impl Fn(&Segment) + Send + Sync + 'static,
    ) -> Self {
        self.new_segment_callback = Some(Arc::new(cb));
        self
    }

    /// Whether `language` asks for detection.
    pub fn is_auto_language(&self) -> bool {
        self.language.is_empty() || self.language == "auto"
    }

    /// Reject settings no run could honour.
    pub fn validate(&self) -> Result<()> {
        if self.n_threads == 0 {
            return Err(HarkError::InvalidArgument("n_threads must be > 0".into()));
        }
        match self.strategy_params {
            StrategyParams::Greedy { best_of: 0 } => {
                return Err(HarkError::InvalidArgument("best_of must be > 0".into()));
            }
            StrategyParams::BeamSearch { beam_size: 0, .. } => {
                return Err(HarkError::InvalidArgument("beam_size must be > 0".into()));
            }
            _ => {}
        }
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(HarkError::InvalidArgument(format!(
                "temperature must be a non-negative number, got {}",
                self.temperature
            )));
        }
        if !self.max_initial_ts.is_finite() || self.max_initial_ts < 0.0 {
            return Err(HarkError::InvalidArgument(format!(
                "max_initial_ts must be a non-negative number of seconds, got {}",
                self.max_initial_ts
            )));
        }
        if !self.is_auto_language() && LanguageTable::global().id(&self.language) < 0 {
            return Err(HarkError::UnknownLanguage(self.language.clone()));
        }
        Ok(())
    }

    pub(crate) fn should_abort(&self) -> bool {
        self.abort_callback
            .as_ref()
            .is_some_and(|cb| logging::host(|| cb()))
    }
}

impl Default for FullParams {
    fn default() -> Self {
        Self::new(SamplingStrategy::Greedy)
    }
}

impl fmt::Debug for FullParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FullParams")
            .field("strategy_params", &self.strategy_params)
            .field("n_threads", &self.n_threads)
            .field("translate", &self.translate)
            .field("language", &self.language)
            .field("no_timestamps", &self.no_timestamps)
            .field("temperature", &self.temperature)
            .field("progress_callback", &self.progress_callback.is_some())
            .field("abort_callback", &self.abort_callback.is_some())
            .field("new_segment_callback", &self.new_segment_callback.is_some())
            .finish_non_exhaustive()
    }
}

/// Hardware concurrency capped at 4, never zero.
pub fn default_n_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .clamp(1, 4)
}
