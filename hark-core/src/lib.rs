//! # hark-core
//!
//! Control plane of a Whisper-style speech recognizer.
//!
//! ## Architecture
//!
//! ```text
//! ModelSource ──load──► Context (Arc, read-only) ──create_state──► State (&mut)
//!                          │                                          │
//!                   vocab, mel filters,                     mel, backend session,
//!                   backend weights                         segments, timings
//!
//! engine::full(state, params, pcm)
//!     pcm ─► MelFrontend ─► [30 s window] ─► BackendSession::encode
//!                                 │
//!                    greedy / beam search over BackendSession::logits
//!                                 │
//!                      timestamp tokens ─► Segments
//! ```
//!
//! Neural inference sits behind the [`inference::ComputeBackend`] seam. The
//! crate ships a scripted [`inference::stub::StubModel`] and, with the `onnx`
//! feature, an ONNX Runtime backend.

#![deny(unsafe_code)]
#![warn(clippy::all)]

pub mod api;
pub mod audio;
pub mod config;
pub mod context;
pub mod decode;
pub mod engine;
pub mod error;
pub mod inference;
pub mod logging;
pub mod params;
pub mod state;
pub mod vocab;

// Convenience re-exports for downstream crates
pub use audio::{MelFrontend, MelSpectrogram};
pub use config::EngineSettings;
pub use context::Context;
pub use engine::{full, full_from_mel, lang_auto_detect, RunStatus};
pub use error::{HarkError, Result, StatusCode};
pub use inference::{
    BackendSession, ComputeBackend, Detokenizer, LoadedModel, ModelHparams, ModelSource,
    ModelType,
};
pub use logging::{LogCallback, LogLevel};
pub use params::{ContextParams, FullParams, SamplingStrategy, StrategyParams};
pub use state::{DecodePhase, Segment, State, Timings, TokenData};
pub use vocab::{SpecialToken, TokenId, Vocab};

#[cfg(feature = "onnx")]
pub use inference::{OnnxModelConfig, OnnxModelSource};
