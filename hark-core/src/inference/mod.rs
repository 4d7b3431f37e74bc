//! Compute backend abstraction.
//!
//! The engine never touches weights directly. A [`ModelSource`] loads a
//! model once into a [`LoadedModel`]; the shared [`ComputeBackend`] inside it
//! hands out one [`BackendSession`] per [`crate::State`], and the session
//! owns all mutable scratch (encoder output, KV caches).
//!
//! `&mut self` on session methods expresses that sessions are stateful and
//! never shared: two states decoding concurrently hold two sessions, while
//! the backend behind them is read-only.

pub mod stub;

#[cfg(feature = "onnx")]
pub mod onnx;

#[cfg(feature = "onnx")]
pub use onnx::{OnnxModelConfig, OnnxModelSource};

use std::fmt;
use std::sync::Arc;

use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::params::ContextParams;
use crate::vocab::TokenId;

/// Architecture hyperparameters reported by a loaded model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelHparams {
    pub n_vocab: usize,
    pub n_audio_ctx: usize,
    pub n_audio_state: usize,
    pub n_audio_head: usize,
    pub n_audio_layer: usize,
    pub n_text_ctx: usize,
    pub n_text_state: usize,
    pub n_text_head: usize,
    pub n_text_layer: usize,
    pub n_mels: usize,
}

impl ModelHparams {
    /// Hyperparameters of the multilingual `base` checkpoint.
    pub fn base() -> Self {
        Self {
            n_vocab: 51_865,
            n_audio_ctx: 1_500,
            n_audio_state: 512,
            n_audio_head: 8,
            n_audio_layer: 6,
            n_text_ctx: 448,
            n_text_state: 512,
            n_text_head: 8,
            n_text_layer: 6,
            n_mels: 80,
        }
    }

    pub fn model_type(&self) -> ModelType {
        ModelType::from_audio_layers(self.n_audio_layer)
    }
}

/// Size class inferred from the encoder depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelType {
    Unknown,
    Tiny,
    Base,
    Small,
    Medium,
    Large,
}

impl ModelType {
    pub fn from_audio_layers(n_audio_layer: usize) -> Self {
        match n_audio_layer {
            4 => ModelType::Tiny,
            6 => ModelType::Base,
            12 => ModelType::Small,
            24 => ModelType::Medium,
            32 => ModelType::Large,
            _ => ModelType::Unknown,
        }
    }

    pub fn readable(self) -> &'static str {
        match self {
            ModelType::Unknown => "unknown",
            ModelType::Tiny => "tiny",
            ModelType::Base => "base",
            ModelType::Small => "small",
            ModelType::Medium => "medium",
            ModelType::Large => "large",
        }
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.readable())
    }
}

/// Maps token ids back to text.
pub trait Detokenizer: Send + Sync {
    /// Text of a single token, `None` when the id is outside the vocabulary.
    fn token_text(&self, token: TokenId) -> Option<String>;

    /// Text of a token run. The default concatenates per-token pieces.
    fn decode(&self, tokens: &[TokenId]) -> String {
        tokens.iter().filter_map(|&t| self.token_text(t)).collect()
    }
}

/// Per-state inference session.
pub trait BackendSession: Send {
    /// Run the encoder over one window of the mel matrix.
    ///
    /// `mel` is always a full window (`n_mels × 3000`); `offset` is the
    /// window's first frame within the whole recording.
    ///
    /// # Errors
    /// Backend failures surface as [`crate::HarkError::Backend`].
    fn encode(&mut self, mel: ArrayView2<'_, f32>, offset: usize, n_threads: usize) -> Result<()>;

    /// Next-token logits for `tokens` against the last encoded window.
    ///
    /// The returned vector has exactly `n_vocab` entries.
    fn logits(&mut self, tokens: &[TokenId], n_threads: usize) -> Result<Vec<f32>>;

    /// Drop encoder output and caches.
    fn reset(&mut self);
}

/// Shared, immutable model weights.
pub trait ComputeBackend: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Allocate a fresh session.
    ///
    /// # Errors
    /// [`crate::HarkError::ResourceExhausted`] when scratch memory cannot be
    /// reserved.
    fn new_session(&self) -> Result<Box<dyn BackendSession>>;
}

/// Everything a context needs from a freshly loaded model.
#[derive(Clone)]
pub struct LoadedModel {
    pub hparams: ModelHparams,
    pub backend: Arc<dyn ComputeBackend>,
    pub detokenizer: Arc<dyn Detokenizer>,
}

impl fmt::Debug for LoadedModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedModel")
            .field("hparams", &self.hparams)
            .field("backend", &self.backend.name())
            .finish_non_exhaustive()
    }
}

/// Something a model can be loaded from (a directory, an in-memory stub).
pub trait ModelSource {
    /// # Errors
    /// [`crate::HarkError::ModelNotFound`] / `Io` for unreadable inputs,
    /// `Backend` when the runtime rejects the model.
    fn load(&self, params: &ContextParams) -> Result<LoadedModel>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_type_follows_encoder_depth() {
        assert_eq!(ModelHparams::base().model_type(), ModelType::Base);
        assert_eq!(ModelType::from_audio_layers(4).readable(), "tiny");
        assert_eq!(ModelType::from_audio_layers(32).readable(), "large");
        assert_eq!(ModelType::from_audio_layers(7), ModelType::Unknown);
        assert_eq!(ModelType::Medium.to_string(), "medium");
    }

    #[test]
    fn default_decode_concatenates_pieces() {
        struct Letters;
        impl Detokenizer for Letters {
            fn token_text(&self, token: TokenId) -> Option<String> {
                u8::try_from(token)
                    .ok()
                    .filter(u8::is_ascii_lowercase)
                    .map(|b| (b as char).to_string())
            }
        }
        let ids: Vec<TokenId> = "hark".bytes().map(TokenId::from).collect();
        assert_eq!(Letters.decode(&ids), "hark");
        assert_eq!(Letters.decode(&[-1, 104, 1_000]), "h");
    }
}
