//! Whisper ONNX backend via the `ort` crate.
//!
//! Targets the HuggingFace `optimum` separate encoder + decoder export:
//! - `encoder_model.onnx`: `input_features [1, n_mels, 3000]` → `last_hidden_state [1, 1500, d_model]`
//! - `decoder_model.onnx`: `input_ids [1, seq]` + `encoder_hidden_states` → `logits [1, seq, n_vocab]`
//! - `tokenizer.json`: HuggingFace fast tokenizer
//! - `config.json`: architecture hyperparameters
//!
//! The two `ort` sessions are loaded once per context and shared by every
//! state behind a `parking_lot::Mutex` (running a session needs `&mut`).
//! Encoder output lives in the per-state [`BackendSession`], so states only
//! contend while a forward pass is actually executing.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use ndarray::{ArrayView2, Axis};
use ort::ep;
use ort::session::builder::{GraphOptimizationLevel, SessionBuilder};
use ort::session::Session;
use ort::value::{TensorRef, Value};
use parking_lot::Mutex;
use serde::Deserialize;
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

use crate::error::{HarkError, Result};
use crate::inference::{
    BackendSession, ComputeBackend, Detokenizer, LoadedModel, ModelHparams, ModelSource,
};
use crate::params::ContextParams;
use crate::vocab::TokenId;

fn backend_err(e: impl std::fmt::Display) -> HarkError {
    HarkError::Backend(e.to_string())
}

// ── Model location ──────────────────────────────────────────────────────────

/// File layout of one exported model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnnxModelConfig {
    pub encoder_path: PathBuf,
    pub decoder_path: PathBuf,
    pub tokenizer_path: PathBuf,
    pub config_path: PathBuf,
}

impl OnnxModelConfig {
    pub fn from_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            encoder_path: dir.join("encoder_model.onnx"),
            decoder_path: dir.join("decoder_model.onnx"),
            tokenizer_path: dir.join("tokenizer.json"),
            config_path: dir.join("config.json"),
        }
    }

    fn required_files(&self) -> [&PathBuf; 4] {
        [
            &self.encoder_path,
            &self.decoder_path,
            &self.tokenizer_path,
            &self.config_path,
        ]
    }
}

impl Default for OnnxModelConfig {
    /// `$HARK_MODEL_DIR` when set, otherwise [`default_models_dir`].
    fn default() -> Self {
        let dir = std::env::var("HARK_MODEL_DIR")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(default_models_dir);
        Self::from_dir(dir)
    }
}

pub fn default_models_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(|p| PathBuf::from(p).join("Hark").join("models"))
            .unwrap_or_else(|| PathBuf::from("models"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".local")
                    .join("share")
            })
            .join("hark")
            .join("models")
    }
}

/// Subset of the HuggingFace `WhisperConfig` we need.
#[derive(Debug, Deserialize)]
struct HfWhisperConfig {
    vocab_size: usize,
    num_mel_bins: usize,
    max_source_positions: usize,
    max_target_positions: usize,
    d_model: usize,
    encoder_layers: usize,
    encoder_attention_heads: usize,
    decoder_layers: usize,
    decoder_attention_heads: usize,
}

impl From<HfWhisperConfig> for ModelHparams {
    fn from(c: HfWhisperConfig) -> Self {
        Self {
            n_vocab: c.vocab_size,
            n_audio_ctx: c.max_source_positions,
            n_audio_state: c.d_model,
            n_audio_head: c.encoder_attention_heads,
            n_audio_layer: c.encoder_layers,
            n_text_ctx: c.max_target_positions,
            n_text_state: c.d_model,
            n_text_head: c.decoder_attention_heads,
            n_text_layer: c.decoder_layers,
            n_mels: c.num_mel_bins,
        }
    }
}

// ── Session construction ────────────────────────────────────────────────────

fn create_session(model_path: &Path, params: &ContextParams) -> Result<Session> {
    let logical_cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    let intra_threads = std::env::var("HARK_ORT_INTRA_THREADS")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(logical_cores.clamp(2, 12))
        .clamp(1, 32);

    let mut builder = SessionBuilder::new()
        .map_err(backend_err)?
        .with_intra_threads(intra_threads)
        .map_err(backend_err)?
        .with_inter_threads(1)
        .map_err(backend_err)?
        .with_optimization_level(GraphOptimizationLevel::All)
        .map_err(backend_err)?;
    info!(
        intra_threads,
        logical_cores,
        use_gpu = params.use_gpu,
        "ONNX session threading configured"
    );

    #[cfg(target_os = "windows")]
    {
        builder = if params.use_gpu {
            builder
                .with_execution_providers([
                    ep::DirectML::default()
                        .with_device_id(params.gpu_device as i32)
                        .build()
                        .fail_silently(),
                    ep::CPU::default().build(),
                ])
                .map_err(backend_err)?
        } else {
            builder
                .with_execution_providers([ep::CPU::default().build()])
                .map_err(backend_err)?
        };
    }

    #[cfg(not(target_os = "windows"))]
    {
        if params.use_gpu {
            debug!("no GPU execution provider on this host; using CPU EP");
        }
        builder = builder
            .with_execution_providers([ep::CPU::default().build()])
            .map_err(backend_err)?;
    }

    builder.commit_from_file(model_path).map_err(backend_err)
}

fn log_session_io(label: &str, session: &Session) {
    for input in session.inputs().iter() {
        debug!(session = label, input = input.name(), "session input");
    }
    for output in session.outputs().iter() {
        debug!(session = label, output = output.name(), "session output");
    }
}

// ── Model source ────────────────────────────────────────────────────────────

/// Loads an `optimum` export from disk.
#[derive(Debug, Clone, Default)]
pub struct OnnxModelSource {
    pub config: OnnxModelConfig,
}

impl OnnxModelSource {
    pub fn new(config: OnnxModelConfig) -> Self {
        Self { config }
    }

    pub fn from_dir(dir: impl AsRef<Path>) -> Self {
        Self::new(OnnxModelConfig::from_dir(dir))
    }
}

impl ModelSource for OnnxModelSource {
    fn load(&self, params: &ContextParams) -> Result<LoadedModel> {
        for path in self.config.required_files() {
            if !path.exists() {
                return Err(HarkError::ModelNotFound { path: path.clone() });
            }
            let size_mb = std::fs::metadata(path)
                .map(|m| m.len() as f64 / 1_048_576.0)
                .unwrap_or(0.0);
            info!("  {:?}: {:.2} MB", path, size_mb);
        }

        let raw = std::fs::read_to_string(&self.config.config_path)?;
        let hparams: ModelHparams = serde_json::from_str::<HfWhisperConfig>(&raw)?.into();

        info!("loading encoder from {:?}", self.config.encoder_path);
        let encoder = create_session(&self.config.encoder_path, params)?;
        log_session_io("encoder", &encoder);

        info!("loading decoder from {:?}", self.config.decoder_path);
        let decoder = create_session(&self.config.decoder_path, params)?;
        log_session_io("decoder", &decoder);

        info!("loading tokenizer from {:?}", self.config.tokenizer_path);
        let tokenizer = Tokenizer::from_file(&self.config.tokenizer_path).map_err(backend_err)?;
        let tokenizer_vocab = tokenizer.get_vocab_size(true);
        if tokenizer_vocab != hparams.n_vocab {
            warn!(
                tokenizer_vocab,
                n_vocab = hparams.n_vocab,
                "tokenizer size differs from model vocabulary"
            );
        }

        Ok(LoadedModel {
            hparams,
            backend: Arc::new(OnnxBackend(Arc::new(OnnxWeights {
                encoder: Mutex::new(encoder),
                decoder: Mutex::new(decoder),
                n_vocab: hparams.n_vocab,
            }))),
            detokenizer: Arc::new(HfDetokenizer { tokenizer }),
        })
    }
}

// ── Backend ─────────────────────────────────────────────────────────────────

/// Sessions shared by every state of one context.
struct OnnxWeights {
    encoder: Mutex<Session>,
    decoder: Mutex<Session>,
    n_vocab: usize,
}

struct OnnxBackend(Arc<OnnxWeights>);

impl ComputeBackend for OnnxBackend {
    fn name(&self) -> &str {
        "onnx"
    }

    fn new_session(&self) -> Result<Box<dyn BackendSession>> {
        Ok(Box::new(OnnxSession {
            weights: Arc::clone(&self.0),
            encoded: None,
        }))
    }
}

/// Encoder output for the current window.
struct EncodedWindow {
    data: Vec<f32>,
    n_frames: usize,
    d_model: usize,
}

struct OnnxSession {
    weights: Arc<OnnxWeights>,
    encoded: Option<EncodedWindow>,
}

impl BackendSession for OnnxSession {
    fn encode(&mut self, mel: ArrayView2<'_, f32>, offset: usize, _n_threads: usize) -> Result<()> {
        // The window view may be strided; the runtime wants standard layout.
        let input = mel.to_owned().insert_axis(Axis(0));
        let value = Value::from_array(input).map_err(backend_err)?;

        let mut encoder = self.weights.encoder.lock();
        let out = encoder
            .run(ort::inputs!["input_features" => value])
            .map_err(backend_err)?;
        let (shape, data) = out["last_hidden_state"]
            .try_extract_tensor::<f32>()
            .map_err(backend_err)?;
        if shape.len() < 3 {
            return Err(HarkError::Backend(format!(
                "unexpected encoder output rank {}",
                shape.len()
            )));
        }
        self.encoded = Some(EncodedWindow {
            data: data.to_vec(),
            n_frames: shape[1] as usize,
            d_model: shape[2] as usize,
        });
        debug!(offset, "encoded window");
        Ok(())
    }

    fn logits(&mut self, tokens: &[TokenId], _n_threads: usize) -> Result<Vec<f32>> {
        let Some(enc) = self.encoded.as_ref() else {
            return Err(HarkError::Backend("logits requested before encode".into()));
        };
        if tokens.is_empty() {
            return Err(HarkError::InvalidArgument("empty decoder input".into()));
        }
        let ids: Vec<i64> = tokens.iter().map(|&t| i64::from(t)).collect();
        let seq = ids.len();

        let input_ids =
            TensorRef::from_array_view(([1_i64, seq as i64], ids.as_slice())).map_err(backend_err)?;
        let encoder_hidden_states = TensorRef::from_array_view((
            [1_i64, enc.n_frames as i64, enc.d_model as i64],
            enc.data.as_slice(),
        ))
        .map_err(backend_err)?;

        let mut decoder = self.weights.decoder.lock();
        let out = decoder
            .run(ort::inputs![
                "input_ids"             => input_ids,
                "encoder_hidden_states" => encoder_hidden_states,
            ])
            .map_err(backend_err)?;
        let (_, logit_data) = out["logits"]
            .try_extract_tensor::<f32>()
            .map_err(backend_err)?;

        // Flat [1 * seq * vocab]; keep the last position only.
        let vocab_size = logit_data.len() / seq;
        if vocab_size != self.weights.n_vocab {
            return Err(HarkError::Backend(format!(
                "decoder produced {vocab_size} logits per position, expected {}",
                self.weights.n_vocab
            )));
        }
        let start = (seq - 1) * vocab_size;
        Ok(logit_data[start..start + vocab_size].to_vec())
    }

    fn reset(&mut self) {
        self.encoded = None;
    }
}

// ── Tokenizer ───────────────────────────────────────────────────────────────

struct HfDetokenizer {
    tokenizer: Tokenizer,
}

impl Detokenizer for HfDetokenizer {
    fn token_text(&self, token: TokenId) -> Option<String> {
        let id = u32::try_from(token).ok()?;
        self.tokenizer.id_to_token(id)?;
        self.tokenizer.decode(&[id], false).ok()
    }

    fn decode(&self, tokens: &[TokenId]) -> String {
        let ids: Vec<u32> = tokens
            .iter()
            .filter_map(|&t| u32::try_from(t).ok())
            .collect();
        self.tokenizer.decode(&ids, true).unwrap_or_else(|e| {
            warn!(error = %e, "tokenizer decode failed");
            String::new()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_paths_follow_dir() {
        let cfg = OnnxModelConfig::from_dir("/models/base");
        assert_eq!(cfg.encoder_path, PathBuf::from("/models/base/encoder_model.onnx"));
        assert_eq!(cfg.tokenizer_path, PathBuf::from("/models/base/tokenizer.json"));
    }

    #[test]
    fn missing_files_report_model_not_found() {
        let source = OnnxModelSource::from_dir("/definitely/not/here");
        assert!(matches!(
            source.load(&ContextParams::default()),
            Err(HarkError::ModelNotFound { .. })
        ));
    }

    #[test]
    fn hf_config_maps_to_hparams() {
        let raw = r#"{
            "vocab_size": 51865, "num_mel_bins": 80,
            "max_source_positions": 1500, "max_target_positions": 448,
            "d_model": 384, "encoder_layers": 4, "encoder_attention_heads": 6,
            "decoder_layers": 4, "decoder_attention_heads": 6,
            "activation_function": "gelu"
        }"#;
        let hparams: ModelHparams = serde_json::from_str::<HfWhisperConfig>(raw)
            .unwrap()
            .into();
        assert_eq!(hparams.n_vocab, 51_865);
        assert_eq!(hparams.n_text_ctx, 448);
        assert_eq!(hparams.model_type().readable(), "tiny");
    }
}
