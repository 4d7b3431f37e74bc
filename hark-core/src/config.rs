//! Persistent engine settings (JSON file) with `HARK_*` environment overrides.
//!
//! Unknown or out-of-range values never fail a load: they are normalised to
//! the nearest sensible setting, and a missing or unreadable file yields the
//! defaults.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::params::{
    default_n_threads, ContextParams, FullParams, SamplingStrategy, StrategyParams,
    DEFAULT_BEAM_SIZE, DEFAULT_BEST_OF,
};
use crate::vocab::LanguageTable;

const MAX_BEAM_SIZE: usize = 16;
const MAX_BEST_OF: usize = 16;
const MAX_PATIENCE: u32 = 16;
const MAX_THREADS: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct EngineSettings {
    /// Directory holding the ONNX model files.
    pub model_dir: Option<String>,
    pub use_gpu: bool,
    pub flash_attn: bool,
    pub gpu_device: u32,
    /// `"greedy"` or `"beam_search"`.
    pub strategy: String,
    pub beam_size: usize,
    pub best_of: usize,
    pub patience: u32,
    /// `0` picks the hardware default.
    pub n_threads: usize,
    /// Language code, or `"auto"`.
    pub language: String,
    pub translate: bool,
    pub no_timestamps: bool,
    pub token_timestamps: bool,
    pub print_progress: bool,
    pub max_tokens: usize,
    pub temperature: f32,
    pub temperature_inc: f32,
    pub logprob_thold: f32,
    pub entropy_thold: f32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        let params = FullParams::default();
        let context = ContextParams::default();
        Self {
            model_dir: None,
            use_gpu: context.use_gpu,
            flash_attn: context.flash_attn,
            gpu_device: context.gpu_device,
            strategy: SamplingStrategy::Greedy.name().into(),
            beam_size: DEFAULT_BEAM_SIZE,
            best_of: DEFAULT_BEST_OF,
            patience: 0,
            n_threads: 0,
            language: "auto".into(),
            translate: false,
            no_timestamps: false,
            token_timestamps: false,
            print_progress: params.print_progress,
            max_tokens: 0,
            temperature: params.temperature,
            temperature_inc: params.temperature_inc,
            logprob_thold: params.logprob_thold,
            entropy_thold: params.entropy_thold,
        }
    }
}

impl EngineSettings {
    pub fn normalize(&mut self) {
        self.strategy = normalize_strategy(&self.strategy);
        self.language = normalize_language(&self.language);
        self.beam_size = self.beam_size.clamp(1, MAX_BEAM_SIZE);
        self.best_of = self.best_of.clamp(1, MAX_BEST_OF);
        self.patience = self.patience.min(MAX_PATIENCE);
        self.n_threads = self.n_threads.min(MAX_THREADS);
        self.temperature = finite_or(self.temperature, 0.0).clamp(0.0, 1.0);
        self.temperature_inc = finite_or(self.temperature_inc, 0.2).clamp(0.0, 1.0);
        self.logprob_thold = finite_or(self.logprob_thold, -1.0);
        self.entropy_thold = finite_or(self.entropy_thold, 2.4).max(0.0);
        self.model_dir = self
            .model_dir
            .take()
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty());
    }

    /// Apply `HARK_*` overrides from `lookup`, then normalise.
    ///
    /// Values that do not parse are ignored with a warning.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("HARK_N_THREADS") {
            parse_into(&mut self.n_threads, "HARK_N_THREADS", &v);
        }
        if let Some(v) = lookup("HARK_LANGUAGE") {
            self.language = v;
        }
        if let Some(v) = lookup("HARK_STRATEGY") {
            self.strategy = v;
        }
        if let Some(v) = lookup("HARK_BEAM_SIZE") {
            parse_into(&mut self.beam_size, "HARK_BEAM_SIZE", &v);
        }
        if let Some(v) = lookup("HARK_USE_GPU") {
            flag_into(&mut self.use_gpu, "HARK_USE_GPU", &v);
        }
        if let Some(v) = lookup("HARK_FLASH_ATTN") {
            flag_into(&mut self.flash_attn, "HARK_FLASH_ATTN", &v);
        }
        if let Some(v) = lookup("HARK_TRANSLATE") {
            flag_into(&mut self.translate, "HARK_TRANSLATE", &v);
        }
        if let Some(v) = lookup("HARK_MODEL_DIR") {
            self.model_dir = Some(v);
        }
        self.normalize();
    }

    /// [`apply_overrides`](Self::apply_overrides) from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    pub fn context_params(&self) -> ContextParams {
        ContextParams {
            use_gpu: self.use_gpu,
            flash_attn: self.flash_attn,
            gpu_device: self.gpu_device,
        }
    }

    pub fn full_params(&self) -> FullParams {
        let strategy = self
            .strategy
            .parse::<SamplingStrategy>()
            .unwrap_or(SamplingStrategy::Greedy);
        let mut params = FullParams::new(strategy);
        params.strategy_params = match strategy {
            SamplingStrategy::Greedy => StrategyParams::Greedy {
                best_of: self.best_of.max(1),
            },
            SamplingStrategy::BeamSearch => StrategyParams::BeamSearch {
                beam_size: self.beam_size.max(1),
                patience: self.patience,
            },
        };
        params.n_threads = if self.n_threads == 0 {
            default_n_threads()
        } else {
            self.n_threads
        };
        params.language = self.language.clone();
        params.translate = self.translate;
        params.no_timestamps = self.no_timestamps;
        params.token_timestamps = self.token_timestamps;
        params.print_progress = self.print_progress;
        params.max_tokens = self.max_tokens;
        params.temperature = self.temperature;
        params.temperature_inc = self.temperature_inc;
        params.logprob_thold = self.logprob_thold;
        params.entropy_thold = self.entropy_thold;
        params
    }
}

fn finite_or(value: f32, fallback: f32) -> f32 {
    if value.is_finite() {
        value
    } else {
        fallback
    }
}

fn parse_into<T: std::str::FromStr>(slot: &mut T, key: &str, raw: &str) {
    match raw.trim().parse() {
        Ok(v) => *slot = v,
        Err(_) => warn!(key, value = raw, "ignoring unparsable override"),
    }
}

fn flag_into(slot: &mut bool, key: &str, raw: &str) {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => *slot = true,
        "0" | "false" | "no" | "off" => *slot = false,
        _ => warn!(key, value = raw, "ignoring unparsable flag"),
    }
}

pub fn normalize_strategy(raw: &str) -> String {
    match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
        "beam_search" | "beam" => SamplingStrategy::BeamSearch.name().into(),
        _ => SamplingStrategy::Greedy.name().into(),
    }
}

/// Canonical short code, or `"auto"` when the value names no known language.
pub fn normalize_language(raw: &str) -> String {
    let lowered = raw.trim().to_ascii_lowercase();
    let table = LanguageTable::global();
    table
        .code(table.id(&lowered))
        .map_or_else(|| "auto".into(), str::to_string)
}

pub fn default_settings_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Hark")
            .join("settings.json")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".config")
            })
            .join("hark")
            .join("settings.json")
    }
}

pub fn load_settings(path: &Path) -> EngineSettings {
    let mut settings = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<EngineSettings>(&raw).ok())
        .unwrap_or_default();
    settings.normalize();
    settings
}

pub fn save_settings(path: &Path, settings: &EngineSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn scratch(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("hark-config-{}-{name}", std::process::id()))
            .join("settings.json")
    }

    #[test]
    fn normalize_clamps_out_of_range_values() {
        let mut s = EngineSettings {
            strategy: " Beam-Search ".into(),
            language: "English".into(),
            beam_size: 0,
            best_of: 500,
            n_threads: 10_000,
            temperature: 7.0,
            entropy_thold: f32::NAN,
            model_dir: Some("   ".into()),
            ..EngineSettings::default()
        };
        s.normalize();
        assert_eq!(s.strategy, "beam_search");
        assert_eq!(s.language, "en");
        assert_eq!(s.beam_size, 1);
        assert_eq!(s.best_of, MAX_BEST_OF);
        assert_eq!(s.n_threads, MAX_THREADS);
        assert_eq!(s.temperature, 1.0);
        assert_eq!(s.entropy_thold, 2.4);
        assert_eq!(s.model_dir, None);
    }

    #[test]
    fn unknown_values_fall_back() {
        assert_eq!(normalize_strategy("bogus"), "greedy");
        assert_eq!(normalize_language("klingon"), "auto");
        assert_eq!(normalize_language(""), "auto");
        assert_eq!(normalize_language("DE"), "de");
    }

    #[test]
    fn overrides_win_and_bad_values_are_ignored() {
        let env: HashMap<&str, &str> = [
            ("HARK_N_THREADS", "3"),
            ("HARK_STRATEGY", "beam_search"),
            ("HARK_BEAM_SIZE", "lots"),
            ("HARK_USE_GPU", "off"),
            ("HARK_TRANSLATE", "yes"),
            ("HARK_LANGUAGE", "fr"),
            ("HARK_MODEL_DIR", "/models/base"),
        ]
        .into_iter()
        .collect();
        let mut s = EngineSettings::default();
        s.apply_overrides(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(s.n_threads, 3);
        assert_eq!(s.strategy, "beam_search");
        assert_eq!(s.beam_size, DEFAULT_BEAM_SIZE);
        assert!(!s.use_gpu);
        assert!(s.translate);
        assert_eq!(s.language, "fr");
        assert_eq!(s.model_dir.as_deref(), Some("/models/base"));
    }

    #[test]
    fn settings_convert_to_params() {
        let s = EngineSettings {
            strategy: "beam_search".into(),
            beam_size: 3,
            patience: 2,
            n_threads: 2,
            language: "de".into(),
            use_gpu: false,
            ..EngineSettings::default()
        };
        let full = s.full_params();
        assert_eq!(
            full.strategy_params,
            StrategyParams::BeamSearch {
                beam_size: 3,
                patience: 2
            }
        );
        assert_eq!(full.n_threads, 2);
        assert_eq!(full.language, "de");
        assert!(full.validate().is_ok());
        assert!(!s.context_params().use_gpu);

        let auto_threads = EngineSettings::default().full_params();
        assert!(auto_threads.n_threads > 0);
    }

    #[test]
    fn save_then_load_round_trips() {
        let path = scratch("roundtrip");
        let settings = EngineSettings {
            language: "ja".into(),
            token_timestamps: true,
            ..EngineSettings::default()
        };
        save_settings(&path, &settings).unwrap();
        assert_eq!(load_settings(&path), settings);
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn missing_or_corrupt_file_gives_defaults() {
        assert_eq!(
            load_settings(Path::new("/definitely/not/here.json")),
            EngineSettings::default()
        );
        let path = scratch("corrupt");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "{ not json").unwrap();
        assert_eq!(load_settings(&path), EngineSettings::default());
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn partial_file_keeps_defaults_for_missing_keys() {
        let path = scratch("partial");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, r#"{"beamSize": 8, "strategy": "beam_search"}"#).unwrap();
        let s = load_settings(&path);
        assert_eq!(s.beam_size, 8);
        assert_eq!(s.language, "auto");
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }
}
