//! End-to-end latency benchmark.
//!
//! Runs `engine::full` over WAV files (or synthetic audio) and reports
//! latency percentiles and real-time factor as JSON. Without `--model-dir`
//! the scripted stub backend is used, which measures the control plane
//! alone: mel extraction, logit filtering, search and segmentation.

use std::path::{Path, PathBuf};
use std::time::Instant;

use hark_core::audio::resample::to_model_rate;
use hark_core::audio::SAMPLE_RATE;
use hark_core::config::{default_settings_path, load_settings};
use hark_core::inference::stub::StubModel;
use hark_core::logging::init_tracing;
use hark_core::{engine, Context, ModelSource, RunStatus, SamplingStrategy, StrategyParams};
use serde::Serialize;
use tracing::info;

#[derive(Debug)]
struct Args {
    inputs: Vec<PathBuf>,
    synthetic_secs: u32,
    iterations: usize,
    strategy: Option<SamplingStrategy>,
    beam_size: Option<usize>,
    model_dir: Option<PathBuf>,
    output: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct CaseResult {
    input: String,
    iteration: usize,
    audio_secs: f64,
    latency_ms: f64,
    real_time_factor: f64,
    segments: usize,
    text_len: usize,
    aborted: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct Summary {
    backend: String,
    strategy: String,
    total_runs: usize,
    p50_latency_ms: f64,
    p95_latency_ms: f64,
    avg_latency_ms: f64,
    avg_real_time_factor: f64,
    cases: Vec<CaseResult>,
}

fn main() {
    init_tracing();
    if let Err(e) = run() {
        eprintln!("benchmark failed: {e}");
        std::process::exit(1);
    }
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args {
        inputs: Vec::new(),
        synthetic_secs: 65,
        iterations: 1,
        strategy: None,
        beam_size: None,
        model_dir: None,
        output: None,
    };

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        let mut value = |name: &str| it.next().ok_or(format!("missing value for {name}"));
        match arg.as_str() {
            "--wav" => args.inputs.push(PathBuf::from(value("--wav")?)),
            "--seconds" => {
                args.synthetic_secs = value("--seconds")?
                    .parse::<u32>()
                    .map_err(|_| "invalid value for --seconds".to_string())?
                    .clamp(1, 600);
            }
            "--iterations" => {
                args.iterations = value("--iterations")?
                    .parse::<usize>()
                    .map_err(|_| "invalid value for --iterations".to_string())?
                    .clamp(1, 50);
            }
            "--strategy" => {
                args.strategy = Some(
                    value("--strategy")?
                        .parse::<SamplingStrategy>()
                        .map_err(|e| e.to_string())?,
                );
            }
            "--beam-size" => {
                args.beam_size = Some(
                    value("--beam-size")?
                        .parse::<usize>()
                        .map_err(|_| "invalid value for --beam-size".to_string())?,
                );
            }
            "--model-dir" => args.model_dir = Some(PathBuf::from(value("--model-dir")?)),
            "--output" => args.output = Some(PathBuf::from(value("--output")?)),
            "--help" | "-h" => {
                println!(
                    "Usage: cargo run -p hark-core --bin benchmark -- \\
  [--wav <file>]... [--seconds <n>] [--iterations <n>] \\
  [--strategy greedy|beam_search] [--beam-size <n>] \\
  [--model-dir <dir> (needs --features onnx)] [--output <file.json>]"
                );
                std::process::exit(0);
            }
            other => return Err(format!("unknown argument: {other}")),
        }
    }
    Ok(args)
}

fn load_source(model_dir: Option<&Path>) -> Result<Box<dyn ModelSource>, String> {
    match model_dir {
        None => Ok(Box::new(StubModel::new())),
        #[cfg(feature = "onnx")]
        Some(dir) => Ok(Box::new(hark_core::OnnxModelSource::from_dir(dir))),
        #[cfg(not(feature = "onnx"))]
        Some(_) => Err("--model-dir requires the 'onnx' feature".into()),
    }
}

/// Full-scale value of a signed integer sample of `bits` width.
fn int_full_scale(bits: u16) -> Result<f32, String> {
    if !(1..=32).contains(&bits) {
        return Err(format!("unsupported integer sample width: {bits} bits"));
    }
    Ok(((1_i64 << (bits - 1)) - 1) as f32)
}

/// Decode a WAV file to mono f32 at its native rate, averaging channels.
fn read_wav_mono_f32(path: &Path) -> Result<(Vec<f32>, u32), String> {
    let mut reader = hound::WavReader::open(path).map_err(|e| format!("{}: {e}", path.display()))?;
    let spec = reader.spec();
    let channels = usize::from(spec.channels.max(1));

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<Result<_, _>>()
            .map_err(|e| e.to_string())?,
        hound::SampleFormat::Int => {
            let max = int_full_scale(spec.bits_per_sample)?;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / max))
                .collect::<Result<_, _>>()
                .map_err(|e| e.to_string())?
        }
    };

    if channels == 1 {
        return Ok((interleaved, spec.sample_rate));
    }
    let mono = interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect();
    Ok((mono, spec.sample_rate))
}

/// Deterministic speech-band test signal.
fn synthetic_audio(secs: u32) -> Vec<f32> {
    let n = secs as usize * SAMPLE_RATE as usize;
    (0..n)
        .map(|i| {
            let t = i as f32 / SAMPLE_RATE as f32;
            0.3 * (2.0 * std::f32::consts::PI * 220.0 * t).sin()
                + 0.1 * (2.0 * std::f32::consts::PI * 1_250.0 * t).sin()
        })
        .collect()
}

fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() - 1) as f64 * p).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn run() -> Result<(), String> {
    let args = parse_args()?;

    let mut settings = load_settings(&default_settings_path());
    settings.apply_env();
    if let Some(strategy) = args.strategy {
        settings.strategy = strategy.name().into();
    }
    if let Some(beam_size) = args.beam_size {
        settings.beam_size = beam_size;
    }
    settings.normalize();
    let model_dir = args
        .model_dir
        .clone()
        .or_else(|| settings.model_dir.as_ref().map(PathBuf::from));

    let source = load_source(model_dir.as_deref())?;
    let ctx = Context::from_source(source.as_ref(), settings.context_params())
        .map_err(|e| e.to_string())?;
    let mut state = ctx.create_state().map_err(|e| e.to_string())?;
    let params = settings.full_params().with_print_progress(false);

    let mut inputs: Vec<(String, Vec<f32>)> = Vec::new();
    for path in &args.inputs {
        let (raw, rate) = read_wav_mono_f32(path)?;
        let samples = to_model_rate(&raw, rate).map_err(|e| e.to_string())?;
        inputs.push((path.display().to_string(), samples));
    }
    if inputs.is_empty() {
        inputs.push((
            format!("synthetic-{}s", args.synthetic_secs),
            synthetic_audio(args.synthetic_secs),
        ));
    }

    let mut cases = Vec::new();
    for (name, samples) in &inputs {
        let audio_secs = samples.len() as f64 / f64::from(SAMPLE_RATE);
        for iteration in 0..args.iterations {
            let started = Instant::now();
            let status = engine::full(&mut state, &params, samples).map_err(|e| e.to_string())?;
            let latency_ms = started.elapsed().as_secs_f64() * 1e3;
            let case = CaseResult {
                input: name.clone(),
                iteration,
                audio_secs,
                latency_ms,
                real_time_factor: latency_ms / 1e3 / audio_secs.max(1e-9),
                segments: state.n_segments(),
                text_len: state.full_text().len(),
                aborted: status == RunStatus::Aborted,
            };
            info!(
                input = %case.input,
                iteration,
                latency_ms = case.latency_ms,
                rtf = case.real_time_factor,
                segments = case.segments,
                "run finished"
            );
            cases.push(case);
        }
    }

    let mut latencies: Vec<f64> = cases.iter().map(|c| c.latency_ms).collect();
    latencies.sort_by(f64::total_cmp);
    let total = cases.len().max(1) as f64;
    let strategy = match params.strategy_params {
        StrategyParams::Greedy { best_of } => format!("greedy (best_of {best_of})"),
        StrategyParams::BeamSearch { beam_size, patience } => {
            format!("beam_search (beam {beam_size}, patience {patience})")
        }
    };
    let summary = Summary {
        backend: format!("{:?}", ctx.model_type()),
        strategy,
        total_runs: cases.len(),
        p50_latency_ms: percentile(&latencies, 0.5),
        p95_latency_ms: percentile(&latencies, 0.95),
        avg_latency_ms: latencies.iter().sum::<f64>() / total,
        avg_real_time_factor: cases.iter().map(|c| c.real_time_factor).sum::<f64>() / total,
        cases,
    };

    ctx.print_timings();

    let json = serde_json::to_string_pretty(&summary).map_err(|e| e.to_string())?;
    match &args.output {
        Some(path) => std::fs::write(path, json).map_err(|e| e.to_string())?,
        None => println!("{json}"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_widths_outside_the_wav_range_are_rejected() {
        assert!(int_full_scale(0).is_err());
        assert!(int_full_scale(33).is_err());
        assert_eq!(int_full_scale(16).unwrap(), f32::from(i16::MAX));
        assert_eq!(int_full_scale(24).unwrap(), 8_388_607.0);
    }

    #[test]
    fn stereo_wav_is_averaged_to_mono() {
        let path = std::env::temp_dir().join(format!("hark-bench-{}.wav", std::process::id()));
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 16_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut w = hound::WavWriter::create(&path, spec).unwrap();
        for s in [i16::MAX, 0, 0, 0, i16::MAX, i16::MAX] {
            w.write_sample(s).unwrap();
        }
        w.finalize().unwrap();

        let (mono, rate) = read_wav_mono_f32(&path).unwrap();
        let _ = std::fs::remove_file(&path);
        assert_eq!(rate, 16_000);
        assert_eq!(mono.len(), 3);
        assert!((mono[0] - 0.5).abs() < 1e-4);
        assert!(mono[1].abs() < 1e-6);
        assert!((mono[2] - 1.0).abs() < 1e-4);
    }

    #[test]
    fn percentile_picks_nearest_rank() {
        let sorted = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(percentile(&sorted, 0.5), 3.0);
        assert_eq!(percentile(&sorted, 0.95), 5.0);
        assert_eq!(percentile(&[], 0.5), 0.0);
    }
}
