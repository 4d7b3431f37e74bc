//! One window's decode, with temperature fallback.
//!
//! The first attempt runs the configured strategy at `temperature`. When the
//! result looks unreliable (low average log-probability, or a repetition
//! loop detected by low token entropy) the window is decoded again at a
//! higher temperature, up to 1.0. Sampled attempts draw from a `StdRng`
//! seeded by the window offset and attempt number, so a run is reproducible.

use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::debug;

use crate::decode::{beam, greedy, DecodeTask, Decoded, StopReason};
use crate::error::Result;
use crate::inference::BackendSession;
use crate::params::{FullParams, StrategyParams};
use crate::vocab::TokenId;

/// Accepted result of a window plus what it cost.
#[derive(Debug)]
pub(crate) struct WindowDecode {
    pub decoded: Decoded,
    /// Temperature of the accepted attempt.
    pub temperature: f32,
    pub n_fallback: u32,
    /// Strategy runs, one per sampled candidate.
    pub n_sample: u32,
    /// Time inside `BackendSession::logits`.
    pub backend: Duration,
    pub n_backend: u32,
    /// Wall-clock of the whole window decode.
    pub elapsed: Duration,
}

/// Temperatures tried in order: `start`, `start + inc`, … up to 1.0.
pub(crate) fn temperature_schedule(start: f32, inc: f32) -> Vec<f32> {
    let mut temps = vec![start];
    if inc > 0.0 {
        let mut t = start + inc;
        while t <= 1.0 + 1e-6 {
            temps.push(t);
            t += inc;
        }
    }
    temps
}

fn needs_fallback(decoded: &Decoded, params: &FullParams) -> bool {
    let hyp = &decoded.hypothesis;
    if hyp.avg_logprob() < f64::from(params.logprob_thold) {
        return true;
    }
    hyp.entropy_applies() && hyp.entropy() < f64::from(params.entropy_thold)
}

fn attempt_seed(seek: usize, attempt: usize) -> u64 {
    ((seek as u64) << 8) ^ attempt as u64
}

pub(crate) fn decode_window(
    session: &mut dyn BackendSession,
    params: &FullParams,
    task: &DecodeTask<'_>,
    seek: usize,
) -> Result<WindowDecode> {
    let started = Instant::now();
    let n_threads = params.n_threads;
    let mut backend = Duration::ZERO;
    let mut n_backend = 0u32;
    let mut n_sample = 0u32;
    let should_abort = || params.should_abort();

    let temps = temperature_schedule(params.temperature, params.temperature_inc);
    let mut accepted: Option<(Decoded, f32, u32)> = None;

    for (attempt, &temperature) in temps.iter().enumerate() {
        let mut step = |seq: &[TokenId]| -> Result<Vec<f32>> {
            let t = Instant::now();
            let logits = session.logits(seq, n_threads);
            backend += t.elapsed();
            n_backend += 1;
            logits
        };

        let decoded = if temperature <= 0.0 {
            n_sample += 1;
            match params.strategy_params {
                StrategyParams::Greedy { .. } => greedy::decode(task, &mut step, &should_abort)?,
                StrategyParams::BeamSearch {
                    beam_size,
                    patience,
                } => beam::decode(task, &mut step, &should_abort, beam_size, patience)?,
            }
        } else {
            let n_candidates = match params.strategy_params {
                StrategyParams::Greedy { best_of } => best_of,
                StrategyParams::BeamSearch { beam_size, .. } => beam_size,
            }
            .max(1);
            let mut rng = StdRng::seed_from_u64(attempt_seed(seek, attempt));
            let mut best: Option<Decoded> = None;
            for _ in 0..n_candidates {
                n_sample += 1;
                let candidate =
                    greedy::sample(task, &mut step, &should_abort, temperature, &mut rng)?;
                if candidate.reason == StopReason::Aborted {
                    best = Some(candidate);
                    break;
                }
                let better = best.as_ref().map_or(true, |b| {
                    candidate.hypothesis.avg_logprob() > b.hypothesis.avg_logprob()
                });
                if better {
                    best = Some(candidate);
                }
            }
            match best {
                Some(best) => best,
                None => continue,
            }
        };

        let last = attempt + 1 == temps.len();
        if decoded.reason == StopReason::Aborted || last || !needs_fallback(&decoded, params) {
            accepted = Some((decoded, temperature, attempt as u32));
            break;
        }
        debug!(
            seek,
            temperature,
            avg_logprob = decoded.hypothesis.avg_logprob(),
            entropy = decoded.hypothesis.entropy(),
            "decode failed quality checks, retrying hotter"
        );
    }

    let (decoded, temperature, n_fallback) = match accepted {
        Some(found) => found,
        None => (
            Decoded {
                hypothesis: Default::default(),
                reason: StopReason::Eot,
                peak_width: 0,
            },
            params.temperature,
            0,
        ),
    };

    Ok(WindowDecode {
        decoded,
        temperature,
        n_fallback,
        n_sample,
        backend,
        n_backend,
        elapsed: started.elapsed(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn schedule_steps_up_to_one() {
        let temps = temperature_schedule(0.0, 0.2);
        assert_eq!(temps.len(), 6);
        assert_relative_eq!(temps[0], 0.0);
        assert_relative_eq!(*temps.last().unwrap(), 1.0, epsilon = 1e-5);
    }

    #[test]
    fn schedule_without_increment_is_single() {
        assert_eq!(temperature_schedule(0.4, 0.0), vec![0.4]);
        assert_eq!(temperature_schedule(1.5, 0.2), vec![1.5]);
    }

    #[test]
    fn seeds_differ_per_attempt_and_window() {
        assert_ne!(attempt_seed(0, 1), attempt_seed(0, 2));
        assert_ne!(attempt_seed(0, 1), attempt_seed(3_000, 1));
    }
}
