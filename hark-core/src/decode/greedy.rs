//! Single-hypothesis decoding: argmax at temperature 0, weighted sampling
//! above it.

use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;

use super::logits::argmax;
use super::{evaluate, token_data, DecodeTask, Decoded, Hypothesis, StepFn, StopReason};
use crate::error::Result;
use crate::vocab::TokenId;

/// How the next token is picked from the filtered distribution.
enum Pick<'r, R: Rng> {
    Argmax,
    Sample { temperature: f32, rng: &'r mut R },
}

/// Argmax decoding. Ties go to the lowest token id.
pub fn decode(
    task: &DecodeTask<'_>,
    step: &mut StepFn<'_>,
    should_abort: &dyn Fn() -> bool,
) -> Result<Decoded> {
    run::<rand::rngs::StdRng>(task, step, should_abort, Pick::Argmax)
}

/// Sample each token from the distribution sharpened or flattened by
/// `temperature` (> 0). Recorded log-probabilities are the untempered ones.
pub fn sample<R: Rng>(
    task: &DecodeTask<'_>,
    step: &mut StepFn<'_>,
    should_abort: &dyn Fn() -> bool,
    temperature: f32,
    rng: &mut R,
) -> Result<Decoded> {
    run(task, step, should_abort, Pick::Sample { temperature, rng })
}

fn run<R: Rng>(
    task: &DecodeTask<'_>,
    step: &mut StepFn<'_>,
    should_abort: &dyn Fn() -> bool,
    mut pick: Pick<'_, R>,
) -> Result<Decoded> {
    let eot = task.vocab.eot;
    let mut hyp = Hypothesis::default();

    for _ in 0..task.max_len {
        if should_abort() {
            return Ok(Decoded {
                hypothesis: hyp,
                reason: StopReason::Aborted,
                peak_width: 1,
            });
        }

        let out = evaluate(task, &hyp, step)?;
        hyp.no_speech_prob = out.no_speech;
        let next = match &mut pick {
            Pick::Argmax => argmax(&out.logprobs),
            Pick::Sample { temperature, rng } => {
                sample_index(&out.logprobs, *temperature, &mut **rng)
            }
        }
        .map_or(eot, |i| i as TokenId);

        if next == eot {
            hyp.close(out.logprobs[eot as usize]);
            return Ok(Decoded {
                hypothesis: hyp,
                reason: StopReason::Eot,
                peak_width: 1,
            });
        }
        hyp.push(token_data(task.vocab, next, &out.logprobs));
    }

    Ok(Decoded {
        hypothesis: hyp,
        reason: StopReason::MaxLength,
        peak_width: 1,
    })
}

/// Draw from `softmax(logprobs / temperature)`; argmax when every weight
/// underflows.
fn sample_index<R: Rng>(logprobs: &[f32], temperature: f32, rng: &mut R) -> Option<usize> {
    let max = logprobs.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if max == f32::NEG_INFINITY {
        return None;
    }
    let weights = logprobs.iter().map(|&lp| {
        if lp == f32::NEG_INFINITY {
            0.0
        } else {
            f64::from((lp - max) / temperature).exp()
        }
    });
    match WeightedIndex::new(weights) {
        Ok(dist) => Some(dist.sample(rng)),
        Err(_) => argmax(logprobs),
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn greedy_follows_the_most_probable_path() {
        let vocab = vocab();
        let prompt = prompt(&vocab);
        let task = task(&vocab, &prompt, 10);
        let eot = vocab.eot;
        let mut step = |seq: &[TokenId]| -> Result<Vec<f32>> {
            let generated = &seq[prompt.len()..];
            Ok(match generated {
                [] => dist(&vocab, &[(10, 0.6), (11, 0.4)]),
                [10] => dist(&vocab, &[(20, 0.5), (21, 0.5)]),
                _ => dist(&vocab, &[(eot, 1.0)]),
            })
        };
        let out = decode(&task, &mut step, &|| false).unwrap();
        assert_eq!(out.reason, StopReason::Eot);
        assert_eq!(out.hypothesis.ids(), vec![10, 20]);
        assert!(out.hypothesis.sum_logprob < 0.0);
    }

    #[test]
    fn length_bound_stops_decoding() {
        let vocab = vocab();
        let prompt = prompt(&vocab);
        let task = task(&vocab, &prompt, 4);
        let mut step = |_: &[TokenId]| -> Result<Vec<f32>> { Ok(dist(&vocab, &[(7, 1.0)])) };
        let out = decode(&task, &mut step, &|| false).unwrap();
        assert_eq!(out.reason, StopReason::MaxLength);
        assert_eq!(out.hypothesis.tokens.len(), 4);
    }

    #[test]
    fn abort_keeps_partial_tokens() {
        use std::cell::Cell;
        let vocab = vocab();
        let prompt = prompt(&vocab);
        let task = task(&vocab, &prompt, 50);
        let polls = Cell::new(0);
        let abort = || {
            polls.set(polls.get() + 1);
            polls.get() > 3
        };
        let mut step = |_: &[TokenId]| -> Result<Vec<f32>> { Ok(dist(&vocab, &[(7, 1.0)])) };
        let out = decode(&task, &mut step, &abort).unwrap();
        assert_eq!(out.reason, StopReason::Aborted);
        assert_eq!(out.hypothesis.tokens.len(), 3);
    }

    #[test]
    fn sampling_is_reproducible_for_a_seed() {
        let vocab = vocab();
        let prompt = prompt(&vocab);
        let task = task(&vocab, &prompt, 6);
        let mut step = |_: &[TokenId]| -> Result<Vec<f32>> {
            Ok(dist(&vocab, &[(1, 0.25), (2, 0.25), (3, 0.25), (4, 0.25)]))
        };
        let a = sample(&task, &mut step, &|| false, 1.0, &mut StdRng::seed_from_u64(7)).unwrap();
        let b = sample(&task, &mut step, &|| false, 1.0, &mut StdRng::seed_from_u64(7)).unwrap();
        assert_eq!(a.hypothesis.ids(), b.hypothesis.ids());
        assert!(a.hypothesis.ids().iter().all(|id| (1..=4).contains(id)));
    }

    #[test]
    fn sample_index_never_picks_suppressed_tokens() {
        let mut rng = StdRng::seed_from_u64(1);
        let lp = [f32::NEG_INFINITY, -0.1, f32::NEG_INFINITY];
        for _ in 0..20 {
            assert_eq!(sample_index(&lp, 0.8, &mut rng), Some(1));
        }
        assert_eq!(sample_index(&[f32::NEG_INFINITY; 3], 1.0, &mut rng), None);
    }
}
