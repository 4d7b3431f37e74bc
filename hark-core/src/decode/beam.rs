//! Beam search over cumulative log-probability.
//!
//! Each step expands every live hypothesis by its best `beam_size + 1`
//! continuations, ranks all candidates together, and keeps the top
//! `beam_size` that do not end in end-of-text. Candidates that do end in
//! end-of-text are retired to the finished pool whatever their rank, so the
//! reported hypothesis is the best complete sequence seen during the search.
//! Only those ranked above the beam cutoff count towards termination.
//!
//! Search stops when no live hypothesis remains, when `beam_size`
//! hypotheses have finished inside the beam, when the length bound is hit (live hypotheses
//! are then treated as finished), or when `patience` consecutive steps pass
//! without any live hypothesis scoring above the best finished one.

use std::cmp::Ordering;

use tracing::trace;

use super::logits::top_k;
use super::{evaluate, token_data, DecodeTask, Decoded, Hypothesis, StepFn, StopReason};
use crate::error::Result;
use crate::vocab::TokenId;

#[derive(Debug, Clone, Copy)]
struct Candidate {
    parent: usize,
    token: TokenId,
    logprob: f32,
    score: f64,
}

/// Descending score; ties by parent rank, then token id.
fn rank(a: &Candidate, b: &Candidate) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then(a.parent.cmp(&b.parent))
        .then(a.token.cmp(&b.token))
}

fn best_of(pool: &[Hypothesis]) -> Option<&Hypothesis> {
    // First of equals wins, so scan rather than max_by.
    let mut best: Option<&Hypothesis> = None;
    for h in pool {
        if best.map_or(true, |b| h.sum_logprob > b.sum_logprob) {
            best = Some(h);
        }
    }
    best
}

/// Run beam search with width `beam_size` (≥ 1).
pub fn decode(
    task: &DecodeTask<'_>,
    step: &mut StepFn<'_>,
    should_abort: &dyn Fn() -> bool,
    beam_size: usize,
    patience: u32,
) -> Result<Decoded> {
    let beam_size = beam_size.max(1);
    let eot = task.vocab.eot;

    let mut live = vec![Hypothesis::default()];
    let mut finished: Vec<Hypothesis> = Vec::new();
    let mut n_retired = 0usize;
    let mut peak_width = 1;
    let mut stalled = 0u32;
    let mut hit_length_bound = true;

    for step_idx in 0..task.max_len {
        if should_abort() {
            let partial = best_of(&live).cloned().unwrap_or_default();
            return Ok(Decoded {
                hypothesis: partial,
                reason: StopReason::Aborted,
                peak_width,
            });
        }

        let mut candidates = Vec::with_capacity(live.len() * (beam_size + 1));
        let mut step_logprobs = Vec::with_capacity(live.len());
        for (parent, hyp) in live.iter_mut().enumerate() {
            let out = evaluate(task, hyp, step)?;
            hyp.no_speech_prob = out.no_speech;
            for (token, logprob) in top_k(&out.logprobs, beam_size + 1) {
                candidates.push(Candidate {
                    parent,
                    token,
                    logprob,
                    score: hyp.sum_logprob + f64::from(logprob),
                });
            }
            step_logprobs.push(out.logprobs);
        }
        candidates.sort_by(rank);

        let mut next_live: Vec<Hypothesis> = Vec::with_capacity(beam_size);
        for c in &candidates {
            let mut hyp = live[c.parent].clone();
            if c.token == eot {
                if next_live.len() < beam_size {
                    n_retired += 1;
                }
                hyp.close(c.logprob);
                finished.push(hyp);
            } else if next_live.len() < beam_size {
                hyp.push(token_data(task.vocab, c.token, &step_logprobs[c.parent]));
                next_live.push(hyp);
            }
        }
        peak_width = peak_width.max(next_live.len());
        trace!(
            step = step_idx,
            live = next_live.len(),
            finished = finished.len(),
            "beam step"
        );

        live = next_live;
        if live.is_empty() || n_retired >= beam_size {
            hit_length_bound = false;
            break;
        }

        if let Some(best_finished) = best_of(&finished).map(|h| h.sum_logprob) {
            if live.iter().all(|h| h.sum_logprob <= best_finished) {
                stalled += 1;
            } else {
                stalled = 0;
            }
            if patience > 0 && stalled >= patience {
                hit_length_bound = false;
                break;
            }
        }
    }

    let reason = if hit_length_bound {
        finished.append(&mut live);
        StopReason::MaxLength
    } else {
        StopReason::Eot
    };
    let hypothesis = best_of(&finished).cloned().unwrap_or_default();
    Ok(Decoded {
        hypothesis,
        reason,
        peak_width,
    })
}
