//! Token-level decoding for one window.
//!
//! Strategies do not talk to the backend directly. They receive a step
//! function that maps a full decoder input (prompt + generated tokens) to raw
//! logits, which keeps them testable against hand-written distributions.
//!
//! - [`logits`]: suppression rules and log-softmax
//! - [`greedy`]: argmax and temperature sampling
//! - [`beam`]: beam search with patience
//! - [`segments`]: turning a token run into timestamped segments

pub mod beam;
pub mod greedy;
pub mod logits;
pub mod segments;

use std::collections::HashMap;

use crate::error::{HarkError, Result};
use crate::state::TokenData;
use crate::vocab::{TokenId, Vocab};

use self::logits::TokenFilter;

/// Maps a decoder input sequence to next-token logits.
pub type StepFn<'a> = dyn FnMut(&[TokenId]) -> Result<Vec<f32>> + 'a;

/// Window of recent tokens inspected by the repetition check.
const ENTROPY_WINDOW: usize = 32;

/// Inputs shared by every strategy for one window.
pub struct DecodeTask<'a> {
    pub vocab: &'a Vocab,
    /// Control prefix (and optional previous text) fed before generation.
    pub prompt: &'a [TokenId],
    pub filter: TokenFilter<'a>,
    /// Upper bound on generated tokens.
    pub max_len: usize,
}

/// Why a strategy stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The chosen hypothesis ended with end-of-text.
    Eot,
    /// The length bound was reached first.
    MaxLength,
    /// The abort callback fired. The hypothesis holds the partial result.
    Aborted,
}

/// One candidate token sequence.
#[derive(Debug, Clone, Default)]
pub struct Hypothesis {
    /// Generated tokens, without the prompt and without end-of-text.
    pub tokens: Vec<TokenData>,
    /// Sum of log-probabilities of every scored step, end-of-text included.
    pub sum_logprob: f64,
    n_scored: usize,
    /// `<|nospeech|>` probability at the first step.
    pub no_speech_prob: f32,
}

impl Hypothesis {
    pub fn ids(&self) -> Vec<TokenId> {
        self.tokens.iter().map(|t| t.id).collect()
    }

    fn sequence(&self, prompt: &[TokenId]) -> Vec<TokenId> {
        let mut seq = Vec::with_capacity(prompt.len() + self.tokens.len());
        seq.extend_from_slice(prompt);
        seq.extend(self.tokens.iter().map(|t| t.id));
        seq
    }

    fn push(&mut self, data: TokenData) {
        self.sum_logprob += f64::from(data.plog);
        self.n_scored += 1;
        self.tokens.push(data);
    }

    fn close(&mut self, eot_logprob: f32) {
        self.sum_logprob += f64::from(eot_logprob);
        self.n_scored += 1;
    }

    pub fn avg_logprob(&self) -> f64 {
        if self.n_scored == 0 {
            0.0
        } else {
            self.sum_logprob / self.n_scored as f64
        }
    }

    /// Shannon entropy of the token histogram over the most recent tokens.
    /// Low values indicate a repetition loop.
    pub fn entropy(&self) -> f64 {
        let tail = &self.tokens[self.tokens.len().saturating_sub(ENTROPY_WINDOW)..];
        if tail.is_empty() {
            return 0.0;
        }
        let mut counts: HashMap<TokenId, usize> = HashMap::new();
        for t in tail {
            *counts.entry(t.id).or_insert(0) += 1;
        }
        let n = tail.len() as f64;
        counts
            .values()
            .map(|&c| {
                let p = c as f64 / n;
                -p * p.ln()
            })
            .sum()
    }

    /// Whether enough tokens exist for the entropy check to be meaningful.
    pub fn entropy_applies(&self) -> bool {
        self.tokens.len() > ENTROPY_WINDOW
    }
}

/// Outcome of running one strategy over one window.
#[derive(Debug, Clone)]
pub struct Decoded {
    pub hypothesis: Hypothesis,
    pub reason: StopReason,
    /// Most hypotheses alive at any single step.
    pub peak_width: usize,
}

/// Filtered log-probabilities for the next position of `hyp`.
pub(crate) struct StepOutput {
    pub logprobs: Vec<f32>,
    pub no_speech: f32,
}

pub(crate) fn evaluate(
    task: &DecodeTask<'_>,
    hyp: &Hypothesis,
    step: &mut StepFn<'_>,
) -> Result<StepOutput> {
    let seq = hyp.sequence(task.prompt);
    let mut raw = step(&seq)?;
    if raw.len() != task.vocab.n_vocab() {
        return Err(HarkError::Backend(format!(
            "backend returned {} logits, expected {}",
            raw.len(),
            task.vocab.n_vocab()
        )));
    }
    let no_speech = if hyp.tokens.is_empty() {
        logits::softmax_prob(&raw, task.vocab.nosp)
    } else {
        hyp.no_speech_prob
    };
    let generated = hyp.ids();
    let logprobs = task.filter.logprobs(&generated, &mut raw);
    Ok(StepOutput {
        logprobs,
        no_speech,
    })
}

/// Per-token detail for choosing `id` from `logprobs`.
pub(crate) fn token_data(vocab: &Vocab, id: TokenId, logprobs: &[f32]) -> TokenData {
    let beg = vocab.beg as usize;
    let ts = &logprobs[beg.min(logprobs.len())..];
    let (tid_off, pt) = ts
        .iter()
        .enumerate()
        .fold((0usize, f32::NEG_INFINITY), |(bi, bv), (i, &v)| {
            if v > bv {
                (i, v)
            } else {
                (bi, bv)
            }
        });
    let ptsum: f32 = ts.iter().map(|&lp| lp.exp()).sum();
    let plog = logprobs.get(id as usize).copied().unwrap_or(f32::NEG_INFINITY);
    TokenData {
        id,
        tid: vocab.beg + tid_off as TokenId,
        p: plog.exp(),
        plog,
        pt: pt.exp(),
        ptsum,
        t0: -1,
        t1: -1,
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    fn data(id: TokenId) -> TokenData {
        TokenData {
            id,
            tid: 0,
            p: 1.0,
            plog: 0.0,
            pt: 0.0,
            ptsum: 0.0,
            t0: -1,
            t1: -1,
        }
    }

    #[test]
    fn entropy_detects_repetition() {
        let mut looping = Hypothesis::default();
        let mut varied = Hypothesis::default();
        for i in 0..40 {
            looping.push(data(7 + (i % 2)));
            varied.push(data(i));
        }
        assert!(looping.entropy_applies());
        assert!(looping.entropy() < 1.0);
        assert!(varied.entropy() > 3.0);
        assert!(!Hypothesis::default().entropy_applies());
    }

    #[test]
    fn avg_logprob_counts_closing_step() {
        let mut hyp = Hypothesis::default();
        let mut t = data(5);
        t.plog = -1.0;
        hyp.push(t);
        hyp.close(-1.0);
        assert_eq!(hyp.avg_logprob(), -1.0);
        assert_eq!(hyp.sum_logprob, -2.0);
    }

    #[test]
    fn evaluate_rejects_short_logit_vectors() {
        let vocab = vocab();
        let prompt = prompt(&vocab);
        let task = task(&vocab, &prompt, 10);
        let mut step = |_: &[TokenId]| -> Result<Vec<f32>> { Ok(vec![0.0; 10]) };
        assert!(matches!(
            evaluate(&task, &Hypothesis::default(), &mut step),
            Err(HarkError::Backend(_))
        ));
    }

    #[test]
    fn evaluate_passes_full_sequence() {
        let vocab = vocab();
        let prompt = prompt(&vocab);
        let task = task(&vocab, &prompt, 10);
        let mut hyp = Hypothesis::default();
        hyp.push(data(42));
        let mut seen = Vec::new();
        let mut step = |seq: &[TokenId]| -> Result<Vec<f32>> {
            seen = seq.to_vec();
            Ok(dist(&vocab, &[(1, 1.0)]))
        };
        evaluate(&task, &hyp, &mut step).unwrap();
        assert_eq!(&seen[..prompt.len()], prompt.as_slice());
        assert_eq!(seen.last(), Some(&42));
    }
}
