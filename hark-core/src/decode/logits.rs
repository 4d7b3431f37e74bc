//! Logit suppression rules and probability helpers.
//!
//! Applied to the raw logits of every step, in this order:
//!
//! 1. control tokens and language tokens are never generated
//! 2. end-of-text is not allowed as the very first token
//! 3. with timestamps disabled, every timestamp token is suppressed
//! 4. with timestamps enabled:
//!    - after `text, <|t|>` only another timestamp or end-of-text may follow;
//!      after `<|t|>, <|t|>` (or a lone opening `<|t|>`) only text may follow
//!    - timestamps never go backwards
//!    - the first token is a timestamp no later than `max_initial_ts`
//!    - when timestamp tokens together outweigh the best text token, text
//!      is suppressed for this step

use crate::vocab::{TokenId, Vocab};

const NEG_INF: f32 = f32::NEG_INFINITY;

/// Suppression rules for one window.
#[derive(Debug, Clone, Copy)]
pub struct TokenFilter<'a> {
    vocab: &'a Vocab,
    no_timestamps: bool,
    /// Last timestamp token allowed as the first generated token.
    max_initial: Option<TokenId>,
}

impl<'a> TokenFilter<'a> {
    /// `max_initial_ts` is in seconds; `<= 0` removes the bound.
    pub fn new(vocab: &'a Vocab, no_timestamps: bool, max_initial_ts: f32) -> Self {
        let max_initial = (max_initial_ts > 0.0).then(|| {
            let steps = (max_initial_ts * 100.0 / crate::vocab::TIMESTAMP_STEP_CS as f32).round();
            let last = TokenId::try_from(vocab.n_vocab()).unwrap_or(TokenId::MAX) - 1;
            vocab.beg.saturating_add(steps as TokenId).min(last)
        });
        Self {
            vocab,
            no_timestamps,
            max_initial,
        }
    }

    /// Suppress disallowed tokens in place given the tokens generated so far.
    pub fn apply(&self, generated: &[TokenId], logits: &mut [f32]) {
        let v = self.vocab;
        let n = logits.len();
        let at = |id: TokenId| usize::try_from(id).ok().filter(|&i| i < n);

        for x in logits.iter_mut().filter(|x| x.is_nan()) {
            *x = NEG_INF;
        }

        for id in [v.sot, v.solm, v.prev, v.nosp, v.not, v.translate, v.transcribe] {
            if let Some(i) = at(id) {
                logits[i] = NEG_INF;
            }
        }
        let first_lang = (v.sot + 1) as usize;
        let last_lang = (v.sot + 1 + v.max_language_id()) as usize;
        suppress(logits, first_lang..(last_lang + 1).min(n));

        if generated.is_empty() {
            if let Some(i) = at(v.eot) {
                logits[i] = NEG_INF;
            }
        }

        let beg = (v.beg as usize).min(n);
        if self.no_timestamps {
            suppress(logits, beg..n);
            return;
        }

        let is_ts = |t: &TokenId| v.is_timestamp(*t);
        let last_was_ts = generated.last().is_some_and(is_ts);
        let penultimate_was_ts = generated.len() < 2 || is_ts(&generated[generated.len() - 2]);
        if last_was_ts {
            if penultimate_was_ts {
                suppress(logits, beg..n);
            } else {
                suppress(logits, 0..(v.eot as usize).min(n));
            }
        }

        if let Some(&last_ts) = generated.iter().rev().find(|t| is_ts(t)) {
            // A closing timestamp may be repeated once to open the next
            // segment; otherwise timestamps strictly increase.
            let floor = if last_was_ts && !penultimate_was_ts {
                last_ts
            } else {
                last_ts + 1
            };
            suppress(logits, beg..(floor as usize).min(n));
        }

        if generated.is_empty() {
            suppress(logits, 0..beg);
            if let Some(max) = self.max_initial {
                suppress(logits, ((max + 1) as usize).min(n)..n);
            }
        }
    }

    /// Apply the rules and return log-probabilities over the vocabulary.
    ///
    /// Never yields NaN: if every token ends up suppressed, end-of-text is
    /// re-enabled so the window can terminate.
    pub fn logprobs(&self, generated: &[TokenId], logits: &mut [f32]) -> Vec<f32> {
        self.apply(generated, logits);
        let eot = self.vocab.eot as usize;
        if logits.iter().all(|&v| v == NEG_INF) {
            if let Some(slot) = logits.get_mut(eot) {
                *slot = 0.0;
            }
        }

        let mut logprobs = log_softmax(logits);
        if !self.no_timestamps {
            let beg = (self.vocab.beg as usize).min(logprobs.len());
            let ts_mass = log_sum_exp(&logprobs[beg..]);
            let best_text = logprobs[..beg].iter().copied().fold(NEG_INF, f32::max);
            if ts_mass > best_text {
                suppress(logits, 0..beg);
                logprobs = log_softmax(logits);
            }
        }
        logprobs
    }
}

fn suppress(logits: &mut [f32], range: std::ops::Range<usize>) {
    if range.start < range.end {
        logits[range].fill(NEG_INF);
    }
}

fn log_sum_exp(values: &[f32]) -> f32 {
    let max = values.iter().copied().fold(NEG_INF, f32::max);
    if max == NEG_INF {
        return NEG_INF;
    }
    let sum: f32 = values.iter().map(|&v| (v - max).exp()).sum();
    max + sum.ln()
}

/// Numerically stable log-softmax. `-inf` inputs stay `-inf`.
pub fn log_softmax(logits: &[f32]) -> Vec<f32> {
    let lse = log_sum_exp(logits);
    if lse == NEG_INF {
        return vec![NEG_INF; logits.len()];
    }
    logits.iter().map(|&v| v - lse).collect()
}

/// Softmax probability of a single token.
pub fn softmax_prob(logits: &[f32], id: TokenId) -> f32 {
    let Some(&target) = usize::try_from(id).ok().and_then(|i| logits.get(i)) else {
        return 0.0;
    };
    let lse = log_sum_exp(logits);
    if lse == NEG_INF || target.is_nan() {
        0.0
    } else {
        (target - lse).exp()
    }
}

/// Index of the largest value; ties go to the lowest index.
pub fn argmax(values: &[f32]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (i, &v) in values.iter().enumerate() {
        if v == NEG_INF || v.is_nan() {
            continue;
        }
        match best {
            Some((_, b)) if b >= v => {}
            _ => best = Some((i, v)),
        }
    }
    best.map(|(i, _)| i)
}

/// The `k` most probable finite entries, best first; ties by lowest id.
pub fn top_k(logprobs: &[f32], k: usize) -> Vec<(TokenId, f32)> {
    let mut best: Vec<(TokenId, f32)> = Vec::with_capacity(k + 1);
    if k == 0 {
        return best;
    }
    for (i, &lp) in logprobs.iter().enumerate() {
        if lp == NEG_INF || lp.is_nan() {
            continue;
        }
        if best.len() == k && best.last().is_some_and(|&(_, worst)| lp <= worst) {
            continue;
        }
        let pos = best.partition_point(|&(_, v)| v >= lp);
        best.insert(pos, (i as TokenId, lp));
        best.truncate(k);
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn vocab() -> Vocab {
        Vocab::new(51_865).expect("valid vocab")
    }

    fn allowed(logits: &[f32]) -> impl Iterator<Item = usize> + '_ {
        logits
            .iter()
            .enumerate()
            .filter(|(_, &v)| v != NEG_INF)
            .map(|(i, _)| i)
    }

    #[test]
    fn log_softmax_normalises() {
        let lp = log_softmax(&[1.0, 2.0, 3.0, NEG_INF]);
        let total: f32 = lp.iter().map(|v| v.exp()).sum();
        assert_relative_eq!(total, 1.0, epsilon = 1e-6);
        assert_eq!(lp[3], NEG_INF);
        assert!(lp[2] > lp[1]);
    }

    #[test]
    fn argmax_prefers_lowest_index_on_ties() {
        assert_eq!(argmax(&[0.5, 0.9, 0.9, 0.1]), Some(1));
        assert_eq!(argmax(&[NEG_INF, NEG_INF]), None);
    }

    #[test]
    fn top_k_orders_and_breaks_ties_by_id() {
        let lp = [-1.0, -0.5, -0.5, -3.0, NEG_INF];
        assert_eq!(top_k(&lp, 2), vec![(1, -0.5), (2, -0.5)]);
        assert_eq!(top_k(&lp, 10).len(), 4);
        assert!(top_k(&lp, 0).is_empty());
    }

    #[test]
    fn control_and_language_tokens_are_never_allowed() {
        let v = vocab();
        let filter = TokenFilter::new(&v, true, 1.0);
        let mut logits = vec![0.0; v.n_vocab()];
        filter.apply(&[10], &mut logits);
        for id in [v.sot, v.sot + 1, v.sot + 99, v.translate, v.not, v.nosp, v.prev] {
            assert_eq!(logits[id as usize], NEG_INF, "token {id}");
        }
        assert_eq!(logits[v.eot as usize], 0.0);
        assert!(allowed(&logits).all(|i| i as TokenId <= v.eot));
    }

    #[test]
    fn eot_is_suppressed_at_first_step() {
        let v = vocab();
        let filter = TokenFilter::new(&v, true, 1.0);
        let mut logits = vec![0.0; v.n_vocab()];
        filter.apply(&[], &mut logits);
        assert_eq!(logits[v.eot as usize], NEG_INF);
        assert_eq!(logits[0], 0.0);
    }

    #[test]
    fn first_token_is_an_early_timestamp() {
        let v = vocab();
        let filter = TokenFilter::new(&v, false, 1.0);
        let mut logits = vec![0.0; v.n_vocab()];
        filter.apply(&[], &mut logits);
        let ok: Vec<usize> = allowed(&logits).collect();
        assert_eq!(ok.first().copied(), Some(v.beg as usize));
        assert_eq!(ok.last().copied(), Some((v.beg + 50) as usize));
    }

    #[test]
    fn huge_initial_bound_clamps_to_the_vocabulary() {
        let v = vocab();
        for secs in [1.0e6, f32::MAX] {
            let filter = TokenFilter::new(&v, false, secs);
            let mut logits = vec![0.0; v.n_vocab()];
            filter.apply(&[], &mut logits);
            let ok: Vec<usize> = allowed(&logits).collect();
            assert_eq!(ok.first().copied(), Some(v.beg as usize));
            assert_eq!(ok.last().copied(), Some(v.n_vocab() - 1));
        }
    }

    #[test]
    fn timestamp_pairing() {
        let v = vocab();
        let filter = TokenFilter::new(&v, false, 1.0);

        // Opening timestamp: text must follow.
        let mut logits = vec![0.0; v.n_vocab()];
        filter.apply(&[v.beg], &mut logits);
        assert!(allowed(&logits).all(|i| (i as TokenId) <= v.eot));

        // Closing timestamp: only timestamps (not earlier) or EOT.
        let mut logits = vec![0.0; v.n_vocab()];
        filter.apply(&[v.beg, 10, v.beg + 20], &mut logits);
        let ok: Vec<usize> = allowed(&logits).collect();
        assert_eq!(ok[0], v.eot as usize);
        assert_eq!(ok[1], (v.beg + 20) as usize);

        // After text, the next timestamp must be later than the last one.
        let mut logits = vec![0.0; v.n_vocab()];
        filter.apply(&[v.beg + 5, 10], &mut logits);
        assert_eq!(logits[(v.beg + 5) as usize], NEG_INF);
        assert_eq!(logits[(v.beg + 6) as usize], 0.0);
    }

    #[test]
    fn timestamp_mass_can_force_a_timestamp() {
        let v = vocab();
        let filter = TokenFilter::new(&v, false, 1.0);
        let mut logits = vec![NEG_INF; v.n_vocab()];
        logits[10] = 0.0;
        for t in 0..20 {
            logits[(v.beg + 10 + t) as usize] = -1.0;
        }
        let lp = filter.logprobs(&[v.beg, 11], &mut logits);
        assert_eq!(lp[10], NEG_INF);
        let total: f32 = lp.iter().map(|v| v.exp()).sum();
        assert_relative_eq!(total, 1.0, epsilon = 1e-5);
    }

    #[test]
    fn fully_suppressed_step_falls_back_to_eot() {
        let v = vocab();
        let filter = TokenFilter::new(&v, true, 1.0);
        let mut logits = vec![NEG_INF; v.n_vocab()];
        logits[v.not as usize] = 5.0;
        let lp = filter.logprobs(&[10], &mut logits);
        assert_eq!(argmax(&lp), Some(v.eot as usize));
        assert!(lp.iter().all(|x| !x.is_nan()));
    }

    #[test]
    fn softmax_prob_of_single_token() {
        let p = softmax_prob(&[0.0, 0.0], 1);
        assert_relative_eq!(p, 0.5, epsilon = 1e-6);
        assert_eq!(softmax_prob(&[0.0], 5), 0.0);
    }
}
