//! Flat, absent-safe boundary.
//!
//! Every function here accepts `Option` handles and never panics: queries on
//! a missing context or state return a zero or sentinel value, and mutating
//! operations return an integer [`StatusCode`](crate::error::StatusCode).
//! Native Rust callers will usually prefer [`Context`], [`State`] and
//! [`crate::engine`] directly.

use crate::context::Context;
use crate::engine::{self, RunStatus};
use crate::error::{HarkError, Result, StatusCode};
use crate::logging::{self, LogCallback};
use crate::params::{ContextParams, FullParams, SamplingStrategy};
use crate::state::{State, TokenData};
use crate::vocab::{LanguageTable, SpecialToken, TokenId};

fn code_of(result: Result<()>) -> i32 {
    match result {
        Ok(()) => StatusCode::Ok.code(),
        Err(e) => e.status_code().code(),
    }
}

/// Both handles present and bound to each other.
fn bind<'s>(ctx: Option<&Context>, state: Option<&'s mut State>) -> Result<&'s mut State> {
    let ctx = ctx.ok_or(HarkError::MissingContext)?;
    let state = state.ok_or(HarkError::MissingState)?;
    if !state.context().same_as(ctx) {
        return Err(HarkError::InvalidArgument(
            "state belongs to a different context".into(),
        ));
    }
    Ok(state)
}

// ── Params ────────────────────────────────────────────────────────────────

pub fn context_default_params() -> ContextParams {
    ContextParams::default()
}

pub fn full_default_params(strategy: SamplingStrategy) -> FullParams {
    FullParams::new(strategy)
}

/// Strategy discriminant for an exact canonical name, `-1` otherwise.
pub fn sampling_strategy_from_str(name: &str) -> i32 {
    name.parse::<SamplingStrategy>().map_or(-1, |s| s as i32)
}

// ── Lifecycle ─────────────────────────────────────────────────────────────

/// Release a context handle. Releasing an empty slot does nothing.
pub fn free(ctx: &mut Option<Context>) {
    ctx.take();
}

pub fn init_state(ctx: Option<&Context>) -> Result<State> {
    ctx.ok_or(HarkError::MissingContext)?.create_state()
}

pub fn free_state(state: &mut Option<State>) {
    state.take();
}

// ── Vocabulary ────────────────────────────────────────────────────────────

fn token(ctx: Option<&Context>, kind: SpecialToken) -> TokenId {
    ctx.map_or(0, |c| c.token(kind))
}

pub fn token_eot(ctx: Option<&Context>) -> TokenId {
    token(ctx, SpecialToken::Eot)
}

pub fn token_sot(ctx: Option<&Context>) -> TokenId {
    token(ctx, SpecialToken::Sot)
}

pub fn token_solm(ctx: Option<&Context>) -> TokenId {
    token(ctx, SpecialToken::Solm)
}

pub fn token_prev(ctx: Option<&Context>) -> TokenId {
    token(ctx, SpecialToken::Prev)
}

pub fn token_nosp(ctx: Option<&Context>) -> TokenId {
    token(ctx, SpecialToken::Nosp)
}

pub fn token_not(ctx: Option<&Context>) -> TokenId {
    token(ctx, SpecialToken::Not)
}

pub fn token_beg(ctx: Option<&Context>) -> TokenId {
    token(ctx, SpecialToken::Beg)
}

pub fn token_translate(ctx: Option<&Context>) -> TokenId {
    token(ctx, SpecialToken::Translate)
}

pub fn token_transcribe(ctx: Option<&Context>) -> TokenId {
    token(ctx, SpecialToken::Transcribe)
}

/// Token of language `lang_id`, `0` when absent or out of range.
pub fn token_lang(ctx: Option<&Context>, lang_id: i32) -> TokenId {
    ctx.and_then(|c| c.vocab().language_token(lang_id))
        .unwrap_or(0)
}

pub fn token_to_str(ctx: Option<&Context>, token: TokenId) -> Option<String> {
    ctx.and_then(|c| c.token_to_str(token))
}

/// Id for a language code or full name, `-1` if unknown.
pub fn lang_id(code: &str) -> i32 {
    LanguageTable::global().id(code)
}

pub fn lang_str(id: i32) -> Option<&'static str> {
    LanguageTable::global().code(id)
}

pub fn lang_str_full(id: i32) -> Option<&'static str> {
    LanguageTable::global().full_name(id)
}

pub fn lang_max_id() -> i32 {
    LanguageTable::global().max_id()
}

fn count(value: usize) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

pub fn n_vocab(ctx: Option<&Context>) -> i32 {
    ctx.map_or(0, |c| count(c.n_vocab()))
}

pub fn n_text_ctx(ctx: Option<&Context>) -> i32 {
    ctx.map_or(0, |c| count(c.n_text_ctx()))
}

pub fn n_audio_ctx(ctx: Option<&Context>) -> i32 {
    ctx.map_or(0, |c| count(c.n_audio_ctx()))
}

pub fn model_n_mels(ctx: Option<&Context>) -> i32 {
    ctx.map_or(0, |c| count(c.n_mels()))
}

pub fn is_multilingual(ctx: Option<&Context>) -> bool {
    ctx.is_some_and(Context::is_multilingual)
}

/// Frames of audio in the state's mel matrix.
pub fn n_len(state: Option<&State>) -> i32 {
    state.map_or(0, |s| count(s.n_len()))
}

pub fn model_type_readable(ctx: Option<&Context>) -> &'static str {
    ctx.map_or("unknown", |c| c.model_type().readable())
}

// ── Features and decoding ─────────────────────────────────────────────────

pub fn pcm_to_mel(
    ctx: Option<&Context>,
    state: Option<&mut State>,
    samples: &[f32],
    n_threads: usize,
) -> i32 {
    code_of(bind(ctx, state).and_then(|s| s.pcm_to_mel(samples, n_threads)))
}

pub fn set_mel(
    ctx: Option<&Context>,
    state: Option<&mut State>,
    data: &[f32],
    n_len: usize,
    n_mels: usize,
) -> i32 {
    code_of(bind(ctx, state).and_then(|s| s.set_mel(data, n_len, n_mels)))
}

/// Run a full transcription. `0` on completion, `1` when aborted, negative
/// on failure.
pub fn full(
    ctx: Option<&Context>,
    state: Option<&mut State>,
    params: &FullParams,
    samples: &[f32],
) -> i32 {
    match bind(ctx, state).and_then(|s| engine::full(s, params, samples)) {
        Ok(RunStatus::Completed) => StatusCode::Ok.code(),
        Ok(RunStatus::Aborted) => StatusCode::Aborted.code(),
        Err(e) => e.status_code().code(),
    }
}

/// Detected language id (≥ 0), or a negative status code.
pub fn lang_auto_detect(
    ctx: Option<&Context>,
    state: Option<&mut State>,
    offset_ms: u64,
    n_threads: usize,
) -> i32 {
    match bind(ctx, state).and_then(|s| engine::lang_auto_detect(s, offset_ms, n_threads)) {
        Ok((id, _)) => id,
        Err(e) => e.status_code().code(),
    }
}

// ── Results ───────────────────────────────────────────────────────────────

pub fn full_n_segments(state: Option<&State>) -> i32 {
    state.map_or(0, |s| count(s.n_segments()))
}

pub fn full_lang_id(state: Option<&State>) -> i32 {
    state.map_or(-1, State::lang_id)
}

pub fn full_get_segment_text(state: Option<&State>, i: usize) -> Option<&str> {
    state?.segment(i).map(|s| s.text.as_str())
}

pub fn full_get_segment_t0(state: Option<&State>, i: usize) -> i64 {
    full_get_segment_timestamps(state, i).map_or(0, |(t0, _)| t0)
}

pub fn full_get_segment_t1(state: Option<&State>, i: usize) -> i64 {
    full_get_segment_timestamps(state, i).map_or(0, |(_, t1)| t1)
}

/// `(t0, t1)` of segment `i` in centiseconds.
pub fn full_get_segment_timestamps(state: Option<&State>, i: usize) -> Option<(i64, i64)> {
    state?.segment(i).map(|s| (s.t0, s.t1))
}

pub fn full_n_tokens(state: Option<&State>, i: usize) -> i32 {
    state
        .and_then(|s| s.segment(i))
        .map_or(0, |s| count(s.tokens.len()))
}

/// Token id `j` of segment `i`, `-1` when out of range.
pub fn full_get_token_id(state: Option<&State>, i: usize, j: usize) -> TokenId {
    full_get_token_data(state, i, j).map_or(-1, |t| t.id)
}

pub fn full_get_token_data(state: Option<&State>, i: usize, j: usize) -> Option<TokenData> {
    state?.segment(i)?.tokens.get(j).copied()
}

// ── Diagnostics ───────────────────────────────────────────────────────────

pub fn print_timings(ctx: Option<&Context>) {
    if let Some(ctx) = ctx {
        ctx.print_timings();
    }
}

pub fn reset_timings(ctx: Option<&Context>) {
    if let Some(ctx) = ctx {
        ctx.reset_timings();
    }
}

/// Route engine logs to `callback`; `None` silences the engine.
pub fn log_set(callback: Option<LogCallback>) {
    logging::set_log_sink(callback);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::stub::StubModel;

    fn ctx() -> Context {
        Context::from_source(&StubModel::new(), ContextParams::default()).unwrap()
    }

    #[test]
    fn binding_checks_run_in_order() {
        let ctx = ctx();
        let mut state = ctx.create_state().unwrap();
        assert_eq!(pcm_to_mel(None, None, &[], 1), StatusCode::MissingContext.code());
        assert_eq!(
            pcm_to_mel(Some(&ctx), None, &[0.0; 10], 1),
            StatusCode::MissingState.code()
        );
        assert_eq!(
            pcm_to_mel(Some(&ctx), Some(&mut state), &[], 1),
            StatusCode::InvalidArgument.code()
        );

        let other = self::ctx();
        assert_eq!(
            pcm_to_mel(Some(&other), Some(&mut state), &[0.0; 10], 1),
            StatusCode::InvalidArgument.code()
        );
        assert_eq!(pcm_to_mel(Some(&ctx), Some(&mut state), &[0.0; 1_600], 1), 0);
        assert_eq!(n_len(Some(&state)), 11);
    }

    #[test]
    fn result_getters_tolerate_bad_indices() {
        let ctx = ctx();
        let mut state = ctx.create_state().unwrap();
        let params = full_default_params(SamplingStrategy::Greedy).with_print_progress(false);
        assert_eq!(full(Some(&ctx), Some(&mut state), &params, &[0.0; 16_000]), 0);

        let s = Some(&state);
        assert_eq!(full_n_segments(s), 1);
        assert_eq!(full_get_segment_text(s, 0), Some(" w100 w200 w300"));
        assert_eq!(full_get_segment_timestamps(s, 0), Some((0, 101)));
        assert_eq!(full_n_tokens(s, 0), 3);
        assert_eq!(full_get_token_id(s, 0, 2), 300);
        assert_eq!(full_get_token_id(s, 0, 3), -1);
        assert_eq!(full_get_segment_text(s, 5), None);
        assert_eq!(full_get_segment_t0(s, 5), 0);
        assert_eq!(full_lang_id(s), 0);
        assert_eq!(full_lang_id(None), -1);
        assert!(full_get_token_data(None, 0, 0).is_none());
    }

    #[test]
    fn lang_auto_detect_reports_codes() {
        let ctx = ctx();
        let mut state = ctx.create_state().unwrap();
        assert_eq!(lang_auto_detect(Some(&ctx), None, 0, 1), StatusCode::MissingState.code());
        assert_eq!(
            lang_auto_detect(Some(&ctx), Some(&mut state), 0, 1),
            StatusCode::InvalidArgument.code()
        );
        pcm_to_mel(Some(&ctx), Some(&mut state), &[0.0; 16_000], 1);
        assert_eq!(lang_auto_detect(Some(&ctx), Some(&mut state), 0, 1), 0);
    }

    #[test]
    fn token_lang_follows_the_table() {
        let ctx = ctx();
        assert_eq!(token_lang(Some(&ctx), 0), token_sot(Some(&ctx)) + 1);
        assert_eq!(token_lang(Some(&ctx), 500), 0);
        assert_eq!(token_lang(None, 0), 0);
    }
}
