//! Turning one window's decoded tokens into timestamped segments.
//!
//! Timestamps inside a window are relative to the window start. A text run
//! is opened by a timestamp (or the window start) and closed by the next
//! timestamp:
//!
//! ```text
//! <|0.00|> a b <|1.20|><|1.20|> c d <|2.80|> <|endoftext|>
//!          └ [0, 120] ┘          └ [120, 280] ┘
//! ```
//!
//! The returned `seek_delta` says how far the caller should move before
//! decoding the next window.

use crate::inference::Detokenizer;
use crate::state::{Segment, TokenData};
use crate::vocab::Vocab;

/// Where a window sits and how its tokens should be split.
#[derive(Debug, Clone, Copy)]
pub struct SplitOptions {
    /// Absolute frame (centisecond) of the window start.
    pub seek: usize,
    /// Frames of real audio in this window.
    pub window_frames: usize,
    pub no_timestamps: bool,
    /// Emit unclosed trailing text instead of leaving it for the next window.
    pub flush_tail: bool,
    pub token_timestamps: bool,
    pub no_speech_prob: f32,
}

/// Segments of one window plus how far to advance.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowSplit {
    pub segments: Vec<Segment>,
    /// Frames consumed, in `1..=window_frames`.
    pub seek_delta: usize,
}

pub fn split_window(
    vocab: &Vocab,
    detok: &dyn Detokenizer,
    tokens: &[TokenData],
    opts: &SplitOptions,
) -> WindowSplit {
    let window = opts.window_frames.max(1) as i64;
    let seek = opts.seek as i64;
    let builder = SegmentBuilder { detok, opts };

    if opts.no_timestamps {
        let text: Vec<TokenData> = tokens.iter().filter(|t| vocab.is_text(t.id)).copied().collect();
        let segments = if text.is_empty() {
            Vec::new()
        } else {
            vec![builder.build(seek, seek + window, text)]
        };
        return WindowSplit {
            segments,
            seek_delta: window as usize,
        };
    }

    let mut segments = Vec::new();
    let mut pending: Vec<TokenData> = Vec::new();
    let mut open: Option<i64> = None;
    let mut last_close: Option<i64> = None;

    for t in tokens {
        if vocab.is_timestamp(t.id) {
            let ts = vocab.timestamp_cs(t.id).min(window);
            if pending.is_empty() {
                open = Some(ts);
            } else {
                let start = open.or(last_close).unwrap_or(0);
                let text = std::mem::take(&mut pending);
                segments.push(builder.build(seek + start, seek + ts.max(start), text));
                last_close = Some(ts);
                open = None;
            }
        } else if vocab.is_text(t.id) {
            pending.push(*t);
        }
    }

    let ends_with_pair = matches!(
        tokens,
        [.., a, b] if vocab.is_timestamp(a.id) && vocab.is_timestamp(b.id)
    );

    let seek_delta = if !pending.is_empty() {
        match last_close {
            Some(close) if !opts.flush_tail => close,
            _ => {
                let start = open.or(last_close).unwrap_or(0);
                segments.push(builder.build(seek + start, seek + window, pending));
                window
            }
        }
    } else if ends_with_pair {
        open.or(last_close).unwrap_or(window)
    } else {
        window
    };

    let seek_delta = if seek_delta <= 0 { window } else { seek_delta.min(window) };
    WindowSplit {
        segments,
        seek_delta: seek_delta as usize,
    }
}

struct SegmentBuilder<'a> {
    detok: &'a dyn Detokenizer,
    opts: &'a SplitOptions,
}

impl SegmentBuilder<'_> {
    fn build(&self, t0: i64, t1: i64, mut tokens: Vec<TokenData>) -> Segment {
        let t1 = t1.max(t0);
        let ids: Vec<_> = tokens.iter().map(|t| t.id).collect();
        let text = self.detok.decode(&ids);
        if self.opts.token_timestamps {
            interpolate_token_times(self.detok, &mut tokens, t0, t1);
        }
        Segment {
            t0,
            t1,
            text,
            tokens,
            no_speech_prob: self.opts.no_speech_prob,
        }
    }
}

/// Spread `[t0, t1]` over `tokens` in proportion to their text length.
pub fn interpolate_token_times(
    detok: &dyn Detokenizer,
    tokens: &mut [TokenData],
    t0: i64,
    t1: i64,
) {
    let weights: Vec<i64> = tokens
        .iter()
        .map(|t| {
            detok
                .token_text(t.id)
                .map_or(1, |s| s.chars().count().max(1) as i64)
        })
        .collect();
    let total: i64 = weights.iter().sum();
    if total == 0 {
        return;
    }
    let span = t1 - t0;
    let mut acc = 0;
    for (t, w) in tokens.iter_mut().zip(weights) {
        t.t0 = t0 + span * acc / total;
        acc += w;
        t.t1 = t0 + span * acc / total;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vocab::TokenId;

    struct Letters;

    impl Detokenizer for Letters {
        fn token_text(&self, token: TokenId) -> Option<String> {
            // Token `n` renders as a space plus `n % 10 + 1` letters.
            let n = usize::try_from(token).ok()?;
            Some(format!(" {}", "x".repeat(n % 10 + 1)))
        }
    }

    fn vocab() -> Vocab {
        Vocab::new(51_865).expect("valid vocab")
    }

    fn tok(id: TokenId) -> TokenData {
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

    fn ts(vocab: &Vocab, cs: i64) -> TokenData {
        tok(vocab.timestamp_token(cs))
    }

    fn opts(seek: usize, window_frames: usize) -> SplitOptions {
        SplitOptions {
            seek,
            window_frames,
            no_timestamps: false,
            flush_tail: false,
            token_timestamps: false,
            no_speech_prob: 0.0,
        }
    }

    #[test]
    fn single_closing_timestamp_consumes_the_window() {
        let v = vocab();
        let tokens = [ts(&v, 0), tok(1), tok(2), ts(&v, 150), tok(v.eot)];
        let out = split_window(&v, &Letters, &tokens, &opts(3_000, 3_000));
        assert_eq!(out.segments.len(), 1);
        let seg = &out.segments[0];
        assert_eq!((seg.t0, seg.t1), (3_000, 3_150));
        assert_eq!(seg.text, " xx xxx");
        assert_eq!(seg.tokens.len(), 2);
        assert_eq!(out.seek_delta, 3_000);
    }

    #[test]
    fn consecutive_timestamps_split_and_set_seek() {
        let v = vocab();
        let tokens = [
            ts(&v, 0),
            tok(1),
            ts(&v, 120),
            ts(&v, 120),
            tok(3),
            ts(&v, 280),
            ts(&v, 280),
        ];
        let out = split_window(&v, &Letters, &tokens, &opts(0, 3_000));
        let spans: Vec<_> = out.segments.iter().map(|s| (s.t0, s.t1)).collect();
        assert_eq!(spans, vec![(0, 120), (120, 280)]);
        assert_eq!(out.seek_delta, 280);
    }

    #[test]
    fn unclosed_tail_is_left_for_the_next_window() {
        let v = vocab();
        let tokens = [ts(&v, 0), tok(1), ts(&v, 200), tok(4), tok(5)];
        let out = split_window(&v, &Letters, &tokens, &opts(0, 3_000));
        assert_eq!(out.segments.len(), 1);
        assert_eq!(out.seek_delta, 200);

        let flushed = split_window(
            &v,
            &Letters,
            &tokens,
            &SplitOptions {
                flush_tail: true,
                ..opts(0, 3_000)
            },
        );
        assert_eq!(flushed.segments.len(), 2);
        assert_eq!((flushed.segments[1].t0, flushed.segments[1].t1), (200, 3_000));
        assert_eq!(flushed.seek_delta, 3_000);
    }

    #[test]
    fn lone_text_without_timestamps_covers_the_window() {
        let v = vocab();
        let tokens = [tok(7), tok(8)];
        let out = split_window(&v, &Letters, &tokens, &opts(500, 1_200));
        assert_eq!(out.segments.len(), 1);
        assert_eq!((out.segments[0].t0, out.segments[0].t1), (500, 1_700));
        assert_eq!(out.seek_delta, 1_200);
    }

    #[test]
    fn no_timestamps_mode_yields_one_segment() {
        let v = vocab();
        let tokens = [tok(1), tok(2), tok(3)];
        let out = split_window(
            &v,
            &Letters,
            &tokens,
            &SplitOptions {
                no_timestamps: true,
                ..opts(3_000, 501)
            },
        );
        assert_eq!(out.segments.len(), 1);
        assert_eq!((out.segments[0].t0, out.segments[0].t1), (3_000, 3_501));
        assert_eq!(out.seek_delta, 501);

        let empty = split_window(
            &v,
            &Letters,
            &[],
            &SplitOptions {
                no_timestamps: true,
                ..opts(0, 3_000)
            },
        );
        assert!(empty.segments.is_empty());
        assert_eq!(empty.seek_delta, 3_000);
    }

    #[test]
    fn timestamps_past_a_short_window_are_clamped() {
        let v = vocab();
        let tokens = [ts(&v, 0), tok(1), ts(&v, 2_900), ts(&v, 2_900)];
        let out = split_window(&v, &Letters, &tokens, &opts(6_000, 501));
        assert_eq!((out.segments[0].t0, out.segments[0].t1), (6_000, 6_501));
        assert_eq!(out.seek_delta, 501);
    }

    #[test]
    fn token_times_follow_text_length() {
        let v = vocab();
        // Lengths 2, 3, 5 characters over 100 cs.
        let tokens = [ts(&v, 0), tok(0), tok(1), tok(3), ts(&v, 100)];
        let out = split_window(
            &v,
            &Letters,
            &tokens,
            &SplitOptions {
                token_timestamps: true,
                ..opts(0, 3_000)
            },
        );
        let times: Vec<_> = out.segments[0].tokens.iter().map(|t| (t.t0, t.t1)).collect();
        assert_eq!(times, vec![(0, 20), (20, 50), (50, 100)]);
    }

    #[test]
    fn token_times_stay_unset_by_default() {
        let v = vocab();
        let tokens = [ts(&v, 0), tok(1), ts(&v, 100)];
        let out = split_window(&v, &Letters, &tokens, &opts(0, 3_000));
        assert!(out.segments[0].tokens.iter().all(|t| t.t0 == -1 && t.t1 == -1));
    }
}
