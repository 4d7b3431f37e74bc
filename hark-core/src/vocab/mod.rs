//! Special-token ids and language table for a loaded model.
//!
//! Everything here is derived from the vocabulary size once, at context
//! construction, and never changes afterwards.
//!
//! | Token        | English-only (51864) | Multilingual (≥ 51865) |
//! |--------------|----------------------|------------------------|
//! | EOT          | 50256                | 50257                  |
//! | SOT          | 50257                | 50258                  |
//! | TRANSLATE    | 50357                | 50358 + dt             |
//! | TRANSCRIBE   | 50358                | 50359 + dt             |
//! | SOLM         | 50359                | 50360 + dt             |
//! | PREV         | 50360                | 50361 + dt             |
//! | NOSP         | 50361                | 50362 + dt             |
//! | NOT          | 50362                | 50363 + dt             |
//! | BEG          | 50363                | 50364 + dt             |
//!
//! `dt` is the number of language tokens beyond 99 (1 for large-v3).

pub mod languages;

pub use languages::LanguageTable;

use serde::{Deserialize, Serialize};

use crate::error::{HarkError, Result};

/// Token id as seen by the compute backend.
pub type TokenId = i32;

/// Smallest vocabulary we know how to lay special tokens out for.
pub const N_VOCAB_ENGLISH: usize = 51_864;
const N_VOCAB_MULTILINGUAL: usize = 51_865;
const LANGUAGE_TOKEN_BASE: usize = 51_765;

const EOT_BASE: TokenId = 50_256;
const TRANSLATE_BASE: TokenId = 50_357;

/// Length of one timestamp step in centiseconds (20 ms).
pub const TIMESTAMP_STEP_CS: i64 = 2;

/// Structural control tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpecialToken {
    /// `<|endoftext|>`
    Eot,
    /// `<|startoftranscript|>`
    Sot,
    /// `<|startoflm|>`
    Solm,
    /// `<|startofprev|>`
    Prev,
    /// `<|nospeech|>`
    Nosp,
    /// `<|notimestamps|>`
    Not,
    /// `<|0.00|>`, the first timestamp token.
    Beg,
    Translate,
    Transcribe,
}

impl SpecialToken {
    pub const ALL: [SpecialToken; 9] = [
        SpecialToken::Eot,
        SpecialToken::Sot,
        SpecialToken::Solm,
        SpecialToken::Prev,
        SpecialToken::Nosp,
        SpecialToken::Not,
        SpecialToken::Beg,
        SpecialToken::Translate,
        SpecialToken::Transcribe,
    ];
}

/// Special-token assignment plus language table for one vocabulary size.
#[derive(Debug, Clone)]
pub struct Vocab {
    n_vocab: usize,
    multilingual: bool,
    pub eot: TokenId,
    pub sot: TokenId,
    pub solm: TokenId,
    pub prev: TokenId,
    pub nosp: TokenId,
    pub not: TokenId,
    pub beg: TokenId,
    pub translate: TokenId,
    pub transcribe: TokenId,
    languages: LanguageTable,
}

impl Vocab {
    /// Lay out special tokens for a vocabulary of `n_vocab` entries.
    ///
    /// # Errors
    /// `InvalidArgument` when the vocabulary is too small to hold the
    /// special-token block.
    pub fn new(n_vocab: usize) -> Result<Self> {
        if n_vocab < N_VOCAB_ENGLISH {
            return Err(HarkError::InvalidArgument(format!(
                "vocabulary of {n_vocab} tokens is smaller than the minimum {N_VOCAB_ENGLISH}"
            )));
        }
        let multilingual = n_vocab >= N_VOCAB_MULTILINGUAL;
        let num_languages = n_vocab - LANGUAGE_TOKEN_BASE - usize::from(multilingual);

        let mut eot = EOT_BASE;
        let mut translate = TRANSLATE_BASE;
        if multilingual {
            eot += 1;
            translate += (num_languages as TokenId) - 98;
        }

        Ok(Self {
            n_vocab,
            multilingual,
            eot,
            sot: eot + 1,
            translate,
            transcribe: translate + 1,
            solm: translate + 2,
            prev: translate + 3,
            nosp: translate + 4,
            not: translate + 5,
            beg: translate + 6,
            languages: LanguageTable::with_count(num_languages),
        })
    }

    pub fn n_vocab(&self) -> usize {
        self.n_vocab
    }

    pub fn is_multilingual(&self) -> bool {
        self.multilingual
    }

    pub fn token(&self, kind: SpecialToken) -> TokenId {
        match kind {
            SpecialToken::Eot => self.eot,
            SpecialToken::Sot => self.sot,
            SpecialToken::Solm => self.solm,
            SpecialToken::Prev => self.prev,
            SpecialToken::Nosp => self.nosp,
            SpecialToken::Not => self.not,
            SpecialToken::Beg => self.beg,
            SpecialToken::Translate => self.translate,
            SpecialToken::Transcribe => self.transcribe,
        }
    }

    pub fn languages(&self) -> &LanguageTable {
        &self.languages
    }

    pub fn language_id(&self, code: &str) -> i32 {
        self.languages.id(code)
    }

    pub fn language_code(&self, id: i32) -> Option<&'static str> {
        self.languages.code(id)
    }

    pub fn max_language_id(&self) -> i32 {
        self.languages.max_id()
    }

    /// Token that selects language `lang_id`, if the id is in range.
    pub fn language_token(&self, lang_id: i32) -> Option<TokenId> {
        (0..=self.languages.max_id())
            .contains(&lang_id)
            .then(|| self.sot + 1 + lang_id)
    }

    /// Inverse of [`Vocab::language_token`].
    pub fn language_of_token(&self, token: TokenId) -> Option<i32> {
        let id = token - self.sot - 1;
        (0..=self.languages.max_id()).contains(&id).then_some(id)
    }

    /// Plain text (spoken content) tokens sit below EOT.
    pub fn is_text(&self, token: TokenId) -> bool {
        (0..self.eot).contains(&token)
    }

    pub fn is_timestamp(&self, token: TokenId) -> bool {
        token >= self.beg && (token as usize) < self.n_vocab
    }

    /// Number of timestamp tokens the vocabulary provides.
    pub fn n_timestamps(&self) -> usize {
        self.n_vocab - self.beg as usize
    }

    /// Offset of a timestamp token in centiseconds from the window start.
    pub fn timestamp_cs(&self, token: TokenId) -> i64 {
        i64::from(token - self.beg) * TIMESTAMP_STEP_CS
    }

    /// Timestamp token closest to (not after) `cs` centiseconds.
    pub fn timestamp_token(&self, cs: i64) -> TokenId {
        let step = (cs / TIMESTAMP_STEP_CS).clamp(0, self.n_timestamps() as i64 - 1);
        self.beg + step as TokenId
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(vocab: &Vocab) -> Vec<TokenId> {
        SpecialToken::ALL.iter().map(|&k| vocab.token(k)).collect()
    }

    #[test]
    fn multilingual_layout_matches_known_ids() {
        let vocab = Vocab::new(51_865).expect("valid vocab");
        assert!(vocab.is_multilingual());
        assert_eq!(vocab.eot, 50_257);
        assert_eq!(vocab.sot, 50_258);
        assert_eq!(vocab.translate, 50_358);
        assert_eq!(vocab.transcribe, 50_359);
        assert_eq!(vocab.not, 50_363);
        assert_eq!(vocab.beg, 50_364);
        assert_eq!(vocab.languages().len(), 99);
        assert_eq!(vocab.n_timestamps(), 1_501);
    }

    #[test]
    fn english_only_layout() {
        let vocab = Vocab::new(51_864).expect("valid vocab");
        assert!(!vocab.is_multilingual());
        assert_eq!(vocab.eot, 50_256);
        assert_eq!(vocab.sot, 50_257);
        assert_eq!(vocab.beg, 50_363);
        assert!(vocab.max_language_id() > 0);
    }

    #[test]
    fn large_v3_shifts_for_extra_language() {
        let vocab = Vocab::new(51_866).expect("valid vocab");
        assert_eq!(vocab.languages().len(), 100);
        assert_eq!(vocab.translate, 50_359);
        assert_eq!(vocab.beg, 50_365);
        assert_eq!(vocab.language_token(99), Some(vocab.sot + 100));
        assert!(vocab.language_token(99).unwrap() < vocab.translate);
    }

    #[test]
    fn special_tokens_positive_and_distinct() {
        for n_vocab in [51_864, 51_865, 51_866] {
            let vocab = Vocab::new(n_vocab).expect("valid vocab");
            let ids = ids(&vocab);
            for (i, a) in ids.iter().enumerate() {
                assert!(*a > 0);
                assert!((*a as usize) < n_vocab);
                for b in &ids[i + 1..] {
                    assert_ne!(a, b, "n_vocab={n_vocab}");
                }
            }
        }
    }

    #[test]
    fn too_small_vocabulary_is_rejected() {
        assert!(matches!(
            Vocab::new(1_000),
            Err(HarkError::InvalidArgument(_))
        ));
    }

    #[test]
    fn timestamp_helpers() {
        let vocab = Vocab::new(51_865).expect("valid vocab");
        assert!(vocab.is_timestamp(vocab.beg));
        assert!(!vocab.is_timestamp(vocab.not));
        assert!(vocab.is_text(0));
        assert!(!vocab.is_text(vocab.eot));
        assert_eq!(vocab.timestamp_cs(vocab.beg + 50), 100);
        assert_eq!(vocab.timestamp_token(100), vocab.beg + 50);
        assert_eq!(vocab.timestamp_token(1_000_000), vocab.beg + 1_500);
        let en = vocab.language_token(0).expect("en");
        assert_eq!(vocab.language_of_token(en), Some(0));
        assert_eq!(vocab.language_of_token(vocab.eot), None);
    }
}
