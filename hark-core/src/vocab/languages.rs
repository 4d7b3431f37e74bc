//! Language code table.
//!
//! Ids are dense and ordered exactly as the model's language tokens are laid
//! out after `<|startoftranscript|>`, so `language token = SOT + 1 + id`.

use std::collections::HashMap;
use std::sync::OnceLock;

/// `(code, full name)` in token order. The 100th entry (`yue`) only exists in
/// large-v3 style vocabularies.
const LANGUAGES: &[(&str, &str)] = &[
    ("en", "english"),
    ("zh", "chinese"),
    ("de", "german"),
    ("es", "spanish"),
    ("ru", "russian"),
    ("ko", "korean"),
    ("fr", "french"),
    ("ja", "japanese"),
    ("pt", "portuguese"),
    ("tr", "turkish"),
    ("pl", "polish"),
    ("ca", "catalan"),
    ("nl", "dutch"),
    ("ar", "arabic"),
    ("sv", "swedish"),
    ("it", "italian"),
    ("id", "indonesian"),
    ("hi", "hindi"),
    ("fi", "finnish"),
    ("vi", "vietnamese"),
    ("he", "hebrew"),
    ("uk", "ukrainian"),
    ("el", "greek"),
    ("ms", "malay"),
    ("cs", "czech"),
    ("ro", "romanian"),
    ("da", "danish"),
    ("hu", "hungarian"),
    ("ta", "tamil"),
    ("no", "norwegian"),
    ("th", "thai"),
    ("ur", "urdu"),
    ("hr", "croatian"),
    ("bg", "bulgarian"),
    ("lt", "lithuanian"),
    ("la", "latin"),
    ("mi", "maori"),
    ("ml", "malayalam"),
    ("cy", "welsh"),
    ("sk", "slovak"),
    ("te", "telugu"),
    ("fa", "persian"),
    ("lv", "latvian"),
    ("bn", "bengali"),
    ("sr", "serbian"),
    ("az", "azerbaijani"),
    ("sl", "slovenian"),
    ("kn", "kannada"),
    ("et", "estonian"),
    ("mk", "macedonian"),
    ("br", "breton"),
    ("eu", "basque"),
    ("is", "icelandic"),
    ("hy", "armenian"),
    ("ne", "nepali"),
    ("mn", "mongolian"),
    ("bs", "bosnian"),
    ("kk", "kazakh"),
    ("sq", "albanian"),
    ("sw", "swahili"),
    ("gl", "galician"),
    ("mr", "marathi"),
    ("pa", "punjabi"),
    ("si", "sinhala"),
    ("km", "khmer"),
    ("sn", "shona"),
    ("yo", "yoruba"),
    ("so", "somali"),
    ("af", "afrikaans"),
    ("oc", "occitan"),
    ("ka", "georgian"),
    ("be", "belarusian"),
    ("tg", "tajik"),
    ("sd", "sindhi"),
    ("gu", "gujarati"),
    ("am", "amharic"),
    ("yi", "yiddish"),
    ("lo", "lao"),
    ("uz", "uzbek"),
    ("fo", "faroese"),
    ("ht", "haitian creole"),
    ("ps", "pashto"),
    ("tk", "turkmen"),
    ("nn", "nynorsk"),
    ("mt", "maltese"),
    ("sa", "sanskrit"),
    ("lb", "luxembourgish"),
    ("my", "myanmar"),
    ("bo", "tibetan"),
    ("tl", "tagalog"),
    ("mg", "malagasy"),
    ("as", "assamese"),
    ("tt", "tatar"),
    ("haw", "hawaiian"),
    ("ln", "lingala"),
    ("ha", "hausa"),
    ("ba", "bashkir"),
    ("jw", "javanese"),
    ("su", "sundanese"),
    ("yue", "cantonese"),
];

/// Number of languages known to any supported vocabulary.
pub const MAX_LANGUAGES: usize = LANGUAGES.len();

static GLOBAL: OnceLock<LanguageTable> = OnceLock::new();

/// Bidirectional code ⇄ id map over a prefix of [`LANGUAGES`].
#[derive(Debug, Clone)]
pub struct LanguageTable {
    entries: &'static [(&'static str, &'static str)],
    by_code: HashMap<&'static str, i32>,
    by_name: HashMap<&'static str, i32>,
}

impl LanguageTable {
    /// Table holding the first `count` languages (clamped to the known set).
    pub fn with_count(count: usize) -> Self {
        let entries = &LANGUAGES[..count.min(MAX_LANGUAGES)];
        let by_code = entries
            .iter()
            .enumerate()
            .map(|(id, (code, _))| (*code, id as i32))
            .collect();
        let by_name = entries
            .iter()
            .enumerate()
            .map(|(id, (_, name))| (*name, id as i32))
            .collect();
        Self {
            entries,
            by_code,
            by_name,
        }
    }

    /// Process-wide table with every known language.
    pub fn global() -> &'static LanguageTable {
        GLOBAL.get_or_init(|| LanguageTable::with_count(MAX_LANGUAGES))
    }

    /// Id for a short code (`"en"`) or full name (`"english"`); `-1` if unknown.
    ///
    /// Matching is exact: `"e"` or `"eng"` do not resolve to English.
    pub fn id(&self, code: &str) -> i32 {
        self.by_code
            .get(code)
            .or_else(|| self.by_name.get(code))
            .copied()
            .unwrap_or(-1)
    }

    pub fn code(&self, id: i32) -> Option<&'static str> {
        usize::try_from(id)
            .ok()
            .and_then(|i| self.entries.get(i))
            .map(|(code, _)| *code)
    }

    pub fn full_name(&self, id: i32) -> Option<&'static str> {
        usize::try_from(id)
            .ok()
            .and_then(|i| self.entries.get(i))
            .map(|(_, name)| *name)
    }

    pub fn max_id(&self) -> i32 {
        self.entries.len() as i32 - 1
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_table_has_one_hundred_languages() {
        let table = LanguageTable::global();
        assert_eq!(table.len(), 100);
        assert_eq!(table.max_id(), 99);
        assert_eq!(table.code(99), Some("yue"));
    }

    #[test]
    fn english_round_trips() {
        let table = LanguageTable::global();
        let en = table.id("en");
        assert_eq!(en, 0);
        assert_eq!(table.code(en), Some("en"));
        assert_eq!(table.full_name(en), Some("english"));
        assert_eq!(table.id("english"), en);
    }

    #[test]
    fn unknown_and_partial_codes_are_rejected() {
        let table = LanguageTable::global();
        assert_eq!(table.id("not-a-lang"), -1);
        assert_eq!(table.id("e"), -1);
        assert_eq!(table.id("EN"), -1);
        assert_eq!(table.id(""), -1);
    }

    #[test]
    fn out_of_range_ids_yield_none() {
        let table = LanguageTable::with_count(99);
        assert_eq!(table.code(-1), None);
        assert_eq!(table.code(99), None);
        assert_eq!(table.id("yue"), -1);
        assert_eq!(table.max_id(), 98);
    }

    #[test]
    fn codes_are_unique() {
        let table = LanguageTable::global();
        for id in 0..=table.max_id() {
            let code = table.code(id).expect("dense ids");
            assert_eq!(table.id(code), id, "{code} maps back to a different id");
        }
    }
}
