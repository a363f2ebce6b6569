use once_cell::sync::Lazy;
use regex::Regex;

/// Local-language aliases mapped to the product names the catalog knows.
const ALIASES: &[(&str, &str)] = &[
    ("واتساب", "whatsapp"),
    ("واتس اب", "whatsapp"),
    ("انستقرام", "instagram"),
    ("انستا", "instagram"),
    ("فيسبوك", "facebook"),
    ("فيس بوك", "facebook"),
    ("تيك توك", "tiktok"),
    ("تيكتوك", "tiktok"),
    ("تويتر", "twitter"),
    ("تليجرام", "telegram"),
    ("تلقرام", "telegram"),
    ("سناب شات", "snapchat"),
    ("سناب", "snapchat"),
    ("يوتيوب", "youtube"),
    ("ماسنجر", "messenger"),
    ("مسنجر", "messenger"),
    ("جيميل", "gmail"),
    ("كروم", "chrome"),
    ("خرائط جوجل", "google maps"),
    ("خرائط", "maps"),
    ("بابجي", "pubg"),
    ("فري فاير", "free fire"),
    ("كول اوف ديوتي", "call of duty"),
    ("نتفليكس", "netflix"),
    ("سبوتيفاي", "spotify"),
    ("لايت", "lite"),
    ("ماكس", "max"),
    ("برو", "pro"),
    ("بلس", "plus"),
    ("تطبيق", ""),
    ("برنامج", ""),
];

// Longest alias first so "سناب شات" wins over "سناب".
static ORDERED_ALIASES: Lazy<Vec<(&'static str, &'static str)>> = Lazy::new(|| {
    let mut ordered = ALIASES.to_vec();
    ordered.sort_by_key(|(alias, _)| std::cmp::Reverse(alias.chars().count()));
    ordered
});

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("whitespace regex"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedQuery {
    pub text: String,
    /// At least one alias substitution fired.
    pub translated: bool,
}

/// Canonical form used both for catalog lookups and as the cache key.
pub fn normalize_query(raw: &str) -> NormalizedQuery {
    let mut text = raw.to_lowercase();
    let mut translated = false;
    for (alias, replacement) in ORDERED_ALIASES.iter() {
        if text.contains(alias) {
            text = text.replace(alias, replacement);
            translated = true;
        }
    }
    NormalizedQuery {
        text: collapse_whitespace(&text),
        translated,
    }
}

pub fn collapse_whitespace(text: &str) -> String {
    WHITESPACE.replace_all(text.trim(), " ").into_owned()
}
