//! Vendor-title normalization: free-text event titles into canonical token
//! sets, independent of sport or venue boilerplate.
//!
//! Pure and deterministic — identical input and options always produce
//! identical output, so the cross-venue matcher can be unit-tested without
//! any fixtures.  Normalization is also idempotent: feeding the normalized
//! title back through yields the same tokens.

use std::collections::BTreeSet;

/// Minimum token length retained after splitting.  Shorter fragments ("LA",
/// "at", "v") are abbreviations or separators and create false matches.
const MIN_TOKEN_LEN: usize = 3;

/// Venue boilerplate suffixes stripped before tokenizing.  Matched
/// case-insensitively against the end of the title.
const BOILERPLATE_SUFFIXES: &[&str] = &[
    "(moneyline)",
    "(money line)",
    "(match winner)",
    "(spread)",
    "(total)",
    "(live)",
    "- moneyline",
    "- match winner",
];

/// Betting jargon, ordinal/period words, and separators that carry no
/// entity meaning.  Indexing them would make "Celtics Moneyline" match every
/// other moneyline listing.
const STOP_WORDS: &[&str] = &[
    // Separators / determiners
    "versus", "the", "and", "for", "with",
    // Betting jargon
    "moneyline", "money", "line", "spread", "total", "totals", "over", "under",
    "odds", "bet", "betting", "winner", "win", "wins", "match", "game", "games",
    "series", "outright", "handicap", "props", "futures",
    // Ordinals / period words
    "first", "second", "third", "fourth", "quarter", "half", "halftime",
    "period", "inning", "set", "map", "round", "overtime", "regulation",
    // Generic question words the probability exchanges phrase titles with
    "will", "beat", "defeat", "against",
    // Calendar noise left behind by trailing date fragments
    "january", "february", "march", "april", "june", "july", "august",
    "september", "october", "november", "december", "jan", "feb", "mar",
    "apr", "jun", "jul", "aug", "sep", "sept", "oct", "nov", "dec",
    "monday", "tuesday", "wednesday", "thursday", "friday", "saturday",
    "sunday", "today", "tonight", "tomorrow",
];

/// League and sport names.  They appear inconsistently across venues
/// ("NBA: Lakers vs Celtics" vs plain "Lakers vs Celtics") so they are never
/// allowed to contribute to a match.
const SPORT_KEYWORDS: &[&str] = &[
    "nba", "nfl", "mlb", "nhl", "mls", "ncaa", "ncaab", "ncaaf", "wnba",
    "epl", "premier", "league", "laliga", "bundesliga", "seriea", "ligue",
    "ucl", "uefa", "champions", "europa", "soccer", "football", "basketball",
    "baseball", "hockey", "tennis", "atp", "wta", "ufc", "mma", "boxing",
];

/// Sport-specific noise words (e.g. club-name suffixes) dropped when the
/// caller knows the sport.
fn sport_noise(sport: &str) -> &'static [&'static str] {
    match sport {
        "soccer" | "football" => &["united"], // never alone; see tests
        _ => &[],
    }
}

/// Result of normalizing one vendor title.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Normalized {
    /// Surviving tokens joined with single spaces, in first-seen order
    pub title: String,
    pub tokens: BTreeSet<String>,
}

/// Normalize a vendor's free-text event title into a canonical token set.
///
/// Pipeline: lowercase → strip boilerplate suffixes → `@`/`/` to whitespace →
/// punctuation to whitespace → collapse → tokenize → drop short tokens,
/// stopwords, sport keywords, date/time fragments, and sport-specific noise.
pub fn normalize(raw_title: &str, sport: Option<&str>) -> Normalized {
    let mut text = raw_title.to_lowercase();

    let mut stripped = true;
    while stripped {
        stripped = false;
        let trimmed = text.trim_end().to_string();
        for suffix in BOILERPLATE_SUFFIXES {
            if trimmed.ends_with(suffix) {
                text = trimmed[..trimmed.len() - suffix.len()].to_string();
                stripped = true;
                break;
            }
        }
    }

    let noise = sport.map(sport_noise).unwrap_or(&[]);

    let mut ordered: Vec<String> = Vec::new();
    let mut tokens: BTreeSet<String> = BTreeSet::new();
    for word in text
        .replace(['@', '/'], " ")
        .split(|c: char| !c.is_alphanumeric())
        .filter(|s| !s.is_empty())
    {
        if word.len() < MIN_TOKEN_LEN {
            continue;
        }
        if is_date_or_time_fragment(word) {
            continue;
        }
        if STOP_WORDS.contains(&word) || SPORT_KEYWORDS.contains(&word) {
            continue;
        }
        if noise.contains(&word) {
            continue;
        }
        if tokens.insert(word.to_string()) {
            ordered.push(word.to_string());
        }
    }

    Normalized {
        title: ordered.join(" "),
        tokens,
    }
}

/// Pure-numeric tokens ("2026", "730") and clock fragments ("730pm") are
/// trailing date/time noise, never team or outcome names.
fn is_date_or_time_fragment(token: &str) -> bool {
    let digits_only = token.chars().all(|c| c.is_ascii_digit());
    if digits_only {
        return true;
    }
    for meridiem in ["am", "pm"] {
        if let Some(prefix) = token.strip_suffix(meridiem) {
            if !prefix.is_empty() && prefix.chars().all(|c| c.is_ascii_digit()) {
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(raw: &str) -> BTreeSet<String> {
        normalize(raw, None).tokens
    }

    #[test]
    fn test_basic_tokenization() {
        assert_eq!(
            tokens("Lakers vs Celtics"),
            ["lakers", "celtics"]
                .iter()
                .map(|s| s.to_string())
                .collect()
        );
    }

    #[test]
    fn test_at_and_slash_separators() {
        assert_eq!(tokens("LA Lakers @ Boston Celtics"), tokens("LA Lakers / Boston Celtics"));
        assert!(tokens("LA Lakers @ Boston Celtics").contains("boston"));
        // "LA" falls below the minimum token length
        assert!(!tokens("LA Lakers @ Boston Celtics").contains("la"));
    }

    #[test]
    fn test_moneyline_boilerplate_stripped() {
        assert_eq!(tokens("Celtics-Lakers Moneyline"), tokens("Celtics vs Lakers"));
        assert_eq!(
            tokens("Arsenal vs Chelsea (Moneyline)"),
            tokens("Arsenal Chelsea")
        );
    }

    #[test]
    fn test_sport_keywords_dropped() {
        assert_eq!(tokens("NBA: Lakers vs Celtics"), tokens("Lakers vs Celtics"));
        assert_eq!(
            tokens("Premier League: Arsenal vs Chelsea"),
            tokens("Arsenal Chelsea")
        );
    }

    #[test]
    fn test_trailing_date_time_fragments_dropped() {
        assert_eq!(
            tokens("Lakers vs Celtics - Jan 15 7:30pm"),
            tokens("Lakers vs Celtics")
        );
        assert_eq!(tokens("Knicks @ Heat 2026"), tokens("Knicks Heat"));
    }

    #[test]
    fn test_exchange_question_phrasing() {
        // Probability exchanges phrase listings as questions
        assert_eq!(
            tokens("Will the Lakers beat the Celtics?"),
            tokens("Lakers Celtics")
        );
    }

    #[test]
    fn test_idempotent() {
        let raw = "NBA: LA Lakers @ Boston Celtics (Moneyline) Jan 15";
        let first = normalize(raw, None);
        let second = normalize(&first.title, None);
        assert_eq!(first.tokens, second.tokens);
        assert_eq!(first.title, second.title);
    }

    #[test]
    fn test_deterministic() {
        let raw = "Celtics-Lakers Moneyline";
        assert_eq!(normalize(raw, None), normalize(raw, None));
    }

    #[test]
    fn test_sport_noise_words() {
        // With the soccer noise list, the shared "united" suffix cannot be
        // the sole bridge between two different clubs.
        let a = normalize("Manchester United vs Arsenal", Some("soccer"));
        assert!(a.tokens.contains("manchester"));
        assert!(!a.tokens.contains("united"));
        // Without a sport hint, nothing sport-specific is dropped.
        let b = normalize("Manchester United vs Arsenal", None);
        assert!(b.tokens.contains("united"));
    }

    #[test]
    fn test_alphanumeric_team_names_survive() {
        assert!(tokens("76ers vs Knicks").contains("76ers"));
    }

    #[test]
    fn test_empty_and_noise_only_titles() {
        assert!(tokens("").is_empty());
        assert!(tokens("NBA Moneyline 2026").is_empty());
    }
}
