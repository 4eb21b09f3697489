//! Fuzzy phrase compiler.
//!
//! A canonical phrase such as `"free bonus code"` is expanded into every distinct word order and
//! each ordering is compiled into a case-insensitive, word-bounded regex that tolerates
//! punctuation noise between letters (`f.r.e.e`) and between words.

use crate::error::{FilterError, Result};
use crate::PatternMatch;
use regex::{Regex, RegexBuilder};
use std::collections::HashSet;

/// Placeholder token replaced by [`NUMBER_PATTERN`].
pub const NUMBER_PLACEHOLDER: &str = "$number";

/// Amounts like `$1,000`, `500k`, `1.000.000` or `2.5 M`.
pub const NUMBER_PATTERN: &str = r"\$?\s*(?:\d{1,3}(?:[.,]\d{3})+|\d+(?:[.,]\d+)?)(?:\s*[kKmMbB])?";

/// Zero or more separator characters: whitespace, punctuation, symbols and underscores.
pub const NOISE_PATTERN: &str = r"[\s\W_]*";

// Unicode `\W` classes repeated per character add up quickly.
const REGEX_SIZE_LIMIT: usize = 64 * 1024 * 1024;

/// Phrases shipped with the engine.
pub const BASE_PHRASES: &[&str] = &[
    "free bonus code",
    "crypto casino",
    "receive your $number",
    "belowex",
    "evencas",
    "special promo code",
    "bonus instantly",
    "deleted one hour",
    "claim your reward",
    "free gift code",
    "take your free reward",
    "free nitro",
    "free nitro click here",
    "free discord nitro",
    "claim your nitro",
];

/// A compiled matcher for one word ordering of a canonical phrase.
#[derive(Debug, Clone)]
pub struct PhraseMatcher {
    phrase: String,
    regex: Regex,
}

impl PhraseMatcher {
    /// Compile a single ordering. No permutation expansion happens here.
    pub fn new(phrase: &str) -> Result<Self> {
        let source = phrase_pattern(phrase)?;
        let regex = RegexBuilder::new(&source)
            .case_insensitive(true)
            .size_limit(REGEX_SIZE_LIMIT)
            .build()
            .map_err(|e| FilterError::pattern(source.clone(), e))?;
        Ok(Self {
            phrase: phrase.to_string(),
            regex,
        })
    }

    /// The permutation this matcher was built from
    #[must_use]
    pub fn phrase(&self) -> &str {
        &self.phrase
    }

    /// Regex source, used in moderation reports
    #[must_use]
    pub fn pattern(&self) -> &str {
        self.regex.as_str()
    }

    #[must_use]
    pub fn find(&self, text: &str) -> Option<PatternMatch> {
        self.regex.find(text).map(PatternMatch::from)
    }
}

/// Build the regex source for one phrase ordering.
pub fn phrase_pattern(phrase: &str) -> Result<String> {
    let parts: Vec<String> = phrase.split_whitespace().map(token_pattern).collect();
    if parts.is_empty() {
        return Err(FilterError::EmptyPhrase);
    }
    Ok(format!(r"\b(?:{})\b", parts.join(NOISE_PATTERN)))
}

fn token_pattern(token: &str) -> String {
    if token.eq_ignore_ascii_case(NUMBER_PLACEHOLDER) {
        return NUMBER_PATTERN.to_string();
    }
    token
        .chars()
        .map(|ch| regex::escape(&ch.to_string()))
        .collect::<Vec<_>>()
        .join(NOISE_PATTERN)
}

/// Every distinct ordering of the phrase's words.
///
/// Repeated words are collapsed: at each position only the first occurrence of each distinct
/// remaining word is tried, so `"a a b"` yields three orderings instead of six.
#[must_use]
pub fn word_permutations(phrase: &str) -> Vec<String> {
    let words: Vec<&str> = phrase.split_whitespace().collect();
    match words.len() {
        0 => Vec::new(),
        1 => vec![words[0].to_string()],
        _ => {
            let mut out = Vec::new();
            let mut used = vec![false; words.len()];
            permute(&words, &[], &mut used, &mut out);
            out
        }
    }
}

fn permute<'a>(words: &[&'a str], path: &[&'a str], used: &mut [bool], out: &mut Vec<String>) {
    if path.len() == words.len() {
        out.push(path.join(" "));
        return;
    }

    let mut seen: HashSet<&str> = HashSet::new();
    for (idx, word) in words.iter().enumerate() {
        if used[idx] || !seen.insert(word) {
            continue;
        }
        // Each branch owns its own path; siblings never share a buffer.
        let mut branch = path.to_vec();
        branch.push(word);
        used[idx] = true;
        permute(words, &branch, used, out);
        used[idx] = false;
    }
}

/// Expand every phrase into its orderings and compile one matcher per distinct ordering.
///
/// Orderings are deduplicated across the whole corpus; registration order follows the input.
pub fn compile_phrases<I, S>(phrases: I) -> Result<Vec<PhraseMatcher>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen: HashSet<String> = HashSet::new();
    let mut matchers = Vec::new();
    for phrase in phrases {
        for ordering in word_permutations(phrase.as_ref()) {
            if !seen.insert(ordering.clone()) {
                continue;
            }
            matchers.push(PhraseMatcher::new(&ordering)?);
        }
    }
    log::debug!("Compiled {} phrase matchers", matchers.len());
    Ok(matchers)
}

/// First matcher (in registration order) that matches `text`.
#[must_use]
pub fn match_any<'m>(
    matchers: &'m [PhraseMatcher],
    text: &str,
) -> Option<(&'m PhraseMatcher, PatternMatch)> {
    matchers
        .iter()
        .find_map(|matcher| matcher.find(text).map(|found| (matcher, found)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn number_regex() -> Regex {
        Regex::new(&format!("^(?:{NUMBER_PATTERN})$")).unwrap()
    }

    #[test]
    fn distinct_words_yield_factorial_orderings() {
        assert_eq!(word_permutations("a b").len(), 2);
        assert_eq!(word_permutations("a b c").len(), 6);
        assert_eq!(word_permutations("free nitro click here").len(), 24);
    }

    #[test]
    fn duplicate_words_collapse_branches() {
        let perms = word_permutations("a a b");
        assert_eq!(perms, vec!["a a b", "a b a", "b a a"]);
    }

    #[test]
    fn single_word_is_its_own_permutation() {
        assert_eq!(word_permutations("belowex"), vec!["belowex"]);
        assert!(word_permutations("   ").is_empty());
    }

    #[test]
    fn orderings_are_not_corrupted_across_branches() {
        let perms = word_permutations("x y z");
        for perm in &perms {
            let mut words: Vec<&str> = perm.split(' ').collect();
            words.sort_unstable();
            assert_eq!(words, vec!["x", "y", "z"]);
        }
        let unique: HashSet<&String> = perms.iter().collect();
        assert_eq!(unique.len(), perms.len());
    }

    #[test]
    fn fuzzy_matcher_tolerates_noise() {
        let matcher = PhraseMatcher::new("free bonus").unwrap();
        let found = matcher.find("f.r.e.e   b-o-n-u-s").expect("noisy phrase matches");
        assert_eq!(found.text, "f.r.e.e   b-o-n-u-s");
        assert!(matcher.find("FREE_BONUS today").is_some());
    }

    #[test]
    fn fuzzy_matcher_respects_word_boundaries() {
        let matcher = PhraseMatcher::new("free bonus").unwrap();
        assert!(matcher.find("freedom bonus").is_none());
        assert!(matcher.find("free bonuses").is_none());
    }

    #[test]
    fn number_placeholder_matches_amounts() {
        let re = number_regex();
        for sample in ["$1,000", "500k", "1.000.000", "2.5 M", "$ 20"] {
            assert!(re.is_match(sample), "expected {sample} to match");
        }
        assert!(!re.is_match("abc123"));
    }

    #[test]
    fn phrase_with_number_requires_word_boundary() {
        let matcher = PhraseMatcher::new("receive your $number").unwrap();
        assert!(matcher.find("Receive your $1,000 now").is_some());
        assert!(matcher.find("receive your 500k").is_some());
        assert!(matcher.find("receive your abc123").is_none());
    }

    #[test]
    fn compiled_corpus_deduplicates_orderings() {
        let matchers = compile_phrases(["free nitro", "nitro free", "free nitro"]).unwrap();
        let phrases: Vec<&str> = matchers.iter().map(PhraseMatcher::phrase).collect();
        assert_eq!(phrases, vec!["free nitro", "nitro free"]);
    }

    #[test]
    fn match_any_respects_registration_order() {
        let matchers = compile_phrases(["claim your reward", "reward"]).unwrap();
        let (matcher, found) = match_any(&matchers, "please reward claim your").unwrap();
        assert_eq!(matcher.phrase(), "reward claim your");
        assert_eq!(found.text, "reward claim your");
        assert!(match_any(&matchers, "nothing to see").is_none());
    }

    #[test]
    fn base_phrases_compile() {
        let matchers = compile_phrases(BASE_PHRASES).unwrap();
        assert!(matchers.len() > BASE_PHRASES.len());
        assert!(match_any(&matchers, "code bonus FREE").is_some());
    }

    #[test]
    fn empty_phrase_is_rejected() {
        assert!(matches!(phrase_pattern("  "), Err(FilterError::EmptyPhrase)));
    }
}
