//! Text filters for chat moderation.
//!
//! Two kinds of matchers live here:
//! - [`rules`]: an ordered list of link and keyword rules, each with its own mute flag
//! - [`phrase`]: fuzzy scam-phrase matchers expanded over every word order
//!
//! [`TextFilters`] bundles both and answers "does this message hit anything, and what".

pub mod error;
pub mod filter_set;
pub mod phrase;
pub mod rules;

pub use error::{FilterError, Result};
pub use filter_set::{FilterConfig, TextFilters, TextHit};
pub use phrase::{compile_phrases, match_any, word_permutations, PhraseMatcher, BASE_PHRASES};
pub use rules::{first_match, standard_rules, Rule, RuleKind, RuleMatcher, RuleDefinition};

use serde::{Deserialize, Serialize};

/// Matched span of the inspected text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternMatch {
    pub text: String,
    pub start: usize,
    pub end: usize,
}

impl PatternMatch {
    pub(crate) fn new(haystack: &str, start: usize, end: usize) -> Self {
        Self {
            text: haystack[start..end].to_string(),
            start,
            end,
        }
    }
}

impl From<regex::Match<'_>> for PatternMatch {
    fn from(m: regex::Match<'_>) -> Self {
        Self {
            text: m.as_str().to_string(),
            start: m.start(),
            end: m.end(),
        }
    }
}
