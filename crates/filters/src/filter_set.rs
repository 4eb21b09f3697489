use crate::error::Result;
use crate::phrase::{compile_phrases, match_any, PhraseMatcher, BASE_PHRASES};
use crate::rules::{first_match, standard_rules, Rule, RuleDefinition, DEFAULT_OWN_INVITE};
use crate::PatternMatch;
use serde::{Deserialize, Serialize};

/// `[filters]` section of the engine config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Invite code of the community itself, exempt from the invite rules
    pub own_invite: String,
    pub include_base_phrases: bool,
    pub extra_phrases: Vec<String>,
    /// Appended after the built-in rules
    pub extra_rules: Vec<RuleDefinition>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            own_invite: DEFAULT_OWN_INVITE.to_string(),
            include_base_phrases: true,
            extra_phrases: Vec::new(),
            extra_rules: Vec::new(),
        }
    }
}

/// What a message hit.
#[derive(Debug, Clone)]
pub enum TextHit<'a> {
    Rule {
        rule: &'a Rule,
        found: PatternMatch,
    },
    Phrase {
        matcher: &'a PhraseMatcher,
        found: PatternMatch,
    },
}

/// Rules and phrase matchers compiled once at startup and shared read-only afterwards.
#[derive(Debug, Clone)]
pub struct TextFilters {
    rules: Vec<Rule>,
    phrases: Vec<PhraseMatcher>,
}

impl TextFilters {
    #[must_use]
    pub fn new(rules: Vec<Rule>, phrases: Vec<PhraseMatcher>) -> Self {
        Self { rules, phrases }
    }

    /// Built-in rules and base phrases with the default invite exemption.
    pub fn standard() -> Result<Self> {
        Self::from_config(&FilterConfig::default())
    }

    pub fn from_config(config: &FilterConfig) -> Result<Self> {
        let mut rules = standard_rules(&config.own_invite)?;
        for definition in &config.extra_rules {
            rules.push(Rule::from_definition(definition)?);
        }

        let base: &[&str] = if config.include_base_phrases {
            BASE_PHRASES
        } else {
            &[]
        };
        let phrases = compile_phrases(
            base.iter()
                .map(|p| (*p).to_string())
                .chain(config.extra_phrases.iter().cloned()),
        )?;

        log::info!(
            "Text filters ready: {} rules, {} phrase matchers",
            rules.len(),
            phrases.len()
        );
        Ok(Self { rules, phrases })
    }

    #[must_use]
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    #[must_use]
    pub fn phrases(&self) -> &[PhraseMatcher] {
        &self.phrases
    }

    /// First rule hit, in rule order.
    #[must_use]
    pub fn check_rules(&self, text: &str) -> Option<(&Rule, PatternMatch)> {
        first_match(&self.rules, text)
    }

    /// First phrase hit, in registration order.
    #[must_use]
    pub fn check_phrases(&self, text: &str) -> Option<(&PhraseMatcher, PatternMatch)> {
        match_any(&self.phrases, text)
    }

    /// Rules first, then phrases.
    #[must_use]
    pub fn check(&self, text: &str) -> Option<TextHit<'_>> {
        if let Some((rule, found)) = self.check_rules(text) {
            return Some(TextHit::Rule { rule, found });
        }
        self.check_phrases(text)
            .map(|(matcher, found)| TextHit::Phrase { matcher, found })
    }
}

impl TextHit<'_> {
    #[must_use]
    pub fn mute(&self) -> bool {
        match self {
            Self::Rule { rule, .. } => rule.mute,
            Self::Phrase { .. } => false,
        }
    }

    #[must_use]
    pub fn found(&self) -> &PatternMatch {
        match self {
            Self::Rule { found, .. } | Self::Phrase { found, .. } => found,
        }
    }

    /// Pattern text shown in reports
    #[must_use]
    pub fn pattern(&self) -> String {
        match self {
            Self::Rule { rule, .. } => rule.matcher.describe(),
            Self::Phrase { matcher, .. } => matcher.pattern().to_string(),
        }
    }
}
