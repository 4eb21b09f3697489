//! Ordered rule list for known scam and spam link patterns.
//!
//! Rules are evaluated in declaration order and the first match wins. Exemptions (the community's
//! own invite) live inside the rule they narrow, so reordering never changes their meaning.

use crate::error::{FilterError, Result};
use crate::PatternMatch;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

pub const SUSPICIOUS_LINK: &str = "Suspicious link.";
pub const SPAM_BOT: &str = "Spam bot.";
pub const POSSIBLE_SCAM: &str = "Possible scam detected.";

/// Invite code exempted by default from the platform invite rules.
pub const DEFAULT_OWN_INVITE: &str = "programacion";

const SUSPICIOUS_TLDS: &[&str] = &["xyz", "click", "info", "ru", "biz", "online", "club"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    SuspiciousLink,
    MessagingInvite,
    AdultContent,
    PlatformInvite,
    SpamDomain,
    Compound,
    Custom,
}

/// How a rule decides it matched.
#[derive(Debug, Clone)]
pub enum RuleMatcher {
    Pattern(Regex),
    /// `pattern` matches, except when the text from the match start to the end of the input is
    /// entirely covered by the anchored `exempt` pattern.
    Unless { pattern: Regex, exempt: Regex },
    /// `head` matches and every `requires` pattern matches somewhere after it.
    FollowedBy { head: Regex, requires: Vec<Regex> },
    /// Every pattern matches somewhere in the text, in any order.
    AllOf(Vec<Regex>),
}

impl RuleMatcher {
    #[must_use]
    pub fn find(&self, text: &str) -> Option<PatternMatch> {
        match self {
            Self::Pattern(regex) => regex.find(text).map(PatternMatch::from),
            Self::Unless { pattern, exempt } => pattern
                .find_iter(text)
                .find(|m| !exempt.is_match(&text[m.start()..]))
                .map(PatternMatch::from),
            Self::FollowedBy { head, requires } => head
                .find_iter(text)
                .find(|m| requires.iter().all(|r| r.find_at(text, m.end()).is_some()))
                .map(|m| PatternMatch::new(text, m.start(), text.len())),
            Self::AllOf(patterns) => {
                let mut start = usize::MAX;
                let mut end = 0;
                for pattern in patterns {
                    let m = pattern.find(text)?;
                    start = start.min(m.start());
                    end = end.max(m.end());
                }
                (start <= end).then(|| PatternMatch::new(text, start, end))
            }
        }
    }

    /// Human-readable pattern description for reports.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Pattern(regex) => regex.as_str().to_string(),
            Self::Unless { pattern, exempt } => {
                format!("{} unless {}", pattern.as_str(), exempt.as_str())
            }
            Self::FollowedBy { head, requires } => {
                let tail: Vec<&str> = requires.iter().map(Regex::as_str).collect();
                format!("{} followed by [{}]", head.as_str(), tail.join(", "))
            }
            Self::AllOf(patterns) => {
                let all: Vec<&str> = patterns.iter().map(Regex::as_str).collect();
                format!("all of [{}]", all.join(", "))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub kind: RuleKind,
    pub matcher: RuleMatcher,
    pub mute: bool,
    pub label: Option<String>,
}

impl Rule {
    #[must_use]
    pub fn new(kind: RuleKind, matcher: RuleMatcher, mute: bool, label: Option<&str>) -> Self {
        Self {
            kind,
            matcher,
            mute,
            label: label.map(ToString::to_string),
        }
    }

    #[must_use]
    pub fn find(&self, text: &str) -> Option<PatternMatch> {
        self.matcher.find(text)
    }

    /// Build a rule from a config entry. Invalid patterns are errors, never skipped.
    pub fn from_definition(definition: &RuleDefinition) -> Result<Self> {
        if definition.pattern.trim().is_empty() {
            return Err(FilterError::InvalidRule("empty pattern".to_string()));
        }
        let matcher = RuleMatcher::Pattern(ci(&definition.pattern)?);
        Ok(Self {
            kind: definition.kind,
            matcher,
            mute: definition.mute,
            label: definition.label.clone(),
        })
    }
}

/// Rule definition as written in the engine config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleDefinition {
    pub pattern: String,
    #[serde(default)]
    pub mute: bool,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default = "default_custom_kind")]
    pub kind: RuleKind,
}

const fn default_custom_kind() -> RuleKind {
    RuleKind::Custom
}

fn ci(pattern: &str) -> Result<Regex> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|e| FilterError::pattern(pattern, e))
}

fn ci_dotall(pattern: &str) -> Result<Regex> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .dot_matches_new_line(true)
        .build()
        .map_err(|e| FilterError::pattern(pattern, e))
}

fn invite_exemption(host_path: &str, own_invite: &str) -> Result<Regex> {
    ci(&format!(
        r"^(?:https?://)?{host_path}{}\n?$",
        regex::escape(own_invite)
    ))
}

/// The built-in rule list, in evaluation order.
pub fn standard_rules(own_invite: &str) -> Result<Vec<Rule>> {
    let mut rules = Vec::new();

    for tld in SUSPICIOUS_TLDS {
        rules.push(Rule::new(
            RuleKind::SuspiciousLink,
            RuleMatcher::Pattern(ci(&format!(r"https?://[\w.-]+\.{tld}($|\W)"))?),
            false,
            Some(SUSPICIOUS_LINK),
        ));
    }

    rules.push(Rule::new(
        RuleKind::MessagingInvite,
        RuleMatcher::Pattern(ci(r"(https?://)?(t\.me|telegram\.me|wa\.me|whatsapp\.me)/.+")?),
        true,
        None,
    ));
    rules.push(Rule::new(
        RuleKind::AdultContent,
        RuleMatcher::Pattern(ci(r"(https?://)?(pornhub|xvideos|xhamster|xnxx|hentaila)(\.\S+)+/")?),
        true,
        None,
    ));
    rules.push(Rule::new(
        RuleKind::PlatformInvite,
        RuleMatcher::Unless {
            pattern: ci(r"(https?://)?discord\.gg/\w+")?,
            exempt: invite_exemption(r"discord\.gg/", own_invite)?,
        },
        false,
        None,
    ));
    rules.push(Rule::new(
        RuleKind::PlatformInvite,
        RuleMatcher::Unless {
            pattern: ci(r"(https?://)?discord\.com/invite/.+")?,
            exempt: invite_exemption(r"discord\.com/invite/", own_invite)?,
        },
        true,
        None,
    ));
    rules.push(Rule::new(
        RuleKind::SpamDomain,
        RuleMatcher::Pattern(ci(r"(https?://)?multiigims\.netlify\.app")?),
        true,
        None,
    ));
    rules.push(Rule::new(
        RuleKind::SpamDomain,
        RuleMatcher::Pattern(ci(r"\[.*?steamcommunity\.com/.*\]")?),
        true,
        None,
    ));
    rules.push(Rule::new(
        RuleKind::SpamDomain,
        RuleMatcher::Pattern(ci(r"https?://(www\.)?\w*solara\w*\.\w+/?")?),
        true,
        Some(SPAM_BOT),
    ));
    rules.push(Rule::new(
        RuleKind::Compound,
        RuleMatcher::FollowedBy {
            head: ci(r"(?:solara|wix)")?,
            requires: vec![ci_dotall(r"\broblox\b")?, ci_dotall(r"(?:executor|free)")?],
        },
        true,
        Some(SPAM_BOT),
    ));
    rules.push(Rule::new(
        RuleKind::SpamDomain,
        RuleMatcher::Pattern(ci(r"(?:https?://(?:www\.)?|www\.)?outlier\.ai\b")?),
        true,
        Some(SPAM_BOT),
    ));
    rules.push(Rule::new(
        RuleKind::Compound,
        RuleMatcher::AllOf(vec![
            ci_dotall(r"\b(eth|ethereum|btc|bitcoin|capital|crypto|memecoins|nitro|\$|nsfw)\b")?,
            ci_dotall(r"\b(gana\w*|gratis|multiplica\w*|inver\w*|giveaway|server|free|earn)\b")?,
        ]),
        false,
        Some(POSSIBLE_SCAM),
    ));

    Ok(rules)
}

/// First rule (declaration order) matching `text`.
#[must_use]
pub fn first_match<'r>(rules: &'r [Rule], text: &str) -> Option<(&'r Rule, PatternMatch)> {
    rules
        .iter()
        .find_map(|rule| rule.find(text).map(|found| (rule, found)))
}
