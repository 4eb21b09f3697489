use crate::message::MessageRef;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Serialize, Serializer};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCategory {
    SpamFilter,
    ScamPhrase,
    MassMention,
    RateLimit,
    ScamImage,
    Nsfw,
}

impl ReasonCategory {
    #[must_use]
    pub const fn title(self) -> &'static str {
        match self {
            Self::SpamFilter => "Spam filter",
            Self::ScamPhrase => "Scam phrase",
            Self::MassMention => "Mass mention",
            Self::RateLimit => "Spam",
            Self::ScamImage => "Scam image",
            Self::Nsfw => "NSFW content",
        }
    }
}

impl fmt::Display for ReasonCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.title())
    }
}

/// Outcome of a check.
///
/// Only [`Verdict::muted`] sets `mute`, and it always sets `matched` too.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verdict {
    matched: bool,
    category: Option<ReasonCategory>,
    detail: String,
    mute: bool,
    #[serde(
        rename = "evidence_jpeg_base64",
        serialize_with = "serialize_evidence",
        skip_serializing_if = "Option::is_none"
    )]
    evidence: Option<Vec<u8>>,
}

fn serialize_evidence<S: Serializer>(
    evidence: &Option<Vec<u8>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match evidence {
        Some(bytes) => serializer.serialize_some(&BASE64.encode(bytes)),
        None => serializer.serialize_none(),
    }
}

impl Verdict {
    #[must_use]
    pub const fn clean() -> Self {
        Self {
            matched: false,
            category: None,
            detail: String::new(),
            mute: false,
            evidence: None,
        }
    }

    /// Matched; the message is removed but the author is not timed out.
    #[must_use]
    pub fn flagged(category: ReasonCategory, detail: impl Into<String>) -> Self {
        Self {
            matched: true,
            category: Some(category),
            detail: detail.into(),
            mute: false,
            evidence: None,
        }
    }

    /// Matched and the author is timed out.
    #[must_use]
    pub fn muted(category: ReasonCategory, detail: impl Into<String>) -> Self {
        Self {
            mute: true,
            ..Self::flagged(category, detail)
        }
    }

    #[must_use]
    pub fn with_evidence(mut self, evidence: Option<Vec<u8>>) -> Self {
        self.evidence = evidence;
        self
    }

    #[must_use]
    pub const fn matched(&self) -> bool {
        self.matched
    }

    #[must_use]
    pub const fn category(&self) -> Option<ReasonCategory> {
        self.category
    }

    #[must_use]
    pub fn detail(&self) -> &str {
        &self.detail
    }

    #[must_use]
    pub const fn mute(&self) -> bool {
        self.mute
    }

    #[must_use]
    pub fn evidence(&self) -> Option<&[u8]> {
        self.evidence.as_deref()
    }
}

/// A matched verdict bound to the message it concerns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerdictEvent {
    pub message: MessageRef,
    pub verdict: Verdict,
    /// Attachment URL for image verdicts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn mute_implies_matched() {
        let v = Verdict::muted(ReasonCategory::MassMention, "too many");
        assert!(v.matched() && v.mute());

        let v = Verdict::flagged(ReasonCategory::RateLimit, "fast");
        assert!(v.matched() && !v.mute());

        let v = Verdict::clean();
        assert!(!v.matched() && !v.mute());
        assert_eq!(v.category(), None);
    }

    #[test]
    fn serializes_evidence_as_base64() {
        let v = Verdict::muted(ReasonCategory::ScamImage, "x").with_evidence(Some(vec![1, 2, 3]));
        let json = serde_json::to_value(&v).unwrap();
        assert_eq!(json["category"], "scam_image");
        assert_eq!(json["evidence_jpeg_base64"], "AQID");
        assert_eq!(json["mute"], true);

        let plain =
            serde_json::to_value(Verdict::flagged(ReasonCategory::ScamPhrase, "y")).unwrap();
        assert!(plain.get("evidence_jpeg_base64").is_none());
    }
}
