use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A chat message as delivered by the platform gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub id: String,
    pub channel_id: String,
    #[serde(default)]
    pub community_id: Option<String>,
    pub author: Author,
    #[serde(default)]
    pub content: String,
    /// Number of users mentioned
    #[serde(default)]
    pub mentions: usize,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    /// When the author joined the community, if the platform sent member data
    #[serde(default)]
    pub member_joined_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub bot: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// `http(s)://` URL or local path
    pub url: String,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
}

impl Attachment {
    #[must_use]
    pub fn is_image(&self) -> bool {
        self.content_type
            .as_deref()
            .is_some_and(|ct| ct.starts_with("image/"))
    }
}

impl InboundMessage {
    pub fn image_attachments(&self) -> impl Iterator<Item = &Attachment> {
        self.attachments.iter().filter(|a| a.is_image())
    }

    #[must_use]
    pub fn reference(&self) -> MessageRef {
        MessageRef {
            message_id: self.id.clone(),
            channel_id: self.channel_id.clone(),
            community_id: self.community_id.clone(),
            author_id: self.author.id.clone(),
            author_name: self.author.name.clone(),
        }
    }
}

/// Identifies the message a verdict is about.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageRef {
    pub message_id: String,
    pub channel_id: String,
    pub community_id: Option<String>,
    pub author_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author_name: Option<String>,
}
