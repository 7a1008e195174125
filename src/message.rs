use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::jid::Jid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    Chat,
    Groupchat,
    Normal,
    Headline,
}

impl MessageType {
    /// Value of a `<message type=".."/>` attribute. A missing or unknown type is `normal`.
    pub fn from_attr(value: Option<&str>) -> Self {
        match value {
            Some("chat") => Self::Chat,
            Some("groupchat") => Self::Groupchat,
            Some("headline") => Self::Headline,
            _ => Self::Normal,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Groupchat => "groupchat",
            Self::Normal => "normal",
            Self::Headline => "headline",
        }
    }
}

/// A chat message as stored in a transcript.
///
/// Only the read and delivery flags change after construction. `next` links to
/// the next older message of the same transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    uid: String,
    attr_id: String,
    peer: Jid,
    direction: Direction,
    #[serde(default)]
    message_type: MessageType,
    plaintext: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    html: Option<String>,
    stamp: DateTime<Utc>,
    #[serde(default)]
    forwarded: bool,
    #[serde(default)]
    carbon: bool,
    #[serde(default)]
    unread: bool,
    #[serde(default)]
    delivered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    next: Option<String>,
}

impl Message {
    pub fn builder(peer: Jid, direction: Direction, plaintext: impl Into<String>) -> MessageBuilder {
        MessageBuilder {
            uid: None,
            attr_id: None,
            peer,
            direction,
            message_type: MessageType::Chat,
            plaintext: plaintext.into(),
            html: None,
            stamp: None,
            forwarded: false,
            carbon: false,
        }
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// The stanza `id` attribute.
    pub fn attr_id(&self) -> &str {
        &self.attr_id
    }

    pub fn peer(&self) -> &Jid {
        &self.peer
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn plaintext(&self) -> &str {
        &self.plaintext
    }

    pub fn html(&self) -> Option<&str> {
        self.html.as_deref()
    }

    pub fn stamp(&self) -> DateTime<Utc> {
        self.stamp
    }

    pub fn is_forwarded(&self) -> bool {
        self.forwarded
    }

    pub fn is_carbon(&self) -> bool {
        self.carbon
    }

    pub fn is_unread(&self) -> bool {
        self.unread
    }

    pub fn is_delivered(&self) -> bool {
        self.delivered
    }

    pub fn next(&self) -> Option<&str> {
        self.next.as_deref()
    }

    pub fn mark_read(&mut self) {
        self.unread = false;
    }

    pub fn mark_delivered(&mut self) {
        self.delivered = true;
    }

    pub(crate) fn set_next(&mut self, next: Option<String>) {
        self.next = next;
    }
}

pub struct MessageBuilder {
    uid: Option<String>,
    attr_id: Option<String>,
    peer: Jid,
    direction: Direction,
    message_type: MessageType,
    plaintext: String,
    html: Option<String>,
    stamp: Option<DateTime<Utc>>,
    forwarded: bool,
    carbon: bool,
}

impl MessageBuilder {
    pub fn uid(mut self, uid: impl Into<String>) -> Self {
        self.uid = Some(uid.into());
        self
    }

    pub fn attr_id(mut self, attr_id: impl Into<String>) -> Self {
        self.attr_id = Some(attr_id.into());
        self
    }

    pub fn message_type(mut self, message_type: MessageType) -> Self {
        self.message_type = message_type;
        self
    }

    pub fn html(mut self, html: Option<String>) -> Self {
        self.html = html;
        self
    }

    pub fn stamp(mut self, stamp: DateTime<Utc>) -> Self {
        self.stamp = Some(stamp);
        self
    }

    pub fn forwarded(mut self, forwarded: bool) -> Self {
        self.forwarded = forwarded;
        self
    }

    pub fn carbon(mut self, carbon: bool) -> Self {
        self.carbon = carbon;
        self
    }

    /// Without an explicit uid a random one is generated; the stanza id defaults to it.
    pub fn build(self) -> Message {
        let uid = self.uid.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        Message {
            attr_id: self.attr_id.unwrap_or_else(|| uid.clone()),
            uid,
            peer: self.peer,
            direction: self.direction,
            message_type: self.message_type,
            plaintext: self.plaintext,
            html: self.html,
            stamp: self.stamp.unwrap_or_else(Utc::now),
            forwarded: self.forwarded,
            carbon: self.carbon,
            unread: self.direction == Direction::In,
            delivered: false,
            next: None,
        }
    }
}
