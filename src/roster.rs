//! Roster parsing and reconciliation against the persisted contact set.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::jid::Jid;
use crate::stanza::Element;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Subscription {
    #[default]
    None,
    To,
    From,
    Both,
}

impl Subscription {
    pub fn from_attr(value: Option<&str>) -> Self {
        match value {
            Some("to") => Self::To,
            Some("from") => Self::From,
            Some("both") => Self::Both,
            _ => Self::None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::To => "to",
            Self::From => "from",
            Self::Both => "both",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterItem {
    /// Always bare.
    pub jid: Jid,
    /// Defaults to the bare address.
    pub name: String,
    pub subscription: Subscription,
    /// Outgoing subscription request pending (`ask="subscribe"`).
    pub ask: bool,
    pub groups: Vec<String>,
    /// `subscription="remove"` in a roster push.
    pub removed: bool,
}

impl RosterItem {
    pub fn parse(item: &Element) -> Option<Self> {
        let raw = item.get_attr("jid")?;
        let jid = match Jid::parse(raw) {
            Ok(jid) => jid.to_bare(),
            Err(e) => {
                warn!(jid = raw, error = %e, "Skipping roster item with invalid address");
                return None;
            }
        };
        let name = item
            .get_attr("name")
            .filter(|n| !n.trim().is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| jid.bare());
        let subscription_attr = item.get_attr("subscription");

        Some(Self {
            name,
            subscription: Subscription::from_attr(subscription_attr),
            ask: item.get_attr("ask") == Some("subscribe"),
            groups: item.find_all("group").map(Element::text_content).collect(),
            removed: subscription_attr == Some("remove"),
            jid,
        })
    }
}

/// Items of a `<query xmlns="jabber:iq:roster"/>`.
pub fn parse_roster(query: &Element) -> Vec<RosterItem> {
    query.find_all("item").filter_map(RosterItem::parse).collect()
}

/// Outcome of a versioned roster request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RosterFetch {
    /// Empty result: the cached roster is current.
    Unchanged,
    Full {
        version: Option<String>,
        items: Vec<RosterItem>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RosterDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl RosterDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Set difference between the persisted and fetched contact ids, both sides sorted.
pub fn diff<'a, I, J>(old: I, new: J) -> RosterDiff
where
    I: IntoIterator<Item = &'a str>,
    J: IntoIterator<Item = &'a str>,
{
    let old: BTreeSet<&str> = old.into_iter().collect();
    let new: BTreeSet<&str> = new.into_iter().collect();
    RosterDiff {
        added: new.difference(&old).map(|s| s.to_string()).collect(),
        removed: old.difference(&new).map(|s| s.to_string()).collect(),
    }
}
