//! Protocol operations layered on the connection slot: roster, presence,
//! subscriptions, service discovery and rooms.

use tracing::{debug, warn};

use super::ConnectionSlot;
use crate::error::{ConnectionError, RequestError};
use crate::jid::Jid;
use crate::message::Message;
use crate::namespace as ns;
use crate::presence::Presence;
use crate::roster::{parse_roster, RosterFetch};
use crate::stanza::{iq, message, presence, Element};

fn roster_set(item: Element) -> Element {
    iq("set").child(Element::with_ns("query", ns::ROSTER).child(item))
}

fn disco_query(kind: &str, jid: &Jid, node: Option<&str>) -> Element {
    iq("get")
        .attr("to", jid.full())
        .child(Element::with_ns("query", kind).attr_opt("node", node))
}

/// Outbound `<message/>` for `message`, with an XHTML-IM body when it carries html.
pub fn message_stanza(msg: &Message) -> Element {
    let mut stanza = message()
        .attr("to", msg.peer().full())
        .attr("type", msg.message_type().as_str())
        .attr("id", msg.attr_id())
        .child(Element::new("body").text(msg.plaintext()));

    if let Some(html) = msg.html() {
        match Element::parse(&format!(r#"<body xmlns="{}">{}</body>"#, ns::XHTML, html)) {
            Ok(body) => stanza.append(Element::with_ns("html", ns::XHTML_IM).child(body)),
            Err(e) => warn!(id = msg.attr_id(), error = %e, "Dropping malformed html body"),
        }
    }
    stanza
}

impl ConnectionSlot {
    /// Request the roster. With `known_version` the server may answer with an
    /// empty result, meaning the cached roster is current.
    pub async fn fetch_roster(&self, known_version: Option<&str>) -> Result<RosterFetch, RequestError> {
        let query = Element::with_ns("query", ns::ROSTER).attr("ver", known_version.unwrap_or_default());
        let response = self.request(iq("get").child(query)).await?;

        let Some(query) = response.find("query", Some(ns::ROSTER)) else {
            debug!(version = ?known_version, "Roster unchanged");
            return Ok(RosterFetch::Unchanged);
        };
        let items = parse_roster(query);
        debug!(version = ?query.get_attr("ver"), items = items.len(), "Roster received");
        Ok(RosterFetch::Full {
            version: query.get_attr("ver").map(str::to_string),
            items,
        })
    }

    /// Broadcast availability with entity capabilities attached.
    pub fn broadcast_presence(&self, target: Presence, caps: Element) -> Result<(), ConnectionError> {
        if target.is_offline() {
            return self.send_unavailable(None);
        }
        let mut stanza = presence();
        if let Some(show) = target.show() {
            stanza.append(Element::new("show").text(show));
        }
        stanza.append(caps);
        self.send(stanza)
    }

    pub fn send_unavailable(&self, status: Option<&str>) -> Result<(), ConnectionError> {
        let mut stanza = presence().attr("type", "unavailable");
        if let Some(status) = status {
            stanza.append(Element::new("status").text(status));
        }
        self.send(stanza)
    }

    /// Roster set followed by a subscription request.
    pub async fn add_contact(&self, jid: &Jid, alias: Option<&str>) -> Result<(), RequestError> {
        let item = Element::new("item").attr("jid", jid.bare()).attr_opt("name", alias);
        self.request(roster_set(item)).await?;
        self.send_subscription_request(jid)?;
        Ok(())
    }

    pub async fn remove_contact(&self, jid: &Jid) -> Result<(), RequestError> {
        let item = Element::new("item")
            .attr("jid", jid.bare())
            .attr("subscription", "remove");
        self.request(roster_set(item)).await?;
        Ok(())
    }

    pub async fn set_display_name(&self, jid: &Jid, name: &str) -> Result<(), RequestError> {
        let item = Element::new("item").attr("jid", jid.bare()).attr("name", name);
        self.request(roster_set(item)).await?;
        Ok(())
    }

    pub fn send_subscription_request(&self, jid: &Jid) -> Result<(), ConnectionError> {
        self.send(presence().attr("to", jid.bare()).attr("type", "subscribe"))
    }

    /// Approve or deny an incoming subscription request.
    pub fn send_subscription_answer(&self, jid: &Jid, accept: bool) -> Result<(), ConnectionError> {
        let answer = if accept { "subscribed" } else { "unsubscribed" };
        self.send(presence().attr("to", jid.bare()).attr("type", answer))
    }

    /// The `<query xmlns="http://jabber.org/protocol/disco#info"/>` of `jid`.
    pub async fn disco_info(&self, jid: &Jid, node: Option<&str>) -> Result<Element, RequestError> {
        let response = self.request(disco_query(ns::DISCO_INFO, jid, node)).await?;
        Ok(response
            .find("query", Some(ns::DISCO_INFO))
            .cloned()
            .unwrap_or_else(|| Element::with_ns("query", ns::DISCO_INFO)))
    }

    pub async fn disco_items(&self, jid: &Jid, node: Option<&str>) -> Result<Vec<Element>, RequestError> {
        let response = self.request(disco_query(ns::DISCO_ITEMS, jid, node)).await?;
        Ok(response
            .find("query", Some(ns::DISCO_ITEMS))
            .map(|q| q.find_all("item").cloned().collect())
            .unwrap_or_default())
    }

    /// Enter a room. `full_jid` is `room@service/nick`.
    pub fn join_room(&self, full_jid: &Jid, password: Option<&str>) -> Result<(), ConnectionError> {
        let mut x = Element::with_ns("x", ns::MUC);
        if let Some(password) = password {
            x.append(Element::new("password").text(password));
        }
        self.send(presence().attr("to", full_jid.full()).child(x))
    }

    pub fn leave_room(&self, full_jid: &Jid, exit_message: Option<&str>) -> Result<(), ConnectionError> {
        let mut stanza = presence().attr("to", full_jid.full()).attr("type", "unavailable");
        if let Some(exit_message) = exit_message {
            stanza.append(Element::new("status").text(exit_message));
        }
        self.send(stanza)
    }
}
