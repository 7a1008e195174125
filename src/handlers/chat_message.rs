//! Inbound chat messages, including forwarded messages and carbons (XEP-0280).

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::account::Account;
use crate::contact::ContactKind;
use crate::jid::Jid;
use crate::message::{Direction, Message, MessageType};
use crate::namespace as ns;
use crate::pipe::IncomingMessage;
use crate::registry::HandlerOutcome;
use crate::stanza::Element;

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedMessage {
    /// The other party, with the resource it wrote from.
    pub peer: Jid,
    pub message: Message,
}

fn jid_attr(element: &Element, key: &str) -> Option<Jid> {
    element.get_attr(key).and_then(|v| Jid::parse(v).ok())
}

fn delay_stamp(element: &Element) -> Option<DateTime<Utc>> {
    let stamp = element.find("delay", Some(ns::DELAY))?.get_attr("stamp")?;
    match DateTime::parse_from_rfc3339(stamp) {
        Ok(stamp) => Some(stamp.with_timezone(&Utc)),
        Err(e) => {
            debug!(stamp, error = %e, "Ignoring unparsable delay stamp");
            None
        }
    }
}

/// Extract the message carried by `stanza` as seen by `own`.
///
/// Returns `None` for errors, messages without a body and carbons that do not
/// come from the account itself.
pub fn parse_message(stanza: &Element, own: &Jid) -> Option<ParsedMessage> {
    if stanza.get_attr("type") == Some("error") {
        return None;
    }

    let carbon = stanza
        .children()
        .find(|c| c.ns() == Some(ns::CARBONS) && matches!(c.local_name(), "sent" | "received"));
    let forwarded = match carbon {
        Some(carbon) => Some(carbon.find("forwarded", Some(ns::FORWARD))?),
        None => stanza.find("forwarded", Some(ns::FORWARD)),
    };
    let element = match forwarded {
        Some(forwarded) => forwarded.find("message", None)?,
        None => stanza,
    };

    let (direction, peer) = match carbon {
        Some(carbon) => {
            let sender = jid_attr(stanza, "from");
            if sender.map(|s| s.bare()) != Some(own.bare()) {
                warn!(from = ?stanza.get_attr("from"), "Dropping carbon not sent by own account");
                return None;
            }
            if carbon.local_name() == "sent" {
                (Direction::Out, jid_attr(element, "to")?)
            } else {
                (Direction::In, jid_attr(element, "from")?)
            }
        }
        None => (Direction::In, jid_attr(stanza, "from")?),
    };

    let html = element
        .find("html", Some(ns::XHTML_IM))
        .and_then(|html| html.find("body", Some(ns::XHTML)))
        .map(Element::inner_xml);
    let plaintext = element.child_text("body");
    if plaintext.is_none() && html.is_none() {
        return None;
    }

    let mut builder = Message::builder(peer.clone(), direction, plaintext.unwrap_or_default())
        .message_type(MessageType::from_attr(element.get_attr("type")))
        .html(html)
        .forwarded(forwarded.is_some())
        .carbon(carbon.is_some());

    let stanza_id = element
        .find("stanza-id", Some(ns::STANZA_ID))
        .or_else(|| stanza.find("stanza-id", Some(ns::STANZA_ID)))
        .and_then(|s| s.get_attr("id"));
    if let Some(uid) = stanza_id {
        builder = builder.uid(uid);
    }
    if let Some(id) = element.get_attr("id") {
        builder = builder.attr_id(id);
    }
    let stamp = delay_stamp(element).or_else(|| forwarded.and_then(delay_stamp));
    if let Some(stamp) = stamp {
        builder = builder.stamp(stamp);
    }

    Some(ParsedMessage {
        peer,
        message: builder.build(),
    })
}

pub(crate) fn handle(account: &Account, stanza: &Element) -> anyhow::Result<HandlerOutcome> {
    let Some(ParsedMessage { peer, message }) = parse_message(stanza, account.jid()) else {
        return Ok(HandlerOutcome::Preserve);
    };
    let Some(contact) = account.contact(&peer) else {
        info!(from = %peer, "Dropping message from unknown sender");
        return Ok(HandlerOutcome::Preserve);
    };

    if contact.kind() == ContactKind::Chat && message.direction() == Direction::In {
        contact.set_resource(peer.resource().map(str::to_string));
    }
    account.enqueue_incoming(IncomingMessage {
        contact,
        message,
        stanza: stanza.clone(),
    });
    Ok(HandlerOutcome::Preserve)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn own() -> Jid {
        Jid::parse("alice@example.com").unwrap()
    }

    fn parse(xml: &str) -> Option<ParsedMessage> {
        parse_message(&Element::parse(xml).unwrap(), &own())
    }

    #[test]
    fn test_plain_message() {
        let parsed = parse(
            r#"<message from="bob@example.com/phone" to="alice@example.com" type="chat" id="m1"><body>hi</body><stanza-id xmlns="urn:xmpp:sid:0" id="s1" by="alice@example.com"/></message>"#,
        )
        .unwrap();
        assert_eq!(parsed.peer.full(), "bob@example.com/phone");
        assert_eq!(parsed.message.uid(), "s1");
        assert_eq!(parsed.message.attr_id(), "m1");
        assert_eq!(parsed.message.plaintext(), "hi");
        assert_eq!(parsed.message.direction(), Direction::In);
        assert!(!parsed.message.is_forwarded());
    }

    #[test]
    fn test_without_body_is_ignored() {
        assert!(parse(r#"<message from="bob@example.com"><active xmlns="http://jabber.org/protocol/chatstates"/></message>"#).is_none());
        assert!(parse(r#"<message from="bob@example.com" type="error"><body>x</body></message>"#).is_none());
    }

    #[test]
    fn test_sent_carbon_is_outbound() {
        let parsed = parse(
            r#"<message from="alice@example.com" to="alice@example.com/laptop"><sent xmlns="urn:xmpp:carbons:2"><forwarded xmlns="urn:xmpp:forward:0"><message xmlns="jabber:client" from="alice@example.com/phone" to="bob@example.com" type="chat" id="c1"><body>from my phone</body></message></forwarded></sent></message>"#,
        )
        .unwrap();
        assert_eq!(parsed.message.direction(), Direction::Out);
        assert_eq!(parsed.peer.bare(), "bob@example.com");
        assert!(parsed.message.is_carbon());
        assert!(parsed.message.is_forwarded());
        assert!(!parsed.message.is_unread());
    }

    #[test]
    fn test_received_carbon_is_inbound() {
        let parsed = parse(
            r#"<message from="alice@example.com" to="alice@example.com/laptop"><received xmlns="urn:xmpp:carbons:2"><forwarded xmlns="urn:xmpp:forward:0"><message xmlns="jabber:client" from="bob@example.com/desk" to="alice@example.com/phone" type="chat"><body>hey</body></message></forwarded></received></message>"#,
        )
        .unwrap();
        assert_eq!(parsed.message.direction(), Direction::In);
        assert_eq!(parsed.peer.full(), "bob@example.com/desk");
    }

    #[test]
    fn test_spoofed_carbon_dropped() {
        assert!(parse(
            r#"<message from="mallory@evil.com" to="alice@example.com/laptop"><received xmlns="urn:xmpp:carbons:2"><forwarded xmlns="urn:xmpp:forward:0"><message xmlns="jabber:client" from="bob@example.com/desk" to="alice@example.com"><body>trust me</body></message></forwarded></received></message>"#,
        )
        .is_none());
    }

    #[test]
    fn test_forwarded_with_delay_and_html() {
        let parsed = parse(
            r#"<message from="bob@example.com/desk" to="alice@example.com"><forwarded xmlns="urn:xmpp:forward:0"><delay xmlns="urn:xmpp:delay" stamp="2024-03-01T10:00:00Z"/><message xmlns="jabber:client" from="carol@example.com" to="bob@example.com"><body>hello</body><html xmlns="http://jabber.org/protocol/xhtml-im"><body xmlns="http://www.w3.org/1999/xhtml"><p>hello</p></body></html></message></forwarded></message>"#,
        )
        .unwrap();
        assert!(parsed.message.is_forwarded());
        assert!(!parsed.message.is_carbon());
        assert_eq!(parsed.peer.full(), "bob@example.com/desk");
        assert_eq!(parsed.message.stamp().to_rfc3339(), "2024-03-01T10:00:00+00:00");
        assert_eq!(parsed.message.html(), Some("<p>hello</p>"));
    }
}
