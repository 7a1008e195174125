use tracing::{debug, info, warn};

use crate::account::{Account, ContactPresence};
use crate::jid::Jid;
use crate::presence::Presence;
use crate::registry::HandlerOutcome;
use crate::stanza::Element;
use crate::transport::negotiate::stanza_error_condition;

pub(crate) fn handle(account: &Account, stanza: &Element) -> anyhow::Result<HandlerOutcome> {
    let Some(from) = stanza.get_attr("from").and_then(|f| Jid::parse(f).ok()) else {
        debug!("Presence without a usable sender");
        return Ok(HandlerOutcome::Preserve);
    };
    if from.bare() == account.uid() {
        debug!(from = %from, "Ignoring own presence");
        return Ok(HandlerOutcome::Preserve);
    }

    let presence_type = stanza.get_attr("type");
    match presence_type {
        Some("error") => {
            let error = stanza.find("error", None);
            warn!(
                from = %from,
                error_type = ?error.and_then(|e| e.get_attr("type")),
                condition = %stanza_error_condition(stanza),
                text = ?error.and_then(|e| e.child_text("text")),
                "Presence error"
            );
            return Ok(HandlerOutcome::Preserve);
        }
        Some("subscribe") => {
            match account.contact(&from) {
                Some(contact) => {
                    info!(from = %from, "Approving subscription request from known contact");
                    account.connection().send_subscription_answer(&contact.jid(), true)?;
                }
                None => {
                    info!(from = %from, "Subscription request");
                    account.hooks().subscription_request.emit(&from.to_bare());
                }
            }
            return Ok(HandlerOutcome::Preserve);
        }
        None | Some("unavailable") | Some("unsubscribed") => {}
        Some(other) => {
            debug!(from = %from, presence_type = other, "Ignoring presence");
            return Ok(HandlerOutcome::Preserve);
        }
    }

    let Some(contact) = account.contact(&from) else {
        warn!(from = %from, "Presence from unknown contact");
        return Ok(HandlerOutcome::Preserve);
    };

    let presence = Presence::from_stanza(presence_type, stanza.child_text("show").as_deref());
    contact.set_status(stanza.child_text("status").filter(|s| !s.trim().is_empty()));
    let (presence, previous) = contact.set_presence(from.resource(), presence);
    // New messages go to the bare address until the contact writes from a resource.
    contact.set_resource(None);
    debug!(from = %from, presence = %presence, previous = %previous, "Contact presence");

    account.hooks().presence_changed.emit(&ContactPresence {
        contact,
        presence,
        previous,
    });
    Ok(HandlerOutcome::Preserve)
}
