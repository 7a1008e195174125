use tracing::{debug, warn};

use crate::account::Account;
use crate::jid::Jid;
use crate::namespace as ns;
use crate::registry::HandlerOutcome;
use crate::roster::parse_roster;
use crate::stanza::{iq_result_for, Element};

/// Apply a server roster push and acknowledge it.
pub(crate) fn handle(account: &Account, stanza: &Element) -> anyhow::Result<HandlerOutcome> {
    if let Some(from) = stanza.get_attr("from") {
        let trusted = Jid::parse(from).is_ok_and(|jid| jid.bare() == account.uid());
        if !trusted {
            warn!(from, "Ignoring roster push from a foreign address");
            return Ok(HandlerOutcome::Preserve);
        }
    }
    let Some(query) = stanza.find("query", Some(ns::ROSTER)) else {
        return Ok(HandlerOutcome::Preserve);
    };

    let items = parse_roster(query);
    debug!(items = items.len(), version = ?query.get_attr("ver"), "Roster push");
    account.apply_roster_push(items, query.get_attr("ver").map(str::to_string))?;
    account.connection().send(iq_result_for(stanza))?;
    Ok(HandlerOutcome::Preserve)
}
