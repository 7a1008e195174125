use tracing::trace;

use crate::account::Account;
use crate::registry::HandlerOutcome;
use crate::stanza::{iq_result_for, Element};

/// Answer `urn:xmpp:ping` requests.
pub(crate) fn handle(account: &Account, stanza: &Element) -> anyhow::Result<HandlerOutcome> {
    trace!(from = ?stanza.get_attr("from"), "Ping");
    account.connection().send(iq_result_for(stanza))?;
    Ok(HandlerOutcome::Preserve)
}
