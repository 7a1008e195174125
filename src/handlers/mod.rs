//! Stanza handlers installed on every account connection.
//!
//! Handlers hold a weak account reference and unregister themselves once the
//! account is gone.

pub mod chat_message;
pub mod disco;
pub mod ping;
pub mod presence;
pub mod roster_push;

pub use chat_message::{parse_message, ParsedMessage};
pub use disco::Capabilities;

use crate::account::{Account, WeakAccount};
use crate::error::ConnectionError;
use crate::namespace as ns;
use crate::registry::{HandlerFilter, HandlerId, HandlerOutcome};
use crate::stanza::Element;

type AccountHandler = fn(&Account, &Element) -> anyhow::Result<HandlerOutcome>;

fn bind(
    account: WeakAccount,
    handler: AccountHandler,
) -> impl Fn(&Element) -> anyhow::Result<HandlerOutcome> + Send + Sync + 'static {
    move |stanza| match account.upgrade() {
        Some(account) => handler(&account, stanza),
        None => Ok(HandlerOutcome::Remove),
    }
}

pub(crate) fn install(account: &Account) -> Result<Vec<HandlerId>, ConnectionError> {
    let slot = account.connection();
    let handlers: [(HandlerFilter, AccountHandler); 5] = [
        (HandlerFilter::new().name("presence"), presence::handle),
        (HandlerFilter::new().name("message"), chat_message::handle),
        (
            HandlerFilter::new().name("iq").stanza_type("set").ns(ns::ROSTER),
            roster_push::handle,
        ),
        (
            HandlerFilter::new().name("iq").stanza_type("get").ns(ns::DISCO_INFO),
            disco::handle,
        ),
        (HandlerFilter::new().name("iq").stanza_type("get").ns(ns::PING), ping::handle),
    ];

    handlers
        .into_iter()
        .map(|(filter, handler)| slot.register_handler(filter, bind(account.downgrade(), handler)))
        .collect()
}
