//! XMPP session engine.
//!
//! A [`SessionContext`] owns the accounts. Each [`Account`] keeps one connection
//! slot that buffers operations until a transport is established, dispatches
//! inbound stanzas to its handlers, keeps its contacts in sync with the server
//! roster and reconnects on transport loss.

pub mod account;
pub mod config;
pub mod connection;
pub mod connector;
pub mod contact;
pub mod context;
pub mod error;
pub mod handlers;
pub mod hooks;
pub mod jid;
pub mod message;
pub mod namespace;
pub mod pipe;
pub mod presence;
pub mod registry;
pub mod roster;
pub mod stanza;
pub mod storage;
pub mod transcript;
pub mod transport;

pub use account::{Account, AccountHooks, AccountMode, ContactPresence, ReceivedMessage, SessionRecord};
pub use config::{SessionConfig, SessionLossPolicy};
pub use connection::ConnectionSlot;
pub use connector::{ConnectParams, ConnectionStatus, StatusChange};
pub use contact::{Contact, ContactKind};
pub use context::SessionContext;
pub use error::{Result, SessionError};
pub use jid::Jid;
pub use message::{Direction, Message, MessageType};
pub use presence::Presence;
pub use stanza::Element;
pub use storage::{MemoryStorage, ScopedStorage, Storage};
pub use transcript::Transcript;
