//! One server identity: its connection slot, contact map, hooks and the
//! session-loss policy.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::{SessionConfig, SessionLossPolicy};
use crate::connection::{message_stanza, ConnectionSlot, LiveConnection};
use crate::connector::{ConnectParams, ConnectionStatus, Connector, StateMachine, StatusChange};
use crate::contact::{Contact, ContactData, ContactKind};
use crate::error::{SessionError, StorageError};
use crate::handlers::{self, Capabilities};
use crate::hooks::{Hook, SubscriptionId};
use crate::jid::Jid;
use crate::message::Message;
use crate::pipe::{IncomingMessage, OutgoingMessage, Pipes};
use crate::presence::{Presence, PresenceController};
use crate::registry::HandlerId;
use crate::roster::{self, RosterDiff, RosterFetch, RosterItem};
use crate::storage::{ScopedStorage, Storage, StorageChange};
use crate::transport::TransportFactory;

const CONTACTS_KEY: &str = "contacts";
const ROSTER_VERSION_KEY: &str = "roster:version";
const ROSTER_LOADED_KEY: &str = "roster:loaded";
const SESSION_KEY: &str = "session";

/// How an account comes to life.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountMode {
    /// Fresh login with credentials.
    Login { url: String, jid: String, password: String },
    /// Resume a transport session by id and request id.
    Attach { url: String, jid: String, sid: String, rid: u64 },
    /// Attach to the session persisted for `uid`.
    Restore { uid: String },
}

/// Persisted under `<uid>:session` so the account can be restored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub url: String,
    pub jid: String,
    pub sid: String,
    pub rid: u64,
}

impl SessionRecord {
    pub fn load(backend: &Arc<dyn Storage>, uid: &str) -> Option<Self> {
        ScopedStorage::account(backend.clone(), uid).get_as(SESSION_KEY)
    }
}

#[derive(Debug, Clone)]
pub struct ContactPresence {
    pub contact: Arc<Contact>,
    pub presence: Presence,
    pub previous: Presence,
}

#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub contact: Arc<Contact>,
    pub message: Message,
}

/// Typed subscriber lists for everything an account reports.
#[derive(Default)]
pub struct AccountHooks {
    pub presence_changed: Hook<ContactPresence>,
    pub connection_status: Hook<StatusChange>,
    pub contact_added: Hook<Arc<Contact>>,
    pub contact_removed: Hook<Arc<Contact>>,
    /// Bare address of someone asking to see our presence.
    pub subscription_request: Hook<Jid>,
    pub message_received: Hook<ReceivedMessage>,
    /// Fires once, with the uid, when the account is destroyed.
    pub removed: Hook<String>,
}

/// Collaborators shared by every account of a context.
#[derive(Clone)]
pub(crate) struct Shared {
    pub backend: Arc<dyn Storage>,
    pub presence: Arc<PresenceController>,
    pub config: SessionConfig,
    pub factory: Arc<dyn TransportFactory>,
    pub pipes: Arc<Pipes>,
    pub capabilities: Arc<Capabilities>,
}

pub(crate) struct AccountInner {
    jid: Jid,
    uid: String,
    params: Mutex<ConnectParams>,
    session_id: Mutex<String>,

    slot: ConnectionSlot,
    machine: Arc<StateMachine>,
    connector: Connector,
    connect_lock: tokio::sync::Mutex<()>,

    contacts: Mutex<HashMap<String, Arc<Contact>>>,
    storage: ScopedStorage,
    shared: Shared,
    hooks: AccountHooks,

    ingest: Mutex<Option<mpsc::UnboundedSender<IncomingMessage>>>,
    handlers: Mutex<Vec<HandlerId>>,
    status_hook: Mutex<Option<SubscriptionId>>,
    contacts_hook: Mutex<Option<SubscriptionId>>,
    destroyed: AtomicBool,
}

#[derive(Clone)]
pub struct Account {
    inner: Arc<AccountInner>,
}

#[derive(Clone)]
pub(crate) struct WeakAccount(Weak<AccountInner>);

impl WeakAccount {
    pub fn upgrade(&self) -> Option<Account> {
        self.0.upgrade().map(|inner| Account { inner })
    }
}

impl Account {
    pub(crate) fn new(params: ConnectParams, shared: Shared) -> Result<Self, SessionError> {
        let jid = params.jid().to_bare();
        let uid = jid.bare();
        let session_id = match &params {
            ConnectParams::Attach { sid, .. } => sid.clone(),
            ConnectParams::Login { .. } => String::new(),
        };

        let inner = Arc::new(AccountInner {
            storage: ScopedStorage::account(shared.backend.clone(), &uid),
            connector: Connector::new(shared.factory.clone(), &shared.config),
            jid,
            uid,
            params: Mutex::new(params),
            session_id: Mutex::new(session_id),
            slot: ConnectionSlot::with_request_timeout(shared.config.request_timeout),
            machine: Arc::new(StateMachine::new()),
            connect_lock: tokio::sync::Mutex::new(()),
            contacts: Mutex::new(HashMap::new()),
            shared,
            hooks: AccountHooks::default(),
            ingest: Mutex::new(None),
            handlers: Mutex::new(Vec::new()),
            status_hook: Mutex::new(None),
            contacts_hook: Mutex::new(None),
            destroyed: AtomicBool::new(false),
        });
        let account = Account { inner };

        account.restore_contacts();
        *account.inner.handlers.lock() = handlers::install(&account)?;
        account.watch_connection();
        account.watch_contact_list();
        info!(jid = %account.uid(), contacts = account.inner.contacts.lock().len(), "Account created");
        Ok(account)
    }

    pub(crate) fn downgrade(&self) -> WeakAccount {
        WeakAccount(Arc::downgrade(&self.inner))
    }

    /// Bare address.
    pub fn uid(&self) -> &str {
        &self.inner.uid
    }

    pub fn jid(&self) -> &Jid {
        &self.inner.jid
    }

    pub fn session_id(&self) -> String {
        self.inner.session_id.lock().clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.machine.status()
    }

    pub fn hooks(&self) -> &AccountHooks {
        &self.inner.hooks
    }

    pub fn connection(&self) -> &ConnectionSlot {
        &self.inner.slot
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.inner.shared.capabilities
    }

    /// Account-scoped storage (`<uid>:`).
    pub fn storage(&self) -> &ScopedStorage {
        &self.inner.storage
    }

    /// Session-scoped storage (`<uid>@<session id>:`).
    pub fn session_storage(&self) -> ScopedStorage {
        ScopedStorage::session(self.inner.shared.backend.clone(), &self.inner.uid, &self.session_id())
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    fn ensure_alive(&self) -> Result<(), SessionError> {
        if self.is_destroyed() {
            return Err(SessionError::AccountDestroyed(self.inner.uid.clone()));
        }
        Ok(())
    }

    // Contacts

    pub fn contact(&self, jid: &Jid) -> Option<Arc<Contact>> {
        self.inner.contacts.lock().get(&jid.bare()).cloned()
    }

    /// All contacts, ordered by id.
    pub fn contacts(&self) -> Vec<Arc<Contact>> {
        let mut contacts: Vec<_> = self.inner.contacts.lock().values().cloned().collect();
        contacts.sort_by(|a, b| a.id().cmp(b.id()));
        contacts
    }

    fn persistent_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .contacts
            .lock()
            .values()
            .filter(|c| c.is_persistent())
            .map(|c| c.id().to_string())
            .collect();
        ids.sort();
        ids
    }

    fn persist_contact_list(&self) -> Result<(), StorageError> {
        let ids = self.persistent_ids();
        self.inner.storage.set_as(CONTACTS_KEY, &ids)
    }

    fn restore_contacts(&self) {
        let ids: Vec<String> = self.inner.storage.get_as(CONTACTS_KEY).unwrap_or_default();
        let mut contacts = self.inner.contacts.lock();
        for id in ids {
            match Contact::load(self.inner.storage.clone(), &id) {
                Some(contact) => {
                    contacts.insert(id, Arc::new(contact));
                }
                None => warn!(jid = %id, "Listed contact has no stored data"),
            }
        }
    }

    /// Create or update the contact for a roster entry. Returns the contact and
    /// whether it was created.
    fn upsert_contact(&self, item: &RosterItem) -> Result<(Arc<Contact>, bool), StorageError> {
        let id = item.jid.bare();
        let existing = self.inner.contacts.lock().get(&id).cloned();
        match existing {
            Some(contact) => {
                if contact.apply_item(item) {
                    contact.save()?;
                }
                Ok((contact, false))
            }
            None => {
                let contact = Arc::new(Contact::new(self.inner.storage.clone(), ContactData::from_item(item)));
                contact.save()?;
                self.inner.contacts.lock().insert(id, contact.clone());
                Ok((contact, true))
            }
        }
    }

    /// Drop a contact from the map and the store, and announce it.
    fn remove_contact_local(&self, id: &str) -> Option<Arc<Contact>> {
        let contact = self.inner.contacts.lock().remove(id)?;
        if let Err(e) = contact.delete() {
            warn!(jid = %id, error = %e, "Failed to delete stored contact");
        }
        debug!(jid = %id, "Contact removed");
        self.inner.hooks.contact_removed.emit(&contact);
        Some(contact)
    }

    /// A contact that lives only until the next roster sync, e.g. a room.
    pub fn add_ephemeral_contact(&self, jid: &Jid, kind: ContactKind) -> Arc<Contact> {
        if let Some(existing) = self.contact(jid) {
            return existing;
        }
        let contact = Arc::new(Contact::new(
            self.inner.storage.clone(),
            ContactData::ephemeral(jid, kind),
        ));
        self.inner.contacts.lock().insert(contact.id().to_string(), contact.clone());
        self.inner.hooks.contact_added.emit(&contact);
        contact
    }

    fn remove_ephemeral_contacts(&self) {
        let ids: Vec<String> = self
            .inner
            .contacts
            .lock()
            .values()
            .filter(|c| !c.is_persistent())
            .map(|c| c.id().to_string())
            .collect();
        for id in ids {
            self.remove_contact_local(&id);
        }
    }

    /// Reconcile the contact map with a full roster.
    pub(crate) fn apply_roster(
        &self,
        items: Vec<RosterItem>,
        version: Option<String>,
    ) -> Result<RosterDiff, SessionError> {
        let old: Vec<String> = self.inner.storage.get_as(CONTACTS_KEY).unwrap_or_default();
        let fetched: Vec<String> = items.iter().map(|i| i.jid.bare()).collect();
        let diff = roster::diff(old.iter().map(String::as_str), fetched.iter().map(String::as_str));

        let mut added = Vec::new();
        for item in &items {
            let (contact, created) = self.upsert_contact(item)?;
            if created {
                added.push(contact);
            }
        }

        let fetched: HashSet<&str> = fetched.iter().map(String::as_str).collect();
        let mut removed: Vec<String> = self
            .persistent_ids()
            .into_iter()
            .filter(|id| !fetched.contains(id.as_str()))
            .collect();
        for id in &diff.removed {
            if !removed.contains(id) {
                removed.push(id.clone());
            }
        }
        for id in &removed {
            self.remove_contact_local(id);
        }

        self.persist_contact_list()?;
        if let Some(version) = version {
            self.inner.storage.set_as(ROSTER_VERSION_KEY, &version)?;
        }

        info!(jid = %self.uid(), added = diff.added.len(), removed = diff.removed.len(), "Roster synchronized");
        for contact in &added {
            self.inner.hooks.contact_added.emit(contact);
        }
        Ok(diff)
    }

    /// Apply a roster push: entries are updated one at a time.
    pub(crate) fn apply_roster_push(&self, items: Vec<RosterItem>, version: Option<String>) -> Result<(), SessionError> {
        let mut added = Vec::new();
        for item in &items {
            if item.removed {
                self.remove_contact_local(&item.jid.bare());
                continue;
            }
            let (contact, created) = self.upsert_contact(item)?;
            if created {
                added.push(contact);
            }
        }
        self.persist_contact_list()?;
        if let Some(version) = version {
            self.inner.storage.set_as(ROSTER_VERSION_KEY, &version)?;
        }
        for contact in &added {
            self.inner.hooks.contact_added.emit(contact);
        }
        Ok(())
    }

    /// Another holder of the same store rewrote the contact list.
    fn reconcile_contact_list(&self, change: &StorageChange) {
        if self.is_destroyed() {
            return;
        }
        let listed: HashSet<String> = change
            .new
            .clone()
            .and_then(|v| serde_json::from_value::<Vec<String>>(v).ok())
            .unwrap_or_default()
            .into_iter()
            .collect();
        let known: HashSet<String> = self.persistent_ids().into_iter().collect();

        for id in listed.difference(&known) {
            if self.inner.contacts.lock().contains_key(id) {
                continue;
            }
            if let Some(contact) = Contact::load(self.inner.storage.clone(), id) {
                let contact = Arc::new(contact);
                self.inner.contacts.lock().insert(id.clone(), contact.clone());
                debug!(jid = %id, "Contact added by another session");
                self.inner.hooks.contact_added.emit(&contact);
            }
        }
        for id in known.difference(&listed) {
            let removed = self.inner.contacts.lock().remove(id);
            if let Some(contact) = removed {
                debug!(jid = %id, "Contact removed by another session");
                self.inner.hooks.contact_removed.emit(&contact);
            }
        }
    }

    fn watch_contact_list(&self) {
        let weak = self.downgrade();
        let id = self.inner.storage.register_hook(CONTACTS_KEY, move |change| {
            if let Some(account) = weak.upgrade() {
                account.reconcile_contact_list(change);
            }
        });
        *self.inner.contacts_hook.lock() = Some(id);
    }

    // Connection lifecycle

    fn watch_connection(&self) {
        let weak = self.downgrade();
        let id = self.inner.machine.on_change().subscribe(move |change: &StatusChange| {
            let Some(account) = weak.upgrade() else {
                return;
            };
            account.inner.hooks.connection_status.emit(change);
            if change.from.is_established() && change.to == ConnectionStatus::Disconnected {
                let condition = change.condition.clone();
                match tokio::runtime::Handle::try_current() {
                    Ok(runtime) => {
                        runtime.spawn(async move { account.handle_session_loss(condition).await });
                    }
                    Err(_) => error!(jid = %account.uid(), "Session lost outside of a runtime"),
                }
            }
        });
        *self.inner.status_hook.lock() = Some(id);
    }

    /// Log in or attach. Does nothing when already connected.
    pub async fn connect(&self) -> Result<(), SessionError> {
        self.ensure_alive()?;
        let _connecting = self.inner.connect_lock.lock().await;
        if self.status().is_established() {
            return Ok(());
        }
        let presence = &self.inner.shared.presence;
        if presence.target().is_offline() {
            presence.set_target(Presence::Online);
        }
        self.connect_locked().await
    }

    async fn connect_locked(&self) -> Result<(), SessionError> {
        let params = self.inner.params.lock().clone();
        let established = self.inner.connector.connect(&params, &self.inner.machine).await?;
        self.ensure_alive()?;

        let session_id = match &params {
            ConnectParams::Attach { sid, .. } => sid.clone(),
            ConnectParams::Login { .. } => {
                if let Err(e) = self.session_storage().clear() {
                    warn!(jid = %self.uid(), error = %e, "Failed to clear previous session storage");
                }
                uuid::Uuid::new_v4().to_string()
            }
        };
        *self.inner.session_id.lock() = session_id.clone();
        info!(jid = %self.uid(), session = %session_id, status = %established.status, "Session established");

        let live = LiveConnection::new(established, self.inner.shared.config.request_timeout);
        self.inner.slot.go_live(live);
        self.save_session();
        if let Err(e) = self.init_connection().await {
            self.abandon_session(&e);
            return Err(e);
        }
        Ok(())
    }

    /// Undo a session whose initialisation failed. The status leaves
    /// `established` before the transport closes, then handlers move to a fresh buffer.
    fn abandon_session(&self, cause: &SessionError) {
        warn!(jid = %self.uid(), error = %cause, "Session initialisation failed, closing connection");
        self.inner
            .machine
            .transition(ConnectionStatus::ConnectionFailed, Some(format!("initialisation failed: {}", cause)));
        self.inner.slot.go_buffering();
    }

    /// Roster sync (unless this session already did it) and presence broadcast.
    async fn init_connection(&self) -> Result<(), SessionError> {
        let session = self.session_storage();
        if session.get_bool(ROSTER_LOADED_KEY) {
            debug!(jid = %self.uid(), "Roster already loaded for this session");
        } else {
            self.remove_ephemeral_contacts();
            let known_version = if self.inner.storage.get(CONTACTS_KEY).is_some() {
                self.inner.storage.get_string(ROSTER_VERSION_KEY)
            } else {
                None
            };
            match self.inner.slot.fetch_roster(known_version.as_deref()).await {
                Ok(RosterFetch::Unchanged) => debug!(jid = %self.uid(), "Using cached roster"),
                Ok(RosterFetch::Full { version, items }) => {
                    self.apply_roster(items, version)?;
                }
                Err(e) => {
                    error!(jid = %self.uid(), error = %e, "Roster request failed");
                    return Err(e.into());
                }
            }
            session.set_as(ROSTER_LOADED_KEY, &true)?;
        }

        self.enable_carbons();
        self.broadcast_presence()?;
        Ok(())
    }

    fn enable_carbons(&self) {
        let enable = crate::stanza::iq("set").child(crate::stanza::Element::with_ns("enable", crate::namespace::CARBONS));
        if let Err(e) = self.inner.slot.send(enable) {
            debug!(error = %e, "Could not enable message carbons");
        }
    }

    /// Send the target presence and record it as current.
    pub fn broadcast_presence(&self) -> Result<(), SessionError> {
        let presence = &self.inner.shared.presence;
        let target = presence.target();
        self.inner
            .slot
            .broadcast_presence(target, self.inner.shared.capabilities.caps_element())?;
        presence.set_current(target);
        Ok(())
    }

    /// Persist the transport's session token so the account can be restored.
    pub fn save_session(&self) {
        let Some(token) = self.inner.slot.transport().and_then(|t| t.session_token()) else {
            return;
        };
        let url = self.inner.params.lock().url().to_string();
        let record = SessionRecord {
            url,
            jid: self.uid().to_string(),
            sid: token.sid,
            rid: token.rid,
        };
        if let Err(e) = self.inner.storage.set_as(SESSION_KEY, &record) {
            warn!(jid = %self.uid(), error = %e, "Failed to persist session token");
        }
    }

    /// Connect parameters for the next attempt: the latest token when the
    /// account was attached, otherwise the original login.
    fn refresh_params(&self) {
        let token = self.inner.slot.transport().and_then(|t| t.session_token());
        let mut params = self.inner.params.lock();
        if let (ConnectParams::Attach { sid, rid, .. }, Some(token)) = (&mut *params, token) {
            *sid = token.sid;
            *rid = token.rid;
        }
    }

    async fn handle_session_loss(&self, condition: Option<String>) {
        if self.is_destroyed() {
            return;
        }
        let config = &self.inner.shared.config;
        let target = self.inner.shared.presence.target();
        warn!(jid = %self.uid(), condition = ?condition, policy = ?config.session_loss, target = %target, "Session lost");

        if config.session_loss == SessionLossPolicy::Remove || target.is_offline() {
            self.destroy();
            return;
        }

        let _connecting = self.inner.connect_lock.lock().await;
        if self.status().is_established() || self.is_destroyed() {
            return;
        }
        self.save_session();
        self.refresh_params();
        self.inner.slot.go_buffering();

        let mut attempt: u32 = 0;
        loop {
            if config.max_reconnect_attempts != 0 && attempt >= config.max_reconnect_attempts {
                error!(jid = %self.uid(), attempts = attempt, "Giving up reconnect");
                break;
            }
            let delay = config.reconnect_delay(attempt);
            attempt += 1;
            info!(jid = %self.uid(), attempt, delay_ms = delay.as_millis() as u64, "Reconnecting");
            tokio::time::sleep(delay).await;

            if self.is_destroyed() {
                return;
            }
            if self.inner.shared.presence.target().is_offline() {
                info!(jid = %self.uid(), "Target presence is offline, giving up reconnect");
                break;
            }
            match self.connect_locked().await {
                Ok(()) => return,
                Err(SessionError::Authentication(e)) => {
                    error!(jid = %self.uid(), error = %e, "Reconnect rejected");
                    break;
                }
                Err(e) => warn!(jid = %self.uid(), attempt, error = %e, "Reconnect failed"),
            }
        }
        self.destroy();
    }

    /// Remove every contact, close the connection and clear persisted state.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(jid = %self.uid(), "Destroying account");

        if let Some(id) = self.inner.status_hook.lock().take() {
            self.inner.machine.on_change().unsubscribe(id);
        }
        if let Some(id) = self.inner.contacts_hook.lock().take() {
            self.inner.storage.remove_hook(CONTACTS_KEY, id);
        }

        let contacts: Vec<Arc<Contact>> = self.inner.contacts.lock().drain().map(|(_, c)| c).collect();
        for contact in contacts {
            if let Err(e) = contact.delete() {
                warn!(jid = %contact.id(), error = %e, "Failed to delete stored contact");
            }
            self.inner.hooks.contact_removed.emit(&contact);
        }

        self.inner.handlers.lock().clear();
        self.inner.slot.close();
        self.inner.ingest.lock().take();
        self.inner.machine.transition(ConnectionStatus::Disconnected, Some("account removed".to_string()));

        for scope in [self.inner.storage.clone(), self.session_storage()] {
            if let Err(e) = scope.clear() {
                warn!(jid = %self.uid(), scope = scope.prefix(), error = %e, "Failed to clear storage");
            }
        }
        self.inner.hooks.removed.emit(&self.inner.uid);
    }

    // Messages

    /// Queue a parsed inbound message for the after-receive pipe. Processing keeps
    /// arrival order.
    pub(crate) fn enqueue_incoming(&self, incoming: IncomingMessage) {
        let mut ingest = self.inner.ingest.lock();
        let sender = ingest.get_or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(run_ingest(self.downgrade(), rx));
            tx
        });
        if sender.send(incoming).is_err() {
            warn!(jid = %self.uid(), "Message worker stopped, dropping message");
        }
    }

    /// Run the pre-send pipe, transmit and record the message.
    pub async fn send_message(&self, message: Message) -> Result<Message, SessionError> {
        self.ensure_alive()?;
        let stanza = message_stanza(&message);
        let outgoing = self.inner.shared.pipes.pre_send.run(OutgoingMessage { message, stanza }).await?;
        self.inner.slot.send(outgoing.stanza)?;

        match self.contact(outgoing.message.peer()) {
            Some(contact) => contact.transcript().push(outgoing.message.clone())?,
            None => debug!(to = %outgoing.message.peer(), "Sent message to address without contact"),
        }
        Ok(outgoing.message)
    }

    /// Plain text message to a contact, addressed to its current resource.
    pub async fn send_chat(&self, to: &Jid, text: &str) -> Result<Message, SessionError> {
        let peer = self.contact(to).map(|c| c.delivery_jid()).unwrap_or_else(|| to.clone());
        let message = Message::builder(peer, crate::message::Direction::Out, text).build();
        self.send_message(message).await
    }

    // Roster management

    pub async fn add_contact(&self, jid: &Jid, alias: Option<&str>) -> Result<(), SessionError> {
        self.ensure_alive()?;
        self.inner.slot.add_contact(jid, alias).await?;
        Ok(())
    }

    pub async fn remove_contact(&self, jid: &Jid) -> Result<(), SessionError> {
        self.ensure_alive()?;
        let persistent = self.contact(jid).is_some_and(|c| c.is_persistent());
        if persistent {
            self.inner.slot.remove_contact(jid).await?;
        }
        if self.remove_contact_local(&jid.bare()).is_some() && persistent {
            self.persist_contact_list()?;
        }
        Ok(())
    }

    pub async fn set_display_name(&self, jid: &Jid, name: &str) -> Result<(), SessionError> {
        self.ensure_alive()?;
        let Some(contact) = self.contact(jid) else {
            return Err(crate::error::InvalidParameterError::new(format!("unknown contact {}", jid)).into());
        };
        if contact.is_persistent() {
            self.inner.slot.set_display_name(jid, name).await?;
        }
        contact.set_name(name);
        contact.save()?;
        Ok(())
    }

    pub fn send_subscription_answer(&self, jid: &Jid, accept: bool) -> Result<(), SessionError> {
        self.ensure_alive()?;
        self.inner.slot.send_subscription_answer(jid, accept)?;
        Ok(())
    }

    // Rooms

    /// Join `room@service/nick`; the room becomes an ephemeral groupchat contact.
    pub fn join_room(&self, full_jid: &Jid, password: Option<&str>) -> Result<Arc<Contact>, SessionError> {
        self.ensure_alive()?;
        if full_jid.resource().is_none() {
            return Err(crate::error::InvalidParameterError::new("room address needs a nickname").into());
        }
        let contact = self.add_ephemeral_contact(full_jid, ContactKind::Groupchat);
        self.inner.slot.join_room(full_jid, password)?;
        Ok(contact)
    }

    pub fn leave_room(&self, full_jid: &Jid, exit_message: Option<&str>) -> Result<(), SessionError> {
        self.ensure_alive()?;
        self.inner.slot.leave_room(full_jid, exit_message)?;
        self.remove_contact_local(&full_jid.bare());
        Ok(())
    }
}

impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Account")
            .field("uid", &self.inner.uid)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

async fn run_ingest(account: WeakAccount, mut rx: mpsc::UnboundedReceiver<IncomingMessage>) {
    while let Some(incoming) = rx.recv().await {
        let Some(pipes) = account.upgrade().map(|a| a.inner.shared.pipes.clone()) else {
            break;
        };
        let processed = match pipes.after_receive.run(incoming).await {
            Ok(processed) => processed,
            Err(e) => {
                warn!(error = %e, "Inbound message dropped");
                continue;
            }
        };
        let Some(account) = account.upgrade() else {
            break;
        };
        if account.is_destroyed() {
            break;
        }
        let IncomingMessage { contact, message, .. } = processed;
        if let Err(e) = contact.transcript().push(message.clone()) {
            warn!(uid = message.uid(), error = %e, "Failed to store inbound message");
            continue;
        }
        account.hooks().message_received.emit(&ReceivedMessage { contact, message });
    }
    debug!("Message worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace as ns;
    use crate::stanza::{iq, message, presence, Element};
    use crate::storage::MemoryStorage;
    use crate::error::RequestError;
    use crate::registry::{HandlerFilter, HandlerOutcome};
    use crate::transport::mock::{MockFactory, Script};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    const URL: &str = "https://example.com/http-bind";

    fn roster_script() -> Script {
        Script {
            respond: true,
            roster: vec![
                ("bob@example.com".to_string(), Some("Bob".to_string()), "both".to_string()),
                ("carol@example.com".to_string(), None, "to".to_string()),
            ],
            roster_version: Some("v1".to_string()),
            ..Script::default()
        }
    }

    fn fixture(script: Script, config: SessionConfig) -> (Arc<MockFactory>, Shared) {
        let factory = Arc::new(MockFactory::new(script));
        let shared = Shared {
            backend: Arc::new(MemoryStorage::new()),
            presence: Arc::new(PresenceController::new()),
            config,
            factory: factory.clone(),
            pipes: Arc::new(Pipes::new()),
            capabilities: Arc::new(Capabilities::new("https://fluux.io")),
        };
        (factory, shared)
    }

    fn login() -> ConnectParams {
        ConnectParams::login(URL, "alice@example.com", "secret").unwrap()
    }

    fn jid(raw: &str) -> Jid {
        Jid::parse(raw).unwrap()
    }

    async fn connected(script: Script) -> (Arc<MockFactory>, Shared, Account) {
        let (factory, shared) = fixture(script, SessionConfig::default());
        let account = Account::new(login(), shared.clone()).unwrap();
        account.connect().await.unwrap();
        (factory, shared, account)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    fn collect<T: Clone + Send + Sync + 'static>(hook: &Hook<T>) -> Arc<Mutex<Vec<T>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        hook.subscribe(move |event: &T| sink.lock().push(event.clone()));
        events
    }

    #[tokio::test]
    async fn test_login_fetches_roster_and_announces_contacts() {
        let (factory, shared) = fixture(roster_script(), SessionConfig::default());
        let account = Account::new(login(), shared.clone()).unwrap();
        let added = collect(&account.hooks().contact_added);

        account.connect().await.unwrap();
        assert_eq!(account.status(), ConnectionStatus::Connected);

        let mut ids: Vec<String> = added.lock().iter().map(|c| c.id().to_string()).collect();
        ids.sort();
        assert_eq!(ids, vec!["bob@example.com", "carol@example.com"]);
        assert_eq!(account.contact(&jid("bob@example.com")).unwrap().name(), "Bob");
        assert_eq!(account.contact(&jid("carol@example.com")).unwrap().name(), "carol@example.com");
        assert_eq!(account.storage().get_string(ROSTER_VERSION_KEY).as_deref(), Some("v1"));
        assert!(account.session_storage().get_bool(ROSTER_LOADED_KEY));

        let transport = factory.last().unwrap();
        assert_eq!(transport.roster_requests(), 1);
        let presences = transport.sent_named("presence");
        assert_eq!(presences.len(), 1);
        assert!(presences[0].has_child("c", Some(ns::CAPS)));
        assert_eq!(shared.presence.current(), Presence::Online);
    }

    #[tokio::test]
    async fn test_attach_with_loaded_roster_skips_fetch() {
        let (factory, shared) = fixture(roster_script(), SessionConfig::default());
        ScopedStorage::session(shared.backend.clone(), "alice@example.com", "abc")
            .set_as(ROSTER_LOADED_KEY, &true)
            .unwrap();

        let params = ConnectParams::attach(URL, "alice@example.com/web", "abc", 42).unwrap();
        let account = Account::new(params, shared.clone()).unwrap();
        account.connect().await.unwrap();

        assert_eq!(account.status(), ConnectionStatus::Attached);
        assert_eq!(account.session_id(), "abc");
        assert_eq!(factory.last().unwrap().roster_requests(), 0);

        let record = SessionRecord::load(&shared.backend, "alice@example.com").unwrap();
        assert_eq!(record.sid, "abc");
        assert_eq!(record.rid, 42);
    }

    #[tokio::test]
    async fn test_unchanged_roster_keeps_contacts_quiet() {
        let (_, shared, first) = connected(roster_script()).await;
        first.connection().close();
        drop(first);

        let second = Account::new(login(), shared.clone()).unwrap();
        assert_eq!(second.contacts().len(), 2);
        let added = collect(&second.hooks().contact_added);
        let removed = collect(&second.hooks().contact_removed);

        second.connect().await.unwrap();
        assert!(added.lock().is_empty());
        assert!(removed.lock().is_empty());
        assert_eq!(second.contacts().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_roster_sync_rolls_back_and_retries() {
        let script = Script {
            respond: false,
            ..roster_script()
        };
        let (factory, shared) = fixture(script, SessionConfig::default());
        let account = Account::new(login(), shared).unwrap();
        let lost = collect(&account.hooks().connection_status);
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        account
            .connection()
            .register_handler(HandlerFilter::new().name("message").stanza_type("headline"), move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(HandlerOutcome::Preserve)
            })
            .unwrap();

        let err = account.connect().await.unwrap_err();
        assert!(matches!(err, SessionError::Request(RequestError::Timeout(_))));
        assert_eq!(account.status(), ConnectionStatus::ConnectionFailed);
        assert!(!account.connection().is_live());
        assert!(!account.session_storage().get_bool(ROSTER_LOADED_KEY));
        assert!(!lost.lock().iter().any(|c| c.to == ConnectionStatus::Disconnected));

        factory.script.lock().respond = true;
        account.connect().await.unwrap();
        assert_eq!(account.status(), ConnectionStatus::Connected);
        assert!(account.connection().is_live());
        assert!(account.session_storage().get_bool(ROSTER_LOADED_KEY));
        assert_eq!(account.contacts().len(), 2);
        assert_eq!(factory.creations(), 2);

        let transport = factory.last().unwrap();
        assert_eq!(transport.roster_requests(), 1);
        transport.deliver(message().attr("type", "headline").attr("from", "example.com"));
        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_queued_before_failed_login_times_out() {
        let script = Script {
            fail_auth: true,
            ..roster_script()
        };
        let config = SessionConfig {
            request_timeout: Duration::from_secs(5),
            ..SessionConfig::default()
        };
        let (_, shared) = fixture(script, config);
        let account = Account::new(login(), shared).unwrap();
        let pending = account.connection().send_request(iq("get").attr("id", "early")).unwrap();

        let err = account.connect().await.unwrap_err();
        assert!(matches!(err, SessionError::Authentication(_)));

        let err = pending.wait().await.unwrap_err();
        assert!(matches!(err, RequestError::Timeout(ref e) if e.id == "early" && e.timeout == Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn test_login_failure_reports_authentication() {
        let script = Script {
            fail_auth: true,
            ..roster_script()
        };
        let (_, shared) = fixture(script, SessionConfig::default());
        let account = Account::new(login(), shared).unwrap();

        let err = account.connect().await.unwrap_err();
        assert!(matches!(err, SessionError::Authentication(_)));
        assert_eq!(account.status(), ConnectionStatus::AuthenticationFailed);
    }

    #[tokio::test]
    async fn test_roster_push_adds_and_removes() {
        let (factory, _, account) = connected(roster_script()).await;
        let transport = factory.last().unwrap();
        let removed = collect(&account.hooks().contact_removed);

        transport.deliver(
            iq("set").attr("id", "push1").child(
                Element::with_ns("query", ns::ROSTER)
                    .attr("ver", "v2")
                    .child(Element::new("item").attr("jid", "dave@example.com").attr("subscription", "none")),
            ),
        );
        transport.deliver(
            iq("set").attr("id", "push2").child(
                Element::with_ns("query", ns::ROSTER)
                    .attr("ver", "v3")
                    .child(Element::new("item").attr("jid", "bob@example.com").attr("subscription", "remove")),
            ),
        );
        settle().await;

        assert!(account.contact(&jid("dave@example.com")).is_some());
        assert!(account.contact(&jid("bob@example.com")).is_none());
        assert_eq!(removed.lock().len(), 1);
        assert!(account.storage().get("contact:bob@example.com").is_none());

        let listed: Vec<String> = account.storage().get_as(CONTACTS_KEY).unwrap();
        assert_eq!(listed, vec!["carol@example.com", "dave@example.com"]);
        assert_eq!(account.storage().get_string(ROSTER_VERSION_KEY).as_deref(), Some("v3"));

        let acked = transport
            .sent()
            .iter()
            .filter(|e| e.get_attr("type") == Some("result"))
            .filter_map(|e| e.get_attr("id").map(str::to_string))
            .collect::<Vec<_>>();
        assert_eq!(acked, vec!["push1", "push2"]);
    }

    #[tokio::test]
    async fn test_contact_list_rewritten_elsewhere() {
        let (_, _, account) = connected(roster_script()).await;
        let removed = collect(&account.hooks().contact_removed);

        account.storage().set_as(CONTACTS_KEY, &vec!["bob@example.com"]).unwrap();
        assert!(account.contact(&jid("carol@example.com")).is_none());
        assert_eq!(removed.lock()[0].id(), "carol@example.com");
    }

    #[tokio::test]
    async fn test_presence_and_subscription_requests() {
        let (factory, _, account) = connected(roster_script()).await;
        let transport = factory.last().unwrap();
        let changes = collect(&account.hooks().presence_changed);
        let requests = collect(&account.hooks().subscription_request);

        transport.deliver(
            presence()
                .attr("from", "bob@example.com/phone")
                .child(Element::new("show").text("away")),
        );
        transport.deliver(presence().attr("from", "eve@example.com").attr("type", "subscribe"));
        transport.deliver(presence().attr("from", "bob@example.com").attr("type", "subscribe"));
        settle().await;

        let changes = changes.lock();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].presence, Presence::Away);
        assert_eq!(changes[0].previous, Presence::Offline);
        assert_eq!(requests.lock().clone(), vec![jid("eve@example.com")]);

        let approvals = transport
            .sent_named("presence")
            .into_iter()
            .filter(|p| p.get_attr("type") == Some("subscribed"))
            .count();
        assert_eq!(approvals, 1);
    }

    #[tokio::test]
    async fn test_inbound_message_goes_through_pipe_to_transcript() {
        let (factory, shared, account) = connected(roster_script()).await;
        shared.pipes.after_receive.add_processor("drop-spam", 0, |incoming: IncomingMessage| async move {
            if incoming.message.plaintext().contains("spam") {
                anyhow::bail!("spam");
            }
            anyhow::Ok(incoming)
        });
        let received = collect(&account.hooks().message_received);
        let transport = factory.last().unwrap();

        transport.deliver(
            message()
                .attr("from", "bob@example.com/phone")
                .attr("type", "chat")
                .attr("id", "m1")
                .child(Element::new("body").text("hi")),
        );
        transport.deliver(
            message()
                .attr("from", "bob@example.com/phone")
                .attr("id", "m2")
                .child(Element::new("body").text("buy spam")),
        );
        transport.deliver(
            message()
                .attr("from", "bob@example.com/phone")
                .attr("id", "m3")
                .child(Element::new("body").text("bye")),
        );
        settle().await;

        let received: Vec<String> = received.lock().iter().map(|r| r.message.plaintext().to_string()).collect();
        assert_eq!(received, vec!["hi", "bye"]);

        let bob = account.contact(&jid("bob@example.com")).unwrap();
        assert_eq!(bob.resource().as_deref(), Some("phone"));
        assert_eq!(bob.transcript().unread_count(), 2);
        assert_eq!(bob.transcript().first_message().unwrap().plaintext(), "bye");
    }

    #[tokio::test]
    async fn test_send_message_runs_pre_send_and_records() {
        let (factory, shared, account) = connected(roster_script()).await;
        shared.pipes.pre_send.add_processor("tag", 0, |mut outgoing: OutgoingMessage| async move {
            outgoing.stanza.set_attr("xml:lang", "en");
            anyhow::Ok(outgoing)
        });

        let sent = account.send_chat(&jid("bob@example.com"), "hello").await.unwrap();
        assert_eq!(sent.plaintext(), "hello");

        let transport = factory.last().unwrap();
        let messages = transport.sent_named("message");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].get_attr("xml:lang"), Some("en"));
        assert_eq!(messages[0].child_text("body").as_deref(), Some("hello"));

        let bob = account.contact(&jid("bob@example.com")).unwrap();
        let stored = bob.transcript().first_message().unwrap();
        assert_eq!(stored.uid(), sent.uid());
        assert_eq!(bob.transcript().unread_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loss_with_offline_target_destroys() {
        let (factory, shared, account) = connected(roster_script()).await;
        let removed = collect(&account.hooks().removed);

        shared.presence.set_target(Presence::Offline);
        factory.last().unwrap().drop_connection();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert!(account.is_destroyed());
        assert_eq!(factory.creations(), 1);
        assert_eq!(removed.lock().clone(), vec!["alice@example.com".to_string()]);
        assert!(shared.backend.keys_with_prefix("alice@example.com").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_policy_destroys_on_loss() {
        let config = SessionConfig {
            session_loss: SessionLossPolicy::Remove,
            ..SessionConfig::default()
        };
        let (factory, shared) = fixture(roster_script(), config);
        let account = Account::new(login(), shared).unwrap();
        account.connect().await.unwrap();

        factory.last().unwrap().drop_connection();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(account.is_destroyed());
        assert_eq!(factory.creations(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_after_loss_keeps_handlers() {
        let (factory, _, account) = connected(roster_script()).await;
        let statuses = collect(&account.hooks().connection_status);
        let first_session = account.session_id();

        factory.last().unwrap().drop_connection();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(factory.creations(), 2);
        assert_eq!(account.status(), ConnectionStatus::Connected);
        assert_ne!(account.session_id(), first_session);
        assert!(statuses.lock().iter().any(|c| c.to == ConnectionStatus::Disconnected));

        let transport = factory.last().unwrap();
        transport.deliver(
            iq("get")
                .attr("id", "ping1")
                .attr("from", "example.com")
                .child(Element::with_ns("ping", ns::PING)),
        );
        settle().await;
        assert!(transport
            .sent()
            .iter()
            .any(|e| e.get_attr("id") == Some("ping1") && e.get_attr("type") == Some("result")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_gives_up_after_attempts() {
        let config = SessionConfig {
            max_reconnect_attempts: 2,
            ..SessionConfig::default()
        };
        let (factory, shared) = fixture(roster_script(), config);
        let account = Account::new(login(), shared).unwrap();
        account.connect().await.unwrap();

        factory.script.lock().fail_connection = true;
        factory.last().unwrap().drop_connection();
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(factory.creations(), 3);
        assert!(account.is_destroyed());
    }

    #[tokio::test]
    async fn test_destroy_clears_state() {
        let (_, shared, account) = connected(roster_script()).await;
        let removed = collect(&account.hooks().contact_removed);

        account.destroy();
        assert_eq!(removed.lock().len(), 2);
        assert!(account.contacts().is_empty());
        assert!(shared.backend.keys_with_prefix("alice@example.com").is_empty());
        assert!(matches!(account.connect().await, Err(SessionError::AccountDestroyed(_))));
    }

    #[tokio::test]
    async fn test_join_room_adds_ephemeral_contact() {
        let (factory, _, account) = connected(roster_script()).await;
        let room = account.join_room(&jid("lobby@rooms.example.com/alice"), None).unwrap();
        assert_eq!(room.kind(), ContactKind::Groupchat);
        assert!(!room.is_persistent());
        assert!(account.join_room(&jid("lobby@rooms.example.com"), None).is_err());

        let listed: Vec<String> = account.storage().get_as(CONTACTS_KEY).unwrap();
        assert!(!listed.contains(&"lobby@rooms.example.com".to_string()));

        account.leave_room(&jid("lobby@rooms.example.com/alice"), Some("bye")).unwrap();
        assert!(account.contact(&jid("lobby@rooms.example.com")).is_none());
        assert_eq!(factory.last().unwrap().sent_named("presence").len(), 3);
    }
}
