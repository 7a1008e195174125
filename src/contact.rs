use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{StorageError, TranscriptError};
use crate::jid::Jid;
use crate::presence::Presence;
use crate::roster::{RosterItem, Subscription};
use crate::storage::ScopedStorage;
use crate::transcript::Transcript;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContactKind {
    #[default]
    Chat,
    Groupchat,
}

/// The persisted part of a contact, stored under `contact:<id>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactData {
    pub jid: Jid,
    pub name: String,
    #[serde(default)]
    pub subscription: Subscription,
    #[serde(default)]
    pub kind: ContactKind,
    /// Roster-backed. Ephemeral contacts are dropped before each roster sync.
    #[serde(default)]
    pub persistent: bool,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub resource: Option<String>,
}

impl ContactData {
    pub fn from_item(item: &RosterItem) -> Self {
        Self {
            jid: item.jid.to_bare(),
            name: item.name.clone(),
            subscription: item.subscription,
            kind: ContactKind::Chat,
            persistent: true,
            status: None,
            resource: None,
        }
    }

    /// A contact that is not on the roster, e.g. a room or a stranger.
    pub fn ephemeral(jid: &Jid, kind: ContactKind) -> Self {
        Self {
            jid: jid.to_bare(),
            name: jid.bare(),
            subscription: Subscription::None,
            kind,
            persistent: false,
            status: None,
            resource: None,
        }
    }
}

pub(crate) fn contact_key(id: &str) -> String {
    format!("contact:{}", id)
}

struct ContactState {
    data: ContactData,
    presences: HashMap<String, Presence>,
}

/// One entry of an account's contact map, keyed by bare address.
pub struct Contact {
    id: String,
    storage: ScopedStorage,
    transcript: Transcript,
    state: Mutex<ContactState>,
}

impl Contact {
    pub fn new(storage: ScopedStorage, data: ContactData) -> Self {
        let id = data.jid.bare();
        Self {
            transcript: Transcript::new(storage.clone(), &id),
            storage,
            state: Mutex::new(ContactState {
                data,
                presences: HashMap::new(),
            }),
            id,
        }
    }

    /// Restore a contact saved with [`save`](Self::save).
    pub fn load(storage: ScopedStorage, id: &str) -> Option<Self> {
        let data: ContactData = storage.get_as(&contact_key(id))?;
        Some(Self::new(storage, data))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn jid(&self) -> Jid {
        self.state.lock().data.jid.clone()
    }

    pub fn data(&self) -> ContactData {
        self.state.lock().data.clone()
    }

    pub fn name(&self) -> String {
        self.state.lock().data.name.clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        self.state.lock().data.name = name.into();
    }

    pub fn subscription(&self) -> Subscription {
        self.state.lock().data.subscription
    }

    pub fn kind(&self) -> ContactKind {
        self.state.lock().data.kind
    }

    pub fn is_persistent(&self) -> bool {
        self.state.lock().data.persistent
    }

    /// Apply a roster entry. Returns whether anything changed.
    pub fn apply_item(&self, item: &RosterItem) -> bool {
        let mut state = self.state.lock();
        let changed = state.data.name != item.name
            || state.data.subscription != item.subscription
            || !state.data.persistent;
        state.data.name = item.name.clone();
        state.data.subscription = item.subscription;
        state.data.persistent = true;
        changed
    }

    /// Best presence across all resources; offline when none is available.
    pub fn presence(&self) -> Presence {
        self.state
            .lock()
            .presences
            .values()
            .copied()
            .min()
            .unwrap_or(Presence::Offline)
    }

    pub fn resource_presence(&self, resource: &str) -> Presence {
        self.state
            .lock()
            .presences
            .get(resource)
            .copied()
            .unwrap_or(Presence::Offline)
    }

    /// Record the presence of one resource. Returns the aggregate (new, old).
    pub fn set_presence(&self, resource: Option<&str>, presence: Presence) -> (Presence, Presence) {
        let mut state = self.state.lock();
        let aggregate = |presences: &HashMap<String, Presence>| {
            presences.values().copied().min().unwrap_or(Presence::Offline)
        };
        let old = aggregate(&state.presences);
        let resource = resource.unwrap_or_default().to_string();
        if presence.is_offline() {
            state.presences.remove(&resource);
        } else {
            state.presences.insert(resource, presence);
        }
        (aggregate(&state.presences), old)
    }

    pub fn status(&self) -> Option<String> {
        self.state.lock().data.status.clone()
    }

    pub fn set_status(&self, status: Option<String>) {
        self.state.lock().data.status = status;
    }

    /// Resource that directed messages go to.
    pub fn resource(&self) -> Option<String> {
        self.state.lock().data.resource.clone()
    }

    pub fn set_resource(&self, resource: Option<String>) {
        self.state.lock().data.resource = resource;
    }

    /// Full address when a resource is known, bare otherwise.
    pub fn delivery_jid(&self) -> Jid {
        let state = self.state.lock();
        match &state.data.resource {
            Some(resource) => state.data.jid.with_resource(resource.clone()),
            None => state.data.jid.clone(),
        }
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn save(&self) -> Result<(), StorageError> {
        let data = self.data();
        self.storage.set_as(&contact_key(&self.id), &data)
    }

    /// Remove the stored contact and its transcript.
    pub fn delete(&self) -> Result<(), TranscriptError> {
        self.transcript.clear()?;
        self.storage.remove(&contact_key(&self.id))?;
        Ok(())
    }
}

impl std::fmt::Debug for Contact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Contact")
            .field("id", &self.id)
            .field("presence", &self.presence())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Direction, Message};
    use crate::storage::MemoryStorage;
    use std::sync::Arc;

    fn storage() -> ScopedStorage {
        ScopedStorage::account(Arc::new(MemoryStorage::new()), "alice@example.com")
    }

    fn bob(storage: ScopedStorage) -> Contact {
        let jid = Jid::parse("bob@example.com").unwrap();
        Contact::new(storage, ContactData::ephemeral(&jid, ContactKind::Chat))
    }

    #[test]
    fn test_presence_aggregates_best_resource() {
        let contact = bob(storage());
        assert_eq!(contact.presence(), Presence::Offline);

        assert_eq!(contact.set_presence(Some("phone"), Presence::Away), (Presence::Away, Presence::Offline));
        assert_eq!(contact.set_presence(Some("laptop"), Presence::Online), (Presence::Online, Presence::Away));
        assert_eq!(contact.set_presence(Some("laptop"), Presence::Offline), (Presence::Away, Presence::Online));
        assert_eq!(contact.resource_presence("phone"), Presence::Away);
    }

    #[test]
    fn test_delivery_jid_uses_resource() {
        let contact = bob(storage());
        assert_eq!(contact.delivery_jid().full(), "bob@example.com");
        contact.set_resource(Some("phone".to_string()));
        assert_eq!(contact.delivery_jid().full(), "bob@example.com/phone");
    }

    #[test]
    fn test_save_load_and_delete() {
        let storage = storage();
        let contact = bob(storage.clone());
        contact.set_name("Bobby");
        contact.save().unwrap();
        let peer = Jid::parse("bob@example.com").unwrap();
        contact
            .transcript()
            .push(Message::builder(peer, Direction::In, "hi").uid("m1").build())
            .unwrap();

        let loaded = Contact::load(storage.clone(), "bob@example.com").unwrap();
        assert_eq!(loaded.name(), "Bobby");
        assert!(!loaded.is_persistent());
        assert_eq!(loaded.transcript().first_message().unwrap().uid(), "m1");

        loaded.delete().unwrap();
        assert!(Contact::load(storage.clone(), "bob@example.com").is_none());
        assert!(storage.get("message:m1").is_none());
    }

    #[test]
    fn test_apply_item() {
        let contact = bob(storage());
        let item = RosterItem {
            jid: Jid::parse("bob@example.com").unwrap(),
            name: "Bob".to_string(),
            subscription: Subscription::Both,
            ask: false,
            groups: Vec::new(),
            removed: false,
        };
        assert!(contact.apply_item(&item));
        assert!(!contact.apply_item(&item));
        assert!(contact.is_persistent());
        assert_eq!(contact.subscription(), Subscription::Both);
    }
}
