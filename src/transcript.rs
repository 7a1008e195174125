//! Per-contact message history.
//!
//! Messages live in the account store under `message:<uid>`. A transcript only
//! keeps its head (`transcript:<id>:first`) and unread list
//! (`transcript:<id>:unread`); each message links to the next older one.

use std::collections::HashSet;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::TranscriptError;
use crate::message::{Direction, Message};
use crate::storage::ScopedStorage;

fn message_key(uid: &str) -> String {
    format!("message:{}", uid)
}

pub struct Transcript {
    storage: ScopedStorage,
    first_key: String,
    unread_key: String,
    // Serializes read-modify-write sequences on the head and unread list.
    write: Mutex<()>,
}

impl Transcript {
    pub fn new(storage: ScopedStorage, contact_id: &str) -> Self {
        Self {
            storage,
            first_key: format!("transcript:{}:first", contact_id),
            unread_key: format!("transcript:{}:unread", contact_id),
            write: Mutex::new(()),
        }
    }

    pub fn get(&self, uid: &str) -> Option<Message> {
        self.storage.get_as(&message_key(uid))
    }

    fn head(&self) -> Option<String> {
        self.storage.get_string(&self.first_key)
    }

    pub fn unread_ids(&self) -> Vec<String> {
        self.storage.get_as(&self.unread_key).unwrap_or_default()
    }

    pub fn unread_count(&self) -> usize {
        self.unread_ids().len()
    }

    /// Prepend `message`. Inbound messages are recorded as unread.
    pub fn push(&self, mut message: Message) -> Result<(), TranscriptError> {
        let _write = self.write.lock();
        if self.get(message.uid()).is_some() {
            return Err(TranscriptError::DuplicateMessage(message.uid().to_string()));
        }

        message.set_next(self.head());
        self.storage.set_as(&message_key(message.uid()), &message)?;
        self.storage.set_as(&self.first_key, &message.uid())?;

        if message.direction() == Direction::In {
            let mut unread = self.unread_ids();
            unread.push(message.uid().to_string());
            self.storage.set_as(&self.unread_key, &unread)?;
        }
        Ok(())
    }

    /// Newest message.
    pub fn first_message(&self) -> Option<Message> {
        self.get(&self.head()?)
    }

    /// Oldest reachable message.
    pub fn last_message(&self) -> Option<Message> {
        self.messages().pop()
    }

    /// Walk the chain from the head, newest first. Stops at the first id that no
    /// longer resolves.
    pub fn messages(&self) -> Vec<Message> {
        let mut messages = Vec::new();
        let mut seen = HashSet::new();
        let mut cursor = self.head();
        while let Some(uid) = cursor {
            if !seen.insert(uid.clone()) {
                warn!(uid = %uid, "Transcript chain loops back, stopping");
                break;
            }
            let Some(message) = self.get(&uid) else {
                debug!(uid = %uid, "Transcript chain ends at a missing message");
                break;
            };
            cursor = message.next().map(str::to_string);
            messages.push(message);
        }
        messages
    }

    /// Store changed flags of a message that is already part of the transcript.
    pub fn update(&self, message: &Message) -> Result<(), TranscriptError> {
        let _write = self.write.lock();
        let Some(stored) = self.get(message.uid()) else {
            return Err(TranscriptError::UnknownMessage(message.uid().to_string()));
        };
        let mut updated = message.clone();
        // The chain link is owned by the transcript.
        updated.set_next(stored.next().map(str::to_string));
        self.storage.set_as(&message_key(message.uid()), &updated)?;
        Ok(())
    }

    pub fn mark_all_read(&self) -> Result<(), TranscriptError> {
        let _write = self.write.lock();
        for uid in self.unread_ids() {
            let Some(mut message) = self.get(&uid) else {
                debug!(uid = %uid, "Unread message no longer stored");
                continue;
            };
            message.mark_read();
            self.storage.set_as(&message_key(&uid), &message)?;
        }
        self.storage.remove(&self.unread_key)?;
        Ok(())
    }

    /// Unlink `uid` from the chain, then remove it.
    pub fn delete(&self, uid: &str) -> Result<(), TranscriptError> {
        let _write = self.write.lock();
        let Some(message) = self.get(uid) else {
            return Err(TranscriptError::UnknownMessage(uid.to_string()));
        };
        let successor = message.next().map(str::to_string);

        if self.head().as_deref() == Some(uid) {
            match &successor {
                Some(next) => self.storage.set_as(&self.first_key, next)?,
                None => self.storage.remove(&self.first_key)?,
            }
        } else {
            let predecessor = self
                .messages()
                .into_iter()
                .find(|m| m.next() == Some(uid))
                .ok_or_else(|| TranscriptError::UnknownMessage(uid.to_string()))?;
            let mut predecessor = predecessor;
            predecessor.set_next(successor);
            self.storage.set_as(&message_key(predecessor.uid()), &predecessor)?;
        }

        let mut unread = self.unread_ids();
        if let Some(position) = unread.iter().position(|u| u == uid) {
            unread.remove(position);
            self.storage.set_as(&self.unread_key, &unread)?;
        }
        self.storage.remove(&message_key(uid))?;
        Ok(())
    }

    /// Remove every message and the transcript's own keys.
    pub fn clear(&self) -> Result<(), TranscriptError> {
        let _write = self.write.lock();
        for message in self.messages() {
            self.storage.remove(&message_key(message.uid()))?;
        }
        self.storage.remove(&self.first_key)?;
        self.storage.remove(&self.unread_key)?;
        Ok(())
    }
}
