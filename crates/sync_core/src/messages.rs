//! Working set of messages the sync core is currently mutating.
//!
//! Entries live only while someone holds a [`MessageLease`]. Holders wait for
//! their batched save before dropping the lease, so an evicted message is always
//! reloaded from a store copy that includes their edits.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

use shared::{domain::MessageId, model::Message};

use crate::{error::SyncResult, store::StoreGateway};

struct Resident {
    message: Message,
    holds: usize,
    epoch: u64,
}

#[derive(Default)]
struct Residents {
    entries: HashMap<MessageId, Resident>,
    next_epoch: u64,
}

impl Residents {
    fn admit(&mut self, message: Message) -> u64 {
        let epoch = self.next_epoch;
        self.next_epoch += 1;
        self.entries.insert(
            message.id,
            Resident {
                message,
                holds: 1,
                epoch,
            },
        );
        epoch
    }
}

pub struct MessageRegistry {
    store: StoreGateway,
    residents: Mutex<Residents>,
}

/// Keeps one message resident until dropped.
#[must_use = "dropping the lease releases the message"]
pub struct MessageLease<'a> {
    registry: &'a MessageRegistry,
    id: MessageId,
    epoch: u64,
    discard: bool,
}

impl MessageLease<'_> {
    /// Removes the entry outright, dropping edits no save has confirmed. Only
    /// the claim that created the entry can remove it.
    pub fn discard(mut self) {
        self.discard = true;
    }
}

impl Drop for MessageLease<'_> {
    fn drop(&mut self) {
        let mut residents = self.registry.lock();
        let Some(resident) = residents.entries.get_mut(&self.id) else {
            return;
        };
        if resident.epoch != self.epoch {
            return;
        }
        resident.holds = resident.holds.saturating_sub(1);
        if self.discard || resident.holds == 0 {
            residents.entries.remove(&self.id);
        }
    }
}

impl MessageRegistry {
    pub fn new(store: StoreGateway) -> Self {
        Self {
            store,
            residents: Mutex::new(Residents::default()),
        }
    }

    /// Holds the message, loading it from the store when not resident. `None`
    /// when the message exists neither in memory nor in the store.
    pub async fn acquire(&self, id: MessageId) -> SyncResult<Option<(Message, MessageLease<'_>)>> {
        if let Some(held) = self.hold_resident(id) {
            return Ok(Some(held));
        }
        let Some(loaded) = self.store.get_message(id).await? else {
            return Ok(None);
        };
        // A concurrent holder may have admitted a newer copy meanwhile.
        if let Some(held) = self.hold_resident(id) {
            return Ok(Some(held));
        }
        let epoch = self.lock().admit(loaded.clone());
        Ok(Some((loaded, self.lease(id, epoch))))
    }

    /// Admits a message that is not resident yet. Returns the resident copy
    /// when another holder got there first.
    pub fn claim(&self, message: Message) -> Result<MessageLease<'_>, Message> {
        let id = message.id;
        let mut residents = self.lock();
        if let Some(resident) = residents.entries.get(&id) {
            return Err(resident.message.clone());
        }
        let epoch = residents.admit(message);
        drop(residents);
        Ok(self.lease(id, epoch))
    }

    pub fn get(&self, id: MessageId) -> Option<Message> {
        self.lock().entries.get(&id).map(|r| r.message.clone())
    }

    /// Read-modify-write under the registry lock. `None` if the message is not
    /// resident.
    pub fn update<R>(&self, id: MessageId, f: impl FnOnce(&mut Message) -> R) -> Option<R> {
        self.lock().entries.get_mut(&id).map(|r| f(&mut r.message))
    }

    pub fn resident_count(&self) -> usize {
        self.lock().entries.len()
    }

    fn hold_resident(&self, id: MessageId) -> Option<(Message, MessageLease<'_>)> {
        let mut residents = self.lock();
        let resident = residents.entries.get_mut(&id)?;
        resident.holds += 1;
        let held = (resident.message.clone(), resident.epoch);
        drop(residents);
        Some((held.0, self.lease(id, held.1)))
    }

    fn lease(&self, id: MessageId, epoch: u64) -> MessageLease<'_> {
        MessageLease {
            registry: self,
            id,
            epoch,
            discard: false,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Residents> {
        self.residents
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
#[path = "tests/messages_tests.rs"]
mod tests;
