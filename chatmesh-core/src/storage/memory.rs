//! In-process message store.
//!
//! Used by tests and by clusters whose nodes share one process. Nodes that
//! share an `Arc<MemoryStore>` see the same rows, exactly like nodes that
//! share a networked database.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use uuid::Uuid;

use super::{validate_recipient, Backlog, MessageStore, StoreError};
use crate::protocol::Message;

#[derive(Debug, Default)]
pub struct MemoryStore {
    partitions: RwLock<HashMap<String, BTreeMap<Uuid, Message>>>,
    /// Simulated outage: writes fail while set.
    failing: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle simulated write failures.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Total rows across all partitions.
    pub fn total_messages(&self) -> usize {
        self.read_partitions().values().map(BTreeMap::len).sum()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".into()));
        }
        Ok(())
    }

    fn read_partitions(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, HashMap<String, BTreeMap<Uuid, Message>>> {
        self.partitions.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_partitions(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<String, BTreeMap<Uuid, Message>>> {
        self.partitions.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl MessageStore for MemoryStore {
    fn append(&self, message: &Message) -> Result<Uuid, StoreError> {
        self.check()?;
        validate_recipient(&message.recipient)?;

        let id = message.id.unwrap_or_else(Uuid::now_v7);
        let mut partitions = self.write_partitions();
        let partition = partitions.entry(message.recipient.clone()).or_default();
        partition.entry(id).or_insert_with(|| Message {
            id: Some(id),
            read: false,
            ..message.clone()
        });
        Ok(id)
    }

    fn mark_read(&self, recipient: &str, id: Uuid) -> Result<bool, StoreError> {
        self.check()?;
        let mut partitions = self.write_partitions();
        match partitions.get_mut(recipient).and_then(|p| p.get_mut(&id)) {
            Some(msg) if !msg.read => {
                msg.read = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn fetch_unread(&self, recipient: &str) -> Result<Option<Backlog<'_>>, StoreError> {
        self.check()?;
        let unread: Vec<Message> = self
            .read_partitions()
            .get(recipient)
            .map(|p| p.values().filter(|m| !m.read).cloned().collect())
            .unwrap_or_default();
        Ok(Some(Box::new(unread.into_iter().map(Ok))))
    }

    fn get(&self, recipient: &str, id: Uuid) -> Result<Option<Message>, StoreError> {
        Ok(self
            .read_partitions()
            .get(recipient)
            .and_then(|p| p.get(&id))
            .cloned())
    }

    fn history(&self, recipient: &str) -> Result<Vec<Message>, StoreError> {
        Ok(self
            .read_partitions()
            .get(recipient)
            .map(|p| p.values().cloned().collect())
            .unwrap_or_default())
    }

    fn health_check(&self) -> Result<(), StoreError> {
        self.check()
    }
}
