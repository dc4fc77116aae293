//! In-process presence directory.
//!
//! Share one `Arc<MemoryPresence>` between several nodes in the same process
//! to get a cluster without Redis (integration tests, local demos).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{presence_key, PresenceDirectory, PresenceError};

#[derive(Debug, Default)]
pub struct MemoryPresence {
    records: RwLock<HashMap<String, String>>,
    /// Simulated outage: every call fails while set.
    unavailable: AtomicBool,
}

impl MemoryPresence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle a simulated backend outage.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of published records.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    fn check(&self) -> Result<(), PresenceError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(PresenceError::Unavailable("memory directory offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl PresenceDirectory for MemoryPresence {
    async fn publish(&self, user: &str, node_addr: &str) -> Result<(), PresenceError> {
        self.check()?;
        self.records
            .write()
            .await
            .insert(presence_key(user), node_addr.to_string());
        Ok(())
    }

    async fn resolve(&self, user: &str) -> Result<Option<String>, PresenceError> {
        self.check()?;
        Ok(self.records.read().await.get(&presence_key(user)).cloned())
    }

    async fn retract(&self, user: &str) -> Result<(), PresenceError> {
        self.check()?;
        self.records.write().await.remove(&presence_key(user));
        Ok(())
    }

    async fn retract_if_owner(&self, user: &str, node_addr: &str) -> Result<bool, PresenceError> {
        self.check()?;
        let mut records = self.records.write().await;
        let key = presence_key(user);
        if records.get(&key).is_some_and(|current| current == node_addr) {
            records.remove(&key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn ping(&self) -> Result<(), PresenceError> {
        self.check()
    }
}
