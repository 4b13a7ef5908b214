//! Subscriber directory, the account collaborator's read-only view.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;

use crate::core::Subscriber;
use crate::errors::StoreError;

/// Source of subscriber configuration.
///
/// Fanout reads one snapshot per pass. Send looks single subscribers up to
/// catch accounts that changed since fanout.
#[async_trait]
pub trait SubscriberDirectory: Send + Sync {
    /// Returns every subscriber.
    async fn snapshot(&self) -> Result<Vec<Subscriber>, StoreError>;

    /// Looks up one subscriber.
    async fn get(&self, user_id: &str) -> Result<Option<Subscriber>, StoreError>;
}

/// Directory backed by a map, for tests and embedding.
#[derive(Debug, Default)]
pub struct InMemorySubscriberDirectory {
    subscribers: RwLock<BTreeMap<String, Subscriber>>,
}

impl InMemorySubscriberDirectory {
    /// Creates an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a directory holding `subscribers`.
    #[must_use]
    pub fn with_subscribers(subscribers: impl IntoIterator<Item = Subscriber>) -> Self {
        let directory = Self::new();
        for subscriber in subscribers {
            directory.upsert(subscriber);
        }
        directory
    }

    /// Inserts or replaces a subscriber.
    pub fn upsert(&self, subscriber: Subscriber) {
        self.subscribers
            .write()
            .insert(subscriber.user_id.clone(), subscriber);
    }

    /// Removes a subscriber.
    pub fn remove(&self, user_id: &str) -> Option<Subscriber> {
        self.subscribers.write().remove(user_id)
    }

    /// Returns the number of subscribers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Returns true if the directory is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscribers.read().is_empty()
    }
}

#[async_trait]
impl SubscriberDirectory for InMemorySubscriberDirectory {
    async fn snapshot(&self) -> Result<Vec<Subscriber>, StoreError> {
        Ok(self.subscribers.read().values().cloned().collect())
    }

    async fn get(&self, user_id: &str) -> Result<Option<Subscriber>, StoreError> {
        Ok(self.subscribers.read().get(user_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upsert_and_remove() {
        let directory = InMemorySubscriberDirectory::with_subscribers([
            Subscriber::new("u1", "pro"),
            Subscriber::new("u2", "free"),
        ]);
        assert_eq!(directory.len(), 2);

        directory.upsert(Subscriber::new("u1", "enterprise"));
        let u1 = directory.get("u1").await.unwrap().unwrap();
        assert_eq!(u1.plan_tier, "enterprise");

        assert!(directory.remove("u2").is_some());
        assert!(directory.get("u2").await.unwrap().is_none());
        assert_eq!(directory.snapshot().await.unwrap().len(), 1);
    }
}
