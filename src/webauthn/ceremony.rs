//! Short-lived ceremony state between a WebAuthn `begin` and `finish`.

use moka::future::Cache;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

pub const CEREMONY_TTL: Duration = Duration::from_secs(5 * 60);
const MAX_PENDING_CEREMONIES: u64 = 100_000;

/// Expiring single-use map from a ceremony key to its pending state.
///
/// Entries vanish after the TTL whether or not anyone reads them. A second
/// `put` for the same key replaces the first (last write wins).
#[derive(Clone)]
pub struct CeremonyStore<V> {
    name: &'static str,
    inner: Cache<Uuid, V>,
}

impl<V> CeremonyStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    #[must_use]
    pub fn new(name: &'static str, ttl: Duration) -> Self {
        Self {
            name,
            inner: Cache::builder()
                .max_capacity(MAX_PENDING_CEREMONIES)
                .time_to_live(ttl)
                .build(),
        }
    }

    pub async fn put(&self, key: Uuid, state: V) {
        debug!(store = self.name, %key, "ceremony started");
        self.inner.insert(key, state).await;
    }

    /// Remove and return the pending state. A key can be taken at most once.
    pub async fn take(&self, key: Uuid) -> Option<V> {
        let state = self.inner.remove(&key).await;
        if state.is_none() {
            debug!(store = self.name, %key, "no pending ceremony");
        }
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn state_is_single_use() {
        let store = CeremonyStore::new("test", CEREMONY_TTL);
        let key = Uuid::new_v4();
        store.put(key, "challenge".to_string()).await;

        assert_eq!(store.take(key).await.as_deref(), Some("challenge"));
        assert_eq!(store.take(key).await, None);
    }

    #[tokio::test]
    async fn later_begin_overwrites_pending_state() {
        let store = CeremonyStore::new("test", CEREMONY_TTL);
        let key = Uuid::new_v4();
        store.put(key, 1_u32).await;
        store.put(key, 2_u32).await;

        assert_eq!(store.take(key).await, Some(2));
    }

    #[tokio::test]
    async fn state_expires_after_ttl() {
        let store = CeremonyStore::new("test", Duration::from_millis(50));
        let key = Uuid::new_v4();
        store.put(key, 7_u8).await;

        tokio::time::sleep(Duration::from_millis(120)).await;

        assert_eq!(store.take(key).await, None);
    }

    #[tokio::test]
    async fn keys_do_not_collide() {
        let store = CeremonyStore::new("test", CEREMONY_TTL);
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        store.put(first, "a").await;

        assert_eq!(store.take(second).await, None);
        assert_eq!(store.take(first).await, Some("a"));
    }
}
