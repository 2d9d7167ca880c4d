//! Subscription hooks and the subscription arena.
//!
//! Domain code implements [`Subscription`] and registers it with the manager,
//! receiving a copyable [`SubscriptionId`]. The connection is the only writer
//! of per-subscription protocol state; the arena only maps ids to hooks.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

/// One logical interest in a resource.
///
/// Hooks run on the owning connection's worker task and are never invoked
/// concurrently for the same subscription.
pub trait Subscription: Send + Sync + 'static {
    /// Resource the subscription listens to.
    fn resource_uri(&self) -> &str;

    /// Called with the service payload once the subscription is active.
    fn on_subscribed(&self, _data: &Value) {}

    /// Called for every event routed to this subscription.
    fn on_event(&self, _data: &Value) {}

    /// Called when events may have been lost and state should be refetched.
    fn on_resync(&self) {}
}

/// Lightweight handle addressing a registered subscription.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub#{}", self.0)
    }
}

/// Arena of registered subscriptions shared by the manager and connections.
#[derive(Clone, Default)]
pub struct SubscriptionRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    next_id: AtomicU64,
    entries: RwLock<HashMap<SubscriptionId, Arc<dyn Subscription>>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, subscription: Arc<dyn Subscription>) -> SubscriptionId {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.inner.entries.write().insert(id, subscription);
        id
    }

    pub fn remove(&self, id: SubscriptionId) -> Option<Arc<dyn Subscription>> {
        self.inner.entries.write().remove(&id)
    }

    pub fn resource_uri(&self, id: SubscriptionId) -> Option<String> {
        self.inner
            .entries
            .read()
            .get(&id)
            .map(|subscription| subscription.resource_uri().to_string())
    }

    /// Resolves ids to hooks, skipping ids whose owner already released them.
    pub fn resolve<'a>(
        &self,
        ids: impl IntoIterator<Item = &'a SubscriptionId>,
    ) -> Vec<Arc<dyn Subscription>> {
        let entries = self.inner.entries.read();
        ids.into_iter()
            .filter_map(|id| entries.get(id).cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{Subscription, SubscriptionRegistry};

    struct Uri(&'static str);

    impl Subscription for Uri {
        fn resource_uri(&self) -> &str {
            self.0
        }
    }

    #[test]
    fn ids_are_unique_and_resolvable() {
        let registry = SubscriptionRegistry::new();
        let first = registry.insert(Arc::new(Uri("https://a/")));
        let second = registry.insert(Arc::new(Uri("https://b/")));
        assert_ne!(first, second);
        assert_eq!(registry.resource_uri(second).as_deref(), Some("https://b/"));
    }

    #[test]
    fn resolve_skips_released_entries() {
        let registry = SubscriptionRegistry::new();
        let kept = registry.insert(Arc::new(Uri("https://a/")));
        let released = registry.insert(Arc::new(Uri("https://b/")));
        assert!(registry.remove(released).is_some());
        let hooks = registry.resolve([kept, released].iter());
        assert_eq!(hooks.len(), 1);
        assert_eq!(hooks[0].resource_uri(), "https://a/");
    }
}
