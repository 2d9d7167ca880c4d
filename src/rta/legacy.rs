//! Opaque subscription handle kept for callers written against the older
//! handle-based surface.
//!
//! Subscription state now lives in the connection engine; the accessors here
//! return fixed values and exist only so existing callers keep compiling.

use crate::rta::subscription::SubscriptionId;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum LegacySubscriptionState {
    Unknown,
    PendingSubscribe,
    Subscribed,
    PendingUnsubscribe,
    Closed,
}

/// Legacy handle wrapping a [`SubscriptionId`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct LegacySubscriptionHandle {
    subscription: SubscriptionId,
}

impl LegacySubscriptionHandle {
    pub fn new(subscription: SubscriptionId) -> Self {
        Self { subscription }
    }

    pub fn subscription(&self) -> SubscriptionId {
        self.subscription
    }

    /// Always [`LegacySubscriptionState::Unknown`].
    pub fn state(&self) -> LegacySubscriptionState {
        LegacySubscriptionState::Unknown
    }

    /// Always `0`; service ids are no longer exposed.
    pub fn id(&self) -> u32 {
        0
    }
}

impl From<SubscriptionId> for LegacySubscriptionHandle {
    fn from(subscription: SubscriptionId) -> Self {
        Self::new(subscription)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{LegacySubscriptionHandle, LegacySubscriptionState};
    use crate::rta::subscription::{Subscription, SubscriptionRegistry};

    struct Presence;

    impl Subscription for Presence {
        fn resource_uri(&self) -> &str {
            "https://userpresence.xboxlive.com/users/xuid(1)/richpresence"
        }
    }

    #[test]
    fn accessors_return_fixed_values() {
        let registry = SubscriptionRegistry::new();
        let id = registry.insert(Arc::new(Presence));
        let handle = LegacySubscriptionHandle::from(id);
        assert_eq!(handle.subscription(), id);
        assert_eq!(handle.state(), LegacySubscriptionState::Unknown);
        assert_eq!(handle.id(), 0);
    }
}
