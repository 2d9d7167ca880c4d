//! Process-scoped registry of RTA connections.
//!
//! The embedding application constructs one [`RtaManager`] and passes clones
//! of it wherever subscriptions are created. The manager owns at most one
//! connection per user identity, creates it on first use and tears it down
//! once nothing needs it anymore.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::rta::completion::{Completion, PendingOp};
use crate::rta::config::RtaConfig;
use crate::rta::connection::{Connection, ConnectionParams, ConnectionState, ServiceStatus};
use crate::rta::error::RtaError;
use crate::rta::identity::UserIdentity;
use crate::rta::subscription::{Subscription, SubscriptionId, SubscriptionRegistry};
use crate::rta::suspend::{SuspendMonitor, SuspendSignal};
use crate::rta::transport::{TransportFactory, WebSocketTransportFactory};

/// Handler invoked on connection state transitions.
pub type StateChangedHandler = Arc<dyn Fn(ConnectionState) + Send + Sync>;
/// Handler invoked when the service (or [`RtaManager::trigger_resync`])
/// signals that events may have been lost.
pub type ResyncHandler = Arc<dyn Fn() + Send + Sync>;

/// Token returned by handler registration, used to remove the handler.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct HandlerToken(u64);

impl HandlerToken {
    pub fn get(self) -> u64 {
        self.0
    }
}

/// Injected collaborators.
#[derive(Clone)]
pub struct RtaManagerOptions {
    pub transport: Arc<dyn TransportFactory>,
    pub suspend: Arc<dyn SuspendMonitor>,
    /// Runtime hosting connection workers. Defaults to the current runtime.
    pub runtime: Option<Handle>,
}

impl Default for RtaManagerOptions {
    fn default() -> Self {
        Self {
            transport: Arc::new(WebSocketTransportFactory),
            suspend: Arc::new(SuspendSignal::never_suspended()),
            runtime: None,
        }
    }
}

impl fmt::Debug for RtaManagerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtaManagerOptions")
            .field("runtime", &self.runtime.is_some())
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct UserEntry {
    connection: Option<Connection>,
    /// Incremented per connection so hooks from a torn-down connection are
    /// not dispatched.
    generation: u64,
    activation_count: u32,
    explicitly_activated: bool,
    state_handlers: BTreeMap<HandlerToken, StateChangedHandler>,
    resync_handlers: BTreeMap<HandlerToken, ResyncHandler>,
}

impl UserEntry {
    fn is_unused(&self) -> bool {
        self.connection.is_none()
            && self.activation_count == 0
            && self.state_handlers.is_empty()
            && self.resync_handlers.is_empty()
    }
}

struct ManagerInner {
    config: RtaConfig,
    transport: Arc<dyn TransportFactory>,
    suspend: Arc<dyn SuspendMonitor>,
    runtime: Handle,
    registry: SubscriptionRegistry,
    next_token: AtomicU64,
    users: Mutex<HashMap<u64, UserEntry>>,
}

/// Registry of per-user RTA connections and their observers.
#[derive(Clone)]
pub struct RtaManager {
    inner: Arc<ManagerInner>,
}

impl fmt::Debug for RtaManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtaManager")
            .field("endpoint", &self.inner.config.endpoint)
            .field("users", &self.inner.users.lock().len())
            .finish()
    }
}

impl RtaManager {
    /// Creates a manager using the websocket transport on the current tokio
    /// runtime.
    pub fn new(config: RtaConfig) -> Result<Self, RtaError> {
        Self::with_options(config, RtaManagerOptions::default())
    }

    pub fn with_options(config: RtaConfig, options: RtaManagerOptions) -> Result<Self, RtaError> {
        let runtime = match options.runtime {
            Some(handle) => handle,
            None => Handle::try_current().map_err(|err| RtaError::Runtime(err.to_string()))?,
        };

        Ok(Self {
            inner: Arc::new(ManagerInner {
                config,
                transport: options.transport,
                suspend: options.suspend,
                runtime,
                registry: SubscriptionRegistry::new(),
                next_token: AtomicU64::new(1),
                users: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Registers a subscription and returns its handle.
    pub fn register_subscription(&self, subscription: Arc<dyn Subscription>) -> SubscriptionId {
        self.inner.registry.insert(subscription)
    }

    /// Releases a handle. Hooks stop firing for it even if it is still
    /// attached to a connection; remove it first to unsubscribe.
    pub fn release_subscription(&self, id: SubscriptionId) -> Option<Arc<dyn Subscription>> {
        self.inner.registry.remove(id)
    }

    /// Subscribes `id` on behalf of `user`, creating the user's connection if
    /// needed.
    pub fn add_subscription(&self, user: &dyn UserIdentity, id: SubscriptionId) -> Completion {
        let Some(uri) = self.inner.registry.resource_uri(id) else {
            return Completion::ready(Err(RtaError::UnknownSubscription));
        };

        let mut users = self.inner.users.lock();
        let entry = users.entry(user.user_id()).or_default();
        match self.inner.ensure_connection(user, entry) {
            Ok(connection) => connection.add_subscription(id, uri),
            Err(err) => Completion::ready(Err(err)),
        }
    }

    /// Unsubscribes `id`. Once the removal completes and the connection has
    /// no subscriptions and no legacy activations left, the connection is
    /// torn down and the user's state handlers observe `Disconnected`.
    pub fn remove_subscription(&self, user: &dyn UserIdentity, id: SubscriptionId) -> Completion {
        let user_id = user.user_id();
        let removal = {
            let users = self.inner.users.lock();
            match users.get(&user_id).and_then(|entry| entry.connection.as_ref()) {
                Some(connection) => connection.remove_subscription(id),
                None => return Completion::ready(Ok(())),
            }
        };

        if let Some(outcome) = removal.clone().now_or_never() {
            self.inner.teardown_if_idle(user_id);
            return Completion::ready(outcome);
        }

        let op = PendingOp::new();
        let completion = op.completion();
        let inner = Arc::clone(&self.inner);
        self.inner.runtime.spawn(async move {
            let outcome = removal.await;
            inner.teardown_if_idle(user_id);
            op.resolve(outcome);
        });
        completion
    }

    pub fn add_state_changed_handler(
        &self,
        user: &dyn UserIdentity,
        handler: impl Fn(ConnectionState) + Send + Sync + 'static,
    ) -> HandlerToken {
        let token = self.inner.next_token();
        let mut users = self.inner.users.lock();
        users
            .entry(user.user_id())
            .or_default()
            .state_handlers
            .insert(token, Arc::new(handler));
        token
    }

    pub fn remove_state_changed_handler(&self, user: &dyn UserIdentity, token: HandlerToken) {
        self.inner.with_entry(user.user_id(), |entry| {
            entry.state_handlers.remove(&token);
        });
    }

    pub fn add_resync_handler(
        &self,
        user: &dyn UserIdentity,
        handler: impl Fn() + Send + Sync + 'static,
    ) -> HandlerToken {
        let token = self.inner.next_token();
        let mut users = self.inner.users.lock();
        users
            .entry(user.user_id())
            .or_default()
            .resync_handlers
            .insert(token, Arc::new(handler));
        token
    }

    pub fn remove_resync_handler(&self, user: &dyn UserIdentity, token: HandlerToken) {
        self.inner.with_entry(user.user_id(), |entry| {
            entry.resync_handlers.remove(&token);
        });
    }

    /// Legacy reference-counted activation.
    ///
    /// An explicit activation creates the connection even when the user has
    /// no subscriptions.
    pub fn activate(&self, user: &dyn UserIdentity, explicit: bool) -> Result<(), RtaError> {
        let mut users = self.inner.users.lock();
        let entry = users.entry(user.user_id()).or_default();
        if explicit {
            self.inner.ensure_connection(user, entry)?;
            entry.explicitly_activated = true;
        }
        entry.activation_count += 1;
        debug!(
            event = "rta_activated",
            user_id = user.user_id(),
            explicit,
            activation_count = entry.activation_count
        );
        Ok(())
    }

    /// Releases one activation. At zero the connection is torn down if it was
    /// explicitly activated or has no subscriptions.
    pub fn deactivate(&self, user: &dyn UserIdentity) {
        let user_id = user.user_id();
        let teardown = {
            let mut users = self.inner.users.lock();
            let Some(entry) = users.get_mut(&user_id) else {
                warn!(event = "rta_deactivate_without_activation", user_id);
                return;
            };
            if entry.activation_count == 0 {
                warn!(event = "rta_deactivate_without_activation", user_id);
                return;
            }
            entry.activation_count -= 1;
            if entry.activation_count > 0 {
                return;
            }

            let explicit = std::mem::take(&mut entry.explicitly_activated);
            let idle = entry
                .connection
                .as_ref()
                .is_some_and(|connection| connection.subscription_count() == 0);
            if explicit || idle {
                ManagerInner::detach(&mut users, user_id)
            } else {
                None
            }
        };

        if let Some(teardown) = teardown {
            teardown.run();
        }
    }

    /// Delivers a resync to every active subscription and every resync
    /// handler, as if the service had requested one.
    pub fn trigger_resync(&self) {
        let handlers: Vec<ResyncHandler> = {
            let users = self.inner.users.lock();
            for entry in users.values() {
                if let Some(connection) = entry.connection.as_ref() {
                    connection.deliver_resync();
                }
            }
            users
                .values()
                .flat_map(|entry| entry.resync_handlers.values().cloned())
                .collect()
        };
        info!(event = "rta_resync_triggered", handlers = handlers.len());
        for handler in handlers {
            handler();
        }
    }

    /// Current state of the user's connection; `Disconnected` if none exists.
    pub fn connection_state(&self, user: &dyn UserIdentity) -> ConnectionState {
        self.inner
            .users
            .lock()
            .get(&user.user_id())
            .and_then(|entry| entry.connection.as_ref())
            .map_or(ConnectionState::Disconnected, Connection::state)
    }

    /// Service-side status of `id` on the user's connection.
    pub fn subscription_status(
        &self,
        user: &dyn UserIdentity,
        id: SubscriptionId,
    ) -> ServiceStatus {
        self.inner
            .users
            .lock()
            .get(&user.user_id())
            .and_then(|entry| entry.connection.as_ref())
            .map_or(ServiceStatus::Inactive, |connection| connection.status_of(id))
    }

    /// Tears every connection down. State handlers are dropped first, so no
    /// disconnect notifications are delivered.
    pub fn shutdown(&self) {
        let connections: Vec<Connection> = {
            let mut users = self.inner.users.lock();
            for entry in users.values_mut() {
                entry.state_handlers.clear();
            }
            users
                .drain()
                .filter_map(|(_, entry)| entry.connection)
                .collect()
        };
        info!(event = "rta_manager_shutdown", connections = connections.len());
        for connection in connections {
            connection.cleanup();
        }
    }
}

/// A connection detached from the registry, plus the observers owed a
/// disconnect notification.
struct Teardown {
    user_id: u64,
    connection: Connection,
    handlers: Vec<StateChangedHandler>,
}

impl Teardown {
    fn run(self) {
        info!(event = "rta_connection_teardown", user_id = self.user_id);
        self.connection.cleanup();
        for handler in self.handlers {
            handler(ConnectionState::Disconnected);
        }
    }
}

impl ManagerInner {
    fn next_token(&self) -> HandlerToken {
        HandlerToken(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    fn with_entry(&self, user_id: u64, f: impl FnOnce(&mut UserEntry)) {
        let mut users = self.users.lock();
        if let Some(entry) = users.get_mut(&user_id) {
            f(entry);
            if entry.is_unused() {
                users.remove(&user_id);
            }
        }
    }

    fn ensure_connection<'a>(
        self: &Arc<Self>,
        user: &dyn UserIdentity,
        entry: &'a mut UserEntry,
    ) -> Result<&'a Connection, RtaError> {
        if entry.connection.is_none() {
            let identity = user.try_clone_identity()?;
            let user_id = user.user_id();
            entry.generation += 1;
            let generation = entry.generation;

            let state_hook = {
                let manager = Arc::downgrade(self);
                Arc::new(move |state: ConnectionState| {
                    dispatch_state(&manager, user_id, generation, state)
                })
            };
            let resync_hook = {
                let manager = Arc::downgrade(self);
                Arc::new(move || dispatch_resync(&manager, user_id, generation))
            };

            info!(event = "rta_connection_create", user_id);
            entry.connection = Some(Connection::spawn(
                identity,
                ConnectionParams {
                    config: self.config.clone(),
                    transports: Arc::clone(&self.transport),
                    suspend: Arc::clone(&self.suspend),
                    registry: self.registry.clone(),
                    runtime: self.runtime.clone(),
                    on_state_changed: state_hook,
                    on_resync: resync_hook,
                },
            ));
        }
        entry
            .connection
            .as_ref()
            .ok_or_else(|| RtaError::Runtime("connection unavailable".to_string()))
    }

    fn detach(users: &mut HashMap<u64, UserEntry>, user_id: u64) -> Option<Teardown> {
        let entry = users.get_mut(&user_id)?;
        let connection = entry.connection.take()?;
        let handlers = entry.state_handlers.values().cloned().collect();
        if entry.is_unused() {
            users.remove(&user_id);
        }
        Some(Teardown {
            user_id,
            connection,
            handlers,
        })
    }

    fn teardown_if_idle(&self, user_id: u64) {
        let teardown = {
            let mut users = self.users.lock();
            let idle = users.get(&user_id).is_some_and(|entry| {
                entry.activation_count == 0
                    && entry
                        .connection
                        .as_ref()
                        .is_some_and(|connection| connection.subscription_count() == 0)
            });
            if idle {
                Self::detach(&mut users, user_id)
            } else {
                None
            }
        };
        if let Some(teardown) = teardown {
            teardown.run();
        }
    }
}

fn dispatch_state(
    manager: &Weak<ManagerInner>,
    user_id: u64,
    generation: u64,
    state: ConnectionState,
) {
    let Some(manager) = manager.upgrade() else {
        return;
    };
    let handlers: Vec<StateChangedHandler> = {
        let users = manager.users.lock();
        match users.get(&user_id) {
            Some(entry) if entry.generation == generation && entry.connection.is_some() => {
                entry.state_handlers.values().cloned().collect()
            }
            _ => return,
        }
    };
    debug!(event = "rta_state_changed", user_id, state = ?state, handlers = handlers.len());
    for handler in handlers {
        handler(state);
    }
}

fn dispatch_resync(manager: &Weak<ManagerInner>, user_id: u64, generation: u64) {
    let Some(manager) = manager.upgrade() else {
        return;
    };
    let handlers: Vec<ResyncHandler> = {
        let users = manager.users.lock();
        match users.get(&user_id) {
            Some(entry) if entry.generation == generation && entry.connection.is_some() => {
                entry.resync_handlers.values().cloned().collect()
            }
            _ => return,
        }
    };
    for handler in handlers {
        handler();
    }
}
