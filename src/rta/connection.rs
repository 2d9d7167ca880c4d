//! Per-identity RTA connection.
//!
//! A [`Connection`] owns one transport for one user and multiplexes every
//! subscription of that user over it. Protocol I/O, timers and inbound
//! dispatch run on a single worker task; add/remove calls from other threads
//! mutate the shared state under the connection lock and hand outbound frames
//! to the worker through its command queue, so frames leave in the order the
//! state machine produced them.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::rta::completion::{join, merge, Completion, Outcome, PendingOp};
use crate::rta::config::RtaConfig;
use crate::rta::error::RtaError;
use crate::rta::identity::UserIdentity;
use crate::rta::proto::{ClientMessage, ErrorCode, ServerMessage};
use crate::rta::subscription::{SubscriptionId, SubscriptionRegistry};
use crate::rta::suspend::{wait_until_resumed, SuspendMonitor};
use crate::rta::transport::{
    CloseStatus, Transport, TransportError, TransportEvent, TransportEvents, TransportFactory,
};

/// Connection lifecycle reported to state-changed handlers.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

/// Status of a subscription with respect to the RTA service.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ServiceStatus {
    /// The service has no knowledge of the subscription.
    Inactive,
    /// Subscribe sent, response outstanding.
    Subscribing,
    /// Registered with the service.
    Active,
    /// Removed while subscribing; unsubscribe follows the subscribe response.
    PendingUnsubscribe,
    /// Unsubscribe sent, response outstanding.
    Unsubscribing,
    /// Re-added while unsubscribing; subscribe follows the unsubscribe response.
    PendingSubscribe,
}

pub(crate) type StateChangedHook = Arc<dyn Fn(ConnectionState) + Send + Sync>;
pub(crate) type ResyncHook = Arc<dyn Fn() + Send + Sync>;

pub(crate) struct ConnectionParams {
    pub config: RtaConfig,
    pub transports: Arc<dyn TransportFactory>,
    pub suspend: Arc<dyn SuspendMonitor>,
    pub registry: SubscriptionRegistry,
    pub runtime: Handle,
    pub on_state_changed: StateChangedHook,
    pub on_resync: ResyncHook,
}

/// Service-side view of one resource uri. Every registered subscription with
/// the same uri shares it.
struct ServiceSubscription {
    uri: String,
    client_id: u32,
    service_id: Option<u32>,
    status: ServiceStatus,
    subscribe_attempt: u32,
    /// A retryable failure was received and a resubscribe timer is armed.
    retry_pending: bool,
    last_error: Option<RtaError>,
    clients: BTreeSet<SubscriptionId>,
    /// Removed while subscribing; still owed the on-subscribed hook.
    detached: BTreeSet<SubscriptionId>,
    subscribed_data: Value,
    subscribe_op: Option<PendingOp>,
    unsubscribe_op: Option<PendingOp>,
}

impl ServiceSubscription {
    fn new(uri: String, client_id: u32) -> Self {
        Self {
            uri,
            client_id,
            service_id: None,
            status: ServiceStatus::Inactive,
            subscribe_attempt: 0,
            retry_pending: false,
            last_error: None,
            clients: BTreeSet::new(),
            detached: BTreeSet::new(),
            subscribed_data: Value::Null,
            subscribe_op: None,
            unsubscribe_op: None,
        }
    }

    /// Marks the subscription as subscribing and builds the request.
    fn subscribe_message(&mut self) -> ClientMessage {
        self.status = ServiceStatus::Subscribing;
        ClientMessage::Subscribe {
            client_id: self.client_id,
            resource_uri: self.uri.clone(),
        }
    }

    fn reset(&mut self) {
        self.service_id = None;
        self.status = ServiceStatus::Inactive;
        self.subscribe_attempt = 0;
        self.retry_pending = false;
        self.last_error = None;
        self.detached.clear();
    }
}

enum Command {
    Connect { ticket: u64 },
    Send { epoch: u64, message: ClientMessage },
    RetrySubscribe { epoch: u64, client_id: u32 },
    Rotate { epoch: u64 },
    DeliverSubscribed {
        ids: Vec<SubscriptionId>,
        data: Value,
        op: PendingOp,
    },
    DeliverResync,
    Shutdown,
}

enum HookCall {
    Subscribed(Vec<SubscriptionId>, Value),
    Event(Vec<SubscriptionId>, Value),
    Resync(Vec<SubscriptionId>),
}

/// Side effects collected under the lock and applied on the worker after it
/// is released.
#[derive(Default)]
struct Effects {
    completions: Vec<(PendingOp, Outcome)>,
    hooks: Vec<HookCall>,
    state_change: Option<ConnectionState>,
    frames: Vec<ClientMessage>,
}

impl Effects {
    fn complete(&mut self, op: Option<PendingOp>, outcome: Outcome) {
        if let Some(op) = op {
            self.completions.push((op, outcome));
        }
    }
}

struct Inner {
    state: ConnectionState,
    /// Bumped whenever a transport is created or abandoned; stale events,
    /// sends and timers carry an older value and are dropped.
    epoch: u64,
    connect_ticket: u64,
    connect_attempt: u32,
    connected_at: Option<Instant>,
    next_client_id: u32,
    subs_by_client_id: BTreeMap<u32, ServiceSubscription>,
    client_id_by_uri: HashMap<String, u32>,
    client_id_by_service_id: HashMap<u32, u32>,
    shut_down: bool,
}

impl Inner {
    fn set_state(&mut self, state: ConnectionState) -> Option<ConnectionState> {
        if self.state == state {
            return None;
        }
        self.state = state;
        Some(state)
    }

    fn client_id_of(&self, id: SubscriptionId) -> Option<u32> {
        self.subs_by_client_id
            .iter()
            .find(|(_, sub)| sub.clients.contains(&id))
            .map(|(client_id, _)| *client_id)
    }

    /// Drops a subscription from every lookup table.
    fn forget(&mut self, client_id: u32) -> Option<ServiceSubscription> {
        let sub = self.subs_by_client_id.remove(&client_id)?;
        self.client_id_by_uri.remove(&sub.uri);
        if let Some(service_id) = sub.service_id {
            self.client_id_by_service_id.remove(&service_id);
        }
        Some(sub)
    }

    /// Applies the disconnect rules. Unwanted subscriptions are dropped: their
    /// pending adds fail and their pending removes succeed. Wanted ones wait
    /// as inactive for the next connect and keep their pending adds, which
    /// the resubscribe resolves.
    fn reset_after_disconnect(&mut self, effects: &mut Effects) {
        self.client_id_by_service_id.clear();
        let mut unwanted = Vec::new();
        for (client_id, sub) in self.subs_by_client_id.iter_mut() {
            effects.complete(sub.unsubscribe_op.take(), Ok(()));
            if matches!(
                sub.status,
                ServiceStatus::PendingUnsubscribe | ServiceStatus::Unsubscribing
            ) {
                effects.complete(
                    sub.subscribe_op.take(),
                    Err(RtaError::Transport("connection lost".to_string())),
                );
                unwanted.push(*client_id);
            }
            sub.reset();
        }
        for client_id in unwanted {
            self.forget(client_id);
        }
    }
}

struct Shared {
    user_id: u64,
    inner: Mutex<Inner>,
    commands: mpsc::UnboundedSender<Command>,
    registry: SubscriptionRegistry,
    config: RtaConfig,
    suspend: Arc<dyn SuspendMonitor>,
    runtime: Handle,
    on_state_changed: StateChangedHook,
    on_resync: ResyncHook,
}

impl Shared {
    fn enqueue(&self, command: Command) {
        // Fails only after shutdown, when the frame is moot.
        let _ = self.commands.send(command);
    }

    fn schedule(&self, delay: Duration, command: Command) {
        let commands = self.commands.clone();
        self.runtime.spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let _ = commands.send(command);
        });
    }

    fn schedule_connect(&self, inner: &mut Inner) {
        let delay = self.config.backoff.next_delay(&mut inner.connect_attempt);
        inner.connect_ticket += 1;
        let ticket = inner.connect_ticket;
        debug!(
            event = "rta_connect_scheduled",
            user_id = self.user_id,
            attempt = inner.connect_attempt,
            delay_ms = delay.as_millis() as u64
        );

        let commands = self.commands.clone();
        let suspend = Arc::clone(&self.suspend);
        self.runtime.spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            wait_until_resumed(suspend.as_ref()).await;
            let _ = commands.send(Command::Connect { ticket });
        });
    }

    fn run_hook(&self, hook: HookCall) {
        match hook {
            HookCall::Subscribed(ids, data) => {
                for subscription in self.registry.resolve(&ids) {
                    subscription.on_subscribed(&data);
                }
            }
            HookCall::Event(ids, data) => {
                for subscription in self.registry.resolve(&ids) {
                    subscription.on_event(&data);
                }
            }
            HookCall::Resync(ids) => {
                for subscription in self.registry.resolve(&ids) {
                    subscription.on_resync();
                }
            }
        }
    }

    fn add(&self, id: SubscriptionId, uri: String) -> Completion {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.shut_down {
            return Completion::ready(Err(RtaError::Aborted));
        }

        let client_id = match inner.client_id_by_uri.get(&uri) {
            Some(client_id) => *client_id,
            None => {
                let client_id = inner.next_client_id;
                inner.next_client_id += 1;
                inner.client_id_by_uri.insert(uri.clone(), client_id);
                client_id
            }
        };
        let connected = inner.state == ConnectionState::Connected;
        let epoch = inner.epoch;
        let sub = inner
            .subs_by_client_id
            .entry(client_id)
            .or_insert_with(|| ServiceSubscription::new(uri, client_id));
        sub.clients.insert(id);
        sub.detached.remove(&id);

        debug!(
            event = "rta_add_subscription",
            user_id = self.user_id,
            client_id,
            uri = %sub.uri,
            status = ?sub.status
        );

        match sub.status {
            ServiceStatus::Inactive => {
                let completion = join(&mut sub.subscribe_op);
                if connected {
                    let message = sub.subscribe_message();
                    self.enqueue(Command::Send { epoch, message });
                }
                completion
            }
            ServiceStatus::Subscribing | ServiceStatus::PendingSubscribe => {
                join(&mut sub.subscribe_op)
            }
            ServiceStatus::PendingUnsubscribe => {
                sub.status = ServiceStatus::Subscribing;
                sub.detached.clear();
                merge(&mut sub.subscribe_op, sub.unsubscribe_op.take());
                join(&mut sub.subscribe_op)
            }
            ServiceStatus::Unsubscribing => {
                sub.status = ServiceStatus::PendingSubscribe;
                join(&mut sub.subscribe_op)
            }
            ServiceStatus::Active => {
                // Resolved by the worker once the replayed hook has run.
                let op = PendingOp::new();
                let completion = op.completion();
                self.enqueue(Command::DeliverSubscribed {
                    ids: vec![id],
                    data: sub.subscribed_data.clone(),
                    op,
                });
                completion
            }
        }
    }

    fn remove(&self, id: SubscriptionId) -> Completion {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(client_id) = inner.client_id_of(id) else {
            return Completion::ready(Ok(()));
        };
        let epoch = inner.epoch;
        let Some(sub) = inner.subs_by_client_id.get_mut(&client_id) else {
            return Completion::ready(Ok(()));
        };
        sub.clients.remove(&id);

        debug!(
            event = "rta_remove_subscription",
            user_id = self.user_id,
            client_id,
            uri = %sub.uri,
            status = ?sub.status,
            remaining_clients = sub.clients.len()
        );

        if !sub.clients.is_empty() {
            // Still needed by another subscription to the same resource.
            return Completion::ready(Ok(()));
        }

        let status = sub.status;
        match status {
            ServiceStatus::Inactive => {
                if let Some(sub) = inner.forget(client_id) {
                    if let Some(op) = sub.subscribe_op {
                        op.resolve(Ok(()));
                    }
                }
                Completion::ready(Ok(()))
            }
            ServiceStatus::Active => {
                sub.status = ServiceStatus::Unsubscribing;
                let completion = join(&mut sub.unsubscribe_op);
                if let Some(service_id) = sub.service_id {
                    self.enqueue(Command::Send {
                        epoch,
                        message: ClientMessage::Unsubscribe {
                            client_id,
                            service_id,
                        },
                    });
                }
                completion
            }
            ServiceStatus::Subscribing if sub.retry_pending => {
                // Nothing is registered service-side while backing off.
                if let Some(sub) = inner.forget(client_id) {
                    let error = sub
                        .last_error
                        .unwrap_or(RtaError::Service(ErrorCode::Throttled));
                    if let Some(op) = sub.subscribe_op {
                        op.resolve(Err(error));
                    }
                    if let Some(op) = sub.unsubscribe_op {
                        op.resolve(Ok(()));
                    }
                }
                Completion::ready(Ok(()))
            }
            ServiceStatus::Subscribing => {
                sub.status = ServiceStatus::PendingUnsubscribe;
                sub.detached.insert(id);
                join(&mut sub.unsubscribe_op)
            }
            ServiceStatus::PendingSubscribe => {
                sub.status = ServiceStatus::Unsubscribing;
                merge(&mut sub.unsubscribe_op, sub.subscribe_op.take());
                join(&mut sub.unsubscribe_op)
            }
            ServiceStatus::PendingUnsubscribe => {
                sub.detached.insert(id);
                join(&mut sub.unsubscribe_op)
            }
            ServiceStatus::Unsubscribing => join(&mut sub.unsubscribe_op),
        }
    }
}

/// Handle to a running connection. Dropping it tears the connection down.
pub(crate) struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    pub(crate) fn spawn(user: Arc<dyn UserIdentity>, params: ConnectionParams) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let user_id = user.user_id();

        let shared = Arc::new(Shared {
            user_id,
            inner: Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                epoch: 0,
                connect_ticket: 0,
                connect_attempt: 0,
                connected_at: None,
                next_client_id: 1,
                subs_by_client_id: BTreeMap::new(),
                client_id_by_uri: HashMap::new(),
                client_id_by_service_id: HashMap::new(),
                shut_down: false,
            }),
            commands: commands_tx,
            registry: params.registry,
            config: params.config,
            suspend: params.suspend,
            runtime: params.runtime.clone(),
            on_state_changed: params.on_state_changed,
            on_resync: params.on_resync,
        });

        let worker = Worker {
            shared: Arc::clone(&shared),
            user,
            transports: params.transports,
            transport: None,
            commands_rx,
            events_tx,
            events_rx,
        };

        debug!(event = "rta_connection_created", user_id);
        shared.schedule_connect(&mut shared.inner.lock());
        params.runtime.spawn(worker.run());

        Self { shared }
    }

    pub(crate) fn add_subscription(&self, id: SubscriptionId, uri: String) -> Completion {
        self.shared.add(id, uri)
    }

    pub(crate) fn remove_subscription(&self, id: SubscriptionId) -> Completion {
        self.shared.remove(id)
    }

    pub(crate) fn subscription_count(&self) -> usize {
        self.shared.inner.lock().subs_by_client_id.len()
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.shared.inner.lock().state
    }

    pub(crate) fn status_of(&self, id: SubscriptionId) -> ServiceStatus {
        let inner = self.shared.inner.lock();
        inner
            .subs_by_client_id
            .values()
            .find(|sub| sub.clients.contains(&id) || sub.detached.contains(&id))
            .map_or(ServiceStatus::Inactive, |sub| sub.status)
    }

    /// Delivers a resync notification to every active subscription.
    pub(crate) fn deliver_resync(&self) {
        self.shared.enqueue(Command::DeliverResync);
    }

    /// Stops the worker and resolves every pending completion as aborted.
    /// No state change is reported.
    pub(crate) fn cleanup(&self) {
        let pending: Vec<PendingOp> = {
            let mut guard = self.shared.inner.lock();
            let inner = &mut *guard;
            if inner.shut_down {
                return;
            }
            inner.shut_down = true;
            inner.client_id_by_uri.clear();
            inner.client_id_by_service_id.clear();
            std::mem::take(&mut inner.subs_by_client_id)
                .into_values()
                .flat_map(|sub| sub.subscribe_op.into_iter().chain(sub.unsubscribe_op))
                .collect()
        };

        debug!(
            event = "rta_connection_cleanup",
            user_id = self.shared.user_id,
            aborted = pending.len()
        );
        for op in pending {
            op.resolve(Err(RtaError::Aborted));
        }
        self.shared.enqueue(Command::Shutdown);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.cleanup();
    }
}

struct Worker {
    shared: Arc<Shared>,
    user: Arc<dyn UserIdentity>,
    transports: Arc<dyn TransportFactory>,
    transport: Option<Box<dyn Transport>>,
    commands_rx: mpsc::UnboundedReceiver<Command>,
    events_tx: mpsc::UnboundedSender<(u64, TransportEvent)>,
    events_rx: mpsc::UnboundedReceiver<(u64, TransportEvent)>,
}

impl Worker {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands_rx.recv() => {
                    match command {
                        Some(Command::Shutdown) | None => break,
                        Some(command) => self.handle_command(command),
                    }
                }
                Some((epoch, event)) = self.events_rx.recv() => {
                    self.handle_transport_event(epoch, event);
                }
            }
        }

        if let Some(transport) = self.transport.take() {
            transport.disconnect();
        }
        debug!(event = "rta_connection_worker_stopped", user_id = self.shared.user_id);
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { ticket } => self.connect(ticket),
            Command::Send { epoch, message } => {
                let current = {
                    let inner = self.shared.inner.lock();
                    inner.epoch == epoch && inner.state == ConnectionState::Connected
                };
                if current {
                    self.send_frame(message);
                } else {
                    debug!(
                        event = "rta_stale_frame_dropped",
                        user_id = self.shared.user_id,
                        client_id = message.client_id()
                    );
                }
            }
            Command::RetrySubscribe { epoch, client_id } => self.retry_subscribe(epoch, client_id),
            Command::Rotate { epoch } => self.rotate(epoch),
            Command::DeliverSubscribed { ids, data, op } => {
                self.shared.run_hook(HookCall::Subscribed(ids, data));
                op.resolve(Ok(()));
            }
            Command::DeliverResync => {
                let ids = self.active_clients();
                self.shared.run_hook(HookCall::Resync(ids));
            }
            Command::Shutdown => {}
        }
    }

    fn handle_transport_event(&mut self, epoch: u64, event: TransportEvent) {
        let state = {
            let inner = self.shared.inner.lock();
            if inner.epoch != epoch || inner.shut_down {
                debug!(event = "rta_stale_transport_event", user_id = self.shared.user_id);
                return;
            }
            inner.state
        };

        match event {
            TransportEvent::ConnectComplete(result) => self.connect_complete(result),
            TransportEvent::Disconnected(status) => match state {
                ConnectionState::Connected => self.handle_disconnect(status),
                ConnectionState::Connecting => {
                    self.connect_complete(Err(TransportError::Closed(status.to_string())))
                }
                ConnectionState::Disconnected => {}
            },
            TransportEvent::MessageReceived(text) => self.handle_message(&text),
        }
    }

    fn connect(&mut self, ticket: u64) {
        let epoch = {
            let mut inner = self.shared.inner.lock();
            if inner.shut_down || inner.connect_ticket != ticket {
                return;
            }
            inner.epoch += 1;
            inner.epoch
        };

        let user = match self.user.try_clone_identity() {
            Ok(user) => user,
            Err(err) => {
                warn!(
                    event = "rta_identity_copy_failed",
                    user_id = self.shared.user_id,
                    error = %err
                );
                self.shared.schedule_connect(&mut self.shared.inner.lock());
                return;
            }
        };

        let events = TransportEvents::new(epoch, self.events_tx.clone());
        let transport = match self.transports.create(user, events) {
            Ok(transport) => transport,
            Err(err) => {
                warn!(
                    event = "rta_transport_create_failed",
                    user_id = self.shared.user_id,
                    error = %err
                );
                self.shared.schedule_connect(&mut self.shared.inner.lock());
                return;
            }
        };
        if let Some(previous) = self.transport.replace(transport) {
            previous.disconnect();
        }

        let (changed, attempt) = {
            let mut inner = self.shared.inner.lock();
            (inner.set_state(ConnectionState::Connecting), inner.connect_attempt)
        };
        if let Some(state) = changed {
            (self.shared.on_state_changed)(state);
        }

        info!(
            event = "rta_connecting",
            user_id = self.shared.user_id,
            attempt,
            endpoint = %self.shared.config.endpoint
        );
        if let Some(transport) = self.transport.as_ref() {
            transport.connect(&self.shared.config.endpoint, &self.shared.config.subprotocol);
        }
    }

    fn connect_complete(&mut self, result: Result<(), TransportError>) {
        let mut effects = Effects::default();
        let failed = result.is_err();
        {
            let mut guard = self.shared.inner.lock();
            let inner = &mut *guard;
            if inner.state != ConnectionState::Connecting {
                return;
            }

            match result {
                Ok(()) => {
                    effects.state_change = inner.set_state(ConnectionState::Connected);
                    inner.connected_at = Some(Instant::now());
                    inner.connect_attempt = 0;
                    for sub in inner.subs_by_client_id.values_mut() {
                        if sub.status == ServiceStatus::Inactive {
                            effects.frames.push(sub.subscribe_message());
                        } else {
                            warn!(
                                event = "rta_unexpected_status_on_connect",
                                client_id = sub.client_id,
                                status = ?sub.status
                            );
                        }
                    }
                    info!(
                        event = "rta_connected",
                        user_id = self.shared.user_id,
                        resubscribing = effects.frames.len()
                    );
                    self.shared.schedule(
                        self.shared.config.connection_lifetime,
                        Command::Rotate { epoch: inner.epoch },
                    );
                }
                Err(err) => {
                    warn!(
                        event = "rta_connect_failed",
                        user_id = self.shared.user_id,
                        attempt = inner.connect_attempt,
                        error = %err
                    );
                    if inner.connect_attempt > self.shared.config.disconnected_after_attempts {
                        effects.state_change = inner.set_state(ConnectionState::Disconnected);
                    }
                    inner.epoch += 1;
                    self.shared.schedule_connect(inner);
                }
            }
        }

        if failed {
            if let Some(transport) = self.transport.take() {
                transport.disconnect();
            }
        }
        self.apply(effects);
    }

    fn handle_disconnect(&mut self, status: CloseStatus) {
        let mut effects = Effects::default();
        {
            let mut guard = self.shared.inner.lock();
            let inner = &mut *guard;
            if inner.shut_down || inner.state != ConnectionState::Connected {
                return;
            }
            info!(event = "rta_disconnected", user_id = self.shared.user_id, reason = %status);
            inner.epoch += 1;
            inner.connected_at = None;
            effects.state_change = inner.set_state(ConnectionState::Disconnected);
            inner.reset_after_disconnect(&mut effects);
            self.shared.schedule_connect(inner);
        }

        if let Some(transport) = self.transport.take() {
            transport.disconnect();
        }
        self.apply(effects);
    }

    fn apply(&mut self, effects: Effects) {
        let Effects {
            completions,
            hooks,
            state_change,
            frames,
        } = effects;

        for (op, outcome) in completions {
            op.resolve(outcome);
        }
        for hook in hooks {
            self.shared.run_hook(hook);
        }
        if let Some(state) = state_change {
            (self.shared.on_state_changed)(state);
        }
        for frame in frames {
            self.send_frame(frame);
        }
    }

    fn send_frame(&mut self, message: ClientMessage) {
        let Some(transport) = self.transport.as_ref() else {
            return;
        };
        let text = match message.to_text() {
            Ok(text) => text,
            Err(err) => {
                error!(event = "rta_frame_encode_failed", error = %err);
                return;
            }
        };
        debug!(event = "rta_frame_sent", user_id = self.shared.user_id, frame = %text);

        if let Err(err) = transport.send(text) {
            warn!(event = "rta_send_failed", user_id = self.shared.user_id, error = %err);
            self.handle_disconnect(CloseStatus::new(format!("send failed: {err}")));
        }
    }

    fn retry_subscribe(&mut self, epoch: u64, client_id: u32) {
        let message = {
            let mut inner = self.shared.inner.lock();
            if inner.epoch != epoch || inner.state != ConnectionState::Connected {
                return;
            }
            let Some(sub) = inner.subs_by_client_id.get_mut(&client_id) else {
                return;
            };
            if sub.status != ServiceStatus::Subscribing || !sub.retry_pending {
                return;
            }
            sub.retry_pending = false;
            debug!(
                event = "rta_subscribe_retry",
                user_id = self.shared.user_id,
                client_id,
                attempt = sub.subscribe_attempt
            );
            sub.subscribe_message()
        };
        self.send_frame(message);
    }

    fn rotate(&mut self, epoch: u64) {
        let expired = {
            let inner = self.shared.inner.lock();
            inner.epoch == epoch
                && inner.state == ConnectionState::Connected
                && inner
                    .connected_at
                    .is_some_and(|at| at.elapsed() >= self.shared.config.connection_lifetime)
        };
        if expired {
            info!(event = "rta_connection_rotated", user_id = self.shared.user_id);
            self.handle_disconnect(CloseStatus::new("connection lifetime elapsed"));
        }
    }

    fn active_clients(&self) -> Vec<SubscriptionId> {
        let inner = self.shared.inner.lock();
        inner
            .subs_by_client_id
            .values()
            .filter(|sub| sub.status == ServiceStatus::Active)
            .flat_map(|sub| sub.clients.iter().copied())
            .collect()
    }

    fn handle_message(&mut self, text: &str) {
        debug!(event = "rta_frame_received", user_id = self.shared.user_id, frame = %text);
        let message = match ServerMessage::from_text(text) {
            Ok(message) => message,
            Err(err) => {
                warn!(event = "rta_frame_ignored", user_id = self.shared.user_id, error = %err);
                return;
            }
        };

        match message {
            ServerMessage::SubscribeResponse {
                client_id,
                code,
                service_id,
                data,
            } => self.subscribe_response(client_id, code, service_id, data),
            ServerMessage::UnsubscribeResponse { client_id, code } => {
                self.unsubscribe_response(client_id, code)
            }
            ServerMessage::Event { service_id, data } => self.event(service_id, data),
            ServerMessage::Resync => {
                let ids = self.active_clients();
                self.shared.run_hook(HookCall::Resync(ids));
                (self.shared.on_resync)();
            }
        }
    }

    fn subscribe_response(
        &mut self,
        client_id: u32,
        code: ErrorCode,
        service_id: Option<u32>,
        data: Value,
    ) {
        let mut effects = Effects::default();
        {
            let mut guard = self.shared.inner.lock();
            let inner = &mut *guard;
            let Some(sub) = inner.subs_by_client_id.get_mut(&client_id) else {
                warn!(event = "rta_unexpected_subscribe_response", client_id);
                return;
            };
            let status = sub.status;

            if code.is_success() {
                let Some(service_id) = service_id else {
                    return;
                };
                if !matches!(
                    status,
                    ServiceStatus::Subscribing | ServiceStatus::PendingUnsubscribe
                ) || sub.retry_pending
                {
                    warn!(event = "rta_unexpected_subscribe_response", client_id, status = ?status);
                    return;
                }

                sub.service_id = Some(service_id);
                sub.subscribe_attempt = 0;
                sub.last_error = None;
                sub.subscribed_data = data.clone();
                effects.complete(sub.subscribe_op.take(), Ok(()));
                let notified = sub
                    .clients
                    .iter()
                    .chain(sub.detached.iter())
                    .copied()
                    .collect();
                sub.detached.clear();
                effects.hooks.push(HookCall::Subscribed(notified, data));

                if status == ServiceStatus::PendingUnsubscribe {
                    // Removed mid-handshake: unsubscribe right away.
                    sub.status = ServiceStatus::Unsubscribing;
                    effects.frames.push(ClientMessage::Unsubscribe {
                        client_id,
                        service_id,
                    });
                } else {
                    sub.status = ServiceStatus::Active;
                }
                inner.client_id_by_service_id.insert(service_id, client_id);
            } else if code.is_retryable() {
                let rejection = RtaError::Service(code);
                match status {
                    ServiceStatus::Subscribing => {
                        let delay = self
                            .shared
                            .config
                            .backoff
                            .next_delay(&mut sub.subscribe_attempt);
                        sub.retry_pending = true;
                        sub.last_error = Some(rejection);
                        warn!(
                            event = "rta_subscribe_retry_scheduled",
                            user_id = self.shared.user_id,
                            client_id,
                            code = %code,
                            delay_ms = delay.as_millis() as u64
                        );
                        self.shared.schedule(
                            delay,
                            Command::RetrySubscribe {
                                epoch: inner.epoch,
                                client_id,
                            },
                        );
                    }
                    ServiceStatus::PendingUnsubscribe => {
                        // Unwanted already; give up instead of retrying.
                        if let Some(sub) = inner.forget(client_id) {
                            effects.complete(sub.subscribe_op, Err(rejection));
                            effects.complete(sub.unsubscribe_op, Ok(()));
                        }
                    }
                    other => {
                        warn!(
                            event = "rta_unexpected_subscribe_response",
                            client_id,
                            status = ?other
                        );
                    }
                }
            } else {
                error!(
                    event = "rta_subscribe_rejected",
                    user_id = self.shared.user_id,
                    client_id,
                    uri = %sub.uri,
                    code = %code,
                    "subscribe rejected by service; likely a client defect"
                );
                if let Some(sub) = inner.forget(client_id) {
                    effects.complete(sub.subscribe_op, Err(RtaError::Service(code)));
                    effects.complete(sub.unsubscribe_op, Ok(()));
                }
            }
        }
        self.apply(effects);
    }

    fn unsubscribe_response(&mut self, client_id: u32, code: ErrorCode) {
        if !code.is_success() {
            error!(
                event = "rta_unsubscribe_failed",
                user_id = self.shared.user_id,
                client_id,
                code = %code
            );
        }

        let mut effects = Effects::default();
        {
            let mut guard = self.shared.inner.lock();
            let inner = &mut *guard;
            let Some(sub) = inner.subs_by_client_id.get_mut(&client_id) else {
                warn!(event = "rta_unexpected_unsubscribe_response", client_id);
                return;
            };
            let outcome = RtaError::from_service_code(code);
            let status = sub.status;

            match status {
                ServiceStatus::Unsubscribing => {
                    if let Some(sub) = inner.forget(client_id) {
                        effects.complete(sub.unsubscribe_op, outcome);
                    }
                }
                ServiceStatus::PendingSubscribe => {
                    // Re-added mid-handshake: subscribe right away.
                    if let Some(service_id) = sub.service_id.take() {
                        inner.client_id_by_service_id.remove(&service_id);
                    }
                    effects.complete(sub.unsubscribe_op.take(), outcome);
                    effects.frames.push(sub.subscribe_message());
                }
                other => {
                    warn!(
                        event = "rta_unexpected_unsubscribe_response",
                        client_id,
                        status = ?other
                    );
                }
            }
        }
        self.apply(effects);
    }

    fn event(&mut self, service_id: u32, data: Value) {
        let ids: Vec<SubscriptionId> = {
            let inner = self.shared.inner.lock();
            let Some(sub) = inner
                .client_id_by_service_id
                .get(&service_id)
                .and_then(|client_id| inner.subs_by_client_id.get(client_id))
            else {
                warn!(
                    event = "rta_event_for_unknown_subscription",
                    user_id = self.shared.user_id,
                    service_id
                );
                return;
            };
            sub.clients.iter().copied().collect()
        };
        self.shared.run_hook(HookCall::Event(ids, data));
    }
}
