#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rta_sdk::rta::{
    ClientMessage, CloseStatus, ConnectionState, ErrorCode, RtaConfig, RtaManager,
    RtaManagerOptions, ServerMessage, Subscription, SuspendMonitor, SuspendSignal, Transport,
    TransportError, TransportEvents, TransportFactory, UserIdentity,
};
use serde_json::Value;

/// Scripted stand-in for the RTA service. Every transport created by the
/// manager reports into the same recorder.
#[derive(Clone, Default)]
pub struct MockService {
    state: Arc<Mutex<MockState>>,
}

#[derive(Default)]
struct MockState {
    transports: Vec<TransportEvents>,
    connect_attempts: usize,
    failing_connects: usize,
    disconnect_calls: usize,
    sent: Vec<ClientMessage>,
}

impl MockService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` connects fail.
    pub fn fail_next_connects(&self, count: usize) {
        self.state.lock().failing_connects = count;
    }

    pub fn connect_attempts(&self) -> usize {
        self.state.lock().connect_attempts
    }

    pub fn disconnect_calls(&self) -> usize {
        self.state.lock().disconnect_calls
    }

    pub fn sent(&self) -> Vec<ClientMessage> {
        self.state.lock().sent.clone()
    }

    pub fn subscribes(&self) -> Vec<(u32, String)> {
        self.sent()
            .into_iter()
            .filter_map(|message| match message {
                ClientMessage::Subscribe {
                    client_id,
                    resource_uri,
                } => Some((client_id, resource_uri)),
                ClientMessage::Unsubscribe { .. } => None,
            })
            .collect()
    }

    pub fn unsubscribes(&self) -> Vec<(u32, u32)> {
        self.sent()
            .into_iter()
            .filter_map(|message| match message {
                ClientMessage::Unsubscribe {
                    client_id,
                    service_id,
                } => Some((client_id, service_id)),
                ClientMessage::Subscribe { .. } => None,
            })
            .collect()
    }

    pub fn clear_sent(&self) {
        self.state.lock().sent.clear();
    }

    fn current(&self) -> TransportEvents {
        self.state
            .lock()
            .transports
            .last()
            .cloned()
            .expect("no transport created yet")
    }

    pub fn push(&self, message: ServerMessage) {
        let text = message.to_text().expect("encode server frame");
        self.current().message_received(text);
    }

    pub fn push_raw(&self, text: &str) {
        self.current().message_received(text);
    }

    pub fn subscribe_ok(&self, client_id: u32, service_id: u32, data: Value) {
        self.push(ServerMessage::SubscribeResponse {
            client_id,
            code: ErrorCode::Success,
            service_id: Some(service_id),
            data,
        });
    }

    pub fn subscribe_failed(&self, client_id: u32, code: ErrorCode) {
        self.push(ServerMessage::SubscribeResponse {
            client_id,
            code,
            service_id: None,
            data: Value::Null,
        });
    }

    pub fn unsubscribe_ok(&self, client_id: u32) {
        self.push(ServerMessage::UnsubscribeResponse {
            client_id,
            code: ErrorCode::Success,
        });
    }

    pub fn unsubscribe_failed(&self, client_id: u32, code: ErrorCode) {
        self.push(ServerMessage::UnsubscribeResponse { client_id, code });
    }

    pub fn event(&self, service_id: u32, data: Value) {
        self.push(ServerMessage::Event { service_id, data });
    }

    pub fn resync(&self) {
        self.push(ServerMessage::Resync);
    }

    /// Simulates the service dropping the socket.
    pub fn drop_connection(&self) {
        self.current()
            .disconnected(CloseStatus::with_code("going away", 1001));
    }
}

struct MockTransport {
    state: Arc<Mutex<MockState>>,
    events: TransportEvents,
}

impl Transport for MockTransport {
    fn connect(&self, _uri: &str, _subprotocol: &str) {
        let fail = {
            let mut state = self.state.lock();
            state.connect_attempts += 1;
            if state.failing_connects > 0 {
                state.failing_connects -= 1;
                true
            } else {
                false
            }
        };
        if fail {
            self.events
                .connect_complete(Err(TransportError::Closed("connection refused".to_string())));
        } else {
            self.events.connect_complete(Ok(()));
        }
    }

    fn send(&self, message: String) -> Result<(), TransportError> {
        let message = ClientMessage::from_text(&message).expect("client frame should decode");
        self.state.lock().sent.push(message);
        Ok(())
    }

    fn disconnect(&self) {
        self.state.lock().disconnect_calls += 1;
    }
}

impl TransportFactory for MockService {
    fn create(
        &self,
        _user: Arc<dyn UserIdentity>,
        events: TransportEvents,
    ) -> Result<Box<dyn Transport>, TransportError> {
        self.state.lock().transports.push(events.clone());
        Ok(Box::new(MockTransport {
            state: Arc::clone(&self.state),
            events,
        }))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Hook {
    Subscribed(Value),
    Event(Value),
    Resync,
}

/// Subscription that records every hook invocation.
pub struct RecordingSubscription {
    uri: String,
    hooks: Mutex<Vec<Hook>>,
}

impl RecordingSubscription {
    pub fn new(uri: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            uri: uri.into(),
            hooks: Mutex::new(Vec::new()),
        })
    }

    pub fn hooks(&self) -> Vec<Hook> {
        self.hooks.lock().clone()
    }
}

impl Subscription for RecordingSubscription {
    fn resource_uri(&self) -> &str {
        &self.uri
    }

    fn on_subscribed(&self, data: &Value) {
        self.hooks.lock().push(Hook::Subscribed(data.clone()));
    }

    fn on_event(&self, data: &Value) {
        self.hooks.lock().push(Hook::Event(data.clone()));
    }

    fn on_resync(&self) {
        self.hooks.lock().push(Hook::Resync);
    }
}

pub fn presence_uri(xuid: u64) -> String {
    format!("https://userpresence.xboxlive.com/users/xuid({xuid})/richpresence")
}

pub fn manager_with(service: &MockService) -> RtaManager {
    manager_with_suspend(service, Arc::new(SuspendSignal::never_suspended()))
}

pub fn manager_with_suspend(service: &MockService, suspend: Arc<dyn SuspendMonitor>) -> RtaManager {
    RtaManager::with_options(
        RtaConfig::default(),
        RtaManagerOptions {
            transport: Arc::new(service.clone()),
            suspend,
            runtime: None,
        },
    )
    .expect("manager on test runtime")
}

/// Records state transitions reported to a handler.
pub fn record_states(
    manager: &RtaManager,
    user: &dyn UserIdentity,
) -> Arc<Mutex<Vec<ConnectionState>>> {
    let states = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&states);
    manager.add_state_changed_handler(user, move |state| sink.lock().push(state));
    states
}

/// Lets spawned connection tasks drain their queues without moving the clock.
pub async fn settle() {
    for _ in 0..64 {
        tokio::task::yield_now().await;
    }
}

/// Advances the paused clock and lets woken timers run.
pub async fn advance(duration: Duration) {
    tokio::time::advance(duration).await;
    settle().await;
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
