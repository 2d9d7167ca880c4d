//! Real-Time Activity subscription engine.
//!
//! Domain code registers [`Subscription`] hooks with an [`RtaManager`] and
//! adds them on behalf of a user; the manager multiplexes every subscription
//! of a user over a single websocket connection and keeps them registered
//! across disconnects.

/// Single-assignment completions returned by add/remove.
pub mod completion;
/// Endpoint, lifetime and backoff settings.
pub mod config;
/// Per-identity protocol engine.
pub mod connection;
pub mod error;
/// User identity abstraction.
pub mod identity;
/// Backward-compatible subscription handle.
pub mod legacy;
/// Connection registry and observer fan-out.
pub mod manager;
/// Wire protocol messages and codes.
pub mod proto;
/// Subscription hooks and the subscription arena.
pub mod subscription;
/// Host suspend/resume capability.
pub mod suspend;
/// Transport seam and the default websocket transport.
pub mod transport;

pub use completion::{Completion, Outcome};
pub use config::{RtaConfig, RtaDefaults, RTA_ENDPOINT, RTA_SUBPROTOCOL};
pub use connection::{ConnectionState, ServiceStatus};
pub use error::RtaError;
pub use identity::{StaticUser, UserIdentity};
pub use legacy::{LegacySubscriptionHandle, LegacySubscriptionState};
pub use manager::{HandlerToken, ResyncHandler, RtaManager, RtaManagerOptions, StateChangedHandler};
pub use proto::{ClientMessage, ErrorCode, MessageType, ProtoError, ServerMessage};
pub use subscription::{Subscription, SubscriptionId, SubscriptionRegistry};
pub use suspend::{SuspendMonitor, SuspendSignal};
pub use transport::{
    CloseStatus, Transport, TransportError, TransportEvents, TransportFactory, WebSocketTransport,
    WebSocketTransportFactory,
};
