//! Client SDK for the Real-Time Activity (RTA) notification service.
//!
//! The crate is organized by concern:
//! - `rta`: subscription engine, connection manager, and websocket transport.
//! - `retry`: shared backoff policy for reconnects and subscribe retries.

/// Backoff helpers used across the SDK.
pub mod retry;
/// RTA subscription engine and its public surface.
pub mod rta;

pub use rta::{
    Completion, ConnectionState, RtaConfig, RtaError, RtaManager, RtaManagerOptions, StaticUser,
    Subscription, SubscriptionId, UserIdentity,
};
