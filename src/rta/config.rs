use std::time::Duration;

use crate::retry::BackoffPolicy;

/// Production websocket endpoint for the RTA service.
pub const RTA_ENDPOINT: &str = "wss://rta.xboxlive.com/connect";
/// Websocket subprotocol spoken by the RTA service.
pub const RTA_SUBPROTOCOL: &str = "rta.xboxlive.com.V2";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RtaDefaults;

impl RtaDefaults {
    /// The service ends sessions after two hours; rotate well before that.
    pub const CONNECTION_LIFETIME: Duration = Duration::from_secs(90 * 60);
    pub const BACKOFF_UNIT: Duration = Duration::from_secs(1);
    pub const MAX_BACKOFF: Duration = Duration::from_secs(60);
    /// Failed connects tolerated before `Disconnected` is reported.
    pub const DISCONNECTED_AFTER_ATTEMPTS: u32 = 3;
}

/// Connection settings shared by every connection a manager creates.
#[derive(Clone, Debug)]
pub struct RtaConfig {
    pub endpoint: String,
    pub subprotocol: String,
    /// Continuous connected time after which the connection is rotated.
    pub connection_lifetime: Duration,
    /// Backoff for both reconnects and retryable subscribe failures.
    pub backoff: BackoffPolicy,
    pub disconnected_after_attempts: u32,
}

impl Default for RtaConfig {
    fn default() -> Self {
        Self {
            endpoint: RTA_ENDPOINT.to_string(),
            subprotocol: RTA_SUBPROTOCOL.to_string(),
            connection_lifetime: RtaDefaults::CONNECTION_LIFETIME,
            backoff: BackoffPolicy {
                unit: RtaDefaults::BACKOFF_UNIT,
                max_backoff: RtaDefaults::MAX_BACKOFF,
            },
            disconnected_after_attempts: RtaDefaults::DISCONNECTED_AFTER_ATTEMPTS,
        }
    }
}

impl RtaConfig {
    /// Sets an explicit endpoint override, eg for a local mock service.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        self.endpoint = endpoint.trim_end().to_string();
        self
    }

    pub fn with_connection_lifetime(mut self, lifetime: Duration) -> Self {
        self.connection_lifetime = lifetime;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }
}
