use thiserror::Error;

use crate::rta::proto::ErrorCode;

/// Errors surfaced by the RTA engine.
///
/// Values are cloneable because a single handshake outcome is delivered to
/// every caller whose intent was collapsed into that handshake.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RtaError {
    /// The service rejected a subscribe or unsubscribe handshake.
    #[error("rta service rejected the request: {0}")]
    Service(ErrorCode),

    /// The transport dropped while the operation was in flight.
    #[error("transport error: {0}")]
    Transport(String),

    /// The owning connection was torn down before the operation completed.
    #[error("operation aborted")]
    Aborted,

    /// The user identity could not be copied for a new connection.
    #[error("identity error: {0}")]
    Identity(String),

    /// The subscription id is not registered with the manager.
    #[error("unknown subscription")]
    UnknownSubscription,

    /// No tokio runtime was available to host connection workers.
    #[error("runtime unavailable: {0}")]
    Runtime(String),
}

impl RtaError {
    /// Maps a handshake result code into a completion outcome.
    pub fn from_service_code(code: ErrorCode) -> Result<(), RtaError> {
        if code.is_success() {
            Ok(())
        } else {
            Err(RtaError::Service(code))
        }
    }

    /// Returns `true` for service rejections that indicate a client defect
    /// rather than a transient condition.
    pub fn is_defect(&self) -> bool {
        matches!(
            self,
            RtaError::Service(
                ErrorCode::UnknownResource
                    | ErrorCode::SubscriptionLimitReached
                    | ErrorCode::NoResourceData
            )
        )
    }
}
