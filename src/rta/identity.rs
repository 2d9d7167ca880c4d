//! Signed-in user identities.
//!
//! Each connection owns its own copy of the identity so credential refresh on
//! one connection never races with another.

use std::fmt;
use std::sync::Arc;

use secrecy::SecretString;

use crate::rta::error::RtaError;

/// Identity of a signed-in user, as consumed by the RTA engine.
pub trait UserIdentity: Send + Sync + 'static {
    /// Stable numeric identity. One connection exists per distinct value.
    fn user_id(&self) -> u64;

    /// Produces an independent handle to the same identity.
    fn try_clone_identity(&self) -> Result<Arc<dyn UserIdentity>, RtaError>;

    /// Authorization value presented on the websocket upgrade, if any.
    fn authorization(&self) -> Option<SecretString> {
        None
    }
}

/// Identity backed by a fixed user id and optional static token.
#[derive(Clone)]
pub struct StaticUser {
    user_id: u64,
    authorization: Option<SecretString>,
}

impl StaticUser {
    pub fn new(user_id: u64) -> Self {
        Self {
            user_id,
            authorization: None,
        }
    }

    /// Attaches an authorization value sent with every connect.
    pub fn with_authorization(mut self, authorization: SecretString) -> Self {
        self.authorization = Some(authorization);
        self
    }
}

impl fmt::Debug for StaticUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticUser")
            .field("user_id", &self.user_id)
            .field("authorization", &self.authorization.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl UserIdentity for StaticUser {
    fn user_id(&self) -> u64 {
        self.user_id
    }

    fn try_clone_identity(&self) -> Result<Arc<dyn UserIdentity>, RtaError> {
        Ok(Arc::new(self.clone()))
    }

    fn authorization(&self) -> Option<SecretString> {
        self.authorization.clone()
    }
}
