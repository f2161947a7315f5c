//! Principal identity and id newtypes
//!
//! The identity provider is an external collaborator: it supplies the
//! authenticated principal used to stamp outbound envelopes and channel
//! endpoint addresses.

use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display};

/// Identifier of a user (operator)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    /// Create a new user id
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identifier of a group (room)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(pub String);

impl GroupId {
    /// Create a new group id
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for GroupId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// The authenticated principal
#[derive(Clone, Serialize, Deserialize)]
pub struct Principal {
    /// User id stamped on every outbound envelope
    pub user_id: UserId,
    /// Login name sent in `auth` messages
    pub username: String,
    /// Session token asserted on channel endpoints
    pub token: String,
}

impl Debug for Principal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Principal")
            .field("user_id", &self.user_id)
            .field("username", &self.username)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Description of the local client sent with `auth`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Operating system family
    pub platform: String,
    /// Client name and version
    pub client: String,
}

impl DeviceInfo {
    /// Describe the running process
    #[must_use]
    pub fn current() -> Self {
        Self {
            platform: std::env::consts::OS.to_string(),
            client: format!("fieldlink/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Supplies the authenticated principal
pub trait IdentityProvider: Send + Sync {
    /// Current principal, `None` when signed out
    fn principal(&self) -> Option<Principal>;

    /// Device description for `auth` messages
    fn device_info(&self) -> DeviceInfo {
        DeviceInfo::current()
    }
}

/// Fixed principal, for CLIs and tests
#[derive(Debug, Clone)]
pub struct StaticIdentity {
    principal: Principal,
}

impl StaticIdentity {
    /// Create a provider that always returns the same principal
    pub fn new(user_id: impl Into<String>, token: impl Into<String>) -> Self {
        let user_id = user_id.into();
        Self {
            principal: Principal {
                user_id: UserId::new(user_id.clone()),
                username: user_id,
                token: token.into(),
            },
        }
    }

    /// Parse `user[:token]`
    ///
    /// # Errors
    ///
    /// Returns error if the user part is empty
    pub fn parse(value: &str) -> anyhow::Result<Self> {
        let (user, token) = value.split_once(':').unwrap_or((value, ""));
        if user.trim().is_empty() {
            anyhow::bail!("identity must name a user, got {value:?}");
        }
        Ok(Self::new(user.trim(), token))
    }
}

impl IdentityProvider for StaticIdentity {
    fn principal(&self) -> Option<Principal> {
        Some(self.principal.clone())
    }
}

/// Conversation id for a pair of participants.
///
/// Order independent, so both sides resolve the same id.
#[must_use]
pub fn conversation_id(a: &UserId, b: &UserId) -> String {
    let (low, high) = if a <= b { (a, b) } else { (b, a) };
    format!("dm:{}:{}", low, high)
}
