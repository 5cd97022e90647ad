//! Cookie-session check responses.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The user context of a session response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserContext {
    /// Logged-in user name; absent or null for anonymous sessions.
    #[serde(default)]
    pub name: Option<String>,
    /// Roles granted to the user.
    #[serde(default)]
    pub roles: Vec<String>,
}

/// Response of a `GET _session` check.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// The session's user context.
    #[serde(default, rename = "userCtx")]
    pub user_ctx: Option<UserContext>,
}

impl SessionInfo {
    /// Interprets a response body. Anything unrecognisable counts as an
    /// anonymous session.
    pub fn from_value(value: &Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }

    /// The authenticated user's name, if there is one.
    pub fn user_name(&self) -> Option<&str> {
        self.user_ctx
            .as_ref()
            .and_then(|ctx| ctx.name.as_deref())
            .filter(|name| !name.is_empty())
    }

    /// Returns true if the session belongs to a named user.
    pub fn is_authenticated(&self) -> bool {
        self.user_name().is_some()
    }
}
