// Session types

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::error::{Result, SessionError};

/// Authentication state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Unauthenticated,
    Authenticating,
    Authenticated,
    Refreshing,
    /// Access token known to be rejected or past its expiry; refresh pending
    Expired,
}

impl SessionState {
    /// States `initialize()` is allowed to finish in
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Unauthenticated | SessionState::Authenticated
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Unauthenticated => "unauthenticated",
            SessionState::Authenticating => "authenticating",
            SessionState::Authenticated => "authenticated",
            SessionState::Refreshing => "refreshing",
            SessionState::Expired => "expired",
        };
        f.write_str(name)
    }
}

/// In-memory session; callers only ever see snapshots
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub user: Option<UserProfile>,
    pub state: SessionState,
}

impl Session {
    pub fn is_authenticated(&self) -> bool {
        self.state == SessionState::Authenticated
    }

    /// Id of the signed-in user, if a real profile is loaded
    pub fn subject_id(&self) -> Option<&str> {
        self.user
            .as_ref()
            .filter(|u| !u.placeholder)
            .map(|u| u.id.as_str())
    }
}

impl Default for Session {
    fn default() -> Self {
        Self {
            access_token: None,
            refresh_token: None,
            user: None,
            state: SessionState::Unauthenticated,
        }
    }
}

/// Profile of the signed-in user
///
/// Only `id` is interpreted; everything else is carried through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,

    #[serde(flatten)]
    pub attributes: Map<String, Value>,

    /// Stand-in used until the real profile is fetched
    #[serde(skip)]
    pub placeholder: bool,
}

impl UserProfile {
    pub fn placeholder(subject: Option<String>) -> Self {
        Self {
            id: subject.unwrap_or_default(),
            attributes: Map::new(),
            placeholder: true,
        }
    }

    /// Best human-readable name the profile offers
    pub fn display_name(&self) -> Option<&str> {
        ["displayName", "name", "fullName", "email"]
            .iter()
            .find_map(|key| self.attributes.get(*key).and_then(Value::as_str))
    }
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {}",
            other
        ))),
    }
}

/// Username/password pair submitted to the login endpoint
#[derive(Clone)]
pub struct LoginCredentials {
    pub username: String,
    pub password: String,
}

impl LoginCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.username.trim().is_empty() {
            return Err(SessionError::InvalidInput(
                "username must not be empty".to_string(),
            ));
        }
        if self.password.is_empty() {
            return Err(SessionError::InvalidInput(
                "password must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for LoginCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Token data from a login or refresh response
#[derive(Debug, Clone)]
pub struct TokenData {
    pub access_token: String,
    pub refresh_token: Option<String>,
}

/// Login request body
#[derive(Serialize)]
pub struct LoginRequest<'a> {
    pub username: &'a str,
    pub password: &'a str,
}

/// Login response body
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    #[serde(alias = "access_token")]
    pub access_token: String,
    #[serde(default, alias = "refresh_token")]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub user: Option<UserProfile>,
}

/// Refresh request body
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest<'a> {
    pub refresh_token: &'a str,
}

/// Refresh response body
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResponse {
    #[serde(alias = "access_token")]
    pub access_token: String,
    #[serde(default, alias = "refresh_token")]
    pub refresh_token: Option<String>,
}
