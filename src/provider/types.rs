//! Provider types — identities, sessions, auth events and errors.
//!
//! Wire-compatible with the GoTrue JSON shapes so the HTTP client can
//! deserialize responses directly into these structs.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

// =============================================================================
// ERROR
// =============================================================================

/// Errors produced by identity provider operations.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Email/password pair rejected, or a refresh token that is no longer valid.
    #[error("invalid credentials")]
    InvalidCredentials,

    /// The account exists but its email address has not been confirmed.
    #[error("email not confirmed")]
    EmailNotConfirmed,

    /// Sign-up attempted for an email that already has an account.
    #[error("user already registered")]
    AlreadyRegistered,

    /// The request never produced a response (DNS, connect, reset).
    #[error("network error: {0}")]
    Network(String),

    /// The request or a provider-side operation timed out.
    #[error("provider request timed out")]
    Timeout,

    /// The provider returned a non-success status we do not classify further.
    #[error("provider error: status {status}: {message}")]
    Api { status: u16, message: String },

    /// The provider response body could not be deserialized.
    #[error("provider response parse failed: {0}")]
    Parse(String),

    /// The underlying HTTP client could not be constructed.
    #[error("HTTP client build failed: {0}")]
    HttpClientBuild(String),

    /// Local session storage could not be read or written.
    #[error("session storage error: {0}")]
    Storage(#[from] super::storage::StorageError),
}

impl ProviderError {
    /// True when the provider rejected who the caller claims to be, as opposed
    /// to failing to answer at all.
    #[must_use]
    pub fn is_auth_rejection(&self) -> bool {
        matches!(self, Self::InvalidCredentials | Self::EmailNotConfirmed | Self::AlreadyRegistered)
    }
}

impl crate::retry::Retryable for ProviderError {
    fn retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout | Self::Api { status: 429 | 500..=599, .. })
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() { Self::Timeout } else { Self::Network(e.to_string()) }
    }
}

// =============================================================================
// IDENTITY
// =============================================================================

/// Free-form user metadata attached to an identity by the provider.
///
/// `nickname` is the only key the league reads; everything else is kept so a
/// round trip through storage does not lose data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl UserMetadata {
    #[must_use]
    pub fn with_nickname(nickname: impl Into<String>) -> Self {
        Self { nickname: Some(nickname.into()), extra: Map::new() }
    }
}

/// The provider's record of who is logged in. Created and destroyed by the
/// provider; the session manager only observes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: Uuid,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default, rename = "user_metadata")]
    pub metadata: UserMetadata,
}

impl Identity {
    /// Display-name hint from metadata, if it holds anything besides whitespace.
    #[must_use]
    pub fn nickname_hint(&self) -> Option<&str> {
        self.metadata
            .nickname
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
    }
}

// =============================================================================
// SESSION
// =============================================================================

/// An authenticated session issued by the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    /// Expiry as Unix epoch seconds.
    pub expires_at: i64,
    #[serde(rename = "user")]
    pub identity: Identity,
}

fn default_token_type() -> String {
    "bearer".into()
}

impl Session {
    /// A session is expired once the current time reaches `expires_at`.
    #[must_use]
    pub fn is_expired(&self, now_epoch_secs: i64) -> bool {
        self.expires_at <= now_epoch_secs
    }

    /// Seconds until expiry, negative once expired.
    #[must_use]
    pub fn expires_in(&self, now_epoch_secs: i64) -> i64 {
        self.expires_at - now_epoch_secs
    }
}

/// Current wall-clock time as Unix epoch seconds.
#[must_use]
pub fn now_epoch_secs() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

// =============================================================================
// AUTH EVENTS
// =============================================================================

/// Kinds of auth-state change the provider notifies subscribers about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthEvent {
    InitialSession,
    SignedIn,
    SignedOut,
    TokenRefreshed,
    UserUpdated,
    PasswordRecovery,
}

/// One notification: the event kind plus the session as it stands afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthChange {
    pub event: AuthEvent,
    pub session: Option<Session>,
}

impl AuthChange {
    #[must_use]
    pub fn new(event: AuthEvent, session: Option<Session>) -> Self {
        Self { event, session }
    }

    #[must_use]
    pub fn signed_out() -> Self {
        Self { event: AuthEvent::SignedOut, session: None }
    }
}

// =============================================================================
// ACTION PAYLOADS
// =============================================================================

/// Result of a provider sign-up. `session` is `None` when the provider requires
/// email confirmation before issuing tokens.
#[derive(Debug, Clone, PartialEq)]
pub struct SignUpOutcome {
    pub identity: Identity,
    pub session: Option<Session>,
}

/// Options for a one-time-password (magic link) email.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OtpOptions {
    /// Create the user if no account exists for the email.
    pub create_user: bool,
    /// Metadata to attach when a user is created.
    pub metadata: Option<UserMetadata>,
    /// Where the link in the email should land.
    pub redirect_to: Option<String>,
}

#[cfg(test)]
#[path = "types_test.rs"]
mod tests;
