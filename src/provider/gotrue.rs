//! GoTrue auth REST client.
//!
//! Thin HTTP wrapper for `/auth/v1`. Response parsing and error
//! classification are pure functions so they can be tested without a server.
//! Successful session-changing calls persist the session and notify
//! subscribers, the way a browser auth client would. Sign-out forgets the
//! session locally before asking the server to revoke it.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use reqwest::{Method, RequestBuilder};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::storage::SessionStorage;
use super::types::{
    AuthChange, AuthEvent, Identity, OtpOptions, ProviderError, Session, SignUpOutcome, UserMetadata, now_epoch_secs,
};
use super::{AuthListeners, IdentityProvider, Subscription};
use crate::config::Config;
use crate::retry::{RetryPolicy, retry_with_backoff};

const REQUEST_TIMEOUT_SECS: u64 = 30;
const CONNECT_TIMEOUT_SECS: u64 = 10;
const CLIENT_INFO: &str = concat!("league-auth/", env!("CARGO_PKG_VERSION"));
const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

/// Refresh this many seconds before the access token expires.
pub const AUTO_REFRESH_MARGIN_SECS: i64 = 60;
/// How often the auto-refresh task checks the stored session.
pub const AUTO_REFRESH_TICK_SECS: u64 = 30;

// =============================================================================
// CLIENT
// =============================================================================

pub struct GoTrueClient {
    http: reqwest::Client,
    auth_url: String,
    api_key: String,
    storage: SessionStorage,
    listeners: Arc<AuthListeners>,
    retry: RetryPolicy,
}

impl GoTrueClient {
    /// Build a client for `{base_url}/auth/v1`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(
        base_url: &str,
        api_key: String,
        storage: SessionStorage,
        retry: RetryPolicy,
    ) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|e| ProviderError::HttpClientBuild(e.to_string()))?;
        Ok(Self {
            http,
            auth_url: format!("{}/auth/v1", base_url.trim_end_matches('/')),
            api_key,
            storage,
            listeners: AuthListeners::new(),
            retry,
        })
    }

    /// Build a client from typed config. Uses file storage when
    /// `SESSION_STORAGE_PATH` was set, memory otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn from_config(config: &Config) -> Result<Self, ProviderError> {
        let storage = match &config.session_storage_path {
            Some(path) => SessionStorage::file(path),
            None => SessionStorage::memory(),
        };
        Self::new(&config.supabase_url, config.supabase_anon_key.clone(), storage, config.retry)
    }

    /// Spawn a background task that refreshes the stored session shortly
    /// before it expires. Returns a handle for shutdown.
    pub fn spawn_auto_refresh(self: &Arc<Self>) -> JoinHandle<()> {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(AUTO_REFRESH_TICK_SECS));
            loop {
                interval.tick().await;
                client.refresh_if_due().await;
            }
        })
    }

    async fn refresh_if_due(&self) {
        let session = match self.storage.load().await {
            Ok(Some(session)) => session,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "auto-refresh could not read stored session");
                return;
            }
        };
        if session.refresh_token.is_empty() || session.expires_in(now_epoch_secs()) > AUTO_REFRESH_MARGIN_SECS {
            return;
        }
        match self.refresh_session(&session.refresh_token).await {
            Ok(_) => debug!("session auto-refreshed"),
            Err(e) if e.is_auth_rejection() => self.forget_session("refresh token rejected").await,
            Err(e) => warn!(error = %e, "session auto-refresh failed"),
        }
    }

    /// Exchange a refresh token for a new session, persist it and notify
    /// subscribers with [`AuthEvent::TokenRefreshed`].
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::InvalidCredentials`] for a revoked refresh
    /// token, or a transport error after retries.
    pub async fn refresh_session(&self, refresh_token: &str) -> Result<Session, ProviderError> {
        let body = serde_json::json!({ "refresh_token": refresh_token });
        let text = retry_with_backoff(self.retry, || {
            self.post("token", &[("grant_type", "refresh_token")], &body, None)
        })
        .await?;
        let session = parse_session(&text, now_epoch_secs())?;
        self.storage.save(&session).await?;
        self.listeners
            .notify(&AuthChange::new(AuthEvent::TokenRefreshed, Some(session.clone())));
        Ok(session)
    }

    async fn forget_session(&self, reason: &str) {
        info!(reason, "clearing stored session");
        if let Err(e) = self.storage.clear().await {
            warn!(error = %e, "failed to clear stored session");
        }
        self.listeners.notify(&AuthChange::signed_out());
    }

    fn request(&self, method: Method, path: &str, bearer: Option<&str>) -> RequestBuilder {
        self.http
            .request(method, format!("{}/{path}", self.auth_url))
            .header("apikey", &self.api_key)
            .header("X-Client-Info", CLIENT_INFO)
            .bearer_auth(bearer.unwrap_or(&self.api_key))
    }

    async fn post<B>(
        &self,
        path: &str,
        query: &[(&str, &str)],
        body: &B,
        bearer: Option<&str>,
    ) -> Result<String, ProviderError>
    where
        B: Serialize + ?Sized,
    {
        send(self.request(Method::POST, path, bearer).query(query).json(body)).await
    }

    /// Look up the user an access token belongs to.
    async fn fetch_user(&self, access_token: &str) -> Result<Identity, ProviderError> {
        let text = send(self.request(Method::GET, "user", Some(access_token))).await?;
        serde_json::from_str(&text).map_err(|e| ProviderError::Parse(e.to_string()))
    }
}

async fn send(request: RequestBuilder) -> Result<String, ProviderError> {
    let response = request.send().await?;
    let status = response.status().as_u16();
    let text = response.text().await?;

    if !(200..300).contains(&status) {
        return Err(classify_error(status, &text));
    }
    Ok(text)
}

#[async_trait::async_trait]
impl IdentityProvider for GoTrueClient {
    async fn get_session(&self) -> Result<Option<Session>, ProviderError> {
        let Some(session) = self.storage.load().await? else {
            return Ok(None);
        };
        if !session.is_expired(now_epoch_secs()) || session.refresh_token.is_empty() {
            return Ok(Some(session));
        }
        match self.refresh_session(&session.refresh_token).await {
            Ok(refreshed) => Ok(Some(refreshed)),
            Err(e) if e.is_auth_rejection() => {
                self.forget_session("stored session expired and refresh was rejected")
                    .await;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn subscribe(&self) -> Subscription {
        self.listeners.subscribe()
    }

    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: &UserMetadata,
        redirect_to: Option<&str>,
    ) -> Result<SignUpOutcome, ProviderError> {
        let body = SignUpRequest { email, password, data: metadata };
        let query: Vec<(&str, &str)> = redirect_to.map(|r| ("redirect_to", r)).into_iter().collect();
        let text = self.post("signup", &query, &body, None).await?;
        let outcome = parse_sign_up(&text, now_epoch_secs())?;
        if let Some(session) = &outcome.session {
            self.storage.save(session).await?;
            self.listeners
                .notify(&AuthChange::new(AuthEvent::SignedIn, Some(session.clone())));
        }
        Ok(outcome)
    }

    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session, ProviderError> {
        let body = PasswordRequest { email, password };
        let text = self
            .post("token", &[("grant_type", "password")], &body, None)
            .await?;
        let session = parse_session(&text, now_epoch_secs())?;
        self.storage.save(&session).await?;
        self.listeners
            .notify(&AuthChange::new(AuthEvent::SignedIn, Some(session.clone())));
        Ok(session)
    }

    async fn set_session(&self, access_token: &str, refresh_token: &str) -> Result<Session, ProviderError> {
        let now = now_epoch_secs();
        let expires_at = token_expiry(access_token);
        let session = if expires_at.is_some_and(|exp| exp <= now) {
            debug!("callback access token already expired, refreshing");
            let body = serde_json::json!({ "refresh_token": refresh_token });
            let text = self
                .post("token", &[("grant_type", "refresh_token")], &body, None)
                .await?;
            parse_session(&text, now)?
        } else {
            let identity = self.fetch_user(access_token).await?;
            Session {
                access_token: access_token.to_string(),
                refresh_token: refresh_token.to_string(),
                token_type: "bearer".into(),
                expires_at: expires_at.unwrap_or(now + DEFAULT_EXPIRES_IN_SECS),
                identity,
            }
        };
        self.storage.save(&session).await?;
        self.listeners
            .notify(&AuthChange::new(AuthEvent::SignedIn, Some(session.clone())));
        Ok(session)
    }

    async fn sign_in_with_otp(&self, email: &str, options: &OtpOptions) -> Result<(), ProviderError> {
        let body = OtpRequest { email, create_user: options.create_user, data: options.metadata.as_ref() };
        let query: Vec<(&str, &str)> = options
            .redirect_to
            .as_deref()
            .map(|r| ("redirect_to", r))
            .into_iter()
            .collect();
        self.post("otp", &query, &body, None).await?;
        Ok(())
    }

    async fn sign_out(&self) -> Result<(), ProviderError> {
        let stored = match self.storage.load().await {
            Ok(stored) => stored,
            Err(e) => {
                warn!(error = %e, "could not read stored session before sign-out");
                None
            }
        };
        self.forget_session("signed out").await;

        let Some(session) = stored else {
            return Ok(());
        };
        let token = session.access_token.as_str();
        let empty = serde_json::json!({});
        retry_with_backoff(self.retry, || self.post("logout", &[], &empty, Some(token)))
            .await
            .map(|_| ())
            .or_else(ignore_stale_token)
    }

    async fn clear_local_session(&self) {
        if let Err(e) = self.storage.clear().await {
            warn!(error = %e, "failed to clear stored session");
        }
    }
}

/// Logout with a token the server no longer knows is already a logout.
fn ignore_stale_token(e: ProviderError) -> Result<(), ProviderError> {
    match e {
        ProviderError::InvalidCredentials | ProviderError::Api { status: 401 | 403 | 404, .. } => Ok(()),
        other => Err(other),
    }
}

// =============================================================================
// WIRE TYPES
// =============================================================================

#[derive(Serialize)]
struct PasswordRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
struct SignUpRequest<'a> {
    email: &'a str,
    password: &'a str,
    data: &'a UserMetadata,
}

#[derive(Serialize)]
struct OtpRequest<'a> {
    email: &'a str,
    create_user: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<&'a UserMetadata>,
}

#[derive(Deserialize)]
struct WireSession {
    access_token: String,
    #[serde(default)]
    refresh_token: String,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    expires_at: Option<i64>,
    user: Identity,
}

impl WireSession {
    fn into_session(self, now_epoch_secs: i64) -> Session {
        let expires_at = self
            .expires_at
            .unwrap_or_else(|| now_epoch_secs + self.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS));
        Session {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            token_type: self.token_type.unwrap_or_else(|| "bearer".into()),
            expires_at,
            identity: self.user,
        }
    }
}

#[derive(Deserialize, Default)]
struct WireError {
    error: Option<String>,
    error_code: Option<String>,
    error_description: Option<String>,
    msg: Option<String>,
    message: Option<String>,
}

// =============================================================================
// PARSING
// =============================================================================

/// Parse a `/token` response into a [`Session`]. `expires_at` falls back to
/// `now + expires_in` for servers that only send the relative value.
pub(crate) fn parse_session(body: &str, now_epoch_secs: i64) -> Result<Session, ProviderError> {
    let wire: WireSession = serde_json::from_str(body).map_err(|e| ProviderError::Parse(e.to_string()))?;
    Ok(wire.into_session(now_epoch_secs))
}

/// `exp` claim of a JWT access token, if it carries a readable one. The
/// signature is not checked; the server does that on every request.
pub(crate) fn token_expiry(access_token: &str) -> Option<i64> {
    #[derive(Deserialize)]
    struct Claims {
        exp: i64,
    }

    let payload = access_token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    serde_json::from_slice::<Claims>(&bytes)
        .ok()
        .map(|claims| claims.exp)
}

/// Parse a `/signup` response. Auto-confirmed projects return a full session;
/// otherwise the body is the bare user, or `{ "user": ..., "session": null }`.
pub(crate) fn parse_sign_up(body: &str, now_epoch_secs: i64) -> Result<SignUpOutcome, ProviderError> {
    let value: serde_json::Value = serde_json::from_str(body).map_err(|e| ProviderError::Parse(e.to_string()))?;

    if value.get("access_token").is_some_and(|t| !t.is_null()) {
        let wire: WireSession = serde_json::from_value(value).map_err(|e| ProviderError::Parse(e.to_string()))?;
        let session = wire.into_session(now_epoch_secs);
        return Ok(SignUpOutcome { identity: session.identity.clone(), session: Some(session) });
    }

    let user = match value.get("user") {
        Some(user) if user.is_object() => user.clone(),
        _ => value,
    };
    let identity: Identity = serde_json::from_value(user).map_err(|e| ProviderError::Parse(e.to_string()))?;
    Ok(SignUpOutcome { identity, session: None })
}

/// Map a non-success response onto a [`ProviderError`]. GoTrue has used both
/// `{error, error_description}` and `{error_code, msg}` shapes over time.
pub(crate) fn classify_error(status: u16, body: &str) -> ProviderError {
    let wire: WireError = serde_json::from_str(body).unwrap_or_default();
    let code = wire
        .error_code
        .as_deref()
        .or(wire.error.as_deref())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let message = wire
        .msg
        .or(wire.error_description)
        .or(wire.message)
        .unwrap_or_else(|| body.trim().to_string());
    let lower = message.to_ascii_lowercase();

    if code == "email_not_confirmed" || lower.contains("email not confirmed") {
        ProviderError::EmailNotConfirmed
    } else if code == "user_already_exists" || lower.contains("already registered") {
        ProviderError::AlreadyRegistered
    } else if matches!(
        code.as_str(),
        "invalid_credentials" | "invalid_grant" | "refresh_token_not_found" | "refresh_token_already_used"
    ) || lower.contains("invalid login credentials")
    {
        ProviderError::InvalidCredentials
    } else if status == 408 {
        ProviderError::Timeout
    } else {
        ProviderError::Api { status, message }
    }
}

#[cfg(test)]
#[path = "gotrue_test.rs"]
mod tests;
