//! Session manager — the single source of truth for who is logged in.
//!
//! ARCHITECTURE
//! ============
//! The manager owns a `watch` channel holding the current
//! [`SessionSnapshot`] and is its only writer. It reconciles that state
//! against an injected [`IdentityProvider`] on startup ([`initialize`]) and
//! on every provider notification ([`on_auth_event`]), and makes sure each
//! identity it adopts has a profile in the [`ProfileStore`].
//!
//! Cancellation is a generation counter. Every sync captures the generation
//! when it starts and only writes if it is unchanged; [`teardown`] and
//! [`sign_out`] bump it, so a torn-down manager or a signed-out user never
//! sees a late result land.
//!
//! Provider notifications that were already queued when the user signed out
//! are discarded too. The pump sees each change with the stamp it was queued
//! under, and [`sign_out`] records the last stamp issued before it, so a
//! stale `SignedIn` sitting in the queue cannot bring the old identity back.
//!
//! TRADE-OFFS
//! ==========
//! Startup and the first provider event may race. Both run the same
//! reconcile path and the later one simply overwrites the earlier one; they
//! derive from the same provider truth, so last-writer-wins is acceptable.
//!
//! [`initialize`]: SessionManager::initialize
//! [`on_auth_event`]: SessionManager::on_auth_event
//! [`teardown`]: SessionManager::teardown
//! [`sign_out`]: SessionManager::sign_out

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::profile;
use crate::config::{Config, SessionTimeouts};
use crate::provider::types::now_epoch_secs;
use crate::provider::{
    AuthChange, AuthEvent, Identity, IdentityProvider, NotifySequence, OtpOptions, ProviderError, Session,
    SignUpOutcome, UserMetadata,
};
use crate::state::SessionSnapshot;
use crate::store::{Profile, ProfileStore, ProfileUpdate, StoreError};

/// Shortest nickname the edit form accepts, in characters.
pub const NICKNAME_MIN_CHARS: usize = 3;
/// Longest nickname the edit form accepts, in characters.
pub const NICKNAME_MAX_CHARS: usize = 20;

// =============================================================================
// ERROR
// =============================================================================

/// Failure of a user-initiated action, returned to the caller for display.
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("invalid email address")]
    InvalidEmail,
    #[error("access and refresh tokens are required")]
    MissingTokens,
    #[error("nickname is required")]
    NicknameRequired,
    #[error("nickname must be 3-20 characters")]
    NicknameLength,
    #[error("nickname already in use")]
    NicknameTaken,
    #[error("no signed-in player")]
    NotSignedIn,
    #[error("auth request timed out")]
    Timeout,
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Store(StoreError),
}

impl ActionError {
    /// Short message suitable for showing next to a login or sign-up form.
    #[must_use]
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::InvalidEmail => "Enter a valid email address.",
            Self::MissingTokens => "This sign-in link is invalid or incomplete.",
            Self::NicknameRequired => "Nickname is required.",
            Self::NicknameLength => "Nickname must be between 3 and 20 characters.",
            Self::NicknameTaken => "This nickname is already in use.",
            Self::NotSignedIn => "Sign in to edit your profile.",
            Self::Store(_) => "Could not save your profile. Try again.",
            Self::Timeout | Self::Provider(ProviderError::Timeout) => "The request timed out. Try again.",
            Self::Provider(ProviderError::InvalidCredentials) => "Invalid credentials. Check your email and password.",
            Self::Provider(ProviderError::EmailNotConfirmed) => "Confirm your email address before signing in.",
            Self::Provider(ProviderError::AlreadyRegistered) => "This email is already registered.",
            Self::Provider(ProviderError::Network(_)) => "Connection error. Check your internet and try again.",
            Self::Provider(_) => "Something went wrong. Try again.",
        }
    }
}

/// Trim and lowercase an email, rejecting anything without exactly one `@`
/// separating two non-empty parts.
#[must_use]
pub fn normalize_email(email: &str) -> Option<String> {
    let normalized = email.trim().to_ascii_lowercase();
    let (local, domain) = normalized.split_once('@')?;
    if local.is_empty() || domain.is_empty() || domain.contains('@') {
        return None;
    }
    Some(normalized)
}

/// Trim a nickname from the edit form and check its length.
///
/// # Errors
///
/// Returns [`ActionError::NicknameRequired`] for a blank nickname and
/// [`ActionError::NicknameLength`] when it is outside
/// [`NICKNAME_MIN_CHARS`]..=[`NICKNAME_MAX_CHARS`] characters.
pub fn validate_nickname(nickname: &str) -> Result<String, ActionError> {
    let nickname = nickname.trim();
    if nickname.is_empty() {
        return Err(ActionError::NicknameRequired);
    }
    let chars = nickname.chars().count();
    if !(NICKNAME_MIN_CHARS..=NICKNAME_MAX_CHARS).contains(&chars) {
        return Err(ActionError::NicknameLength);
    }
    Ok(nickname.to_string())
}

// =============================================================================
// SESSION MANAGER
// =============================================================================

/// Running pump task plus the sequence of the subscription it drains.
struct EventPump {
    task: JoinHandle<()>,
    sequence: NotifySequence,
}

pub struct SessionManager {
    provider: Arc<dyn IdentityProvider>,
    store: Arc<dyn ProfileStore>,
    timeouts: SessionTimeouts,
    email_redirect: Option<String>,
    state: watch::Sender<SessionSnapshot>,
    generation: AtomicU64,
    /// Notifications stamped at or below this were queued before a sign-out.
    signed_out_through: AtomicU64,
    torn_down: AtomicBool,
    initialized: AtomicBool,
    /// Serializes event handling: one event at a time, in arrival order.
    event_lock: tokio::sync::Mutex<()>,
    pump: Mutex<Option<EventPump>>,
}

impl SessionManager {
    #[must_use]
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        store: Arc<dyn ProfileStore>,
        timeouts: SessionTimeouts,
        email_redirect: Option<String>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(SessionSnapshot::initializing());
        Arc::new(Self {
            provider,
            store,
            timeouts,
            email_redirect,
            state,
            generation: AtomicU64::new(0),
            signed_out_through: AtomicU64::new(0),
            torn_down: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            event_lock: tokio::sync::Mutex::new(()),
            pump: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn from_config(
        provider: Arc<dyn IdentityProvider>,
        store: Arc<dyn ProfileStore>,
        config: &Config,
    ) -> Arc<Self> {
        Self::new(provider, store, config.timeouts, Some(config.email_redirect_url()))
    }

    // -------------------------------------------------------------------------
    // Read side
    // -------------------------------------------------------------------------

    /// Current state.
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        self.state.borrow().clone()
    }

    /// Receiver that observes every state change.
    #[must_use]
    pub fn subscribe_snapshots(&self) -> watch::Receiver<SessionSnapshot> {
        self.state.subscribe()
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Subscribe to provider notifications, then establish the startup
    /// session. Bounded by the init timeout: if the provider never answers,
    /// loading still ends and identity/profile keep their prior values.
    /// Calling it again is a no-op.
    pub async fn initialize(self: &Arc<Self>) {
        if self.initialized.swap(true, Ordering::SeqCst) {
            debug!("session manager already initialized");
            return;
        }
        self.start_event_pump();

        let generation = self.current_generation();
        let sync = async {
            let session = match self.provider.get_session().await {
                Ok(session) => session,
                Err(e) => {
                    warn!(error = %e, "could not read current session");
                    None
                }
            };
            self.reconcile(generation, session, true).await;
        };

        if tokio::time::timeout(self.timeouts.init, sync).await.is_err() {
            warn!(timeout_ms = self.timeouts.init.as_millis(), "initial session check timed out");
            self.apply(generation, SessionSnapshot::settle);
        }
    }

    /// Apply one provider notification. Token refreshes update the identity
    /// but never re-read the profile; every other event ensures one exists.
    pub async fn on_auth_event(&self, change: AuthChange) {
        self.handle_event(None, change).await;
    }

    async fn handle_event(&self, stamp: Option<u64>, change: AuthChange) {
        let _guard = self.event_lock.lock().await;
        if self.torn_down.load(Ordering::SeqCst) {
            return;
        }
        // Generation first: a sign-out after this point makes the sync stale,
        // one before it has already moved the cutoff.
        let generation = self.current_generation();
        if stamp.is_some_and(|stamp| stamp <= self.signed_out_through.load(Ordering::SeqCst)) {
            debug!(event = ?change.event, "dropping auth change queued before sign-out");
            return;
        }
        debug!(event = ?change.event, has_session = change.session.is_some(), "auth state changed");

        self.apply(generation, SessionSnapshot::begin_sync);
        let load_profile = change.event != AuthEvent::TokenRefreshed;
        let sync = self.reconcile(generation, change.session, load_profile);

        if tokio::time::timeout(self.timeouts.sync, sync).await.is_err() {
            warn!(event = ?change.event, timeout_ms = self.timeouts.sync.as_millis(), "auth event sync timed out");
            self.apply(generation, SessionSnapshot::settle);
        }
    }

    /// Ensure `identity` has a profile and adopt it if `identity` is still
    /// the current one.
    pub async fn ensure_profile(&self, identity: &Identity) -> Option<Profile> {
        let generation = self.current_generation();
        let found = profile::ensure_profile(self.store.as_ref(), identity).await;
        let adopted = found.clone();
        self.apply(generation, |s| {
            if s.identity.as_ref().is_some_and(|i| i.id == identity.id) {
                s.profile = adopted;
            }
        });
        found
    }

    /// Stop listening to the provider and drop any in-flight results.
    pub fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(pump) = self.take_pump() {
            pump.task.abort();
        }
        info!("session manager torn down");
    }

    // -------------------------------------------------------------------------
    // Actions
    // -------------------------------------------------------------------------

    /// Register a new account and eagerly create its profile. A profile
    /// failure is logged only; the next sync repairs it.
    ///
    /// # Errors
    ///
    /// Returns an [`ActionError`] for a malformed email, a provider refusal,
    /// or a timeout.
    pub async fn sign_up(
        &self,
        email: &str,
        password: &str,
        display_name: &str,
    ) -> Result<SignUpOutcome, ActionError> {
        let email = normalize_email(email).ok_or(ActionError::InvalidEmail)?;
        let metadata = UserMetadata::with_nickname(display_name.trim());
        let outcome = self
            .timed(
                self.provider
                    .sign_up(&email, password, &metadata, self.email_redirect.as_deref()),
            )
            .await?;
        info!(user_id = %outcome.identity.id, confirmed = outcome.session.is_some(), "signed up");

        let create = profile::create_profile(self.store.as_ref(), &outcome.identity, display_name);
        match tokio::time::timeout(self.timeouts.sync, create).await {
            Ok(Ok(created)) => debug!(user_id = %created.id, "profile created at sign-up"),
            Ok(Err(e)) => warn!(user_id = %outcome.identity.id, error = %e, "profile creation at sign-up failed"),
            Err(_) => warn!(user_id = %outcome.identity.id, "profile creation at sign-up timed out"),
        }
        Ok(outcome)
    }

    /// Sign in with email and password. State is updated by the provider's
    /// resulting `SignedIn` notification, not here.
    ///
    /// # Errors
    ///
    /// Returns an [`ActionError`] for a malformed email, rejected
    /// credentials, or a timeout.
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<Session, ActionError> {
        let email = normalize_email(email).ok_or(ActionError::InvalidEmail)?;
        let session = self
            .timed(self.provider.sign_in_with_password(&email, password))
            .await?;
        info!(user_id = %session.identity.id, "signed in");
        Ok(session)
    }

    /// Email a one-time sign-in link. An unknown email gets an account
    /// created on first use, without a nickname.
    ///
    /// # Errors
    ///
    /// Returns an [`ActionError`] for a malformed email, a provider refusal,
    /// or a timeout.
    pub async fn sign_in_with_magic_link(&self, email: &str) -> Result<(), ActionError> {
        let email = normalize_email(email).ok_or(ActionError::InvalidEmail)?;
        let options = OtpOptions { create_user: true, metadata: None, redirect_to: self.email_redirect.clone() };
        self.timed(self.provider.sign_in_with_otp(&email, &options))
            .await
    }

    /// Email a one-time link that creates the account on first use.
    ///
    /// # Errors
    ///
    /// Returns an [`ActionError`] for a malformed email, a provider refusal,
    /// or a timeout.
    pub async fn sign_up_with_magic_link(&self, email: &str, display_name: &str) -> Result<(), ActionError> {
        let email = normalize_email(email).ok_or(ActionError::InvalidEmail)?;
        let options = OtpOptions {
            create_user: true,
            metadata: Some(UserMetadata::with_nickname(display_name.trim())),
            redirect_to: self.email_redirect.clone(),
        };
        self.timed(self.provider.sign_in_with_otp(&email, &options))
            .await
    }

    /// Adopt the tokens an email-link callback delivered. Like [`sign_in`],
    /// state follows the provider's `SignedIn` notification.
    ///
    /// [`sign_in`]: Self::sign_in
    ///
    /// # Errors
    ///
    /// Returns [`ActionError::MissingTokens`] for a blank token, a provider
    /// refusal for expired or revoked tokens, or a timeout.
    pub async fn set_session(&self, access_token: &str, refresh_token: &str) -> Result<Session, ActionError> {
        let (access_token, refresh_token) = (access_token.trim(), refresh_token.trim());
        if access_token.is_empty() || refresh_token.is_empty() {
            return Err(ActionError::MissingTokens);
        }
        let session = self
            .timed(self.provider.set_session(access_token, refresh_token))
            .await?;
        info!(user_id = %session.identity.id, "session set from email link");
        Ok(session)
    }

    /// Change the signed-in player's nickname and position.
    ///
    /// # Errors
    ///
    /// Returns an [`ActionError`] for an invalid or taken nickname, when no
    /// one is signed in, or when the store fails or times out.
    pub async fn update_profile(&self, nickname: &str, position: Option<&str>) -> Result<Profile, ActionError> {
        let nickname = validate_nickname(nickname)?;
        let position = position
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string);
        self.write_profile(ProfileUpdate::Details { nickname, position })
            .await
    }

    /// Point the signed-in player's avatar at `avatar`, or remove it.
    ///
    /// # Errors
    ///
    /// Returns [`ActionError::NotSignedIn`] when no one is signed in, or the
    /// store failure once its retries are spent.
    pub async fn update_avatar(&self, avatar: Option<&str>) -> Result<Profile, ActionError> {
        let avatar = avatar
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(str::to_string);
        self.write_profile(ProfileUpdate::Avatar(avatar)).await
    }

    /// Clear the local session first, then revoke it remotely and drop the
    /// provider's cached artifacts. Always succeeds for the caller.
    pub async fn sign_out(&self) {
        if let Some(sequence) = self.pump_sequence() {
            self.signed_out_through
                .fetch_max(sequence.current(), Ordering::SeqCst);
        }
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.state.send_modify(SessionSnapshot::settle_anonymous);

        match tokio::time::timeout(self.timeouts.action, self.provider.sign_out()).await {
            Ok(Ok(())) => info!("signed out"),
            Ok(Err(e)) => warn!(error = %e, "remote sign-out failed, local session already cleared"),
            Err(_) => warn!("remote sign-out timed out, local session already cleared"),
        }
        self.provider.clear_local_session().await;
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn start_event_pump(self: &Arc<Self>) {
        let mut subscription = self.provider.subscribe();
        let sequence = subscription.sequence();
        let manager: Weak<Self> = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            while let Some((stamp, change)) = subscription.recv_stamped().await {
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.handle_event(Some(stamp), change).await;
            }
        });
        if let Some(previous) = self.lock_pump().replace(EventPump { task, sequence }) {
            previous.task.abort();
        }
    }

    /// Adopt `session` (or its absence) and settle. Expired sessions count as
    /// absent.
    async fn reconcile(&self, generation: u64, session: Option<Session>, load_profile: bool) {
        let session = session.filter(|s| {
            let live = !s.is_expired(now_epoch_secs());
            if !live {
                info!(user_id = %s.identity.id, "ignoring expired session");
            }
            live
        });
        let Some(session) = session else {
            self.apply(generation, SessionSnapshot::settle_anonymous);
            return;
        };

        let identity = session.identity;
        let adopted = identity.clone();
        self.apply(generation, |s| {
            if s.identity.as_ref().map(|i| i.id) != Some(adopted.id) {
                s.profile = None;
            }
            s.identity = Some(adopted);
        });

        if load_profile {
            let found = profile::ensure_profile(self.store.as_ref(), &identity).await;
            self.apply(generation, |s| {
                s.profile = found;
                s.settle();
            });
        } else {
            self.apply(generation, SessionSnapshot::settle);
        }
    }

    /// Persist `update` for the current identity and adopt the stored row if
    /// that identity is still signed in afterwards.
    async fn write_profile(&self, update: ProfileUpdate) -> Result<Profile, ActionError> {
        let generation = self.current_generation();
        let identity = self
            .state
            .borrow()
            .identity
            .clone()
            .ok_or(ActionError::NotSignedIn)?;

        let updated = match tokio::time::timeout(self.timeouts.action, self.store.update(identity.id, &update)).await {
            Ok(Ok(profile)) => profile,
            Ok(Err(StoreError::NicknameTaken(_))) => return Err(ActionError::NicknameTaken),
            Ok(Err(e)) => {
                warn!(user_id = %identity.id, error = %e, "profile update failed");
                return Err(ActionError::Store(e));
            }
            Err(_) => return Err(ActionError::Timeout),
        };
        info!(user_id = %identity.id, nickname = %updated.nickname, "profile updated");

        let adopted = updated.clone();
        self.apply(generation, |s| {
            if s.identity.as_ref().is_some_and(|i| i.id == identity.id) {
                s.profile = Some(adopted);
            }
        });
        Ok(updated)
    }

    /// Write to the state only if `generation` is still current. The check
    /// runs under the channel lock so it cannot interleave with `sign_out`.
    fn apply(&self, generation: u64, update: impl FnOnce(&mut SessionSnapshot)) -> bool {
        self.state.send_if_modified(|s| {
            if !self.is_current(generation) {
                debug!(generation, "dropping stale session update");
                return false;
            }
            update(s);
            true
        })
    }

    fn is_current(&self, generation: u64) -> bool {
        !self.torn_down.load(Ordering::SeqCst) && self.generation.load(Ordering::SeqCst) == generation
    }

    fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    async fn timed<T>(&self, call: impl Future<Output = Result<T, ProviderError>>) -> Result<T, ActionError> {
        match tokio::time::timeout(self.timeouts.action, call).await {
            Ok(result) => result.map_err(ActionError::from),
            Err(_) => Err(ActionError::Timeout),
        }
    }

    fn lock_pump(&self) -> std::sync::MutexGuard<'_, Option<EventPump>> {
        self.pump
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn take_pump(&self) -> Option<EventPump> {
        self.lock_pump().take()
    }

    fn pump_sequence(&self) -> Option<NotifySequence> {
        self.lock_pump().as_ref().map(|p| p.sequence.clone())
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        if let Some(pump) = self.take_pump() {
            pump.task.abort();
        }
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
