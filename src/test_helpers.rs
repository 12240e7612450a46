//! Test doubles and fixtures shared across module tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use uuid::Uuid;

use crate::config::SessionTimeouts;
use crate::provider::types::now_epoch_secs;
use crate::provider::{
    AuthChange, AuthEvent, AuthListeners, Identity, IdentityProvider, OtpOptions, ProviderError, Session,
    SignUpOutcome, Subscription, UserMetadata,
};
use crate::services::session::SessionManager;
use crate::state::SessionSnapshot;
use crate::store::{NewProfile, Profile, ProfileStore, ProfileUpdate, StoreError, FALLBACK_NICKNAME};

// =============================================================================
// FIXTURES
// =============================================================================

#[must_use]
pub fn identity(nickname: Option<&str>) -> Identity {
    Identity {
        id: Uuid::new_v4(),
        email: Some("player@league.test".into()),
        metadata: nickname.map(UserMetadata::with_nickname).unwrap_or_default(),
    }
}

#[must_use]
pub fn session_for(identity: &Identity, expires_at: i64) -> Session {
    Session {
        access_token: format!("access-{}", identity.id),
        refresh_token: format!("refresh-{}", identity.id),
        token_type: "bearer".into(),
        expires_at,
        identity: identity.clone(),
    }
}

/// Session valid for the next hour.
#[must_use]
pub fn valid_session(identity: &Identity) -> Session {
    session_for(identity, now_epoch_secs() + 3600)
}

/// Session that expired a minute ago.
#[must_use]
pub fn expired_session(identity: &Identity) -> Session {
    session_for(identity, now_epoch_secs() - 60)
}

#[must_use]
pub fn profile_for(identity: &Identity) -> Profile {
    Profile::from_new(&NewProfile::new(identity.id, identity.nickname_hint(), identity.email.as_deref()))
}

#[must_use]
pub fn test_timeouts() -> SessionTimeouts {
    SessionTimeouts { init: Duration::from_secs(5), sync: Duration::from_secs(10), action: Duration::from_secs(15) }
}

/// Manager wired to the given doubles with default test timeouts.
#[must_use]
pub fn manager(provider: &Arc<MockProvider>, store: &Arc<MemoryProfileStore>) -> Arc<SessionManager> {
    SessionManager::new(
        provider.clone(),
        store.clone(),
        test_timeouts(),
        Some("http://localhost:5173/auth/callback?redirect_to=/dashboard".into()),
    )
}

/// Wait (bounded) until the watched snapshot satisfies `pred`.
pub async fn wait_until<F>(rx: &mut watch::Receiver<SessionSnapshot>, pred: F) -> SessionSnapshot
where
    F: Fn(&SessionSnapshot) -> bool,
{
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            {
                let snap = rx.borrow_and_update();
                if pred(&snap) {
                    return snap.clone();
                }
            }
            rx.changed().await.expect("manager dropped");
        }
    })
    .await
    .expect("session state never matched")
}

// =============================================================================
// MockProvider
// =============================================================================

/// What `get_session` should do.
#[derive(Clone)]
pub enum SessionReply {
    Session(Session),
    NoSession,
    Fail,
    Hang,
}

pub struct MockProvider {
    pub listeners: Arc<AuthListeners>,
    reply: Mutex<SessionReply>,
    /// Session returned by a successful password sign-in; `None` rejects.
    sign_in_session: Mutex<Option<Session>>,
    /// Identity returned by sign-up; `None` means the email is taken.
    sign_up_identity: Mutex<Option<Identity>>,
    /// Identity the callback tokens resolve to; `None` rejects them.
    callback_identity: Mutex<Option<Identity>>,
    pub sign_out_fails: AtomicBool,
    pub get_session_calls: AtomicU32,
    pub sign_in_calls: AtomicU32,
    pub sign_up_calls: AtomicU32,
    pub sign_out_calls: AtomicU32,
    pub set_session_calls: AtomicU32,
    pub clear_calls: AtomicU32,
    pub set_session_requests: Mutex<Vec<(String, String)>>,
    pub sign_up_requests: Mutex<Vec<(String, UserMetadata, Option<String>)>>,
    pub otp_requests: Mutex<Vec<(String, OtpOptions)>>,
}

impl MockProvider {
    #[must_use]
    pub fn new(reply: SessionReply) -> Arc<Self> {
        Arc::new(Self {
            listeners: AuthListeners::new(),
            reply: Mutex::new(reply),
            sign_in_session: Mutex::new(None),
            sign_up_identity: Mutex::new(None),
            callback_identity: Mutex::new(None),
            sign_out_fails: AtomicBool::new(false),
            get_session_calls: AtomicU32::new(0),
            sign_in_calls: AtomicU32::new(0),
            sign_up_calls: AtomicU32::new(0),
            sign_out_calls: AtomicU32::new(0),
            set_session_calls: AtomicU32::new(0),
            clear_calls: AtomicU32::new(0),
            set_session_requests: Mutex::new(Vec::new()),
            sign_up_requests: Mutex::new(Vec::new()),
            otp_requests: Mutex::new(Vec::new()),
        })
    }

    pub fn set_sign_in_session(&self, session: Option<Session>) {
        *self.sign_in_session.lock().unwrap() = session;
    }

    pub fn set_sign_up_identity(&self, identity: Option<Identity>) {
        *self.sign_up_identity.lock().unwrap() = identity;
    }

    pub fn set_callback_identity(&self, identity: Option<Identity>) {
        *self.callback_identity.lock().unwrap() = identity;
    }

    /// Push a notification to every subscriber.
    pub fn emit(&self, event: AuthEvent, session: Option<Session>) {
        self.listeners.notify(&AuthChange::new(event, session));
    }
}

#[async_trait::async_trait]
impl IdentityProvider for MockProvider {
    async fn get_session(&self) -> Result<Option<Session>, ProviderError> {
        self.get_session_calls.fetch_add(1, Ordering::SeqCst);
        let reply = self.reply.lock().unwrap().clone();
        match reply {
            SessionReply::Session(session) => Ok(Some(session)),
            SessionReply::NoSession => Ok(None),
            SessionReply::Fail => Err(ProviderError::Network("connection refused".into())),
            SessionReply::Hang => std::future::pending().await,
        }
    }

    fn subscribe(&self) -> Subscription {
        self.listeners.subscribe()
    }

    async fn sign_up(
        &self,
        email: &str,
        _password: &str,
        metadata: &UserMetadata,
        redirect_to: Option<&str>,
    ) -> Result<SignUpOutcome, ProviderError> {
        self.sign_up_calls.fetch_add(1, Ordering::SeqCst);
        self.sign_up_requests
            .lock()
            .unwrap()
            .push((email.to_string(), metadata.clone(), redirect_to.map(str::to_string)));
        let identity = self.sign_up_identity.lock().unwrap().clone();
        identity
            .map(|identity| SignUpOutcome { identity, session: None })
            .ok_or(ProviderError::AlreadyRegistered)
    }

    async fn sign_in_with_password(&self, _email: &str, _password: &str) -> Result<Session, ProviderError> {
        self.sign_in_calls.fetch_add(1, Ordering::SeqCst);
        let session = self.sign_in_session.lock().unwrap().clone();
        let session = session.ok_or(ProviderError::InvalidCredentials)?;
        self.emit(AuthEvent::SignedIn, Some(session.clone()));
        Ok(session)
    }

    async fn sign_in_with_otp(&self, email: &str, options: &OtpOptions) -> Result<(), ProviderError> {
        self.otp_requests
            .lock()
            .unwrap()
            .push((email.to_string(), options.clone()));
        Ok(())
    }

    async fn set_session(&self, access_token: &str, refresh_token: &str) -> Result<Session, ProviderError> {
        self.set_session_calls.fetch_add(1, Ordering::SeqCst);
        self.set_session_requests
            .lock()
            .unwrap()
            .push((access_token.to_string(), refresh_token.to_string()));
        let identity = self.callback_identity.lock().unwrap().clone();
        let identity = identity.ok_or(ProviderError::InvalidCredentials)?;
        let session = Session {
            access_token: access_token.to_string(),
            refresh_token: refresh_token.to_string(),
            token_type: "bearer".into(),
            expires_at: now_epoch_secs() + 3600,
            identity,
        };
        self.emit(AuthEvent::SignedIn, Some(session.clone()));
        Ok(session)
    }

    async fn sign_out(&self) -> Result<(), ProviderError> {
        self.sign_out_calls.fetch_add(1, Ordering::SeqCst);
        if self.sign_out_fails.load(Ordering::SeqCst) {
            return Err(ProviderError::Network("connection reset".into()));
        }
        self.emit(AuthEvent::SignedOut, None);
        Ok(())
    }

    async fn clear_local_session(&self) {
        self.clear_calls.fetch_add(1, Ordering::SeqCst);
    }
}

// =============================================================================
// MemoryProfileStore
// =============================================================================

/// In-memory profile store with the primary-key and nickname constraints and
/// call counters.
/// Every call yields once so concurrent callers interleave.
#[derive(Default)]
pub struct MemoryProfileStore {
    rows: Mutex<HashMap<Uuid, Profile>>,
    pub get_calls: AtomicU32,
    pub insert_calls: AtomicU32,
    pub update_calls: AtomicU32,
    pub created: AtomicU32,
    pub fail_reads: AtomicBool,
    pub fail_inserts: AtomicBool,
    pub fail_updates: AtomicBool,
    pub hang_reads: AtomicBool,
    read_delay: Mutex<Option<Duration>>,
    update_delay: Mutex<Option<Duration>>,
    in_flight: AtomicU32,
    pub max_in_flight: AtomicU32,
}

impl MemoryProfileStore {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn seed(&self, profile: Profile) {
        self.rows.lock().unwrap().insert(profile.id, profile);
    }

    #[must_use]
    pub fn row(&self, id: Uuid) -> Option<Profile> {
        self.rows.lock().unwrap().get(&id).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    pub fn set_read_delay(&self, delay: Duration) {
        *self.read_delay.lock().unwrap() = Some(delay);
    }

    pub fn set_update_delay(&self, delay: Duration) {
        *self.update_delay.lock().unwrap() = Some(delay);
    }

    pub fn reset_counters(&self) {
        self.get_calls.store(0, Ordering::SeqCst);
        self.insert_calls.store(0, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl ProfileStore for MemoryProfileStore {
    async fn get_by_id(&self, id: Uuid) -> Result<Profile, StoreError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = *self.read_delay.lock().unwrap();
        match delay {
            Some(delay) => tokio::time::sleep(delay).await,
            None => tokio::task::yield_now().await,
        }
        if self.hang_reads.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Db(sqlx::Error::PoolTimedOut));
        }
        self.row(id).ok_or(StoreError::NotFound(id))
    }

    async fn insert(&self, profile: &NewProfile) -> Result<Profile, StoreError> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(StoreError::Db(sqlx::Error::Protocol("insert rejected".into())));
        }
        let mut rows = self.rows.lock().unwrap();
        if rows.contains_key(&profile.id) {
            return Err(StoreError::UniqueViolation(profile.id));
        }
        if nickname_held(&rows, profile.id, &profile.nickname) {
            return Err(StoreError::NicknameTaken(profile.nickname.clone()));
        }
        let stored = Profile::from_new(profile);
        rows.insert(stored.id, stored.clone());
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(stored)
    }

    async fn update(&self, id: Uuid, update: &ProfileUpdate) -> Result<Profile, StoreError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.update_delay.lock().unwrap();
        match delay {
            Some(delay) => tokio::time::sleep(delay).await,
            None => tokio::task::yield_now().await,
        }
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(StoreError::Db(sqlx::Error::PoolTimedOut));
        }

        let mut rows = self.rows.lock().unwrap();
        if let ProfileUpdate::Details { nickname, .. } = update {
            if nickname_held(&rows, id, nickname) {
                return Err(StoreError::NicknameTaken(nickname.clone()));
            }
        }
        let row = rows.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        match update {
            ProfileUpdate::Details { nickname, position } => {
                row.nickname.clone_from(nickname);
                row.position.clone_from(position);
            }
            ProfileUpdate::Avatar(avatar) => row.avatar.clone_from(avatar),
        }
        row.updated_at = time::OffsetDateTime::now_utc();
        Ok(row.clone())
    }
}

fn nickname_held(rows: &HashMap<Uuid, Profile>, id: Uuid, nickname: &str) -> bool {
    nickname != FALLBACK_NICKNAME && rows.values().any(|p| p.id != id && p.nickname == nickname)
}
