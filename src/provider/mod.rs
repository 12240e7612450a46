//! Identity provider seam.
//!
//! DESIGN
//! ======
//! [`IdentityProvider`] is the contract the session manager consumes. The
//! manager never talks HTTP or touches token storage; it asks for the current
//! session, subscribes to change notifications, and delegates credential
//! actions. [`gotrue::GoTrueClient`] implements the trait against a GoTrue
//! style REST service; tests use an in-process double.
//!
//! Change notifications fan out through [`AuthListeners`]: every subscriber
//! gets its own unbounded queue so events arrive complete and in order, and
//! dropping the [`Subscription`] unregisters it. Deliveries carry a
//! [`NotifySequence`] stamp so consumers can discard changes queued before a
//! point they care about.

pub mod gotrue;
pub mod storage;
pub mod types;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::mpsc;

pub use types::{AuthChange, AuthEvent, Identity, OtpOptions, ProviderError, Session, SignUpOutcome, UserMetadata};

// =============================================================================
// PROVIDER TRAIT
// =============================================================================

/// Async contract for the external identity provider. Enables test doubles.
#[async_trait::async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Return the persisted session, if any. May return an expired session;
    /// callers decide what expiry means for them.
    ///
    /// # Errors
    ///
    /// Returns a [`ProviderError`] when the provider cannot be reached or the
    /// stored session cannot be read.
    async fn get_session(&self) -> Result<Option<Session>, ProviderError>;

    /// Register for auth-state change notifications.
    fn subscribe(&self) -> Subscription;

    /// Create credentials for a new user.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::AlreadyRegistered`] for a taken email, or a
    /// transport/API error.
    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: &UserMetadata,
        redirect_to: Option<&str>,
    ) -> Result<SignUpOutcome, ProviderError>;

    /// Exchange an email/password pair for a session.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::InvalidCredentials`] for a rejected pair, or a
    /// transport/API error.
    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session, ProviderError>;

    /// Send a one-time sign-in link to `email`.
    ///
    /// # Errors
    ///
    /// Returns a [`ProviderError`] if the provider refuses or cannot be reached.
    async fn sign_in_with_otp(&self, email: &str, options: &OtpOptions) -> Result<(), ProviderError>;

    /// Adopt the tokens delivered to an email-link callback as the current
    /// session.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::InvalidCredentials`] when the tokens are no
    /// longer valid, or a transport/API error.
    async fn set_session(&self, access_token: &str, refresh_token: &str) -> Result<Session, ProviderError>;

    /// Revoke the current session remotely.
    ///
    /// # Errors
    ///
    /// Returns a [`ProviderError`] if the revoke call fails. Implementations
    /// forget the session locally before revoking it.
    async fn sign_out(&self) -> Result<(), ProviderError>;

    /// Drop any locally cached session artifacts without a network call.
    async fn clear_local_session(&self);
}

// =============================================================================
// LISTENER REGISTRY
// =============================================================================

/// Running count of notifications a registry has sent. Every delivery is
/// stamped with the count at the time it was queued, so a consumer can tell
/// whether a change predates something it did.
#[derive(Debug, Clone, Default)]
pub struct NotifySequence(Arc<AtomicU64>);

impl NotifySequence {
    /// Stamp of the most recently queued notification, 0 before the first.
    #[must_use]
    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    fn advance(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }
}

type Delivery = (u64, AuthChange);

/// Registry of auth-change subscribers owned by a provider implementation.
#[derive(Default)]
pub struct AuthListeners {
    next_id: AtomicU64,
    sequence: NotifySequence,
    senders: Mutex<HashMap<u64, mpsc::UnboundedSender<Delivery>>>,
}

impl AuthListeners {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add a subscriber. The returned handle unregisters itself on drop.
    #[must_use]
    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().insert(id, tx);
        Subscription { id, receiver: rx, sequence: self.sequence.clone(), listeners: Arc::downgrade(self) }
    }

    /// Deliver `change` to every live subscriber, pruning closed ones.
    pub fn notify(&self, change: &AuthChange) {
        let mut senders = self.lock();
        let stamp = self.sequence.advance();
        senders.retain(|_, tx| tx.send((stamp, change.clone())).is_ok());
    }

    /// Number of registered subscribers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove(&self, id: u64) {
        self.lock().remove(&id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, mpsc::UnboundedSender<Delivery>>> {
        self.senders
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// A live registration for auth-change notifications.
pub struct Subscription {
    id: u64,
    receiver: mpsc::UnboundedReceiver<Delivery>,
    sequence: NotifySequence,
    listeners: Weak<AuthListeners>,
}

impl Subscription {
    /// Next change in arrival order, or `None` once the provider is gone.
    pub async fn recv(&mut self) -> Option<AuthChange> {
        self.receiver.recv().await.map(|(_, change)| change)
    }

    /// Like [`recv`](Self::recv), with the stamp the change was queued under.
    pub async fn recv_stamped(&mut self) -> Option<(u64, AuthChange)> {
        self.receiver.recv().await
    }

    /// Handle on the registry's running count.
    #[must_use]
    pub fn sequence(&self) -> NotifySequence {
        self.sequence.clone()
    }

    /// Stop receiving notifications.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners.remove(self.id);
        }
    }
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
