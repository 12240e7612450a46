//! Session state exposed to the rest of the application.
//!
//! DESIGN
//! ======
//! The session manager is the only writer. Everyone else reads a
//! [`SessionSnapshot`], either on demand or by watching the manager's
//! `watch` channel, and changes it only through the manager's actions.

use serde::Serialize;

use crate::provider::Identity;
use crate::store::Profile;

/// Where the session state machine currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    /// Startup check not finished yet.
    Initializing,
    /// Steady state with an identity.
    Authenticated,
    /// Steady state without an identity.
    Anonymous,
    /// Handling an auth-change event after startup.
    Reconciling,
}

/// Point-in-time copy of the session state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub identity: Option<Identity>,
    pub profile: Option<Profile>,
    pub loading: bool,
    pub phase: SessionPhase,
}

impl SessionSnapshot {
    /// The state a manager starts in: nothing known, loading.
    #[must_use]
    pub fn initializing() -> Self {
        Self { identity: None, profile: None, loading: true, phase: SessionPhase::Initializing }
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.identity.is_some()
    }

    /// Enter `Reconciling`. A manager still in `Initializing` stays there.
    pub(crate) fn begin_sync(&mut self) {
        self.loading = true;
        if self.phase != SessionPhase::Initializing {
            self.phase = SessionPhase::Reconciling;
        }
    }

    /// Drop identity and profile and settle as `Anonymous`.
    pub(crate) fn settle_anonymous(&mut self) {
        self.identity = None;
        self.profile = None;
        self.loading = false;
        self.phase = SessionPhase::Anonymous;
    }

    /// Stop loading and settle in whichever steady state the identity implies.
    pub(crate) fn settle(&mut self) {
        self.loading = false;
        self.phase = if self.identity.is_some() { SessionPhase::Authenticated } else { SessionPhase::Anonymous };
    }
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self::initializing()
    }
}

#[cfg(test)]
#[path = "state_test.rs"]
mod tests;
