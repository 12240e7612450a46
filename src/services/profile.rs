//! Profile service — make sure every authenticated identity has a profile.
//!
//! DESIGN
//! ======
//! Profiles are created lazily the first time an identity is seen. Two syncs
//! for the same identity can race through "not found → insert"; the store's
//! primary key lets exactly one insert win and the loser re-reads the winner's
//! row. A nickname another player already holds falls back to the shared
//! default. Nothing here fails the caller: a profile that cannot be read is
//! `None`, and one that cannot be persisted is served from memory.

use tracing::{error, info, warn};

use crate::provider::Identity;
use crate::store::{NewProfile, Profile, ProfileStore, StoreError};

/// Insert payload for a profile synthesized from what the provider knows.
#[must_use]
pub fn default_profile(identity: &Identity) -> NewProfile {
    NewProfile::new(identity.id, identity.nickname_hint(), identity.email.as_deref())
}

/// Read the profile for `identity`, creating it on first sight.
pub async fn ensure_profile(store: &dyn ProfileStore, identity: &Identity) -> Option<Profile> {
    match store.get_by_id(identity.id).await {
        Ok(profile) => Some(profile),
        Err(StoreError::NotFound(_)) => Some(create_default_profile(store, identity).await),
        Err(e) => {
            error!(user_id = %identity.id, error = %e, "profile lookup failed");
            None
        }
    }
}

async fn create_default_profile(store: &dyn ProfileStore, identity: &Identity) -> Profile {
    let mut new = default_profile(identity);
    let mut inserted = store.insert(&new).await;
    if let Err(StoreError::NicknameTaken(taken)) = &inserted {
        info!(user_id = %identity.id, nickname = %taken, "nickname taken, using fallback");
        new = NewProfile::new(identity.id, None, identity.email.as_deref());
        inserted = store.insert(&new).await;
    }
    match inserted {
        Ok(profile) => {
            info!(user_id = %identity.id, nickname = %profile.nickname, "profile created");
            profile
        }
        Err(StoreError::UniqueViolation(_)) => match store.get_by_id(identity.id).await {
            Ok(profile) => profile,
            Err(e) => {
                warn!(user_id = %identity.id, error = %e, "profile re-read after duplicate insert failed");
                Profile::from_new(&new)
            }
        },
        Err(e) => {
            error!(user_id = %identity.id, error = %e, "profile insert failed, using unsaved default");
            Profile::from_new(&new)
        }
    }
}

/// Eagerly create the profile for a freshly registered identity using the
/// display name the user typed.
///
/// # Errors
///
/// Returns the store error unchanged; sign-up callers log it and move on,
/// since [`ensure_profile`] repairs a missing profile on the next sync.
pub async fn create_profile(
    store: &dyn ProfileStore,
    identity: &Identity,
    display_name: &str,
) -> Result<Profile, StoreError> {
    let new = NewProfile::new(
        identity.id,
        Some(display_name.trim())
            .filter(|n| !n.is_empty())
            .or(identity.nickname_hint()),
        identity.email.as_deref(),
    );
    store.insert(&new).await
}

#[cfg(test)]
#[path = "profile_test.rs"]
mod tests;
