//! Profile store seam.
//!
//! DESIGN
//! ======
//! Profiles are the league's own record of a player and are keyed 1:1 by the
//! identity id. The store contract is read by id, insert and update.
//! Callers tell "no row" apart from "insert lost a race" through dedicated
//! [`StoreError`] variants, which is what makes lazy creation idempotent.
//!
//! Nicknames are unique across players, except for [`FALLBACK_NICKNAME`]
//! which any number of fresh profiles may share.

pub mod postgres;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Starting ladder value for a new player.
pub const DEFAULT_RANKING: i32 = 1000;
/// Display name used when the identity carries no usable nickname.
pub const FALLBACK_NICKNAME: &str = "Jogador";

// =============================================================================
// ERROR
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("profile not found: {0}")]
    NotFound(Uuid),
    #[error("profile already exists: {0}")]
    UniqueViolation(Uuid),
    #[error("nickname already in use: {0}")]
    NicknameTaken(String),
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
}

impl crate::retry::Retryable for StoreError {
    fn retryable(&self) -> bool {
        matches!(
            self,
            Self::Db(sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::WorkerCrashed)
        )
    }
}

// =============================================================================
// PROFILE
// =============================================================================

/// A league profile row. Mirrors the `profiles` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Profile {
    pub id: Uuid,
    pub nickname: String,
    pub email: Option<String>,
    pub wins: i32,
    pub losses: i32,
    pub kills: i32,
    pub deaths: i32,
    pub assists: i32,
    pub headshots: i32,
    pub kd_ratio: f64,
    pub ranking: i32,
    pub avatar: Option<String>,
    pub position: Option<String>,
    pub steam_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Profile {
    /// Build the unsaved stand-in used when a profile cannot be persisted.
    /// Timestamps are the current time.
    #[must_use]
    pub fn from_new(new: &NewProfile) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: new.id,
            nickname: new.nickname.clone(),
            email: new.email.clone(),
            wins: 0,
            losses: 0,
            kills: 0,
            deaths: 0,
            assists: 0,
            headshots: 0,
            kd_ratio: 0.0,
            ranking: DEFAULT_RANKING,
            avatar: None,
            position: None,
            steam_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Insert payload: everything a fresh profile needs. Counters start at zero
/// and ranking at [`DEFAULT_RANKING`]; the store fills in timestamps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewProfile {
    pub id: Uuid,
    pub nickname: String,
    pub email: Option<String>,
}

impl NewProfile {
    /// Trim the supplied nickname, falling back to [`FALLBACK_NICKNAME`].
    #[must_use]
    pub fn new(id: Uuid, nickname: Option<&str>, email: Option<&str>) -> Self {
        let nickname = nickname
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or(FALLBACK_NICKNAME)
            .to_string();
        Self { id, nickname, email: email.map(str::to_string) }
    }
}

/// A player-initiated change to an existing profile. Every update also
/// refreshes `updated_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProfileUpdate {
    /// Edit-profile form: nickname and optional position tag.
    Details { nickname: String, position: Option<String> },
    /// New avatar reference, or `None` to remove it.
    Avatar(Option<String>),
}

// =============================================================================
// STORE TRAIT
// =============================================================================

/// Async contract for profile persistence. Enables test doubles.
#[async_trait::async_trait]
pub trait ProfileStore: Send + Sync {
    /// Fetch the profile for `id`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when no row exists, or a database error.
    async fn get_by_id(&self, id: Uuid) -> Result<Profile, StoreError>;

    /// Insert a new profile and return the stored row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UniqueViolation`] if a profile with the same id
    /// already exists, [`StoreError::NicknameTaken`] if the nickname is held by
    /// another player, or a database error.
    async fn insert(&self, profile: &NewProfile) -> Result<Profile, StoreError>;

    /// Apply `update` to the profile for `id` and return the stored row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when no row exists,
    /// [`StoreError::NicknameTaken`] when another player holds the nickname,
    /// or a database error.
    async fn update(&self, id: Uuid, update: &ProfileUpdate) -> Result<Profile, StoreError>;
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
