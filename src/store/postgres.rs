//! Postgres-backed profile store.

use sqlx::PgPool;
use uuid::Uuid;

use super::{DEFAULT_RANKING, NewProfile, Profile, ProfileStore, ProfileUpdate, StoreError};
use crate::retry::{RetryPolicy, retry_with_backoff};

const PROFILE_COLUMNS: &str = "id, nickname, email, wins, losses, kills, deaths, assists, headshots, \
     kd_ratio, ranking, avatar, position, steam_id, created_at, updated_at";

/// Partial unique index on `nickname`, see `0002_profile_nickname_unique.sql`.
const NICKNAME_CONSTRAINT: &str = "profiles_nickname_key";

#[derive(Clone)]
pub struct PgProfileStore {
    pool: PgPool,
    retry: RetryPolicy,
}

impl PgProfileStore {
    #[must_use]
    pub fn new(pool: PgPool, retry: RetryPolicy) -> Self {
        Self { pool, retry }
    }

    async fn fetch(&self, id: Uuid) -> Result<Profile, StoreError> {
        let sql = format!("SELECT {PROFILE_COLUMNS} FROM profiles WHERE id = $1");
        sqlx::query_as::<_, Profile>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound(id))
    }

    async fn apply(&self, id: Uuid, update: &ProfileUpdate) -> Result<Profile, StoreError> {
        let row = match update {
            ProfileUpdate::Details { nickname, position } => {
                let sql = format!(
                    "UPDATE profiles SET nickname = $2, position = $3, updated_at = now()
                     WHERE id = $1
                     RETURNING {PROFILE_COLUMNS}"
                );
                sqlx::query_as::<_, Profile>(&sql)
                    .bind(id)
                    .bind(nickname)
                    .bind(position)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(|e| write_error(e, id, nickname))?
            }
            ProfileUpdate::Avatar(avatar) => {
                let sql = format!(
                    "UPDATE profiles SET avatar = $2, updated_at = now()
                     WHERE id = $1
                     RETURNING {PROFILE_COLUMNS}"
                );
                sqlx::query_as::<_, Profile>(&sql)
                    .bind(id)
                    .bind(avatar)
                    .fetch_optional(&self.pool)
                    .await?
            }
        };
        row.ok_or(StoreError::NotFound(id))
    }
}

/// Tell a duplicate primary key apart from a nickname collision.
fn write_error(e: sqlx::Error, id: Uuid, nickname: &str) -> StoreError {
    match e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            if db.constraint() == Some(NICKNAME_CONSTRAINT) {
                StoreError::NicknameTaken(nickname.to_string())
            } else {
                StoreError::UniqueViolation(id)
            }
        }
        other => StoreError::Db(other),
    }
}

#[async_trait::async_trait]
impl ProfileStore for PgProfileStore {
    async fn get_by_id(&self, id: Uuid) -> Result<Profile, StoreError> {
        retry_with_backoff(self.retry, || self.fetch(id)).await
    }

    async fn insert(&self, profile: &NewProfile) -> Result<Profile, StoreError> {
        let sql = format!(
            "INSERT INTO profiles (id, nickname, email, ranking)
             VALUES ($1, $2, $3, $4)
             RETURNING {PROFILE_COLUMNS}"
        );
        sqlx::query_as::<_, Profile>(&sql)
            .bind(profile.id)
            .bind(&profile.nickname)
            .bind(&profile.email)
            .bind(DEFAULT_RANKING)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| write_error(e, profile.id, &profile.nickname))
    }

    async fn update(&self, id: Uuid, update: &ProfileUpdate) -> Result<Profile, StoreError> {
        retry_with_backoff(self.retry, || self.apply(id, update)).await
    }
}

#[cfg(test)]
#[path = "postgres_test.rs"]
mod tests;
