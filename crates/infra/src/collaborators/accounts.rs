//! Account directory: user profile lookup and role changes.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use tokio::runtime::Handle;
use tracing::instrument;

use annoflow_core::UserId;

use super::ProviderError;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    FreeUser,
    PremiumUser,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::FreeUser => "free_user",
            UserRole::PremiumUser => "premium_user",
        }
    }

    pub fn parse(s: &str) -> Option<UserRole> {
        match s {
            "free_user" => Some(UserRole::FreeUser),
            "premium_user" => Some(UserRole::PremiumUser),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: UserId,
    pub name: String,
    pub email: String,
    pub role: UserRole,
}

impl UserProfile {
    pub fn is_free(&self) -> bool {
        self.role == UserRole::FreeUser
    }
}

pub trait AccountDirectory: Send + Sync {
    fn get_user_profile(&self, user_id: &UserId) -> Result<UserProfile, ProviderError>;

    fn update_role(&self, user_id: &UserId, role: UserRole) -> Result<(), ProviderError>;
}

impl<A> AccountDirectory for Arc<A>
where
    A: AccountDirectory + ?Sized,
{
    fn get_user_profile(&self, user_id: &UserId) -> Result<UserProfile, ProviderError> {
        (**self).get_user_profile(user_id)
    }

    fn update_role(&self, user_id: &UserId, role: UserRole) -> Result<(), ProviderError> {
        (**self).update_role(user_id, role)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryAccounts {
    profiles: RwLock<HashMap<UserId, UserProfile>>,
}

impl InMemoryAccounts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, profile: UserProfile) {
        if let Ok(mut profiles) = self.profiles.write() {
            profiles.insert(profile.user_id.clone(), profile);
        }
    }
}

impl AccountDirectory for InMemoryAccounts {
    fn get_user_profile(&self, user_id: &UserId) -> Result<UserProfile, ProviderError> {
        let profiles = self
            .profiles
            .read()
            .map_err(|_| ProviderError::Transient("accounts lock poisoned".into()))?;
        profiles
            .get(user_id)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(format!("user {user_id}")))
    }

    fn update_role(&self, user_id: &UserId, role: UserRole) -> Result<(), ProviderError> {
        let mut profiles = self
            .profiles
            .write()
            .map_err(|_| ProviderError::Transient("accounts lock poisoned".into()))?;
        let profile = profiles
            .get_mut(user_id)
            .ok_or_else(|| ProviderError::NotFound(format!("user {user_id}")))?;
        profile.role = role;
        Ok(())
    }
}

/// Profiles in a Postgres `profiles` table.
///
/// Same sync bridge as the record store: blocks on the owning runtime.
#[derive(Debug, Clone)]
pub struct PostgresAccounts {
    pool: Arc<PgPool>,
    runtime: Handle,
}

impl PostgresAccounts {
    pub fn new(pool: PgPool, runtime: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            runtime,
        }
    }

    #[instrument(skip(self, user_id), fields(user_id = %user_id), err)]
    pub async fn fetch_profile(&self, user_id: &UserId) -> Result<UserProfile, ProviderError> {
        let row = sqlx::query("SELECT name, email, role FROM profiles WHERE user_id = $1")
            .bind(user_id.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(map_sqlx_error)?
            .ok_or_else(|| ProviderError::NotFound(format!("user {user_id}")))?;

        let role: String = row.try_get("role").map_err(map_sqlx_error)?;
        Ok(UserProfile {
            user_id: user_id.clone(),
            name: row.try_get("name").map_err(map_sqlx_error)?,
            email: row.try_get("email").map_err(map_sqlx_error)?,
            role: UserRole::parse(&role)
                .ok_or_else(|| ProviderError::Rejected(format!("unknown role {role:?}")))?,
        })
    }

    #[instrument(skip(self, user_id), fields(user_id = %user_id, role = role.as_str()), err)]
    pub async fn store_role(&self, user_id: &UserId, role: UserRole) -> Result<(), ProviderError> {
        let result = sqlx::query("UPDATE profiles SET role = $2 WHERE user_id = $1")
            .bind(user_id.as_str())
            .bind(role.as_str())
            .execute(&*self.pool)
            .await
            .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            return Err(ProviderError::NotFound(format!("user {user_id}")));
        }
        Ok(())
    }
}

impl AccountDirectory for PostgresAccounts {
    fn get_user_profile(&self, user_id: &UserId) -> Result<UserProfile, ProviderError> {
        self.runtime.block_on(self.fetch_profile(user_id))
    }

    fn update_role(&self, user_id: &UserId, role: UserRole) -> Result<(), ProviderError> {
        self.runtime.block_on(self.store_role(user_id, role))
    }
}

fn map_sqlx_error(err: sqlx::Error) -> ProviderError {
    match err {
        sqlx::Error::Database(db) if db.code().as_deref() == Some("42P01") => {
            ProviderError::MissingResource(format!("profiles table: {}", db.message()))
        }
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            ProviderError::Transient(err.to_string())
        }
        other => ProviderError::Rejected(other.to_string()),
    }
}
