//! Auth/session bridge.
//!
//! Maps local credential records to a remote token-based identity.
//! Online, the token exchange is attempted first; when the remote rejects
//! the credentials in the way un-migrated legacy accounts do, a one-time
//! provisioning call validates the secret against the legacy hash
//! server-side and mints the token identity (idempotent for accounts that
//! already migrated). Offline, the secret is verified against the local
//! argon2 hash, so a device keeps working after its first successful
//! exchange.
//!
//! The sentinel local admin allows fully offline first use: it is created
//! only when no identities exist at all, and retired once real identities
//! have been synced in — never while it is the only identity left.

use std::sync::Arc;

use argon2::password_hash::{rand_core::OsRng, PasswordHash, SaltString};
use argon2::{Argon2, PasswordHasher, PasswordVerifier};
use chrono::Utc;
use uuid::Uuid;

use crate::compat::CompatibilityGate;
use crate::db::{keys, LocalUser, MetaStore, UserStore, LOCAL_SYSTEM_MARKER};
use crate::error::{ClientError, Result};
use crate::remote::{AuthExchange, RemoteError, RemoteStore, SessionTokens};

/// Username of the sentinel offline admin.
pub const DEFAULT_ADMIN_USERNAME: &str = "admin";
const DEFAULT_ADMIN_PASSWORD: &str = "admin";
const DEFAULT_ADMIN_FULLNAME: &str = "Administrator";

/// Error substrings the remote uses for accounts that have not been
/// migrated to token auth yet.
const LEGACY_ERROR_MARKERS: [&str; 2] = ["invalid login credentials", "invalid_grant"];

/// Outcome of an authentication attempt, distinguished by kind so the
/// caller can present an accurate message.
#[derive(Debug)]
pub enum AuthOutcome {
    Success {
        user: LocalUser,
        session: Option<SessionTokens>,
    },
    InvalidCredentials,
    UserNotFound,
    UserInactive,
    NotConfigured,
    Error(String),
}

/// Bridges local credentials and the remote session.
pub struct AuthBridge {
    users: UserStore,
    meta: MetaStore,
    remote: Option<Arc<dyn RemoteStore>>,
    gate: Arc<CompatibilityGate>,
}

impl AuthBridge {
    pub fn new(
        users: UserStore,
        meta: MetaStore,
        remote: Option<Arc<dyn RemoteStore>>,
        gate: Arc<CompatibilityGate>,
    ) -> Self {
        Self {
            users,
            meta,
            remote,
            gate,
        }
    }

    /// Authenticate a user by username and secret.
    pub async fn authenticate(&self, username: &str, secret: &str) -> Result<AuthOutcome> {
        self.gate.ensure_allowed()?;

        let Some(user) = self.users.get_by_username(username).await? else {
            return Ok(AuthOutcome::UserNotFound);
        };
        if !user.is_active {
            return Ok(AuthOutcome::UserInactive);
        }

        match &self.remote {
            Some(remote) => self.authenticate_online(remote.clone(), user, secret).await,
            None => self.authenticate_offline(user, secret).await,
        }
    }

    async fn authenticate_online(
        &self,
        remote: Arc<dyn RemoteStore>,
        user: LocalUser,
        secret: &str,
    ) -> Result<AuthOutcome> {
        match remote.sign_in(&user.username, secret).await {
            Ok(exchange) => self.complete_exchange(user, exchange).await,
            Err(RemoteError::AuthRejected { message }) if is_legacy_rejection(&message) => {
                tracing::info!(
                    username = %user.username,
                    "token exchange rejected, attempting legacy provisioning"
                );
                match remote.provision_legacy(&user.username, secret).await {
                    Ok(exchange) => self.complete_exchange(user, exchange).await,
                    Err(RemoteError::AuthRejected { .. }) => Ok(AuthOutcome::InvalidCredentials),
                    Err(error) if error.is_transient() => {
                        self.authenticate_offline(user, secret).await
                    }
                    Err(error) => Ok(AuthOutcome::Error(error.to_string())),
                }
            }
            Err(RemoteError::AuthRejected { message }) => {
                if message.to_lowercase().contains("inactive") {
                    Ok(AuthOutcome::UserInactive)
                } else {
                    Ok(AuthOutcome::InvalidCredentials)
                }
            }
            Err(RemoteError::NotConfigured) => self.authenticate_offline(user, secret).await,
            Err(error) if error.is_transient() => {
                tracing::debug!(%error, "remote unreachable, verifying credentials locally");
                self.authenticate_offline(user, secret).await
            }
            Err(error) => Ok(AuthOutcome::Error(error.to_string())),
        }
    }

    async fn authenticate_offline(&self, user: LocalUser, secret: &str) -> Result<AuthOutcome> {
        if user.password_hash.is_empty() {
            // Synced identity without a local hash; only the remote can
            // verify it.
            return Ok(AuthOutcome::NotConfigured);
        }
        if !verify_password(&user.password_hash, secret) {
            return Ok(AuthOutcome::InvalidCredentials);
        }

        let session = self.stored_session().await?;
        Ok(AuthOutcome::Success { user, session })
    }

    async fn complete_exchange(
        &self,
        user: LocalUser,
        exchange: AuthExchange,
    ) -> Result<AuthOutcome> {
        self.meta.set_json(keys::SESSION, &exchange.session).await?;
        tracing::info!(username = %user.username, "authenticated against remote");
        Ok(AuthOutcome::Success {
            user,
            session: Some(exchange.session),
        })
    }

    /// The persisted remote session, if one exists.
    pub async fn stored_session(&self) -> Result<Option<SessionTokens>> {
        self.meta.get_json(keys::SESSION).await
    }

    /// Drop the persisted session (logout).
    pub async fn clear_session(&self) -> Result<()> {
        self.meta.delete(keys::SESSION).await
    }

    /// Create the sentinel admin when no identities exist at all.
    ///
    /// Returns true when one was created.
    pub async fn ensure_default_admin(&self) -> Result<bool> {
        if self.users.count().await? > 0 {
            return Ok(false);
        }

        let now = Utc::now().timestamp_millis();
        let admin = LocalUser {
            id: Uuid::new_v4().to_string(),
            username: DEFAULT_ADMIN_USERNAME.to_string(),
            password_hash: hash_password(DEFAULT_ADMIN_PASSWORD)?,
            full_name: DEFAULT_ADMIN_FULLNAME.to_string(),
            is_admin: true,
            is_active: true,
            created_at: now,
            updated_at: now,
            created_by: Some(LOCAL_SYSTEM_MARKER.to_string()),
            updated_by: Some(LOCAL_SYSTEM_MARKER.to_string()),
        };
        self.users.upsert(&admin).await?;
        tracing::info!(user_id = %admin.id, "created sentinel local admin for offline first use");
        Ok(true)
    }

    /// Retire the sentinel admin once real identities have been synced.
    ///
    /// No-op returning false when there is no sentinel, or when it is
    /// still the only identity (removing it would lock the user out).
    pub async fn remove_local_admin_if_remote_users_exist(&self) -> Result<bool> {
        let all = self.users.get_all().await?;
        let Some(sentinel) = all.iter().find(|u| u.is_local_system()) else {
            return Ok(false);
        };
        let real_users = all.iter().filter(|u| !u.is_local_system()).count();
        if real_users == 0 {
            tracing::debug!("no real identities synced yet, keeping sentinel admin");
            return Ok(false);
        }

        self.users.delete(&sentinel.id).await?;
        tracing::info!(
            real_users,
            "sentinel local admin retired after syncing real identities"
        );
        Ok(true)
    }

    /// Remove the sentinel admin unconditionally.
    pub async fn force_remove_local_admin(&self) -> Result<bool> {
        let all = self.users.get_all().await?;
        let Some(sentinel) = all.iter().find(|u| u.is_local_system()) else {
            return Ok(false);
        };
        self.users.delete(&sentinel.id).await?;
        tracing::info!("sentinel local admin force-removed");
        Ok(true)
    }
}

fn is_legacy_rejection(message: &str) -> bool {
    let lowered = message.to_lowercase();
    LEGACY_ERROR_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
}

/// Hash a secret with argon2.
pub fn hash_password(secret: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(secret.as_bytes(), &salt)
        .map_err(|e| ClientError::Internal(format!("password hashing failed: {e}")))?;
    Ok(hash.to_string())
}

/// Verify a secret against a stored argon2 hash.
pub fn verify_password(stored_hash: &str, secret: &str) -> bool {
    PasswordHash::new(stored_hash)
        .map(|parsed| {
            Argon2::default()
                .verify_password(secret.as_bytes(), &parsed)
                .is_ok()
        })
        .unwrap_or(false)
}
