//! Refresh-token session store: one active refresh token per identity.
//!
//! The store implements revocation-by-replacement. Each identity owns a single
//! refresh-token slot; rotation overwrites the slot with a freshly issued
//! token, which implicitly revokes the previous one. A rotation attempt only
//! succeeds when the presented token equals the stored value, so reuse of a
//! superseded token (concurrent login elsewhere, logout) is detected and
//! rejected.
//!
//! Identity records physically live in the platform's user-persistence layer.
//! This module talks to that layer through the narrow [`IdentityStore`] trait,
//! reading and writing by identity id only. [`MemoryIdentityStore`] is the
//! in-process implementation used by the single-process baseline and by tests.
//!
//! # Concurrency
//!
//! Rotation may suspend on backing-store I/O, so the compare-and-overwrite
//! step runs under a per-identity async mutex. Two concurrent rotations for
//! the same identity can never both succeed against the same presented token;
//! rotations for different identities never contend.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::token::{Claims, TokenError, TokenService};

/// Failure reported by an identity-store backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("identity store failure: {0}")]
pub struct StoreError(pub String);

/// Errors produced by session operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The presented token was malformed, forged, or expired.
    #[error(transparent)]
    Token(#[from] TokenError),

    /// The token's subject does not resolve to a known identity.
    #[error("identity not found")]
    IdentityNotFound,

    /// The presented refresh token does not equal the stored slot; it has
    /// been superseded by a later rotation or cleared by logout.
    #[error("refresh token is stale")]
    RefreshTokenStale,

    /// The backing store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SessionError {
    /// Returns `true` if this error should surface as a 401-class rejection
    /// rather than an internal failure.
    pub fn is_client_error(&self) -> bool {
        match self {
            Self::Token(err) => err.is_client_error(),
            Self::IdentityNotFound | Self::RefreshTokenStale => true,
            Self::Store(_) => false,
        }
    }
}

/// An identity record as owned by the user-persistence collaborator.
///
/// Carries the claim fields embedded into access tokens plus the current
/// refresh-token slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Stable identity id; the `sub` of every token issued for this identity.
    pub id: String,

    /// Unique username.
    pub username: String,

    /// Human-readable display name.
    pub display_name: String,

    /// Administrator flag.
    pub is_admin: bool,

    /// The single active refresh token, if a session is bound.
    pub refresh_token: Option<String>,
}

impl Identity {
    /// The claim set embedded into access tokens for this identity.
    pub fn claims(&self) -> Claims {
        Claims {
            sub: self.id.clone(),
            username: self.username.clone(),
            display_name: self.display_name.clone(),
            is_admin: self.is_admin,
        }
    }
}

/// Access pattern onto the excluded identity-persistence layer.
///
/// Implementations read and write by identity id only; the session store has
/// no other coupling to identity storage.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Loads an identity record, or `None` if the id is unknown.
    async fn find_identity(&self, identity_id: &str) -> Result<Option<Identity>, StoreError>;

    /// Overwrites the identity's refresh-token slot.
    async fn store_refresh_token(
        &self,
        identity_id: &str,
        refresh_token: &str,
    ) -> Result<(), StoreError>;
}

/// In-memory [`IdentityStore`] for the single-process baseline and tests.
#[derive(Default)]
pub struct MemoryIdentityStore {
    identities: RwLock<HashMap<String, Identity>>,
}

impl MemoryIdentityStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces an identity record.
    pub async fn insert(&self, identity: Identity) {
        self.identities
            .write()
            .await
            .insert(identity.id.clone(), identity);
    }

    /// Returns the number of stored identities.
    pub async fn len(&self) -> usize {
        self.identities.read().await.len()
    }

    /// Returns `true` if no identities are stored.
    pub async fn is_empty(&self) -> bool {
        self.identities.read().await.is_empty()
    }
}

#[async_trait]
impl IdentityStore for MemoryIdentityStore {
    async fn find_identity(&self, identity_id: &str) -> Result<Option<Identity>, StoreError> {
        Ok(self.identities.read().await.get(identity_id).cloned())
    }

    async fn store_refresh_token(
        &self,
        identity_id: &str,
        refresh_token: &str,
    ) -> Result<(), StoreError> {
        let mut identities = self.identities.write().await;
        let identity = identities
            .get_mut(identity_id)
            .ok_or_else(|| StoreError(format!("unknown identity: {identity_id}")))?;
        identity.refresh_token = Some(refresh_token.to_string());
        Ok(())
    }
}

/// A freshly issued access/refresh pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    /// Short-lived access token.
    pub access_token: String,

    /// Long-lived refresh token; the identity's new single-slot value.
    pub refresh_token: String,
}

/// Session store backing the token-rotation path.
pub struct SessionStore {
    tokens: Arc<TokenService>,
    identities: Arc<dyn IdentityStore>,
    rotation_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionStore {
    /// Creates a session store over the given token service and identity
    /// backend.
    pub fn new(tokens: Arc<TokenService>, identities: Arc<dyn IdentityStore>) -> Self {
        Self {
            tokens,
            identities,
            rotation_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Seeds the identity's refresh-token slot at login.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::IdentityNotFound`] for an unknown identity, or
    /// [`SessionError::Store`] if the backend fails.
    pub async fn bind(&self, identity_id: &str, refresh_token: &str) -> Result<(), SessionError> {
        if self.identities.find_identity(identity_id).await?.is_none() {
            return Err(SessionError::IdentityNotFound);
        }
        self.identities
            .store_refresh_token(identity_id, refresh_token)
            .await?;
        debug!(identity = %identity_id, "refresh token bound");
        Ok(())
    }

    /// Issues a fresh access/refresh pair for the identity and binds the
    /// refresh token as the new slot value. Used by the login flow.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::IdentityNotFound`] for an unknown identity,
    /// [`SessionError::Token`] on signing failure, or [`SessionError::Store`]
    /// if the backend fails.
    pub async fn create_session(&self, identity_id: &str) -> Result<TokenPair, SessionError> {
        let identity = self
            .identities
            .find_identity(identity_id)
            .await?
            .ok_or(SessionError::IdentityNotFound)?;

        let access_token = self.tokens.issue_access(&identity.claims())?;
        let refresh_token = self.tokens.issue_refresh(&identity.id)?;
        self.identities
            .store_refresh_token(&identity.id, &refresh_token)
            .await?;

        debug!(identity = %identity_id, "session created");
        Ok(TokenPair {
            access_token,
            refresh_token,
        })
    }

    /// Rotates the refresh token: verifies the presented token, checks it
    /// against the stored slot, and atomically replaces the slot with a fresh
    /// pair.
    ///
    /// The compare-and-overwrite step runs under a per-identity lock, so a
    /// rotation never succeeds against a slot value that a concurrent
    /// rotation for the same identity already replaced.
    ///
    /// # Errors
    ///
    /// - [`SessionError::Token`] if the presented token is malformed or
    ///   expired
    /// - [`SessionError::IdentityNotFound`] if the subject is unknown
    /// - [`SessionError::RefreshTokenStale`] if the presented token was
    ///   superseded
    /// - [`SessionError::Store`] if the backend fails
    pub async fn rotate(&self, presented: &str) -> Result<TokenPair, SessionError> {
        // Signature and expiry checks are pure; do them before locking.
        let subject = self.tokens.verify_refresh(presented)?;

        let lock = self.rotation_lock(&subject).await;
        let _guard = lock.lock().await;

        let identity = self
            .identities
            .find_identity(&subject)
            .await?
            .ok_or(SessionError::IdentityNotFound)?;

        match identity.refresh_token.as_deref() {
            Some(stored) if stored == presented => {}
            _ => {
                warn!(identity = %subject, "stale refresh token presented");
                return Err(SessionError::RefreshTokenStale);
            }
        }

        let access_token = self.tokens.issue_access(&identity.claims())?;
        let refresh_token = self.tokens.issue_refresh(&identity.id)?;
        self.identities
            .store_refresh_token(&identity.id, &refresh_token)
            .await?;

        debug!(identity = %subject, "refresh token rotated");
        Ok(TokenPair {
            access_token,
            refresh_token,
        })
    }

    /// Returns the rotation lock for one identity, creating it on first use.
    async fn rotation_lock(&self, identity_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.rotation_locks.lock().await;
        locks
            .entry(identity_id.to_string())
            .or_insert_with(Arc::default)
            .clone()
    }
}
