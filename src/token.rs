//! Stateless issuance and verification of signed access and refresh tokens.
//!
//! Access tokens are short-lived HS256 JWTs carrying the full identity claims;
//! refresh tokens are long-lived HS256 JWTs carrying only the subject id. The
//! two classes are signed with independent secrets and independent TTLs so
//! that compromising one class does not compromise the other.
//!
//! Verification is a pure function of the token, the current time, and the
//! secret material. There is no server-side record of issued access tokens;
//! validity is fully determined by signature and expiry.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use pulse_server::token::{Claims, TokenService};
//!
//! let tokens = TokenService::new(
//!     "an-access-secret-of-at-least-32-chars!!",
//!     Duration::from_secs(900),
//!     "a-refresh-secret-of-at-least-32-chars!!",
//!     Duration::from_secs(864_000),
//! );
//!
//! let claims = Claims {
//!     sub: "user-1".to_string(),
//!     username: "ada".to_string(),
//!     display_name: "Ada Lovelace".to_string(),
//!     is_admin: false,
//! };
//!
//! let token = tokens.issue_access(&claims).unwrap();
//! assert_eq!(tokens.verify_access(&token).unwrap(), claims);
//! ```

use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;

/// Errors produced by token issuance and verification.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenError {
    /// The token is malformed, has an invalid signature, or carries the
    /// wrong claim shape for its class.
    #[error("token is malformed or has an invalid signature")]
    Invalid,

    /// The token's expiry timestamp has passed.
    #[error("token has expired")]
    Expired,

    /// Signing failed while issuing a token. Surfaced as an internal error,
    /// never as an authentication failure.
    #[error("token signing failed: {0}")]
    Signing(String),
}

impl TokenError {
    /// Returns `true` if this error means the presented credential was bad,
    /// as opposed to a server-side signing failure.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Invalid | Self::Expired)
    }
}

/// Identity claims embedded in every access token.
///
/// Immutable once issued; a change in identity (for example an admin
/// promotion) is only visible after a fresh token is issued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claims {
    /// Subject identity id.
    pub sub: String,

    /// Unique username.
    pub username: String,

    /// Human-readable display name.
    pub display_name: String,

    /// Administrator flag.
    pub is_admin: bool,
}

/// Wire shape of an access token's claim set.
#[derive(Debug, Serialize, Deserialize)]
struct AccessTokenClaims {
    sub: String,
    username: String,
    display_name: String,
    is_admin: bool,
    iat: i64,
    exp: i64,
}

/// Wire shape of a refresh token's claim set. Carries only the subject id;
/// everything else is reloaded from identity storage at rotation time.
#[derive(Debug, Serialize, Deserialize)]
struct RefreshTokenClaims {
    sub: String,
    iat: i64,
    exp: i64,
}

/// Key material and TTL for one token class.
struct SigningKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
}

impl SigningKeys {
    fn new(secret: &str, ttl: Duration) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            ttl,
        }
    }
}

/// Issues and verifies access and refresh tokens.
///
/// The service is cheap to construct and holds no mutable state; share it
/// behind an `Arc` across tasks.
pub struct TokenService {
    access: SigningKeys,
    refresh: SigningKeys,
}

impl TokenService {
    /// Creates a token service from the two signing secrets and their TTLs.
    ///
    /// Secrets must be distinct; [`crate::config::Config`] validation enforces
    /// this before the service is constructed.
    pub fn new(
        access_secret: &str,
        access_ttl: Duration,
        refresh_secret: &str,
        refresh_ttl: Duration,
    ) -> Self {
        Self {
            access: SigningKeys::new(access_secret, access_ttl),
            refresh: SigningKeys::new(refresh_secret, refresh_ttl),
        }
    }

    /// Issues a signed access token for the given claims.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Signing`] if encoding fails.
    pub fn issue_access(&self, claims: &Claims) -> Result<String, TokenError> {
        let (iat, exp) = stamp(self.access.ttl);
        let wire = AccessTokenClaims {
            sub: claims.sub.clone(),
            username: claims.username.clone(),
            display_name: claims.display_name.clone(),
            is_admin: claims.is_admin,
            iat,
            exp,
        };
        let token = sign(&wire, &self.access.encoding)?;
        trace!(sub = %claims.sub, exp, "issued access token");
        Ok(token)
    }

    /// Verifies an access token and returns the embedded identity claims.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Expired`] once the TTL has elapsed, or
    /// [`TokenError::Invalid`] for a bad signature, malformed token, or a
    /// token of the wrong class.
    pub fn verify_access(&self, token: &str) -> Result<Claims, TokenError> {
        let wire: AccessTokenClaims = verify(token, &self.access.decoding)?;
        Ok(Claims {
            sub: wire.sub,
            username: wire.username,
            display_name: wire.display_name,
            is_admin: wire.is_admin,
        })
    }

    /// Issues a signed refresh token for the given subject id.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Signing`] if encoding fails.
    pub fn issue_refresh(&self, subject: &str) -> Result<String, TokenError> {
        let (iat, exp) = stamp(self.refresh.ttl);
        let wire = RefreshTokenClaims {
            sub: subject.to_string(),
            iat,
            exp,
        };
        let token = sign(&wire, &self.refresh.encoding)?;
        trace!(sub = %subject, exp, "issued refresh token");
        Ok(token)
    }

    /// Verifies a refresh token and returns the subject id it was issued to.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Expired`] or [`TokenError::Invalid`] as for
    /// [`verify_access`](Self::verify_access).
    pub fn verify_refresh(&self, token: &str) -> Result<String, TokenError> {
        let wire: RefreshTokenClaims = verify(token, &self.refresh.decoding)?;
        Ok(wire.sub)
    }

    /// The configured access-token TTL.
    pub fn access_ttl(&self) -> Duration {
        self.access.ttl
    }

    /// The configured refresh-token TTL.
    pub fn refresh_ttl(&self) -> Duration {
        self.refresh.ttl
    }
}

/// Issued-at and expiry timestamps for a token minted now.
fn stamp(ttl: Duration) -> (i64, i64) {
    let iat = Utc::now().timestamp();
    (iat, iat.saturating_add(ttl.as_secs() as i64))
}

fn sign<T: Serialize>(claims: &T, key: &EncodingKey) -> Result<String, TokenError> {
    encode(&Header::new(Algorithm::HS256), claims, key)
        .map_err(|err| TokenError::Signing(err.to_string()))
}

fn verify<T: DeserializeOwned>(token: &str, key: &DecodingKey) -> Result<T, TokenError> {
    // Zero leeway keeps expiry deterministic.
    let mut validation = Validation::new(Algorithm::HS256);
    validation.leeway = 0;

    decode::<T>(token, key, &validation)
        .map(|data| data.claims)
        .map_err(|err| match err.kind() {
            ErrorKind::ExpiredSignature => TokenError::Expired,
            _ => TokenError::Invalid,
        })
}
