//! Error composition for the HTTP surface.
//!
//! Each component reports its own narrow error enum ([`TokenError`],
//! [`SessionError`], [`GatewayError`]); this module folds them into
//! [`ApiError`], the one type route handlers return. The mapping is fixed:
//! authentication-class failures become `401` with a machine-readable reason
//! code and no internal detail, everything else becomes `500` and is logged
//! before it leaves the process.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;
use tracing::error;

use crate::gateway::GatewayError;
use crate::session::SessionError;
use crate::token::TokenError;

/// Top-level error returned by HTTP route handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Token issuance or verification failure.
    #[error(transparent)]
    Token(#[from] TokenError),

    /// Refresh-rotation failure.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Connection-gateway failure.
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

/// JSON error response body.
#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    code: &'static str,
}

impl ApiError {
    /// The machine-readable reason code for this error.
    ///
    /// Codes are part of the wire protocol; clients branch on them, so they
    /// stay stable even when messages change.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Token(err) | Self::Session(SessionError::Token(err)) => token_code(err),
            Self::Session(SessionError::RefreshTokenStale) => "refresh_token_stale",
            Self::Session(SessionError::IdentityNotFound) => "identity_not_found",
            Self::Session(SessionError::Store(_)) => "internal_error",
            Self::Gateway(err) => gateway_code(err),
        }
    }

    /// The HTTP status this error maps to.
    pub fn status(&self) -> StatusCode {
        let client_error = match self {
            Self::Token(err) => err.is_client_error(),
            Self::Session(err) => err.is_client_error(),
            Self::Gateway(err) => !matches!(err, GatewayError::Token(TokenError::Signing(_))),
        };
        if client_error {
            StatusCode::UNAUTHORIZED
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Reason code for a token failure.
fn token_code(err: &TokenError) -> &'static str {
    match err {
        TokenError::Invalid => "token_invalid",
        TokenError::Expired => "token_expired",
        TokenError::Signing(_) => "internal_error",
    }
}

/// Reason code for a gateway failure. Also used for `auth-error` and
/// `error` frames on the socket surface.
pub fn gateway_code(err: &GatewayError) -> &'static str {
    match err {
        GatewayError::Token(token) => token_code(token),
        GatewayError::NotAuthenticated => "not_authenticated",
        GatewayError::UnknownConnection => "unknown_connection",
        GatewayError::HandshakeTimeout => "handshake_timeout",
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        // 401 bodies carry the reason code only; internal failures are
        // logged with detail here and leave the process as a generic 500.
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self, "internal error on HTTP surface");
            "internal server error".to_string()
        } else {
            self.to_string()
        };

        (
            status,
            Json(ErrorBody {
                error: message,
                code: self.code(),
            }),
        )
            .into_response()
    }
}
