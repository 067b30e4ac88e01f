/// Bearer-token authorization for sync calls
use axum::http::{header, HeaderMap};
use sha2::{Digest, Sha256};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthReason {
    Accepted,
    MissingHeader,
    MalformedHeader,
    WrongToken,
}

impl fmt::Display for AuthReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthReason::Accepted => write!(f, "accepted"),
            AuthReason::MissingHeader => write!(f, "missing authorization header"),
            AuthReason::MalformedHeader => write!(f, "malformed authorization header"),
            AuthReason::WrongToken => write!(f, "wrong token"),
        }
    }
}

/// Outcome of an authorization check, kept separate from error channels so
/// every refusal is logged with its reason
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthDecision {
    pub authorized: bool,
    pub reason: AuthReason,
}

impl AuthDecision {
    fn accept() -> Self {
        Self {
            authorized: true,
            reason: AuthReason::Accepted,
        }
    }

    fn refuse(reason: AuthReason) -> Self {
        Self {
            authorized: false,
            reason,
        }
    }
}

/// Validate the `Authorization: Bearer <token>` header
pub fn authorize(headers: &HeaderMap, token: &str) -> AuthDecision {
    let Some(value) = headers.get(header::AUTHORIZATION) else {
        return AuthDecision::refuse(AuthReason::MissingHeader);
    };

    let Some(presented) = value
        .to_str()
        .ok()
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
    else {
        return AuthDecision::refuse(AuthReason::MalformedHeader);
    };

    check_token(presented, token)
}

/// Compare a presented token against the shared secret.
///
/// Both sides are hashed first so the comparison does not depend on where
/// the first differing byte is.
pub fn check_token(presented: &str, token: &str) -> AuthDecision {
    if Sha256::digest(presented.as_bytes()) == Sha256::digest(token.as_bytes()) {
        AuthDecision::accept()
    } else {
        AuthDecision::refuse(AuthReason::WrongToken)
    }
}
