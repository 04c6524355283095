//! Single-use tokens for email verification and password resets.
//!
//! Only the SHA-256 digest of a token is kept. The plain token is handed back
//! once, when it is issued, so that it can be sent to the user.

use rand::{RngCore, rngs::OsRng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::{Duration, OffsetDateTime};

/// How long a password reset token stays valid after it is issued.
pub const RESET_TOKEN_LIFETIME: Duration = Duration::hours(1);

/// The number of random bytes in a token, before hex encoding.
const TOKEN_BYTES: usize = 32;

/// Errors from redeeming a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    /// The candidate does not match the issued token.
    #[error("the token does not match")]
    Mismatch,

    /// The token has already been used.
    #[error("the token has already been used")]
    Consumed,

    /// The token was redeemed too late.
    #[error("the token has expired")]
    Expired,
}

/// A pending email verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationToken {
    digest: Option<String>,
}

impl VerificationToken {
    /// Issue a new verification token.
    ///
    /// Returns the pending verification and the plain token to send to the
    /// user.
    pub fn generate() -> (Self, String) {
        let token = random_token();
        let pending = Self {
            digest: Some(digest(&token)),
        };

        (pending, token)
    }

    /// Whether the token is still waiting to be used.
    pub fn is_pending(&self) -> bool {
        self.digest.is_some()
    }

    /// Check `candidate` against the issued token and consume it on a match.
    ///
    /// # Errors
    /// Returns [TokenError::Consumed] if the token was already used, or
    /// [TokenError::Mismatch] if `candidate` is not the issued token.
    pub fn verify(&mut self, candidate: &str) -> Result<(), TokenError> {
        let expected = self.digest.as_deref().ok_or(TokenError::Consumed)?;

        if digest(candidate) != expected {
            return Err(TokenError::Mismatch);
        }

        self.digest = None;
        Ok(())
    }
}

/// A pending password reset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetToken {
    digest: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    expires_at: OffsetDateTime,
}

impl ResetToken {
    /// Issue a reset token that expires [RESET_TOKEN_LIFETIME] after `now`.
    ///
    /// Returns the pending reset and the plain token to send to the user.
    pub fn issue(now: OffsetDateTime) -> (Self, String) {
        let token = random_token();
        let pending = Self {
            digest: Some(digest(&token)),
            expires_at: now + RESET_TOKEN_LIFETIME,
        };

        (pending, token)
    }

    /// When the token stops being accepted.
    pub fn expires_at(&self) -> OffsetDateTime {
        self.expires_at
    }

    /// Check `candidate` against the issued token at time `now` and consume it
    /// on a match.
    ///
    /// # Errors
    /// Returns [TokenError::Consumed] if the token was already used,
    /// [TokenError::Expired] if `now` is at or past the expiry time, or
    /// [TokenError::Mismatch] if `candidate` is not the issued token.
    pub fn redeem(&mut self, candidate: &str, now: OffsetDateTime) -> Result<(), TokenError> {
        let expected = self.digest.as_deref().ok_or(TokenError::Consumed)?;

        if now >= self.expires_at {
            return Err(TokenError::Expired);
        }

        if digest(candidate) != expected {
            return Err(TokenError::Mismatch);
        }

        self.digest = None;
        Ok(())
    }
}

fn random_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);

    hex::encode(bytes)
}

fn digest(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}
