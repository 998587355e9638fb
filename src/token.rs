//! Session tokens.
//!
//! A token names exactly one session on the relay. Either endpoint mints one
//! before connecting and shares it out-of-band; the relay only ever validates
//! and compares them. Possession of the token is the sole admission gate.

use std::fmt;
use std::str::FromStr;

use rand::Rng;
use rand::distributions::Alphanumeric;
use thiserror::Error;

/// The exact length of a session token.
pub const TOKEN_LENGTH: usize = 32;

/// An opaque session identifier: [`TOKEN_LENGTH`] ASCII letters and digits.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Token(String);

/// Why a candidate string is not a valid token.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("token must be exactly {TOKEN_LENGTH} characters, got {0}")]
    WrongLength(usize),

    #[error("token may only contain ASCII letters and digits")]
    InvalidCharacter,
}

impl Token {
    /// Mint a fresh random token.
    pub fn generate() -> Self {
        let token = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(TOKEN_LENGTH)
            .map(char::from)
            .collect();
        Self(token)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Token {
    type Err = TokenError;

    fn from_str(s: &str) -> Result<Self, TokenError> {
        if s.len() != TOKEN_LENGTH {
            return Err(TokenError::WrongLength(s.len()));
        }
        if !s.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(TokenError::InvalidCharacter);
        }
        Ok(Self(s.to_owned()))
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
