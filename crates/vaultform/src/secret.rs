//! Vault token wrapper with automatic zeroing on drop.
//!
//! Debug and Display always show `[REDACTED]`, so the token can sit inside
//! `Debug`-derived client structs without leaking into logs.

use std::fmt;

use serde::{Deserialize, Deserializer};
use zeroize::Zeroizing;

/// A Vault access token, zeroed from memory on drop.
#[derive(Clone)]
pub struct VaultToken(Zeroizing<String>);

impl VaultToken {
    pub fn new(token: String) -> Self {
        Self(Zeroizing::new(token))
    }

    /// Raw token for the `X-Vault-Token` header.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for VaultToken {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::new)
    }
}

impl fmt::Debug for VaultToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl fmt::Display for VaultToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}
