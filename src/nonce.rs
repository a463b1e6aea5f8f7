//! Single-use punch tokens

use std::fmt;

use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::Rng;

/// A random token proving a reconnection answers a specific challenge.
///
/// Drawn from the OS CSPRNG, so it carries nothing derivable from timing or
/// issue order. The alphabet is alphanumeric so the token survives the
/// whitespace-delimited control protocol unchanged.
#[derive(Clone, PartialEq, Eq)]
pub struct Nonce(String);

impl Nonce {
    /// Generate a nonce of `length` bytes
    pub fn generate(length: usize) -> Self {
        let token: String = OsRng
            .sample_iter(&Alphanumeric)
            .take(length)
            .map(char::from)
            .collect();
        Self(token)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Byte-for-byte comparison that does not short-circuit on the first difference
    pub fn matches(&self, candidate: &[u8]) -> bool {
        constant_time_eq(self.as_bytes(), candidate)
    }
}

/// Equality that does not short-circuit on the first differing byte.
/// Lengths are not secret.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

// Nonces are credentials for the lifetime of a challenge
impl fmt::Debug for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Nonce(<{} bytes>)", self.0.len())
    }
}
