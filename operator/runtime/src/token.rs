//! Single-use bootstrap tokens, provisioned out-of-band by the operator
//! admin and redeemed exactly once against the sign-cert endpoint.

use parking_lot::Mutex;
use subtle::ConstantTimeEq;

#[derive(Debug, Default)]
pub struct TokenStore {
    tokens: Mutex<Vec<String>>,
}

// === impl TokenStore ===

impl TokenStore {
    pub fn new(tokens: impl IntoIterator<Item = String>) -> Self {
        Self {
            tokens: Mutex::new(tokens.into_iter().collect()),
        }
    }

    /// One token per line; blank lines are ignored.
    pub fn from_file(path: &std::path::Path) -> std::io::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(Self::new(
            contents
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(String::from),
        ))
    }

    pub fn len(&self) -> usize {
        self.tokens.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.lock().is_empty()
    }

    /// Consumes the token on a match. Every stored token is compared with a
    /// constant-time primitive, and the scan never exits early, so the
    /// response time does not depend on the presented bytes.
    pub fn redeem(&self, presented: &str) -> bool {
        let mut tokens = self.tokens.lock();
        let mut matched = None;
        for (i, token) in tokens.iter().enumerate() {
            if bool::from(token.as_bytes().ct_eq(presented.as_bytes())) {
                matched = Some(i);
            }
        }
        match matched {
            Some(i) => {
                tokens.remove(i);
                true
            }
            None => false,
        }
    }
}
