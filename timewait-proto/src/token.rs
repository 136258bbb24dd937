use std::{fmt, hash};

use crate::{crypto::HmacKey, shared::ConnectionId, RESET_TOKEN_SIZE};

/// Stateless reset token
///
/// Used for an endpoint to securely communicate that it has lost state for a connection. Derived
/// on demand from the connection ID and the endpoint's reset key, so nothing per-connection has
/// to be stored to produce it.
#[derive(Debug, Copy, Clone)]
pub struct ResetToken([u8; RESET_TOKEN_SIZE]);

impl ResetToken {
    /// Derive the token for `id` under `key`
    ///
    /// Deterministic: the same key and connection ID always produce the same token.
    pub fn new(key: &dyn HmacKey, id: &ConnectionId) -> Self {
        let mut signature = vec![0; key.signature_len()];
        key.sign(id, &mut signature);
        let mut result = [0; RESET_TOKEN_SIZE];
        result.copy_from_slice(&signature[..RESET_TOKEN_SIZE]);
        result.into()
    }
}

impl PartialEq for ResetToken {
    fn eq(&self, other: &Self) -> bool {
        crate::constant_time::eq(&self.0, &other.0)
    }
}

impl Eq for ResetToken {}

impl hash::Hash for ResetToken {
    fn hash<H: hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl From<[u8; RESET_TOKEN_SIZE]> for ResetToken {
    fn from(x: [u8; RESET_TOKEN_SIZE]) -> Self {
        Self(x)
    }
}

impl std::ops::Deref for ResetToken {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for ResetToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.iter() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}
