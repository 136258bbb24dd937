//! Traits and implementations for the keyed derivations the time-wait list relies on
//!
//! Only one primitive is needed: an HMAC used to derive stateless reset tokens from connection
//! IDs. An implementation backed by `ring` is provided when the `ring` feature is enabled.

#[cfg(feature = "ring")]
mod ring;

/// A pseudo random key for HMAC calculations
///
/// Implementations must be deterministic: signing the same data twice yields the same output.
pub trait HmacKey: Send + Sync {
    /// Method for signing a message
    fn sign(&self, data: &[u8], signature_out: &mut [u8]);
    /// Length of `sign`'s output
    fn signature_len(&self) -> usize;
}
