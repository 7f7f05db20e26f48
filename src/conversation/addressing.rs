//! Deterministic conversation addressing.
//!
//! An unordered pair of identity ids maps to one stable conversation id:
//! `dm:{a}:{b}` with the lexicographically smaller id first, so the same log
//! is reachable regardless of which participant initiates. Identity ids are
//! restricted to `[a-z0-9_-]` at registration, which keeps the `:` separator
//! unforgeable and the mapping injective over unordered pairs.

use crate::error::Error;

/// Maximum identity id length accepted at registration.
pub const MAX_IDENTITY_ID_LEN: usize = 32;

/// Whether `id` is acceptable as an identity id: non-empty, bounded length,
/// lowercase alphanumerics plus `_` and `-` only.
pub fn valid_identity_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_IDENTITY_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

/// Compute the conversation id for the unordered pair `{a, b}`.
/// Pure and commutative; fails only on empty/invalid ids.
pub fn conversation_id(a: &str, b: &str) -> Result<String, Error> {
    if !valid_identity_id(a) {
        return Err(Error::InvalidIdentity(a.to_string()));
    }
    if !valid_identity_id(b) {
        return Err(Error::InvalidIdentity(b.to_string()));
    }

    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    Ok(format!("dm:{lo}:{hi}"))
}
