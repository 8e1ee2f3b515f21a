//! Identity service: collision-resistant identifier minting and explicit-id
//! admission.
//!
//! New identifiers draw a fresh random 128-bit value, encode it in base-36,
//! and take the shortest prefix (configurable, minimum 4 characters) that is
//! free in the store. A collision extends the candidate by one character and
//! retries, bounded by the configured maximum (8); the birthday bound keeps
//! the short form overwhelmingly likely at realistic issue counts. Explicit
//! identifiers are validated against the alphabet and the tombstone
//! manifest.

use rand::Rng;

use crate::error::{BeadsError, Result};
use crate::model::{ID_ALPHABET, IssueId};
use crate::store::Store;

/// Redraws of the random value before giving up. Exhausting this means the
/// id space at the maximum length is effectively full.
const MINT_REDRAWS: usize = 16;

/// Encode a 128-bit value as lowercase base-36, most significant digit
/// first, without leading zeros (a zero value encodes as `"0"`).
#[must_use]
pub fn base36_encode(mut value: u128) -> String {
    if value == 0 {
        return "0".to_owned();
    }
    let mut digits = Vec::new();
    while value > 0 {
        digits.push(ID_ALPHABET[(value % 36) as usize]);
        value /= 36;
    }
    digits.reverse();
    String::from_utf8(digits).unwrap_or_default()
}

/// Mint a fresh identifier under `prefix`.
///
/// `min_len`/`max_len` bound the hash length (see `id.min_length` /
/// `id.max_length`); both must lie within the 4..=8 identifier format
/// bounds, which [`crate::config::WorkspaceConfig::load`] enforces.
///
/// # Errors
/// `InvalidId` for a bad prefix; `DuplicateId` if no free identifier was
/// found after the redraw budget.
pub fn mint_id(store: &Store, prefix: &str, min_len: usize, max_len: usize) -> Result<IssueId> {
    IssueId::validate_prefix(prefix)?;
    let mut rng = rand::rng();
    for _ in 0..MINT_REDRAWS {
        let value: u128 = rng.random();
        let encoded = base36_encode(value);
        // A u128 encodes to at most 25 base-36 digits; pad short draws so
        // every prefix length is available.
        let encoded = if encoded.len() < max_len {
            format!("{encoded:0>max_len$}")
        } else {
            encoded
        };
        for len in min_len..=max_len {
            let candidate = IssueId::new(&format!("{prefix}-{}", &encoded[..len]))?;
            if !store.issue_exists(&candidate)? && !store.is_tombstoned(&candidate)? {
                return Ok(candidate);
            }
        }
    }
    Err(BeadsError::DuplicateId {
        id: IssueId::new(&format!("{prefix}-{}", "0".repeat(min_len)))?,
    })
}

/// Admit a caller-supplied identifier: validate the format and reject
/// duplicates and tombstoned ids.
///
/// Prefix routing happens before this point (the workspace router may have
/// sent the command elsewhere); by the time an explicit id reaches the
/// identity service it is expected to belong to this workspace.
///
/// # Errors
/// `InvalidId`, `DuplicateId`, or `Tombstoned`.
pub fn admit_explicit(store: &Store, raw: &str) -> Result<IssueId> {
    let id = IssueId::new(raw)?;
    if store.is_tombstoned(&id)? {
        return Err(BeadsError::Tombstoned { id });
    }
    if store.issue_exists(&id)? {
        return Err(BeadsError::DuplicateId { id });
    }
    Ok(id)
}

/// The next free hierarchical child id under `parent`: the smallest `N`
/// such that `<parent>.N` exists neither live nor tombstoned.
///
/// # Errors
/// `NotFound` if the parent does not exist.
pub fn next_child_id(store: &Store, parent: &IssueId) -> Result<IssueId> {
    if !store.issue_exists(parent)? {
        return Err(BeadsError::NotFound { id: parent.clone() });
    }
    let mut n = 1u32;
    loop {
        let candidate = parent.child(n);
        if !store.issue_exists(&candidate)? && !store.is_tombstoned(&candidate)? {
            return Ok(candidate);
        }
        n += 1;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
