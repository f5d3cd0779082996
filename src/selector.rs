//! Credential selection by hint.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::identity::Identity;

/// Picks the identity to use for `hint`.
///
/// An empty hint selects the issuer's default identity (the first one). A
/// non-empty hint selects the only identity carrying exactly that hint. There is
/// no fallback: a missing hint is an error even when other identities exist.
///
/// # Errors
///
/// - [`Error::CredentialNotFound`] if `identities` is empty, or no identity
///   carries `hint`.
/// - [`Error::DuplicateHint`] if several identities carry `hint`.
pub fn select<'a>(identities: &'a [Arc<Identity>], hint: &str) -> Result<&'a Arc<Identity>> {
    if hint.is_empty() {
        return identities.first().ok_or_else(|| Error::CredentialNotFound {
            hint: String::new(),
        });
    }

    let mut matching = identities.iter().filter(|id| id.hint() == hint);
    let found = matching.next().ok_or_else(|| Error::CredentialNotFound {
        hint: hint.to_owned(),
    })?;

    if matching.next().is_some() {
        return Err(Error::DuplicateHint {
            hint: hint.to_owned(),
        });
    }

    Ok(found)
}
