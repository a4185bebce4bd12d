//! Whitelist-validated identifiers for table, column and alias names.
//!
//! Identifiers cannot be bound as statement parameters, so every name that is
//! interpolated into SQL goes through [`SafeIdent`] first.

use crate::error::{Result, ServiceError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Postgres truncates identifiers beyond this many bytes, which would break
/// alias decoding on the way back.
pub const MAX_IDENT_BYTES: usize = 63;

const FORBIDDEN: &[char] = &['"', '\'', '`', '\\', ';', '?', '%', '|'];

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SafeIdent(String);

impl SafeIdent {
    pub fn new(raw: &str) -> Result<Self> {
        validate_component(raw)?;
        check_length(raw)?;
        Ok(Self(raw.to_string()))
    }

    /// For compile-time schema constants only.
    pub(crate) fn trusted(raw: &str) -> Self {
        debug_assert!(validate_component(raw).is_ok(), "invalid constant identifier {raw}");
        Self(raw.to_string())
    }

    /// Builds a group alias whose components were validated individually.
    /// The reserved prefix and delimiter are allowed here and only here.
    pub(crate) fn group_alias(encoded: String) -> Result<Self> {
        check_length(&encoded)?;
        Ok(Self(encoded))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn quoted(&self) -> String {
        format!("\"{}\"", self.0)
    }

    /// `"table"."column"` form used by every builder.
    pub fn qualified(&self, relation: &SafeIdent) -> String {
        format!("{}.{}", relation.quoted(), self.quoted())
    }
}

/// Rejects empty strings, control characters, quoting characters, the
/// placeholder marker and the reserved group alias characters.
pub fn validate_component(raw: &str) -> Result<()> {
    if raw.trim().is_empty() {
        return Err(ServiceError::InvalidIdentifier(
            "identifier must not be empty".into(),
        ));
    }

    if let Some(ch) = raw
        .chars()
        .find(|ch| ch.is_control() || FORBIDDEN.contains(ch))
    {
        return Err(ServiceError::InvalidIdentifier(format!(
            "'{}' contains forbidden character {ch:?}",
            raw.escape_debug()
        )));
    }

    Ok(())
}

fn check_length(raw: &str) -> Result<()> {
    if raw.len() > MAX_IDENT_BYTES {
        return Err(ServiceError::InvalidIdentifier(format!(
            "'{raw}' exceeds {MAX_IDENT_BYTES} bytes"
        )));
    }
    Ok(())
}

impl TryFrom<String> for SafeIdent {
    type Error = ServiceError;

    fn try_from(value: String) -> Result<Self> {
        SafeIdent::new(&value)
    }
}

impl From<SafeIdent> for String {
    fn from(value: SafeIdent) -> Self {
        value.0
    }
}

impl fmt::Display for SafeIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
