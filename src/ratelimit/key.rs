//! Client key validation and handling.

use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

/// Longest accepted client key, in bytes.
pub const MAX_KEY_LEN: usize = 256;

/// Why a raw client identifier was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidKey {
    /// Empty or whitespace only
    Empty,
    /// Longer than [`MAX_KEY_LEN`] bytes
    TooLong(usize),
    /// Contains a control character (newline, NUL, ...)
    ControlCharacter,
}

impl fmt::Display for InvalidKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidKey::Empty => write!(f, "client key is empty"),
            InvalidKey::TooLong(len) => {
                write!(f, "client key is {} bytes, limit is {}", len, MAX_KEY_LEN)
            }
            InvalidKey::ControlCharacter => write!(f, "client key contains a control character"),
        }
    }
}

/// An opaque identifier for the caller being throttled, e.g. a remote address.
///
/// Keys are compared byte for byte; `10.0.0.1` and ` 10.0.0.1` are different
/// clients. Cloning is cheap.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientKey(Arc<str>);

impl ClientKey {
    /// Validate and wrap a raw identifier.
    pub fn parse(raw: &str) -> Result<Self, InvalidKey> {
        Self::validate(raw)?;
        Ok(Self(Arc::from(raw)))
    }

    /// Check a raw identifier without allocating.
    pub fn validate(raw: &str) -> Result<(), InvalidKey> {
        if raw.trim().is_empty() {
            return Err(InvalidKey::Empty);
        }
        if raw.len() > MAX_KEY_LEN {
            return Err(InvalidKey::TooLong(raw.len()));
        }
        if raw.chars().any(char::is_control) {
            return Err(InvalidKey::ControlCharacter);
        }
        Ok(())
    }

    /// Wrap an identifier that already passed [`ClientKey::validate`].
    pub(crate) fn from_validated(raw: &str) -> Self {
        Self(Arc::from(raw))
    }

    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for ClientKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
