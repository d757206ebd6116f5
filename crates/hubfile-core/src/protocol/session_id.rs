use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

use crate::error::Error;

/// 16-byte transfer session identifier.
///
/// Minted as a random version-4 UUID; on the wire it appears raw in binary
/// headers and as canonical lowercase `8-4-4-4-12` text in JSON.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId([u8; 16]);

impl SessionId {
    /// Mint a fresh random id.
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4().into_bytes())
    }

    /// Wrap raw bytes.
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Raw bytes as carried in binary headers.
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&Uuid::from_bytes(self.0).hyphenated(), f)
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({self})")
    }
}

impl FromStr for SessionId {
    type Err = Error;

    /// Accepts only the dashed 36-character form, in any case, with
    /// surrounding whitespace ignored.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim().to_ascii_lowercase();
        let bytes = text.as_bytes();
        let dashed = bytes.len() == 36
            && bytes[8] == b'-'
            && bytes[13] == b'-'
            && bytes[18] == b'-'
            && bytes[23] == b'-';
        if !dashed {
            return Err(Error::InvalidSession(s.to_string()));
        }
        Uuid::parse_str(&text)
            .map(|id| Self(id.into_bytes()))
            .map_err(|_| Error::InvalidSession(s.to_string()))
    }
}
