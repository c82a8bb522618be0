//! Jail name validation and content digests.

use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use std::str::FromStr;

use crate::error::{ForgeError, ForgeResult};

/// A validated jail name.
///
/// Jail names must:
/// - Be 1-64 characters long
/// - Contain only alphanumeric characters, hyphens, and underscores
/// - Start with an alphanumeric character
///
/// The same rules keep the name safe to embed in dataset names and in
/// `jail.conf` block headers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JailName(String);

impl JailName {
    /// Maximum length of a jail name.
    pub const MAX_LENGTH: usize = 64;

    /// Create a new jail name, validating the format.
    ///
    /// # Errors
    ///
    /// Returns an error if the name format is invalid.
    pub fn new(name: impl Into<String>) -> ForgeResult<Self> {
        let name = name.into();
        Self::validate(&name)?;
        Ok(Self(name))
    }

    /// Get the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(name: &str) -> ForgeResult<()> {
        let invalid = || ForgeError::InvalidName {
            name: name.to_string(),
        };

        if name.is_empty() || name.len() > Self::MAX_LENGTH {
            return Err(invalid());
        }

        let mut chars = name.chars();
        if !chars.next().is_some_and(|c| c.is_ascii_alphanumeric()) {
            return Err(invalid());
        }

        if !chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            return Err(invalid());
        }

        Ok(())
    }
}

impl fmt::Display for JailName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JailName {
    type Err = ForgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for JailName {
    type Error = ForgeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<JailName> for String {
    fn from(name: JailName) -> Self {
        name.0
    }
}

impl AsRef<str> for JailName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A content digest (e.g., sha256:abc123...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Digest {
    /// The algorithm used (e.g., "sha256").
    pub algorithm: String,
    /// The hex-encoded hash.
    pub hash: String,
}

impl Digest {
    /// Create a new digest.
    #[must_use]
    pub fn new(algorithm: impl Into<String>, hash: impl Into<String>) -> Self {
        Self {
            algorithm: algorithm.into(),
            hash: hash.into(),
        }
    }

    /// SHA-256 digest of `data`.
    #[must_use]
    pub fn sha256_of(data: impl AsRef<[u8]>) -> Self {
        use sha2::Digest as _;
        Self::new("sha256", hex::encode(Sha256::digest(data.as_ref())))
    }

    /// Check `data` against this digest.
    ///
    /// # Errors
    ///
    /// Returns [`ForgeError::DigestMismatch`] if the content differs, or
    /// [`ForgeError::Config`] for algorithms other than sha256.
    pub fn verify(&self, data: impl AsRef<[u8]>) -> ForgeResult<()> {
        self.check(&Self::sha256_of(data))
    }

    /// Compare an already computed sha256 digest against this one.
    ///
    /// # Errors
    ///
    /// Same as [`Digest::verify`].
    pub fn check(&self, actual: &Self) -> ForgeResult<()> {
        if self.algorithm != "sha256" {
            return Err(ForgeError::Config {
                message: format!("unsupported digest algorithm: {}", self.algorithm),
            });
        }
        if actual.algorithm == self.algorithm && actual.hash.eq_ignore_ascii_case(&self.hash) {
            Ok(())
        } else {
            Err(ForgeError::DigestMismatch {
                expected: self.to_string(),
                actual: actual.to_string(),
            })
        }
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hash)
    }
}

impl FromStr for Digest {
    type Err = ForgeError;

    /// Parses `algorithm:hash`; a bare hash is taken as sha256.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((algorithm, hash)) if !algorithm.is_empty() && !hash.is_empty() => {
                Ok(Self::new(algorithm, hash))
            }
            None if !s.is_empty() => Ok(Self::new("sha256", s)),
            _ => Err(ForgeError::Config {
                message: format!("invalid digest: {s}"),
            }),
        }
    }
}
