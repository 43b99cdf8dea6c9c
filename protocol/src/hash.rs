use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;

use data_encoding::HEXLOWER_PERMISSIVE;
use serde::{de::Error as _, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::error::DecodeError;

/// Length of every digest produced by this crate, in bytes.
pub const DIGEST_LEN: usize = 32;

/// A SHA-256 digest. Serialised as 64 lowercase hex characters.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Digest256([u8; DIGEST_LEN]);

impl Digest256 {
    /// The all-zero digest, used as the genesis link of hash chains.
    pub const ZERO: Self = Self([0; DIGEST_LEN]);

    pub fn from_bytes(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    /// Plain SHA-256 of some bytes, with no framing.
    pub fn of(data: impl AsRef<[u8]>) -> Self {
        Self(Sha256::digest(data.as_ref()).into())
    }

    /// Lowercase hex representation.
    pub fn to_hex(&self) -> String {
        HEXLOWER_PERMISSIVE.encode(&self.0)
    }
}

impl Display for Digest256 {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Debug for Digest256 {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Digest256({})", self.to_hex())
    }
}

impl FromStr for Digest256 {
    type Err = DecodeError;

    /// Parse exactly 64 hex characters; either case is accepted.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != DIGEST_LEN * 2 {
            return Err(DecodeError::Length {
                expected: DIGEST_LEN * 2,
                actual: s.len(),
            });
        }
        let bytes = HEXLOWER_PERMISSIVE
            .decode(s.as_bytes())
            .map_err(|_| DecodeError::Hex)?;
        let mut digest = [0; DIGEST_LEN];
        digest.copy_from_slice(&bytes);
        Ok(Self(digest))
    }
}

impl Serialize for Digest256 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Digest256 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// Builder for domain-separated hashes over several fields.
///
/// Every field is prefixed with its length as a big-endian `u64`, so two
/// different field lists can never produce the same byte stream.
pub struct FieldHasher {
    inner: Sha256,
}

impl FieldHasher {
    /// Start a hash under the given domain tag.
    pub fn new(domain: &str) -> Self {
        let mut hasher = Self {
            inner: Sha256::new(),
        };
        hasher.field(domain.as_bytes());
        hasher
    }

    /// Absorb one variable-length field.
    pub fn field(&mut self, data: impl AsRef<[u8]>) -> &mut Self {
        let data = data.as_ref();
        self.inner.update((data.len() as u64).to_be_bytes());
        self.inner.update(data);
        self
    }

    /// Absorb one fixed-width integer field.
    pub fn int(&mut self, value: u64) -> &mut Self {
        self.field(value.to_be_bytes())
    }

    pub fn finish(self) -> Digest256 {
        Digest256(self.inner.finalize().into())
    }
}
