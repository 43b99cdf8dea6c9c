use std::fmt::{Display, Formatter};
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use data_encoding::BASE64URL_NOPAD;
use rand::{CryptoRng, RngCore};
use serde::{de::Error as _, Deserialize, Deserializer, Serialize, Serializer};

use crate::ballot::{Choice, Selection};
use crate::error::DecodeError;
use crate::hash::{Digest256, FieldHasher};
use crate::token::TokenId;

const COMMITMENT_DOMAIN: &str = "votecommit/commitment/v1";

/// Bytes of randomness in a server-generated salt.
pub const SALT_LEN: usize = 32;
/// Upper bound on voter-supplied salts.
pub const MAX_SALT_LEN: usize = 256;

/// Length of a receipt code in characters.
pub const RECEIPT_CODE_LEN: usize = 16;

/// Secret blinding value mixed into a commitment. Base64url on the wire.
#[derive(Clone, Eq, PartialEq)]
pub struct Salt(Vec<u8>);

impl Salt {
    pub fn random<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut bytes = vec![0; SALT_LEN];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Salts must be non-empty and bounded.
    pub fn is_acceptable(&self) -> bool {
        !self.0.is_empty() && self.0.len() <= MAX_SALT_LEN
    }
}

impl std::fmt::Debug for Salt {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        // Salts are secret; keep them out of logs.
        write!(f, "Salt(..)")
    }
}

impl Serialize for Salt {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64URL_NOPAD.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Salt {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = BASE64URL_NOPAD
            .decode(s.as_bytes())
            .map_err(|_| D::Error::custom(DecodeError::Base64))?;
        Ok(Self(bytes))
    }
}

/// Start of the coarse time window a commitment was made in, in unix seconds.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimestampBucket(u64);

impl TimestampBucket {
    /// The bucket of width `width_secs` containing `time`.
    pub fn containing(time: DateTime<Utc>, width_secs: u64) -> Self {
        let secs = u64::try_from(time.timestamp()).unwrap_or(0);
        let width = width_secs.max(1);
        Self(secs - secs % width)
    }

    pub fn from_secs(secs: u64) -> Self {
        Self(secs)
    }

    pub fn secs(&self) -> u64 {
        self.0
    }

    /// The bucket start as a timestamp.
    pub fn start(&self) -> DateTime<Utc> {
        i64::try_from(self.0)
            .ok()
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

/// Compute `H(electionId ∥ tokenId ∥ selections ∥ salt ∥ timestampBucket)`.
pub fn commitment_hash(
    election_id: &str,
    token_id: &TokenId,
    selections: &[Selection],
    salt: &Salt,
    bucket: TimestampBucket,
) -> Digest256 {
    let mut hasher = FieldHasher::new(COMMITMENT_DOMAIN);
    hasher
        .field(election_id)
        .field(token_id.as_bytes())
        .int(selections.len() as u64);
    for selection in selections {
        hasher.field(&selection.contest_id);
        match &selection.choice {
            Choice::Option(option) => hasher.field([0u8]).field(option),
            Choice::WriteIn(name) => hasher.field([1u8]).field(name),
        };
    }
    hasher.field(salt.as_bytes()).int(bucket.secs());
    hasher.finish()
}

/// A cast ballot reduced to its commitment. Write-once.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Commitment {
    pub commitment_hash: Digest256,
    pub election_id: String,
    pub salt: Salt,
    pub timestamp_bucket: TimestampBucket,
    pub created_at: DateTime<Utc>,
}

impl Commitment {
    pub fn derive(
        election_id: &str,
        token_id: &TokenId,
        selections: &[Selection],
        salt: Salt,
        bucket: TimestampBucket,
    ) -> Self {
        Self {
            commitment_hash: commitment_hash(election_id, token_id, selections, &salt, bucket),
            election_id: election_id.to_string(),
            salt,
            timestamp_bucket: bucket,
            created_at: bucket.start(),
        }
    }

    pub fn receipt_code(&self) -> ReceiptCode {
        ReceiptCode::of(&self.commitment_hash)
    }
}

/// Short, human-typable form of a commitment hash: its first 16 hex digits
/// in upper case.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReceiptCode(String);

impl ReceiptCode {
    pub fn of(hash: &Digest256) -> Self {
        Self(hash.to_hex()[..RECEIPT_CODE_LEN].to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ReceiptCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ReceiptCode {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != RECEIPT_CODE_LEN {
            return Err(DecodeError::Length {
                expected: RECEIPT_CODE_LEN,
                actual: s.len(),
            });
        }
        if !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(DecodeError::Hex);
        }
        Ok(Self(s.to_ascii_uppercase()))
    }
}

/// Everything a voter keeps to check their own vote later.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct VoterReceipt {
    pub election_id: String,
    pub token_id: TokenId,
    pub selections: Vec<Selection>,
    pub salt: Salt,
    pub timestamp_bucket: TimestampBucket,
    pub commitment_hash: Digest256,
}

impl VoterReceipt {
    /// Recompute the commitment hash from the receipt's private inputs.
    pub fn recompute(&self) -> Digest256 {
        commitment_hash(
            &self.election_id,
            &self.token_id,
            &self.selections,
            &self.salt,
            self.timestamp_bucket,
        )
    }

    /// Whether the recorded hash matches the receipt's contents.
    pub fn is_consistent(&self) -> bool {
        self.recompute() == self.commitment_hash
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::OsRng;

    use super::*;

    fn inputs() -> (TokenId, Vec<Selection>, TimestampBucket) {
        (
            "11".repeat(32).parse().unwrap(),
            vec![Selection::option("president", "alice")],
            TimestampBucket::from_secs(1_700_000_100),
        )
    }

    #[test]
    fn commitment_is_deterministic() {
        let (token, selections, bucket) = inputs();
        let first = Commitment::derive("E1", &token, &selections, Salt::from_bytes("s1"), bucket);
        let second = Commitment::derive("E1", &token, &selections, Salt::from_bytes("s1"), bucket);
        assert_eq!(first.commitment_hash, second.commitment_hash);
    }

    #[test]
    fn every_input_changes_the_hash() {
        let (token, selections, bucket) = inputs();
        let salt = Salt::from_bytes("s1");
        let base = commitment_hash("E1", &token, &selections, &salt, bucket);

        let other_token = TokenId::random(&mut OsRng);
        let variants = [
            commitment_hash("E2", &token, &selections, &salt, bucket),
            commitment_hash("E1", &other_token, &selections, &salt, bucket),
            commitment_hash(
                "E1",
                &token,
                &[Selection::option("president", "bob")],
                &salt,
                bucket,
            ),
            commitment_hash(
                "E1",
                &token,
                &[Selection::write_in("president", "alice")],
                &salt,
                bucket,
            ),
            commitment_hash("E1", &token, &selections, &Salt::from_bytes("s2"), bucket),
            commitment_hash(
                "E1",
                &token,
                &selections,
                &salt,
                TimestampBucket::from_secs(bucket.secs() + 300),
            ),
        ];
        for variant in variants {
            assert_ne!(variant, base);
        }
    }

    #[test]
    fn buckets_discard_fine_timing() {
        let early = Utc.timestamp_opt(1_700_000_001, 0).unwrap();
        let late = Utc.timestamp_opt(1_700_000_299, 0).unwrap();
        let next = Utc.timestamp_opt(1_700_000_400, 0).unwrap();
        assert_eq!(
            TimestampBucket::containing(early, 300),
            TimestampBucket::containing(late, 300)
        );
        assert_ne!(
            TimestampBucket::containing(early, 300),
            TimestampBucket::containing(next, 300)
        );
        assert_eq!(TimestampBucket::containing(early, 300).secs() % 300, 0);
    }

    #[test]
    fn receipt_code_format() {
        let hash = Digest256::of("anything");
        let code = ReceiptCode::of(&hash);
        assert_eq!(code.as_str().len(), RECEIPT_CODE_LEN);
        assert_eq!(code.as_str(), hash.to_hex()[..16].to_uppercase());
        assert_eq!(code.as_str().to_lowercase().parse::<ReceiptCode>(), Ok(code));
        assert!("XYZ".parse::<ReceiptCode>().is_err());
        assert!("ZZZZZZZZZZZZZZZZ".parse::<ReceiptCode>().is_err());
    }

    #[test]
    fn voter_receipt_detects_tampering() {
        let (token, selections, bucket) = inputs();
        let commitment =
            Commitment::derive("E1", &token, &selections, Salt::from_bytes("s1"), bucket);
        let mut receipt = VoterReceipt {
            election_id: "E1".to_string(),
            token_id: token,
            selections,
            salt: commitment.salt.clone(),
            timestamp_bucket: bucket,
            commitment_hash: commitment.commitment_hash,
        };
        assert!(receipt.is_consistent());

        receipt.selections = vec![Selection::option("president", "bob")];
        assert!(!receipt.is_consistent());
    }
}
