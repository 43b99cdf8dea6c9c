use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};

use crate::blind::{BlindSignature, BlindedMessage, IssuerPublicKey, Signature, Unblinder};
use crate::error::{BlindError, DecodeError};
use crate::hash::{Digest256, FieldHasher};

const TOKEN_DOMAIN: &str = "votecommit/token/v1";

/// Opaque random 256-bit token identifier, chosen by the voter.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenId(Digest256);

impl TokenId {
    pub fn random<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut bytes = [0; 32];
        rng.fill_bytes(&mut bytes);
        Self(Digest256::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }
}

impl Display for TokenId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Debug for TokenId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "TokenId({})", self.0)
    }
}

impl FromStr for TokenId {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// The message the issuer (blindly) signs for a token.
pub fn token_message(election_id: &str, token_id: &TokenId) -> Digest256 {
    let mut hasher = FieldHasher::new(TOKEN_DOMAIN);
    hasher.field(election_id).field(token_id.as_bytes());
    hasher.finish()
}

/// A finalised one-time voting credential, held only by the voter.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BlindToken {
    pub token_id: TokenId,
    pub election_id: String,
    pub signature: Signature,
    pub issued_at: DateTime<Utc>,
}

impl BlindToken {
    /// Check the issuer's signature on this token.
    pub fn verify(&self, issuer: &IssuerPublicKey) -> Result<(), BlindError> {
        let message = token_message(&self.election_id, &self.token_id);
        issuer.verify(message.as_bytes(), &self.signature)
    }
}

/// Voter-side state between asking for a token and receiving the issuer's
/// blind signature.
pub struct TokenRequest {
    token_id: TokenId,
    election_id: String,
    unblinder: Unblinder,
    blinded: BlindedMessage,
}

impl TokenRequest {
    /// Pick a fresh token id and blind it for the issuer.
    pub fn new<R>(
        issuer: &IssuerPublicKey,
        election_id: &str,
        rng: &mut R,
    ) -> Result<Self, BlindError>
    where
        R: RngCore + CryptoRng,
    {
        let token_id = TokenId::random(rng);
        let message = token_message(election_id, &token_id);
        let (blinded, unblinder) = issuer.blind(message.as_bytes(), rng)?;
        Ok(Self {
            token_id,
            election_id: election_id.to_string(),
            unblinder,
            blinded,
        })
    }

    /// The value to send to the issuer.
    pub fn blinded(&self) -> &BlindedMessage {
        &self.blinded
    }

    /// Unblind the issuer's response into a usable token, checking it on the way.
    pub fn finalize(
        self,
        issuer: &IssuerPublicKey,
        blind_signature: &BlindSignature,
        issued_at: DateTime<Utc>,
    ) -> Result<BlindToken, BlindError> {
        let token = BlindToken {
            token_id: self.token_id,
            election_id: self.election_id,
            signature: issuer.unblind(blind_signature, &self.unblinder),
            issued_at,
        };
        token.verify(issuer)?;
        Ok(token)
    }
}

#[cfg(test)]
pub(crate) mod examples {
    use rand::rngs::OsRng;

    use super::*;
    use crate::blind::IssuerKey;

    impl BlindToken {
        /// Run the whole blind issuance flow against the example key.
        pub fn example(election_id: &str) -> Self {
            let key = IssuerKey::example();
            let request = TokenRequest::new(key.public_key(), election_id, &mut OsRng).unwrap();
            let blind_signature = key.sign_blinded(request.blinded()).unwrap();
            request
                .finalize(key.public_key(), &blind_signature, Utc::now())
                .unwrap()
        }
    }
}
