//! RSA full-domain-hash blind signatures.
//!
//! The voter hashes their message into `Z_n`, multiplies it by `r^e` for a
//! random blinding factor `r`, and sends the result to the issuer. The issuer
//! raises it to `d` without learning anything about the message, and the
//! voter divides out `r` to obtain an ordinary RSA-FDH signature that anyone
//! can check against the issuer's public key.

use num_bigint_dig::{ModInverse, RandBigInt, ToBigUint};
use rand::{CryptoRng, RngCore};
use rsa::{
    pkcs8::DecodePrivateKey,
    traits::{PrivateKeyParts, PublicKeyParts},
    BigUint, RsaPrivateKey, RsaPublicKey,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::BlindError;

const FDH_DOMAIN: &[u8] = b"votecommit/fdh/v1";

/// The issuer's signing key. Never leaves the server.
#[derive(Clone)]
pub struct IssuerKey {
    private: RsaPrivateKey,
    public: IssuerPublicKey,
}

impl IssuerKey {
    /// Generate a fresh key of the given modulus size.
    pub fn generate<R>(rng: &mut R, bits: usize) -> Result<Self, BlindError>
    where
        R: RngCore + CryptoRng,
    {
        let private =
            RsaPrivateKey::new(rng, bits).map_err(|e| BlindError::Key(e.to_string()))?;
        Ok(Self::from_private(private))
    }

    /// Load a PKCS#8 PEM-encoded RSA private key.
    pub fn from_pkcs8_pem(pem: &str) -> Result<Self, BlindError> {
        let private =
            RsaPrivateKey::from_pkcs8_pem(pem).map_err(|e| BlindError::Key(e.to_string()))?;
        Ok(Self::from_private(private))
    }

    fn from_private(private: RsaPrivateKey) -> Self {
        let public = IssuerPublicKey {
            n: private.n().clone(),
            e: private.e().clone(),
        };
        Self { private, public }
    }

    pub fn public_key(&self) -> &IssuerPublicKey {
        &self.public
    }

    /// Sign a blinded message. The issuer learns nothing about the
    /// underlying message.
    pub fn sign_blinded(&self, blinded: &BlindedMessage) -> Result<BlindSignature, BlindError> {
        let n = &self.public.n;
        if &blinded.0 >= n {
            return Err(BlindError::MessageOutOfRange);
        }
        Ok(BlindSignature(blinded.0.modpow(self.private.d(), n)))
    }
}

/// The public half of an [`IssuerKey`], published to voters.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "PublicKeyWire", into = "PublicKeyWire")]
pub struct IssuerPublicKey {
    n: BigUint,
    e: BigUint,
}

impl IssuerPublicKey {
    /// Size of the modulus in bytes.
    pub fn size(&self) -> usize {
        (self.n.bits() + 7) / 8
    }

    /// Blind `message` for signing. Returns the value to send to the issuer
    /// and the secret needed to unblind the response.
    pub fn blind<R>(
        &self,
        message: &[u8],
        rng: &mut R,
    ) -> Result<(BlindedMessage, Unblinder), BlindError>
    where
        R: RngCore + CryptoRng,
    {
        let m = self.full_domain_hash(message);
        let two = BigUint::from(2u32);
        loop {
            let r = rng.gen_biguint_below(&self.n);
            if r < two {
                continue;
            }
            // A non-invertible r would reveal a factor of n; just draw again.
            let Some(inverse) = (&r).mod_inverse(&self.n).and_then(|i| i.to_biguint()) else {
                continue;
            };
            let blinded = (&m * r.modpow(&self.e, &self.n)) % &self.n;
            return Ok((BlindedMessage(blinded), Unblinder(inverse)));
        }
    }

    /// Strip the blinding factor from the issuer's response.
    pub fn unblind(&self, signature: &BlindSignature, unblinder: &Unblinder) -> Signature {
        Signature((&signature.0 * &unblinder.0) % &self.n)
    }

    /// Check an unblinded signature over `message`.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<(), BlindError> {
        if signature.0 >= self.n {
            return Err(BlindError::BadSignature);
        }
        if signature.0.modpow(&self.e, &self.n) == self.full_domain_hash(message) {
            Ok(())
        } else {
            Err(BlindError::BadSignature)
        }
    }

    /// Hash `message` onto the whole of `Z_n` using MGF1-style expansion.
    fn full_domain_hash(&self, message: &[u8]) -> BigUint {
        let len = self.size();
        let mut expanded = Vec::with_capacity(len + 32);
        let mut counter: u32 = 0;
        while expanded.len() < len {
            let mut hasher = Sha256::new();
            hasher.update(FDH_DOMAIN);
            hasher.update(message);
            hasher.update(counter.to_be_bytes());
            expanded.extend_from_slice(&hasher.finalize());
            counter += 1;
        }
        expanded.truncate(len);
        BigUint::from_bytes_be(&expanded) % &self.n
    }
}

#[derive(Serialize, Deserialize)]
struct PublicKeyWire {
    n: String,
    e: String,
}

impl TryFrom<PublicKeyWire> for IssuerPublicKey {
    type Error = BlindError;

    fn try_from(wire: PublicKeyWire) -> Result<Self, Self::Error> {
        let n = b64::decode(&wire.n).map_err(|_| BlindError::Key("bad modulus".to_string()))?;
        let e = b64::decode(&wire.e).map_err(|_| BlindError::Key("bad exponent".to_string()))?;
        // Let the rsa crate apply its usual sanity checks.
        let key = RsaPublicKey::new(n, e).map_err(|e| BlindError::Key(e.to_string()))?;
        Ok(Self {
            n: key.n().clone(),
            e: key.e().clone(),
        })
    }
}

impl From<IssuerPublicKey> for PublicKeyWire {
    fn from(key: IssuerPublicKey) -> Self {
        Self {
            n: b64::encode(&key.n),
            e: b64::encode(&key.e),
        }
    }
}

/// A message blinded by the voter, as sent to the issuer.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct BlindedMessage(#[serde(with = "b64")] BigUint);

/// The issuer's signature over a blinded message.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct BlindSignature(#[serde(with = "b64")] BigUint);

/// An unblinded signature, valid for the original message.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Signature(#[serde(with = "b64")] BigUint);

/// Secret kept by the voter between blinding and unblinding.
pub struct Unblinder(BigUint);

/// Base64url (no padding) encoding of big-endian integers.
mod b64 {
    use data_encoding::BASE64URL_NOPAD;
    use rsa::BigUint;
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    use crate::error::DecodeError;

    pub fn encode(value: &BigUint) -> String {
        BASE64URL_NOPAD.encode(&value.to_bytes_be())
    }

    pub fn decode(value: &str) -> Result<BigUint, DecodeError> {
        let bytes = BASE64URL_NOPAD
            .decode(value.as_bytes())
            .map_err(|_| DecodeError::Base64)?;
        Ok(BigUint::from_bytes_be(&bytes))
    }

    pub fn serialize<S: Serializer>(value: &BigUint, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&encode(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BigUint, D::Error> {
        let s = String::deserialize(deserializer)?;
        decode(&s).map_err(D::Error::custom)
    }
}
