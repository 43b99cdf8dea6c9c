use std::sync::Arc;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use log::{error, info};
use rocket::serde::json::json;
use serde::Serialize;
use sha2::Sha256;
use thiserror::Error;
use votecommit::{
    hash::FieldHasher, BlindError, BlindSignature, BlindedMessage, Digest256, IssuerKey,
    IssuerPublicKey,
};

use crate::oracle::EligibilityAssertion;
use crate::store::{
    audit::AuditError, credentials::CredentialError, elections::ElectionDirectory, AuditLog,
    CredentialStore,
};

pub type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum IssueError {
    #[error("Voter is not eligible for this election")]
    NotEligible,
    #[error("A token has already been issued to this voter for this election")]
    AlreadyIssued,
    #[error("Election `{0}` is not issuing tokens")]
    InvalidElection(String),
    #[error("Election `{0}` does not exist")]
    UnknownElection(String),
    #[error("Invalid blinded message: {0}")]
    InvalidBlindedMessage(#[from] BlindError),
    #[error(transparent)]
    Credentials(#[from] CredentialError),
    #[error(transparent)]
    Audit(#[from] AuditError),
}

/// The issuer's response to a blinded token request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlindIssuance {
    pub blind_signature: BlindSignature,
    pub issued_at: DateTime<Utc>,
}

/// Issues one blind token per voter per election.
///
/// The only thing remembered about a voter is a keyed hash of their
/// registration id and when their token was issued. The issuer signs a
/// blinded value, so it cannot later recognise the token it produced.
pub struct TokenIssuer {
    key: IssuerKey,
    hmac_secret: Vec<u8>,
    elections: Arc<dyn ElectionDirectory>,
    credentials: Arc<dyn CredentialStore>,
    audit: Arc<AuditLog>,
}

impl TokenIssuer {
    pub fn new(
        key: IssuerKey,
        hmac_secret: &[u8],
        elections: Arc<dyn ElectionDirectory>,
        credentials: Arc<dyn CredentialStore>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            key,
            hmac_secret: hmac_secret.to_vec(),
            elections,
            credentials,
            audit,
        }
    }

    pub fn public_key(&self) -> &IssuerPublicKey {
        self.key.public_key()
    }

    /// One-way, keyed digest of a voter's registration id within an election.
    fn voter_digest(&self, election_id: &str, voter_registration_id: &str) -> Digest256 {
        let mut message = FieldHasher::new("votecommit/voter/v1");
        message.field(election_id).field(voter_registration_id);
        let mut hmac = HmacSha256::new_from_slice(&self.hmac_secret)
            .expect("HMAC can take key of any size");
        hmac.update(message.finish().as_bytes());
        Digest256::from_bytes(hmac.finalize().into_bytes().into())
    }

    /// Sign a voter's blinded token if they are eligible and have not
    /// received one before.
    pub async fn issue(
        &self,
        assertion: &EligibilityAssertion,
        blinded: &BlindedMessage,
    ) -> Result<BlindIssuance, IssueError> {
        if !assertion.eligible {
            return Err(IssueError::NotEligible);
        }
        let election_id = assertion.election_id.as_str();
        let election = self
            .elections
            .get(election_id)
            .await
            .ok_or_else(|| IssueError::UnknownElection(election_id.to_string()))?;
        let now = Utc::now();
        if !election.is_issuing_tokens(now) {
            return Err(IssueError::InvalidElection(election_id.to_string()));
        }
        self.audit.ensure_writable(election_id)?;

        // The conditional insert admits exactly one request per voter.
        let digest = self.voter_digest(election_id, &assertion.voter_registration_id);
        if !self
            .credentials
            .record_issuance(election_id, &digest, now)
            .await?
        {
            return Err(IssueError::AlreadyIssued);
        }
        let signed = self
            .key
            .sign_blinded(blinded)
            .map_err(IssueError::from)
            .and_then(|signature| {
                self.audit.append(
                    election_id,
                    "token.issued",
                    "BlindToken",
                    "",
                    &json!({ "channel": assertion.channel }),
                )?;
                Ok(signature)
            });
        let blind_signature = match signed {
            Ok(signature) => signature,
            Err(e) => {
                // The signature never leaves the server, so the voter may try again.
                if let Err(revoke) = self.credentials.revoke_issuance(election_id, &digest).await {
                    error!("Failed to revoke unissued token for election {election_id}: {revoke}");
                }
                return Err(e);
            }
        };
        info!("Blind token issued for election {election_id}");

        Ok(BlindIssuance {
            blind_signature,
            issued_at: now,
        })
    }

    /// Number of tokens issued for an election.
    pub async fn issued_count(&self, election_id: &str) -> Result<u64, IssueError> {
        Ok(self.credentials.issued_count(election_id).await?)
    }
}


#[cfg(test)]
mod tests {
    use rand::rngs::OsRng;
    use votecommit::TokenRequest;

    use super::examples::example_key;
    use super::*;
    use crate::store::{elections::MemElections, MemCredentials};

    fn issuer_with(credentials: &MemCredentials) -> (TokenIssuer, Arc<AuditLog>) {
        let audit = Arc::new(AuditLog::new());
        let issuer = TokenIssuer::new(
            example_key(),
            b"test secret",
            Arc::new(MemElections::example()),
            Arc::new(credentials.clone()),
            audit.clone(),
        );
        (issuer, audit)
    }

    fn issuer() -> (TokenIssuer, Arc<AuditLog>) {
        issuer_with(&MemCredentials::new())
    }

    #[rocket::async_test]
    async fn issue_and_finalize() {
        let (issuer, audit) = issuer();
        let request = TokenRequest::new(issuer.public_key(), "E1", &mut OsRng).unwrap();
        let issuance = issuer
            .issue(&EligibilityAssertion::example("reg-1", "E1"), request.blinded())
            .await
            .unwrap();
        let token = request
            .finalize(issuer.public_key(), &issuance.blind_signature, issuance.issued_at)
            .unwrap();
        assert_eq!(token.election_id, "E1");
        assert_eq!(issuer.issued_count("E1").await.unwrap(), 1);

        let entries = audit.entries("E1");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, "token.issued");
        assert_eq!(entries[0].resource_id, "");
    }

    #[rocket::async_test]
    async fn one_token_per_voter() {
        let (issuer, _) = issuer();
        let assertion = EligibilityAssertion::example("reg-1", "E1");
        let first = TokenRequest::new(issuer.public_key(), "E1", &mut OsRng).unwrap();
        issuer.issue(&assertion, first.blinded()).await.unwrap();

        let second = TokenRequest::new(issuer.public_key(), "E1", &mut OsRng).unwrap();
        assert!(matches!(
            issuer.issue(&assertion, second.blinded()).await,
            Err(IssueError::AlreadyIssued)
        ));

        // The same voter may still get a token for a different election.
        let other = TokenRequest::new(issuer.public_key(), "E2", &mut OsRng).unwrap();
        let assertion = EligibilityAssertion::example("reg-1", "E2");
        assert!(issuer.issue(&assertion, other.blinded()).await.is_ok());
    }

    #[rocket::async_test]
    async fn rejections() {
        let (issuer, _) = issuer();
        let request = TokenRequest::new(issuer.public_key(), "E1", &mut OsRng).unwrap();

        let ineligible = EligibilityAssertion {
            eligible: false,
            ..EligibilityAssertion::example("reg-1", "E1")
        };
        assert!(matches!(
            issuer.issue(&ineligible, request.blinded()).await,
            Err(IssueError::NotEligible)
        ));
        assert!(matches!(
            issuer
                .issue(&EligibilityAssertion::example("reg-1", "E3"), request.blinded())
                .await,
            Err(IssueError::InvalidElection(_))
        ));
        assert!(matches!(
            issuer
                .issue(&EligibilityAssertion::example("reg-1", "E9"), request.blinded())
                .await,
            Err(IssueError::UnknownElection(_))
        ));
        // Nothing was recorded for rejected requests.
        assert_eq!(issuer.issued_count("E1").await.unwrap(), 0);
    }

    #[rocket::async_test]
    async fn issuance_outlives_the_issuer() {
        let credentials = MemCredentials::new();
        let assertion = EligibilityAssertion::example("reg-1", "E1");
        let (first, _) = issuer_with(&credentials);
        let request = TokenRequest::new(first.public_key(), "E1", &mut OsRng).unwrap();
        first.issue(&assertion, request.blinded()).await.unwrap();

        // A new issuer over the same store, as after a restart.
        let (restarted, _) = issuer_with(&credentials);
        let request = TokenRequest::new(restarted.public_key(), "E1", &mut OsRng).unwrap();
        assert!(matches!(
            restarted.issue(&assertion, request.blinded()).await,
            Err(IssueError::AlreadyIssued)
        ));
    }

    #[rocket::async_test]
    async fn failed_issuance_can_be_retried() {
        let (issuer, audit) = issuer();
        let assertion = EligibilityAssertion::example("reg-1", "E1");
        let request = TokenRequest::new(issuer.public_key(), "E1", &mut OsRng).unwrap();
        issuer
            .issue(&EligibilityAssertion::example("reg-2", "E1"), request.blinded())
            .await
            .unwrap();
        // The next append finds the altered tail and refuses to write.
        audit.tamper("E1", |entries| entries[0].action = "token.revoked".to_string());

        let request = TokenRequest::new(issuer.public_key(), "E1", &mut OsRng).unwrap();
        assert!(matches!(
            issuer.issue(&assertion, request.blinded()).await,
            Err(IssueError::Audit(_))
        ));
        assert_eq!(issuer.issued_count("E1").await.unwrap(), 1);
    }

    #[rocket::async_test]
    async fn stored_records_do_not_reveal_voters() {
        let credentials = MemCredentials::new();
        let (issuer, _) = issuer_with(&credentials);
        for voter in ["reg-1", "reg-2", "reg-3"] {
            let request = TokenRequest::new(issuer.public_key(), "E1", &mut OsRng).unwrap();
            issuer
                .issue(&EligibilityAssertion::example(voter, "E1"), request.blinded())
                .await
                .unwrap();
        }
        let digests = credentials.issued_digests("E1");
        assert_eq!(digests.len(), 3);
        for digest in digests {
            let hex = digest.to_hex();
            for voter in ["reg-1", "reg-2", "reg-3"] {
                assert!(!hex.contains(voter));
                // Without the key, hashing the registration id does not match.
                assert_ne!(digest, Digest256::of(voter));
            }
        }
    }
}
