use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use rand::rngs::OsRng;
use rocket::serde::json::json;
use thiserror::Error;
use votecommit::{
    BlindError, BlindToken, Commitment, IssuerPublicKey, Salt, Selection, SelectionError,
    TimestampBucket, TokenId,
};

use crate::store::{
    audit::AuditError, commitments::IndexError, credentials::CredentialError,
    elections::ElectionDirectory, AuditLog, CommitmentIndex, CredentialStore,
};

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Token was issued for a different election")]
    ElectionMismatch,
    #[error("Token signature is invalid: {0}")]
    InvalidToken(BlindError),
    #[error("Election `{0}` is not open for voting")]
    ElectionNotOpen(String),
    #[error("Election `{0}` does not exist")]
    UnknownElection(String),
    #[error("Invalid selections: {0}")]
    InvalidSelections(#[from] SelectionError),
    #[error("Token has already been used")]
    TokenConsumed,
    #[error("Salt must be between 1 and 256 bytes")]
    BadSalt,
    #[error(transparent)]
    Credentials(#[from] CredentialError),
    #[error(transparent)]
    Audit(#[from] AuditError),
    #[error(transparent)]
    Index(#[from] IndexError),
}

/// Turns a blind token and a ballot into a commitment, spending the token.
pub struct CommitmentBuilder {
    issuer: IssuerPublicKey,
    elections: Arc<dyn ElectionDirectory>,
    credentials: Arc<dyn CredentialStore>,
    index: Arc<CommitmentIndex>,
    audit: Arc<AuditLog>,
    bucket_width_secs: u64,
}

impl CommitmentBuilder {
    pub fn new(
        issuer: IssuerPublicKey,
        elections: Arc<dyn ElectionDirectory>,
        credentials: Arc<dyn CredentialStore>,
        index: Arc<CommitmentIndex>,
        audit: Arc<AuditLog>,
        bucket_width_secs: u64,
    ) -> Self {
        Self {
            issuer,
            elections,
            credentials,
            index,
            audit,
            bucket_width_secs: bucket_width_secs.max(1),
        }
    }

    /// Build a commitment for the current time. A random salt is chosen if
    /// none is given.
    pub async fn build(
        &self,
        token: &BlindToken,
        election_id: &str,
        selections: &[Selection],
        salt: Option<Salt>,
    ) -> Result<Commitment, BuildError> {
        self.build_at(token, election_id, selections, salt, Utc::now())
            .await
    }

    pub async fn build_at(
        &self,
        token: &BlindToken,
        election_id: &str,
        selections: &[Selection],
        salt: Option<Salt>,
        now: DateTime<Utc>,
    ) -> Result<Commitment, BuildError> {
        if token.election_id != election_id {
            return Err(BuildError::ElectionMismatch);
        }
        token.verify(&self.issuer).map_err(BuildError::InvalidToken)?;

        let election = self
            .elections
            .get(election_id)
            .await
            .ok_or_else(|| BuildError::UnknownElection(election_id.to_string()))?;
        if !election.is_accepting_votes(now) {
            return Err(BuildError::ElectionNotOpen(election_id.to_string()));
        }
        election.validate_selections(selections)?;

        let salt = match salt {
            Some(salt) if !salt.is_acceptable() => return Err(BuildError::BadSalt),
            Some(salt) => salt,
            None => Salt::random(&mut OsRng),
        };
        self.audit.ensure_writable(election_id)?;

        // Atomic check-and-set on the spent set.
        if !self
            .credentials
            .consume_token(election_id, &token.token_id, now)
            .await?
        {
            debug!("Rejected reused token for election {election_id}");
            return Err(BuildError::TokenConsumed);
        }

        let bucket = TimestampBucket::containing(now, self.bucket_width_secs);
        let commitment = Commitment::derive(election_id, &token.token_id, selections, salt, bucket);
        if let Err(e) = self.record(&commitment) {
            self.release(election_id, &token.token_id).await;
            return Err(e);
        }
        info!(
            "Accepted commitment {} for election {election_id}",
            commitment.receipt_code()
        );
        Ok(commitment)
    }

    fn record(&self, commitment: &Commitment) -> Result<(), BuildError> {
        self.index.insert_pending(commitment)?;
        let audited = self.audit.append(
            &commitment.election_id,
            "commitment.created",
            "Commitment",
            &commitment.commitment_hash.to_hex(),
            &json!({ "timestampBucket": commitment.timestamp_bucket.secs() }),
        );
        if let Err(e) = audited {
            self.index
                .remove_pending(&commitment.election_id, &commitment.commitment_hash);
            return Err(e.into());
        }
        Ok(())
    }

    async fn release(&self, election_id: &str, token_id: &TokenId) {
        if let Err(e) = self.credentials.release_token(election_id, token_id).await {
            error!("Failed to release token for election {election_id}: {e}");
        }
    }

    /// Undo a commitment that could not be handed on for anchoring. The
    /// record is forgotten and the token may be spent again.
    pub async fn withdraw(&self, commitment: &Commitment, token_id: &TokenId) {
        let election_id = commitment.election_id.as_str();
        self.index
            .remove_pending(election_id, &commitment.commitment_hash);
        self.release(election_id, token_id).await;
        if let Err(e) = self.audit.append(
            election_id,
            "commitment.withdrawn",
            "Commitment",
            &commitment.commitment_hash.to_hex(),
            &json!({}),
        ) {
            error!("Failed to audit withdrawn commitment: {e}");
        }
        warn!(
            "Withdrew commitment {} for election {election_id}",
            commitment.receipt_code()
        );
    }

    /// Whether a token has been spent.
    pub async fn is_consumed(
        &self,
        election_id: &str,
        token_id: &TokenId,
    ) -> Result<bool, BuildError> {
        Ok(self.credentials.is_consumed(election_id, token_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use votecommit::ballot::MAX_WRITE_IN_LEN;

    use super::*;
    use crate::issuer::examples::example_key;
    use crate::model::record::AnchorState;
    use crate::store::{elections::MemElections, MemCredentials};

    fn builder_with(
        credentials: &MemCredentials,
    ) -> (Arc<CommitmentBuilder>, Arc<CommitmentIndex>, Arc<AuditLog>) {
        let index = Arc::new(CommitmentIndex::new());
        let audit = Arc::new(AuditLog::new());
        let builder = CommitmentBuilder::new(
            example_key().public_key().clone(),
            Arc::new(MemElections::example()),
            Arc::new(credentials.clone()),
            index.clone(),
            audit.clone(),
            300,
        );
        (Arc::new(builder), index, audit)
    }

    fn builder() -> (Arc<CommitmentBuilder>, Arc<CommitmentIndex>, Arc<AuditLog>) {
        builder_with(&MemCredentials::new())
    }

    fn token(election_id: &str) -> BlindToken {
        let key = example_key();
        let request =
            votecommit::TokenRequest::new(key.public_key(), election_id, &mut OsRng).unwrap();
        let blind_signature = key.sign_blinded(request.blinded()).unwrap();
        request
            .finalize(key.public_key(), &blind_signature, Utc::now())
            .unwrap()
    }

    fn alice() -> Vec<Selection> {
        vec![Selection::option("president", "alice")]
    }

    #[rocket::async_test]
    async fn build_records_pending_commitment() {
        let (builder, index, audit) = builder();
        let token = token("E1");
        let commitment = builder
            .build(&token, "E1", &alice(), Some(Salt::from_bytes("s1")))
            .await
            .unwrap();

        assert!(builder.is_consumed("E1", &token.token_id).await.unwrap());
        let record = index.get(&commitment.commitment_hash).unwrap();
        assert_eq!(record.state, AnchorState::Pending);

        let entries = audit.entries("E1");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].resource_id, commitment.commitment_hash.to_hex());
    }

    #[rocket::async_test]
    async fn deterministic_hash() {
        let (builder, _, _) = builder();
        let token = token("E1");
        let now = Utc::now();
        let commitment = builder
            .build_at(&token, "E1", &alice(), Some(Salt::from_bytes("s1")), now)
            .await
            .unwrap();
        let again = Commitment::derive(
            "E1",
            &token.token_id,
            &alice(),
            Salt::from_bytes("s1"),
            TimestampBucket::containing(now, 300),
        );
        assert_eq!(commitment.commitment_hash, again.commitment_hash);
    }

    #[rocket::async_test]
    async fn rejects_reuse() {
        let (builder, _, _) = builder();
        let token = token("E1");
        builder.build(&token, "E1", &alice(), None).await.unwrap();
        assert!(matches!(
            builder.build(&token, "E1", &alice(), None).await,
            Err(BuildError::TokenConsumed)
        ));
    }

    #[rocket::async_test]
    async fn spent_tokens_outlive_the_builder() {
        let credentials = MemCredentials::new();
        let token = token("E1");
        let (first, _, _) = builder_with(&credentials);
        first.build(&token, "E1", &alice(), None).await.unwrap();

        // A new builder over the same store, as after a restart.
        let (restarted, _, audit) = builder_with(&credentials);
        assert!(matches!(
            restarted.build(&token, "E1", &alice(), None).await,
            Err(BuildError::TokenConsumed)
        ));
        assert!(audit.entries("E1").is_empty());
    }

    #[rocket::async_test]
    async fn withdrawn_commitments_free_the_token() {
        let (builder, index, audit) = builder();
        let token = token("E1");
        let commitment = builder
            .build(&token, "E1", &alice(), Some(Salt::from_bytes("s1")))
            .await
            .unwrap();
        builder.withdraw(&commitment, &token.token_id).await;

        assert!(index.get(&commitment.commitment_hash).is_none());
        assert!(!builder.is_consumed("E1", &token.token_id).await.unwrap());
        let actions: Vec<String> = audit.entries("E1").into_iter().map(|e| e.action).collect();
        assert_eq!(actions, ["commitment.created", "commitment.withdrawn"]);
        assert!(audit.verify("E1").is_ok());

        assert!(builder.build(&token, "E1", &alice(), None).await.is_ok());
    }

    #[rocket::async_test]
    async fn validation_happens_before_consumption() {
        let (builder, _, _) = builder();
        let token = token("E1");
        let bad = vec![Selection::option("president", "mallory")];
        assert!(matches!(
            builder.build(&token, "E1", &bad, None).await,
            Err(BuildError::InvalidSelections(SelectionError::UnknownOption { .. }))
        ));
        assert!(matches!(
            builder.build(&token, "E1", &alice(), Some(Salt::from_bytes(""))).await,
            Err(BuildError::BadSalt)
        ));
        assert!(!builder.is_consumed("E1", &token.token_id).await.unwrap());
        assert!(builder.build(&token, "E1", &alice(), None).await.is_ok());
    }

    #[rocket::async_test]
    async fn rejects_bad_tokens_and_elections() {
        let (builder, _, _) = builder();
        let token_e1 = token("E1");
        assert!(matches!(
            builder.build(&token_e1, "E2", &alice(), None).await,
            Err(BuildError::ElectionMismatch)
        ));

        let mut forged = token("E1");
        forged.token_id = TokenId::random(&mut OsRng);
        assert!(matches!(
            builder.build(&forged, "E1", &alice(), None).await,
            Err(BuildError::InvalidToken(_))
        ));

        // E2 is still in registration.
        assert!(matches!(
            builder.build(&token("E2"), "E2", &alice(), None).await,
            Err(BuildError::ElectionNotOpen(_))
        ));
        assert!(matches!(
            builder.build(&token("E9"), "E9", &alice(), None).await,
            Err(BuildError::UnknownElection(_))
        ));
    }

    #[rocket::async_test]
    async fn write_ins() {
        let (builder, _, _) = builder();
        let selections = vec![
            Selection::option("president", "bob"),
            Selection::write_in("council", "Erin"),
        ];
        assert!(builder
            .build(&token("E1"), "E1", &selections, None)
            .await
            .is_ok());

        let too_long = vec![
            Selection::option("president", "bob"),
            Selection::write_in("council", "x".repeat(MAX_WRITE_IN_LEN + 1)),
        ];
        assert!(matches!(
            builder.build(&token("E1"), "E1", &too_long, None).await,
            Err(BuildError::InvalidSelections(SelectionError::BadWriteIn(_)))
        ));

        let not_allowed = vec![Selection::write_in("president", "Erin")];
        assert!(matches!(
            builder.build(&token("E1"), "E1", &not_allowed, None).await,
            Err(BuildError::InvalidSelections(
                SelectionError::WriteInNotAllowed(_)
            ))
        ));
    }

    #[rocket::async_test]
    async fn halted_audit_stream_refuses_writes() {
        let (builder, _, audit) = builder();
        builder.build(&token("E1"), "E1", &alice(), None).await.unwrap();
        audit.tamper("E1", |entries| {
            entries[0].details_digest = votecommit::Digest256::of("forged");
        });
        assert!(audit.verify("E1").is_err());

        let token = token("E1");
        assert!(matches!(
            builder.build(&token, "E1", &alice(), None).await,
            Err(BuildError::Audit(AuditError::ChainMismatch { .. }))
        ));
        assert!(!builder.is_consumed("E1", &token.token_id).await.unwrap());
    }

    #[test]
    fn double_spend_under_contention() {
        const TASKS: usize = 32;
        let runtime = rocket::tokio::runtime::Builder::new_multi_thread()
            .worker_threads(8)
            .enable_all()
            .build()
            .unwrap();
        let (builder, index, _) = builder();
        let token = token("E1");

        let results: Vec<Result<Commitment, BuildError>> = runtime.block_on(async {
            let handles: Vec<_> = (0..TASKS)
                .map(|_| {
                    let builder = builder.clone();
                    let token = token.clone();
                    rocket::tokio::spawn(async move {
                        builder.build(&token, "E1", &alice(), None).await
                    })
                })
                .collect();
            let mut results = Vec::new();
            for handle in handles {
                results.push(handle.await.unwrap());
            }
            results
        });

        let successes: Vec<&Commitment> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(successes.len(), 1);
        let consumed = results
            .iter()
            .filter(|r| matches!(r, Err(BuildError::TokenConsumed)))
            .count();
        assert_eq!(consumed, TASKS - 1);
        assert!(index.get(&successes[0].commitment_hash).is_some());
    }
}
