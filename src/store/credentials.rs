//! Records of issued and spent credentials.
//!
//! These two sets carry the one-token-per-voter and one-commitment-per-token
//! guarantees, so every write is a conditional insert that succeeds for
//! exactly one caller. Production deployments keep them in MongoDB; the
//! in-memory store only lives as long as the process.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use votecommit::{Digest256, TokenId};

use super::partition::Partitioned;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Credential store unavailable: {0}")]
    Unavailable(String),
}

#[rocket::async_trait]
pub trait CredentialStore: Send + Sync {
    /// Record that a voter received a token. Returns false if they already had one.
    async fn record_issuance(
        &self,
        election_id: &str,
        voter_digest: &Digest256,
        issued_at: DateTime<Utc>,
    ) -> Result<bool, CredentialError>;

    /// Undo an issuance whose signature was never handed out.
    async fn revoke_issuance(
        &self,
        election_id: &str,
        voter_digest: &Digest256,
    ) -> Result<(), CredentialError>;

    async fn issued_count(&self, election_id: &str) -> Result<u64, CredentialError>;

    /// Mark a token as spent. Returns false if it was spent already.
    async fn consume_token(
        &self,
        election_id: &str,
        token_id: &TokenId,
        spent_at: DateTime<Utc>,
    ) -> Result<bool, CredentialError>;

    /// Undo a spend whose commitment was never accepted.
    async fn release_token(
        &self,
        election_id: &str,
        token_id: &TokenId,
    ) -> Result<(), CredentialError>;

    async fn is_consumed(
        &self,
        election_id: &str,
        token_id: &TokenId,
    ) -> Result<bool, CredentialError>;
}

#[derive(Default)]
struct MemState {
    issued: Partitioned<HashMap<Digest256, DateTime<Utc>>>,
    spent: Partitioned<HashSet<TokenId>>,
}

/// Process-local credential store. Clones share state.
#[derive(Clone, Default)]
pub struct MemCredentials(Arc<MemState>);

impl MemCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored voter digest, for inspecting what is retained.
    #[cfg(test)]
    pub fn issued_digests(&self, election_id: &str) -> Vec<Digest256> {
        self.0
            .issued
            .with(election_id, |issued| issued.keys().copied().collect())
    }
}

#[rocket::async_trait]
impl CredentialStore for MemCredentials {
    async fn record_issuance(
        &self,
        election_id: &str,
        voter_digest: &Digest256,
        issued_at: DateTime<Utc>,
    ) -> Result<bool, CredentialError> {
        Ok(self.0.issued.with(election_id, |issued| {
            if issued.contains_key(voter_digest) {
                false
            } else {
                issued.insert(*voter_digest, issued_at);
                true
            }
        }))
    }

    async fn revoke_issuance(
        &self,
        election_id: &str,
        voter_digest: &Digest256,
    ) -> Result<(), CredentialError> {
        self.0
            .issued
            .with(election_id, |issued| issued.remove(voter_digest));
        Ok(())
    }

    async fn issued_count(&self, election_id: &str) -> Result<u64, CredentialError> {
        Ok(self.0.issued.with(election_id, |issued| issued.len() as u64))
    }

    async fn consume_token(
        &self,
        election_id: &str,
        token_id: &TokenId,
        _spent_at: DateTime<Utc>,
    ) -> Result<bool, CredentialError> {
        Ok(self
            .0
            .spent
            .with(election_id, |spent| spent.insert(*token_id)))
    }

    async fn release_token(
        &self,
        election_id: &str,
        token_id: &TokenId,
    ) -> Result<(), CredentialError> {
        self.0
            .spent
            .with(election_id, |spent| spent.remove(token_id));
        Ok(())
    }

    async fn is_consumed(
        &self,
        election_id: &str,
        token_id: &TokenId,
    ) -> Result<bool, CredentialError> {
        Ok(self
            .0
            .spent
            .with(election_id, |spent| spent.contains(token_id)))
    }
}
