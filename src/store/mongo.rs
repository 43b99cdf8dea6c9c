//! MongoDB-backed credential store.

use chrono::{DateTime, Utc};
use log::debug;
use mongodb::{
    bson::{doc, serde_helpers::chrono_datetime_as_bson_datetime, Document},
    error::{Error as DbError, ErrorKind, WriteFailure},
    options::IndexOptions,
    Collection, Database, IndexModel,
};
use serde::{Deserialize, Serialize};
use votecommit::{Digest256, TokenId};

use super::credentials::{CredentialError, CredentialStore};

const ISSUED_VOTERS: &str = "issued_voters";
const SPENT_TOKENS: &str = "spent_tokens";

/// The mongodb crate doesn't provide error code constants.
const DUPLICATE_KEY: i32 = 11000;

/// Return true if the error is a duplicate key write error.
fn is_duplicate_key(err: &DbError) -> bool {
    if let ErrorKind::Write(WriteFailure::WriteError(ref e)) = *err.kind {
        return e.code == DUPLICATE_KEY;
    }
    false
}

fn unavailable(err: DbError) -> CredentialError {
    CredentialError::Unavailable(err.to_string())
}

#[derive(Debug, Serialize, Deserialize)]
struct IssuedVoter {
    election_id: String,
    voter_digest: String,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    issued_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SpentToken {
    election_id: String,
    token_id: String,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    spent_at: DateTime<Utc>,
}

fn voter_filter(election_id: &str, voter_digest: &Digest256) -> Document {
    doc! { "election_id": election_id, "voter_digest": voter_digest.to_hex() }
}

fn token_filter(election_id: &str, token_id: &TokenId) -> Document {
    doc! { "election_id": election_id, "token_id": token_id.to_string() }
}

/// Issued and spent credentials, kept in two collections with unique
/// indexes so that inserts double as atomic check-and-set.
#[derive(Clone)]
pub struct MongoCredentials {
    issued: Collection<IssuedVoter>,
    spent: Collection<SpentToken>,
}

impl MongoCredentials {
    /// Open the collections, creating their indexes if necessary.
    ///
    /// This operation is idempotent.
    pub async fn open(db: &Database) -> Result<Self, DbError> {
        debug!("Ensuring credential indexes exist");
        let unique = IndexOptions::builder().unique(true).build();

        let issued = db.collection::<IssuedVoter>(ISSUED_VOTERS);
        let issued_index = IndexModel::builder()
            .keys(doc! {"election_id": 1, "voter_digest": 1})
            .options(unique.clone())
            .build();
        issued.create_index(issued_index, None).await?;

        let spent = db.collection::<SpentToken>(SPENT_TOKENS);
        let spent_index = IndexModel::builder()
            .keys(doc! {"election_id": 1, "token_id": 1})
            .options(unique)
            .build();
        spent.create_index(spent_index, None).await?;

        Ok(Self { issued, spent })
    }
}

#[rocket::async_trait]
impl CredentialStore for MongoCredentials {
    async fn record_issuance(
        &self,
        election_id: &str,
        voter_digest: &Digest256,
        issued_at: DateTime<Utc>,
    ) -> Result<bool, CredentialError> {
        let record = IssuedVoter {
            election_id: election_id.to_string(),
            voter_digest: voter_digest.to_hex(),
            issued_at,
        };
        match self.issued.insert_one(record, None).await {
            Ok(_) => Ok(true),
            Err(e) if is_duplicate_key(&e) => Ok(false),
            Err(e) => Err(unavailable(e)),
        }
    }

    async fn revoke_issuance(
        &self,
        election_id: &str,
        voter_digest: &Digest256,
    ) -> Result<(), CredentialError> {
        self.issued
            .delete_one(voter_filter(election_id, voter_digest), None)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn issued_count(&self, election_id: &str) -> Result<u64, CredentialError> {
        self.issued
            .count_documents(doc! { "election_id": election_id }, None)
            .await
            .map_err(unavailable)
    }

    async fn consume_token(
        &self,
        election_id: &str,
        token_id: &TokenId,
        spent_at: DateTime<Utc>,
    ) -> Result<bool, CredentialError> {
        let record = SpentToken {
            election_id: election_id.to_string(),
            token_id: token_id.to_string(),
            spent_at,
        };
        match self.spent.insert_one(record, None).await {
            Ok(_) => Ok(true),
            Err(e) if is_duplicate_key(&e) => Ok(false),
            Err(e) => Err(unavailable(e)),
        }
    }

    async fn release_token(
        &self,
        election_id: &str,
        token_id: &TokenId,
    ) -> Result<(), CredentialError> {
        self.spent
            .delete_one(token_filter(election_id, token_id), None)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn is_consumed(
        &self,
        election_id: &str,
        token_id: &TokenId,
    ) -> Result<bool, CredentialError> {
        let found = self
            .spent
            .find_one(token_filter(election_id, token_id), None)
            .await
            .map_err(unavailable)?;
        Ok(found.is_some())
    }
}
