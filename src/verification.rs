use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use votecommit::{commitment::RECEIPT_CODE_LEN, DecodeError, Digest256, ReceiptCode};

use crate::ledger::{Ledger, LedgerError, LedgerTx, TxStatus};
use crate::model::record::{AnchorState, CommitmentRecord};
use crate::store::CommitmentIndex;

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("Ledger unavailable: {0}")]
    LedgerUnavailable(String),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    /// Accepted and waiting to be anchored, possibly being retried.
    Pending,
    Confirmed,
    /// Anchoring gave up; an operator must requeue it.
    DeadLettered,
    NotFound,
}

/// The public answer to "was this commitment recorded?".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationResult {
    pub found: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fabric_tx_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fabric_block_num: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anchored_at: Option<DateTime<Utc>>,
    pub status: VerificationStatus,
}

impl VerificationResult {
    /// The one response for anything we cannot confirm exists.
    pub fn not_found() -> Self {
        Self {
            found: false,
            fabric_tx_id: None,
            fabric_block_num: None,
            anchored_at: None,
            status: VerificationStatus::NotFound,
        }
    }

    fn confirmed(tx_id: String, block_num: u64, anchored_at: DateTime<Utc>) -> Self {
        Self {
            found: true,
            fabric_tx_id: Some(tx_id),
            fabric_block_num: Some(block_num),
            anchored_at: Some(anchored_at),
            status: VerificationStatus::Confirmed,
        }
    }

    fn found(status: VerificationStatus) -> Self {
        Self {
            found: true,
            status,
            ..Self::not_found()
        }
    }
}

impl From<CommitmentRecord> for VerificationResult {
    fn from(record: CommitmentRecord) -> Self {
        match (record.state, record.receipt) {
            (AnchorState::Anchored, Some(receipt)) => Self::confirmed(
                receipt.fabric_tx_id,
                receipt.fabric_block_num,
                receipt.anchored_at,
            ),
            (AnchorState::DeadLettered, _) => Self::found(VerificationStatus::DeadLettered),
            _ => Self::found(VerificationStatus::Pending),
        }
    }
}

impl From<LedgerTx> for VerificationResult {
    fn from(tx: LedgerTx) -> Self {
        Self::confirmed(tx.tx_id, tx.block_num, tx.timestamp)
    }
}

/// What a voter can look a commitment up by. Exact matches only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupKey {
    Hash(Digest256),
    Code(ReceiptCode),
}

impl FromStr for LookupKey {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() == RECEIPT_CODE_LEN {
            Ok(Self::Code(s.parse()?))
        } else {
            Ok(Self::Hash(s.parse()?))
        }
    }
}

/// Public, read-only lookup of commitments.
pub struct VerificationService {
    index: Arc<CommitmentIndex>,
    ledger: Arc<dyn Ledger>,
}

impl VerificationService {
    pub fn new(index: Arc<CommitmentIndex>, ledger: Arc<dyn Ledger>) -> Self {
        Self { index, ledger }
    }

    /// Look up a commitment hash or receipt code.
    pub async fn verify(&self, input: &str) -> Result<VerificationResult, VerifyError> {
        let Ok(key) = input.trim().parse::<LookupKey>() else {
            return Ok(VerificationResult::not_found());
        };
        let local = match &key {
            LookupKey::Hash(hash) => self.index.get(hash),
            LookupKey::Code(code) => self.index.by_receipt_code(code),
        };
        if let Some(record) = local {
            return Ok(record.into());
        }
        // Another instance may have anchored it.
        match key {
            LookupKey::Hash(hash) => self.from_ledger(&hash).await,
            LookupKey::Code(_) => Ok(VerificationResult::not_found()),
        }
    }

    /// Find the anchoring transaction and check the ledger accepted it.
    async fn from_ledger(&self, hash: &Digest256) -> Result<VerificationResult, VerifyError> {
        let unavailable = |e: LedgerError| VerifyError::LedgerUnavailable(e.to_string());
        let Some(tx) = self.ledger.find_commitment(hash).await.map_err(unavailable)? else {
            return Ok(VerificationResult::not_found());
        };
        match self.ledger.query(&tx.tx_id).await.map_err(unavailable)? {
            Some(TxStatus::Committed) => Ok(tx.into()),
            Some(TxStatus::Pending) => Ok(VerificationResult::found(VerificationStatus::Pending)),
            Some(TxStatus::Invalid) | None => Ok(VerificationResult::not_found()),
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::OsRng;
    use rocket::serde::json::to_string;
    use votecommit::{Commitment, Salt, Selection, TimestampBucket, TokenId};

    use super::*;
    use crate::ledger::{LedgerPayload, MemLedger};
    use crate::model::record::LedgerReceipt;

    fn service() -> (VerificationService, Arc<CommitmentIndex>, MemLedger) {
        let index = Arc::new(CommitmentIndex::new());
        let ledger = MemLedger::new();
        let service = VerificationService::new(index.clone(), Arc::new(ledger.clone()));
        (service, index, ledger)
    }

    fn commitment() -> Commitment {
        Commitment::derive(
            "E1",
            &TokenId::random(&mut OsRng),
            &[Selection::option("president", "alice")],
            Salt::from_bytes("s1"),
            TimestampBucket::from_secs(1_700_000_100),
        )
    }

    #[rocket::async_test]
    async fn not_found_is_indistinguishable() {
        let (service, _, _) = service();
        let never_submitted = commitment().commitment_hash.to_hex();
        let responses = [
            service.verify("nonexistent-hash").await.unwrap(),
            service.verify(&never_submitted).await.unwrap(),
            service.verify(&never_submitted[..16]).await.unwrap(),
            service.verify("").await.unwrap(),
        ];
        let expected = to_string(&VerificationResult::not_found()).unwrap();
        assert_eq!(expected, r#"{"found":false,"status":"not_found"}"#);
        for response in responses {
            assert_eq!(to_string(&response).unwrap(), expected);
        }
    }

    #[rocket::async_test]
    async fn lifecycle_statuses() {
        let (service, index, _) = service();
        let c = commitment();
        let hash = c.commitment_hash;
        index.insert_pending(&c).unwrap();

        let pending = service.verify(&hash.to_hex()).await.unwrap();
        assert!(pending.found);
        assert_eq!(pending.status, VerificationStatus::Pending);

        index.transition("E1", &hash, AnchorState::Submitted).unwrap();
        let receipt = LedgerReceipt {
            commitment_hash: hash,
            fabric_tx_id: "tx-1".to_string(),
            fabric_block_num: 7,
            anchored_at: Utc::now(),
        };
        index.mark_anchored("E1", receipt.clone()).unwrap();

        let confirmed = service.verify(&hash.to_hex()).await.unwrap();
        assert_eq!(confirmed.status, VerificationStatus::Confirmed);
        assert_eq!(confirmed.fabric_tx_id.as_deref(), Some("tx-1"));
        assert_eq!(confirmed.fabric_block_num, Some(7));

        // Upper-case hashes and receipt codes in either case work too.
        let upper = service.verify(&hash.to_hex().to_uppercase()).await.unwrap();
        assert_eq!(upper, confirmed);
        let code = c.receipt_code().as_str().to_lowercase();
        assert_eq!(service.verify(&code).await.unwrap(), confirmed);
    }

    #[rocket::async_test]
    async fn falls_back_to_the_ledger() {
        let (service, _, ledger) = service();
        let c = commitment();
        let tx = ledger
            .submit(&LedgerPayload::Commitment {
                election_id: "E1".to_string(),
                commitment_hash: c.commitment_hash,
                timestamp_bucket: c.timestamp_bucket,
            })
            .await
            .unwrap();
        let result = service.verify(&c.commitment_hash.to_hex()).await.unwrap();
        assert_eq!(result.status, VerificationStatus::Confirmed);
        assert_eq!(result.fabric_tx_id.as_deref(), Some(tx.tx_id.as_str()));

        // A transaction that failed validation does not count.
        ledger.invalidate(&tx.tx_id);
        assert_eq!(
            service.verify(&c.commitment_hash.to_hex()).await.unwrap(),
            VerificationResult::not_found()
        );

        // Receipt codes are never resolved against the ledger.
        let by_code = service.verify(c.receipt_code().as_str()).await.unwrap();
        assert_eq!(by_code, VerificationResult::not_found());

        ledger.set_offline(true);
        assert!(matches!(
            service.verify(&commitment().commitment_hash.to_hex()).await,
            Err(VerifyError::LedgerUnavailable(_))
        ));
    }
}
