//! Anchoring commitments to the ledger, with retries and a dead-letter queue.
//!
//! Every commitment handed to the anchoring worker ends up either anchored or
//! dead-lettered; nothing is dropped. Dead letters wait for an operator to
//! requeue them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{Duration, Utc};
use log::{debug, error, info, warn};
use rocket::futures::future::{BoxFuture, FutureExt};
use rocket::serde::json::json;
use rocket::tokio::{self, sync::mpsc::UnboundedReceiver, task::JoinHandle};
use thiserror::Error;
use votecommit::{Commitment, Digest256};

use crate::ledger::{Ledger, LedgerError, LedgerPayload, LedgerTx};
use crate::model::record::{AnchorState, CommitmentRecord, DeadLetter, LedgerReceipt};
use crate::relay::{Batch, MixRelay, RelayError};
use crate::scheduled_task::ScheduledTask;
use crate::store::{
    audit::OPERATOR_STREAM, commitments::IndexError, AuditLog, CommitmentIndex, ElectionDirectory,
};

#[derive(Debug, Error)]
pub enum AnchorError {
    /// Transient; the attempt will be retried.
    #[error("Ledger unavailable: {0}")]
    LedgerUnavailable(String),
    /// The ledger already holds this commitment. Not fatal: the vote is anchored.
    #[error("Commitment already anchored in transaction {}", .0.fabric_tx_id)]
    DuplicateCommitment(LedgerReceipt),
    #[error("Election `{0}` is no longer accepting anchors")]
    ElectionNotActive(String),
    #[error("Ledger rejected the commitment: {0}")]
    Rejected(String),
    #[error("Commitment {0} is not known")]
    UnknownCommitment(Digest256),
    #[error("Commitment {0} is not dead-lettered")]
    NotDeadLettered(Digest256),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Relay(#[from] RelayError),
}

impl AnchorError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::LedgerUnavailable(_))
    }
}

/// Exponential backoff between anchoring attempts.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub attempt_timeout: std::time::Duration,
}

impl RetryPolicy {
    /// Delay before the attempt following attempt number `attempt` (from 1):
    /// `min(base * 2^(attempt - 1), max)`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(30);
        self.base_delay
            .checked_mul(1 << exponent)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base_delay: Duration::milliseconds(500),
            max_delay: Duration::seconds(60),
            attempt_timeout: std::time::Duration::from_secs(10),
        }
    }
}

fn receipt_for(commitment_hash: Digest256, tx: LedgerTx) -> LedgerReceipt {
    LedgerReceipt {
        commitment_hash,
        fabric_tx_id: tx.tx_id,
        fabric_block_num: tx.block_num,
        anchored_at: tx.timestamp,
    }
}

/// Makes single anchoring attempts against the ledger.
pub struct AnchorClient {
    ledger: Arc<dyn Ledger>,
    elections: Arc<dyn ElectionDirectory>,
    index: Arc<CommitmentIndex>,
    attempt_timeout: std::time::Duration,
}

impl AnchorClient {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        elections: Arc<dyn ElectionDirectory>,
        index: Arc<CommitmentIndex>,
        attempt_timeout: std::time::Duration,
    ) -> Self {
        Self {
            ledger,
            elections,
            index,
            attempt_timeout,
        }
    }

    pub fn ledger(&self) -> &Arc<dyn Ledger> {
        &self.ledger
    }

    /// Anchor a commitment, or return its existing receipt.
    pub async fn anchor(&self, commitment: &Commitment) -> Result<LedgerReceipt, AnchorError> {
        let election_id = commitment.election_id.as_str();
        let hash = commitment.commitment_hash;
        let record = self.index.ensure_tracked(commitment);
        if let Some(receipt) = record.receipt {
            return Ok(receipt);
        }

        let active = self
            .elections
            .get(election_id)
            .await
            .map_or(false, |election| election.is_anchoring());
        if !active {
            return Err(AnchorError::ElectionNotActive(election_id.to_string()));
        }

        let record = self
            .index
            .transition(election_id, &hash, AnchorState::Submitted)?;
        debug!(
            "Submitting commitment {} (attempt {})",
            record.receipt_code, record.attempts
        );
        let payload = LedgerPayload::Commitment {
            election_id: election_id.to_string(),
            commitment_hash: hash,
            timestamp_bucket: commitment.timestamp_bucket,
        };
        let submitted = tokio::time::timeout(self.attempt_timeout, self.ledger.submit(&payload))
            .await
            .unwrap_or_else(|_| {
                Err(LedgerError::Unavailable(format!(
                    "no response within {}ms",
                    self.attempt_timeout.as_millis()
                )))
            });

        match submitted {
            Ok(tx) => {
                let record = self.index.mark_anchored(election_id, receipt_for(hash, tx))?;
                record
                    .receipt
                    .ok_or(AnchorError::Index(IndexError::Unknown(hash)))
            }
            Err(LedgerError::Duplicate) => match self.ledger.find_commitment(&hash).await {
                Ok(Some(tx)) => {
                    let record = self.index.mark_anchored(election_id, receipt_for(hash, tx))?;
                    match record.receipt {
                        Some(receipt) => Err(AnchorError::DuplicateCommitment(receipt)),
                        None => Err(AnchorError::Index(IndexError::Unknown(hash))),
                    }
                }
                Ok(None) => {
                    self.index.transition(election_id, &hash, AnchorState::Failed)?;
                    Err(AnchorError::LedgerUnavailable(
                        "ledger reported a duplicate it cannot find".to_string(),
                    ))
                }
                Err(e) => {
                    self.index.transition(election_id, &hash, AnchorState::Failed)?;
                    Err(AnchorError::LedgerUnavailable(e.to_string()))
                }
            },
            Err(LedgerError::Unavailable(reason)) => {
                self.index.transition(election_id, &hash, AnchorState::Failed)?;
                Err(AnchorError::LedgerUnavailable(reason))
            }
            Err(LedgerError::Rejected(reason)) => {
                self.index.transition(election_id, &hash, AnchorState::Failed)?;
                Err(AnchorError::Rejected(reason))
            }
        }
    }

    /// Write the Merkle root of an audit stream to the ledger.
    pub async fn anchor_audit_root(
        &self,
        stream: &str,
        merkle_root: Digest256,
        entry_count: usize,
    ) -> Result<LedgerTx, LedgerError> {
        let payload = LedgerPayload::AuditRoot {
            stream: stream.to_string(),
            merkle_root,
            entry_count: entry_count as u64,
        };
        tokio::time::timeout(self.attempt_timeout, self.ledger.submit(&payload))
            .await
            .unwrap_or_else(|_| Err(LedgerError::Unavailable("timed out".to_string())))
    }
}

/// Drives commitments through retries to either anchored or dead-lettered.
pub struct AnchorService {
    client: AnchorClient,
    policy: RetryPolicy,
    index: Arc<CommitmentIndex>,
    audit: Arc<AuditLog>,
    relay: Arc<MixRelay>,
    retries: Mutex<HashMap<Digest256, PendingRetry>>,
    dead_letters: Mutex<HashMap<Digest256, DeadLetter>>,
    stopping: AtomicBool,
}

/// A retry waiting for its backoff to elapse.
struct PendingRetry {
    commitment: Commitment,
    attempts: u32,
    last_error: String,
    task: ScheduledTask<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl AnchorService {
    pub fn new(
        client: AnchorClient,
        policy: RetryPolicy,
        index: Arc<CommitmentIndex>,
        audit: Arc<AuditLog>,
        relay: Arc<MixRelay>,
    ) -> Self {
        Self {
            client,
            policy,
            index,
            audit,
            relay,
            retries: Mutex::new(HashMap::new()),
            dead_letters: Mutex::new(HashMap::new()),
            stopping: AtomicBool::new(false),
        }
    }

    pub fn client(&self) -> &AnchorClient {
        &self.client
    }

    /// Make the first attempt for every commitment in a batch.
    pub async fn process_batch(self: &Arc<Self>, batch: Batch) {
        debug!("Anchoring a batch of {} commitments", batch.len());
        for commitment in batch {
            self.attempt(commitment).await;
        }
    }

    async fn attempt(self: &Arc<Self>, commitment: Commitment) {
        let code = commitment.receipt_code();
        match self.client.anchor(&commitment).await {
            Ok(receipt) => info!(
                "Anchored commitment {code} in block {}",
                receipt.fabric_block_num
            ),
            Err(AnchorError::DuplicateCommitment(receipt)) => info!(
                "Commitment {code} was already anchored in block {}",
                receipt.fabric_block_num
            ),
            Err(AnchorError::Index(e)) => {
                error!("Commitment {code} is in an unexpected state: {e}");
            }
            Err(e) => {
                let attempts = self
                    .index
                    .get(&commitment.commitment_hash)
                    .map_or(0, |record| record.attempts);
                if e.is_retryable() && attempts < self.policy.max_attempts {
                    self.schedule_retry(commitment, attempts, &e);
                } else {
                    self.dead_letter(commitment, attempts, &e.to_string());
                }
            }
        }
    }

    fn schedule_retry(self: &Arc<Self>, commitment: Commitment, attempts: u32, cause: &AnchorError) {
        // Checked under the retries lock, so `stop` cannot miss this retry.
        let mut retries = lock(&self.retries);
        if self.stopping.load(Ordering::SeqCst) {
            drop(retries);
            self.dead_letter(
                commitment,
                attempts,
                &format!("{cause}; not retried during shutdown"),
            );
            return;
        }
        let delay = self.policy.delay_after(attempts);
        warn!(
            "Anchoring commitment {} failed ({cause}), retrying in {}ms",
            commitment.receipt_code(),
            delay.num_milliseconds()
        );
        let hash = commitment.commitment_hash;
        let task = ScheduledTask::after(self.clone().retry(commitment.clone()), delay);
        let pending = PendingRetry {
            commitment,
            attempts,
            last_error: cause.to_string(),
            task,
        };
        if let Some(previous) = retries.insert(hash, pending) {
            previous.task.abort();
        }
    }

    /// Boxed, as retries schedule further retries.
    fn retry(self: Arc<Self>, commitment: Commitment) -> BoxFuture<'static, ()> {
        async move {
            let hash = commitment.commitment_hash;
            if lock(&self.retries).remove(&hash).is_none() {
                // Taken over by `stop`.
                return;
            }
            match self
                .index
                .transition(&commitment.election_id, &hash, AnchorState::Pending)
            {
                Ok(_) => self.attempt(commitment).await,
                Err(e) => error!("Cannot retry commitment {}: {e}", commitment.receipt_code()),
            }
        }
        .boxed()
    }

    fn dead_letter(&self, commitment: Commitment, attempts: u32, cause: &str) {
        let hash = commitment.commitment_hash;
        let election_id = commitment.election_id.clone();
        if let Err(e) = self
            .index
            .transition(&election_id, &hash, AnchorState::DeadLettered)
        {
            error!("Cannot dead-letter commitment {}: {e}", commitment.receipt_code());
            return;
        }
        error!(
            "Commitment {} dead-lettered after {attempts} attempts: {cause}",
            commitment.receipt_code()
        );
        if let Err(e) = self.audit.append(
            &election_id,
            "commitment.dead_lettered",
            "Commitment",
            &hash.to_hex(),
            &json!({ "attempts": attempts }),
        ) {
            error!("Failed to audit dead letter: {e}");
        }
        lock(&self.dead_letters).insert(
            hash,
            DeadLetter {
                commitment,
                commitment_hash: hash,
                election_id,
                attempts,
                last_error: cause.to_string(),
                dead_lettered_at: Utc::now(),
            },
        );
    }

    /// Dead letters, oldest first.
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        let mut letters: Vec<DeadLetter> = lock(&self.dead_letters).values().cloned().collect();
        letters.sort_by_key(|letter| letter.dead_lettered_at);
        letters
    }

    /// Return a dead-lettered commitment to the relay with a fresh attempt budget.
    pub fn requeue(&self, hash: &Digest256) -> Result<CommitmentRecord, AnchorError> {
        let letter = match lock(&self.dead_letters).remove(hash) {
            Some(letter) => letter,
            None if self.index.get(hash).is_some() => {
                return Err(AnchorError::NotDeadLettered(*hash))
            }
            None => return Err(AnchorError::UnknownCommitment(*hash)),
        };
        let election_id = letter.election_id.clone();
        let record = match self
            .index
            .transition(&election_id, hash, AnchorState::Pending)
        {
            Ok(record) => record,
            Err(e) => {
                lock(&self.dead_letters).insert(*hash, letter);
                return Err(e.into());
            }
        };
        if let Err(e) = self.relay.enqueue(letter.commitment.clone()) {
            // Put it back exactly as it was.
            self.index
                .transition(&election_id, hash, AnchorState::DeadLettered)?;
            lock(&self.dead_letters).insert(*hash, letter);
            return Err(e.into());
        }
        info!("Commitment {} requeued by operator", record.receipt_code);
        if let Err(e) = self.audit.append(
            OPERATOR_STREAM,
            "commitment.requeued",
            "Commitment",
            &hash.to_hex(),
            &json!({ "electionId": election_id }),
        ) {
            error!("Failed to audit requeue: {e}");
        }
        Ok(record)
    }

    /// Cancel pending retries and dead-letter their commitments, so that an
    /// operator can requeue them. Failures after this point are dead-lettered
    /// rather than retried.
    pub fn stop(&self) {
        let retries: Vec<PendingRetry> = {
            let mut retries = lock(&self.retries);
            self.stopping.store(true, Ordering::SeqCst);
            retries.drain().map(|(_, retry)| retry).collect()
        };
        if !retries.is_empty() {
            warn!(
                "Cancelled {} pending anchor retries; dead-lettering them",
                retries.len()
            );
        }
        for retry in retries {
            retry.task.abort();
            self.dead_letter(
                retry.commitment,
                retry.attempts,
                &format!("{}; retry cancelled by shutdown", retry.last_error),
            );
        }
    }
}

/// The background task that consumes relay batches.
pub struct AnchorWorker {
    service: Arc<AnchorService>,
    relay: Arc<MixRelay>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl AnchorWorker {
    pub fn spawn(
        service: Arc<AnchorService>,
        relay: Arc<MixRelay>,
        mut batches: UnboundedReceiver<Batch>,
    ) -> Self {
        let worker_service = service.clone();
        let handle = tokio::spawn(async move {
            while let Some(batch) = batches.recv().await {
                worker_service.process_batch(batch).await;
            }
            debug!("Anchoring worker finished");
        });
        info!("Anchoring worker started");
        Self {
            service,
            relay,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn service(&self) -> &Arc<AnchorService> {
        &self.service
    }

    /// Flush the relay, let the worker make a first attempt for everything
    /// it held, then stop. Safe to call more than once.
    pub async fn shutdown(&self) {
        let Some(handle) = lock(&self.handle).take() else {
            return;
        };
        let drained = self.relay.drain().await;
        if drained > 0 {
            info!("Flushed {drained} buffered commitments for anchoring");
        }
        let grace = self.service.policy.attempt_timeout * 4;
        match tokio::time::timeout(grace, handle).await {
            Ok(_) => info!("Anchoring worker stopped"),
            Err(_) => warn!("Anchoring worker did not stop in time"),
        }
        self.service.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration as StdDuration;

    use rand::rngs::OsRng;
    use votecommit::{Salt, Selection, TimestampBucket, TokenId};

    use super::*;
    use crate::ledger::MemLedger;
    use crate::model::election::ElectionState;
    use crate::store::MemElections;

    struct Harness {
        service: Arc<AnchorService>,
        worker: AnchorWorker,
        relay: Arc<MixRelay>,
        ledger: MemLedger,
        elections: MemElections,
        index: Arc<CommitmentIndex>,
    }

    fn harness(policy: RetryPolicy) -> Harness {
        let ledger = MemLedger::new();
        let elections = MemElections::example();
        let index = Arc::new(CommitmentIndex::new());
        let audit = Arc::new(AuditLog::new());
        let (relay, batches) = MixRelay::new(1, Duration::milliseconds(10));
        let client = AnchorClient::new(
            Arc::new(ledger.clone()),
            Arc::new(elections.clone()),
            index.clone(),
            policy.attempt_timeout,
        );
        let service = Arc::new(AnchorService::new(
            client,
            policy,
            index.clone(),
            audit,
            relay.clone(),
        ));
        let worker = AnchorWorker::spawn(service.clone(), relay.clone(), batches);
        Harness {
            service,
            worker,
            relay,
            ledger,
            elections,
            index,
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::milliseconds(5),
            max_delay: Duration::milliseconds(20),
            attempt_timeout: StdDuration::from_millis(200),
        }
    }

    fn commitment(election_id: &str) -> Commitment {
        Commitment::derive(
            election_id,
            &TokenId::random(&mut OsRng),
            &[Selection::option("president", "alice")],
            Salt::random(&mut OsRng),
            TimestampBucket::containing(Utc::now(), 300),
        )
    }

    /// Poll until the commitment reaches `state`.
    async fn wait_for(index: &CommitmentIndex, hash: &Digest256, state: AnchorState) -> CommitmentRecord {
        for _ in 0..200 {
            if let Some(record) = index.get(hash) {
                if record.state == state {
                    return record;
                }
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
        panic!("commitment never reached {state:?}: {:?}", index.get(hash));
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = RetryPolicy::default();
        let delays: Vec<i64> = (1..=9)
            .map(|attempt| policy.delay_after(attempt).num_milliseconds())
            .collect();
        assert_eq!(
            delays,
            [500, 1000, 2000, 4000, 8000, 16000, 32000, 60000, 60000]
        );
        assert_eq!(policy.delay_after(u32::MAX), Duration::seconds(60));
    }

    #[rocket::async_test]
    async fn anchoring_is_idempotent() {
        let h = harness(fast_policy(3));
        let c = commitment("E1");
        let first = h.service.client().anchor(&c).await.unwrap();
        let second = h.service.client().anchor(&c).await.unwrap();
        assert_eq!(first, second);
        assert!(!first.fabric_tx_id.is_empty());
        assert_eq!(h.ledger.height(), 1);
        h.worker.shutdown().await;
    }

    #[rocket::async_test]
    async fn commitment_anchored_elsewhere() {
        let h = harness(fast_policy(3));
        let c = commitment("E1");
        let tx = h
            .ledger
            .submit(&LedgerPayload::Commitment {
                election_id: "E1".to_string(),
                commitment_hash: c.commitment_hash,
                timestamp_bucket: c.timestamp_bucket,
            })
            .await
            .unwrap();

        match h.service.client().anchor(&c).await {
            Err(AnchorError::DuplicateCommitment(receipt)) => {
                assert_eq!(receipt.fabric_tx_id, tx.tx_id)
            }
            other => panic!("expected duplicate, got {other:?}"),
        }
        let record = h.index.get(&c.commitment_hash).unwrap();
        assert_eq!(record.state, AnchorState::Anchored);
        // Now served from the local receipt.
        let receipt = h.service.client().anchor(&c).await.unwrap();
        assert_eq!(receipt.fabric_block_num, tx.block_num);
        assert_eq!(h.ledger.height(), 1);
        h.worker.shutdown().await;
    }

    #[rocket::async_test]
    async fn inactive_election_never_anchored() {
        let h = harness(fast_policy(3));
        let c = commitment("E3");
        assert!(matches!(
            h.service.client().anchor(&c).await,
            Err(AnchorError::ElectionNotActive(_))
        ));
        assert_eq!(h.ledger.height(), 0);
        h.worker.shutdown().await;
    }

    #[rocket::async_test]
    async fn single_attempt_failures() {
        let h = harness(fast_policy(3));
        let c = commitment("E1");
        h.ledger.fail_next(1);
        assert!(matches!(
            h.service.client().anchor(&c).await,
            Err(AnchorError::LedgerUnavailable(_))
        ));
        let record = h.index.get(&c.commitment_hash).unwrap();
        assert_eq!(record.state, AnchorState::Failed);
        assert_eq!(record.attempts, 1);

        // A slow ledger counts as unavailable.
        let slow = commitment("E1");
        h.ledger.set_latency(Some(StdDuration::from_millis(500)));
        assert!(matches!(
            h.service.client().anchor(&slow).await,
            Err(AnchorError::LedgerUnavailable(_))
        ));
        assert_eq!(
            h.index.get(&slow.commitment_hash).unwrap().state,
            AnchorState::Failed
        );
        h.ledger.set_latency(None);
        h.worker.shutdown().await;
    }

    #[rocket::async_test]
    async fn transient_failures_are_retried() {
        let h = harness(fast_policy(5));
        h.ledger.fail_next(2);
        let c = commitment("E1");
        h.index.insert_pending(&c).unwrap();
        h.relay.enqueue(c.clone()).unwrap();

        let record = wait_for(&h.index, &c.commitment_hash, AnchorState::Anchored).await;
        assert_eq!(record.attempts, 3);
        assert!(h.service.dead_letters().is_empty());
        h.worker.shutdown().await;
    }

    #[rocket::async_test]
    async fn exhausted_retries_dead_letter_then_requeue() {
        let h = harness(fast_policy(3));
        h.ledger.set_offline(true);
        let c = commitment("E1");
        h.index.insert_pending(&c).unwrap();
        h.relay.enqueue(c.clone()).unwrap();

        let record = wait_for(&h.index, &c.commitment_hash, AnchorState::DeadLettered).await;
        assert_eq!(record.attempts, 3);
        let letters = h.service.dead_letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].commitment_hash, c.commitment_hash);
        assert_eq!(letters[0].attempts, 3);

        assert!(matches!(
            h.service.requeue(&Digest256::of("unknown")),
            Err(AnchorError::UnknownCommitment(_))
        ));
        h.ledger.set_offline(false);
        let record = h.service.requeue(&c.commitment_hash).unwrap();
        assert_eq!(record.state, AnchorState::Pending);
        assert_eq!(record.attempts, 0);
        assert!(h.service.dead_letters().is_empty());

        let record = wait_for(&h.index, &c.commitment_hash, AnchorState::Anchored).await;
        assert_eq!(record.attempts, 1);
        assert!(matches!(
            h.service.requeue(&c.commitment_hash),
            Err(AnchorError::NotDeadLettered(_))
        ));
        h.worker.shutdown().await;
    }

    #[rocket::async_test]
    async fn closed_election_dead_letters_queued_commitments() {
        let h = harness(fast_policy(3));
        h.elections.set_state("E1", ElectionState::Closed);
        let c = commitment("E1");
        h.index.insert_pending(&c).unwrap();
        h.relay.enqueue(c.clone()).unwrap();

        let record = wait_for(&h.index, &c.commitment_hash, AnchorState::DeadLettered).await;
        assert_eq!(record.attempts, 0);
        assert_eq!(h.ledger.height(), 0);
        h.worker.shutdown().await;
    }

    #[rocket::async_test]
    async fn shutdown_flushes_the_relay() {
        let h = harness(fast_policy(3));
        // Hold everything in the relay: a large batch size and a long hold.
        let (relay, batches) = MixRelay::new(100, Duration::hours(1));
        let worker = AnchorWorker::spawn(h.service.clone(), relay.clone(), batches);
        let commitments: Vec<Commitment> = (0..5).map(|_| commitment("E1")).collect();
        for c in &commitments {
            h.index.insert_pending(c).unwrap();
            relay.enqueue(c.clone()).unwrap();
        }
        assert_eq!(h.ledger.height(), 0);
        worker.shutdown().await;
        worker.shutdown().await;
        assert_eq!(h.ledger.height(), 5);
        for c in &commitments {
            assert_eq!(
                h.index.get(&c.commitment_hash).unwrap().state,
                AnchorState::Anchored
            );
        }
        h.worker.shutdown().await;
    }

    #[rocket::async_test]
    async fn stopping_dead_letters_pending_retries() {
        let h = harness(RetryPolicy {
            base_delay: Duration::hours(1),
            max_delay: Duration::hours(1),
            ..fast_policy(3)
        });
        h.ledger.set_offline(true);
        let c = commitment("E1");
        h.index.insert_pending(&c).unwrap();
        h.relay.enqueue(c.clone()).unwrap();
        wait_for(&h.index, &c.commitment_hash, AnchorState::Failed).await;

        h.service.stop();
        wait_for(&h.index, &c.commitment_hash, AnchorState::DeadLettered).await;
        let letters = h.service.dead_letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].attempts, 1);
        assert!(letters[0].last_error.contains("shutdown"));

        h.ledger.set_offline(false);
        let record = h.service.requeue(&c.commitment_hash).unwrap();
        assert_eq!(record.state, AnchorState::Pending);
        wait_for(&h.index, &c.commitment_hash, AnchorState::Anchored).await;
        h.worker.shutdown().await;
    }

    #[rocket::async_test]
    async fn failures_while_stopping_are_dead_lettered() {
        let h = harness(fast_policy(3));
        h.service.stop();
        h.ledger.set_offline(true);
        let c = commitment("E1");
        h.index.insert_pending(&c).unwrap();
        h.relay.enqueue(c.clone()).unwrap();

        let record = wait_for(&h.index, &c.commitment_hash, AnchorState::DeadLettered).await;
        assert_eq!(record.attempts, 1);
        assert!(h.service.dead_letters()[0]
            .last_error
            .contains("not retried during shutdown"));
        h.worker.shutdown().await;
    }
}
