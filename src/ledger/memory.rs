use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use log::debug;
use rocket::tokio;
use votecommit::{hash::FieldHasher, Digest256};

use super::{Ledger, LedgerError, LedgerPayload, LedgerTx, TxStatus};

#[derive(Default)]
struct Chain {
    blocks: Vec<(LedgerPayload, LedgerTx)>,
    by_key: HashMap<String, usize>,
    by_tx: HashMap<String, usize>,
    invalid: HashSet<String>,
    fail_next: u32,
    offline: bool,
    latency: Option<Duration>,
}

/// An in-process append-only ledger, one transaction per block.
///
/// Used when no ledger gateway is configured, and in tests, where failures
/// and latency can be injected.
#[derive(Clone, Default)]
pub struct MemLedger {
    chain: Arc<Mutex<Chain>>,
}

impl MemLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Chain> {
        self.chain.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next `n` submissions fail as unavailable.
    pub fn fail_next(&self, n: u32) {
        self.lock().fail_next = n;
    }

    /// Take the whole ledger offline, or bring it back.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// Delay every submission by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.lock().latency = latency;
    }

    /// Report a written transaction as failing validation.
    pub fn invalidate(&self, tx_id: &str) {
        self.lock().invalid.insert(tx_id.to_string());
    }

    /// Number of transactions written.
    pub fn height(&self) -> u64 {
        self.lock().blocks.len() as u64
    }

    /// Every payload on the ledger, in block order.
    pub fn payloads(&self) -> Vec<LedgerPayload> {
        self.lock().blocks.iter().map(|(p, _)| p.clone()).collect()
    }

    fn check_online(chain: &Chain) -> Result<(), LedgerError> {
        if chain.offline {
            return Err(LedgerError::Unavailable("ledger offline".to_string()));
        }
        Ok(())
    }
}

/// `txId = H(payload ∥ blockNum)`.
fn tx_id(payload: &LedgerPayload, block_num: u64) -> Result<String, LedgerError> {
    let bytes = rocket::serde::json::serde_json::to_vec(payload)
        .map_err(|e| LedgerError::Rejected(e.to_string()))?;
    let mut hasher = FieldHasher::new("votecommit/ledger-tx/v1");
    hasher.field(bytes).int(block_num);
    Ok(hasher.finish().to_hex())
}

#[rocket::async_trait]
impl Ledger for MemLedger {
    async fn submit(&self, payload: &LedgerPayload) -> Result<LedgerTx, LedgerError> {
        let latency = self.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut chain = self.lock();
        Self::check_online(&chain)?;
        if chain.fail_next > 0 {
            chain.fail_next -= 1;
            return Err(LedgerError::Unavailable("injected failure".to_string()));
        }
        let key = payload.key();
        if chain.by_key.contains_key(&key) {
            return Err(LedgerError::Duplicate);
        }
        let block_num = chain.blocks.len() as u64 + 1;
        let tx = LedgerTx {
            tx_id: tx_id(payload, block_num)?,
            block_num,
            timestamp: Utc::now(),
        };
        let index = chain.blocks.len();
        chain.by_key.insert(key, index);
        chain.by_tx.insert(tx.tx_id.clone(), index);
        chain.blocks.push((payload.clone(), tx.clone()));
        debug!("Ledger block {block_num} written");
        Ok(tx)
    }

    async fn query(&self, tx_id: &str) -> Result<Option<TxStatus>, LedgerError> {
        let chain = self.lock();
        Self::check_online(&chain)?;
        Ok(chain.by_tx.get(tx_id).map(|_| {
            if chain.invalid.contains(tx_id) {
                TxStatus::Invalid
            } else {
                TxStatus::Committed
            }
        }))
    }

    async fn find_commitment(
        &self,
        commitment_hash: &Digest256,
    ) -> Result<Option<LedgerTx>, LedgerError> {
        let chain = self.lock();
        Self::check_online(&chain)?;
        Ok(chain
            .by_key
            .get(&commitment_hash.to_hex())
            .map(|&i| chain.blocks[i].1.clone()))
    }
}
