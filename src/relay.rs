//! The mix layer between the commitment builder and the ledger.
//!
//! Commitments are held in a buffer and released in shuffled batches, either
//! when a full batch has accumulated or when the oldest buffered commitment
//! has waited for the maximum hold time. Each commitment leaves the buffer in
//! exactly one batch.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::{Duration, Utc};
use log::{debug, info, warn};
use rand::{rngs::OsRng, seq::SliceRandom};
use rocket::tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use thiserror::Error;
use votecommit::Commitment;

use crate::scheduled_task::ScheduledTask;

pub type Batch = Vec<Commitment>;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Relay is shut down and no longer accepts commitments")]
    Closed,
}

struct RelayState {
    buffer: Vec<Commitment>,
    /// Armed while the buffer is non-empty.
    timer: Option<ScheduledTask<()>>,
    /// Dropped on shutdown, which ends the consumer's stream of batches.
    sink: Option<UnboundedSender<Batch>>,
}

pub struct MixRelay {
    state: Mutex<RelayState>,
    batch_size: usize,
    max_hold: Duration,
}

impl MixRelay {
    /// Create a relay and the receiving end of its batches.
    pub fn new(batch_size: usize, max_hold: Duration) -> (Arc<Self>, UnboundedReceiver<Batch>) {
        let (sink, batches) = mpsc::unbounded_channel();
        let relay = Arc::new(Self {
            state: Mutex::new(RelayState {
                buffer: Vec::new(),
                timer: None,
                sink: Some(sink),
            }),
            batch_size: batch_size.max(1),
            max_hold,
        });
        (relay, batches)
    }

    fn lock(&self) -> MutexGuard<'_, RelayState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Buffer a commitment for anchoring. Never blocks on the ledger.
    pub fn enqueue(self: &Arc<Self>, commitment: Commitment) -> Result<(), RelayError> {
        let mut state = self.lock();
        if state.sink.is_none() {
            return Err(RelayError::Closed);
        }
        state.buffer.push(commitment);
        let full = state.buffer.len() >= self.batch_size;
        match &state.timer {
            None => state.timer = Some(self.arm(full)),
            Some(timer) if full => timer.trigger_now(),
            Some(_) => {}
        }
        Ok(())
    }

    /// Schedule the next dispatch, immediately if a full batch is waiting.
    fn arm(self: &Arc<Self>, immediate: bool) -> ScheduledTask<()> {
        let run_at = if immediate {
            Utc::now()
        } else {
            Utc::now() + self.max_hold
        };
        let relay: Weak<Self> = Arc::downgrade(self);
        ScheduledTask::new(
            async move {
                if let Some(relay) = relay.upgrade() {
                    relay.dispatch();
                }
            },
            run_at,
        )
    }

    /// Hand one shuffled batch to the consumer.
    fn dispatch(self: &Arc<Self>) {
        let mut state = self.lock();
        state.timer = None;
        let batch = take_batch(&mut state.buffer, self.batch_size);
        if batch.is_empty() {
            return;
        }
        let size = batch.len();
        let returned = match &state.sink {
            Some(sink) => sink.send(batch).err().map(|e| e.0),
            None => Some(batch),
        };
        match returned {
            None => info!("Relay released a batch of {size} commitments"),
            Some(mut batch) => {
                warn!("Anchoring worker unavailable, keeping {size} commitments buffered");
                batch.append(&mut state.buffer);
                state.buffer = batch;
            }
        }
        if !state.buffer.is_empty() && state.sink.is_some() {
            let full = state.buffer.len() >= self.batch_size;
            state.timer = Some(self.arm(full));
        }
    }

    /// Remove up to `batch_size` commitments from the buffer, in random order.
    pub fn flush(&self, batch_size: usize) -> Batch {
        let mut state = self.lock();
        take_batch(&mut state.buffer, batch_size)
    }

    /// Number of commitments waiting.
    pub fn len(&self) -> usize {
        self.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting commitments and release everything still buffered,
    /// then close the stream of batches.
    pub async fn drain(&self) -> usize {
        let (timer, drained) = {
            let mut state = self.lock();
            let timer = state.timer.take();
            let mut drained = 0;
            if let Some(sink) = state.sink.take() {
                while !state.buffer.is_empty() {
                    let batch = take_batch(&mut state.buffer, self.batch_size);
                    let size = batch.len();
                    if let Err(e) = sink.send(batch) {
                        // Nobody is left to anchor these; keep them for inspection.
                        state.buffer.extend(e.0);
                        break;
                    }
                    drained += size;
                }
            }
            (timer, drained)
        };
        if let Some(timer) = timer {
            timer.cancel().await;
        }
        debug!("Relay drained {drained} commitments on shutdown");
        drained
    }
}

fn take_batch(buffer: &mut Vec<Commitment>, batch_size: usize) -> Batch {
    let size = batch_size.min(buffer.len());
    let mut batch: Batch = buffer.drain(..size).collect();
    batch.shuffle(&mut OsRng);
    batch
}
