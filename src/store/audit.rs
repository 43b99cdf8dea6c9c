use log::{error, warn};
use serde::Serialize;
use thiserror::Error;
use votecommit::{audit, merkle_root, AuditEntry, Digest256};

use crate::store::partition::Partitioned;

/// Stream for operator actions that are not tied to an election.
pub const OPERATOR_STREAM: &str = "operator";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuditError {
    #[error("Audit chain `{stream}` failed verification at entry {index}")]
    ChainMismatch { stream: String, index: usize },
    #[error("Audit details could not be serialised: {0}")]
    Details(String),
}

#[derive(Default)]
struct Stream {
    entries: Vec<AuditEntry>,
    /// Set once tampering is detected; the stream then refuses all writes.
    halted_at: Option<usize>,
}

impl Stream {
    fn check_writable(&self, name: &str) -> Result<(), AuditError> {
        match self.halted_at {
            Some(index) => Err(AuditError::ChainMismatch {
                stream: name.to_string(),
                index,
            }),
            None => Ok(()),
        }
    }

    fn halt(&mut self, name: &str, index: usize) -> AuditError {
        if self.halted_at.is_none() {
            error!("Audit chain `{name}` broken at entry {index}, halting writes to it");
        }
        self.halted_at = Some(index);
        AuditError::ChainMismatch {
            stream: name.to_string(),
            index,
        }
    }
}

/// Append-only audit chains, one per stream. Each stream has a single writer
/// at a time, so chains never fork.
#[derive(Default)]
pub struct AuditLog {
    streams: Partitioned<Stream>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event to `stream`, linking it to the current tail.
    pub fn append<T: Serialize + ?Sized>(
        &self,
        stream: &str,
        action: &str,
        resource: &str,
        resource_id: &str,
        details: &T,
    ) -> Result<AuditEntry, AuditError> {
        self.streams.with(stream, |s| {
            s.check_writable(stream)?;
            let previous = match s.entries.last() {
                Some(tail) => {
                    let expected = s
                        .entries
                        .len()
                        .checked_sub(2)
                        .map_or(Digest256::ZERO, |i| s.entries[i].hash);
                    if tail.compute_hash() != tail.hash || tail.previous_hash != expected {
                        let index = s.entries.len() - 1;
                        return Err(s.halt(stream, index));
                    }
                    tail.hash
                }
                None => Digest256::ZERO,
            };
            let entry = audit::append(&previous, action, resource, resource_id, details)
                .map_err(|e| AuditError::Details(e.to_string()))?;
            s.entries.push(entry.clone());
            Ok(entry)
        })
    }

    /// Fail if `stream` has been halted by a detected tamper.
    pub fn ensure_writable(&self, stream: &str) -> Result<(), AuditError> {
        self.streams.with(stream, |s| s.check_writable(stream))
    }

    /// Recompute `stream` from genesis. Returns the number of entries, or
    /// halts the stream on the first mismatch.
    pub fn verify(&self, stream: &str) -> Result<usize, AuditError> {
        self.streams.with(stream, |s| {
            if let Some(index) = audit::find_break(&s.entries) {
                return Err(s.halt(stream, index));
            }
            s.check_writable(stream)?;
            Ok(s.entries.len())
        })
    }

    /// Merkle root over the hashes of a verified stream, and its length.
    pub fn root(&self, stream: &str) -> Result<(Digest256, usize), AuditError> {
        self.streams.with(stream, |s| {
            if let Some(index) = audit::find_break(&s.entries) {
                return Err(s.halt(stream, index));
            }
            s.check_writable(stream)?;
            let hashes: Vec<Digest256> = s.entries.iter().map(|e| e.hash).collect();
            if hashes.is_empty() {
                warn!("Computing Merkle root of empty audit stream `{stream}`");
            }
            Ok((merkle_root(&hashes), hashes.len()))
        })
    }

    pub fn entries(&self, stream: &str) -> Vec<AuditEntry> {
        self.streams.with(stream, |s| s.entries.clone())
    }

    /// Direct access to stored entries, to simulate tampering.
    #[cfg(test)]
    pub fn tamper(&self, stream: &str, f: impl FnOnce(&mut Vec<AuditEntry>)) {
        self.streams.with(stream, |s| f(&mut s.entries))
    }
}
