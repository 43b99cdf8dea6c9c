//! Tamper-evident hash chains for security-relevant events.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::hash::{Digest256, FieldHasher};

const AUDIT_DOMAIN: &str = "votecommit/audit/v1";

/// One link of an audit chain.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub previous_hash: Digest256,
    pub action: String,
    pub resource: String,
    pub resource_id: String,
    pub details_digest: Digest256,
    pub timestamp: DateTime<Utc>,
    pub hash: Digest256,
}

impl AuditEntry {
    /// Recompute this entry's hash from its other fields.
    pub fn compute_hash(&self) -> Digest256 {
        entry_hash(
            &self.previous_hash,
            &self.action,
            &self.resource,
            &self.resource_id,
            &self.details_digest,
            self.timestamp,
        )
    }
}

fn entry_hash(
    previous_hash: &Digest256,
    action: &str,
    resource: &str,
    resource_id: &str,
    details_digest: &Digest256,
    timestamp: DateTime<Utc>,
) -> Digest256 {
    let mut hasher = FieldHasher::new(AUDIT_DOMAIN);
    hasher
        .field(previous_hash.as_bytes())
        .field(action)
        .field(resource)
        .field(resource_id)
        .field(details_digest.as_bytes())
        .field(timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true));
    hasher.finish()
}

/// Digest of arbitrary details, via canonical (key-sorted, compact) JSON.
pub fn details_digest<T: Serialize + ?Sized>(details: &T) -> Result<Digest256, serde_json::Error> {
    let value = serde_json::to_value(details)?;
    let mut canonical = String::new();
    write_canonical(&value, &mut canonical)?;
    Ok(Digest256::of(canonical))
}

fn write_canonical(value: &Value, out: &mut String) -> Result<(), serde_json::Error> {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key)?);
                out.push(':');
                write_canonical(&map[key], out)?;
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out)?;
            }
            out.push(']');
        }
        scalar => out.push_str(&serde_json::to_string(scalar)?),
    }
    Ok(())
}

/// Create the entry following `previous_hash`, stamped with the current time.
pub fn append<T: Serialize + ?Sized>(
    previous_hash: &Digest256,
    action: &str,
    resource: &str,
    resource_id: &str,
    details: &T,
) -> Result<AuditEntry, serde_json::Error> {
    append_at(previous_hash, action, resource, resource_id, details, Utc::now())
}

/// As [`append`], with an explicit timestamp.
pub fn append_at<T: Serialize + ?Sized>(
    previous_hash: &Digest256,
    action: &str,
    resource: &str,
    resource_id: &str,
    details: &T,
    timestamp: DateTime<Utc>,
) -> Result<AuditEntry, serde_json::Error> {
    let details_digest = details_digest(details)?;
    let hash = entry_hash(
        previous_hash,
        action,
        resource,
        resource_id,
        &details_digest,
        timestamp,
    );
    Ok(AuditEntry {
        previous_hash: *previous_hash,
        action: action.to_string(),
        resource: resource.to_string(),
        resource_id: resource_id.to_string(),
        details_digest,
        timestamp,
        hash,
    })
}

/// Index of the first entry that does not link to its predecessor or whose
/// stored hash does not match its contents. The first entry must link to
/// [`Digest256::ZERO`].
pub fn find_break(entries: &[AuditEntry]) -> Option<usize> {
    let mut expected_previous = Digest256::ZERO;
    for (i, entry) in entries.iter().enumerate() {
        if entry.previous_hash != expected_previous || entry.compute_hash() != entry.hash {
            return Some(i);
        }
        expected_previous = entry.hash;
    }
    None
}

/// Recompute the whole chain from genesis.
pub fn verify_chain(entries: &[AuditEntry]) -> bool {
    find_break(entries).is_none()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn chain(len: usize) -> Vec<AuditEntry> {
        let mut entries: Vec<AuditEntry> = Vec::new();
        for i in 0..len {
            let previous = entries.last().map_or(Digest256::ZERO, |e| e.hash);
            let entry = append(
                &previous,
                "commitment.created",
                "Commitment",
                &format!("c{i}"),
                &json!({"index": i, "channel": "WEB"}),
            )
            .unwrap();
            entries.push(entry);
        }
        entries
    }

    #[test]
    fn valid_chain_verifies() {
        assert!(verify_chain(&[]));
        assert!(verify_chain(&chain(10)));
    }

    #[test]
    fn flipped_hash_detected() {
        let entries = chain(10);
        for i in 0..entries.len() {
            let mut tampered = entries.clone();
            let mut bytes = *tampered[i].hash.as_bytes();
            bytes[0] ^= 1;
            tampered[i].hash = Digest256::from_bytes(bytes);
            assert!(!verify_chain(&tampered), "tamper at {i} not detected");
            assert_eq!(find_break(&tampered), Some(i));
        }
    }

    #[test]
    fn flipped_details_digest_detected() {
        let entries = chain(10);
        for i in 0..entries.len() {
            let mut tampered = entries.clone();
            let mut bytes = *tampered[i].details_digest.as_bytes();
            bytes[31] ^= 0x80;
            tampered[i].details_digest = Digest256::from_bytes(bytes);
            assert!(!verify_chain(&tampered), "tamper at {i} not detected");
        }
    }

    #[test]
    fn removed_entry_detected() {
        let mut entries = chain(5);
        entries.remove(2);
        assert_eq!(find_break(&entries), Some(2));
    }

    #[test]
    fn details_digest_ignores_key_order() {
        let a = details_digest(&json!({"a": 1, "b": {"x": true, "y": [1, 2]}})).unwrap();
        let b = details_digest(&json!({"b": {"y": [1, 2], "x": true}, "a": 1})).unwrap();
        assert_eq!(a, b);
        let c = details_digest(&json!({"a": 2, "b": {"x": true, "y": [1, 2]}})).unwrap();
        assert_ne!(a, c);
    }
}
