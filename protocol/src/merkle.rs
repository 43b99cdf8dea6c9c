use sha2::{Digest, Sha256};

use crate::hash::Digest256;

/// Merkle root over a list of digests. Odd levels duplicate their last node.
/// The root of an empty list is [`Digest256::ZERO`].
pub fn merkle_root(leaves: &[Digest256]) -> Digest256 {
    if leaves.is_empty() {
        return Digest256::ZERO;
    }
    let mut level = leaves.to_vec();
    while level.len() > 1 {
        if level.len() % 2 == 1 {
            if let Some(last) = level.last().copied() {
                level.push(last);
            }
        }
        level = level
            .chunks(2)
            .map(|pair| {
                let mut hasher = Sha256::new();
                hasher.update(pair[0].as_bytes());
                hasher.update(pair[1].as_bytes());
                Digest256::from_bytes(hasher.finalize().into())
            })
            .collect();
    }
    level[0]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(i: u8) -> Digest256 {
        Digest256::of([i])
    }

    fn node(a: &Digest256, b: &Digest256) -> Digest256 {
        let mut bytes = a.as_bytes().to_vec();
        bytes.extend_from_slice(b.as_bytes());
        Digest256::of(bytes)
    }

    #[test]
    fn small_trees() {
        assert_eq!(merkle_root(&[]), Digest256::ZERO);
        assert_eq!(merkle_root(&[leaf(1)]), leaf(1));
        assert_eq!(merkle_root(&[leaf(1), leaf(2)]), node(&leaf(1), &leaf(2)));

        let left = node(&leaf(1), &leaf(2));
        let right = node(&leaf(3), &leaf(3));
        assert_eq!(
            merkle_root(&[leaf(1), leaf(2), leaf(3)]),
            node(&left, &right)
        );
    }

    #[test]
    fn order_matters() {
        assert_ne!(
            merkle_root(&[leaf(1), leaf(2)]),
            merkle_root(&[leaf(2), leaf(1)])
        );
    }
}
