use alloy::primitives::keccak256;
use alloy::primitives::B256;

/// Keccak-256 binary Merkle root over already hashed leaves.
///
/// Empty input returns all zeros, a single leaf is its own root and odd
/// levels duplicate their last node.
pub fn merkle_root(leaves: &[B256]) -> B256 {
    if leaves.is_empty() {
        return B256::ZERO;
    }

    let mut level = leaves.to_vec();
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| {
                let left = pair[0];
                let right = pair.get(1).copied().unwrap_or(left);
                let mut preimage = [0u8; 64];
                preimage[..32].copy_from_slice(left.as_slice());
                preimage[32..].copy_from_slice(right.as_slice());
                keccak256(preimage)
            })
            .collect();
    }
    level[0]
}

/// Root over raw proof blobs, each hashed into a leaf first.
pub fn merkle_root_of<T: AsRef<[u8]>>(blobs: &[T]) -> B256 {
    let leaves: Vec<B256> = blobs.iter().map(|b| keccak256(b.as_ref())).collect();
    merkle_root(&leaves)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(
        left: B256,
        right: B256,
    ) -> B256 {
        keccak256([left.as_slice(), right.as_slice()].concat())
    }

    #[test]
    fn test_empty_root() {
        assert_eq!(merkle_root(&[]), B256::ZERO);
    }

    #[test]
    fn test_single_leaf() {
        let leaf = B256::repeat_byte(42);
        assert_eq!(merkle_root(&[leaf]), leaf);
    }

    #[test]
    fn test_odd_level_duplicates_last() {
        let a = B256::repeat_byte(1);
        let b = B256::repeat_byte(2);
        let c = B256::repeat_byte(3);

        let expected = node(node(a, b), node(c, c));
        assert_eq!(merkle_root(&[a, b, c]), expected);
    }

    #[test]
    fn test_blobs_are_hashed() {
        let blobs = [b"block-0".to_vec(), b"block-1".to_vec()];
        let expected = node(keccak256(&blobs[0]), keccak256(&blobs[1]));
        assert_eq!(merkle_root_of(&blobs), expected);
    }
}
