//! Flat in-order binary tree addressing.
//!
//! Leaf `i` lives at index `2i`, parents at odd indices:
//!
//! ```text
//! depth 2          3
//!            /           \
//! depth 1   1             5
//!         /   \         /   \
//! depth 0 0   2         4   6
//! ```
//!
//! A node's depth is the number of trailing one bits of its index, its offset is its
//! position among the nodes of the same depth.

/// Index of the node at `depth` and `offset`.
pub fn index(depth: u32, offset: u64) -> u64 {
    (offset << (depth + 1)) | ((1u64 << depth) - 1)
}

/// Depth of a node. Leaves have depth zero.
pub fn depth(index: u64) -> u32 {
    index.trailing_ones()
}

/// Offset of a node within its depth.
pub fn offset(index: u64) -> u64 {
    index >> (depth(index) + 1)
}

/// Index of the parent node.
pub fn parent(index: u64) -> u64 {
    let depth = depth(index);
    self::index(depth + 1, offset(index) >> 1)
}

/// Index of the sibling node.
pub fn sibling(index: u64) -> u64 {
    let depth = depth(index);
    self::index(depth, offset(index) ^ 1)
}

/// Whether the node is the left child of its parent.
pub fn is_left(index: u64) -> bool {
    offset(index) & 1 == 0
}

/// The left and right children of a parent node, `None` for leaves.
pub fn children(index: u64) -> Option<(u64, u64)> {
    let depth = depth(index);
    if depth == 0 {
        return None;
    }
    let offset = offset(index) << 1;
    Some((self::index(depth - 1, offset), self::index(depth - 1, offset + 1)))
}

/// Number of leaves covered by the node.
pub fn leaf_count(index: u64) -> u64 {
    1u64 << depth(index)
}

/// The first leaf (entry number) covered by the node.
pub fn first_leaf(index: u64) -> u64 {
    offset(index) << depth(index)
}

/// The roots of the perfect subtrees covering `length` leaves, left to right.
///
/// These are the "peaks" a signed root hash commits to.
pub fn full_roots(length: u64) -> Vec<u64> {
    let mut roots = Vec::new();
    let mut start = 0u64;
    let mut remaining = length;
    while remaining > 0 {
        let depth = 63 - remaining.leading_zeros();
        let width = 1u64 << depth;
        roots.push(index(depth, start >> depth));
        start += width;
        remaining -= width;
    }
    roots
}

/// The peak among `full_roots(length)` that covers leaf `leaf`.
pub fn peak_for(leaf: u64, length: u64) -> Option<u64> {
    full_roots(length)
        .into_iter()
        .find(|root| leaf >= first_leaf(*root) && leaf < first_leaf(*root) + leaf_count(*root))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_layout() {
        assert_eq!(index(0, 0), 0);
        assert_eq!(index(0, 1), 2);
        assert_eq!(index(1, 0), 1);
        assert_eq!(index(1, 1), 5);
        assert_eq!(index(2, 0), 3);
        assert_eq!(parent(0), 1);
        assert_eq!(parent(2), 1);
        assert_eq!(parent(1), 3);
        assert_eq!(parent(5), 3);
        assert_eq!(sibling(0), 2);
        assert_eq!(sibling(5), 1);
        assert_eq!(children(3), Some((1, 5)));
        assert_eq!(children(4), None);
        assert_eq!(first_leaf(5), 2);
        assert_eq!(leaf_count(3), 4);
    }

    #[test]
    fn test_full_roots() {
        assert_eq!(full_roots(0), Vec::<u64>::new());
        assert_eq!(full_roots(1), vec![0]);
        assert_eq!(full_roots(2), vec![1]);
        assert_eq!(full_roots(3), vec![1, 4]);
        assert_eq!(full_roots(4), vec![3]);
        assert_eq!(full_roots(7), vec![3, 9, 12]);
        assert_eq!(peak_for(5, 7), Some(9));
        assert_eq!(peak_for(6, 7), Some(12));
        assert_eq!(peak_for(7, 7), None);
    }

    proptest! {
        #[test]
        fn full_roots_cover_every_leaf_once(length in 0u64..10_000) {
            let roots = full_roots(length);
            let mut next = 0;
            for root in roots {
                prop_assert_eq!(first_leaf(root), next);
                next += leaf_count(root);
            }
            prop_assert_eq!(next, length);
        }

        #[test]
        fn parent_of_children(index in 0u64..1_000_000) {
            if let Some((left, right)) = children(index) {
                prop_assert_eq!(parent(left), index);
                prop_assert_eq!(parent(right), index);
                prop_assert_eq!(sibling(left), right);
                prop_assert!(is_left(left));
                prop_assert!(!is_left(right));
            }
        }
    }
}
