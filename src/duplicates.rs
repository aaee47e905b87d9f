//! Near-duplicate grouping over 64-bit perceptual hashes.

use std::collections::{BTreeMap, HashMap};

use crate::media::hamming_distance;

type ClusterId = usize;

/// Union bookkeeping: which cluster each hash belongs to, and each cluster's hashes.
#[derive(Default)]
struct Clusters {
    by_hash: HashMap<u64, ClusterId>,
    members: BTreeMap<ClusterId, Vec<u64>>,
    next: ClusterId,
}

impl Clusters {
    fn create(&mut self, hashes: &[u64]) {
        let id = self.next;
        self.next += 1;
        for &h in hashes {
            self.by_hash.insert(h, id);
        }
        self.members.insert(id, hashes.to_vec());
    }

    fn extend(&mut self, cluster: ClusterId, hash: u64) {
        self.by_hash.insert(hash, cluster);
        self.members.entry(cluster).or_default().push(hash);
    }

    /// Fold `from` into `into`.
    fn merge(&mut self, into: ClusterId, from: ClusterId) {
        if into == from {
            return;
        }
        let moved = self.members.remove(&from).unwrap_or_default();
        for &h in &moved {
            self.by_hash.insert(h, into);
        }
        self.members.entry(into).or_default().extend(moved);
    }

    fn link(&mut self, a: u64, b: u64) {
        match (self.by_hash.get(&a).copied(), self.by_hash.get(&b).copied()) {
            (None, None) => self.create(&[a, b]),
            (Some(c), None) => self.extend(c, b),
            (None, Some(c)) => self.extend(c, a),
            (Some(ca), Some(cb)) => self.merge(ca, cb),
        }
    }
}

/// Group ids whose hashes are connected by chains of distance ≤ `max_distance`.
///
/// Ids sharing an identical hash are always grouped. Only groups with at
/// least two ids are returned; ids inside a group are ascending and groups
/// come out in the order they were first formed.
pub fn find_clusters(entries: &[(i64, u64)], max_distance: u32) -> Vec<Vec<i64>> {
    let mut order: Vec<u64> = Vec::new();
    let mut ids_by_hash: HashMap<u64, Vec<i64>> = HashMap::new();
    for &(id, hash) in entries {
        let ids = ids_by_hash.entry(hash).or_default();
        if ids.is_empty() {
            order.push(hash);
        }
        ids.push(id);
    }

    let mut clusters = Clusters::default();
    for &hash in &order {
        if ids_by_hash[&hash].len() > 1 {
            clusters.create(&[hash]);
        }
    }

    if max_distance > 0 {
        for (i, &a) in order.iter().enumerate() {
            for &b in &order[i + 1..] {
                if hamming_distance(a, b) <= max_distance {
                    clusters.link(a, b);
                }
            }
        }
    }

    clusters
        .members
        .values()
        .filter_map(|hashes| {
            let mut ids: Vec<i64> = hashes
                .iter()
                .flat_map(|h| ids_by_hash.get(h).into_iter().flatten().copied())
                .collect();
            ids.sort_unstable();
            ids.dedup();
            (ids.len() >= 2).then_some(ids)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_is_transitively_closed() {
        // 0x00 and 0x03 are two bits apart but linked through 0x01.
        let entries = [(1, 0x00), (2, 0x01), (3, 0x03)];
        assert_eq!(find_clusters(&entries, 1), vec![vec![1, 2, 3]]);
    }

    #[test]
    fn test_zero_distance_groups_exact_hashes_only() {
        let entries = [(1, 0xff), (2, 0xfe), (3, 0xff), (4, 0x10), (5, 0x10)];
        assert_eq!(find_clusters(&entries, 0), vec![vec![1, 3], vec![4, 5]]);
    }

    #[test]
    fn test_exact_duplicates_seed_and_merge() {
        // Two exact-duplicate clusters bridged by a hash close to both.
        let entries = [
            (10, 0b0000),
            (11, 0b0000),
            (20, 0b0011),
            (21, 0b0011),
            (30, 0b0001),
        ];
        assert_eq!(find_clusters(&entries, 1), vec![vec![10, 11, 20, 21, 30]]);
    }

    #[test]
    fn test_singletons_are_omitted() {
        let entries = [(1, 0x0), (2, 0xffff), (3, 0xffff_0000)];
        assert!(find_clusters(&entries, 3).is_empty());
    }

    #[test]
    fn test_symmetric_in_input_order() {
        let forward = find_clusters(&[(1, 0x1), (2, 0x3), (3, 0x7)], 1);
        let reverse = find_clusters(&[(3, 0x7), (2, 0x3), (1, 0x1)], 1);
        assert_eq!(forward, reverse);
    }
}
