use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

/// Weighted consistent-hash ring over node names.
///
/// Each node is inserted `weight` times at deterministic points; walking the
/// ring from a key yields every node once, in the key's preference order.
/// `DefaultHasher::new()` hashes with fixed keys, so placement is sticky
/// across process restarts as long as the fleet is unchanged.
#[derive(Default)]
pub(crate) struct ConsistentHash {
    ring: BTreeMap<u64, String>,
}

impl ConsistentHash {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: &str, weight: usize) {
        for replica in 0..weight.max(1) {
            let mut hasher = DefaultHasher::new();
            name.hash(&mut hasher);
            replica.hash(&mut hasher);
            self.ring.insert(hasher.finish(), name.to_owned());
        }
    }

    /// Distinct node names in preference order for the key.
    pub fn list(&self, key: &str) -> Vec<String> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let start = hasher.finish();

        let mut out: Vec<String> = Vec::new();
        let walk = self
            .ring
            .range(start..)
            .chain(self.ring.range(..start))
            .map(|(_, name)| name);
        for name in walk {
            if !out.iter().any(|n| n == name) {
                out.push(name.clone());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walk_yields_every_node_once() {
        let mut ring = ConsistentHash::new();
        ring.add("alpha", 100);
        ring.add("beta", 200);
        ring.add("gamma", 100);

        let order = ring.list("some-task");
        assert_eq!(order.len(), 3);
        for name in ["alpha", "beta", "gamma"] {
            assert!(order.iter().any(|n| n == name));
        }
    }

    #[test]
    fn placement_is_sticky_for_a_key() {
        let build = || {
            let mut ring = ConsistentHash::new();
            ring.add("alpha", 100);
            ring.add("beta", 200);
            ring
        };
        assert_eq!(build().list("job-x"), build().list("job-x"));
    }

    #[test]
    fn zero_weight_still_lands_one_replica() {
        let mut ring = ConsistentHash::new();
        ring.add("solo", 0);
        assert_eq!(ring.list("anything"), vec!["solo".to_string()]);
    }
}
