use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

/// State sharded by election, so that writers for different elections never
/// contend on the same lock.
pub struct Partitioned<T> {
    partitions: RwLock<HashMap<String, Arc<Mutex<T>>>>,
}

impl<T: Default> Partitioned<T> {
    pub fn new() -> Self {
        Self {
            partitions: RwLock::new(HashMap::new()),
        }
    }

    /// Get the partition for `key`, creating it if necessary.
    fn partition(&self, key: &str) -> Arc<Mutex<T>> {
        if let Some(partition) = self
            .partitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
        {
            return partition.clone();
        }
        self.partitions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.to_string())
            .or_default()
            .clone()
    }

    /// Run `f` with exclusive access to the partition for `key`.
    pub fn with<R>(&self, key: &str, f: impl FnOnce(&mut T) -> R) -> R {
        let partition = self.partition(key);
        let mut guard: MutexGuard<T> = partition.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Run `f` over every partition in turn, stopping at the first `Some`.
    pub fn find_map<R>(&self, mut f: impl FnMut(&T) -> Option<R>) -> Option<R> {
        let partitions: Vec<Arc<Mutex<T>>> = self
            .partitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        partitions.iter().find_map(|partition| {
            let guard = partition.lock().unwrap_or_else(PoisonError::into_inner);
            f(&guard)
        })
    }
}

impl<T: Default> Default for Partitioned<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn partitions_are_independent() {
        let sets: Partitioned<HashSet<u32>> = Partitioned::new();
        assert!(sets.with("E1", |s| s.insert(1)));
        assert!(!sets.with("E1", |s| s.insert(1)));
        assert!(sets.with("E2", |s| s.insert(1)));
        assert_eq!(sets.find_map(|s| s.get(&1).copied()), Some(1));
        assert_eq!(sets.find_map(|s| s.get(&2).copied()), None);
    }
}
