use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Fixed array of independently lockable buckets. Constructing a
/// `LockSet` is the only way to hold more than one bucket at a time,
/// which is what keeps multi-bucket acquisition deadlock free.
pub struct BucketTable<T> {
    buckets: Box<[RwLock<T>]>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

enum BucketGuard<'a, T> {
    Shared(RwLockReadGuard<'a, T>),
    Exclusive(RwLockWriteGuard<'a, T>),
}

/// A set of bucket guards acquired in strictly ascending index order and
/// released in reverse. Two overlapping sets always request their shared
/// buckets in the same relative order, so circular wait is impossible.
pub struct LockSet<'a, T> {
    table: &'a BucketTable<T>,
    mode: LockMode,
    held: Vec<(usize, BucketGuard<'a, T>)>,
}

impl<T> BucketTable<T> {
    pub fn new(count: usize, mut init: impl FnMut() -> T) -> Self {
        let buckets: Vec<RwLock<T>> = (0..count.max(1)).map(|_| RwLock::new(init())).collect();
        Self {
            buckets: buckets.into_boxed_slice(),
        }
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn index_of(&self, hash: u32) -> usize {
        (hash as usize) % self.buckets.len()
    }

    /// Non-blocking exclusive access to a single bucket, for opportunistic
    /// maintenance like move-to-front promotion. Never used for multi-bucket
    /// work; that always goes through `LockSet`.
    pub fn try_exclusive(&self, index: usize) -> Option<RwLockWriteGuard<'_, T>> {
        self.buckets[index].try_write().ok()
    }
}

impl<'a, T> LockSet<'a, T> {
    /// Lock the given buckets. Indices are deduplicated and sorted before
    /// any lock is touched.
    pub fn acquire(table: &'a BucketTable<T>, indices: &[usize], mode: LockMode) -> Self {
        let mut sorted: Vec<usize> = indices.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        let mut held = Vec::with_capacity(sorted.len());
        for idx in sorted {
            let guard = match mode {
                LockMode::Shared => BucketGuard::Shared(table.buckets[idx].read().unwrap()),
                LockMode::Exclusive => BucketGuard::Exclusive(table.buckets[idx].write().unwrap()),
            };
            held.push((idx, guard));
        }
        Self { table, mode, held }
    }

    /// Fast path for operations that touch exactly one bucket.
    pub fn single(table: &'a BucketTable<T>, index: usize, mode: LockMode) -> Self {
        Self::acquire(table, &[index], mode)
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn indices(&self) -> Vec<usize> {
        self.held.iter().map(|(i, _)| *i).collect()
    }

    pub fn holds(&self, index: usize) -> bool {
        self.position(index).is_some()
    }

    fn position(&self, index: usize) -> Option<usize> {
        self.held.binary_search_by_key(&index, |(i, _)| *i).ok()
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        let pos = self.position(index)?;
        Some(match &self.held[pos].1 {
            BucketGuard::Shared(g) => &**g,
            BucketGuard::Exclusive(g) => &**g,
        })
    }

    /// Mutable access; only available when the set was acquired exclusive.
    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        let pos = self.position(index)?;
        match &mut self.held[pos].1 {
            BucketGuard::Shared(_) => None,
            BucketGuard::Exclusive(g) => Some(&mut **g),
        }
    }

    /// Drop every guard except the named bucket. Used to keep the final
    /// match locked while everything else is released.
    pub fn keep_only(&mut self, index: usize) {
        self.held.retain(|(i, _)| *i == index);
    }

    /// Release the whole set and lock the same indices again in `mode`.
    /// There is no in-place upgrade; callers re-validate everything they
    /// observed under the old set after this returns.
    pub fn reacquire(self, mode: LockMode) -> LockSet<'a, T> {
        let table = self.table;
        let indices = self.indices();
        drop(self);
        LockSet::acquire(table, &indices, mode)
    }
}

impl<T> Drop for LockSet<'_, T> {
    fn drop(&mut self) {
        // reverse of acquisition order
        while self.held.pop().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_acquire_sorts_and_dedups() {
        let table = BucketTable::new(8, || 0u32);
        let set = LockSet::acquire(&table, &[5, 1, 5, 3, 1], LockMode::Shared);
        assert_eq!(set.indices(), vec![1, 3, 5]);
        assert!(set.holds(3));
        assert!(!set.holds(2));
    }

    #[test]
    fn test_get_mut_requires_exclusive() {
        let table = BucketTable::new(4, || 0u32);
        let mut shared = LockSet::acquire(&table, &[0], LockMode::Shared);
        assert!(shared.get_mut(0).is_none());
        drop(shared);
        let mut excl = LockSet::acquire(&table, &[0], LockMode::Exclusive);
        *excl.get_mut(0).unwrap() = 9;
        drop(excl);
        let shared = LockSet::acquire(&table, &[0], LockMode::Shared);
        assert_eq!(*shared.get(0).unwrap(), 9);
    }

    #[test]
    fn test_keep_only() {
        let table = BucketTable::new(8, || 0u32);
        let mut set = LockSet::acquire(&table, &[1, 3, 5], LockMode::Shared);
        set.keep_only(3);
        assert_eq!(set.indices(), vec![3]);
        // the dropped buckets are immediately relockable exclusive
        let other = LockSet::acquire(&table, &[1, 5], LockMode::Exclusive);
        assert_eq!(other.indices(), vec![1, 5]);
    }

    #[test]
    fn test_reacquire_changes_mode() {
        let table = BucketTable::new(8, || 0u32);
        let set = LockSet::acquire(&table, &[2, 6], LockMode::Shared);
        let mut set = set.reacquire(LockMode::Exclusive);
        assert_eq!(set.indices(), vec![2, 6]);
        *set.get_mut(2).unwrap() = 1;
        *set.get_mut(6).unwrap() = 1;
    }

    #[test]
    fn test_overlapping_sets_no_deadlock() {
        let table = Arc::new(BucketTable::new(16, || 0u64));
        let mut handles = Vec::new();
        for t in 0..8u32 {
            let table = table.clone();
            handles.push(thread::spawn(move || {
                for i in 0..500u32 {
                    // every thread wants an overlapping trio of buckets,
                    // presented in a thread-specific order
                    let raw = [t % 16, (t + i) % 16, (i * 7 + 3) % 16];
                    let idx: Vec<usize> = raw.iter().map(|h| table.index_of(*h)).collect();
                    let mut set = LockSet::acquire(&table, &idx, LockMode::Exclusive);
                    for j in set.indices() {
                        *set.get_mut(j).unwrap() += 1;
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }
}
