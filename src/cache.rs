use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use crate::bucket_locks::{BucketTable, LockMode, LockSet};
use crate::config::EngineConfig;
use crate::node::{CacheNode, HintState};
use crate::path::{compute_hash_stack, fold_name, HashStack, MAX_TOTAL_LEVELS};
use crate::store::{CellId, ContainerId, HiveStore};
use crate::{NsError, NsResult};

/// One hash-table slot: a move-to-front chain of nodes whose conv_key maps
/// here.
#[derive(Default)]
pub struct Bucket {
    pub(crate) chain: Vec<Arc<CacheNode>>,
}

impl Bucket {
    fn unlink(&mut self, node: &Arc<CacheNode>) -> bool {
        let before = self.chain.len();
        self.chain.retain(|n| !Arc::ptr_eq(n, node));
        before != self.chain.len()
    }
}

enum SuffixMatch {
    No,
    /// A fake node whose parent has been torn down; evict and re-probe.
    Stale,
    Yes,
}

enum Probe {
    Hit(Arc<CacheNode>, usize),
    Miss,
    Stale(Arc<CacheNode>),
}

/// The namespace cache: bucket-chained nodes addressed by full-path hash,
/// with longest-suffix-match lookup and a delayed-close grace list for
/// zero-reference nodes.
pub struct NamespaceCache {
    table: BucketTable<Bucket>,
    delayed: Mutex<VecDeque<Arc<CacheNode>>>,
    delayed_close_size: usize,
    small_hint_threshold: usize,
    cache_fake_nodes: bool,
}

impl NamespaceCache {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            table: BucketTable::new(config.bucket_count, Bucket::default),
            delayed: Mutex::new(VecDeque::new()),
            delayed_close_size: config.delayed_close_size.max(1),
            small_hint_threshold: config.small_hint_threshold,
            cache_fake_nodes: config.cache_fake_nodes,
        }
    }

    pub fn bucket_count(&self) -> usize {
        self.table.bucket_count()
    }

    pub(crate) fn delayed_len(&self) -> usize {
        self.delayed.lock().unwrap().len()
    }

    /// Insert (or re-reference) the cache node for a container root. Roots
    /// sit at level 1 with no parent and anchor every upward name walk.
    pub(crate) fn attach_root(
        &self,
        name: &str,
        container: ContainerId,
        cell: CellId,
    ) -> NsResult<Arc<CacheNode>> {
        let conv_key = fold_name(0, name);
        let idx = self.table.index_of(conv_key);
        let mut lock = LockSet::single(&self.table, idx, LockMode::Exclusive);
        let existing = lock.get(idx).and_then(|b| {
            b.chain
                .iter()
                .find(|n| {
                    n.conv_key() == conv_key
                        && n.total_levels == 1
                        && n.is_root()
                        && !n.is_deleted()
                        && n.name_matches(name)
                })
                .cloned()
        });
        if let Some(root) = existing {
            if !root.try_reference() {
                return Err(NsError::InsufficientResources(format!(
                    "reference limit on root {}",
                    root.name()
                )));
            }
            drop(lock);
            self.unpark(&root);
            return Ok(root);
        }
        let node = CacheNode::new(None, name, conv_key, 1, container, cell, false, false);
        match lock.get_mut(idx) {
            Some(b) => b.chain.insert(0, node.clone()),
            None => return Err(NsError::Internal("root bucket not held".to_string())),
        }
        Ok(node)
    }

    /// Longest-suffix-match lookup. Returns a referenced node plus the
    /// number of leading stack entries it satisfies; depth 0 means the base
    /// itself. The caller resolves the remaining suffix against storage.
    pub(crate) fn lookup(
        &self,
        base: &Arc<CacheNode>,
        stack: &HashStack<'_>,
    ) -> NsResult<(Arc<CacheNode>, usize)> {
        if base.is_deleted() {
            return Err(NsError::KeyDeleted(format!("base {}", base.name())));
        }
        if stack.is_empty() {
            self.reference_existing(base)?;
            return Ok((base.clone(), 0));
        }
        let indices: Vec<usize> = stack
            .iter()
            .map(|e| self.table.index_of(e.conv_key))
            .collect();
        loop {
            let probe = {
                let lock = LockSet::acquire(&self.table, &indices, LockMode::Shared);
                let mut probe = Probe::Miss;
                'outer: for i in (0..stack.len()).rev() {
                    let level = base.total_levels + i as u32 + 1;
                    let idx = self.table.index_of(stack[i].conv_key);
                    let bucket = match lock.get(idx) {
                        Some(b) => b,
                        None => continue,
                    };
                    for cand in &bucket.chain {
                        if cand.conv_key() != stack[i].conv_key || cand.total_levels != level {
                            continue;
                        }
                        match self.match_suffix(cand, base, stack, i) {
                            SuffixMatch::No => {}
                            SuffixMatch::Stale => {
                                probe = Probe::Stale(cand.clone());
                                break 'outer;
                            }
                            SuffixMatch::Yes => {
                                if !cand.try_reference() {
                                    return Err(NsError::InsufficientResources(format!(
                                        "reference limit on {}",
                                        cand.name()
                                    )));
                                }
                                probe = Probe::Hit(cand.clone(), i + 1);
                                break 'outer;
                            }
                        }
                    }
                }
                probe
            };
            match probe {
                Probe::Hit(node, depth) => {
                    self.unpark(&node);
                    self.promote(&node);
                    return Ok((node, depth));
                }
                Probe::Miss => {
                    self.reference_existing(base)?;
                    return Ok((base.clone(), 0));
                }
                Probe::Stale(victim) => {
                    self.evict_stale(&victim, &indices);
                    if base.is_deleted() {
                        return Err(NsError::KeyDeleted(format!("base {}", base.name())));
                    }
                }
            }
        }
    }

    /// Walk the candidate's parent chain against the stack suffix ending at
    /// index `i`. The walk must consume every entry and land exactly on the
    /// base node.
    fn match_suffix(
        &self,
        candidate: &Arc<CacheNode>,
        base: &Arc<CacheNode>,
        stack: &HashStack<'_>,
        i: usize,
    ) -> SuffixMatch {
        if candidate.is_deleted() {
            return SuffixMatch::No;
        }
        let mut cur = candidate.clone();
        let mut j = i;
        loop {
            if !cur.name_matches(stack[j].name) {
                return SuffixMatch::No;
            }
            let parent = match cur.parent() {
                Some(p) => p,
                None => return SuffixMatch::No,
            };
            if j == 0 {
                return if Arc::ptr_eq(&parent, base) {
                    SuffixMatch::Yes
                } else {
                    SuffixMatch::No
                };
            }
            if parent.is_deleted() {
                return if candidate.is_fake() {
                    SuffixMatch::Stale
                } else {
                    SuffixMatch::No
                };
            }
            cur = parent;
            j -= 1;
        }
    }

    /// Exclusive re-probe after a shared-mode lookup tripped over a fake
    /// node under a torn-down parent. Everything observed under the shared
    /// set is re-validated here.
    fn evict_stale(&self, victim: &Arc<CacheNode>, indices: &[usize]) {
        let mut pending: Vec<Arc<CacheNode>> = Vec::new();
        {
            let mut lock = LockSet::acquire(&self.table, indices, LockMode::Exclusive);
            let idx = self.table.index_of(victim.conv_key());
            let parent_gone = victim
                .parent()
                .map(|p| p.is_deleted())
                .unwrap_or(true);
            if victim.is_fake() && parent_gone && !victim.is_deleted() {
                victim.mark_deleted();
            }
            if victim.is_deleted() && victim.ref_count() == 0 {
                if let Some(bucket) = lock.get_mut(idx) {
                    if bucket.unlink(victim) {
                        if let Some(t) = victim.set_link_target(None) {
                            pending.push(t);
                        }
                        if let Some(p) = victim.parent() {
                            pending.push(p);
                        }
                    }
                }
            }
        }
        self.unpark(victim);
        for n in pending {
            self.release(n);
        }
    }

    /// Create-and-chain with dedupe: a racing creator finds the winner's
    /// node already chained, references it, and discards its own. A chained
    /// fake node is converted to the real thing in place.
    pub(crate) fn create_node(
        &self,
        parent: &Arc<CacheNode>,
        name: &str,
        container: ContainerId,
        cell: CellId,
        is_symlink: bool,
        fake: bool,
    ) -> NsResult<Arc<CacheNode>> {
        let conv_key = fold_name(parent.conv_key(), name);
        let levels = parent.total_levels + 1;
        if levels > MAX_TOTAL_LEVELS {
            return Err(NsError::NameTooLong(format!(
                "node depth {} exceeds limit {}",
                levels, MAX_TOTAL_LEVELS
            )));
        }
        let idx = self.table.index_of(conv_key);
        let parent_idx = self.table.index_of(parent.conv_key());
        let mut lock = LockSet::acquire(&self.table, &[parent_idx, idx], LockMode::Exclusive);
        if parent.is_deleted() {
            return Err(NsError::KeyDeleted(format!("parent {}", parent.name())));
        }
        let dup = lock.get(idx).and_then(|b| {
            b.chain
                .iter()
                .find(|n| {
                    n.conv_key() == conv_key
                        && n.total_levels == levels
                        && !n.is_deleted()
                        && n.name_matches(name)
                        && n.parent().map_or(false, |p| Arc::ptr_eq(&p, parent))
                })
                .cloned()
        });
        if let Some(existing) = dup {
            if !existing.try_reference() {
                return Err(NsError::InsufficientResources(format!(
                    "reference limit on {}",
                    existing.name()
                )));
            }
            if existing.is_fake() && !fake {
                existing.make_real(cell, is_symlink);
            }
            drop(lock);
            self.unpark(&existing);
            return Ok(existing);
        }
        if !parent.try_reference() {
            return Err(NsError::InsufficientResources(format!(
                "reference limit on parent {}",
                parent.name()
            )));
        }
        let node = CacheNode::new(
            Some(parent),
            name,
            conv_key,
            levels,
            container,
            cell,
            is_symlink,
            fake,
        );
        match lock.get_mut(idx) {
            Some(b) => b.chain.insert(0, node.clone()),
            None => {
                parent.dereference();
                return Err(NsError::Internal("target bucket not held".to_string()));
            }
        }
        Ok(node)
    }

    /// Take one more reference on a node the caller already holds.
    pub(crate) fn reference_existing(&self, node: &Arc<CacheNode>) -> NsResult<()> {
        if !node.try_reference() {
            return Err(NsError::InsufficientResources(format!(
                "reference limit on {}",
                node.name()
            )));
        }
        self.unpark(node);
        Ok(())
    }

    /// Drop one engine reference. At zero the node either moves onto the
    /// delayed-close list or, if tombstoned, is unlinked immediately. Every
    /// unlink also drops the engine references the node itself held (its
    /// parent, a cached symlink target), which is what the worklist is for.
    pub(crate) fn release(&self, node: Arc<CacheNode>) {
        let mut pending = vec![node];
        while let Some(n) = pending.pop() {
            if n.dereference() > 0 {
                continue;
            }
            if n.is_deleted() {
                self.reclaim(&n, &mut pending);
            } else {
                self.park_delayed(n, &mut pending);
            }
        }
    }

    fn reclaim(&self, n: &Arc<CacheNode>, pending: &mut Vec<Arc<CacheNode>>) {
        let idx = self.table.index_of(n.conv_key());
        let unlinked = {
            let mut lock = LockSet::single(&self.table, idx, LockMode::Exclusive);
            if n.ref_count() != 0 {
                return;
            }
            match lock.get_mut(idx) {
                Some(b) => b.unlink(n),
                None => false,
            }
        };
        if unlinked {
            self.unpark(n);
            if let Some(t) = n.set_link_target(None) {
                pending.push(t);
            }
            if let Some(p) = n.parent() {
                pending.push(p);
            }
            debug!("reclaimed deleted node {}", n.name());
        }
    }

    fn park_delayed(&self, n: Arc<CacheNode>, pending: &mut Vec<Arc<CacheNode>>) {
        let mut overflow: Vec<Arc<CacheNode>> = Vec::new();
        {
            let mut dl = self.delayed.lock().unwrap();
            if n.ref_count() == 0
                && !n.is_deleted()
                && !n.on_delay_list.swap(true, Ordering::AcqRel)
            {
                dl.push_back(n);
            }
            while dl.len() > self.delayed_close_size {
                if let Some(old) = dl.pop_front() {
                    old.on_delay_list.store(false, Ordering::Release);
                    overflow.push(old);
                }
            }
        }
        for old in overflow {
            self.evict(old, pending);
        }
    }

    fn evict(&self, n: Arc<CacheNode>, pending: &mut Vec<Arc<CacheNode>>) {
        let idx = self.table.index_of(n.conv_key());
        let unlinked = {
            let mut lock = LockSet::single(&self.table, idx, LockMode::Exclusive);
            // re-referenced since it was parked; it re-parks on release
            if n.ref_count() != 0 {
                return;
            }
            match lock.get_mut(idx) {
                Some(b) => b.unlink(&n),
                None => false,
            }
        };
        if unlinked {
            if let Some(t) = n.set_link_target(None) {
                pending.push(t);
            }
            if let Some(p) = n.parent() {
                pending.push(p);
            }
            debug!("evicted idle node {}", n.name());
        }
    }

    fn unpark(&self, n: &Arc<CacheNode>) {
        if !n.on_delay_list.load(Ordering::Acquire) {
            return;
        }
        let mut dl = self.delayed.lock().unwrap();
        if n.on_delay_list.swap(false, Ordering::AcqRel) {
            dl.retain(|x| !Arc::ptr_eq(x, n));
        }
    }

    fn promote(&self, node: &Arc<CacheNode>) {
        let idx = self.table.index_of(node.conv_key());
        // opportunistic; a contended bucket just skips the promotion
        if let Some(mut bucket) = self.table.try_exclusive(idx) {
            if let Some(pos) = bucket.chain.iter().position(|n| Arc::ptr_eq(n, node)) {
                if pos > 0 {
                    let n = bucket.chain.remove(pos);
                    bucket.chain.insert(0, n);
                }
            }
        }
    }

    /// After a storage walk confirmed `missing` is absent under `parent`,
    /// cache whatever cheap signal will answer the repeat miss: a subkey
    /// hint when the child set is small enough, otherwise a fake child node
    /// pinning that one name.
    pub(crate) fn enrich_after_miss(
        &self,
        store: &dyn HiveStore,
        parent: &Arc<CacheNode>,
        missing: &str,
    ) {
        if parent.is_deleted() || parent.is_fake() {
            return;
        }
        let hashes = match store.child_hashes(parent.container, parent.cell()) {
            Ok(h) => h,
            Err(e) => {
                debug!("hint enrichment skipped for {}: {}", parent.name(), e);
                return;
            }
        };
        let n = hashes.len();
        if n == 0 {
            parent.set_hint(HintState::NoSubkeys);
        } else if n == 1 {
            parent.set_hint(HintState::SingleSubkey(hashes[0]));
        } else if n <= self.small_hint_threshold {
            parent.set_hint(HintState::SmallSet(hashes));
        } else if self.cache_fake_nodes {
            match self.create_node(parent, missing, parent.container, CellId::NIL, false, true) {
                Ok(fake) => {
                    debug!("cached negative entry {}\\{}", parent.name(), missing);
                    self.release(fake);
                }
                Err(e) => debug!("negative entry for {} not cached: {}", missing, e),
            }
        }
    }

    /// Find an already-materialized node for an absolute path, used to
    /// pre-validate symlink targets. The upward walk must end at a root.
    pub(crate) fn probe_absolute(&self, target: &str) -> NsResult<Option<Arc<CacheNode>>> {
        let (stack, _) = compute_hash_stack(0, target)?;
        let last = match stack.last() {
            Some(l) => l,
            None => return Ok(None),
        };
        let idx = self.table.index_of(last.conv_key);
        let found = {
            let lock = LockSet::single(&self.table, idx, LockMode::Shared);
            let bucket = match lock.get(idx) {
                Some(b) => b,
                None => return Ok(None),
            };
            let mut found = None;
            for cand in &bucket.chain {
                if cand.conv_key() != last.conv_key
                    || cand.total_levels as usize != stack.len()
                    || cand.is_deleted()
                    || cand.is_fake()
                {
                    continue;
                }
                if self.absolute_match(cand, &stack) {
                    if !cand.try_reference() {
                        return Err(NsError::InsufficientResources(format!(
                            "reference limit on {}",
                            cand.name()
                        )));
                    }
                    found = Some(cand.clone());
                    break;
                }
            }
            found
        };
        if let Some(node) = &found {
            self.unpark(node);
        }
        Ok(found)
    }

    fn absolute_match(&self, node: &Arc<CacheNode>, stack: &HashStack<'_>) -> bool {
        let mut cur = node.clone();
        let mut j = stack.len();
        loop {
            if j == 0 {
                return false;
            }
            j -= 1;
            if !cur.name_matches(stack[j].name) {
                return false;
            }
            match cur.parent() {
                Some(p) => {
                    if j == 0 || p.is_deleted() {
                        return false;
                    }
                    cur = p;
                }
                None => return j == 0,
            }
        }
    }

    /// Remember a resolved symlink target on the link node. Both bucket
    /// locks are taken (ascending) so the slot never flips concurrently
    /// with a structural change to either chain. Ownership of the target's
    /// engine reference moves into the slot.
    pub(crate) fn cache_link_target(&self, link: &Arc<CacheNode>, target: Arc<CacheNode>) {
        if Arc::ptr_eq(link, &target) {
            // a self-referential slot would pin the node forever
            self.release(target);
            return;
        }
        let li = self.table.index_of(link.conv_key());
        let ti = self.table.index_of(target.conv_key());
        let old = {
            let _lock = LockSet::acquire(&self.table, &[li, ti], LockMode::Exclusive);
            link.set_link_target(Some(target))
        };
        if let Some(old) = old {
            self.release(old);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::compute_hash_stack;

    fn test_cache() -> NamespaceCache {
        NamespaceCache::new(&EngineConfig {
            bucket_count: 16,
            delayed_close_size: 2,
            ..EngineConfig::default()
        })
    }

    fn chain_abc(cache: &NamespaceCache) -> (Arc<CacheNode>, Arc<CacheNode>) {
        let root = cache.attach_root("root", 1, CellId(0)).unwrap();
        let a = cache
            .create_node(&root, "A", 1, CellId(1), false, false)
            .unwrap();
        let b = cache.create_node(&a, "B", 1, CellId(2), false, false).unwrap();
        let c = cache.create_node(&b, "C", 1, CellId(3), false, false).unwrap();
        cache.release(a);
        cache.release(b);
        (root, c)
    }

    #[test]
    fn test_longest_suffix_match_depth() {
        let cache = test_cache();
        let (root, c) = chain_abc(&cache);
        let (stack, _) = compute_hash_stack(root.conv_key(), "\\A\\B\\C\\D").unwrap();
        let (node, depth) = cache.lookup(&root, &stack).unwrap();
        assert_eq!(depth, 3);
        assert!(Arc::ptr_eq(&node, &c));
        cache.release(node);
        cache.release(c);
    }

    #[test]
    fn test_lookup_depth_zero_on_miss() {
        let cache = test_cache();
        let (root, c) = chain_abc(&cache);
        let (stack, _) = compute_hash_stack(root.conv_key(), "\\X\\Y").unwrap();
        let (node, depth) = cache.lookup(&root, &stack).unwrap();
        assert_eq!(depth, 0);
        assert!(Arc::ptr_eq(&node, &root));
        cache.release(node);
        cache.release(c);
    }

    #[test]
    fn test_lookup_empty_stack_is_base() {
        let cache = test_cache();
        let (root, c) = chain_abc(&cache);
        let before = root.ref_count();
        let (node, depth) = cache.lookup(&root, &Vec::new()).unwrap();
        assert_eq!(depth, 0);
        assert_eq!(root.ref_count(), before + 1);
        cache.release(node);
        cache.release(c);
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let cache = test_cache();
        let (root, c) = chain_abc(&cache);
        let (stack, _) = compute_hash_stack(root.conv_key(), "\\a\\b\\c").unwrap();
        let (node, depth) = cache.lookup(&root, &stack).unwrap();
        assert_eq!(depth, 3);
        assert!(Arc::ptr_eq(&node, &c));
        cache.release(node);
        cache.release(c);
    }

    #[test]
    fn test_create_node_dedupes() {
        let cache = test_cache();
        let root = cache.attach_root("root", 1, CellId(0)).unwrap();
        let a1 = cache
            .create_node(&root, "Sub", 1, CellId(5), false, false)
            .unwrap();
        let a2 = cache
            .create_node(&root, "sub", 1, CellId(5), false, false)
            .unwrap();
        assert!(Arc::ptr_eq(&a1, &a2));
        assert_eq!(a1.ref_count(), 2);
        cache.release(a1);
        cache.release(a2);
    }

    #[test]
    fn test_fake_node_converted_by_create() {
        let cache = test_cache();
        let root = cache.attach_root("root", 1, CellId(0)).unwrap();
        let fake = cache
            .create_node(&root, "ghost", 1, CellId::NIL, false, true)
            .unwrap();
        assert!(fake.is_fake());
        let real = cache
            .create_node(&root, "GHOST", 1, CellId(9), false, false)
            .unwrap();
        assert!(Arc::ptr_eq(&fake, &real));
        assert!(!real.is_fake());
        assert_eq!(real.cell(), CellId(9));
        cache.release(fake);
        cache.release(real);
    }

    #[test]
    fn test_tombstoned_node_invisible_and_reclaimed() {
        let cache = test_cache();
        let root = cache.attach_root("root", 1, CellId(0)).unwrap();
        let a = cache
            .create_node(&root, "A", 1, CellId(1), false, false)
            .unwrap();
        a.mark_deleted();
        let (stack, _) = compute_hash_stack(root.conv_key(), "\\A").unwrap();
        let (node, depth) = cache.lookup(&root, &stack).unwrap();
        assert_eq!(depth, 0);
        cache.release(node);
        let root_refs = root.ref_count();
        cache.release(a);
        // reclaiming the child dropped its engine reference on the root
        assert_eq!(root.ref_count(), root_refs - 1);
    }

    #[test]
    fn test_delayed_close_overflow_evicts_oldest() {
        let cache = test_cache(); // grace list capacity 2
        let root = cache.attach_root("root", 1, CellId(0)).unwrap();
        for (i, name) in ["one", "two", "three"].iter().enumerate() {
            let n = cache
                .create_node(&root, name, 1, CellId(i as u64 + 1), false, false)
                .unwrap();
            cache.release(n);
        }
        assert_eq!(cache.delayed_len(), 2);
        // "one" was evicted; a lookup for it falls back to the base
        let (stack, _) = compute_hash_stack(root.conv_key(), "\\one").unwrap();
        let (node, depth) = cache.lookup(&root, &stack).unwrap();
        assert_eq!(depth, 0);
        cache.release(node);
        // "three" is still parked and rehydrates on hit
        let (stack, _) = compute_hash_stack(root.conv_key(), "\\three").unwrap();
        let (node, depth) = cache.lookup(&root, &stack).unwrap();
        assert_eq!(depth, 1);
        assert_eq!(cache.delayed_len(), 1);
        cache.release(node);
    }

    #[test]
    fn test_probe_absolute_finds_cached_target() {
        let cache = test_cache();
        let (root, c) = chain_abc(&cache);
        let hit = cache.probe_absolute("\\root\\A\\B\\C").unwrap();
        let hit = hit.expect("chained node should be probeable");
        assert!(Arc::ptr_eq(&hit, &c));
        cache.release(hit);
        assert!(cache.probe_absolute("\\root\\A\\Z").unwrap().is_none());
        assert!(cache.probe_absolute("\\other\\A\\B\\C").unwrap().is_none());
        cache.release(c);
    }
}
