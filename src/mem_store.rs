use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::path::{fold_name, upcase};
use crate::store::{CellId, ContainerId, HiveStore, NodeView};
use crate::{NsError, NsResult};

struct MemCell {
    name: String,
    parent: Option<u64>,
    /// Uppercased child name -> cell.
    children: HashMap<String, u64>,
    link_target: Option<String>,
}

struct MemContainer {
    trusted: bool,
    trust_class: Option<String>,
    cells: HashMap<u64, MemCell>,
    next_cell: u64,
}

#[derive(Default)]
struct MemStoreInner {
    containers: HashMap<ContainerId, MemContainer>,
}

/// In-memory reference store: a handful of containers of named cells with
/// optional symlink targets and trust attributes. This is what the
/// scenario tests resolve against.
pub struct MemStore {
    inner: Mutex<MemStoreInner>,
    find_calls: AtomicU64,
}

fn upper(name: &str) -> String {
    name.chars().map(upcase).collect()
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemStoreInner::default()),
            find_calls: AtomicU64::new(0),
        }
    }

    /// Create a container with an empty root at cell 0.
    pub fn add_container(&self, id: ContainerId, trusted: bool) -> CellId {
        let mut inner = self.inner.lock().unwrap();
        let mut cells = HashMap::new();
        cells.insert(
            0,
            MemCell {
                name: String::new(),
                parent: None,
                children: HashMap::new(),
                link_target: None,
            },
        );
        inner.containers.insert(
            id,
            MemContainer {
                trusted,
                trust_class: None,
                cells,
                next_cell: 1,
            },
        );
        CellId(0)
    }

    pub fn set_trust_class(&self, id: ContainerId, class: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(c) = inner.containers.get_mut(&id) {
            c.trust_class = Some(class.to_string());
        }
    }

    pub fn add_key(
        &self,
        container: ContainerId,
        parent: CellId,
        name: &str,
    ) -> NsResult<CellId> {
        self.insert_cell(container, parent, name, None)
    }

    pub fn add_symlink(
        &self,
        container: ContainerId,
        parent: CellId,
        name: &str,
        target: &str,
    ) -> NsResult<CellId> {
        self.insert_cell(container, parent, name, Some(target.to_string()))
    }

    fn insert_cell(
        &self,
        container: ContainerId,
        parent: CellId,
        name: &str,
        link_target: Option<String>,
    ) -> NsResult<CellId> {
        let mut inner = self.inner.lock().unwrap();
        let c = inner
            .containers
            .get_mut(&container)
            .ok_or_else(|| NsError::StoreError(format!("no container {}", container)))?;
        let id = c.next_cell;
        let key = upper(name);
        let p = c
            .cells
            .get_mut(&parent.0)
            .ok_or_else(|| NsError::StoreError(format!("parent cell {} not mapped", parent.0)))?;
        if p.children.contains_key(&key) {
            return Err(NsError::AlreadyExists(name.to_string()));
        }
        p.children.insert(key, id);
        c.cells.insert(
            id,
            MemCell {
                name: name.to_string(),
                parent: Some(parent.0),
                children: HashMap::new(),
                link_target,
            },
        );
        c.next_cell += 1;
        Ok(CellId(id))
    }

    /// How many direct-child lookups have hit the store; lets tests prove a
    /// repeat miss was answered from cache.
    pub fn find_call_count(&self) -> u64 {
        self.find_calls.load(Ordering::Relaxed)
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl HiveStore for MemStore {
    fn get_node(&self, container: ContainerId, cell: CellId) -> NsResult<NodeView> {
        let inner = self.inner.lock().unwrap();
        let c = inner
            .containers
            .get(&container)
            .ok_or_else(|| NsError::StoreError(format!("no container {}", container)))?;
        let v = c
            .cells
            .get(&cell.0)
            .ok_or_else(|| NsError::StoreError(format!("cell {} not mapped", cell.0)))?;
        Ok(NodeView {
            name: v.name.clone(),
            is_symlink: v.link_target.is_some(),
            subkey_count: v.children.len() as u32,
        })
    }

    fn find_child_by_name(
        &self,
        container: ContainerId,
        cell: CellId,
        name: &str,
    ) -> NsResult<Option<CellId>> {
        self.find_calls.fetch_add(1, Ordering::Relaxed);
        let inner = self.inner.lock().unwrap();
        let c = inner
            .containers
            .get(&container)
            .ok_or_else(|| NsError::StoreError(format!("no container {}", container)))?;
        let v = c
            .cells
            .get(&cell.0)
            .ok_or_else(|| NsError::StoreError(format!("cell {} not mapped", cell.0)))?;
        Ok(v.children.get(&upper(name)).map(|id| CellId(*id)))
    }

    fn child_hashes(&self, container: ContainerId, cell: CellId) -> NsResult<Vec<u32>> {
        let inner = self.inner.lock().unwrap();
        let c = inner
            .containers
            .get(&container)
            .ok_or_else(|| NsError::StoreError(format!("no container {}", container)))?;
        let v = c
            .cells
            .get(&cell.0)
            .ok_or_else(|| NsError::StoreError(format!("cell {} not mapped", cell.0)))?;
        Ok(v.children.keys().map(|k| fold_name(0, k)).collect())
    }

    fn allocate_cell(
        &self,
        container: ContainerId,
        parent: CellId,
        name: &str,
    ) -> NsResult<CellId> {
        self.insert_cell(container, parent, name, None)
    }

    fn free_cell(&self, container: ContainerId, cell: CellId) -> NsResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let c = inner
            .containers
            .get_mut(&container)
            .ok_or_else(|| NsError::StoreError(format!("no container {}", container)))?;
        let (parent, key) = {
            let v = c
                .cells
                .get(&cell.0)
                .ok_or_else(|| NsError::StoreError(format!("cell {} not mapped", cell.0)))?;
            if !v.children.is_empty() {
                return Err(NsError::InvalidParam(format!(
                    "cell {} still has children",
                    cell.0
                )));
            }
            (v.parent, upper(&v.name))
        };
        if let Some(p) = parent {
            if let Some(pv) = c.cells.get_mut(&p) {
                pv.children.remove(&key);
            }
        }
        c.cells.remove(&cell.0);
        Ok(())
    }

    fn read_link_target(&self, container: ContainerId, cell: CellId) -> NsResult<String> {
        let inner = self.inner.lock().unwrap();
        let c = inner
            .containers
            .get(&container)
            .ok_or_else(|| NsError::StoreError(format!("no container {}", container)))?;
        let v = c
            .cells
            .get(&cell.0)
            .ok_or_else(|| NsError::StoreError(format!("cell {} not mapped", cell.0)))?;
        v.link_target
            .clone()
            .ok_or_else(|| NsError::InvalidParam(format!("cell {} is not a link", cell.0)))
    }

    fn container_trusted(&self, container: ContainerId) -> bool {
        let inner = self.inner.lock().unwrap();
        inner
            .containers
            .get(&container)
            .map(|c| c.trusted)
            .unwrap_or(false)
    }

    fn same_trust_class(&self, a: ContainerId, b: ContainerId) -> bool {
        let inner = self.inner.lock().unwrap();
        let ca = inner.containers.get(&a).and_then(|c| c.trust_class.clone());
        let cb = inner.containers.get(&b).and_then(|c| c.trust_class.clone());
        matches!((ca, cb), (Some(x), Some(y)) if x == y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_find() {
        let store = MemStore::new();
        let root = store.add_container(1, true);
        let a = store.add_key(1, root, "Alpha").unwrap();
        assert_eq!(store.find_child_by_name(1, root, "alpha").unwrap(), Some(a));
        assert_eq!(store.find_child_by_name(1, root, "beta").unwrap(), None);
        let view = store.get_node(1, a).unwrap();
        assert_eq!(view.name, "Alpha");
        assert!(!view.is_symlink);
    }

    #[test]
    fn test_free_cell_rules() {
        let store = MemStore::new();
        let root = store.add_container(1, true);
        let a = store.add_key(1, root, "A").unwrap();
        let b = store.add_key(1, a, "B").unwrap();
        assert!(matches!(
            store.free_cell(1, a),
            Err(NsError::InvalidParam(_))
        ));
        store.free_cell(1, b).unwrap();
        store.free_cell(1, a).unwrap();
        assert_eq!(store.find_child_by_name(1, root, "A").unwrap(), None);
    }

    #[test]
    fn test_child_hashes_match_fold() {
        let store = MemStore::new();
        let root = store.add_container(1, true);
        store.add_key(1, root, "One").unwrap();
        store.add_key(1, root, "Two").unwrap();
        let mut hashes = store.child_hashes(1, root).unwrap();
        hashes.sort_unstable();
        let mut expect = vec![fold_name(0, "ONE"), fold_name(0, "TWO")];
        expect.sort_unstable();
        assert_eq!(hashes, expect);
        // hashes are case-folded, so the original spelling hashes the same
        assert!(hashes.contains(&fold_name(0, "one")));
    }

    #[test]
    fn test_trust_attributes() {
        let store = MemStore::new();
        store.add_container(1, true);
        store.add_container(2, false);
        store.add_container(3, false);
        assert!(store.container_trusted(1));
        assert!(!store.container_trusted(2));
        assert!(!store.same_trust_class(2, 3));
        store.set_trust_class(2, "lab");
        store.set_trust_class(3, "lab");
        assert!(store.same_trust_class(2, 3));
    }
}
