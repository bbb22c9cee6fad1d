use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::path::upcase;
use crate::store::{CellId, ContainerId};

/// Reference counts refuse to grow past this instead of wrapping.
pub const REF_COUNT_LIMIT: u32 = u32::MAX >> 1;

/// Cached knowledge about a node's children. At most one positive hint is
/// live at a time; installing any of them clears the invalid marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HintState {
    Unknown,
    /// The node itself is a confirmed-absent ("fake") child.
    NonExistent,
    NoSubkeys,
    /// Name hash of the only child.
    SingleSubkey(u32),
    /// Name hashes of every child.
    SmallSet(Vec<u32>),
}

#[derive(Debug)]
pub(crate) struct HintBlock {
    pub state: HintState,
    /// Set when a structural change under the node may have outdated the
    /// hint; checked before any short-circuit.
    pub invalid: bool,
}

/// Verdict of a hint probe. Hints may only ever confirm absence; anything
/// else falls through to the backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HintOutcome {
    MissConfirmed,
    MayExist,
}

/// One cached, reference-counted namespace node.
///
/// `conv_key` is the rolling hash of the whole path from the namespace
/// root, so equal keys at equal depth are cheap candidates for the same
/// node. The component name is stored pre-uppercased; lookups fold only
/// the probe side.
pub struct CacheNode {
    conv_key: AtomicU32,
    pub total_levels: u32,
    name: Box<str>,
    parent: Option<Weak<CacheNode>>,
    pub container: ContainerId,
    cell: AtomicU64,
    symlink: AtomicBool,
    ref_count: AtomicU32,
    deleted: AtomicBool,
    pub(crate) on_delay_list: AtomicBool,
    pub(crate) hints: Mutex<HintBlock>,
    pub(crate) link_target: Mutex<Option<Arc<CacheNode>>>,
}

impl CacheNode {
    /// Build a node with one strong reference held by the caller. A fake
    /// node starts in `NonExistent` with a nil cell.
    pub(crate) fn new(
        parent: Option<&Arc<CacheNode>>,
        name: &str,
        conv_key: u32,
        total_levels: u32,
        container: ContainerId,
        cell: CellId,
        is_symlink: bool,
        fake: bool,
    ) -> Arc<CacheNode> {
        let upper: String = name.chars().map(upcase).collect();
        Arc::new(CacheNode {
            conv_key: AtomicU32::new(conv_key),
            total_levels,
            name: upper.into_boxed_str(),
            parent: parent.map(Arc::downgrade),
            container,
            cell: AtomicU64::new(cell.0),
            symlink: AtomicBool::new(is_symlink),
            ref_count: AtomicU32::new(1),
            deleted: AtomicBool::new(false),
            on_delay_list: AtomicBool::new(false),
            hints: Mutex::new(HintBlock {
                state: if fake {
                    HintState::NonExistent
                } else {
                    HintState::Unknown
                },
                invalid: false,
            }),
            link_target: Mutex::new(None),
        })
    }

    /// The stored (uppercased) component name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn conv_key(&self) -> u32 {
        self.conv_key.load(Ordering::Acquire)
    }

    pub fn cell(&self) -> CellId {
        CellId(self.cell.load(Ordering::Acquire))
    }

    pub(crate) fn set_cell(&self, cell: CellId) {
        self.cell.store(cell.0, Ordering::Release);
    }

    pub fn is_symlink(&self) -> bool {
        self.symlink.load(Ordering::Acquire)
    }

    pub(crate) fn set_symlink(&self, v: bool) {
        self.symlink.store(v, Ordering::Release);
    }

    pub fn parent(&self) -> Option<Arc<CacheNode>> {
        // a live child pins its parent through an engine reference, so the
        // upgrade only fails for nodes already torn down
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    pub(crate) fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::Release);
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire)
    }

    /// Take one more engine reference. Fails at the saturation limit
    /// instead of wrapping.
    pub(crate) fn try_reference(&self) -> bool {
        self.ref_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                if c >= REF_COUNT_LIMIT {
                    None
                } else {
                    Some(c + 1)
                }
            })
            .is_ok()
    }

    /// Drop one engine reference, returning the remaining count.
    pub(crate) fn dereference(&self) -> u32 {
        let old = self.ref_count.fetch_sub(1, Ordering::AcqRel);
        old.saturating_sub(1)
    }

    /// Case-insensitive comparison against a probe component.
    pub(crate) fn name_matches(&self, probe: &str) -> bool {
        self.name.chars().eq(probe.chars().map(upcase))
    }

    pub fn hint_state(&self) -> HintState {
        self.hints.lock().unwrap().state.clone()
    }

    /// A fake node stands for a confirmed-absent child.
    pub fn is_fake(&self) -> bool {
        matches!(self.hints.lock().unwrap().state, HintState::NonExistent)
    }

    pub(crate) fn set_hint(&self, state: HintState) {
        let mut h = self.hints.lock().unwrap();
        h.state = state;
        h.invalid = false;
    }

    /// Called before any structural change under this node is published.
    pub(crate) fn invalidate_hints(&self) {
        let mut h = self.hints.lock().unwrap();
        if !matches!(h.state, HintState::NonExistent) {
            h.state = HintState::Unknown;
        }
        h.invalid = true;
    }

    /// Convert a fake node into the real thing in place.
    pub(crate) fn make_real(&self, cell: CellId, is_symlink: bool) {
        self.set_cell(cell);
        self.set_symlink(is_symlink);
        let mut h = self.hints.lock().unwrap();
        h.state = HintState::Unknown;
        h.invalid = true;
    }

    /// Probe the subkey hints for a child with the given name hash
    /// (`fold_name(0, name)`).
    pub(crate) fn hint_check(&self, name_hash: u32) -> HintOutcome {
        let h = self.hints.lock().unwrap();
        if h.invalid {
            return HintOutcome::MayExist;
        }
        match &h.state {
            HintState::Unknown | HintState::NonExistent => HintOutcome::MayExist,
            HintState::NoSubkeys => HintOutcome::MissConfirmed,
            HintState::SingleSubkey(k) => {
                if *k == name_hash {
                    HintOutcome::MayExist
                } else {
                    HintOutcome::MissConfirmed
                }
            }
            HintState::SmallSet(set) => {
                if set.contains(&name_hash) {
                    HintOutcome::MayExist
                } else {
                    HintOutcome::MissConfirmed
                }
            }
        }
    }

    /// Swap the cached symlink target, returning the previous holder so
    /// the caller can release its engine reference outside any locks.
    pub(crate) fn set_link_target(&self, target: Option<Arc<CacheNode>>) -> Option<Arc<CacheNode>> {
        let mut slot = self.link_target.lock().unwrap();
        std::mem::replace(&mut *slot, target)
    }

    pub(crate) fn link_target_snapshot(&self) -> Option<Arc<CacheNode>> {
        self.link_target.lock().unwrap().clone()
    }
}

impl std::fmt::Debug for CacheNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheNode")
            .field("name", &self.name)
            .field("conv_key", &self.conv_key())
            .field("total_levels", &self.total_levels)
            .field("container", &self.container)
            .field("cell", &self.cell())
            .field("ref_count", &self.ref_count())
            .field("deleted", &self.is_deleted())
            .finish()
    }
}
