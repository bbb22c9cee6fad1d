use crate::NsResult;

/// Identifies one backing container ("hive") known to the store.
pub type ContainerId = u32;

/// Opaque locator of one storage cell inside a container. The engine never
/// interprets it beyond the nil sentinel used by negative nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CellId(pub u64);

impl CellId {
    pub const NIL: CellId = CellId(u64::MAX);

    pub fn is_nil(&self) -> bool {
        *self == CellId::NIL
    }
}

/// Metadata the engine needs about a materialized node.
#[derive(Debug, Clone)]
pub struct NodeView {
    pub name: String,
    pub is_symlink: bool,
    pub subkey_count: u32,
}

/// Boundary to the persistent backing store. The engine walks and mutates
/// the namespace exclusively through this trait; cell layout, durability
/// and paging stay on the other side of it.
pub trait HiveStore: Send + Sync {
    fn get_node(&self, container: ContainerId, cell: CellId) -> NsResult<NodeView>;

    /// Case-insensitive direct-child lookup.
    fn find_child_by_name(
        &self,
        container: ContainerId,
        cell: CellId,
        name: &str,
    ) -> NsResult<Option<CellId>>;

    /// Name hashes (`fold_name(0, name)`) of every direct child, used to
    /// build subkey hints after a failed walk.
    fn child_hashes(&self, container: ContainerId, cell: CellId) -> NsResult<Vec<u32>>;

    fn allocate_cell(
        &self,
        container: ContainerId,
        parent: CellId,
        name: &str,
    ) -> NsResult<CellId>;

    fn free_cell(&self, container: ContainerId, cell: CellId) -> NsResult<()>;

    /// Redirection target of a link-flagged node, as stored.
    fn read_link_target(&self, container: ContainerId, cell: CellId) -> NsResult<String>;

    fn container_trusted(&self, container: ContainerId) -> bool;

    /// Whether two untrusted containers are registered as trust-equivalent.
    fn same_trust_class(&self, a: ContainerId, b: ContainerId) -> bool;
}
