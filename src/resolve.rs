use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::cache::NamespaceCache;
use crate::config::EngineConfig;
use crate::node::{CacheNode, HintOutcome};
use crate::path::{
    compute_hash_stack, fold_name, join_components, next_component, HashStack, SEPARATOR,
};
use crate::store::{CellId, ContainerId, HiveStore};
use crate::symlink::{ok_to_follow_link, resolve_link};
use crate::{NsError, NsResult};

/// Successful outcome of a resolution. Failures travel as `NsError`.
#[derive(Debug)]
pub enum Resolution {
    Resolved {
        node: Arc<CacheNode>,
        created: bool,
    },
    /// The path crossed a symbolic link; restart with the substituted path.
    /// `origin` is the container the first link was followed out of.
    Reparse {
        path: String,
        origin: ContainerId,
    },
}

pub struct ResolveRequest<'a> {
    pub base: Arc<CacheNode>,
    pub path: &'a str,
    pub want_create: bool,
    /// Open the link node itself instead of following it.
    pub open_link: bool,
    /// Set on post-reparse resolutions; re-checked against the final node.
    pub origin: Option<ContainerId>,
}

impl<'a> ResolveRequest<'a> {
    pub fn open(base: &Arc<CacheNode>, path: &'a str) -> Self {
        Self {
            base: base.clone(),
            path,
            want_create: false,
            open_link: false,
            origin: None,
        }
    }

    pub fn create(base: &Arc<CacheNode>, path: &'a str) -> Self {
        Self {
            want_create: true,
            ..Self::open(base, path)
        }
    }
}

enum IntentGate<'a> {
    Shared(RwLockReadGuard<'a, ()>),
    Exclusive(RwLockWriteGuard<'a, ()>),
}

/// The resolution driver: hash stack, cache probe, storage walk for the
/// unresolved suffix, link redirection, open/create of the destination.
///
/// Bucket locks nest inside the engine-wide intent gate; opens share the
/// gate, creates and deletes hold it exclusively so no two structural
/// changes interleave under a hash stack being resolved.
pub struct ResolutionEngine<S: HiveStore> {
    store: S,
    cache: NamespaceCache,
    config: EngineConfig,
    intent: RwLock<()>,
    roots: Mutex<Vec<Arc<CacheNode>>>,
}

impl<S: HiveStore> ResolutionEngine<S> {
    pub fn new(store: S, config: EngineConfig) -> Self {
        info!(
            "namespace engine starting with {} buckets, delay list {}",
            config.bucket_count, config.delayed_close_size
        );
        Self {
            cache: NamespaceCache::new(&config),
            store,
            config,
            intent: RwLock::new(()),
            roots: Mutex::new(Vec::new()),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn cache(&self) -> &NamespaceCache {
        &self.cache
    }

    /// Register a container root. The returned reference belongs to the
    /// caller; the engine keeps its own anchor for absolute resolution.
    pub fn attach_root(
        &self,
        name: &str,
        container: ContainerId,
        cell: CellId,
    ) -> NsResult<Arc<CacheNode>> {
        let root = self.cache.attach_root(name, container, cell)?;
        {
            let mut roots = self.roots.lock().unwrap();
            if !roots.iter().any(|r| Arc::ptr_eq(r, &root)) {
                self.cache.reference_existing(&root)?;
                roots.push(root.clone());
            }
        }
        info!("attached namespace root {} (container {})", root.name(), container);
        Ok(root)
    }

    fn find_root(&self, name: &str) -> Option<Arc<CacheNode>> {
        let roots = self.roots.lock().unwrap();
        roots
            .iter()
            .find(|r| !r.is_deleted() && r.name_matches(name))
            .cloned()
    }

    /// Resolve `path` relative to the base node. On `Resolved` the caller
    /// owns one reference on the node and must `release` it.
    pub fn resolve(&self, req: &ResolveRequest<'_>) -> NsResult<Resolution> {
        let _gate = if req.want_create {
            IntentGate::Exclusive(self.intent.write().unwrap())
        } else {
            IntentGate::Shared(self.intent.read().unwrap())
        };
        self.resolve_locked(req)
    }

    /// Resolve an absolute path against the attached roots. Used both by
    /// callers and by `resolve_follow` to restart after a reparse.
    pub fn resolve_absolute(
        &self,
        path: &str,
        want_create: bool,
        origin: Option<ContainerId>,
        open_link: bool,
    ) -> NsResult<Resolution> {
        let mut rest = path;
        let (first, _) = next_component(&mut rest)?;
        let first =
            first.ok_or_else(|| NsError::InvalidPath("empty absolute path".to_string()))?;
        let base = self
            .find_root(first)
            .ok_or_else(|| NsError::NotFound(format!("no namespace root {}", first)))?;
        self.resolve(&ResolveRequest {
            base,
            path: rest,
            want_create,
            open_link,
            origin,
        })
    }

    /// Drive `resolve` through reparses until a node comes out, bounded by
    /// the configured hop budget.
    pub fn resolve_follow(
        &self,
        base: &Arc<CacheNode>,
        path: &str,
        want_create: bool,
    ) -> NsResult<(Arc<CacheNode>, bool)> {
        let mut out = self.resolve(&ResolveRequest {
            base: base.clone(),
            path,
            want_create,
            open_link: false,
            origin: None,
        })?;
        let mut hops = 0u32;
        loop {
            match out {
                Resolution::Resolved { node, created } => return Ok((node, created)),
                Resolution::Reparse { path, origin } => {
                    hops += 1;
                    if hops > self.config.symlink_hop_budget {
                        return Err(NsError::InvalidPath(format!(
                            "more than {} link redirections",
                            self.config.symlink_hop_budget
                        )));
                    }
                    debug!("reparse -> {}", path);
                    out = self.resolve_absolute(&path, want_create, Some(origin), false)?;
                }
            }
        }
    }

    pub fn release(&self, node: Arc<CacheNode>) {
        self.cache.release(node);
    }

    /// Tombstone a resolved node and free its storage. The caller's
    /// reference stays valid; the node leaves the cache once every
    /// reference is released.
    pub fn delete_node(&self, node: &Arc<CacheNode>) -> NsResult<()> {
        let _gate = self.intent.write().unwrap();
        if node.is_deleted() {
            return Err(NsError::KeyDeleted(format!(
                "{} already deleted",
                node.name()
            )));
        }
        let parent = node.parent().ok_or_else(|| {
            NsError::InvalidParam("cannot delete a namespace root".to_string())
        })?;
        self.store.free_cell(node.container, node.cell())?;
        // hints on the parent go stale before the tombstone is visible
        parent.invalidate_hints();
        node.mark_deleted();
        info!("deleted {}\\{}", parent.name(), node.name());
        Ok(())
    }

    fn resolve_locked(&self, req: &ResolveRequest<'_>) -> NsResult<Resolution> {
        let path = req.path.trim_end_matches(SEPARATOR);
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            if attempts > self.config.retry_budget.max(1) {
                return Err(NsError::InsufficientResources(
                    "resolution retry budget exhausted".to_string(),
                ));
            }
            if req.base.is_deleted() {
                return Err(NsError::KeyDeleted(format!("base {}", req.base.name())));
            }
            let base_key = req.base.conv_key();
            let (stack, _total) = compute_hash_stack(base_key, path)?;
            let (node, depth) = self.cache.lookup(&req.base, &stack)?;
            // a concurrent re-key of the base invalidates the whole stack
            if req.base.conv_key() != base_key {
                self.cache.release(node);
                continue;
            }
            return self.continue_walk(req, node, &stack, depth);
        }
    }

    fn continue_walk(
        &self,
        req: &ResolveRequest<'_>,
        matched: Arc<CacheNode>,
        stack: &HashStack<'_>,
        matched_depth: usize,
    ) -> NsResult<Resolution> {
        let mut cursor = matched;
        let mut depth = matched_depth;

        if depth < stack.len() {
            if cursor.is_fake() {
                // a negative node mid-path answers the whole miss
                let err = NsError::NotFound(format!("{} is cached as absent", cursor.name()));
                self.cache.release(cursor);
                return Err(err);
            }
            if depth > 0 && cursor.is_symlink() {
                let rest = join_components(&stack[depth..]);
                return self.reparse_at(req, cursor, &rest);
            }
        }

        while depth < stack.len() {
            let name = stack[depth].name;
            let is_last = depth + 1 == stack.len();
            if let HintOutcome::MissConfirmed = cursor.hint_check(fold_name(0, name)) {
                return self.handle_miss(req, cursor, name, is_last, false);
            }
            let child_cell =
                match self.store.find_child_by_name(cursor.container, cursor.cell(), name) {
                    Ok(c) => c,
                    Err(e) => {
                        self.cache.release(cursor);
                        return Err(e);
                    }
                };
            let cell = match child_cell {
                Some(c) => c,
                None => return self.handle_miss(req, cursor, name, is_last, true),
            };
            let view = match self.store.get_node(cursor.container, cell) {
                Ok(v) => v,
                Err(e) => {
                    self.cache.release(cursor);
                    return Err(e);
                }
            };
            let child = match self.cache.create_node(
                &cursor,
                name,
                cursor.container,
                cell,
                view.is_symlink,
                false,
            ) {
                Ok(c) => c,
                Err(e) => {
                    self.cache.release(cursor);
                    return Err(e);
                }
            };
            // the walk carries exactly one cursor reference at a time
            self.cache.release(cursor);
            cursor = child;
            depth += 1;
            if cursor.is_symlink() && depth < stack.len() {
                let rest = join_components(&stack[depth..]);
                return self.reparse_at(req, cursor, &rest);
            }
        }

        self.finish_open(req, cursor, stack.last().map(|e| e.name))
    }

    fn handle_miss(
        &self,
        req: &ResolveRequest<'_>,
        parent: Arc<CacheNode>,
        name: &str,
        is_last: bool,
        enrich: bool,
    ) -> NsResult<Resolution> {
        if is_last && req.want_create {
            return self.create_child(req, parent, name);
        }
        if enrich {
            self.cache.enrich_after_miss(&self.store, &parent, name);
        }
        let err = NsError::NotFound(format!("{}\\{}", parent.name(), name));
        self.cache.release(parent);
        Err(err)
    }

    /// Create the one missing final component under `parent`, consuming the
    /// caller's reference on it.
    fn create_child(
        &self,
        req: &ResolveRequest<'_>,
        parent: Arc<CacheNode>,
        name: &str,
    ) -> NsResult<Resolution> {
        if let Some(origin) = req.origin {
            if let Err(e) = ok_to_follow_link(&self.store, origin, parent.container) {
                self.cache.release(parent);
                return Err(e);
            }
        }
        // hints go stale before the new child becomes visible
        parent.invalidate_hints();
        let cell = match self.store.allocate_cell(parent.container, parent.cell(), name) {
            Ok(c) => c,
            Err(e) => {
                self.cache.release(parent);
                return Err(e);
            }
        };
        // converts a chained fake node for this name in place
        let child = match self
            .cache
            .create_node(&parent, name, parent.container, cell, false, false)
        {
            Ok(c) => c,
            Err(e) => {
                self.cache.release(parent);
                return Err(e);
            }
        };
        info!("created {}\\{}", parent.name(), name);
        self.cache.release(parent);
        Ok(Resolution::Resolved {
            node: child,
            created: true,
        })
    }

    fn finish_open(
        &self,
        req: &ResolveRequest<'_>,
        node: Arc<CacheNode>,
        last_name: Option<&str>,
    ) -> NsResult<Resolution> {
        if node.is_deleted() {
            let err = NsError::NotFound(format!("{} deleted during resolution", node.name()));
            self.cache.release(node);
            return Err(err);
        }
        if node.is_fake() {
            if req.want_create {
                let parent = match node.parent() {
                    Some(p) if !p.is_deleted() => p,
                    _ => {
                        let err =
                            NsError::NotFound(format!("{} is cached as absent", node.name()));
                        self.cache.release(node);
                        return Err(err);
                    }
                };
                if let Err(e) = self.cache.reference_existing(&parent) {
                    self.cache.release(node);
                    return Err(e);
                }
                let name = match last_name {
                    Some(n) => n.to_string(),
                    None => node.name().to_string(),
                };
                let out = self.create_child(req, parent, &name);
                self.cache.release(node);
                return out;
            }
            let err = NsError::NotFound(format!("{} is cached as absent", node.name()));
            self.cache.release(node);
            return Err(err);
        }
        if node.is_symlink() && !req.open_link {
            let origin = req.origin.unwrap_or(node.container);
            let out = resolve_link(&self.cache, &self.store, origin, &node, "");
            self.cache.release(node);
            return out;
        }
        if let Some(origin) = req.origin {
            if let Err(e) = ok_to_follow_link(&self.store, origin, node.container) {
                self.cache.release(node);
                return Err(e);
            }
        }
        Ok(Resolution::Resolved {
            node,
            created: false,
        })
    }

    fn reparse_at(
        &self,
        req: &ResolveRequest<'_>,
        link: Arc<CacheNode>,
        remaining: &str,
    ) -> NsResult<Resolution> {
        let origin = req.origin.unwrap_or(link.container);
        let out = resolve_link(&self.cache, &self.store, origin, &link, remaining);
        self.cache.release(link);
        out
    }
}
