use std::sync::Arc;

use crate::cache::NamespaceCache;
use crate::node::CacheNode;
use crate::path::SEPARATOR;
use crate::resolve::Resolution;
use crate::store::{ContainerId, HiveStore};
use crate::{NsError, NsResult};

/// Trust rule for following a link out of `origin` into `dest`: a trusted
/// origin may go anywhere, any container may link within itself, nothing
/// untrusted may reach a trusted container, and two untrusted containers
/// must be registered trust-equivalent.
pub(crate) fn ok_to_follow_link(
    store: &dyn HiveStore,
    origin: ContainerId,
    dest: ContainerId,
) -> NsResult<()> {
    if origin == dest || store.container_trusted(origin) {
        return Ok(());
    }
    if store.container_trusted(dest) {
        warn!(
            "link from untrusted container {} into trusted container {} refused",
            origin, dest
        );
        return Err(NsError::AccessDenied(format!(
            "link crosses into trusted container {}",
            dest
        )));
    }
    if store.same_trust_class(origin, dest) {
        Ok(())
    } else {
        warn!(
            "untrusted containers {} and {} are not trust-equivalent",
            origin, dest
        );
        Err(NsError::AccessDenied(format!(
            "containers {} and {} are not trust-equivalent",
            origin, dest
        )))
    }
}

/// Turn a link node into a reparse outcome: read the stored target, check
/// trust against any already-materialized target node, and hand back the
/// substituted path for the caller to restart with.
pub(crate) fn resolve_link(
    cache: &NamespaceCache,
    store: &dyn HiveStore,
    origin: ContainerId,
    link: &Arc<CacheNode>,
    remaining: &str,
) -> NsResult<Resolution> {
    let target = store.read_link_target(link.container, link.cell())?;
    if !target.starts_with(SEPARATOR) {
        return Err(NsError::NotFound(format!(
            "link target {:?} is not absolute",
            target
        )));
    }

    // cached resolved target, dropped if it went stale
    let target_node = match link.link_target_snapshot() {
        Some(t) if !t.is_deleted() => Some(t),
        Some(_) => {
            if let Some(old) = link.set_link_target(None) {
                cache.release(old);
            }
            None
        }
        None => None,
    };
    let target_node = match target_node {
        Some(t) => Some(t),
        None => match cache.probe_absolute(&target)? {
            Some(t) => {
                let keep = t.clone();
                // the slot takes over the engine reference probe_absolute took
                cache.cache_link_target(link, t);
                Some(keep)
            }
            None => None,
        },
    };
    if let Some(t) = &target_node {
        ok_to_follow_link(store, origin, t.container)?;
    }

    let mut path = target;
    let rem = remaining.trim_start_matches(SEPARATOR);
    if !rem.is_empty() {
        if !path.ends_with(SEPARATOR) {
            path.push(SEPARATOR);
        }
        path.push_str(rem);
    }
    debug!("link {} reparses to {}", link.name(), path);
    Ok(Resolution::Reparse { path, origin })
}
