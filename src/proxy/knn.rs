//! Distributed k-nearest-neighbor search.
//!
//! The search is best-effort by construction and keeps a fixed two-phase
//! structure:
//!
//! 1. Ask only the host owning the query key for k candidates.
//! 2a. Fewer than k came back: iterative region expansion. Free one more low
//!     bit of every axis per hop and re-ask the owners of the grown
//!     neighborhood, stopping as soon as k candidates arrive or the region
//!     reaches the whole key space. Bounded by `depth` hops.
//! 2b. Exactly k came back: radius refinement. Take the distance to the k-th
//!     candidate, build a cube of that radius around the query key and ask
//!     the other hosts intersecting it for their k best.
//! 3. Merge everything, re-rank by true distance and truncate to k.
//!
//! Because zones are conservative rectangles, the radius cube and the
//! expansion region can both under-cover the exact candidate set in rare
//! geometries; a true neighbor just outside both tests is missed. That
//! imprecision is part of the contract (callers get today's fast answer) and
//! must not be traded for an exact but slower search.

use std::sync::Arc;

use tracing::{event, Level};

use crate::error::Result;
use crate::mapping::zorder::ZOrderMapping;
use crate::mapping::{zcode, Key, KeyMapping};
use crate::operation::IndexEntry;

use super::IndexProxy;

pub(crate) async fn nearest_neighbors(
    proxy: &IndexProxy,
    mapping: &Arc<ZOrderMapping>,
    key: &[u64],
    k: usize,
) -> Result<Vec<Key>> {
    if k == 0 {
        return Ok(Vec::new());
    }

    let initial_host = mapping.host_for(key)?;
    let candidates = proxy
        .knn_on_hosts(std::slice::from_ref(&initial_host), key, k)
        .await?;

    let candidates = if candidates.len() < k {
        expand_region(proxy, mapping, key, k, candidates).await?
    } else {
        refine_radius(proxy, mapping, key, k, &initial_host, candidates).await?
    };

    let mut ranked = rank(key, candidates);
    ranked.truncate(k);
    Ok(ranked.into_iter().map(|entry| entry.key).collect())
}

/// Widens the queried neighborhood one hop at a time. Each hop frees one more
/// low bit per axis, so after at most `depth` hops the region is the entire
/// key space and the loop terminates even when fewer than k points exist.
async fn expand_region(
    proxy: &IndexProxy,
    mapping: &Arc<ZOrderMapping>,
    key: &[u64],
    k: usize,
    initial: Vec<IndexEntry>,
) -> Result<Vec<IndexEntry>> {
    let depth = mapping.depth();
    let mut candidates = initial;
    let mut hops = 1u32;

    while candidates.len() < k && hops <= depth {
        let region = zcode::neighborhood(key, hops, depth);
        let hosts = mapping.hosts_for(&region.start, &region.end)?;
        event!(
            Level::DEBUG,
            "k-NN expansion hop {} covers {} hosts",
            hops,
            hosts.len()
        );
        candidates = proxy.knn_on_hosts(&hosts, key, k).await?;
        hops += 1;
    }

    Ok(candidates)
}

/// Checks whether any host other than the one already asked could hold a
/// nearer neighbor: every host whose zone intersects the cube spanned by the
/// distance to the current k-th candidate gets asked for its own k best.
///
/// The radius comes from the initial host's answer alone; with conservative
/// zones this can under-cover in some geometries, which is accepted.
async fn refine_radius(
    proxy: &IndexProxy,
    mapping: &Arc<ZOrderMapping>,
    key: &[u64],
    k: usize,
    initial_host: &str,
    candidates: Vec<IndexEntry>,
) -> Result<Vec<IndexEntry>> {
    let ranked = rank(key, candidates);
    let farthest = match ranked.get(k - 1) {
        Some(entry) => entry,
        // a host can answer with duplicates that ranking collapses below k;
        // nothing to refine against in that case
        None => return Ok(ranked),
    };
    let radius = zcode::euclidean_distance(key, &farthest.key);
    let cube = zcode::cube_around(key, radius, mapping.depth());

    let mut hosts = mapping.hosts_for(&cube.start, &cube.end)?;
    hosts.retain(|host| host != initial_host);
    if hosts.is_empty() {
        return Ok(ranked);
    }

    event!(
        Level::DEBUG,
        "k-NN radius {} reaches {} additional hosts",
        radius,
        hosts.len()
    );
    let mut merged = proxy.knn_on_hosts(&hosts, key, k).await?;
    merged.extend(ranked);
    Ok(merged)
}

/// Sorts candidates by true distance to the query key, ascending, with a key
/// order tie-break, and drops duplicate points gathered from several hosts
fn rank(key: &[u64], mut candidates: Vec<IndexEntry>) -> Vec<IndexEntry> {
    candidates.sort_by(|a, b| {
        let da = zcode::euclidean_distance(key, &a.key);
        let db = zcode::euclidean_distance(key, &b.key);
        da.partial_cmp(&db)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.key.cmp(&b.key))
    });
    candidates.dedup_by(|a, b| a.key == b.key);
    candidates
}
