//! Outseg chain resolution, outlet assignment and cycle detection.
//!
//! Every segment's downstream path is followed hop by hop with a
//! visited-position map, so a revisit is a cycle and a path longer than the
//! hop ceiling is reported as probable circular routing. Paths already
//! resolved are reused as suffixes, which keeps the walk linear in the
//! size of the routing map.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::PostprocConfig;
use crate::error::{Result, SfrError};
use crate::network::Network;

/// Offending sequences found while resolving routing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CircularRoutingReport {
    /// Closed outseg cycles, one per distinct set of segments, rotated to
    /// start at the smallest id and listed in routing order.
    pub cycles: Vec<Vec<u32>>,
    /// Acyclic paths that exceeded the hop ceiling: (start segment, path walked).
    pub overlong: Vec<(u32, Vec<u32>)>,
}

impl CircularRoutingReport {
    pub fn len(&self) -> usize {
        self.cycles.len() + self.overlong.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Downstream sequence of every segment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoutingMap {
    /// Segment → outsegs at hop 1, 2, …, ending with the terminal code.
    paths: BTreeMap<u32, Vec<u32>>,
    outlets: BTreeMap<u32, u32>,
}

impl RoutingMap {
    pub fn path(&self, segment: u32) -> Option<&[u32]> {
        self.paths.get(&segment).map(Vec::as_slice)
    }

    pub fn outlet(&self, segment: u32) -> Option<u32> {
        self.outlets.get(&segment).copied()
    }

    pub fn outlets(&self) -> &BTreeMap<u32, u32> {
        &self.outlets
    }

    pub fn max_depth(&self) -> usize {
        self.paths.values().map(Vec::len).max().unwrap_or(0)
    }
}

/// Resolve a bare segment → outseg mapping.
///
/// Outsegs that name no key of `outsegs` are treated as terminal.
pub fn resolve_outsegs(outsegs: &BTreeMap<u32, u32>, cfg: &PostprocConfig) -> Result<RoutingMap> {
    let max_levels = cfg.max_routing_levels;
    let terminal = |s: u32| cfg.is_terminal(s) || !outsegs.contains_key(&s);

    let mut paths: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
    let mut failed: HashSet<u32> = HashSet::new();
    let mut report = CircularRoutingReport::default();
    let mut seen_cycles: BTreeSet<Vec<u32>> = BTreeSet::new();

    for &start in outsegs.keys() {
        if paths.contains_key(&start) || failed.contains(&start) {
            continue;
        }

        let mut trail = vec![start];
        let mut position: HashMap<u32, usize> = HashMap::from([(start, 0)]);
        let mut current = start;
        let tail: Option<Vec<u32>> = loop {
            let next = outsegs[&current];
            if terminal(next) {
                break Some(vec![next]);
            }
            if let Some(known) = paths.get(&next) {
                let mut t = Vec::with_capacity(known.len() + 1);
                t.push(next);
                t.extend_from_slice(known);
                break Some(t);
            }
            if failed.contains(&next) {
                break None;
            }
            if let Some(&k) = position.get(&next) {
                let cycle = canonical_cycle(&trail[k..]);
                let mut key = cycle.clone();
                key.sort_unstable();
                if seen_cycles.insert(key) {
                    report.cycles.push(cycle);
                }
                break None;
            }
            if trail.len() > max_levels {
                report.overlong.push((start, trail.clone()));
                break None;
            }
            position.insert(next, trail.len());
            trail.push(next);
            current = next;
        };

        match tail {
            Some(tail) if trail.len() - 1 + tail.len() <= max_levels => {
                let mut suffix = tail;
                for &seg in trail.iter().rev() {
                    paths.insert(seg, suffix.clone());
                    suffix.insert(0, seg);
                }
            }
            Some(tail) => {
                let mut walked = trail.clone();
                walked.extend_from_slice(&tail);
                walked.truncate(max_levels + 1);
                report.overlong.push((start, walked));
                failed.extend(trail);
            }
            None => failed.extend(trail),
        }
    }

    if !report.is_empty() {
        return Err(SfrError::CircularRouting { max_levels, report });
    }

    let outlets = paths
        .iter()
        .map(|(&seg, path)| {
            let outlet = path.iter().rev().copied().find(|&s| !terminal(s)).unwrap_or(seg);
            (seg, outlet)
        })
        .collect();
    Ok(RoutingMap { paths, outlets })
}

fn canonical_cycle(seq: &[u32]) -> Vec<u32> {
    let pivot = seq
        .iter()
        .enumerate()
        .min_by_key(|(_, &s)| s)
        .map(|(i, _)| i)
        .unwrap_or(0);
    seq[pivot..].iter().chain(&seq[..pivot]).copied().collect()
}

/// Fail with the routing-cycle error when any outseg path does not terminate.
pub(crate) fn ensure_acyclic(net: &Network, cfg: &PostprocConfig) -> Result<()> {
    let outsegs: BTreeMap<u32, u32> = net.segments().map(|s| (s.id, s.outseg)).collect();
    resolve_outsegs(&outsegs, cfg).map(|_| ())
}

/// Resolved network: outlets written back onto segments and reaches.
pub struct RoutedNetwork {
    pub network: Network,
    pub routing: RoutingMap,
}

/// Resolve routing for every segment and assign `Outlet` ids.
///
/// Fails with [`SfrError::CircularRouting`] carrying the deduplicated
/// cycle report when any path does not terminate.
pub fn resolve_routing(net: &Network, cfg: &PostprocConfig) -> Result<RoutedNetwork> {
    let outsegs: BTreeMap<u32, u32> = net.segments().map(|s| (s.id, s.outseg)).collect();
    let routing = resolve_outsegs(&outsegs, cfg)?;

    let mut network = net.clone();
    for seg in network.segments_mut() {
        seg.outlet = routing.outlet(seg.id);
    }
    network.rebuild();

    let n_outlets = routing.outlets().values().collect::<BTreeSet<_>>().len();
    info!(
        segments = network.segment_count(),
        outlets = n_outlets,
        max_depth = routing.max_depth(),
        "routing resolved"
    );
    Ok(RoutedNetwork { network, routing })
}

/// All segments upstream of `segment` (transitively), in BFS order.
pub fn all_upstream(net: &Network, segment: u32) -> Vec<u32> {
    let mut seen = HashSet::from([segment]);
    let mut out = Vec::new();
    let mut queue: VecDeque<u32> = VecDeque::from([segment]);
    while let Some(s) = queue.pop_front() {
        let Some(seg) = net.segment(s) else { continue };
        for &u in &seg.upsegs {
            if seen.insert(u) {
                out.push(u);
                queue.push_back(u);
            }
        }
    }
    out
}

/// Segments grouped by distance from their outlet: level 0 holds the
/// segments with a terminal outseg, level k+1 their direct upsegs.
pub fn upstream_levels(net: &Network, cfg: &PostprocConfig) -> Vec<Vec<u32>> {
    let mut levels = Vec::new();
    let mut current: Vec<u32> = net
        .segments()
        .filter(|s| cfg.is_terminal(s.outseg))
        .map(|s| s.id)
        .collect();
    let mut seen: HashSet<u32> = current.iter().copied().collect();
    while !current.is_empty() {
        let mut next = Vec::new();
        for &s in &current {
            if let Some(seg) = net.segment(s) {
                next.extend(seg.upsegs.iter().copied().filter(|u| seen.insert(*u)));
            }
        }
        debug!(level = levels.len(), segments = current.len(), "upstream level");
        levels.push(current);
        current = next;
    }
    levels
}
