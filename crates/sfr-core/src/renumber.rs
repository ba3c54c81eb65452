//! Segment splitting and renumbering along external cell groups.
//!
//! Each cell group (typically the cells under one waterbody polygon) cuts
//! every segment it touches into maximal runs of reaches that are all inside
//! or all outside the group. The run holding the segment's first reach keeps
//! the original id, the remaining runs get fresh ids after the current
//! maximum in along-flow order, and reach ordinals restart at 1 per run.
//!
//! Routing is re-derived at the end from a downstream-reach index keyed by
//! the stable `ReachId`, so it survives any amount of renumbering.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::PostprocConfig;
use crate::error::{Result, SfrError};
use crate::network::{Network, ReachId, Segment};
use crate::routing::resolve_outsegs;

/// Where flow goes after leaving a reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Downstream {
    Reach(ReachId),
    /// Leaves the network; carries the terminal outseg code (0 or the sentinel).
    Outlet(u32),
}

/// Immediate downstream reach of every reach: the next reach of the same
/// segment, else reach 1 of the outseg.
pub fn index_downstream_reaches(net: &Network, cfg: &PostprocConfig) -> BTreeMap<ReachId, Downstream> {
    let mut index = BTreeMap::new();
    for seg in net.segments() {
        let ids: Vec<ReachId> = net.segment_reaches(seg.id).map(|r| r.id).collect();
        let exit = if cfg.is_terminal(seg.outseg) {
            Downstream::Outlet(seg.outseg)
        } else {
            net.segment_reaches(seg.outseg)
                .next()
                .map_or(Downstream::Outlet(0), |r| Downstream::Reach(r.id))
        };
        for (k, &id) in ids.iter().enumerate() {
            let down = ids.get(k + 1).map_or(exit, |&next| Downstream::Reach(next));
            index.insert(id, down);
        }
    }
    index
}

/// One original segment cut by one cell group.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SegmentSplit {
    pub group: usize,
    pub original: u32,
    /// Ids of the resulting runs in along-flow order; the first is `original`.
    pub segments: Vec<u32>,
}

pub struct SplitResult {
    pub network: Network,
    pub splits: Vec<SegmentSplit>,
    /// Groups that were empty or matched no reach.
    pub skipped_groups: Vec<usize>,
}

/// Split segments along `groups` of cell ids and re-derive routing.
///
/// Split pieces inherit the attributes of the segment they came from; their
/// Max/Min are reseeded from their own reaches, so elevation mapping should
/// run afterwards. Outlets are reassigned when the resulting routing
/// resolves; cycles elsewhere in the network are logged, not fatal.
///
/// A group must cover at most one unbroken stretch of each segment it
/// touches; anything else is a `PartitionInconsistency` for that group.
pub fn split_segments(net: &Network, groups: &[Vec<u32>], cfg: &PostprocConfig) -> Result<SplitResult> {
    let downstream = index_downstream_reaches(net, cfg);
    let mut network = net.clone();
    let mut next_id = network.max_segment_id() + 1;
    let mut splits = Vec::new();
    let mut skipped_groups = Vec::new();

    for (g, cells) in groups.iter().enumerate() {
        let cells: HashSet<u32> = cells.iter().copied().collect();
        let touched: BTreeSet<u32> = network
            .reaches()
            .filter(|r| cells.contains(&r.node))
            .map(|r| r.segment)
            .collect();
        if touched.is_empty() {
            if !cells.is_empty() {
                warn!(group = g, cells = cells.len(), "cell group matches no reach");
            }
            skipped_groups.push(g);
            continue;
        }

        for seg in touched {
            let Some(template) = network.segment(seg).cloned() else {
                continue;
            };
            let chain = network.chain(seg).to_vec();
            let inside = |idx: usize| cells.contains(&network.reach_at(idx).node);
            let runs = side_runs(&chain, inside);
            let inside_runs = runs.iter().filter(|run| inside(run[0])).count();
            if inside_runs > 1 {
                return Err(SfrError::PartitionInconsistency {
                    group: g,
                    reason: format!(
                        "cells of the group cover {inside_runs} separate stretches of segment {seg}"
                    ),
                });
            }
            if runs.len() < 2 {
                continue;
            }

            let mut ids = vec![seg];
            for _ in 1..runs.len() {
                ids.push(next_id);
                next_id += 1;
            }
            for (run, &id) in runs.iter().zip(&ids) {
                for (k, &idx) in run.iter().enumerate() {
                    let r = network.reach_at_mut(idx);
                    r.segment = id;
                    r.reach = k as u32 + 1;
                }
                if id != seg {
                    network.insert_segment(Segment {
                        id,
                        upsegs: Vec::new(),
                        ..template.clone()
                    });
                }
            }
            network.rebuild();

            debug!(group = g, segment = seg, pieces = ids.len(), "segment split");
            splits.push(SegmentSplit {
                group: g,
                original: seg,
                segments: ids,
            });
        }
        reroute(&mut network, &downstream, g)?;
    }

    for s in &splits {
        for &id in &s.segments {
            network.seed_segment(id);
        }
    }
    assign_outlets(&mut network, cfg)?;

    info!(
        groups = groups.len(),
        split_segments = splits.len(),
        new_segments = splits.iter().map(|s| s.segments.len() - 1).sum::<usize>(),
        segments = network.segment_count(),
        "segments renumbered"
    );
    Ok(SplitResult {
        network,
        splits,
        skipped_groups,
    })
}

/// Maximal runs of consecutive arena positions on the same side of a group.
fn side_runs(chain: &[usize], inside: impl Fn(usize) -> bool) -> Vec<Vec<usize>> {
    let mut runs: Vec<Vec<usize>> = Vec::new();
    let mut last_side = None;
    for &idx in chain {
        let side = inside(idx);
        match runs.last_mut() {
            Some(run) if last_side == Some(side) => run.push(idx),
            _ => runs.push(vec![idx]),
        }
        last_side = Some(side);
    }
    runs
}

/// Every outseg from the owner of its last reach's downstream reach.
fn reroute(network: &mut Network, downstream: &BTreeMap<ReachId, Downstream>, group: usize) -> Result<()> {
    let owner: HashMap<ReachId, u32> = network.reaches().map(|r| (r.id, r.segment)).collect();
    let mut outsegs = Vec::with_capacity(network.segment_count());
    for seg in network.segments() {
        let Some(last) = network.segment_reaches(seg.id).last() else {
            continue;
        };
        let outseg = match downstream.get(&last.id) {
            Some(Downstream::Reach(down)) => owner.get(down).copied().ok_or_else(|| {
                SfrError::PartitionInconsistency {
                    group,
                    reason: format!("reach {down} downstream of segment {} has no owner", seg.id),
                }
            })?,
            Some(Downstream::Outlet(code)) => *code,
            None => seg.outseg,
        };
        if outseg == seg.id {
            return Err(SfrError::PartitionInconsistency {
                group,
                reason: format!("segment {} would route into itself", seg.id),
            });
        }
        outsegs.push((seg.id, outseg));
    }
    for (id, outseg) in outsegs {
        if let Some(s) = network.segment_mut(id) {
            s.outseg = outseg;
        }
    }
    network.rebuild();
    Ok(())
}

fn assign_outlets(network: &mut Network, cfg: &PostprocConfig) -> Result<()> {
    let outsegs: BTreeMap<u32, u32> = network.segments().map(|s| (s.id, s.outseg)).collect();
    match resolve_outsegs(&outsegs, cfg) {
        Ok(routing) => {
            for seg in network.segments_mut() {
                seg.outlet = routing.outlet(seg.id);
            }
        }
        Err(e) if e.is_routing_cycle() => {
            warn!(error = %e, "routing unresolved after split; outlets cleared");
            for seg in network.segments_mut() {
                seg.outlet = None;
            }
        }
        Err(e) => return Err(e),
    }
    network.rebuild();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::Reach;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn cfg() -> PostprocConfig {
        PostprocConfig::default()
    }

    /// Segment 3 → 4 → 5 → out; segment 4 has six reaches in cells 401..=406.
    fn scenario() -> Network {
        let mut reaches = vec![Reach::new(30, 3, 1, 300), Reach::new(50, 5, 1, 500)];
        reaches.extend((1..=6).map(|k| Reach::new(40 + k, 4, k, 400 + k)));
        let segments = vec![Segment::new(3, 4), Segment::new(4, 5), Segment::new(5, 0)];
        Network::new(reaches, segments, &cfg()).unwrap()
    }

    fn members(net: &Network, seg: u32) -> Vec<(u32, u32)> {
        net.segment_reaches(seg).map(|r| (r.id.0, r.reach)).collect()
    }

    /// Reach at which flow starting from `id` leaves the network.
    fn terminal_reach(net: &Network, id: ReachId) -> ReachId {
        let index = index_downstream_reaches(net, &cfg());
        let mut current = id;
        while let Some(Downstream::Reach(next)) = index.get(&current) {
            current = *next;
        }
        current
    }

    #[test]
    fn downstream_index_crosses_segments_and_keeps_terminal_code() {
        let reaches = vec![
            Reach::new(1, 1, 1, 1),
            Reach::new(2, 1, 2, 2),
            Reach::new(3, 2, 1, 3),
        ];
        let segments = vec![Segment::new(1, 2), Segment::new(2, 999_999)];
        let net = Network::new(reaches, segments, &cfg()).unwrap();
        let index = index_downstream_reaches(&net, &cfg());
        assert_eq!(index[&ReachId(1)], Downstream::Reach(ReachId(2)));
        assert_eq!(index[&ReachId(2)], Downstream::Reach(ReachId(3)));
        assert_eq!(index[&ReachId(3)], Downstream::Outlet(999_999));
    }

    #[test]
    fn interior_group_splits_segment_in_three() {
        let res = split_segments(&scenario(), &[vec![402, 403]], &cfg()).unwrap();
        let net = &res.network;

        assert_eq!(members(net, 4), vec![(41, 1)]);
        assert_eq!(members(net, 6), vec![(42, 1), (43, 2)]);
        assert_eq!(members(net, 7), vec![(44, 1), (45, 2), (46, 3)]);

        assert_eq!(net.segment(4).unwrap().outseg, 6, "original now feeds the inside piece");
        assert_eq!(net.segment(6).unwrap().outseg, 7);
        assert_eq!(net.segment(7).unwrap().outseg, 5, "last piece takes the original outseg");
        assert_eq!(net.segment(3).unwrap().outseg, 4);
        assert_eq!(net.segment(5).unwrap().upsegs, vec![7]);

        assert_eq!(res.splits.len(), 1);
        assert_eq!(res.splits[0].segments, vec![4, 6, 7]);
        assert!(net.segments().all(|s| s.outlet == Some(5)));
    }

    #[test]
    fn empty_and_unmatched_groups_are_skipped() {
        let before = scenario();
        let res = split_segments(&before, &[vec![], vec![999]], &cfg()).unwrap();
        assert!(res.splits.is_empty());
        assert_eq!(res.skipped_groups, vec![0, 1]);
        assert_eq!(res.network.segment_count(), before.segment_count());
    }

    #[test]
    fn segment_wholly_inside_keeps_its_id() {
        let cells: Vec<u32> = (401..=406).collect();
        let res = split_segments(&scenario(), &[cells], &cfg()).unwrap();
        assert!(res.splits.is_empty());
        assert_eq!(res.network.segment_count(), 3);
        assert_eq!(members(&res.network, 4).len(), 6);
    }

    #[test]
    fn group_spanning_two_segments_splits_each() {
        // Last reach of 4 and the only reach of 5 share the group.
        let res = split_segments(&scenario(), &[vec![406, 500]], &cfg()).unwrap();
        let net = &res.network;
        assert_eq!(res.splits.len(), 1, "segment 5 is wholly inside");
        assert_eq!(members(net, 6), vec![(46, 1)]);
        assert_eq!(net.segment(4).unwrap().outseg, 6);
        assert_eq!(net.segment(6).unwrap().outseg, 5);
    }

    #[test]
    fn group_covering_two_stretches_of_one_segment_is_rejected() {
        let err = split_segments(&scenario(), &[vec![402, 405]], &cfg()).err().unwrap();
        match err {
            SfrError::PartitionInconsistency { group, reason } => {
                assert_eq!(group, 0);
                assert!(reason.contains("segment 4"), "{reason}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn rejection_names_the_offending_group() {
        let groups = [vec![300], vec![999], vec![401, 403, 404]];
        let err = split_segments(&scenario(), &groups, &cfg()).err().unwrap();
        assert!(matches!(err, SfrError::PartitionInconsistency { group: 2, .. }), "{err}");
    }

    #[test]
    fn random_splits_preserve_terminal_reaches_and_numbering() {
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..40 {
            let nseg = rng.gen_range(2..15u32);
            let mut reaches = Vec::new();
            let mut segments = Vec::new();
            let mut next_reach = 1;
            for s in 1..=nseg {
                let outseg = if s == nseg || rng.gen_bool(0.2) { 0 } else { rng.gen_range(s + 1..=nseg) };
                segments.push(Segment::new(s, outseg));
                for k in 1..=rng.gen_range(1..8u32) {
                    reaches.push(Reach::new(next_reach, s, k, next_reach));
                    next_reach += 1;
                }
            }
            let before = Network::new(reaches, segments, &cfg()).unwrap();
            // Each group is one unbroken stretch of some segment's cells.
            let groups: Vec<Vec<u32>> = (0..rng.gen_range(1..4))
                .map(|_| {
                    let seg = rng.gen_range(1..=nseg);
                    let nodes: Vec<u32> = before.segment_reaches(seg).map(|r| r.node).collect();
                    let start = rng.gen_range(0..nodes.len());
                    let end = rng.gen_range(start..=nodes.len());
                    nodes[start..end].to_vec()
                })
                .collect();

            let after = split_segments(&before, &groups, &cfg()).unwrap().network;

            for r in before.reaches() {
                assert_eq!(
                    terminal_reach(&before, r.id),
                    terminal_reach(&after, r.id),
                    "reach {} drains elsewhere after split",
                    r.id
                );
            }
            let ids: Vec<u32> = after.segments().map(|s| s.id).collect();
            assert_eq!(ids, (1..=after.segment_count() as u32).collect::<Vec<_>>());
            for s in after.segments() {
                let ords: Vec<u32> = after.segment_reaches(s.id).map(|r| r.reach).collect();
                assert_eq!(ords, (1..=ords.len() as u32).collect::<Vec<_>>(), "segment {}", s.id);
            }
        }
    }
}
