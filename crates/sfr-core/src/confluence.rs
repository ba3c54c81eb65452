//! Confluence elevations and segment bounding-elevation consistency.
//!
//! Fixed-point iteration, bounded by `confluence_passes`:
//!   1. Each confluence segment's Max drops to the lowest Min among its upsegs.
//!   2. Segments whose Max fell below their Min get Min clamped to Max.
//!   3. The total rise (downstream Max above upstream Min, summed over
//!      non-terminal segments) decides whether another pass is needed.
//!
//! Upstream minimums can depend on confluences further up, so a single pass
//! is not enough for deep networks. An exhausted budget is reported, not fatal.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::PostprocConfig;
use crate::error::Result;
use crate::network::Network;
use crate::routing::ensure_acyclic;

/// A segment with at least one upseg.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Confluence {
    pub segment: u32,
    pub upsegs: Vec<u32>,
    /// Grid cell of the segment's first reach.
    pub node: u32,
    pub elev: f64,
}

/// Downstream segment starting above the end of the segment feeding it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ElevationRise {
    pub segment: u32,
    pub outseg: u32,
    pub min_elev: f64,
    pub downstream_max: f64,
    pub rise: f64,
}

pub struct ConfluenceResult {
    pub network: Network,
    pub confluences: Vec<Confluence>,
    pub passes: u32,
    pub converged: bool,
    /// Sum of the remaining rises after the last pass.
    pub total_rise: f64,
    /// Rises remaining after the last pass.
    pub rises: Vec<ElevationRise>,
    /// Number of Min-above-Max clamps applied across all passes.
    pub crossed: usize,
}

/// Map confluence elevations and make segment Max/Min non-increasing downstream.
///
/// Routing is resolved first; circular routing is fatal here because the
/// elevation passes assume a forest of outseg trees.
pub fn map_confluences(net: &Network, cfg: &PostprocConfig) -> Result<ConfluenceResult> {
    ensure_acyclic(net, cfg)?;
    let outsegs: BTreeMap<u32, u32> = net.segments().map(|s| (s.id, s.outseg)).collect();

    let mut max: BTreeMap<u32, f64> = net.segments().map(|s| (s.id, s.max_elev)).collect();
    let mut min: BTreeMap<u32, f64> = net.segments().map(|s| (s.id, s.min_elev)).collect();
    let confluences: Vec<(u32, Vec<u32>)> = net
        .segments()
        .filter(|s| !s.upsegs.is_empty())
        .map(|s| (s.id, s.upsegs.clone()))
        .collect();

    info!(
        confluences = confluences.len(),
        crossed = count_crossed(&max, &min),
        "mapping confluences"
    );

    let mut passes = 0;
    let mut crossed = 0;
    let mut converged = false;
    let mut rises = Vec::new();
    let mut total_rise = 0.0;

    for pass in 1..=cfg.confluence_passes {
        passes = pass;

        for (seg, ups) in &confluences {
            let up_min = ups.iter().map(|u| min[u]).fold(f64::INFINITY, f64::min);
            if let Some(m) = max.get_mut(seg) {
                *m = m.min(up_min);
            }
        }

        for (seg, &m) in &max {
            if let Some(lo) = min.get_mut(seg) {
                if m < *lo {
                    *lo = m;
                    crossed += 1;
                }
            }
        }

        rises = outsegs
            .iter()
            .filter(|(_, &o)| !cfg.is_terminal(o) && max.contains_key(&o))
            .filter_map(|(&seg, &o)| {
                let rise = max[&o] - min[&seg];
                (rise > 0.0).then(|| ElevationRise {
                    segment: seg,
                    outseg: o,
                    min_elev: min[&seg],
                    downstream_max: max[&o],
                    rise,
                })
            })
            .collect();
        total_rise = rises.iter().map(|r| r.rise).sum();
        debug!(pass, rises = rises.len(), total_rise, "confluence pass");

        if total_rise <= cfg.rise_tolerance {
            converged = true;
            break;
        }
    }

    if converged {
        info!(passes, crossed, "confluence mapping converged");
    } else {
        warn!(
            passes,
            remaining = rises.len(),
            total_rise,
            "confluence mapping did not converge; elevation rises remain"
        );
    }

    let mut network = net.clone();
    for seg in network.segments_mut() {
        seg.max_elev = max[&seg.id];
        seg.min_elev = min[&seg.id];
    }

    let confluences = confluences
        .into_iter()
        .map(|(segment, upsegs)| Confluence {
            node: network.segment_reaches(segment).next().map_or(0, |r| r.node),
            elev: max[&segment],
            segment,
            upsegs,
        })
        .collect();

    Ok(ConfluenceResult {
        network,
        confluences,
        passes,
        converged,
        total_rise,
        rises,
        crossed,
    })
}

fn count_crossed(max: &BTreeMap<u32, f64>, min: &BTreeMap<u32, f64>) -> usize {
    max.iter().filter(|(s, &m)| m < min[*s]).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SfrError;
    use crate::network::{Reach, Segment};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// One reach per segment; `node` = segment id × 10.
    fn network(rows: &[(u32, u32, f64, f64)]) -> Network {
        let reaches = rows.iter().map(|&(s, ..)| Reach::new(s, s, 1, s * 10)).collect();
        let segments = rows
            .iter()
            .map(|&(s, o, mx, mn)| Segment::new(s, o).with_elevations(mx, mn))
            .collect();
        Network::new(reaches, segments, &PostprocConfig::default()).unwrap()
    }

    fn bounds(net: &Network, s: u32) -> (f64, f64) {
        let seg = net.segment(s).unwrap();
        (seg.max_elev, seg.min_elev)
    }

    #[test]
    fn monotonic_chain_is_unchanged() {
        let net = network(&[(1, 2, 100.0, 90.0), (2, 3, 90.0, 70.0), (3, 0, 70.0, 50.0)]);
        let res = map_confluences(&net, &PostprocConfig::default()).unwrap();
        assert!(res.converged);
        assert_eq!(res.passes, 1);
        assert_eq!(bounds(&res.network, 1), (100.0, 90.0));
        assert_eq!(bounds(&res.network, 2), (90.0, 70.0));
        assert_eq!(bounds(&res.network, 3), (70.0, 50.0));
    }

    #[test]
    fn confluence_takes_lowest_upstream_minimum() {
        let net = network(&[(1, 3, 60.0, 40.0), (2, 3, 55.0, 35.0), (3, 0, 50.0, 20.0)]);
        let res = map_confluences(&net, &PostprocConfig::default()).unwrap();
        assert_eq!(bounds(&res.network, 3), (35.0, 20.0));
        assert_eq!(res.confluences.len(), 1);
        let c = &res.confluences[0];
        assert_eq!((c.segment, c.node, c.elev), (3, 30, 35.0));
        assert_eq!(c.upsegs, vec![1, 2]);
    }

    #[test]
    fn crossed_segment_min_is_clamped_and_propagates() {
        // Segment 2's Max drops to 40 (below its Min of 45), so its Min
        // is clamped to 40, which then pulls segment 3's Max down too.
        let net = network(&[(1, 2, 60.0, 40.0), (2, 3, 50.0, 45.0), (3, 0, 44.0, 10.0)]);
        let res = map_confluences(&net, &PostprocConfig::default()).unwrap();
        assert!(res.converged);
        assert_eq!(bounds(&res.network, 2), (40.0, 40.0));
        assert_eq!(bounds(&res.network, 3), (40.0, 10.0));
        assert!(res.crossed >= 1);
        assert!(res.passes >= 2);
    }

    #[test]
    fn exhausted_budget_is_reported_not_fatal() {
        let cfg = PostprocConfig {
            confluence_passes: 1,
            ..Default::default()
        };
        let net = network(&[(1, 2, 60.0, 40.0), (2, 3, 50.0, 45.0), (3, 0, 44.0, 10.0)]);
        let res = map_confluences(&net, &cfg).unwrap();
        assert!(!res.converged);
        assert_eq!(res.passes, 1);
        assert!(res.total_rise > 0.0);
        assert_eq!(res.rises[0].segment, 2);
    }

    #[test]
    fn circular_routing_blocks_mapping() {
        let reaches = vec![Reach::new(1, 1, 1, 1), Reach::new(2, 2, 1, 2)];
        let segments = vec![
            Segment::new(1, 2).with_elevations(5.0, 4.0),
            Segment::new(2, 1).with_elevations(4.0, 3.0),
        ];
        let net = Network::new(reaches, segments, &PostprocConfig::default()).unwrap();
        let err = map_confluences(&net, &PostprocConfig::default()).err().unwrap();
        assert!(matches!(err, SfrError::CircularRouting { .. }));
    }

    #[test]
    fn random_trees_satisfy_bounds_after_mapping() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let n = rng.gen_range(2..40u32);
            let rows: Vec<(u32, u32, f64, f64)> = (1..=n)
                .map(|s| {
                    // Route to a higher id so the forest is acyclic.
                    let o = if s == n || rng.gen_bool(0.1) { 0 } else { rng.gen_range(s + 1..=n) };
                    let mx: f64 = rng.gen_range(0.0..100.0);
                    let mn = mx - rng.gen_range(0.0..20.0);
                    (s, o, mx, mn)
                })
                .collect();
            let net = network(&rows);
            let cfg = PostprocConfig {
                confluence_passes: 200,
                ..Default::default()
            };
            let res = map_confluences(&net, &cfg).unwrap();
            assert!(res.converged);
            for seg in res.network.segments() {
                assert!(seg.min_elev <= seg.max_elev, "segment {} crossed", seg.id);
                for u in &seg.upsegs {
                    let up = res.network.segment(*u).unwrap();
                    assert!(seg.max_elev <= up.min_elev, "segment {} above upseg {u}", seg.id);
                }
            }
        }
    }
}
