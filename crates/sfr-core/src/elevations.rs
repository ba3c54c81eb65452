//! Per-cell elevation lookups and the segment-bound stages built on them.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use tracing::{debug, info};

use crate::config::PostprocConfig;
use crate::error::{Result, SfrError};
use crate::network::Network;
use crate::routing::{all_upstream, ensure_acyclic, upstream_levels};

/// Elevation keyed by grid cell id.
pub trait CellElevations {
    fn elevation(&self, node: u32) -> Option<f64>;

    fn require(&self, node: u32) -> Result<f64> {
        self.elevation(node).ok_or(SfrError::UnknownCell(node))
    }
}

impl CellElevations for HashMap<u32, f64> {
    fn elevation(&self, node: u32) -> Option<f64> {
        self.get(&node).copied()
    }
}

impl CellElevations for BTreeMap<u32, f64> {
    fn elevation(&self, node: u32) -> Option<f64> {
        self.get(&node).copied()
    }
}

/// Set every reach's land surface, and its streambed top, from `lookup`.
pub fn assign_land_surface(net: &Network, lookup: &impl CellElevations) -> Result<Network> {
    let mut network = net.clone();
    for r in network.reaches_mut() {
        let elev = lookup.require(r.node)?;
        r.landsurface = Some(elev);
        r.sbtop = elev;
    }
    info!(reaches = network.reach_count(), "land surface assigned");
    Ok(network)
}

/// Reseed every segment's Max/Min from its reach elevations: land surface
/// when each reach has a sample, streambed top otherwise.
pub fn seed_segment_elevations(net: &Network) -> Network {
    let mut network = net.clone();
    let ids: Vec<u32> = network.segments().map(|s| s.id).collect();
    for id in ids {
        network.seed_segment(id);
    }
    network
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EndAdjustment {
    pub segment: u32,
    pub old_max: f64,
    pub old_min: f64,
    pub max_elev: f64,
    pub min_elev: f64,
}

pub struct EndResetResult {
    pub network: Network,
    pub adjustments: Vec<EndAdjustment>,
}

/// Lower segment end elevations to DEM minima sampled anywhere upstream.
///
/// Walks outward from the outlets one upstream level at a time. A segment's
/// Min drops to the lowest DEM sample over itself and everything upstream
/// (capped by its outseg's Max) when that is lower than every current Min
/// upstream. Its outseg's Max is then brought down to match. Headwater Max
/// is also capped by the DEM at reach 1.
pub fn reset_segment_ends_from_dem(
    net: &Network,
    dem: &impl CellElevations,
    cfg: &PostprocConfig,
) -> Result<EndResetResult> {
    ensure_acyclic(net, cfg)?;

    let mut dem_min: BTreeMap<u32, f64> = BTreeMap::new();
    let mut dem_reach1: BTreeMap<u32, f64> = BTreeMap::new();
    for seg in net.segments() {
        let mut lo = f64::INFINITY;
        for (k, r) in net.segment_reaches(seg.id).enumerate() {
            let e = dem.require(r.node)?;
            if k == 0 {
                dem_reach1.insert(seg.id, e);
            }
            lo = lo.min(e);
        }
        dem_min.insert(seg.id, lo);
    }

    let mut max: BTreeMap<u32, f64> = net.segments().map(|s| (s.id, s.max_elev)).collect();
    let mut min: BTreeMap<u32, f64> = net.segments().map(|s| (s.id, s.min_elev)).collect();

    for (level, segs) in upstream_levels(net, cfg).into_iter().enumerate() {
        for seg in segs {
            let Some(s) = net.segment(seg) else { continue };
            let mut basin = all_upstream(net, seg);
            let headwater = basin.is_empty();
            basin.push(seg);

            let old_min = basin.iter().map(|u| min[u]).fold(f64::INFINITY, f64::min);
            let mut s_min = basin.iter().map(|u| dem_min[u]).fold(f64::INFINITY, f64::min);
            let outseg_max = (!cfg.is_terminal(s.outseg)).then(|| max[&s.outseg]);
            if let Some(om) = outseg_max {
                s_min = s_min.min(om);
            }

            if s_min < old_min {
                min.insert(seg, s_min);
            }
            if let Some(om) = outseg_max {
                max.insert(s.outseg, s_min.min(old_min).min(om));
            }
            if headwater {
                let capped = max[&seg].min(dem_reach1[&seg]);
                max.insert(seg, capped);
            }
        }
        debug!(level, "segment ends reset for level");
    }

    let mut network = net.clone();
    let mut adjustments = Vec::new();
    for seg in network.segments_mut() {
        let (new_max, new_min) = (max[&seg.id], min[&seg.id]);
        if new_max != seg.max_elev || new_min != seg.min_elev {
            adjustments.push(EndAdjustment {
                segment: seg.id,
                old_max: seg.max_elev,
                old_min: seg.min_elev,
                max_elev: new_max,
                min_elev: new_min,
            });
            seg.max_elev = new_max;
            seg.min_elev = new_min;
        }
    }

    info!(adjusted = adjustments.len(), "segment ends reset from DEM");
    Ok(EndResetResult {
        network,
        adjustments,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{Reach, Segment};

    fn cfg() -> PostprocConfig {
        PostprocConfig::default()
    }

    #[test]
    fn land_surface_overwrites_streambed_and_seeds_bounds() {
        let reaches = vec![Reach::new(1, 1, 1, 10), Reach::new(2, 1, 2, 11)];
        let net = Network::new(reaches, vec![Segment::new(1, 0)], &cfg()).unwrap();
        let lookup: HashMap<u32, f64> = HashMap::from([(10, 12.0), (11, 8.0)]);

        let net = seed_segment_elevations(&assign_land_surface(&net, &lookup).unwrap());
        let sb: Vec<f64> = net.segment_reaches(1).map(|r| r.sbtop).collect();
        assert_eq!(sb, vec![12.0, 8.0]);
        let s = net.segment(1).unwrap();
        assert_eq!((s.max_elev, s.min_elev), (12.0, 8.0));
    }

    #[test]
    fn missing_cell_is_an_error() {
        let net = Network::new(vec![Reach::new(1, 1, 1, 3)], vec![Segment::new(1, 0)], &cfg()).unwrap();
        let lookup: HashMap<u32, f64> = HashMap::new();
        assert!(matches!(
            assign_land_surface(&net, &lookup),
            Err(SfrError::UnknownCell(3))
        ));
    }

    #[test]
    fn low_dem_upstream_lowers_ends_downstream() {
        // 1 → 2 → out. The DEM under segment 1 dips to 40, below both Mins.
        let reaches = vec![
            Reach::new(1, 1, 1, 1),
            Reach::new(2, 1, 2, 2),
            Reach::new(3, 2, 1, 3),
        ];
        let segments = vec![
            Segment::new(1, 2).with_elevations(60.0, 50.0),
            Segment::new(2, 0).with_elevations(50.0, 45.0),
        ];
        let net = Network::new(reaches, segments, &cfg()).unwrap();
        let dem: BTreeMap<u32, f64> = BTreeMap::from([(1, 58.0), (2, 40.0), (3, 44.0)]);

        let res = reset_segment_ends_from_dem(&net, &dem, &cfg()).unwrap();
        let s1 = res.network.segment(1).unwrap();
        let s2 = res.network.segment(2).unwrap();
        assert_eq!(s2.min_elev, 40.0);
        assert_eq!(s2.max_elev, 40.0);
        assert_eq!(s1.min_elev, 40.0);
        assert_eq!(s1.max_elev, 58.0, "headwater Max capped by DEM at reach 1");
        assert!(s1.min_elev <= s1.max_elev && s2.max_elev <= s1.min_elev);
        assert_eq!(res.adjustments.len(), 2);
    }
}
