//! Read-only consistency checks over a network.
//!
//! Routing cycles are fatal. Every other finding is collected into the
//! report and processing continues.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::{info, warn};

use crate::config::PostprocConfig;
use crate::confluence::ElevationRise;
use crate::error::Result;
use crate::network::{Network, ReachId};
use crate::routing::{resolve_outsegs, RoutingMap};

// ── Finding types ─────────────────────────────────────────────────────────────

/// Reach ordinals of one segment that are not dense 1..n.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReachNumbering {
    pub segment: u32,
    pub ordinals: Vec<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NumberingReport {
    /// Ids missing from 1..=max segment id.
    pub missing_segments: Vec<u32>,
    pub bad_reaches: Vec<ReachNumbering>,
}

impl NumberingReport {
    pub fn passed(&self) -> bool {
        self.missing_segments.is_empty() && self.bad_reaches.is_empty()
    }
}

/// A shared cell where more than one reach still conducts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollocatedConductance {
    pub node: u32,
    pub reaches: Vec<ReachId>,
    pub conductive: Vec<ReachId>,
}

/// Streambed top above the previous reach of the same segment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ElevationIncrease {
    pub segment: u32,
    pub reach: u32,
    pub elevation: f64,
    pub previous: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CrossedBounds {
    pub segment: u32,
    pub max_elev: f64,
    pub min_elev: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ElevationReport {
    pub increases: Vec<ElevationIncrease>,
    /// Outsegs whose Max sits above the Min of the segment feeding them.
    pub rises: Vec<ElevationRise>,
    pub crossed: Vec<CrossedBounds>,
}

impl ElevationReport {
    pub fn passed(&self) -> bool {
        self.increases.is_empty() && self.rises.is_empty() && self.crossed.is_empty()
    }
}

pub struct DiagnosticsReport {
    pub routing: RoutingMap,
    pub numbering: NumberingReport,
    pub collocated: Vec<CollocatedConductance>,
    pub elevations: ElevationReport,
}

impl DiagnosticsReport {
    pub fn passed(&self) -> bool {
        self.failed_checks().is_empty()
    }

    /// Names of the checks with findings.
    pub fn failed_checks(&self) -> Vec<&'static str> {
        let mut failed = Vec::new();
        if !self.numbering.passed() {
            failed.push("numbering");
        }
        if !self.collocated.is_empty() {
            failed.push("collocated conductance");
        }
        if !self.elevations.passed() {
            failed.push("elevations");
        }
        failed
    }
}

// ── Checks ────────────────────────────────────────────────────────────────────

/// Resolve routing; circular routing is returned as an error.
pub fn check_routing(net: &Network, cfg: &PostprocConfig) -> Result<RoutingMap> {
    let outsegs: BTreeMap<u32, u32> = net.segments().map(|s| (s.id, s.outseg)).collect();
    resolve_outsegs(&outsegs, cfg)
}

pub fn check_numbering(net: &Network) -> NumberingReport {
    let ids: BTreeSet<u32> = net.segments().map(|s| s.id).collect();
    let missing_segments = (1..=net.max_segment_id()).filter(|s| !ids.contains(s)).collect();

    let bad_reaches = net
        .segments()
        .filter_map(|s| {
            let ordinals: Vec<u32> = net.segment_reaches(s.id).map(|r| r.reach).collect();
            let dense = ordinals.iter().zip(1u32..).all(|(&o, k)| o == k);
            (!dense).then_some(ReachNumbering {
                segment: s.id,
                ordinals,
            })
        })
        .collect();

    NumberingReport {
        missing_segments,
        bad_reaches,
    }
}

/// Shared cells where more than one reach has K above the floor and a
/// non-zero wetted area.
pub fn check_overlapping(net: &Network, cfg: &PostprocConfig) -> Vec<CollocatedConductance> {
    net.shared_cells()
        .into_iter()
        .filter_map(|(node, reaches)| {
            let conductive: Vec<ReachId> = reaches
                .iter()
                .copied()
                .filter(|id| {
                    net.reach(*id).is_some_and(|r| {
                        r.sbk > cfg.bed_k_min
                            && r.width > 0.0
                            && r.effective_length.unwrap_or(r.length) > 0.0
                    })
                })
                .collect();
            (conductive.len() > 1).then_some(CollocatedConductance {
                node,
                reaches,
                conductive,
            })
        })
        .collect()
}

/// In-segment streambed increases, rises across segment junctions, and
/// segments with Min above Max.
pub fn check_elevations(net: &Network, cfg: &PostprocConfig) -> ElevationReport {
    let tol = cfg.elevation_tolerance;
    let mut report = ElevationReport::default();

    for seg in net.segments() {
        let reaches: Vec<_> = net.segment_reaches(seg.id).collect();
        for pair in reaches.windows(2) {
            if pair[1].sbtop - pair[0].sbtop > tol {
                report.increases.push(ElevationIncrease {
                    segment: seg.id,
                    reach: pair[1].reach,
                    elevation: pair[1].sbtop,
                    previous: pair[0].sbtop,
                });
            }
        }

        if seg.min_elev > seg.max_elev {
            report.crossed.push(CrossedBounds {
                segment: seg.id,
                max_elev: seg.max_elev,
                min_elev: seg.min_elev,
            });
        }

        if cfg.is_terminal(seg.outseg) {
            continue;
        }
        if let Some(down) = net.segment(seg.outseg) {
            let rise = down.max_elev - seg.min_elev;
            if rise > tol {
                report.rises.push(ElevationRise {
                    segment: seg.id,
                    outseg: down.id,
                    min_elev: seg.min_elev,
                    downstream_max: down.max_elev,
                    rise,
                });
            }
        }
    }
    report
}

/// Run every check. Fails only on circular routing.
pub fn run_diagnostics(net: &Network, cfg: &PostprocConfig) -> Result<DiagnosticsReport> {
    let routing = check_routing(net, cfg)?;
    let report = DiagnosticsReport {
        routing,
        numbering: check_numbering(net),
        collocated: check_overlapping(net, cfg),
        elevations: check_elevations(net, cfg),
    };

    if report.passed() {
        info!(
            segments = net.segment_count(),
            reaches = net.reach_count(),
            "all diagnostics passed"
        );
    } else {
        warn!(
            failed = ?report.failed_checks(),
            missing_segments = report.numbering.missing_segments.len(),
            bad_reach_numbering = report.numbering.bad_reaches.len(),
            collocated = report.collocated.len(),
            elevation_increases = report.elevations.increases.len(),
            segment_rises = report.elevations.rises.len(),
            crossed = report.elevations.crossed.len(),
            "diagnostics found problems"
        );
    }
    Ok(report)
}
