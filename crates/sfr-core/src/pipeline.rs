//! Full post-processing pass over a reach/segment network.

use std::collections::BTreeMap;

use tracing::info;

use crate::conductance::{consolidate_conductance, CellConsolidation};
use crate::config::PostprocConfig;
use crate::confluence::{map_confluences, Confluence, ElevationRise};
use crate::diagnostics::{run_diagnostics, DiagnosticsReport};
use crate::elevations::{
    assign_land_surface, reset_segment_ends_from_dem, seed_segment_elevations, EndAdjustment,
};
use crate::error::Result;
use crate::network::Network;
use crate::renumber::{split_segments, SegmentSplit};
use crate::routing::{resolve_routing, RoutingMap};
use crate::smoothing::{smooth_segment_interiors, SmoothingTrace};
use crate::widths::estimate_widths;

/// Optional stages of a run.
#[derive(Debug, Clone)]
pub struct PostprocOptions {
    /// Cell groups to split segments along; empty skips the split.
    pub split_groups: Vec<Vec<u32>>,
    /// Land-surface elevation by cell. Replaces streambed tops and reseeds
    /// segment bounds before routing.
    pub land_surface: Option<BTreeMap<u32, f64>>,
    /// Minimum sampled DEM elevation by cell; lowers segment ends before
    /// confluence mapping.
    pub dem_minima: Option<BTreeMap<u32, f64>>,
    pub estimate_widths: bool,
    pub consolidate_conductance: bool,
}

impl Default for PostprocOptions {
    fn default() -> Self {
        Self {
            split_groups: Vec::new(),
            land_surface: None,
            dem_minima: None,
            estimate_widths: false,
            consolidate_conductance: true,
        }
    }
}

/// Combined result of one post-processing pass.
pub struct PostprocResult {
    pub network: Network,
    pub routing: RoutingMap,
    pub splits: Vec<SegmentSplit>,
    pub skipped_groups: Vec<usize>,
    pub end_adjustments: Vec<EndAdjustment>,
    pub consolidation: Vec<CellConsolidation>,
    pub confluences: Vec<Confluence>,
    pub confluence_passes: u32,
    pub converged: bool,
    /// Rises left by confluence mapping when it ran out of passes.
    pub residual_rises: Vec<ElevationRise>,
    pub trace: Vec<SmoothingTrace>,
    pub inverted_segments: Vec<u32>,
    pub slopes_clamped: usize,
    pub diagnostics: DiagnosticsReport,
}

/// Run every stage over `net`.
///
/// Steps:
/// 1. Segment split along `split_groups` (skipped when empty).
/// 2. Land-surface assignment and segment bound reseeding (when given).
/// 3. Routing resolution and outlet assignment.
/// 4. Segment end reset from DEM minima (when given).
/// 5. Width estimation from arbolate sums (when enabled).
/// 6. Collocated conductance consolidation (when enabled).
/// 7. Confluence elevation mapping.
/// 8. Profile smoothing and slope assignment.
/// 9. Diagnostics on the final network.
///
/// Structural problems and circular routing stop the run. Everything else is
/// reported in the result.
pub fn run_postproc(net: &Network, opts: &PostprocOptions, cfg: &PostprocConfig) -> Result<PostprocResult> {
    cfg.validate()?;

    // Step 1: split.
    let (mut network, splits, skipped_groups) = if opts.split_groups.is_empty() {
        (net.clone(), Vec::new(), Vec::new())
    } else {
        let res = split_segments(net, &opts.split_groups, cfg)?;
        (res.network, res.splits, res.skipped_groups)
    };

    // Step 2: land surface.
    if let Some(lookup) = &opts.land_surface {
        network = seed_segment_elevations(&assign_land_surface(&network, lookup)?);
    }

    // Step 3: routing; a cycle ends the run here.
    let routed = resolve_routing(&network, cfg)?;
    let (mut network, routing) = (routed.network, routed.routing);

    // Step 4: DEM minima.
    let end_adjustments = match &opts.dem_minima {
        Some(dem) => {
            let res = reset_segment_ends_from_dem(&network, dem, cfg)?;
            network = res.network;
            res.adjustments
        }
        None => Vec::new(),
    };

    // Step 5: widths.
    if opts.estimate_widths {
        network = estimate_widths(&network, cfg)?;
    }

    // Step 6: conductance.
    let consolidation = if opts.consolidate_conductance {
        let res = consolidate_conductance(&network, cfg);
        network = res.network;
        res.cells
    } else {
        Vec::new()
    };

    // Step 7: confluences.
    let conf = map_confluences(&network, cfg)?;

    // Step 8: smoothing.
    let smoothed = smooth_segment_interiors(&conf.network, cfg)?;

    // Step 9: diagnostics.
    let diagnostics = run_diagnostics(&smoothed.network, cfg)?;

    info!(
        segments = smoothed.network.segment_count(),
        reaches = smoothed.network.reach_count(),
        splits = splits.len(),
        converged = conf.converged,
        passed = diagnostics.passed(),
        "post-processing complete"
    );

    Ok(PostprocResult {
        network: smoothed.network,
        routing,
        splits,
        skipped_groups,
        end_adjustments,
        consolidation,
        confluences: conf.confluences,
        confluence_passes: conf.passes,
        converged: conf.converged,
        residual_rises: conf.rises,
        trace: smoothed.trace,
        inverted_segments: smoothed.inverted,
        slopes_clamped: smoothed.slopes_clamped,
        diagnostics,
    })
}
