//! Collocated-reach conductance consolidation.
//!
//! Cells hosting several reaches keep one hydraulic connection: the widest
//! reach carries the cell's summed conductance through an effective length,
//! the others are kept for bookkeeping with a nominal length and the K floor.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::PostprocConfig;
use crate::network::{Network, Reach, ReachId};

/// Outcome for one shared cell.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CellConsolidation {
    pub node: u32,
    pub dominant: ReachId,
    pub suppressed: Vec<ReachId>,
    pub total_conductance: f64,
    pub effective_length: f64,
}

pub struct ConsolidationResult {
    pub network: Network,
    pub cells: Vec<CellConsolidation>,
}

impl ConsolidationResult {
    pub fn suppressed_count(&self) -> usize {
        self.cells.iter().map(|c| c.suppressed.len()).sum()
    }
}

/// K · width · length / thickness over the geometric length.
fn geometric_conductance(r: &Reach) -> f64 {
    r.sbk * r.width * r.length / r.sbthick
}

/// Shift all conductance in each shared cell onto its dominant reach.
///
/// Dominant = greatest width; equal widths go to the smallest reach id.
/// Every reach gets `conductance` and `effective_length` set; reaches alone
/// in their cell keep their geometric length.
pub fn consolidate_conductance(net: &Network, cfg: &PostprocConfig) -> ConsolidationResult {
    let mut network = net.clone();

    let mut by_cell: BTreeMap<u32, Vec<usize>> = BTreeMap::new();
    for seg in net.segments() {
        for &idx in net.chain(seg.id) {
            by_cell.entry(net.reach_at(idx).node).or_default().push(idx);
        }
    }

    let mut cells = Vec::new();
    for (node, members) in by_cell {
        let total: f64 = members.iter().map(|&i| geometric_conductance(net.reach_at(i))).sum();

        let Some(dom) = members.iter().copied().max_by(|&a, &b| {
            let (ra, rb) = (net.reach_at(a), net.reach_at(b));
            ra.width.total_cmp(&rb.width).then_with(|| rb.id.cmp(&ra.id))
        }) else {
            continue;
        };

        let d = network.reach_at_mut(dom);
        let denom = d.sbk * d.width;
        let effective_length = if denom > 0.0 {
            total * d.sbthick / denom
        } else {
            warn!(node, reach = %d.id, "dominant reach has zero K or width; keeping its length");
            d.length
        };
        d.dominant = true;
        d.effective_length = Some(effective_length);
        d.conductance = Some(d.streambed_conductance());
        let dominant = d.id;

        let mut suppressed = Vec::new();
        for &idx in members.iter().filter(|&&i| i != dom) {
            let r = network.reach_at_mut(idx);
            r.dominant = false;
            r.sbk = cfg.bed_k_min;
            r.effective_length = Some(cfg.nominal_length);
            r.conductance = Some(r.streambed_conductance());
            suppressed.push(r.id);
        }

        if !suppressed.is_empty() {
            debug!(node, dominant = %dominant, suppressed = suppressed.len(), "cell consolidated");
            cells.push(CellConsolidation {
                node,
                dominant,
                suppressed,
                total_conductance: total,
                effective_length,
            });
        }
    }

    let result = ConsolidationResult { network, cells };
    info!(
        shared_cells = result.cells.len(),
        suppressed = result.suppressed_count(),
        "conductance consolidated"
    );
    result
}
