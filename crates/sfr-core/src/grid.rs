//! Layered model grid and the model-top reset to the streambed.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::PostprocConfig;
use crate::elevations::CellElevations;
use crate::error::{Result, SfrError};
use crate::network::{Network, ReachId};

/// Structured grid with a model top and per-layer bottoms, row-major.
/// Cell ids are 1-based: `row * ncol + col + 1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelGrid {
    pub nrow: usize,
    pub ncol: usize,
    pub nlay: usize,
    /// Model top, `nrow * ncol` values.
    pub top: Vec<f64>,
    /// Layer bottoms, layer-major: `nlay * nrow * ncol` values.
    pub botm: Vec<f64>,
}

impl ModelGrid {
    pub fn new(nrow: usize, ncol: usize, nlay: usize, top: Vec<f64>, botm: Vec<f64>) -> Result<Self> {
        let ncell = nrow * ncol;
        if top.len() != ncell {
            return Err(SfrError::InvalidParameter {
                name: "top",
                value: top.len().to_string(),
                reason: format!("expected {ncell} values"),
            });
        }
        if botm.len() != ncell * nlay {
            return Err(SfrError::InvalidParameter {
                name: "botm",
                value: botm.len().to_string(),
                reason: format!("expected {} values", ncell * nlay),
            });
        }
        Ok(Self { nrow, ncol, nlay, top, botm })
    }

    /// Grid with a flat top and evenly spaced layer bottoms.
    pub fn uniform(nrow: usize, ncol: usize, nlay: usize, top: f64, layer_thickness: f64) -> Self {
        let ncell = nrow * ncol;
        let botm = (1..=nlay)
            .flat_map(|k| std::iter::repeat(top - k as f64 * layer_thickness).take(ncell))
            .collect();
        Self {
            nrow,
            ncol,
            nlay,
            top: vec![top; ncell],
            botm,
        }
    }

    #[inline]
    pub fn ncell(&self) -> usize {
        self.nrow * self.ncol
    }

    /// Flat index of a 1-based cell id, if it lies on the grid.
    #[inline]
    pub fn index_of(&self, node: u32) -> Option<usize> {
        let i = (node as usize).checked_sub(1)?;
        (i < self.ncell()).then_some(i)
    }

    #[inline]
    pub fn bottom(&self, layer: usize, idx: usize) -> f64 {
        self.botm[layer * self.ncell() + idx]
    }

    #[inline]
    fn set_bottom(&mut self, layer: usize, idx: usize, val: f64) {
        let n = self.ncell();
        self.botm[layer * n + idx] = val;
    }

    /// Thinnest layer anywhere on the grid.
    pub fn min_thickness(&self) -> f64 {
        (0..self.nlay)
            .flat_map(|k| (0..self.ncell()).map(move |i| (k, i)))
            .map(|(k, i)| {
                let upper = if k == 0 { self.top[i] } else { self.bottom(k - 1, i) };
                upper - self.bottom(k, i)
            })
            .fold(f64::INFINITY, f64::min)
    }
}

impl CellElevations for ModelGrid {
    fn elevation(&self, node: u32) -> Option<f64> {
        self.index_of(node).map(|i| self.top[i])
    }
}

/// A reach whose cell top sat above its streambed before the reset.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopAdjustment {
    pub id: ReachId,
    pub segment: u32,
    pub reach: u32,
    pub node: u32,
    pub model_top: f64,
    pub sbtop: f64,
    pub top_height: f64,
}

pub struct TopResetResult {
    pub network: Network,
    pub grid: ModelGrid,
    /// Sorted by `top_height`, largest first.
    pub adjustments: Vec<TopAdjustment>,
    /// Layer bottoms pushed down to keep the minimum thickness.
    pub bottoms_moved: usize,
}

/// Make the model top equal the lowest streambed top in every stream cell
/// and push layer bottoms down to keep `minimum_layer_thickness`.
///
/// When every streambed is at least as thick as the minimum layer, all
/// thicknesses drop to 0.9 × that minimum so the streambed bottom stays
/// inside layer 1.
pub fn reset_model_top_to_streambed(
    net: &Network,
    grid: &ModelGrid,
    cfg: &PostprocConfig,
) -> Result<TopResetResult> {
    let min_thick = cfg.minimum_layer_thickness;
    let mut network = net.clone();
    let mut grid = grid.clone();

    let thinnest = net.reaches().map(|r| r.sbthick).fold(f64::INFINITY, f64::min);
    if thinnest >= min_thick {
        for r in network.reaches_mut() {
            r.sbthick = 0.9 * min_thick;
        }
    }

    let mut lowest: BTreeMap<usize, f64> = BTreeMap::new();
    let mut adjustments = Vec::new();
    for r in net.reaches() {
        let idx = grid.index_of(r.node).ok_or(SfrError::UnknownCell(r.node))?;
        let low = lowest.entry(idx).or_insert(f64::INFINITY);
        *low = low.min(r.sbtop);

        let model_top = grid.top[idx];
        if model_top > r.sbtop {
            adjustments.push(TopAdjustment {
                id: r.id,
                segment: r.segment,
                reach: r.reach,
                node: r.node,
                model_top,
                sbtop: r.sbtop,
                top_height: model_top - r.sbtop,
            });
        }
    }
    adjustments.sort_by(|a, b| b.top_height.total_cmp(&a.top_height));

    for (&idx, &top) in &lowest {
        grid.top[idx] = top;
    }

    let mut bottoms_moved = 0;
    for k in 0..grid.nlay {
        for i in 0..grid.ncell() {
            let upper = if k == 0 { grid.top[i] } else { grid.bottom(k - 1, i) };
            if grid.bottom(k, i) > upper - min_thick {
                grid.set_bottom(k, i, upper - min_thick);
                bottoms_moved += 1;
            }
        }
    }

    info!(
        stream_cells = lowest.len(),
        lowered = adjustments.len(),
        bottoms_moved,
        "model top reset to streambed"
    );
    Ok(TopResetResult {
        network,
        grid,
        adjustments,
        bottoms_moved,
    })
}
