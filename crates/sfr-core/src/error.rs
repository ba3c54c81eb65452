//! Error types for the routing and elevation engine.
//!
//! Only structural problems are errors. Clamped slopes, unconverged
//! confluence mapping and diagnostic findings are carried in the result
//! structs of each stage instead.

use thiserror::Error;

use crate::routing::CircularRoutingReport;

#[derive(Error, Debug)]
pub enum SfrError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("circular routing in segments {segments:?}: fix outseg references before continuing")]
    SelfRouting { segments: Vec<u32> },

    #[error(
        "{} instances where an outlet was not found after {max_levels} consecutive segments; \
         these may indicate circular routing, or if the network is very large some sequences \
         may be longer than {max_levels} (increase max_routing_levels)",
        .report.len()
    )]
    CircularRouting {
        max_levels: usize,
        report: CircularRoutingReport,
    },

    #[error("segments in the reach table and segment table differ (reach-only: {reach_only:?}, segment-only: {segment_only:?})")]
    SegmentMismatch {
        reach_only: Vec<u32>,
        segment_only: Vec<u32>,
    },

    #[error("segment {segment} routes to unknown segment {outseg}")]
    UnknownOutseg { segment: u32, outseg: u32 },

    #[error("duplicate reach: segment {segment} reach {reach}")]
    DuplicateReach { segment: u32, reach: u32 },

    #[error("duplicate reach identifier {0}")]
    DuplicateReachId(u32),

    #[error("cell group {group} cannot be resolved into contiguous same-segment runs: {reason}")]
    PartitionInconsistency { group: usize, reason: String },

    #[error("no elevation available for cell {0}")]
    UnknownCell(u32),

    #[error("Invalid parameter: {name} = {value} ({reason})")]
    InvalidParameter {
        name: &'static str,
        value: String,
        reason: String,
    },
}

impl SfrError {
    /// Whether the error belongs to the routing-cycle family that blocks
    /// every elevation stage.
    pub fn is_routing_cycle(&self) -> bool {
        matches!(self, SfrError::SelfRouting { .. } | SfrError::CircularRouting { .. })
    }
}

pub type Result<T> = std::result::Result<T, SfrError>;
