//! Routing and elevation-consistency engine for streamflow-routing (SFR)
//! networks: outseg resolution, confluence elevation mapping, streambed
//! profile smoothing, collocated conductance consolidation, segment
//! splitting and diagnostics.
pub mod conductance;
pub mod config;
pub mod confluence;
pub mod diagnostics;
pub mod elevations;
pub mod error;
pub mod grid;
pub mod network;
pub mod pipeline;
pub mod renumber;
pub mod routing;
pub mod smoothing;
pub mod tables;
pub mod widths;

mod par;

pub use config::PostprocConfig;
pub use error::{Result, SfrError};
pub use network::{Network, Reach, ReachId, Segment};
pub use pipeline::{run_postproc, PostprocOptions, PostprocResult};
