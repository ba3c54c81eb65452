/// SFR post-processing driver: reads reach and segment tables, runs the
/// routing/elevation pipeline and writes the updated tables plus reports.
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use sfr_core::grid::{reset_model_top_to_streambed, ModelGrid};
use sfr_core::tables::{
    cycle_rows, load_network, read_cell_elevations, write_reaches, write_rows_to_path,
    write_run_reports, write_segments,
};
use sfr_core::{run_postproc, PostprocConfig, PostprocOptions, SfrError};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

// ── CLI ──────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "sfr-postproc",
    about = "Resolve routing and make streambed elevations consistent for an SFR network"
)]
struct Args {
    /// Reach table (CSV)
    #[arg(long)]
    reaches: PathBuf,

    /// Segment table (CSV)
    #[arg(long)]
    segments: PathBuf,

    /// Output directory (created if absent)
    #[arg(short, long, default_value = "sfr_out")]
    output: PathBuf,

    /// PostprocConfig JSON; missing fields take their defaults
    #[arg(long)]
    config: Option<PathBuf>,

    /// JSON array of cell-id groups to split segments along
    #[arg(long)]
    split_groups: Option<PathBuf>,

    /// Land-surface elevation per cell (CSV: node,elevation)
    #[arg(long)]
    land_surface: Option<PathBuf>,

    /// Minimum sampled DEM elevation per cell (CSV: node,elevation)
    #[arg(long)]
    dem_minima: Option<PathBuf>,

    /// Model grid JSON; when given the model top is reset to the streambed
    #[arg(long)]
    grid: Option<PathBuf>,

    /// Estimate channel widths from arbolate sums
    #[arg(long)]
    widths: bool,

    /// Leave collocated reach conductances as they are
    #[arg(long)]
    no_consolidate: bool,

    /// Debug-level logging
    #[arg(short, long)]
    verbose: bool,
}

fn setup_logging(verbose: bool) -> Result<()> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("setting default subscriber failed")
}

fn load_config(path: Option<&Path>) -> Result<PostprocConfig> {
    let Some(path) = path else {
        return Ok(PostprocConfig::default());
    };
    let text = fs::read_to_string(path).with_context(|| format!("Cannot read {}", path.display()))?;
    PostprocConfig::from_json_str(&text).with_context(|| format!("parsing {}", path.display()))
}

fn read_lookup(path: &Path) -> Result<std::collections::BTreeMap<u32, f64>> {
    let file = File::open(path).with_context(|| format!("Cannot open {}", path.display()))?;
    read_cell_elevations(file).with_context(|| format!("parsing {}", path.display()))
}

fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(args.verbose)?;

    let cfg = load_config(args.config.as_deref())?;
    fs::create_dir_all(&args.output)
        .with_context(|| format!("Cannot create {}", args.output.display()))?;

    let net = load_network(&args.reaches, &args.segments, &cfg).with_context(|| {
        format!("loading {} and {}", args.reaches.display(), args.segments.display())
    })?;
    info!(
        reaches = net.reach_count(),
        segments = net.segment_count(),
        "tables loaded"
    );

    let split_groups: Vec<Vec<u32>> = match &args.split_groups {
        Some(path) => serde_json::from_str(
            &fs::read_to_string(path).with_context(|| format!("Cannot read {}", path.display()))?,
        )
        .with_context(|| format!("parsing {}", path.display()))?,
        None => Vec::new(),
    };

    let opts = PostprocOptions {
        split_groups,
        land_surface: args.land_surface.as_deref().map(read_lookup).transpose()?,
        dem_minima: args.dem_minima.as_deref().map(read_lookup).transpose()?,
        estimate_widths: args.widths,
        consolidate_conductance: !args.no_consolidate,
    };

    let res = match run_postproc(&net, &opts, &cfg) {
        Ok(res) => res,
        Err(SfrError::CircularRouting { max_levels, report }) => {
            let path = args.output.join("circular_routing.csv");
            write_rows_to_path(&path, &cycle_rows(&report))?;
            bail!(
                "{} circular routing sequence(s) found (hop ceiling {max_levels}); see {}. \
                 Fix the outseg references or raise max_routing_levels.",
                report.len(),
                path.display()
            );
        }
        Err(e) => return Err(e.into()),
    };

    let mut network = res.network.clone();
    if let Some(grid_path) = &args.grid {
        let grid: ModelGrid = serde_json::from_str(
            &fs::read_to_string(grid_path)
                .with_context(|| format!("Cannot read {}", grid_path.display()))?,
        )
        .with_context(|| format!("parsing {}", grid_path.display()))?;
        let reset = reset_model_top_to_streambed(&network, &grid, &cfg)?;
        fs::write(
            args.output.join("grid.json"),
            serde_json::to_string_pretty(&reset.grid)?,
        )?;
        write_rows_to_path(&args.output.join("model_top_adjustments.csv"), &reset.adjustments)?;
        network = reset.network;
    }

    write_reaches(File::create(args.output.join("reaches.csv"))?, &network)?;
    write_segments(File::create(args.output.join("segments.csv"))?, &network)?;
    let reports = write_run_reports(&args.output, &res)?;

    if !res.converged {
        warn!(
            remaining = res.residual_rises.len(),
            "elevation rises remain after confluence mapping"
        );
    }
    if res.diagnostics.passed() {
        info!(output = %args.output.display(), reports = reports.len(), "done");
    } else {
        warn!(
            failed = ?res.diagnostics.failed_checks(),
            output = %args.output.display(),
            "done with diagnostic findings"
        );
    }
    Ok(())
}
