/// SFR diagnostics: check routing, numbering, collocated conductance and
/// streambed elevations of a reach/segment table pair. Exits non-zero when
/// any check fails.
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use sfr_core::diagnostics::run_diagnostics;
use sfr_core::tables::{cycle_rows, load_network, write_diagnostic_reports, write_rows_to_path};
use sfr_core::{PostprocConfig, SfrError};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "sfr-diagnose", about = "Run consistency checks on SFR reach and segment tables")]
struct Args {
    /// Reach table (CSV)
    #[arg(long)]
    reaches: PathBuf,

    /// Segment table (CSV)
    #[arg(long)]
    segments: PathBuf,

    /// Directory for finding tables (created if absent)
    #[arg(short, long, default_value = "sfr_diagnostics")]
    output: PathBuf,

    /// PostprocConfig JSON; missing fields take their defaults
    #[arg(long)]
    config: Option<PathBuf>,

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

fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(args.verbose)?;

    let cfg = load_config(args.config.as_deref())?;
    fs::create_dir_all(&args.output)
        .with_context(|| format!("Cannot create {}", args.output.display()))?;

    let net = load_network(&args.reaches, &args.segments, &cfg).with_context(|| {
        format!("loading {} and {}", args.reaches.display(), args.segments.display())
    })?;

    let report = match run_diagnostics(&net, &cfg) {
        Ok(report) => report,
        Err(SfrError::CircularRouting { max_levels, report }) => {
            let path = args.output.join("circular_routing.csv");
            write_rows_to_path(&path, &cycle_rows(&report))?;
            bail!(
                "{} circular routing sequence(s) found (hop ceiling {max_levels}); see {}",
                report.len(),
                path.display()
            );
        }
        Err(e) => return Err(e.into()),
    };

    let written = write_diagnostic_reports(&args.output, &report)?;
    if !report.passed() {
        bail!(
            "failed checks: {}; findings in {} file(s) under {}",
            report.failed_checks().join(", "),
            written.len(),
            args.output.display()
        );
    }
    info!(
        segments = net.segment_count(),
        routed = report.routing.outlets().len(),
        "all checks passed"
    );
    Ok(())
}
