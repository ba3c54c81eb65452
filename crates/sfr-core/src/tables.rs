//! CSV reach/segment tables and report rows.
//!
//! Column names from older SFR tables are accepted as aliases on read
//! (`iseg`, `rchlen`, `strtop`, `elevMax`, ...). Tables are always written
//! with the canonical names, sorted by (segment, reach).

use std::collections::BTreeMap;
use std::fmt::Display;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use csv::{ReaderBuilder, WriterBuilder};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::PostprocConfig;
use crate::confluence::Confluence;
use crate::conductance::CellConsolidation;
use crate::diagnostics::{CollocatedConductance, DiagnosticsReport, ReachNumbering};
use crate::error::Result;
use crate::network::{Network, Reach, ReachId, Segment};
use crate::pipeline::PostprocResult;
use crate::renumber::SegmentSplit;
use crate::routing::{CircularRoutingReport, RoutingMap};

fn unit() -> f64 {
    1.0
}

fn yes() -> bool {
    true
}

// ── Reach table ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReachRow {
    #[serde(alias = "iseg")]
    pub segment: u32,
    #[serde(alias = "ireach")]
    pub reach: u32,
    #[serde(alias = "cellnum")]
    pub node: u32,
    #[serde(rename = "reachID", alias = "reach_id", default)]
    pub reach_id: Option<u32>,
    #[serde(alias = "length_in_cell", alias = "rchlen")]
    pub length: f64,
    #[serde(alias = "top_streambed", alias = "strtop")]
    pub sbtop: f64,
    #[serde(alias = "bed_thickness", alias = "strthick", default = "unit")]
    pub sbthick: f64,
    #[serde(rename = "sbK", alias = "sbk", alias = "bed_K", alias = "strhc1", default = "unit")]
    pub sbk: f64,
    #[serde(alias = "width_in_cell", default = "unit")]
    pub width: f64,
    #[serde(alias = "bed_slope", default)]
    pub slope: f64,
    #[serde(default)]
    pub landsurface: Option<f64>,
    /// Written for convenience; routing is always read from the segment table.
    #[serde(default)]
    pub outseg: Option<u32>,
    #[serde(default)]
    pub outlet: Option<u32>,
    #[serde(default = "yes")]
    pub dominant: bool,
    #[serde(rename = "SFRlength", default)]
    pub effective_length: Option<f64>,
    #[serde(rename = "Cond", default)]
    pub conductance: Option<f64>,
}

impl From<&Reach> for ReachRow {
    fn from(r: &Reach) -> Self {
        Self {
            segment: r.segment,
            reach: r.reach,
            node: r.node,
            reach_id: Some(r.id.0),
            length: r.length,
            sbtop: r.sbtop,
            sbthick: r.sbthick,
            sbk: r.sbk,
            width: r.width,
            slope: r.slope,
            landsurface: r.landsurface,
            outseg: Some(r.outseg),
            outlet: r.outlet,
            dominant: r.dominant,
            effective_length: r.effective_length,
            conductance: r.conductance,
        }
    }
}

impl ReachRow {
    fn into_reach(self, id: u32) -> Reach {
        Reach {
            id: ReachId(id),
            segment: self.segment,
            reach: self.reach,
            node: self.node,
            length: self.length,
            sbtop: self.sbtop,
            sbthick: self.sbthick,
            sbk: self.sbk,
            width: self.width,
            slope: self.slope,
            landsurface: self.landsurface,
            outseg: self.outseg.unwrap_or(0),
            outlet: self.outlet,
            dominant: self.dominant,
            effective_length: self.effective_length,
            conductance: self.conductance,
        }
    }
}

/// Read a reach table. Rows without a reach id get fresh ids after the
/// largest one present, in table order.
pub fn read_reaches<R: io::Read>(rdr: R) -> Result<Vec<Reach>> {
    let mut rdr = ReaderBuilder::new().trim(csv::Trim::All).from_reader(rdr);
    let rows = rdr
        .deserialize::<ReachRow>()
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut next_id = rows.iter().filter_map(|r| r.reach_id).max().map_or(1, |m| m + 1);
    let reaches = rows
        .into_iter()
        .map(|row| {
            let id = row.reach_id.unwrap_or_else(|| {
                let id = next_id;
                next_id += 1;
                id
            });
            row.into_reach(id)
        })
        .collect::<Vec<_>>();
    debug!(reaches = reaches.len(), "reach table read");
    Ok(reaches)
}

pub fn write_reaches<W: io::Write>(w: W, net: &Network) -> Result<()> {
    let rows: Vec<ReachRow> = net.reaches().map(ReachRow::from).collect();
    write_rows(w, &rows)
}

// ── Segment table ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentRow {
    #[serde(alias = "nseg")]
    pub segment: u32,
    pub outseg: u32,
    #[serde(rename = "Max", alias = "elevMax", alias = "max_elev", default)]
    pub max_elev: Option<f64>,
    #[serde(rename = "Min", alias = "elevMin", alias = "min_elev", default)]
    pub min_elev: Option<f64>,
    #[serde(default)]
    pub outlet: Option<u32>,
    #[serde(default)]
    pub in_arbolate: Option<f64>,
    #[serde(default)]
    pub starting_arbolate: Option<f64>,
}

impl From<&Segment> for SegmentRow {
    fn from(s: &Segment) -> Self {
        let finite = |v: f64| v.is_finite().then_some(v);
        Self {
            segment: s.id,
            outseg: s.outseg,
            max_elev: finite(s.max_elev),
            min_elev: finite(s.min_elev),
            outlet: s.outlet,
            in_arbolate: Some(s.in_arbolate),
            starting_arbolate: s.starting_arbolate,
        }
    }
}

impl From<SegmentRow> for Segment {
    fn from(row: SegmentRow) -> Self {
        Segment {
            outlet: row.outlet,
            in_arbolate: row.in_arbolate.unwrap_or(0.0),
            starting_arbolate: row.starting_arbolate,
            ..Segment::new(row.segment, row.outseg).with_elevations(
                row.max_elev.unwrap_or(f64::NAN),
                row.min_elev.unwrap_or(f64::NAN),
            )
        }
    }
}

/// Read a segment table. Missing Max/Min are seeded when the network is built.
pub fn read_segments<R: io::Read>(rdr: R) -> Result<Vec<Segment>> {
    let mut rdr = ReaderBuilder::new().trim(csv::Trim::All).from_reader(rdr);
    let segments = rdr
        .deserialize::<SegmentRow>()
        .map(|row| row.map(Segment::from))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    debug!(segments = segments.len(), "segment table read");
    Ok(segments)
}

pub fn write_segments<W: io::Write>(w: W, net: &Network) -> Result<()> {
    let rows: Vec<SegmentRow> = net.segments().map(SegmentRow::from).collect();
    write_rows(w, &rows)
}

/// Read both tables from disk and validate them into a network.
pub fn load_network(reaches: &Path, segments: &Path, cfg: &PostprocConfig) -> Result<Network> {
    let reaches = read_reaches(File::open(reaches)?)?;
    let segments = read_segments(File::open(segments)?)?;
    Network::new(reaches, segments, cfg)
}

// ── Cell elevations ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
struct CellElevationRow {
    #[serde(alias = "cellnum")]
    node: u32,
    #[serde(alias = "elev", alias = "dem", alias = "landsurface")]
    elevation: f64,
}

/// Read a `node,elevation` table into a per-cell lookup.
pub fn read_cell_elevations<R: io::Read>(rdr: R) -> Result<BTreeMap<u32, f64>> {
    let mut rdr = ReaderBuilder::new().trim(csv::Trim::All).from_reader(rdr);
    let mut cells = BTreeMap::new();
    for row in rdr.deserialize::<CellElevationRow>() {
        let row = row?;
        cells.insert(row.node, row.elevation);
    }
    Ok(cells)
}

// ── Generic writers ───────────────────────────────────────────────────────────

/// Serialize `rows` as CSV with a header taken from the row type.
pub fn write_rows<W: io::Write, T: Serialize>(w: W, rows: &[T]) -> Result<()> {
    let mut wtr = WriterBuilder::new().from_writer(w);
    for row in rows {
        wtr.serialize(row)?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn write_rows_to_path<T: Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    write_rows(File::create(path)?, rows)
}

// ── Report rows ───────────────────────────────────────────────────────────────
//
// CSV rows cannot hold sequences, so id lists are written space-separated.

fn join_ids<T: Display>(ids: impl IntoIterator<Item = T>) -> String {
    ids.into_iter().map(|i| i.to_string()).collect::<Vec<_>>().join(" ")
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleRow {
    pub kind: &'static str,
    pub start: u32,
    pub segments: String,
}

pub fn cycle_rows(report: &CircularRoutingReport) -> Vec<CycleRow> {
    let cycles = report.cycles.iter().map(|c| CycleRow {
        kind: "cycle",
        start: c.first().copied().unwrap_or(0),
        segments: join_ids(c),
    });
    let overlong = report.overlong.iter().map(|(start, path)| CycleRow {
        kind: "overlong",
        start: *start,
        segments: join_ids(path),
    });
    cycles.chain(overlong).collect()
}

/// Resolved downstream path of one segment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoutingRow {
    pub segment: u32,
    pub outlet: u32,
    pub path: String,
}

pub fn routing_rows(routing: &RoutingMap) -> Vec<RoutingRow> {
    routing
        .outlets()
        .iter()
        .map(|(&segment, &outlet)| RoutingRow {
            segment,
            outlet,
            path: routing.path(segment).map(|p| join_ids(p)).unwrap_or_default(),
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfluenceRow {
    pub segment: u32,
    pub node: u32,
    pub elev: f64,
    pub upsegs: String,
}

pub fn confluence_rows(confluences: &[Confluence]) -> Vec<ConfluenceRow> {
    confluences
        .iter()
        .map(|c| ConfluenceRow {
            segment: c.segment,
            node: c.node,
            elev: c.elev,
            upsegs: join_ids(&c.upsegs),
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsolidationRow {
    pub node: u32,
    pub dominant: ReachId,
    pub suppressed: String,
    pub total_conductance: f64,
    pub effective_length: f64,
}

pub fn consolidation_rows(cells: &[CellConsolidation]) -> Vec<ConsolidationRow> {
    cells
        .iter()
        .map(|c| ConsolidationRow {
            node: c.node,
            dominant: c.dominant,
            suppressed: join_ids(&c.suppressed),
            total_conductance: c.total_conductance,
            effective_length: c.effective_length,
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SplitRow {
    pub group: usize,
    pub original: u32,
    pub segments: String,
}

pub fn split_rows(splits: &[SegmentSplit]) -> Vec<SplitRow> {
    splits
        .iter()
        .map(|s| SplitRow {
            group: s.group,
            original: s.original,
            segments: join_ids(&s.segments),
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollocatedRow {
    pub node: u32,
    pub reaches: String,
    pub conductive: String,
}

pub fn collocated_rows(found: &[CollocatedConductance]) -> Vec<CollocatedRow> {
    found
        .iter()
        .map(|c| CollocatedRow {
            node: c.node,
            reaches: join_ids(&c.reaches),
            conductive: join_ids(&c.conductive),
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NumberingRow {
    pub segment: u32,
    pub problem: &'static str,
    pub ordinals: String,
}

pub fn numbering_rows(missing_segments: &[u32], bad_reaches: &[ReachNumbering]) -> Vec<NumberingRow> {
    let missing = missing_segments.iter().map(|&s| NumberingRow {
        segment: s,
        problem: "missing segment",
        ordinals: String::new(),
    });
    let reaches = bad_reaches.iter().map(|b| NumberingRow {
        segment: b.segment,
        problem: "reach ordinals not 1..n",
        ordinals: join_ids(&b.ordinals),
    });
    missing.chain(reaches).collect()
}

fn write_if_any<T: Serialize>(dir: &Path, name: &str, rows: &[T], written: &mut Vec<PathBuf>) -> Result<()> {
    if rows.is_empty() {
        return Ok(());
    }
    let path = dir.join(name);
    write_rows_to_path(&path, rows)?;
    written.push(path);
    Ok(())
}

/// Write every non-empty diagnostic finding table into `dir` and return
/// the paths written.
pub fn write_diagnostic_reports(dir: &Path, report: &DiagnosticsReport) -> Result<Vec<PathBuf>> {
    let mut written = Vec::new();
    let numbering = numbering_rows(&report.numbering.missing_segments, &report.numbering.bad_reaches);
    write_if_any(dir, "numbering.csv", &numbering, &mut written)?;
    let collocated = collocated_rows(&report.collocated);
    write_if_any(dir, "collocated_conductance.csv", &collocated, &mut written)?;
    let elev = &report.elevations;
    write_if_any(dir, "elevation_increases.csv", &elev.increases, &mut written)?;
    write_if_any(dir, "segment_rises.csv", &elev.rises, &mut written)?;
    write_if_any(dir, "crossed_bounds.csv", &elev.crossed, &mut written)?;

    debug!(files = written.len(), "diagnostic reports written");
    Ok(written)
}

/// Write the non-empty report tables of a full run into `dir`.
pub fn write_run_reports(dir: &Path, res: &PostprocResult) -> Result<Vec<PathBuf>> {
    let mut written = write_diagnostic_reports(dir, &res.diagnostics)?;
    write_if_any(dir, "routing.csv", &routing_rows(&res.routing), &mut written)?;
    write_if_any(dir, "splits.csv", &split_rows(&res.splits), &mut written)?;
    write_if_any(dir, "segment_end_adjustments.csv", &res.end_adjustments, &mut written)?;
    write_if_any(dir, "consolidation.csv", &consolidation_rows(&res.consolidation), &mut written)?;
    write_if_any(dir, "confluences.csv", &confluence_rows(&res.confluences), &mut written)?;
    write_if_any(dir, "residual_rises.csv", &res.residual_rises, &mut written)?;
    write_if_any(dir, "smoothing_trace.csv", &res.trace, &mut written)?;
    Ok(written)
}
