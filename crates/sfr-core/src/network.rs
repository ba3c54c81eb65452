//! Reach and segment tables as one validated network value.
//!
//! Reaches live in an arena whose positions never change during a run;
//! the stable `ReachId` is the only safe cross-reference across a segment
//! split. Segment membership, reach ordinals, upsegs and the
//! (segment, reach) ordering are derived views rebuilt after every
//! structural edit.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::PostprocConfig;
use crate::error::{Result, SfrError};

/// Globally unique reach identifier, stable across renumbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReachId(pub u32);

impl fmt::Display for ReachId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One flow element in one grid cell of one segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reach {
    pub id: ReachId,
    pub segment: u32,
    /// 1-based ordinal within the segment.
    pub reach: u32,
    /// Grid cell (model node number).
    pub node: u32,
    /// Geometric length in the cell.
    pub length: f64,
    /// Streambed top elevation.
    pub sbtop: f64,
    /// Streambed thickness.
    pub sbthick: f64,
    /// Streambed hydraulic conductivity.
    pub sbk: f64,
    pub width: f64,
    pub slope: f64,
    /// Land-surface elevation sample; the smoother falls back to `sbtop`.
    pub landsurface: Option<f64>,
    /// Copied from the owning segment on every rebuild.
    pub outseg: u32,
    pub outlet: Option<u32>,
    /// False only for suppressed collocated reaches.
    pub dominant: bool,
    /// Length that reproduces the cell's total conductance (set by consolidation).
    pub effective_length: Option<f64>,
    pub conductance: Option<f64>,
}

impl Reach {
    /// A unit-geometry reach; callers override fields with struct update syntax.
    pub fn new(id: u32, segment: u32, reach: u32, node: u32) -> Self {
        Self {
            id: ReachId(id),
            segment,
            reach,
            node,
            length: 1.0,
            sbtop: 0.0,
            sbthick: 1.0,
            sbk: 1.0,
            width: 1.0,
            slope: 0.0,
            landsurface: None,
            outseg: 0,
            outlet: None,
            dominant: true,
            effective_length: None,
            conductance: None,
        }
    }

    /// Elevation sample the profile smoother starts from.
    #[inline]
    pub fn profile_elevation(&self) -> f64 {
        self.landsurface.unwrap_or(self.sbtop)
    }

    /// K · width · length / thickness, using the effective length when set.
    pub fn streambed_conductance(&self) -> f64 {
        let length = self.effective_length.unwrap_or(self.length);
        self.sbk * self.width * length / self.sbthick
    }
}

/// An ordered chain of reaches; the unit of routing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub id: u32,
    /// Downstream segment; 0 or the configured sentinel is an outlet.
    pub outseg: u32,
    /// Segments routing into this one. Derived, never authoritative.
    pub upsegs: Vec<u32>,
    /// Maximum bounding elevation (upstream end). NaN until seeded.
    pub max_elev: f64,
    /// Minimum bounding elevation (downstream end). NaN until seeded.
    pub min_elev: f64,
    pub outlet: Option<u32>,
    /// Arbolate sum entering from outside the model, in km.
    pub in_arbolate: f64,
    pub starting_arbolate: Option<f64>,
}

impl Segment {
    pub fn new(id: u32, outseg: u32) -> Self {
        Self {
            id,
            outseg,
            upsegs: Vec::new(),
            max_elev: f64::NAN,
            min_elev: f64::NAN,
            outlet: None,
            in_arbolate: 0.0,
            starting_arbolate: None,
        }
    }

    pub fn with_elevations(mut self, max_elev: f64, min_elev: f64) -> Self {
        self.max_elev = max_elev;
        self.min_elev = min_elev;
        self
    }

    fn is_seeded(&self) -> bool {
        self.max_elev.is_finite() && self.min_elev.is_finite()
    }
}

/// Validated reach + segment tables.
#[derive(Debug, Clone)]
pub struct Network {
    reaches: Vec<Reach>,
    lookup: HashMap<ReachId, usize>,
    segments: BTreeMap<u32, Segment>,
    /// Segment id → arena positions ordered by reach ordinal.
    chains: BTreeMap<u32, Vec<usize>>,
}

impl Network {
    /// Build a network from the two tables.
    ///
    /// Fatal: duplicate reach identifiers or (segment, reach) keys, a segment
    /// set that differs between the tables, self-routing segments, and outsegs
    /// naming segments that do not exist. Segments without finite Max/Min are
    /// seeded from their reaches.
    pub fn new(reaches: Vec<Reach>, segments: Vec<Segment>, cfg: &PostprocConfig) -> Result<Self> {
        let mut lookup = HashMap::with_capacity(reaches.len());
        let mut keys = BTreeSet::new();
        for (i, r) in reaches.iter().enumerate() {
            if lookup.insert(r.id, i).is_some() {
                return Err(SfrError::DuplicateReachId(r.id.0));
            }
            if !keys.insert((r.segment, r.reach)) {
                return Err(SfrError::DuplicateReach {
                    segment: r.segment,
                    reach: r.reach,
                });
            }
        }

        let reach_segs: BTreeSet<u32> = reaches.iter().map(|r| r.segment).collect();
        let table_segs: BTreeSet<u32> = segments.iter().map(|s| s.id).collect();
        if reach_segs != table_segs || table_segs.len() != segments.len() {
            return Err(SfrError::SegmentMismatch {
                reach_only: reach_segs.difference(&table_segs).copied().collect(),
                segment_only: table_segs.difference(&reach_segs).copied().collect(),
            });
        }

        let self_routed: Vec<u32> = segments
            .iter()
            .filter(|s| s.outseg == s.id)
            .map(|s| s.id)
            .collect();
        if !self_routed.is_empty() {
            return Err(SfrError::SelfRouting {
                segments: self_routed,
            });
        }

        for s in &segments {
            if !cfg.is_terminal(s.outseg) && !table_segs.contains(&s.outseg) {
                return Err(SfrError::UnknownOutseg {
                    segment: s.id,
                    outseg: s.outseg,
                });
            }
        }

        let mut net = Self {
            reaches,
            lookup,
            segments: segments.into_iter().map(|s| (s.id, s)).collect(),
            chains: BTreeMap::new(),
        };
        net.rebuild();

        let unseeded: Vec<u32> = net
            .segments
            .values()
            .filter(|s| !s.is_seeded())
            .map(|s| s.id)
            .collect();
        for id in unseeded {
            net.seed_segment(id);
        }
        Ok(net)
    }

    pub fn reach_count(&self) -> usize {
        self.reaches.len()
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn max_segment_id(&self) -> u32 {
        self.segments.keys().next_back().copied().unwrap_or(0)
    }

    pub fn segment(&self, id: u32) -> Option<&Segment> {
        self.segments.get(&id)
    }

    /// Segments in ascending id order.
    pub fn segments(&self) -> impl Iterator<Item = &Segment> + '_ {
        self.segments.values()
    }

    pub fn reach(&self, id: ReachId) -> Option<&Reach> {
        self.lookup.get(&id).map(|&i| &self.reaches[i])
    }

    /// All reaches sorted by (segment, reach).
    pub fn reaches(&self) -> impl Iterator<Item = &Reach> + '_ {
        self.chains.values().flatten().map(move |&i| &self.reaches[i])
    }

    /// Reaches of one segment in ordinal order.
    pub fn segment_reaches(&self, segment: u32) -> impl Iterator<Item = &Reach> + '_ {
        self.chain(segment).iter().map(move |&i| &self.reaches[i])
    }

    /// Grid cells hosting more than one reach, with their reach ids in table order.
    pub fn shared_cells(&self) -> BTreeMap<u32, Vec<ReachId>> {
        let mut cells: BTreeMap<u32, Vec<ReachId>> = BTreeMap::new();
        for r in self.reaches() {
            cells.entry(r.node).or_default().push(r.id);
        }
        cells.retain(|_, ids| ids.len() > 1);
        cells
    }

    /// Tables sorted by (segment, reach) and segment id.
    pub fn into_tables(self) -> (Vec<Reach>, Vec<Segment>) {
        let reaches = self.reaches().cloned().collect();
        let segments = self.segments.into_values().collect();
        (reaches, segments)
    }

    // ── crate-internal editing ──────────────────────────────────────────────

    pub(crate) fn chain(&self, segment: u32) -> &[usize] {
        self.chains.get(&segment).map(Vec::as_slice).unwrap_or(&[])
    }

    pub(crate) fn reach_at(&self, idx: usize) -> &Reach {
        &self.reaches[idx]
    }

    pub(crate) fn reach_at_mut(&mut self, idx: usize) -> &mut Reach {
        &mut self.reaches[idx]
    }

    pub(crate) fn index_of(&self, id: ReachId) -> Option<usize> {
        self.lookup.get(&id).copied()
    }

    pub(crate) fn segment_mut(&mut self, id: u32) -> Option<&mut Segment> {
        self.segments.get_mut(&id)
    }

    pub(crate) fn reaches_mut(&mut self) -> impl Iterator<Item = &mut Reach> + '_ {
        self.reaches.iter_mut()
    }

    pub(crate) fn segments_mut(&mut self) -> impl Iterator<Item = &mut Segment> + '_ {
        self.segments.values_mut()
    }

    pub(crate) fn insert_segment(&mut self, segment: Segment) {
        self.segments.insert(segment.id, segment);
    }

    /// Max/Min from the extremes of the segment's reach elevations: land
    /// surface when every reach has a sample, streambed top otherwise.
    pub(crate) fn seed_segment(&mut self, id: u32) {
        let chain = self.chain(id);
        let use_landsurface = chain.iter().all(|&i| self.reaches[i].landsurface.is_some());
        let elevs: Vec<f64> = chain
            .iter()
            .map(|&i| {
                let r = &self.reaches[i];
                if use_landsurface {
                    r.profile_elevation()
                } else {
                    r.sbtop
                }
            })
            .collect();
        let max = elevs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let min = elevs.iter().copied().fold(f64::INFINITY, f64::min);
        if let Some(seg) = self.segments.get_mut(&id) {
            seg.max_elev = max;
            seg.min_elev = min;
        }
    }

    /// Recompute every derived view: reach chains, upsegs, and the outseg /
    /// outlet copies held on reaches.
    pub(crate) fn rebuild(&mut self) {
        let mut chains: BTreeMap<u32, Vec<usize>> = BTreeMap::new();
        for (i, r) in self.reaches.iter().enumerate() {
            chains.entry(r.segment).or_default().push(i);
        }
        for chain in chains.values_mut() {
            chain.sort_by_key(|&i| (self.reaches[i].reach, self.reaches[i].id));
        }
        self.chains = chains;

        let mut upsegs: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
        for s in self.segments.values() {
            upsegs.entry(s.outseg).or_default().push(s.id);
        }
        for s in self.segments.values_mut() {
            s.upsegs = upsegs.remove(&s.id).unwrap_or_default();
        }

        for r in &mut self.reaches {
            if let Some(seg) = self.segments.get(&r.segment) {
                r.outseg = seg.outseg;
                r.outlet = seg.outlet;
            }
        }
    }
}
