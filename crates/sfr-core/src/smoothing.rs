//! Within-segment streambed profiles and reach slopes.
//!
//! A single forward scan keeps a running minimum that starts at the segment
//! Max. A reach at or below the running minimum, and still above the segment
//! Min, closes a linear interpolation (in along-channel distance between cell
//! centres) from the previous local minimum. A reach that dips below the
//! segment Min ends the scan with one interpolation straight to the last
//! reach, which is pinned at Min. Reaches above the running minimum are
//! covered by whichever interpolation spans them.

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::PostprocConfig;
use crate::error::Result;
use crate::network::Network;
use crate::par::map_ordered;
use crate::routing::ensure_acyclic;

/// One interpolated reach; the rows of the smoothing report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SmoothingTrace {
    pub segment: u32,
    pub reach: u32,
    /// Raw elevation sample the scan saw for this reach.
    pub land_surface: f64,
    /// Running minimum the interpolation started from.
    pub minelev: f64,
    /// Distance from the interpolation start.
    pub dist: f64,
    /// Elevation drop per unit distance over the interpolation.
    pub slope: f64,
    pub sb_elev: f64,
}

pub struct SmoothingResult {
    pub network: Network,
    pub trace: Vec<SmoothingTrace>,
    /// Segments with Max == Min, assigned a constant profile.
    pub flat_segments: usize,
    /// Segments handed over with Max below Min; their Min was clamped to Max.
    pub inverted: Vec<u32>,
    /// Reaches whose slope fell outside the configured bounds.
    pub slopes_clamped: usize,
}

pub struct SlopeResult {
    pub network: Network,
    pub clamped: usize,
}

// ── Profile scan ──────────────────────────────────────────────────────────────

struct Profile {
    segment: u32,
    start: f64,
    end: f64,
    ordinals: Vec<u32>,
    samples: Vec<f64>,
    lengths: Vec<f64>,
}

struct Smoothed {
    segment: u32,
    elevs: Vec<f64>,
    trace: Vec<SmoothingTrace>,
    flat: bool,
}

struct Scan<'a> {
    profile: &'a Profile,
    targets: Vec<f64>,
    cdist: Vec<f64>,
    minelev: f64,
    out: Smoothed,
}

impl Scan<'_> {
    /// Linear drop from the running minimum at `start` to `targets[stop]`.
    fn interpolate(&mut self, start: usize, stop: usize) {
        let target = self.targets[stop];
        let dx = self.cdist[stop] - self.cdist[start];
        let ds = self.minelev - target;
        let slope = if ds == 0.0 || dx <= 0.0 { 0.0 } else { ds / dx };

        for j in start + 1..=stop {
            let dist = self.cdist[j] - self.cdist[start];
            let elev = if j == stop { target } else { self.minelev - dist * slope };
            self.out.elevs[j] = elev;
            self.out.trace.push(SmoothingTrace {
                segment: self.profile.segment,
                reach: self.profile.ordinals[j],
                land_surface: self.profile.samples[j],
                minelev: self.minelev,
                dist,
                slope,
                sb_elev: elev,
            });
        }
        self.minelev = target;
    }
}

fn smooth_profile(profile: &Profile, tol: f64) -> Smoothed {
    let n = profile.samples.len();
    let (start, end) = (profile.start, profile.end);
    let out = Smoothed {
        segment: profile.segment,
        elevs: vec![start; n],
        trace: Vec::new(),
        flat: start == end,
    };
    if n < 2 || out.flat {
        return out;
    }

    let mut targets = profile.samples.clone();
    targets[n - 1] = end;

    let mut run = 0.0;
    let cdist = profile
        .lengths
        .iter()
        .map(|&len| {
            run += len;
            run - 0.5 * len
        })
        .collect();

    let mut scan = Scan {
        profile,
        targets,
        cdist,
        minelev: start,
        out,
    };
    let mut minloc = 0;
    for i in 1..n {
        let e = scan.targets[i];
        let at_or_below_min = e < scan.minelev || (e - scan.minelev).abs() < tol;
        if !at_or_below_min {
            continue;
        }
        if (scan.minelev > e && e > end) || (e - end).abs() < tol {
            scan.interpolate(minloc, i);
            minloc = i;
        } else if e < end {
            scan.interpolate(minloc, n - 1);
            break;
        }
    }
    scan.out
}

/// One profile per segment, in segment order.
fn collect_profiles(net: &Network) -> Vec<Profile> {
    net.segments()
        .map(|s| {
            let reaches: Vec<_> = net.segment_reaches(s.id).collect();
            Profile {
                segment: s.id,
                start: s.max_elev,
                end: s.min_elev,
                ordinals: reaches.iter().map(|r| r.reach).collect(),
                samples: reaches.iter().map(|r| r.profile_elevation()).collect(),
                lengths: reaches.iter().map(|r| r.length).collect(),
            }
        })
        .collect()
}

// ── Public entry points ───────────────────────────────────────────────────────

/// Smooth every segment's streambed profile between its Max and Min, then
/// recompute reach slopes from the new streambed tops.
///
/// Each reach starts from its land-surface sample, or its streambed top when
/// it has none. Segment bounds are expected to come from confluence mapping;
/// a segment with Max below Min is smoothed flat at Max and reported.
pub fn smooth_segment_interiors(net: &Network, cfg: &PostprocConfig) -> Result<SmoothingResult> {
    ensure_acyclic(net, cfg)?;

    let mut network = net.clone();
    let mut inverted = Vec::new();
    for seg in network.segments_mut() {
        if seg.max_elev < seg.min_elev {
            warn!(
                segment = seg.id,
                max = seg.max_elev,
                min = seg.min_elev,
                "segment Max below Min; smoothing flat at Max"
            );
            seg.min_elev = seg.max_elev;
            inverted.push(seg.id);
        }
    }

    let tol = cfg.elevation_tolerance;
    let smoothed = map_ordered(collect_profiles(&network), |p| smooth_profile(&p, tol));

    let mut trace = Vec::new();
    let mut flat_segments = 0;
    for s in smoothed {
        let chain = network.chain(s.segment).to_vec();
        for (&idx, &elev) in chain.iter().zip(&s.elevs) {
            network.reach_at_mut(idx).sbtop = elev;
        }
        if s.flat {
            flat_segments += 1;
        }
        debug!(segment = s.segment, interpolated = s.trace.len(), "segment smoothed");
        trace.extend(s.trace);
    }

    let slopes_clamped = assign_slopes(&mut network, cfg);
    info!(
        segments = network.segment_count(),
        interpolated = trace.len(),
        flat_segments,
        slopes_clamped,
        "segment interiors smoothed"
    );

    Ok(SmoothingResult {
        network,
        trace,
        flat_segments,
        inverted,
        slopes_clamped,
    })
}

/// Recompute reach slopes from streambed tops.
///
/// Slope is the negated forward difference over the reach length, the last
/// reach reusing its backward difference. Single-reach segments use
/// (Min − Max) / length. Every slope is clamped into
/// [`minimum_slope`, `maximum_slope`].
///
/// [`minimum_slope`]: PostprocConfig::minimum_slope
/// [`maximum_slope`]: PostprocConfig::maximum_slope
pub fn calculate_slopes(net: &Network, cfg: &PostprocConfig) -> SlopeResult {
    let mut network = net.clone();
    let clamped = assign_slopes(&mut network, cfg);
    SlopeResult { network, clamped }
}

fn assign_slopes(net: &mut Network, cfg: &PostprocConfig) -> usize {
    let ids: Vec<u32> = net.segments().map(|s| s.id).collect();
    let mut clamped = 0;
    for id in ids {
        let chain = net.chain(id).to_vec();
        let elevs: Vec<f64> = chain.iter().map(|&i| net.reach_at(i).sbtop).collect();
        let mut diffs: Vec<f64> = elevs.windows(2).map(|w| w[1] - w[0]).collect();
        match diffs.last().copied() {
            Some(last) => diffs.push(last),
            None => diffs.push(net.segment(id).map_or(0.0, |s| s.min_elev - s.max_elev)),
        }

        for (&idx, diff) in chain.iter().zip(diffs) {
            let r = net.reach_at_mut(idx);
            let raw = -diff / r.length;
            let slope = clamp_slope(raw, cfg);
            if slope != raw {
                clamped += 1;
            }
            r.slope = slope;
        }
    }
    clamped
}

fn clamp_slope(raw: f64, cfg: &PostprocConfig) -> f64 {
    if raw.is_nan() {
        cfg.minimum_slope
    } else {
        raw.clamp(cfg.minimum_slope, cfg.maximum_slope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SfrError;
    use crate::network::{Reach, Segment};
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// Segment 2 of the 1→2→3 chain carries the five-reach profile.
    fn chain_with_profile(samples: &[f64], max: f64, min: f64) -> Network {
        let mut reaches = vec![
            Reach { landsurface: Some(100.0), ..Reach::new(1, 1, 1, 1) },
            Reach { landsurface: Some(60.0), ..Reach::new(2, 3, 1, 99) },
        ];
        for (i, &e) in samples.iter().enumerate() {
            let i = i as u32;
            reaches.push(Reach { landsurface: Some(e), ..Reach::new(10 + i, 2, i + 1, 10 + i) });
        }
        let segments = vec![
            Segment::new(1, 2).with_elevations(100.0, 90.0),
            Segment::new(2, 3).with_elevations(max, min),
            Segment::new(3, 0).with_elevations(70.0, 50.0),
        ];
        Network::new(reaches, segments, &PostprocConfig::default()).unwrap()
    }

    fn sbtops(net: &Network, seg: u32) -> Vec<f64> {
        net.segment_reaches(seg).map(|r| r.sbtop).collect()
    }

    #[test]
    fn local_rise_is_interpolated_through() {
        let net = chain_with_profile(&[95.0, 85.0, 75.0, 65.0, 88.0], 90.0, 70.0);
        let res = smooth_segment_interiors(&net, &PostprocConfig::default()).unwrap();
        let elevs = sbtops(&res.network, 2);
        let expected = [90.0, 85.0, 75.0, 72.5, 70.0];
        for (got, want) in elevs.iter().zip(expected) {
            assert_relative_eq!(*got, want, epsilon = 1e-9);
        }
        assert!(elevs.windows(2).all(|w| w[1] <= w[0]), "profile rises: {elevs:?}");
    }

    #[test]
    fn trace_records_each_interpolated_reach() {
        let net = chain_with_profile(&[95.0, 85.0, 75.0, 65.0, 88.0], 90.0, 70.0);
        let res = smooth_segment_interiors(&net, &PostprocConfig::default()).unwrap();
        let seg2: Vec<&SmoothingTrace> = res.trace.iter().filter(|t| t.segment == 2).collect();
        assert_eq!(seg2.len(), 4);
        let row = seg2[2];
        assert_eq!(row.reach, 4);
        assert_relative_eq!(row.minelev, 75.0);
        assert_relative_eq!(row.slope, 2.5);
        assert_relative_eq!(row.dist, 1.0);
        assert_relative_eq!(row.sb_elev, 72.5);
    }

    #[test]
    fn equal_bounds_give_flat_profile() {
        let net = chain_with_profile(&[80.0, 82.0, 79.0], 80.0, 80.0);
        let res = smooth_segment_interiors(&net, &PostprocConfig::default()).unwrap();
        assert_eq!(sbtops(&res.network, 2), vec![80.0; 3]);
        assert!(res.flat_segments >= 1);
    }

    #[test]
    fn inverted_bounds_are_flattened_and_reported() {
        let net = chain_with_profile(&[80.0, 82.0, 79.0], 75.0, 78.0);
        let res = smooth_segment_interiors(&net, &PostprocConfig::default()).unwrap();
        assert_eq!(res.inverted, vec![2]);
        assert_eq!(sbtops(&res.network, 2), vec![75.0; 3]);
        assert_eq!(res.network.segment(2).unwrap().min_elev, 75.0);
    }

    #[test]
    fn slopes_are_clamped_into_bounds() {
        let cfg = PostprocConfig::default();
        let net = chain_with_profile(&[95.0, 85.0, 75.0, 65.0, 88.0], 90.0, 70.0);
        let res = smooth_segment_interiors(&net, &cfg).unwrap();
        for r in res.network.reaches() {
            assert!(
                (cfg.minimum_slope..=cfg.maximum_slope).contains(&r.slope),
                "reach {} slope {} out of bounds",
                r.id,
                r.slope
            );
        }
        assert!(res.slopes_clamped > 0);
    }

    #[test]
    fn single_reach_slope_uses_segment_bounds() {
        let reaches = vec![Reach { length: 100.0, ..Reach::new(1, 1, 1, 1) }];
        let segments = vec![Segment::new(1, 0).with_elevations(10.0, 9.5)];
        let net = Network::new(reaches, segments, &PostprocConfig::default()).unwrap();
        let res = calculate_slopes(&net, &PostprocConfig::default());
        let r = res.network.reaches().next().unwrap();
        assert_relative_eq!(r.slope, 0.005);
        assert_eq!(res.clamped, 0);
    }

    #[test]
    fn last_reach_reuses_backward_difference() {
        let reaches = (1..=3)
            .map(|i| Reach { sbtop: 10.0 - i as f64 * 0.1, length: 10.0, ..Reach::new(i, 1, i, i) })
            .collect();
        let segments = vec![Segment::new(1, 0)];
        let net = Network::new(reaches, segments, &PostprocConfig::default()).unwrap();
        let res = calculate_slopes(&net, &PostprocConfig::default());
        for r in res.network.reaches() {
            assert_relative_eq!(r.slope, 0.01, epsilon = 1e-12);
        }
    }

    #[test]
    fn circular_routing_blocks_smoothing() {
        let reaches = vec![Reach::new(1, 1, 1, 1), Reach::new(2, 2, 1, 2)];
        let segments = vec![
            Segment::new(1, 2).with_elevations(5.0, 4.0),
            Segment::new(2, 1).with_elevations(4.0, 3.0),
        ];
        let net = Network::new(reaches, segments, &PostprocConfig::default()).unwrap();
        let err = smooth_segment_interiors(&net, &PostprocConfig::default()).err().unwrap();
        assert!(matches!(err, SfrError::CircularRouting { .. }));
    }

    #[test]
    fn random_profiles_are_monotone_and_pinned() {
        let cfg = PostprocConfig::default();
        let tol = cfg.elevation_tolerance;
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..200 {
            let n = rng.gen_range(2..30u32);
            let max: f64 = rng.gen_range(50.0..100.0);
            let min = max - rng.gen_range(0.0..50.0);
            let reaches = (1..=n)
                .map(|i| Reach {
                    landsurface: Some(rng.gen_range(min - 20.0..max + 20.0)),
                    length: rng.gen_range(1.0..500.0),
                    ..Reach::new(i, 1, i, i)
                })
                .collect();
            let segments = vec![Segment::new(1, 0).with_elevations(max, min)];
            let net = Network::new(reaches, segments, &cfg).unwrap();
            let res = smooth_segment_interiors(&net, &cfg).unwrap();

            let elevs = sbtops(&res.network, 1);
            assert_eq!(elevs.len(), n as usize);
            assert_eq!(elevs[0], max);
            assert_relative_eq!(elevs[elevs.len() - 1], min, epsilon = tol);
            for w in elevs.windows(2) {
                assert!(w[1] <= w[0] + tol, "profile rises: {elevs:?}");
            }
            for r in res.network.reaches() {
                assert!(r.slope >= cfg.minimum_slope && r.slope <= cfg.maximum_slope);
            }
        }
    }

    #[cfg(feature = "threading")]
    #[test]
    fn threaded_smoothing_matches_a_sequential_pass() {
        let cfg = PostprocConfig::default();
        let tol = cfg.elevation_tolerance;
        let mut rng = StdRng::seed_from_u64(7);
        let nseg = 64u32;
        let mut reaches = Vec::new();
        let mut segments = Vec::new();
        let mut next_id = 1;
        let mut top: f64 = 1_000.0;
        for s in 1..=nseg {
            let bottom = top - rng.gen_range(1.0..10.0);
            let outseg = if s == nseg { 0 } else { s + 1 };
            segments.push(Segment::new(s, outseg).with_elevations(top, bottom));
            for k in 1..=rng.gen_range(1..12u32) {
                reaches.push(Reach {
                    landsurface: Some(rng.gen_range(bottom - 5.0..top + 5.0)),
                    length: rng.gen_range(1.0..300.0),
                    ..Reach::new(next_id, s, k, next_id)
                });
                next_id += 1;
            }
            top = bottom;
        }
        let net = Network::new(reaches, segments, &cfg).unwrap();

        let res = smooth_segment_interiors(&net, &cfg).unwrap();

        let sequential: Vec<Smoothed> = collect_profiles(&net)
            .iter()
            .map(|p| smooth_profile(p, tol))
            .collect();
        let mut trace = Vec::new();
        for s in sequential {
            assert_eq!(sbtops(&res.network, s.segment), s.elevs, "segment {}", s.segment);
            trace.extend(s.trace);
        }
        assert_eq!(res.trace, trace);
    }
}
