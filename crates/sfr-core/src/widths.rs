//! Channel width from arbolate sum (total upstream channel length).
//!
//! width = 0.1193 · (1000 · arbolate_km)^0.5032

use tracing::info;

use crate::config::PostprocConfig;
use crate::error::Result;
use crate::network::Network;
use crate::routing::{all_upstream, ensure_acyclic};

const WIDTH_COEFF: f64 = 0.1193;
const WIDTH_EXP: f64 = 0.5032;

#[inline]
pub fn width_from_arbolate(arbolate_km: f64) -> f64 {
    WIDTH_COEFF * (1000.0 * arbolate_km).powf(WIDTH_EXP)
}

/// Assign every reach a width from the arbolate sum at its downstream end.
///
/// A segment's starting arbolate sum is the channel length of every segment
/// upstream of it plus their `in_arbolate`; headwaters start from their own
/// `in_arbolate`. Each segment's starting value is recorded on it.
pub fn estimate_widths(net: &Network, cfg: &PostprocConfig) -> Result<Network> {
    ensure_acyclic(net, cfg)?;
    let mut network = net.clone();

    let seg_km = |id: u32| -> f64 {
        net.segment_reaches(id).map(|r| r.length).sum::<f64>() * cfg.to_km
    };

    let starts: Vec<(u32, f64)> = net
        .segments()
        .map(|s| {
            let up = all_upstream(net, s.id);
            let start = if up.is_empty() {
                s.in_arbolate
            } else {
                up.iter()
                    .map(|&u| seg_km(u) + net.segment(u).map_or(0.0, |us| us.in_arbolate))
                    .sum()
            };
            (s.id, start)
        })
        .collect();

    let mut widest: f64 = 0.0;
    for (id, start) in starts {
        if let Some(seg) = network.segment_mut(id) {
            seg.starting_arbolate = Some(start);
        }
        let mut asum = start;
        for idx in network.chain(id).to_vec() {
            let r = network.reach_at_mut(idx);
            asum += r.length * cfg.to_km;
            r.width = width_from_arbolate(asum);
            widest = widest.max(r.width);
        }
    }

    info!(reaches = network.reach_count(), widest, "stream widths estimated");
    Ok(network)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{Reach, Segment};
    use approx::assert_relative_eq;

    #[test]
    fn correlation_matches_reference_points() {
        assert_eq!(width_from_arbolate(0.0), 0.0);
        assert_relative_eq!(width_from_arbolate(1.0), 0.1193 * 1000f64.powf(0.5032));
    }

    #[test]
    fn confluence_starts_from_all_upstream_length() {
        let cfg = PostprocConfig {
            to_km: 0.001,
            ..Default::default()
        };
        // 1 and 2 (1 km each) join 3; 1 also receives 5 km from outside.
        let reaches = vec![
            Reach { length: 1000.0, ..Reach::new(1, 1, 1, 1) },
            Reach { length: 1000.0, ..Reach::new(2, 2, 1, 2) },
            Reach { length: 500.0, ..Reach::new(3, 3, 1, 3) },
            Reach { length: 500.0, ..Reach::new(4, 3, 2, 4) },
        ];
        let segments = vec![
            Segment { in_arbolate: 5.0, ..Segment::new(1, 3) },
            Segment::new(2, 3),
            Segment::new(3, 0),
        ];
        let net = Network::new(reaches, segments, &cfg).unwrap();
        let out = estimate_widths(&net, &cfg).unwrap();

        assert_eq!(out.segment(1).unwrap().starting_arbolate, Some(5.0));
        assert_eq!(out.segment(2).unwrap().starting_arbolate, Some(0.0));
        assert_relative_eq!(out.segment(3).unwrap().starting_arbolate.unwrap(), 7.0);

        let w: Vec<f64> = out.segment_reaches(3).map(|r| r.width).collect();
        assert_relative_eq!(w[0], width_from_arbolate(7.5), epsilon = 1e-9);
        assert_relative_eq!(w[1], width_from_arbolate(8.0), epsilon = 1e-9);
        assert!(w[1] > w[0], "width grows downstream");
    }
}
