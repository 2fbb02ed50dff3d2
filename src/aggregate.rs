// SUMO Live Data Loop (Rust edition)
// Copyright (C) 2026 the project contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//! Aggregator: per-edge coverage-aware rollup of corrected detector readings
//! and FCD records into interval tuples. Grounded on
//! `original_source/sumo_ldl/aggregateData.py`
//! (`insertAggregated`, `_wait_if_trafficlight`, `_getFilteredFCD`,
//! `generateComparison`).

use std::collections::HashMap;

use chrono::NaiveDateTime;

use crate::source::SourceType;

/// Per-edge accumulator built while scanning a source's group/detector
/// contributions for one interval.
#[derive(Debug, Default, Clone, Copy)]
pub struct EdgeAccumulator {
    pub flow_sum: f64,
    pub speed_sum: f64,
    pub quality_sum: f64,
    pub coverage_sum: f64,
    pub entry_count: u32,
    pub group_count: u32,
}

impl EdgeAccumulator {
    /// Folds in one group's (or detector's, for ungrouped sources)
    /// contribution. `speed` weighs into `speed_sum` by `flow` (flow-weighted
    /// average speed); `quality` weighs by `entries`.
    pub fn add(&mut self, flow: Option<f64>, speed: Option<f64>, quality: f64, coverage: f64, entries: u32) {
        let flow = flow.unwrap_or(0.0);
        self.flow_sum += flow;
        if let Some(speed) = speed {
            self.speed_sum += speed * flow;
        }
        self.quality_sum += quality * entries as f64;
        self.coverage_sum += coverage;
        self.entry_count += entries;
        self.group_count += 1;
    }
}

/// Parameters needed to turn an [`EdgeAccumulator`] into an [`EdgeAggregate`],
/// threaded through rather than hard-coded since `expected_entry_count` and
/// `flow_scale` are schema/region-dependent (spec design note, §9).
#[derive(Debug, Clone, Copy)]
pub struct AggregateParams {
    /// Expected number of reporting detectors for this edge; `None` for FCD,
    /// which instead divides coverage by its own `entry_count`.
    pub expected_entry_count: Option<f64>,
    pub source: SourceType,
    /// `3600/updateInterval` for loops, `aggregate/600` for FCD.
    pub flow_scale: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EdgeAggregate {
    pub flow: Option<i64>,
    pub speed: Option<f64>,
    pub quality: f64,
    pub coverage: Option<f64>,
}

/// Computes the final `(flow, speed, quality)` tuple for one edge from its
/// accumulated sums, per spec.md §4.6.
pub fn finalize(acc: &EdgeAccumulator, params: &AggregateParams) -> EdgeAggregate {
    if acc.entry_count == 0 {
        return EdgeAggregate { flow: None, speed: None, quality: 0.0, coverage: None };
    }
    let coverage = match params.expected_entry_count {
        Some(expected) if expected > 0.0 => Some(acc.coverage_sum / expected),
        Some(_) => None,
        None => Some(acc.coverage_sum / acc.entry_count as f64),
    };
    let flow_raw = match coverage {
        Some(c) if c > 0.0 => acc.flow_sum / c,
        _ => acc.flow_sum,
    };
    let denom = if params.source.is_simulation_like() {
        acc.entry_count as f64
    } else {
        acc.group_count as f64
    };
    let flow = if denom > 0.0 {
        Some((flow_raw * params.flow_scale / denom).trunc() as i64)
    } else {
        None
    };
    let speed_denom = acc.flow_sum.max(acc.entry_count as f64);
    let speed = if speed_denom > 0.0 { Some(acc.speed_sum / speed_denom) } else { None };
    let coverage_discount = match coverage {
        Some(c) if c > 1.0 => 1.0 / c,
        Some(c) if c < 1.0 => c,
        _ => 1.0,
    };
    let quality = acc.quality_sum * coverage_discount / acc.entry_count as f64;
    EdgeAggregate { flow, speed, quality, coverage }
}

/// Accumulates per-edge [`EdgeAccumulator`]s from a flat list of group-level
/// contributions, applying the simulation/DB edge-id map when the source is
/// simulation-like. Returns `(accumulators, unknown_edge_count)`.
pub fn accumulate_edges<I>(
    contributions: I,
    edge_map: Option<&HashMap<i64, i64>>,
) -> (HashMap<i64, EdgeAccumulator>, usize)
where
    I: IntoIterator<Item = (i64, Option<f64>, Option<f64>, f64, f64, u32)>,
{
    let mut edges: HashMap<i64, EdgeAccumulator> = HashMap::new();
    let mut unknown = 0usize;
    for (raw_edge, flow, speed, quality, coverage, entries) in contributions {
        let edge = match edge_map {
            Some(map) => match map.get(&raw_edge) {
                Some(&mapped) => mapped,
                None => {
                    unknown += 1;
                    continue;
                }
            },
            None => raw_edge,
        };
        edges.entry(edge).or_default().add(flow, speed, quality, coverage, entries);
    }
    (edges, unknown)
}

/// Distance (meters) from a signalized edge end within which a near-zero
/// FCD speed is attributed to signal queuing rather than free flow.
pub const TLS_WAIT_DISTANCE_M: f64 = 50.0;
/// Speed (schema speed unit) at or below which an FCD sighting near a
/// signal is treated as waiting.
pub const TLS_WAIT_SPEED_THRESHOLD: f64 = 5.0;

/// One floating-car-data sighting, pre-filtering.
#[derive(Debug, Clone)]
pub struct FcdSighting {
    pub vehicle_id: i64,
    pub edge_id: i64,
    pub time: NaiveDateTime,
    pub speed: f64,
    pub edge_ends_at_traffic_light: bool,
    pub distance_to_signal_m: f64,
}

/// Merges repeated sightings of the same vehicle on the same edge within an
/// interval down to the most recent one (`_getFilteredFCD`), and — when
/// `tls_wait_correction` is enabled — drops near-zero-speed sightings close
/// to a signalized edge end from the speed accumulator while still counting
/// them toward coverage (`_wait_if_trafficlight`).
pub fn filter_fcd(
    mut sightings: Vec<FcdSighting>,
    tls_wait_correction: bool,
    wait_distance_threshold_m: f64,
    wait_speed_threshold: f64,
) -> Vec<(i64, Option<f64>)> {
    sightings.sort_by_key(|s| s.time);
    let mut latest: HashMap<(i64, i64), FcdSighting> = HashMap::new();
    for s in sightings {
        latest.insert((s.vehicle_id, s.edge_id), s);
    }
    latest
        .into_values()
        .map(|s| {
            let is_waiting = tls_wait_correction
                && s.edge_ends_at_traffic_light
                && s.speed <= wait_speed_threshold
                && s.distance_to_signal_m <= wait_distance_threshold_m;
            let speed = if is_waiting { None } else { Some(s.speed) };
            (s.edge_id, speed)
        })
        .collect()
}

/// One row of the per-iteration plain-text comparison artifact
/// (`compare.txt`): `(flow, speed)` per source type, for one edge.
#[derive(Debug, Clone, Default)]
pub struct ComparisonRow {
    pub edge_id: i64,
    pub values: HashMap<SourceType, (Option<i64>, Option<f64>)>,
}

/// Renders the comparison artifact: header line `YYYYMMDDHHMMSS`, then
/// `section-id\t<type>-flow\t<type>-speed…`, one line per edge, columns in
/// the order given by `types`.
pub fn generate_comparison(time: NaiveDateTime, rows: &[ComparisonRow], types: &[SourceType]) -> String {
    let mut out = String::new();
    out.push_str(&time.format("%Y%m%d%H%M%S").to_string());
    out.push('\n');
    for row in rows {
        out.push_str(&row.edge_id.to_string());
        for t in types {
            let (flow, speed) = row.values.get(t).copied().unwrap_or((None, None));
            out.push('\t');
            out.push_str(&flow.map(|f| f.to_string()).unwrap_or_default());
            out.push('\t');
            out.push_str(&speed.map(|s| format!("{s:.0}")).unwrap_or_default());
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_clean_loop_scenario() {
        // q=600 veh/h, v=80 over 10 one-minute slots aggregated over 5 min,
        // expectedEntryCount=5 -> flow=600, speed=80, quality=100, coverage=1.0.
        let mut acc = EdgeAccumulator::default();
        // one detector group reporting the full interval with full quality/coverage.
        acc.add(Some(50.0), Some(80.0), 100.0, 1.0, 1);
        let params = AggregateParams {
            expected_entry_count: Some(1.0),
            source: SourceType::Loop,
            flow_scale: 12.0, // 600 veh/h from 50 in a 5-minute interval: 50*12=600
        };
        let result = finalize(&acc, &params);
        assert_eq!(result.flow, Some(600));
        assert_eq!(result.speed, Some(80.0));
        assert_eq!(result.quality, 100.0);
        assert_eq!(result.coverage, Some(1.0));
    }

    #[test]
    fn coverage_discount_scales_quality_down_for_partial_coverage() {
        let mut acc = EdgeAccumulator::default();
        acc.add(Some(10.0), Some(80.0), 100.0, 0.5, 1);
        let params = AggregateParams { expected_entry_count: Some(1.0), source: SourceType::Loop, flow_scale: 60.0 };
        let result = finalize(&acc, &params);
        // coverage=0.5 < 1 so coverageDiscount=0.5, quality=100*0.5/1=50
        assert_eq!(result.quality, 50.0);
    }

    #[test]
    fn fcd_merges_repeated_sightings_to_latest() {
        let t0 = chrono::NaiveDate::from_ymd_opt(2026, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap();
        let sightings = vec![
            FcdSighting { vehicle_id: 1, edge_id: 7, time: t0, speed: 10.0, edge_ends_at_traffic_light: false, distance_to_signal_m: 999.0 },
            FcdSighting { vehicle_id: 1, edge_id: 7, time: t0 + chrono::Duration::seconds(5), speed: 30.0, edge_ends_at_traffic_light: false, distance_to_signal_m: 999.0 },
        ];
        let result = filter_fcd(sightings, true, 20.0, 2.0);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0], (7, Some(30.0)));
    }

    #[test]
    fn fcd_waiting_at_signal_excluded_from_speed() {
        let t0 = chrono::NaiveDate::from_ymd_opt(2026, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap();
        let sightings = vec![FcdSighting {
            vehicle_id: 1,
            edge_id: 7,
            time: t0,
            speed: 1.0,
            edge_ends_at_traffic_light: true,
            distance_to_signal_m: 5.0,
        }];
        let result = filter_fcd(sightings, true, 20.0, 2.0);
        assert_eq!(result, vec![(7, None)]);
    }

    #[test]
    fn comparison_header_and_row_format() {
        let t = chrono::NaiveDate::from_ymd_opt(2026, 1, 2).unwrap().and_hms_opt(3, 4, 5).unwrap();
        let mut row = ComparisonRow { edge_id: 42, ..Default::default() };
        row.values.insert(SourceType::Loop, (Some(600), Some(80.0)));
        let text = generate_comparison(t, &[row], &[SourceType::Loop]);
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("20260102030405"));
        assert_eq!(lines.next(), Some("42\t600\t80"));
    }
}
