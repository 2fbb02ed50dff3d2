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
//! Polynomial (degree-1) gap filler: fills interpolation gaps and extrapolates
//! short forecasts over valid neighbour support.
//!
//! Grounded on `original_source/sumo_ldl/correctDetector.py::polynomialFix`
//! and `find_gaps`.

use crate::record::{Attribute, DetectorRecord, Provenance, SchemaUnits};
use crate::window::{DetectorId, SlidingWindow};

/// Gaps larger than this are left unfilled (with a warning logged by the
/// caller).
pub const MAX_GAP_TIME_MINUTES: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillMode {
    /// Support is drawn only from before the gap (used at the right edge of
    /// the window, where no future data exists yet).
    Forecast,
    /// Support is drawn from both sides of the gap.
    Interpolation,
}

/// Outcome tally for one [`fill_gaps`] call.
#[derive(Debug, Default, Clone, Copy)]
pub struct FillStats {
    pub filled: usize,
    pub skipped_too_large: usize,
    pub skipped_insufficient_support: usize,
}

fn value_at(window: &SlidingWindow, detector: DetectorId, index: i64, attr: Attribute) -> Option<f64> {
    window.get(detector, index).and_then(|r| match attr {
        Attribute::QPkw => r.q_pkw,
        Attribute::QLkw => r.q_lkw,
        Attribute::VPkw => r.v_pkw,
        Attribute::VLkw => r.v_lkw,
    })
}

/// Maximal runs of null values for `attr` within `[start, end)`.
fn find_gaps(window: &SlidingWindow, detector: DetectorId, attr: Attribute, start: i64, end: i64) -> Vec<(i64, i64)> {
    let mut gaps = Vec::new();
    let mut gap_start: Option<i64> = None;
    for i in start..end {
        let missing = value_at(window, detector, i, attr).is_none();
        match (missing, gap_start) {
            (true, None) => gap_start = Some(i),
            (false, Some(s)) => {
                gaps.push((s, i));
                gap_start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = gap_start {
        gaps.push((s, end));
    }
    gaps
}

/// Least-squares degree-1 fit over `(index, value)` pairs. `None` if fewer
/// than two points are given.
fn fit_linear(points: &[(f64, f64)]) -> Option<(f64, f64)> {
    let n = points.len() as f64;
    if points.len() < 2 {
        return None;
    }
    let sum_x: f64 = points.iter().map(|(x, _)| x).sum();
    let sum_y: f64 = points.iter().map(|(_, y)| y).sum();
    let sum_xx: f64 = points.iter().map(|(x, _)| x * x).sum();
    let sum_xy: f64 = points.iter().map(|(x, y)| x * y).sum();
    let denom = n * sum_xx - sum_x * sum_x;
    if denom.abs() < f64::EPSILON {
        return None;
    }
    let slope = (n * sum_xy - sum_x * sum_y) / denom;
    let intercept = (sum_y - slope * sum_x) / n;
    Some((slope, intercept))
}

fn collect_support(window: &SlidingWindow, detector: DetectorId, attr: Attribute, from: i64, to: i64) -> Vec<(f64, f64)> {
    (from..to)
        .filter_map(|i| value_at(window, detector, i, attr).map(|v| (i as f64, v)))
        .collect()
}

/// Support for one gap under the forecast-mode shrinking-support algorithm:
/// start with `size = gap size`, looking at valid points in
/// `[gapStart - 2*size, gapStart)`; while there are fewer than `size` of
/// them, decrement `size` by one and retry with the narrower window. Once
/// the search stops, fewer than two support points means the gap cannot be
/// extrapolated at all; otherwise the (possibly shrunk) `size` and its
/// support are returned — the caller must only fill
/// `[gapStart, gapStart + size)`, not the original unshrunk gap.
fn forecast_support(window: &SlidingWindow, detector: DetectorId, attr: Attribute, gap_start: i64, gap_size: i64) -> Option<(i64, Vec<(f64, f64)>)> {
    let mut size = gap_size;
    let mut support = collect_support(window, detector, attr, gap_start - 2 * size, gap_start);
    while (support.len() as i64) < size && size > 0 {
        size -= 1;
        support = collect_support(window, detector, attr, gap_start - 2 * size, gap_start);
    }
    if support.len() < 2 {
        return None;
    }
    Some((size, support))
}

/// Support for one gap under the interpolation-mode dual-side algorithm:
/// require at least `ceil(size/2)` valid points strictly on each side.
fn interpolation_support(
    window: &SlidingWindow,
    detector: DetectorId,
    attr: Attribute,
    gap_start: i64,
    gap_end: i64,
    gap_size: i64,
) -> Option<Vec<(f64, f64)>> {
    let half = gap_size.div_ceil(2);
    let left = collect_support(window, detector, attr, gap_start - gap_size, gap_start);
    let right = collect_support(window, detector, attr, gap_end, gap_end + gap_size);
    if (left.len() as i64) < half || (right.len() as i64) < half {
        return None;
    }
    Some(left.into_iter().chain(right).collect())
}

/// Fills gaps for `attr` over `[start, end)` in the given mode. `unfix`s each
/// slot's `attr` first so previously-fitted values never serve as support,
/// then fits and commits through [`DetectorRecord::fix`], which re-runs the
/// error classifier and rejects illegal values.
pub fn fill_gaps(
    window: &mut SlidingWindow,
    detector: DetectorId,
    attr: Attribute,
    start: i64,
    end: i64,
    mode: FillMode,
    update_interval_secs: f64,
    units: SchemaUnits,
    new_record_provenance: Provenance,
) -> FillStats {
    for i in start..end {
        if let Some(Some(r)) = window.get_mut(detector, i) {
            if r.fixed_set.contains(&attr) {
                // unfix only this attribute's prior fit so other attributes' fits survive
                r.fixed_set.remove(&attr);
                match attr {
                    Attribute::QPkw => r.q_pkw = None,
                    Attribute::QLkw => r.q_lkw = None,
                    Attribute::VPkw => r.v_pkw = None,
                    Attribute::VLkw => r.v_lkw = None,
                }
                r.to_be_written = true;
            }
        }
    }

    let max_gap = (MAX_GAP_TIME_MINUTES * 60) as f64 / update_interval_secs;
    let mut stats = FillStats::default();
    for (gap_start, gap_end) in find_gaps(window, detector, attr, start, end) {
        let gap_size = gap_end - gap_start;
        if gap_size as f64 > max_gap {
            log::warn!("gap of {gap_size} slots for attribute {attr:?} exceeds MAX_GAP_TIME, skipping");
            stats.skipped_too_large += 1;
            continue;
        }
        let (fill_end, support) = match mode {
            FillMode::Forecast => match forecast_support(window, detector, attr, gap_start, gap_size) {
                Some((size, support)) => (gap_start + size, support),
                None => {
                    stats.skipped_insufficient_support += 1;
                    continue;
                }
            },
            FillMode::Interpolation => match interpolation_support(window, detector, attr, gap_start, gap_end, gap_size) {
                Some(support) => (gap_end, support),
                None => {
                    stats.skipped_insufficient_support += 1;
                    continue;
                }
            },
        };
        let Some((slope, intercept)) = fit_linear(&support) else {
            stats.skipped_insufficient_support += 1;
            continue;
        };
        for i in gap_start..fill_end {
            let value = slope * i as f64 + intercept;
            if window.get(detector, i).is_none() {
                window.set(detector, crate::time_index::time_at(i, window.zero_index_time, window.update_interval), DetectorRecord::empty(new_record_provenance));
            }
            if let Some(Some(r)) = window.get_mut(detector, i) {
                if r.fix(attr, value, units) {
                    stats.filled += 1;
                }
            }
        }
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Provenance;
    use crate::time_index::time_at;
    use chrono::{Duration, NaiveDate};

    fn units() -> SchemaUnits {
        SchemaUnits {
            kmh_multiplier: 3.6,
            max_lane_speed: 130.0,
            update_interval_secs: 60.0,
        }
    }

    fn setup(values: &[Option<f64>]) -> SlidingWindow {
        let zero = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap();
        let mut w = SlidingWindow::new(Duration::minutes(1), zero);
        w.reset(zero, &[1]);
        w.advance(zero, time_at(values.len() as i64, zero, Duration::minutes(1)));
        for (i, v) in values.iter().enumerate() {
            if let Some(v) = v {
                let mut r = DetectorRecord::empty(Provenance::Real(1));
                r.q_pkw = Some(*v); // raw ingestion sets the field directly, not via fix()
                w.set(1, time_at(i as i64, zero, Duration::minutes(1)), r);
            }
        }
        w
    }

    #[test]
    fn interpolates_linear_gap() {
        let values = [Some(500.0), Some(510.0), Some(520.0), None, None, None, Some(560.0), Some(570.0), Some(580.0), Some(590.0)];
        let mut w = setup(&values);
        let stats = fill_gaps(&mut w, 1, Attribute::QPkw, 0, 10, FillMode::Interpolation, 60.0, units(), Provenance::NoOrig);
        assert_eq!(stats.filled, 3);
        let v3 = w.get(1, 3).unwrap().q_pkw.unwrap();
        let v4 = w.get(1, 4).unwrap().q_pkw.unwrap();
        let v5 = w.get(1, 5).unwrap().q_pkw.unwrap();
        assert!((v3 - 530.0).abs() < 1e-6, "{v3}");
        assert!((v4 - 540.0).abs() < 1e-6, "{v4}");
        assert!((v5 - 550.0).abs() < 1e-6, "{v5}");
    }

    #[test]
    fn forecast_uses_shrinking_support_window() {
        // gap size 2 at the right edge; exactly enough support in [gapStart-2*size, gapStart).
        let values = [None, None, None, None, None, Some(100.0), Some(110.0), None, None];
        let mut w = setup(&values);
        let stats = fill_gaps(&mut w, 1, Attribute::QPkw, 7, 9, FillMode::Forecast, 60.0, units(), Provenance::Forecast);
        assert_eq!(stats.filled, 2);
        let v7 = w.get(1, 7).unwrap().q_pkw.unwrap();
        let v8 = w.get(1, 8).unwrap().q_pkw.unwrap();
        assert!((v7 - 120.0).abs() < 1e-6, "{v7}");
        assert!((v8 - 130.0).abs() < 1e-6, "{v8}");
    }

    #[test]
    fn forecast_abandons_when_support_never_reaches_size() {
        // gap size 4; even after shrinking to size 2 there is only 1 valid point.
        let values = [None, None, None, None, None, Some(100.0), None, None, None, None];
        let mut w = setup(&values);
        let stats = fill_gaps(&mut w, 1, Attribute::QPkw, 6, 10, FillMode::Forecast, 60.0, units(), Provenance::Forecast);
        assert_eq!(stats.filled, 0);
        assert_eq!(stats.skipped_insufficient_support, 1);
    }

    #[test]
    fn forecast_truncates_gap_when_support_shrinks() {
        // gap size 4 (indices 6..10) with only 2 support points, found once
        // `size` has shrunk to 2: the filled region truncates to
        // [gapStart, gapStart + size) = [6, 8), leaving 8 and 9 null.
        let values = [None, None, Some(100.0), Some(110.0), None, None, None, None, None, None];
        let mut w = setup(&values);
        let stats = fill_gaps(&mut w, 1, Attribute::QPkw, 6, 10, FillMode::Forecast, 60.0, units(), Provenance::Forecast);
        assert_eq!(stats.filled, 2);
        let v6 = w.get(1, 6).unwrap().q_pkw.unwrap();
        let v7 = w.get(1, 7).unwrap().q_pkw.unwrap();
        assert!((v6 - 140.0).abs() < 1e-6, "{v6}");
        assert!((v7 - 150.0).abs() < 1e-6, "{v7}");
        assert!(w.get(1, 8).is_none());
        assert!(w.get(1, 9).is_none());
    }

    #[test]
    fn gap_too_large_is_skipped() {
        let mut values = vec![Some(100.0)];
        values.extend(std::iter::repeat(None).take(40));
        values.push(Some(200.0));
        let mut w = setup(&values);
        let stats = fill_gaps(&mut w, 1, Attribute::QPkw, 0, values.len() as i64, FillMode::Interpolation, 60.0, units(), Provenance::NoOrig);
        assert_eq!(stats.filled, 0);
        assert_eq!(stats.skipped_too_large, 1);
    }
}
