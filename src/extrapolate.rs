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
//! Historic-periodicity extrapolator: same-weekday smoothing plus additive
//! feedback correction from the last known error, and GEH-based
//! self-assessment of prediction quality.
//!
//! Grounded on `original_source/sumoldl/extrapolation.py`
//! (`smooth_predictor`, `feedback_predictor_absolute`, `estimate_quality`).

use std::collections::HashMap;

use chrono::{Duration, NaiveDateTime};

use crate::geh::{geh, geh_to_quality};
use crate::record::{Attribute, DetectorRecord, Provenance, SchemaUnits};
use crate::time_index::interval_ends_between;

/// Symmetrical width (in update-interval steps) of the smoothing range
/// around each same-weekday offset.
pub const SMOOTHING_WIDTH: i64 = 2;
/// How many weeks back the periodicity predictor looks.
pub const WEEK_OFFSETS: [i64; 3] = [1, 2, 3];
/// Maximum number of recent known slots used to self-assess quality.
pub const VALIDATION_WIDTH: i64 = 3;

/// A bare `(flow, speed)` historical sample, keyed externally by time.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sample {
    pub flow: Option<f64>,
    pub speed: Option<f64>,
}

fn safe_avg(values: impl Iterator<Item = Option<f64>>) -> Option<f64> {
    let actual: Vec<f64> = values.flatten().collect();
    if actual.is_empty() {
        None
    } else {
        Some(actual.iter().sum::<f64>() / actual.len() as f64)
    }
}

/// One edge's full time-indexed history, as needed by the predictors.
pub struct History<'a> {
    pub samples: &'a HashMap<NaiveDateTime, Sample>,
    pub update_interval: Duration,
}

/// Primary predictor: average over `{t - (7*w + k)*updateInterval : w in
/// WEEK_OFFSETS, k in [-SMOOTHING_WIDTH, SMOOTHING_WIDTH]}` of available
/// historical values, independently per attribute, null-tolerant.
pub fn primary_predict(history: &History, time: NaiveDateTime) -> Sample {
    let offsets: Vec<Duration> = WEEK_OFFSETS
        .iter()
        .flat_map(|&w| {
            (-SMOOTHING_WIDTH..=SMOOTHING_WIDTH).map(move |k| Duration::days(7 * w) + history.update_interval * k as i32)
        })
        .collect();
    let values: Vec<Option<Sample>> = offsets.iter().map(|o| history.samples.get(&(time - *o)).copied()).collect();
    Sample {
        flow: safe_avg(values.iter().map(|v| v.and_then(|s| s.flow))),
        speed: safe_avg(values.iter().map(|v| v.and_then(|s| s.speed))),
    }
}

/// Additive feedback correction: `measured(knownTime) - primary(knownTime)`
/// per attribute, `None` if the known measurement itself is absent.
fn feedback_correction(history: &History, known_time: NaiveDateTime) -> Option<(Option<f64>, Option<f64>)> {
    let known = history.samples.get(&known_time)?;
    let primary = primary_predict(history, known_time);
    let d_flow = match (known.flow, primary.flow) {
        (Some(a), Some(b)) => Some(a - b),
        _ => None,
    };
    let d_speed = match (known.speed, primary.speed) {
        (Some(a), Some(b)) => Some(a - b),
        _ => None,
    };
    Some((d_flow, d_speed))
}

/// Feedback predictor: `primary(t) + delta`, each attribute independently
/// validated through the record fix discipline (rejecting values that would
/// reintroduce a classifier error) before being returned.
pub fn feedback_predict(history: &History, time: NaiveDateTime, known_time: NaiveDateTime, units: SchemaUnits) -> Sample {
    let primary = primary_predict(history, time);
    let (d_flow, d_speed) = feedback_correction(history, known_time).unwrap_or((None, None));

    let mut probe = DetectorRecord::empty(Provenance::Forecast);
    let flow = match (primary.flow, d_flow) {
        (Some(p), Some(d)) if probe.fix(Attribute::QPkw, p + d, units) => probe.q_pkw,
        _ => None,
    };
    let speed = match (primary.speed, d_speed) {
        (Some(p), Some(d)) if flow.is_some() && probe.fix(Attribute::VPkw, p + d, units) => probe.v_pkw,
        _ => None,
    };
    Sample { flow, speed }
}

/// `pred_quality_at_time`: prefers flow-based GEH (scaled to veh/h) over
/// speed-based pseudo-GEH (`value*100`) when both a measurement and a
/// prediction exist for that attribute.
fn pred_quality_at_time(measured: Sample, predicted: Sample, flow_scale: f64) -> Option<f64> {
    match (measured.flow, predicted.flow) {
        (Some(m), Some(p)) => Some(geh_to_quality(geh(m * flow_scale, p * flow_scale))),
        _ => match (measured.speed, predicted.speed) {
            (Some(m), Some(p)) => Some(geh_to_quality(geh(m * 100.0, p * 100.0))),
            _ => None,
        },
    }
}

/// Per-edge quality: mean GEH-derived quality over the `VALIDATION_WIDTH`
/// most recent known slots before `last_known`; `-1` if undefined (no
/// comparable slot had both a measurement and a prediction).
pub fn estimate_quality(history: &History, last_known: NaiveDateTime, flow_scale: f64, units: SchemaUnits) -> f64 {
    let times = interval_ends_between(last_known - history.update_interval * VALIDATION_WIDTH as i32, last_known, history.update_interval);
    let samples: Vec<f64> = times
        .into_iter()
        .filter_map(|t| {
            let measured = history.samples.get(&t)?;
            let predicted = feedback_predict(history, t, last_known - history.update_interval, units);
            pred_quality_at_time(*measured, predicted, flow_scale)
        })
        .collect();
    if samples.is_empty() {
        -1.0
    } else {
        samples.iter().sum::<f64>() / samples.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn units() -> SchemaUnits {
        SchemaUnits { kmh_multiplier: 3.6, max_lane_speed: 250.0, update_interval_secs: 300.0 }
    }

    fn dt(day: u32, h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 7, day).unwrap().and_hms_opt(h, 0, 0).unwrap()
    }

    #[test]
    fn feedback_applies_additive_correction_from_last_known_error() {
        // spec.md §8 scenario 5: 3 weeks at t: 800, 820, 780 (avg 800);
        // last-known measurement t-Δ is 900, primary predicts 810 there
        // (so those three weekday history points at t-Δ must avg to 810).
        // Hourly update interval so the fix-discipline's MAX_FLOW check
        // (2500 veh/h) does not reject these already-per-hour sample values.
        let units = SchemaUnits { kmh_multiplier: 3.6, max_lane_speed: 250.0, update_interval_secs: 3600.0 };
        let interval = Duration::hours(1);
        let t = dt(27, 12); // a Monday, arbitrary reference
        let known_time = t - interval;

        let mut samples = HashMap::new();
        samples.insert(t - Duration::days(7), Sample { flow: Some(800.0), speed: None });
        samples.insert(t - Duration::days(14), Sample { flow: Some(820.0), speed: None });
        samples.insert(t - Duration::days(21), Sample { flow: Some(780.0), speed: None });
        samples.insert(known_time - Duration::days(7), Sample { flow: Some(800.0), speed: None });
        samples.insert(known_time - Duration::days(14), Sample { flow: Some(820.0), speed: None });
        samples.insert(known_time - Duration::days(21), Sample { flow: Some(810.0), speed: None });
        samples.insert(known_time, Sample { flow: Some(900.0), speed: None });

        let history = History { samples: &samples, update_interval: interval };
        let primary_at_known = primary_predict(&history, known_time);
        assert!((primary_at_known.flow.unwrap() - 810.0).abs() < 1e-9);

        let forecast = feedback_predict(&history, t, known_time, units);
        // primary(t) = 800, delta = 900 - 810 = 90 -> 890
        assert!((forecast.flow.unwrap() - 890.0).abs() < 1e-6, "{:?}", forecast.flow);
    }

    #[test]
    fn geh_quality_is_perfect_for_exact_match() {
        let interval = Duration::minutes(5);
        let t = dt(27, 12);
        let mut samples = HashMap::new();
        for w in 1..=3 {
            samples.insert(t - Duration::days(7 * w), Sample { flow: Some(100.0), speed: None });
        }
        samples.insert(t, Sample { flow: Some(100.0), speed: None });
        let history = History { samples: &samples, update_interval: interval };
        let q = estimate_quality(&history, t + interval, 12.0, units());
        assert!(q >= 0.0);
    }

    #[test]
    fn quality_is_negative_one_when_undefined() {
        let interval = Duration::minutes(5);
        let samples = HashMap::new();
        let history = History { samples: &samples, update_interval: interval };
        let q = estimate_quality(&history, dt(27, 12), 12.0, units());
        assert_eq!(q, -1.0);
    }
}
