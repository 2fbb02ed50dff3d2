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
//! Stateless error classifier: maps a raw `(q, v)` pair to one of a fixed set
//! of error kinds. Grounded on
//! `original_source/sumo_ldl/evalDetector.py` (`_getDataError`,
//! `_getSpeedError`, `maxFlowPerHour`).
//!
//! Error codes are a small closed set of tagged reasons, not magic integers
//! (spec design note): the public contract is which attributes get nulled
//! and what the fix-discipline rejects, not the historic numeric codes.

/// Vehicle class a flow/speed pair belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VehicleClass {
    Pkw,
    Lkw,
}

impl VehicleClass {
    /// Nominal vehicle length in meters, used by [`max_flow_per_hour`].
    pub fn length_m(self) -> f64 {
        match self {
            VehicleClass::Pkw => 5.0,
            VehicleClass::Lkw => 10.0,
        }
    }

    /// Maximum plausible speed in the schema's speed unit.
    pub fn max_speed(self) -> f64 {
        match self {
            VehicleClass::Pkw => 250.0,
            VehicleClass::Lkw => 120.0,
        }
    }
}

/// Upper bound on plausible total flow (veh/h), independent of vehicle class.
pub const MAX_FLOW: f64 = 2500.0;

/// A small closed set of tagged error reasons. Historic numeric codes (kept
/// only in doc comments for cross-reference to the original system) are 1, 2,
/// 5, 7, 8 (flow-affecting), 6, 9 (speed-affecting) and 4 (hanging detector).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// 1: flow is null.
    FlowMissing,
    /// 2: flow or speed is negative.
    Negative,
    /// 5: speed positive but flow zero.
    SpeedWithoutFlow,
    /// 7: hourly flow exceeds [`MAX_FLOW`], or speed exceeds the vehicle
    /// class's plausible maximum.
    ImplausibleFlowOrSpeed,
    /// 8: hourly flow exceeds the road-capacity bound from
    /// [`max_flow_per_hour`].
    AboveCapacity,
    /// 6: flow positive but speed zero.
    FlowWithoutSpeed,
    /// 9: speed exceeds 1.25x the max lane speed.
    AboveMaxLaneSpeed,
    /// 4: the same (unfixed) attribute tuple repeated across the last five
    /// slots.
    Hanging,
}

impl ErrorCode {
    /// Whether this error nulls both flow and speed for the attribute pair
    /// it was raised against (flow-affecting) as opposed to only speed
    /// (speed-affecting). `Hanging` nulls all four attributes and is handled
    /// separately by the corrector.
    pub fn is_flow_affecting(self) -> bool {
        matches!(
            self,
            ErrorCode::FlowMissing
                | ErrorCode::Negative
                | ErrorCode::SpeedWithoutFlow
                | ErrorCode::ImplausibleFlowOrSpeed
                | ErrorCode::AboveCapacity
        )
    }
}

/// `v*3600 / (v*kmhMultiplier*0.4 + l)`: the road-capacity bound on hourly
/// flow given an observed speed `v` (schema speed unit) and vehicle length
/// `l` (meters). `kmh_multiplier` converts the schema's speed unit to km/h
/// (`1.0` if already km/h, `3.6` if m/s) — a schema/region parameter, not a
/// constant, per the spec's design note on region-dependent scaling.
pub fn max_flow_per_hour(v: f64, vehicle_len_m: f64, kmh_multiplier: f64) -> f64 {
    v * 3600.0 / (v * kmh_multiplier * 0.4 + vehicle_len_m)
}

/// Classifies a raw `(q, v)` reading, returning the first applicable error in
/// priority order matching the original's `_getDataError`/`_getSpeedError`:
/// the flow-affecting predicates (1, 2, 5, 7, 8) run first; only once none of
/// those fire does the speed-only pair (6, 9) get checked, mirroring
/// `Data.check`'s two-phase structure (`_getDataError` then `_getSpeedError`
/// only when the first raised nothing). `q` is the interval vehicle count,
/// `v` the average speed in the schema's speed unit; both may be absent
/// (already null). `max_lane_speed` is the ceiling used by error 9.
pub fn classify(
    q: Option<f64>,
    v: Option<f64>,
    class: VehicleClass,
    kmh_multiplier: f64,
    update_interval_secs: f64,
    max_lane_speed: f64,
) -> Option<ErrorCode> {
    let Some(qv) = q else {
        return Some(ErrorCode::FlowMissing);
    };
    if qv < 0.0 || v.is_some_and(|v| v < 0.0) {
        return Some(ErrorCode::Negative);
    }
    if let Some(vv) = v {
        if vv > 0.0 && qv == 0.0 {
            return Some(ErrorCode::SpeedWithoutFlow);
        }
    }
    let hourly = qv * 3600.0 / update_interval_secs;
    if hourly > MAX_FLOW || v.is_some_and(|v| v > class.max_speed()) {
        return Some(ErrorCode::ImplausibleFlowOrSpeed);
    }
    if let Some(vv) = v {
        if vv > 0.0 && hourly > max_flow_per_hour(vv, class.length_m(), kmh_multiplier) {
            return Some(ErrorCode::AboveCapacity);
        }
    }
    if let Some(vv) = v {
        if qv > 0.0 && vv == 0.0 {
            return Some(ErrorCode::FlowWithoutSpeed);
        }
        if max_lane_speed > 0.0 && vv / max_lane_speed > 1.25 {
            return Some(ErrorCode::AboveMaxLaneSpeed);
        }
    }
    None
}

/// Speed-only classification used by the fix discipline when a flow value is
/// already known and only the speed attribute is being validated.
pub fn classify_speed(
    q: f64,
    v: f64,
    class: VehicleClass,
    kmh_multiplier: f64,
    update_interval_secs: f64,
    max_lane_speed: f64,
) -> Option<ErrorCode> {
    if q > 0.0 && v == 0.0 {
        return Some(ErrorCode::FlowWithoutSpeed);
    }
    if max_lane_speed > 0.0 && v / max_lane_speed > 1.25 {
        return Some(ErrorCode::AboveMaxLaneSpeed);
    }
    let hourly = q * 3600.0 / update_interval_secs;
    if v > 0.0 && hourly > max_flow_per_hour(v, class.length_m(), kmh_multiplier) {
        return Some(ErrorCode::AboveCapacity);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_flow_is_error_1() {
        assert_eq!(
            classify(None, Some(50.0), VehicleClass::Pkw, 3.6, 60.0, 250.0),
            Some(ErrorCode::FlowMissing)
        );
    }

    #[test]
    fn negative_values_are_error_2() {
        assert_eq!(
            classify(Some(-1.0), Some(50.0), VehicleClass::Pkw, 3.6, 60.0, 250.0),
            Some(ErrorCode::Negative)
        );
    }

    #[test]
    fn speed_without_flow_is_error_5() {
        assert_eq!(
            classify(Some(0.0), Some(10.0), VehicleClass::Pkw, 3.6, 60.0, 250.0),
            Some(ErrorCode::SpeedWithoutFlow)
        );
    }

    #[test]
    fn clean_reading_has_no_error() {
        assert_eq!(classify(Some(10.0), Some(80.0), VehicleClass::Pkw, 3.6, 60.0, 250.0), None);
    }

    #[test]
    fn excessive_hourly_flow_is_error_7() {
        // 200 vehicles in 60s => 12000 veh/h, far above MAX_FLOW.
        assert_eq!(
            classify(Some(200.0), Some(80.0), VehicleClass::Pkw, 3.6, 60.0, 250.0),
            Some(ErrorCode::ImplausibleFlowOrSpeed)
        );
    }

    #[test]
    fn above_max_lane_speed_is_error_9_on_the_raw_path() {
        // v=200 is below the 250 km/h PKW cap (error 7) but above
        // maxLaneSpeed(120)*1.25=150, so only the raw ingestion path's
        // max_lane_speed parameter can catch it.
        assert_eq!(
            classify(Some(10.0), Some(200.0), VehicleClass::Pkw, 3.6, 60.0, 120.0),
            Some(ErrorCode::AboveMaxLaneSpeed)
        );
    }
}
