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
//! Detector data record: a cell holding flow/speed for PKW and LKW, provenance,
//! per-attribute error/fix status, and the record's `fix`/`unfix` discipline.
//!
//! Grounded on `original_source/sumo_ldl/evalDetector.py` (class `Data`):
//! `fix`, `unfix`, `check`, `set_hanging`, `_getQuality`.

use std::collections::HashSet;

use chrono::NaiveDateTime;

use crate::classify::{self, ErrorCode, VehicleClass};

/// The source of a record's original (pre-correction) values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    /// A real raw source id, as reported by the DB.
    Real(i64),
    /// The slot was synthesized by the gap filler (interpolation).
    NoOrig,
    /// The slot was synthesized by the gap filler (forecast).
    Forecast,
}

/// One of the four correctable attributes of a [`DetectorRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Attribute {
    QPkw,
    QLkw,
    VPkw,
    VLkw,
}

impl Attribute {
    fn class(self) -> VehicleClass {
        match self {
            Attribute::QPkw | Attribute::VPkw => VehicleClass::Pkw,
            Attribute::QLkw | Attribute::VLkw => VehicleClass::Lkw,
        }
    }

    fn is_flow(self) -> bool {
        matches!(self, Attribute::QPkw | Attribute::QLkw)
    }
}

/// Schema-dependent constants needed to evaluate the fix discipline; these
/// vary per deployment region (spec design note), so they are threaded
/// through rather than hard-coded.
#[derive(Debug, Clone, Copy)]
pub struct SchemaUnits {
    /// Converts the schema's native speed unit to km/h (1.0 if already km/h,
    /// 3.6 if m/s).
    pub kmh_multiplier: f64,
    /// Maximum lane speed used by the `AboveMaxLaneSpeed` predicate.
    pub max_lane_speed: f64,
    /// Length of the update interval, in seconds.
    pub update_interval_secs: f64,
}

/// A single detector reading at one quantized time slot.
///
/// Invariant: when `fixed_set` contains a speed attribute, the corresponding
/// flow attribute is `Some`; when a flow attribute is null, the paired speed
/// attribute is also null.
#[derive(Debug, Clone)]
pub struct DetectorRecord {
    pub orig_id: Provenance,
    pub orig_timestamp: Option<NaiveDateTime>,
    /// When the row was written to the backing store, if the store tracks
    /// it — used by the operating-status `delay` measure (spec.md §4.5 step
    /// 2: "average (db_entry_time - data_time) over the window when
    /// available"). `None` for freshly-ingested/gap-filled rows and for any
    /// backing store that doesn't track entry time.
    pub db_entry_time: Option<NaiveDateTime>,
    pub q_pkw: Option<f64>,
    pub q_lkw: Option<f64>,
    pub v_pkw: Option<f64>,
    pub v_lkw: Option<f64>,
    pub error_pkw: Option<ErrorCode>,
    pub error_lkw: Option<ErrorCode>,
    pub fixed_set: HashSet<Attribute>,
    pub to_be_written: bool,
}

impl DetectorRecord {
    pub fn empty(orig_id: Provenance) -> Self {
        DetectorRecord {
            orig_id,
            orig_timestamp: None,
            db_entry_time: None,
            q_pkw: None,
            q_lkw: None,
            v_pkw: None,
            v_lkw: None,
            error_pkw: None,
            error_lkw: None,
            fixed_set: HashSet::new(),
            to_be_written: false,
        }
    }

    fn get(&self, attr: Attribute) -> Option<f64> {
        match attr {
            Attribute::QPkw => self.q_pkw,
            Attribute::QLkw => self.q_lkw,
            Attribute::VPkw => self.v_pkw,
            Attribute::VLkw => self.v_lkw,
        }
    }

    fn set(&mut self, attr: Attribute, value: Option<f64>) {
        match attr {
            Attribute::QPkw => self.q_pkw = value,
            Attribute::QLkw => self.q_lkw = value,
            Attribute::VPkw => self.v_pkw = value,
            Attribute::VLkw => self.v_lkw = value,
        }
    }

    fn flow_of(attr: Attribute) -> Attribute {
        match attr {
            Attribute::VPkw => Attribute::QPkw,
            Attribute::VLkw => Attribute::QLkw,
            other => other,
        }
    }

    /// Returns the attribute's current value unless it was set by the gap
    /// filler (i.e. is in `fixed_set`) — used by the hanging-detector check,
    /// which must compare only genuinely-measured values.
    pub fn get_if_not_fixed(&self, attr: Attribute) -> Option<f64> {
        if self.fixed_set.contains(&attr) {
            None
        } else {
            self.get(attr)
        }
    }

    /// Attempts to assign `value` to `attr`, re-validating per §4.4's
    /// per-attribute legality. Returns `true` and commits the change (marking
    /// `attr` fixed and the record `to_be_written`) iff the assignment is
    /// legal; otherwise leaves the record untouched.
    pub fn fix(&mut self, attr: Attribute, value: f64, units: SchemaUnits) -> bool {
        let ok = if attr.is_flow() {
            value >= 0.0 && value * 3600.0 / units.update_interval_secs <= classify::MAX_FLOW
        } else {
            let flow_attr = Self::flow_of(attr);
            match self.get(flow_attr) {
                None => false,
                Some(flow) if flow == 0.0 => value == 0.0,
                Some(flow) => {
                    classify::classify_speed(
                        flow,
                        value,
                        attr.class(),
                        units.kmh_multiplier,
                        units.update_interval_secs,
                        units.max_lane_speed,
                    )
                    .is_none()
                }
            }
        };
        if ok {
            self.set(attr, Some(value));
            self.fixed_set.insert(attr);
            self.to_be_written = true;
        }
        ok
    }

    /// Clears every attribute ever committed by [`Self::fix`], so a later
    /// re-filling pass never uses previously-fitted values as support.
    pub fn unfix(&mut self) {
        for attr in self.fixed_set.drain().collect::<Vec<_>>() {
            self.set(attr, None);
        }
        self.to_be_written = true;
    }

    /// Runs the stateless error classifier against the current PKW/LKW
    /// flow-speed pairs and nulls the offending attributes. `haslkw = false`
    /// skips LKW classification entirely (treated as zero, per §4.2).
    pub fn check(&mut self, units: SchemaUnits, haslkw: bool) {
        if let Some(err) = classify::classify(self.q_pkw, self.v_pkw, VehicleClass::Pkw, units.kmh_multiplier, units.update_interval_secs, units.max_lane_speed) {
            self.error_pkw = Some(err);
            if err.is_flow_affecting() {
                self.q_pkw = None;
            }
            self.v_pkw = None;
        }
        if haslkw {
            if let Some(err) = classify::classify(self.q_lkw, self.v_lkw, VehicleClass::Lkw, units.kmh_multiplier, units.update_interval_secs, units.max_lane_speed) {
                self.error_lkw = Some(err);
                if err.is_flow_affecting() {
                    self.q_lkw = None;
                }
                self.v_lkw = None;
            }
        } else {
            self.q_lkw = None;
            self.v_lkw = None;
        }
    }

    /// Marks the record as a "hanging detector" (error code 4): nulls all
    /// four attributes. Called by the corrector once it has detected five
    /// repeats of the same unfixed tuple.
    pub fn set_hanging(&mut self) {
        self.error_pkw = Some(ErrorCode::Hanging);
        self.error_lkw = Some(ErrorCode::Hanging);
        self.q_pkw = None;
        self.q_lkw = None;
        self.v_pkw = None;
        self.v_lkw = None;
    }

    /// Per-attribute quality weight used by both the hanging-detector check
    /// and the operating-status scoring pass, pinned from
    /// `evalDetector.py::_ATTRIBUTE_QUALITY[_NO_LKW]`.
    fn attribute_weight(attr: Attribute, haslkw: bool) -> u32 {
        match (attr, haslkw) {
            (Attribute::QPkw, true) => 70,
            (Attribute::QLkw, true) => 10,
            (Attribute::VPkw, true) => 10,
            (Attribute::VLkw, true) => 8,
            (Attribute::QPkw, false) => 80,
            (Attribute::QLkw, false) => 0,
            (Attribute::VPkw, false) => 18,
            (Attribute::VLkw, false) => 0,
        }
    }

    /// Quality bits for this record: points for every present attribute
    /// (halved if it was fixed by the gap filler) plus 2 points if the
    /// original timestamp lines up exactly with the slot's canonical time.
    pub fn quality(&self, slot_time: NaiveDateTime, haslkw: bool) -> u32 {
        let mut total = 0u32;
        for attr in [Attribute::QPkw, Attribute::QLkw, Attribute::VPkw, Attribute::VLkw] {
            if self.get(attr).is_some() {
                let w = Self::attribute_weight(attr, haslkw);
                total += if self.fixed_set.contains(&attr) { w / 2 } else { w };
            }
        }
        if self.orig_timestamp == Some(slot_time) {
            total += 2;
        }
        total
    }
}

/// Sum of all per-attribute quality weights plus the date bonus, i.e. the
/// maximum value [`DetectorRecord::quality`] can return — the denominator
/// used to turn raw quality points into a percentage (operating-status
/// scoring and loop aggregation's per-group quality weighting alike).
pub fn max_quality_points(haslkw: bool) -> u32 {
    if haslkw { 70 + 10 + 10 + 8 + 2 } else { 80 + 18 + 2 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn units() -> SchemaUnits {
        SchemaUnits {
            kmh_multiplier: 3.6,
            max_lane_speed: 130.0,
            update_interval_secs: 60.0,
        }
    }

    #[test]
    fn fix_rejects_negative_flow() {
        let mut r = DetectorRecord::empty(Provenance::NoOrig);
        assert!(!r.fix(Attribute::QPkw, -1.0, units()));
        assert!(r.q_pkw.is_none());
    }

    #[test]
    fn fix_speed_requires_known_flow() {
        let mut r = DetectorRecord::empty(Provenance::NoOrig);
        assert!(!r.fix(Attribute::VPkw, 80.0, units()));
        assert!(r.fix(Attribute::QPkw, 10.0, units()));
        assert!(r.fix(Attribute::VPkw, 80.0, units()));
        assert_eq!(r.v_pkw, Some(80.0));
    }

    #[test]
    fn fix_speed_zero_flow_requires_zero_speed() {
        let mut r = DetectorRecord::empty(Provenance::NoOrig);
        assert!(r.fix(Attribute::QPkw, 0.0, units()));
        assert!(!r.fix(Attribute::VPkw, 10.0, units()));
        assert!(r.fix(Attribute::VPkw, 0.0, units()));
    }

    #[test]
    fn unfix_clears_only_fixed_attributes() {
        let mut r = DetectorRecord::empty(Provenance::Real(1));
        r.q_pkw = Some(10.0); // genuinely measured, not fixed
        assert!(r.fix(Attribute::VPkw, 80.0, units()));
        r.unfix();
        assert_eq!(r.v_pkw, None);
        assert_eq!(r.q_pkw, Some(10.0));
        assert!(r.fixed_set.is_empty());
    }

    #[test]
    fn set_hanging_nulls_everything() {
        let mut r = DetectorRecord::empty(Provenance::Real(1));
        r.q_pkw = Some(100.0);
        r.v_pkw = Some(60.0);
        r.set_hanging();
        assert!(r.q_pkw.is_none() && r.v_pkw.is_none());
        assert_eq!(r.error_pkw, Some(ErrorCode::Hanging));
    }

    #[test]
    fn quality_halves_for_fixed_attributes() {
        let d = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap();
        let mut r = DetectorRecord::empty(Provenance::Real(1));
        r.orig_timestamp = Some(d);
        r.q_pkw = Some(10.0);
        assert_eq!(r.quality(d, true), 70 + 2);
        r.fixed_set.insert(Attribute::QPkw);
        assert_eq!(r.quality(d, true), 35 + 2);
    }
}
