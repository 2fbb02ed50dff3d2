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
//! Sliding data window: per-update-interval store mapping detector id to a
//! dense array of records indexed by quantized time.
//!
//! This is an arena-with-indices (spec design note), not a graph of linked
//! records: a record references nothing, "ownership" of a slot is the array
//! position, and deletion on advance is overwrite-with-null. Grounded on the
//! `DataWindow` class of
//! `original_source/sumo_ldl/correctDetector.py`.

use std::collections::HashMap;

use chrono::{Duration, NaiveDateTime};

use crate::record::DetectorRecord;
use crate::time_index::idx;

pub type DetectorId = i64;

/// Per-update-interval sliding store. All arrays share `zero_index_time` and
/// length; there are no gaps in indexing.
pub struct SlidingWindow {
    pub update_interval: Duration,
    pub zero_index_time: NaiveDateTime,
    arrays: HashMap<DetectorId, Vec<Option<DetectorRecord>>>,
}

impl SlidingWindow {
    pub fn new(update_interval: Duration, zero_index_time: NaiveDateTime) -> Self {
        SlidingWindow {
            update_interval,
            zero_index_time,
            arrays: HashMap::new(),
        }
    }

    /// Clears all detector arrays and (re-)seeds them as empty for the given
    /// detector id set, anchoring the window at `zero_index_time`.
    pub fn reset(&mut self, zero_index_time: NaiveDateTime, detector_ids: &[DetectorId]) {
        self.zero_index_time = zero_index_time;
        self.arrays.clear();
        for &id in detector_ids {
            self.arrays.insert(id, Vec::new());
        }
    }

    fn len_for(&self, end_time: NaiveDateTime) -> usize {
        idx(end_time, self.zero_index_time, self.update_interval).max(0) as usize
    }

    /// Drops entries before `new_zero_time`, preserves entries in
    /// `[new_zero_time, end_time)`, extends with nulls up to `idx(end_time)`.
    ///
    /// Precondition: `new_zero_time >= zero_index_time`.
    pub fn advance(&mut self, new_zero_time: NaiveDateTime, end_time: NaiveDateTime) {
        assert!(new_zero_time >= self.zero_index_time);
        let drop = idx(new_zero_time, self.zero_index_time, self.update_interval).max(0) as usize;
        let old_zero = self.zero_index_time;
        self.zero_index_time = new_zero_time;
        let new_len = self.len_for(end_time);
        for arr in self.arrays.values_mut() {
            if drop >= arr.len() {
                arr.clear();
            } else {
                arr.drain(..drop);
            }
            if arr.len() < new_len {
                arr.resize_with(new_len, || None);
            } else {
                arr.truncate(new_len);
            }
        }
        let _ = old_zero;
    }

    /// Index of `t` relative to `zero_index_time`; may exceed the current
    /// array length. Caller must range-check before indexing.
    pub fn index_of(&self, t: NaiveDateTime) -> i64 {
        idx(t, self.zero_index_time, self.update_interval)
    }

    pub fn detector_ids(&self) -> impl Iterator<Item = DetectorId> + '_ {
        self.arrays.keys().copied()
    }

    pub fn len(&self, detector: DetectorId) -> usize {
        self.arrays.get(&detector).map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.arrays.values().all(Vec::is_empty)
    }

    pub fn get(&self, detector: DetectorId, index: i64) -> Option<&DetectorRecord> {
        if index < 0 {
            return None;
        }
        self.arrays
            .get(&detector)
            .and_then(|arr| arr.get(index as usize))
            .and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, detector: DetectorId, index: i64) -> Option<&mut Option<DetectorRecord>> {
        if index < 0 {
            return None;
        }
        self.arrays.get_mut(&detector).and_then(|arr| arr.get_mut(index as usize))
    }

    /// Places `record` at the slot for `t`, growing the array with nulls if
    /// necessary. No-op if `t` precedes `zero_index_time`.
    pub fn set(&mut self, detector: DetectorId, t: NaiveDateTime, record: DetectorRecord) {
        let index = self.index_of(t);
        if index < 0 {
            return;
        }
        let arr = self.arrays.entry(detector).or_default();
        let index = index as usize;
        if arr.len() <= index {
            arr.resize_with(index + 1, || None);
        }
        arr[index] = Some(record);
    }

    /// Lazy sequence of `(index, time, record)` for one detector, starting at
    /// `from`.
    pub fn enumerate(&self, detector: DetectorId, from: i64) -> impl Iterator<Item = (i64, NaiveDateTime, Option<&DetectorRecord>)> {
        let zero = self.zero_index_time;
        let interval = self.update_interval;
        let len = self.len(detector) as i64;
        (from.max(0)..len).map(move |i| {
            let t = zero + interval * i as i32;
            (i, t, self.get(detector, i))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn dt(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 1, 1).unwrap().and_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn reset_creates_empty_arrays_for_each_detector() {
        let mut w = SlidingWindow::new(Duration::minutes(1), dt(0, 0));
        w.reset(dt(0, 0), &[1, 2]);
        assert_eq!(w.len(1), 0);
        assert_eq!(w.len(2), 0);
    }

    #[test]
    fn advance_extends_with_nulls() {
        let mut w = SlidingWindow::new(Duration::minutes(1), dt(0, 0));
        w.reset(dt(0, 0), &[1]);
        w.advance(dt(0, 0), dt(0, 5));
        assert_eq!(w.len(1), 5);
        for i in 0..5 {
            assert!(w.get(1, i).is_none());
        }
    }

    #[test]
    fn advance_drops_prefix_and_preserves_suffix() {
        let mut w = SlidingWindow::new(Duration::minutes(1), dt(0, 0));
        w.reset(dt(0, 0), &[1]);
        w.advance(dt(0, 0), dt(0, 5));
        w.set(1, dt(0, 3), crate::record::DetectorRecord::empty(crate::record::Provenance::Real(1)));
        w.advance(dt(0, 2), dt(0, 6));
        // index 3 (old) becomes index 1 (new zero at minute 2)
        assert!(w.get(1, 1).is_some());
        assert_eq!(w.len(1), 4);
    }

    #[test]
    fn index_of_may_exceed_length() {
        let mut w = SlidingWindow::new(Duration::minutes(1), dt(0, 0));
        w.reset(dt(0, 0), &[1]);
        assert_eq!(w.index_of(dt(1, 0)), 60);
        assert!(w.get(1, 60).is_none());
    }
}
