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
//! Time index & interval algebra: date<->index conversion over a moving
//! window, rounding, day-second computation.
//!
//! Grounded on `original_source/sumo_ldl/tools.py` (`dayMinute`, `daySecond`,
//! `roundToMinute`, `getIntervalEndsBetween`).

use chrono::{Duration, NaiveDateTime, Timelike};

/// Rounding direction for [`round_to_minute`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rounding {
    Up,
    Down,
    HalfUp,
}

/// Minute of the day in `[0, 1440)`.
pub fn day_minute(t: NaiveDateTime) -> i64 {
    t.hour() as i64 * 60 + t.minute() as i64
}

/// Second of the day in `[0, 24*3600)`. If `begin` is given, the result is
/// incremented in whole-day steps until it is `>= begin` (so callers can turn
/// a wall-clock time into a day-second consistently past midnight).
pub fn day_second(t: NaiveDateTime, begin: Option<i64>) -> i64 {
    let mut result = t.hour() as i64 * 3600 + t.minute() as i64 * 60 + t.second() as i64;
    if let Some(begin) = begin {
        while result < begin {
            result += 24 * 3600;
        }
    }
    result
}

/// Rounds `date` to the nearest multiple of `interval` (an interval assumed to
/// evenly divide a day), in the given direction.
///
/// `roundToMinute(t, Δ, DOWN)` is the largest `t' <= t` with
/// `day_second(t') % Δ == 0`; `Up`/`HalfUp` analogously.
pub fn round_to_minute(date: NaiveDateTime, interval: Duration, rounding: Rounding) -> NaiveDateTime {
    let interval_secs = interval.num_seconds();
    assert!(interval_secs > 0 && 24 * 3600 % interval_secs == 0);
    let seconds = day_second(date, None);
    if seconds % interval_secs == 0 {
        return date;
    }
    let adjusted = match rounding {
        Rounding::Down => seconds,
        Rounding::HalfUp => seconds + interval_secs / 2,
        Rounding::Up => seconds + interval_secs,
    };
    let result_seconds = interval_secs * (adjusted / interval_secs);
    date.date().and_hms_opt(0, 0, 0).unwrap() + Duration::seconds(result_seconds)
}

/// All interval-end timestamps `start + k*interval_length` strictly greater
/// than `start`, up to and including the first one `>= end`.
pub fn interval_ends_between(
    start: NaiveDateTime,
    end: NaiveDateTime,
    interval_length: Duration,
) -> Vec<NaiveDateTime> {
    let mut result = Vec::new();
    let mut t = start;
    while t < end {
        t += interval_length;
        result.push(t);
    }
    result
}

/// Quantized index of a time relative to a window's zero-index time:
/// `idx(t) = (t - zeroIndexTime) / updateInterval`, truncating toward zero.
///
/// Returns an index that may exceed the caller's current array length; the
/// caller must range-check before indexing.
pub fn idx(t: NaiveDateTime, zero_index_time: NaiveDateTime, update_interval: Duration) -> i64 {
    (t - zero_index_time).num_seconds() / update_interval.num_seconds()
}

/// Inverse of [`idx`]: the time at a given quantized index.
pub fn time_at(index: i64, zero_index_time: NaiveDateTime, update_interval: Duration) -> NaiveDateTime {
    zero_index_time + update_interval * index as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn dt(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 7, 20)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    #[test]
    fn day_minute_and_second() {
        assert_eq!(day_minute(dt(1, 2, 0)), 62);
        assert_eq!(day_second(dt(1, 2, 3), None), 3723);
    }

    #[test]
    fn round_down_is_largest_not_greater() {
        let interval = Duration::minutes(5);
        let rounded = round_to_minute(dt(10, 7, 30), interval, Rounding::Down);
        assert_eq!(day_second(rounded, None) % 300, 0);
        assert!(rounded <= dt(10, 7, 30));
        assert_eq!(rounded, dt(10, 5, 0));
    }

    #[test]
    fn round_up_is_smallest_not_smaller() {
        let interval = Duration::minutes(5);
        let rounded = round_to_minute(dt(10, 7, 30), interval, Rounding::Up);
        assert_eq!(rounded, dt(10, 10, 0));
    }

    #[test]
    fn round_half_up() {
        let interval = Duration::minutes(5);
        assert_eq!(round_to_minute(dt(10, 7, 0), interval, Rounding::HalfUp), dt(10, 5, 0));
        assert_eq!(round_to_minute(dt(10, 8, 0), interval, Rounding::HalfUp), dt(10, 10, 0));
    }

    #[test]
    fn exact_multiple_is_unchanged() {
        let interval = Duration::minutes(5);
        assert_eq!(round_to_minute(dt(10, 5, 0), interval, Rounding::Down), dt(10, 5, 0));
    }

    #[test]
    fn idx_roundtrip() {
        let zero = dt(0, 0, 0);
        let interval = Duration::minutes(1);
        let t = dt(1, 30, 0);
        let i = idx(t, zero, interval);
        assert_eq!(i, 90);
        assert_eq!(time_at(i, zero, interval), t);
    }

    #[test]
    fn interval_ends_between_counts_correctly() {
        let start = dt(0, 0, 0);
        let end = dt(0, 15, 0);
        let ends = interval_ends_between(start, end, Duration::minutes(5));
        assert_eq!(ends, vec![dt(0, 5, 0), dt(0, 10, 0), dt(0, 15, 0)]);
    }
}
