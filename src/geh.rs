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
//! Geoffrey E. Havers statistic, the standard metric for traffic-flow
//! calibration fit. Grounded on `original_source/sumo_ldl/tools.py::geh`.

/// `sqrt(2*(m-c)^2/(m+c))`, `0` if `m+c == 0`.
pub fn geh(measured: f64, computed: f64) -> f64 {
    let sum = measured + computed;
    if sum == 0.0 {
        0.0
    } else {
        (2.0 * (measured - computed).powi(2) / sum).sqrt()
    }
}

/// Linear GEH-to-quality mapping used by the extrapolator's self-assessment:
/// GEH 0 -> quality 100, GEH 5 -> quality 50, GEH >= 10 -> quality 0.
pub fn geh_to_quality(g: f64) -> f64 {
    (100.0 - 10.0 * g).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geh_of_equal_values_is_zero() {
        assert_eq!(geh(100.0, 100.0), 0.0);
        assert_eq!(geh(0.0, 0.0), 0.0);
    }

    #[test]
    fn geh_matches_formula() {
        let g = geh(110.0, 100.0);
        let expected = (2.0 * 100.0 / 210.0_f64).sqrt();
        assert!((g - expected).abs() < 1e-9);
    }

    #[test]
    fn geh_to_quality_saturates() {
        assert_eq!(geh_to_quality(0.0), 100.0);
        assert_eq!(geh_to_quality(5.0), 50.0);
        assert_eq!(geh_to_quality(10.0), 0.0);
        assert_eq!(geh_to_quality(20.0), 0.0);
    }
}
