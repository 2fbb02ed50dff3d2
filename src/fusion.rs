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
//! Multi-source fusion: combines per-edge loop and FCD values weighted by
//! their estimated quality.
//!
//! Grounded on `original_source/sumo_ldl/fusion.py` (`FusionValue`,
//! `_fusion`). The combination law is resolved per DESIGN.md: `add` takes
//! the *raw* per-source quality for the `inverseQuality` product (so the
//! testable property in spec.md §8 — `100*(1-(1-q1/100)(1-q2/100))` — holds
//! exactly) and a *separately* trust-scaled weight for the weighted average,
//! whereas the original python conflates the two.

use crate::source::SourceType;

/// Trust multiplier applied to a source's quality when it contributes as a
/// fusion *weight* — FCD is trusted less because only a fraction of
/// vehicles are equipped. Does not affect the `inverseQuality` combination
/// law, only the weighted-average numerator/denominator.
pub fn trust_multiplier(source: SourceType) -> f64 {
    match source {
        SourceType::Loop => 1.0,
        SourceType::Fcd => 0.5,
        _ => 1.0,
    }
}

/// One attribute's (flow or speed) running fusion accumulator.
#[derive(Debug, Clone, Copy)]
pub struct FusionValue {
    initialized: bool,
    weighted_sum: f64,
    weight: f64,
    /// Product of `(1 - quality_raw/100)` over every contributing source;
    /// stops moving once it hits zero (a source reported full quality).
    inverse_quality: f64,
}

impl Default for FusionValue {
    fn default() -> Self {
        FusionValue { initialized: false, weighted_sum: 0.0, weight: 0.0, inverse_quality: 1.0 }
    }
}

impl FusionValue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds in one source's contribution. `quality_pct_raw` is the source's
    /// own, un-trust-scaled, quality percentage; `weight` is the caller's
    /// trust-scaled weight (typically `quality_pct_raw * trust_multiplier`).
    /// No-op once `inverse_quality` has already reached zero.
    pub fn add(&mut self, value: Option<f64>, quality_pct_raw: f64, weight: f64) {
        let Some(value) = value else { return };
        if self.inverse_quality <= 0.0 {
            return;
        }
        self.initialized = true;
        self.weighted_sum += weight * value;
        self.weight += weight;
        self.inverse_quality *= 1.0 - quality_pct_raw / 100.0;
    }

    /// `(value, inverse_quality)`; `value` is `None` if nothing was added
    /// or the total weight was zero.
    pub fn finalize(&self) -> (Option<f64>, f64) {
        if self.initialized && self.weight > 0.0 {
            (Some(self.weighted_sum / self.weight), self.inverse_quality)
        } else {
            (None, 1.0)
        }
    }
}

/// Final fused `(flow, speed, quality_pct)` for one edge and one interval.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusedEdge {
    pub flow: Option<f64>,
    pub speed: Option<f64>,
    pub quality_pct: f64,
}

/// One source's contribution to an edge's fusion, pre-trust-scaling.
#[derive(Debug, Clone, Copy)]
pub struct SourceContribution {
    pub source: SourceType,
    pub flow: Option<f64>,
    pub speed: Option<f64>,
    pub quality_pct: f64,
}

/// Fuses all of one edge's per-source contributions for a single interval.
/// FCD counts are never fed into flow fusion (an FCD `q` is a vehicle count,
/// not a rate). Returns `None` if the combined quality is zero (nothing
/// worth emitting), per spec.md §4.7.
pub fn fuse_edge(contributions: &[SourceContribution]) -> Option<FusedEdge> {
    let mut q_fusion = FusionValue::new();
    let mut v_fusion = FusionValue::new();
    for c in contributions {
        let trust = trust_multiplier(c.source);
        let adapted_weight = c.quality_pct * trust;
        if !c.source.is_fcd() {
            q_fusion.add(c.flow, c.quality_pct, adapted_weight);
        }
        v_fusion.add(c.speed, c.quality_pct, adapted_weight);
    }
    let (mut flow, inv_q) = q_fusion.finalize();
    let (mut speed, inv_v) = v_fusion.finalize();

    if flow == Some(0.0) && speed.is_some_and(|s| s > 0.0) {
        flow = Some(1.0);
    }
    if speed == Some(0.0) && flow.is_some_and(|f| f > 0.0) {
        speed = None;
    }

    let quality_pct = 100.0 * (1.0 - inv_q * inv_v);
    if quality_pct > 0.0 {
        Some(FusedEdge { flow, speed, quality_pct })
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_source_is_identity_up_to_trust() {
        let contributions = [SourceContribution { source: SourceType::Loop, flow: Some(1000.0), speed: None, quality_pct: 80.0 }];
        let fused = fuse_edge(&contributions).unwrap();
        assert_eq!(fused.flow, Some(1000.0));
        assert_eq!(fused.quality_pct, 80.0);
    }

    #[test]
    fn worked_example_loop_flow_fcd_speed() {
        // spec.md §8 scenario 4: loop(q=1000, quality=80), fcd(v=50, quality=60)
        // -> flow=1000 (loop only), speed=50, quality=100*(1-0.2*0.4)=92.
        let contributions = [
            SourceContribution { source: SourceType::Loop, flow: Some(1000.0), speed: None, quality_pct: 80.0 },
            SourceContribution { source: SourceType::Fcd, flow: None, speed: Some(50.0), quality_pct: 60.0 },
        ];
        let fused = fuse_edge(&contributions).unwrap();
        assert_eq!(fused.flow, Some(1000.0));
        assert_eq!(fused.speed, Some(50.0));
        assert!((fused.quality_pct - 92.0).abs() < 1e-9, "{}", fused.quality_pct);
    }

    #[test]
    fn combination_law_for_two_independent_sources() {
        let q1 = 70.0;
        let q2 = 40.0;
        let contributions = [
            SourceContribution { source: SourceType::Loop, flow: None, speed: Some(10.0), quality_pct: q1 },
            SourceContribution { source: SourceType::Fcd, flow: None, speed: Some(20.0), quality_pct: q2 },
        ];
        let fused = fuse_edge(&contributions).unwrap();
        let expected = 100.0 * (1.0 - (1.0 - q1 / 100.0) * (1.0 - q2 / 100.0));
        assert!((fused.quality_pct - expected).abs() < 1e-9);
    }

    #[test]
    fn inconsistent_zero_flow_with_positive_speed_is_bumped_to_one() {
        let contributions = [SourceContribution { source: SourceType::Loop, flow: Some(0.0), speed: Some(5.0), quality_pct: 50.0 }];
        let fused = fuse_edge(&contributions).unwrap();
        assert_eq!(fused.flow, Some(1.0));
    }

    #[test]
    fn zero_quality_emits_nothing() {
        let contributions = [SourceContribution { source: SourceType::Loop, flow: Some(10.0), speed: None, quality_pct: 0.0 }];
        assert!(fuse_edge(&contributions).is_none());
    }
}
