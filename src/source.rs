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
//! The six interval-table source types the aggregator and downstream stages
//! write to, per spec.md §4.6 and the DB schema of §6.

use strum::{Display, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum SourceType {
    Loop,
    Fcd,
    Fusion,
    Extrapolation,
    Simulation,
    Prediction,
}

impl SourceType {
    /// Simulation-derived sources translate incoming edge ids through the
    /// simulation<->DB edge map and use `entryCount` (not `groupCount`) as
    /// the aggregation denominator (spec design note, §9).
    pub fn is_simulation_like(self) -> bool {
        matches!(self, SourceType::Simulation | SourceType::Prediction)
    }

    pub fn is_fcd(self) -> bool {
        matches!(self, SourceType::Fcd)
    }
}
