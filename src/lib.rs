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
//! Continuously-running traffic-data pipeline: detector correction,
//! aggregation, multi-source fusion, historic-periodicity extrapolation,
//! and a SUMO-driving simulation loop, all paced by a shared scheduler.

pub mod aggregate;
pub mod classify;
pub mod config;
pub mod corrector;
pub mod db;
pub mod extrapolate;
pub mod fusion;
pub mod gapfill;
pub mod geh;
pub mod record;
pub mod schedule;
pub mod simulate;
pub mod source;
pub mod step;
pub mod time_index;
pub mod util;
pub mod window;
