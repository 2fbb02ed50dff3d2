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
//! Narrow async boundary standing in for the "generic SQL store" external
//! collaborator (spec.md §6 & Non-goals): a [`Store`] trait with
//! idempotent-upsert methods per table family, a [`Schema`] trait for the
//! per-deployment table/column-name indirection layer, and a minimal
//! in-process [`memory`] implementation used by the test suite.
//!
//! Grounded on `original_source/sumo_ldl/database.py` (connection/query
//! surface) and `src/default_schema.py` (the indirection layer); neither is
//! a production DB driver, per spec.md §1's explicit out-of-scope list.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use thiserror::Error;

use crate::aggregate::FcdSighting;
use crate::record::DetectorRecord;
use crate::simulate::Restriction;
use crate::source::SourceType;
use crate::window::DetectorId;

#[derive(Debug, Error)]
pub enum Error {
    #[error("no such edge interval for (type={0}, end={1})")]
    NoSuchInterval(SourceType, NaiveDateTime),
    #[error("backing store is unavailable: {0}")]
    Unavailable(String),
}

/// Schema-parameterized table/column naming, per spec.md §6's "all table and
/// column names are indirected through a per-deployment schema object".
/// Nothing in this crate hard-codes a table or column name outside this
/// trait's implementors.
pub trait Schema: Send + Sync {
    /// `3600/updateInterval` for loops, `aggregate/600` for FCD, or a region
    /// override (spec §9 design note — `flowScale` must be exposed as a
    /// parameter, not hard-coded).
    fn flow_scale(&self, source: SourceType, update_interval_secs: f64, aggregate_secs: f64) -> f64;
}

/// A region whose loop data already arrives in veh/h needs no further
/// scaling (spec §9's Leipzig example); everyone else converts.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultSchema {
    pub loop_already_per_hour: bool,
}

impl Schema for DefaultSchema {
    fn flow_scale(&self, source: SourceType, update_interval_secs: f64, aggregate_secs: f64) -> f64 {
        match source {
            SourceType::Fcd => aggregate_secs / 600.0,
            _ if self.loop_already_per_hour => 1.0,
            _ => 3600.0 / update_interval_secs,
        }
    }
}

/// One row of the operating-status table (spec.md §4.5 step 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCategory {
    I,
    II,
    III,
    IV,
    V,
}

#[derive(Debug, Clone, Copy)]
pub struct OperatingStatus {
    pub detector: DetectorId,
    pub quality_pct: f64,
    pub category: StatusCategory,
}

#[derive(Debug, Clone, Copy)]
pub struct GroupStatus {
    pub group: i64,
    pub min_quality_pct: f64,
    pub max_delay_secs: f64,
}

/// One written row of aggregated per-edge data.
#[derive(Debug, Clone, Copy)]
pub struct EdgeDataRow {
    pub edge_id: i64,
    pub flow: Option<i64>,
    pub speed: Option<f64>,
    pub quality: f64,
}

/// The narrow store boundary. All writes for a given `(type, interval_end)`
/// are idempotent: implementors must locate-or-insert the interval row, then
/// delete-then-insert its child rows, inside one transaction (spec.md §5).
#[async_trait]
pub trait Store: Send + Sync {
    async fn detector_ids(&self, update_interval_secs: i64) -> Result<Vec<DetectorId>, Error>;

    /// Maps each detector to its `induction_loop_group` id (spec.md §2's
    /// `DetectorGroup`: "one or more detectors on the same edge within a
    /// small position deviation"). A detector absent from the map is its own
    /// one-member group, keyed by its own id.
    async fn detector_groups(&self, update_interval_secs: i64) -> Result<HashMap<DetectorId, i64>, Error>;

    async fn load_corrected(
        &self,
        detector: DetectorId,
        from: NaiveDateTime,
        to: NaiveDateTime,
    ) -> Result<Vec<(NaiveDateTime, DetectorRecord)>, Error>;

    async fn load_raw(
        &self,
        detector: DetectorId,
        from: NaiveDateTime,
        to: NaiveDateTime,
    ) -> Result<Vec<(NaiveDateTime, DetectorRecord)>, Error>;

    /// Idempotent upsert keyed by `(data_time, detector_id)`.
    async fn upsert_corrected(&self, detector: DetectorId, time: NaiveDateTime, record: DetectorRecord) -> Result<(), Error>;

    async fn upsert_operating_status(&self, status: OperatingStatus) -> Result<(), Error>;
    async fn upsert_group_status(&self, status: GroupStatus) -> Result<(), Error>;

    /// Ensures an `EdgeInterval` row exists for `(source, interval_end)` and
    /// returns its id, inserting one if absent.
    async fn ensure_interval(&self, source: SourceType, interval_end: NaiveDateTime) -> Result<i64, Error>;

    /// Deletes all child rows for `interval_id`, then inserts `rows`, and
    /// updates the interval's mean quality — all as one logical write.
    async fn replace_edge_data(&self, interval_id: i64, rows: &[EdgeDataRow]) -> Result<(), Error>;

    /// Reads the most recent (interval_end, edge data) for `source` at or
    /// before `at`, keyed by edge id — used by fusion, extrapolation and the
    /// comparison artifact.
    async fn latest_edge_data(&self, source: SourceType, at: NaiveDateTime) -> Result<HashMap<i64, EdgeDataRow>, Error>;

    /// Reads edge data for `source` at exactly `interval_end` (empty map if
    /// no interval exists there) — the historic-periodicity extrapolator
    /// needs exact weekly-offset samples, not the fuzzy "most recent at or
    /// before" semantics of [`Store::latest_edge_data`].
    async fn edge_data_at(&self, source: SourceType, interval_end: NaiveDateTime) -> Result<HashMap<i64, EdgeDataRow>, Error>;

    /// Deletes `EdgeInterval` rows (and their children) of `source` older
    /// than `older_than` (spec.md §4.9's `deleteafterDB` cleanup).
    async fn cleanup_intervals(&self, source: SourceType, older_than: NaiveDateTime) -> Result<u64, Error>;

    /// Raw floating-car-data sightings in `[from, to)`, pre-filtering — the
    /// FCD analogue of `load_raw` for induction loops.
    async fn load_fcd_sightings(&self, from: NaiveDateTime, to: NaiveDateTime) -> Result<Vec<FcdSighting>, Error>;

    /// Active blocking restrictions (`restriction` table, navteq validity
    /// expressions) — input to `simulate::generate_blockings`.
    async fn restrictions(&self) -> Result<Vec<Restriction>, Error>;

    /// Static road-graph predecessor map (`edge_connection` table), keyed
    /// and valued by DB edge id.
    async fn edge_predecessors(&self) -> Result<HashMap<i64, Vec<i64>>, Error>;

    /// The `edge` table's `navteq_id<->edge_id` translation, DB id keyed,
    /// simulation id valued — shared by simulation-sourced aggregation and
    /// blocking translation.
    async fn simulation_edge_map(&self) -> Result<HashMap<i64, i64>, Error>;
}

pub mod memory {
    //! A minimal in-process [`Store`], not a production driver: backs the
    //! unit/integration test suite only.
    use super::*;
    use std::collections::BTreeMap;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct Interval {
        id: i64,
        rows: HashMap<i64, EdgeDataRow>,
    }

    #[derive(Default)]
    pub struct MemoryStore {
        inner: Mutex<Inner>,
    }

    #[derive(Default)]
    struct Inner {
        next_interval_id: i64,
        known_detectors: Vec<DetectorId>,
        groups: HashMap<DetectorId, i64>,
        raw: HashMap<DetectorId, BTreeMap<NaiveDateTime, DetectorRecord>>,
        corrected: HashMap<DetectorId, BTreeMap<NaiveDateTime, DetectorRecord>>,
        intervals: HashMap<(SourceType, NaiveDateTime), Interval>,
        operating_status: Vec<OperatingStatus>,
        group_status: Vec<GroupStatus>,
        fcd: Vec<FcdSighting>,
        restrictions: Vec<Restriction>,
        predecessors: HashMap<i64, Vec<i64>>,
        edge_map: HashMap<i64, i64>,
    }

    impl MemoryStore {
        pub fn new(known_detectors: Vec<DetectorId>) -> Self {
            MemoryStore {
                inner: Mutex::new(Inner { known_detectors, ..Default::default() }),
            }
        }

        /// Registers a detector's group membership for tests that exercise
        /// the group-level roll-up; detectors left unregistered default to
        /// their own one-member group in [`Store::detector_groups`].
        pub async fn seed_group(&self, detector: DetectorId, group: i64) {
            let mut inner = self.inner.lock().await;
            inner.groups.insert(detector, group);
        }

        pub async fn seed_raw(&self, detector: DetectorId, time: NaiveDateTime, record: DetectorRecord) {
            let mut inner = self.inner.lock().await;
            inner.raw.entry(detector).or_default().insert(time, record);
        }

        pub async fn group_statuses(&self) -> Vec<GroupStatus> {
            self.inner.lock().await.group_status.clone()
        }

        pub async fn seed_fcd(&self, sighting: FcdSighting) {
            self.inner.lock().await.fcd.push(sighting);
        }

        pub async fn seed_restriction(&self, restriction: Restriction) {
            self.inner.lock().await.restrictions.push(restriction);
        }

        pub async fn seed_predecessor(&self, edge: i64, predecessor: i64) {
            self.inner.lock().await.predecessors.entry(edge).or_default().push(predecessor);
        }

        pub async fn seed_edge_map(&self, db_edge: i64, sim_edge: i64) {
            self.inner.lock().await.edge_map.insert(db_edge, sim_edge);
        }
    }

    #[async_trait]
    impl Store for MemoryStore {
        async fn detector_ids(&self, _update_interval_secs: i64) -> Result<Vec<DetectorId>, Error> {
            Ok(self.inner.lock().await.known_detectors.clone())
        }

        async fn detector_groups(&self, _update_interval_secs: i64) -> Result<HashMap<DetectorId, i64>, Error> {
            let inner = self.inner.lock().await;
            Ok(inner
                .known_detectors
                .iter()
                .map(|&d| (d, *inner.groups.get(&d).unwrap_or(&d)))
                .collect())
        }

        async fn load_corrected(&self, detector: DetectorId, from: NaiveDateTime, to: NaiveDateTime) -> Result<Vec<(NaiveDateTime, DetectorRecord)>, Error> {
            let inner = self.inner.lock().await;
            Ok(inner
                .corrected
                .get(&detector)
                .map(|m| m.range(from..to).map(|(t, r)| (*t, r.clone())).collect())
                .unwrap_or_default())
        }

        async fn load_raw(&self, detector: DetectorId, from: NaiveDateTime, to: NaiveDateTime) -> Result<Vec<(NaiveDateTime, DetectorRecord)>, Error> {
            let inner = self.inner.lock().await;
            Ok(inner
                .raw
                .get(&detector)
                .map(|m| m.range(from..to).map(|(t, r)| (*t, r.clone())).collect())
                .unwrap_or_default())
        }

        async fn upsert_corrected(&self, detector: DetectorId, time: NaiveDateTime, record: DetectorRecord) -> Result<(), Error> {
            let mut inner = self.inner.lock().await;
            inner.corrected.entry(detector).or_default().insert(time, record);
            Ok(())
        }

        async fn upsert_operating_status(&self, status: OperatingStatus) -> Result<(), Error> {
            let mut inner = self.inner.lock().await;
            inner.operating_status.retain(|s| s.detector != status.detector);
            inner.operating_status.push(status);
            Ok(())
        }

        async fn upsert_group_status(&self, status: GroupStatus) -> Result<(), Error> {
            let mut inner = self.inner.lock().await;
            inner.group_status.retain(|s| s.group != status.group);
            inner.group_status.push(status);
            Ok(())
        }

        async fn ensure_interval(&self, source: SourceType, interval_end: NaiveDateTime) -> Result<i64, Error> {
            let mut inner = self.inner.lock().await;
            if let Some(iv) = inner.intervals.get(&(source, interval_end)) {
                return Ok(iv.id);
            }
            inner.next_interval_id += 1;
            let id = inner.next_interval_id;
            inner.intervals.insert((source, interval_end), Interval { id, rows: HashMap::new() });
            Ok(id)
        }

        async fn replace_edge_data(&self, interval_id: i64, rows: &[EdgeDataRow]) -> Result<(), Error> {
            let mut inner = self.inner.lock().await;
            let iv = inner.intervals.values_mut().find(|iv| iv.id == interval_id);
            let Some(iv) = iv else {
                return Err(Error::Unavailable(format!("no interval with id {interval_id}")));
            };
            iv.rows.clear();
            for row in rows {
                iv.rows.insert(row.edge_id, *row);
            }
            Ok(())
        }

        async fn latest_edge_data(&self, source: SourceType, at: NaiveDateTime) -> Result<HashMap<i64, EdgeDataRow>, Error> {
            let inner = self.inner.lock().await;
            let best = inner
                .intervals
                .iter()
                .filter(|((s, end), _)| *s == source && *end <= at)
                .max_by_key(|((_, end), _)| *end);
            Ok(best.map(|(_, iv)| iv.rows.clone()).unwrap_or_default())
        }

        async fn edge_data_at(&self, source: SourceType, interval_end: NaiveDateTime) -> Result<HashMap<i64, EdgeDataRow>, Error> {
            let inner = self.inner.lock().await;
            Ok(inner.intervals.get(&(source, interval_end)).map(|iv| iv.rows.clone()).unwrap_or_default())
        }

        async fn cleanup_intervals(&self, source: SourceType, older_than: NaiveDateTime) -> Result<u64, Error> {
            let mut inner = self.inner.lock().await;
            let before = inner.intervals.len();
            inner.intervals.retain(|(s, end), _| !(*s == source && *end < older_than));
            Ok((before - inner.intervals.len()) as u64)
        }

        async fn load_fcd_sightings(&self, from: NaiveDateTime, to: NaiveDateTime) -> Result<Vec<FcdSighting>, Error> {
            let inner = self.inner.lock().await;
            Ok(inner.fcd.iter().filter(|s| s.time >= from && s.time < to).cloned().collect())
        }

        async fn restrictions(&self) -> Result<Vec<Restriction>, Error> {
            Ok(self.inner.lock().await.restrictions.clone())
        }

        async fn edge_predecessors(&self) -> Result<HashMap<i64, Vec<i64>>, Error> {
            Ok(self.inner.lock().await.predecessors.clone())
        }

        async fn simulation_edge_map(&self) -> Result<HashMap<i64, i64>, Error> {
            Ok(self.inner.lock().await.edge_map.clone())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use chrono::NaiveDate;
        use crate::record::Provenance;

        fn dt(h: u32) -> NaiveDateTime {
            NaiveDate::from_ymd_opt(2026, 1, 1).unwrap().and_hms_opt(h, 0, 0).unwrap()
        }

        #[tokio::test]
        async fn ensure_interval_is_idempotent() {
            let store = MemoryStore::new(vec![1]);
            let a = store.ensure_interval(SourceType::Loop, dt(0)).await.unwrap();
            let b = store.ensure_interval(SourceType::Loop, dt(0)).await.unwrap();
            assert_eq!(a, b);
        }

        #[tokio::test]
        async fn replace_edge_data_overwrites_not_appends() {
            let store = MemoryStore::new(vec![1]);
            let id = store.ensure_interval(SourceType::Loop, dt(0)).await.unwrap();
            store
                .replace_edge_data(id, &[EdgeDataRow { edge_id: 1, flow: Some(100), speed: Some(50.0), quality: 90.0 }])
                .await
                .unwrap();
            store
                .replace_edge_data(id, &[EdgeDataRow { edge_id: 1, flow: Some(200), speed: Some(60.0), quality: 80.0 }])
                .await
                .unwrap();
            let latest = store.latest_edge_data(SourceType::Loop, dt(1)).await.unwrap();
            assert_eq!(latest.len(), 1);
            assert_eq!(latest[&1].flow, Some(200));
        }

        #[tokio::test]
        async fn upsert_corrected_round_trips() {
            let store = MemoryStore::new(vec![1]);
            let mut r = DetectorRecord::empty(Provenance::Real(1));
            r.q_pkw = Some(10.0);
            store.upsert_corrected(1, dt(0), r).await.unwrap();
            let rows = store.load_corrected(1, dt(0), dt(1)).await.unwrap();
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0].1.q_pkw, Some(10.0));
        }
    }
}
