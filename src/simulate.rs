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
//! Simulator driver: per-iteration directory staging, SUMO input
//! generation (calibrators, blockings, route distributions, dump plan),
//! child-process invocation, gzipped dump parsing, and the output/rotation
//! housekeeping that follows a run.
//!
//! Grounded on `original_source/sumo_ldl/generateSimulationInput.py`
//! (`generateCalibrators`, `calculateInterval`, `handleBlockings`),
//! `routeDistributions.py` (`generateStatic`, `generateDynamic`,
//! `checkReset`) and `simulationRun.py` (`buildDirs`, `prepare_dump`,
//! `copyBackupClean`, `main`).

use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use std::path::{Path, PathBuf};

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, Timelike};
use lazy_static::lazy_static;
use quick_xml::events::{BytesEnd, BytesStart, Event};
use quick_xml::Writer;
use regex::Regex;
use thiserror::Error;
use tokio::process::Command;

use crate::source::SourceType;
use crate::time_index::day_second;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("xml error: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("reading dump csv: {0}")]
    Csv(#[from] csv::Error),
    #[error("store error: {0}")]
    Store(#[from] crate::db::Error),
    #[error("{0}")]
    BadSchedule(String),
}

pub const STATE_FILE: &str = "state.xml.gz";
const MIN_FREE_BYTES: u64 = 10 * (1 << 30);
const ITERATION_DIR_FORMAT: &str = "%Y_%m_%d_%H-%M-%S";

fn xml_writer() -> Writer<Cursor<Vec<u8>>> {
    Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 4)
}

fn finish(writer: Writer<Cursor<Vec<u8>>>) -> String {
    String::from_utf8(writer.into_inner().into_inner()).expect("xml writer emits only ascii/utf8 attribute text")
}

fn write_empty(writer: &mut Writer<Cursor<Vec<u8>>>, name: &str, attrs: &[(&str, String)]) -> Result<(), Error> {
    let mut elem = BytesStart::new(name);
    for (k, v) in attrs {
        elem.push_attribute((*k, v.as_str()));
    }
    writer.write_event(Event::Empty(elem))?;
    Ok(())
}

// ---------------------------------------------------------------------
// Iteration planning & directory staging
// ---------------------------------------------------------------------

/// Per-iteration timing and the edge-data dump plan it drives, per
/// spec.md §4.9.
#[derive(Debug, Clone)]
pub struct SimulationIterationContext {
    pub sim_begin: NaiveDateTime,
    pub forecast_start: NaiveDateTime,
    pub sim_end: NaiveDateTime,
    pub save_state_time: NaiveDateTime,
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub check_dir: PathBuf,
    pub state_file_in: Option<PathBuf>,
    pub state_file_out: PathBuf,
    pub dump_plan: DumpPlan,
}

/// Computes the iteration's timing and rejects a configuration where
/// `saveStateTime` falls outside `[simBegin, simEnd)`.
#[allow(clippy::too_many_arguments)]
pub fn plan_iteration(
    root: &Path,
    scenario: &str,
    start_time: NaiveDateTime,
    is_first: bool,
    prefirst: Duration,
    overlap: Duration,
    repeat: Duration,
    aggregation: Duration,
    forecast: Duration,
) -> Result<SimulationIterationContext, Error> {
    let sim_begin = if is_first { start_time - prefirst } else { start_time - overlap };
    let forecast_start = start_time;
    let sim_end = forecast_start + forecast;
    let save_state_time = start_time - overlap + repeat;
    if save_state_time < sim_begin || save_state_time >= sim_end {
        return Err(Error::BadSchedule(
            "saveStateTime outside [simBegin, simEnd) -- forecast or prefirst is too small for repeat".into(),
        ));
    }

    let base = root.join(scenario);
    let stamp = start_time.format(ITERATION_DIR_FORMAT).to_string();
    let last_stamp = (start_time - repeat).format(ITERATION_DIR_FORMAT).to_string();
    let check_dir = base.join("check").join(&stamp);
    let input_dir = base.join("sim_inputs").join(&stamp);
    let output_dir = base.join("sim_outputs").join(&stamp);
    let state_file_in_candidate = base.join("sim_outputs").join(&last_stamp).join(STATE_FILE);
    let state_file_in = if !is_first && state_file_in_candidate.exists() { Some(state_file_in_candidate) } else { None };
    let state_file_out = output_dir.join(STATE_FILE);

    let (dump_plan, _) = build_dump_plan(start_time, sim_end, aggregation, repeat, forecast);

    Ok(SimulationIterationContext {
        sim_begin,
        forecast_start,
        sim_end,
        save_state_time,
        input_dir,
        output_dir,
        check_dir,
        state_file_in,
        state_file_out,
        dump_plan,
    })
}

/// Creates `check/`, `sim_inputs/` and `sim_outputs/` for one iteration.
pub fn stage_dirs(ctx: &SimulationIterationContext) -> std::io::Result<()> {
    for dir in [&ctx.check_dir, &ctx.input_dir, &ctx.output_dir] {
        std::fs::create_dir_all(dir)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------
// Dump plan (edgeData `<a>` file)
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct DumpPlanEntry {
    pub interval_end: NaiveDateTime,
    pub traffic_type: SourceType,
}

/// `edgeDataID -> (intervalEnd, trafficType)`, per spec.md §4: "DumpPlan".
#[derive(Debug, Clone, Default)]
pub struct DumpPlan {
    pub entries: HashMap<String, DumpPlanEntry>,
}

fn write_edge_data_dump(
    writer: &mut Writer<Cursor<Vec<u8>>>,
    id: &str,
    begin_sec: i64,
    end_sec: i64,
    dumpfile: &str,
    with_internal: bool,
) -> Result<(), Error> {
    write_empty(
        writer,
        "edgeData",
        &[
            ("id", id.to_string()),
            ("begin", begin_sec.to_string()),
            ("end", end_sec.to_string()),
            ("file", dumpfile.to_string()),
            ("excludeEmpty", "true".to_string()),
            ("withInternal", with_internal.to_string()),
            ("writeAttributes", "speed departed entered vaporized".to_string()),
        ],
    )
}

/// Builds the `numDumpsSimulation = repeat/aggregation` intervals ending at
/// `startTime` plus the `numDumpsPrediction = forecast/aggregation`
/// intervals ending at `simEnd`, each with synthetic id `"<type><i>"`, and
/// renders the `dump.add.xml` content.
pub fn build_dump_plan(
    start_time: NaiveDateTime,
    sim_end: NaiveDateTime,
    aggregation: Duration,
    repeat: Duration,
    forecast: Duration,
) -> (DumpPlan, String) {
    let num_sim = repeat.num_seconds() / aggregation.num_seconds();
    let num_pred = forecast.num_seconds() / aggregation.num_seconds();
    let sim_beg_sec = day_second(start_time, None);

    let mut plan = DumpPlan::default();
    let mut writer = xml_writer();
    writer.write_event(Event::Start(BytesStart::new("a"))).ok();
    for i in 0..num_sim {
        let end = start_time - aggregation * i as i32;
        let begin = end - aggregation;
        let id = format!("simulation{i}");
        let end_sec = day_second(end, Some(sim_beg_sec));
        let begin_sec = day_second(begin, Some(sim_beg_sec));
        let _ = write_edge_data_dump(&mut writer, &id, begin_sec, end_sec, "dump.csv.gz", i == 0);
        plan.entries.insert(id, DumpPlanEntry { interval_end: end, traffic_type: SourceType::Simulation });
    }
    for i in 0..num_pred {
        let end = sim_end - aggregation * i as i32;
        let begin = end - aggregation;
        let id = format!("prediction{i}");
        let end_sec = day_second(end, Some(sim_beg_sec));
        let begin_sec = day_second(begin, Some(sim_beg_sec));
        let _ = write_edge_data_dump(&mut writer, &id, begin_sec, end_sec, "dump.csv.gz", i == 0);
        plan.entries.insert(id, DumpPlanEntry { interval_end: end, traffic_type: SourceType::Prediction });
    }
    writer.write_event(Event::End(BytesEnd::new("a"))).ok();
    (plan, finish(writer))
}

// ---------------------------------------------------------------------
// Calibrators
// ---------------------------------------------------------------------

/// One interval's `(flow, speed, quality)` measurement or extrapolation for
/// one edge, as fed into a `<calibrator>`'s `<flow>` children.
#[derive(Debug, Clone, Copy)]
pub struct CalibratorSample {
    pub time: NaiveDateTime,
    pub agg_interval: Duration,
    pub flow: Option<f64>,
    pub speed: Option<f64>,
    pub quality: f64,
    pub is_extrapolation: bool,
}

/// Renders `calibrators.add.xml`: one `<calibrator>` per edge with a
/// `<flow>` per available interval. `vehsPerHour`/`speed` are omitted when
/// unknown (disabling that half of the calibration) or, for speed, above
/// 120 km/h (`generateCalibrators::_writeCalibrators`).
pub fn write_calibrators(
    samples: &HashMap<String, Vec<CalibratorSample>>,
    sim_begin: NaiveDateTime,
    calibrator_interval: Duration,
    log_file: &str,
    collect_route_info: bool,
) -> Result<String, Error> {
    let sim_beg_sec = day_second(sim_begin, None);
    let mut edges: Vec<&String> = samples.keys().collect();
    edges.sort();

    let mut writer = xml_writer();
    writer.write_event(Event::Start(BytesStart::new("add"))).ok();
    for edge in edges {
        let mut entries = samples[edge].clone();
        entries.sort_by_key(|s| s.time);

        let mut calibrator = BytesStart::new("calibrator");
        calibrator.push_attribute(("id", format!("calibrator_{edge}").as_str()));
        calibrator.push_attribute(("lane", format!("{edge}_0").as_str()));
        calibrator.push_attribute(("pos", "0"));
        calibrator.push_attribute(("freq", calibrator_interval.num_seconds().to_string().as_str()));
        calibrator.push_attribute(("friendlyPos", "x"));
        calibrator.push_attribute(("output", log_file));
        if collect_route_info {
            calibrator.push_attribute(("routeProbe", format!("routedist_{edge}").as_str()));
        }
        writer.write_event(Event::Start(calibrator))?;

        for s in &entries {
            let start_second = day_second(s.time - s.agg_interval, Some(sim_beg_sec));
            let end_second = start_second + s.agg_interval.num_seconds();
            let force_multiplier = if s.is_extrapolation { 0.5 } else { 1.0 };

            let mut flow_elem = BytesStart::new("flow");
            flow_elem.push_attribute(("begin", start_second.to_string().as_str()));
            flow_elem.push_attribute(("end", end_second.to_string().as_str()));
            if let Some(flow) = s.flow {
                flow_elem.push_attribute(("vehsPerHour", flow.to_string().as_str()));
            }
            if let Some(speed) = s.speed {
                if speed <= 120.0 {
                    flow_elem.push_attribute(("speed", speed.to_string().as_str()));
                }
            }
            flow_elem.push_attribute(("vType", "vtypedist"));
            flow_elem.push_attribute(("route", format!("routedist_{edge}").as_str()));
            flow_elem.push_attribute(("force", (s.quality * force_multiplier).to_string().as_str()));
            if s.is_extrapolation {
                flow_elem.push_attribute(("comment", "extrapolation"));
            }
            writer.write_event(Event::Empty(flow_elem))?;
        }
        writer.write_event(Event::End(BytesEnd::new("calibrator")))?;
    }
    writer.write_event(Event::End(BytesEnd::new("add"))).ok();
    Ok(finish(writer))
}

// ---------------------------------------------------------------------
// NavTeq validity expression parsing
// ---------------------------------------------------------------------

lazy_static! {
    static ref NAVTEQ_RE: Regex = Regex::new(r"\[\((\w*)\)\{(\w*)\}\]").unwrap();
}

fn days_in_month(year: i32, month: u32) -> u32 {
    const MAX: [u32; 13] = [0, 31, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];
    let Some(&max) = MAX.get(month as usize) else { return 31 };
    if month == 2 && year % 4 == 0 && year % 100 != 0 { 29 } else { max }
}

/// Consumes `order`'s date-part letters against `spec` once each, in order,
/// stopping to parse the trailing digits whenever the remaining text starts
/// with that letter — matching `calculateInterval`'s single left-to-right
/// scan (a part out of sequence relative to the current remainder is
/// silently skipped, exactly as in the original).
fn consume_sequential(mut spec: &str, order: &[char]) -> Vec<(char, i64)> {
    let mut out = Vec::new();
    for &part in order {
        if let Some(rest) = spec.strip_prefix(part) {
            let digit_end = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
            if digit_end > 0 {
                if let Ok(amount) = rest[..digit_end].parse::<i64>() {
                    out.push((part, amount));
                    spec = &rest[digit_end..];
                }
            }
        }
    }
    out
}

fn replace_date_part(date: NaiveDateTime, part: char, amount: i64) -> Option<NaiveDateTime> {
    match part {
        'y' => date.with_year(amount as i32),
        'M' => {
            let month = amount as u32;
            let max_day = days_in_month(date.year(), month);
            let day = date.day().min(max_day);
            NaiveDate::from_ymd_opt(date.year(), month, day).map(|d| d.and_time(date.time()))
        }
        'd' => date.with_day(amount as u32),
        'h' => date.with_hour(amount as u32),
        'm' => date.with_minute(amount as u32),
        's' => date.with_second(amount as u32),
        _ => None,
    }
}

fn add_duration_part(date: NaiveDateTime, part: char, amount: i64) -> Option<NaiveDateTime> {
    match part {
        'y' => date.with_year(date.year() + amount as i32),
        'M' => {
            let total_months = date.month0() as i64 + amount;
            let years = total_months.div_euclid(12);
            let month0 = total_months.rem_euclid(12);
            let year = date.year() + years as i32;
            let max_day = days_in_month(year, month0 as u32 + 1);
            let day = date.day().min(max_day);
            NaiveDate::from_ymd_opt(year, month0 as u32 + 1, day).map(|d| d.and_time(date.time()))
        }
        'w' => Some(date + Duration::weeks(amount)),
        'd' => Some(date + Duration::days(amount)),
        'h' => Some(date + Duration::hours(amount)),
        'm' => Some(date + Duration::minutes(amount)),
        's' => Some(date + Duration::seconds(amount)),
        _ => None,
    }
}

/// Parses `[(B){D}]`: `B` replaces date components of `reference` (in order
/// `y,M,d,h,m,s`), `D` then adds a duration to the parsed begin (in order
/// `y,M,w,d,h,m,s`); the result is intersected with `[window_begin,
/// window_end]`. Returns `None` on an unparseable expression or an empty
/// intersection — both logged by the caller, never fatal.
pub fn parse_navteq_validity(
    expr: &str,
    reference: NaiveDateTime,
    window_begin: NaiveDateTime,
    window_end: NaiveDateTime,
) -> Option<(NaiveDateTime, NaiveDateTime)> {
    let caps = NAVTEQ_RE.captures(expr.trim())?;
    let begin_spec = caps.get(1)?.as_str();
    let duration_spec = caps.get(2)?.as_str();

    let mut parsed_begin = reference;
    for (part, amount) in consume_sequential(begin_spec, &['y', 'M', 'd', 'h', 'm', 's']) {
        parsed_begin = replace_date_part(parsed_begin, part, amount)?;
    }
    let mut parsed_end = parsed_begin;
    for (part, amount) in consume_sequential(duration_spec, &['y', 'M', 'w', 'd', 'h', 'm', 's']) {
        parsed_end = add_duration_part(parsed_end, part, amount)?;
    }

    let (mut begin, mut end) = (parsed_begin, parsed_end);
    if end < begin {
        std::mem::swap(&mut begin, &mut end);
    }
    if end < window_begin || begin > window_end {
        return None;
    }
    Some((begin.max(window_begin), end.min(window_end)))
}

// ---------------------------------------------------------------------
// Blockings
// ---------------------------------------------------------------------

/// One restriction row as read from the store: the blocked edge and its
/// NavTeq validity expression.
#[derive(Debug, Clone)]
pub struct Restriction {
    pub edge_id: i64,
    pub validity_period: String,
}

#[derive(Debug, Clone, Copy)]
struct BlockedSection {
    begin_second: i64,
    end_second: i64,
    sim_edge_id: i64,
}

/// Translates restriction rows into `blockings.add.xml`: a `<vaporizer>` on
/// each blocked edge (through `edge_map`) for its intersected validity
/// window, and a `<rerouter>`/`<closingReroute>` on every edge in
/// `predecessors[edge]` that is not itself blocked in the same window.
/// Returns the rendered XML and the rerouter count placed.
pub fn generate_blockings(
    restrictions: &[Restriction],
    predecessors: &HashMap<i64, Vec<i64>>,
    edge_map: &HashMap<i64, i64>,
    interval_begin: NaiveDateTime,
    interval_end: NaiveDateTime,
) -> Result<(String, usize), Error> {
    let mut blocked: HashMap<i64, BlockedSection> = HashMap::new();
    let mut writer = xml_writer();
    writer.write_event(Event::Start(BytesStart::new("add"))).ok();

    for r in restrictions {
        let Some((begin, end)) = parse_navteq_validity(&r.validity_period, interval_begin, interval_begin, interval_end) else {
            log::warn!("unsupported or out-of-window NavTeq validity {:?} on edge {}", r.validity_period, r.edge_id);
            continue;
        };
        let sim_edge = *edge_map.get(&r.edge_id).unwrap_or(&r.edge_id);
        let begin_second = day_second(begin, None);
        let end_second = day_second(end, Some(begin_second));
        write_empty(
            &mut writer,
            "vaporizer",
            &[("id", sim_edge.to_string()), ("begin", begin_second.to_string()), ("end", end_second.to_string())],
        )?;
        blocked.insert(r.edge_id, BlockedSection { begin_second, end_second, sim_edge_id: sim_edge });
    }

    let mut num_rerouters = 0usize;
    let mut blocked_ids: Vec<i64> = blocked.keys().copied().collect();
    blocked_ids.sort_unstable();
    for edge_id in blocked_ids {
        let section = blocked[&edge_id];
        let rerouter_edges: Vec<String> = predecessors
            .get(&edge_id)
            .into_iter()
            .flatten()
            .filter(|p| !blocked.contains_key(p))
            .map(|p| edge_map.get(p).unwrap_or(p).to_string())
            .collect();
        if rerouter_edges.is_empty() {
            continue;
        }
        num_rerouters += 1;
        let mut rerouter = BytesStart::new("rerouter");
        rerouter.push_attribute(("id", format!("rerouter_{}", section.sim_edge_id).as_str()));
        rerouter.push_attribute(("edges", rerouter_edges.join(" ").as_str()));
        writer.write_event(Event::Start(rerouter))?;
        let mut interval = BytesStart::new("interval");
        interval.push_attribute(("begin", section.begin_second.to_string().as_str()));
        interval.push_attribute(("end", section.end_second.to_string().as_str()));
        writer.write_event(Event::Start(interval))?;
        write_empty(&mut writer, "closingReroute", &[("id", section.sim_edge_id.to_string())])?;
        writer.write_event(Event::End(BytesEnd::new("interval")))?;
        writer.write_event(Event::End(BytesEnd::new("rerouter")))?;
    }
    writer.write_event(Event::End(BytesEnd::new("add"))).ok();
    Ok((finish(writer), num_rerouters))
}

// ---------------------------------------------------------------------
// Route distributions
// ---------------------------------------------------------------------

fn corpus_subdir(edge: &str) -> Option<String> {
    if edge.len() <= 2 {
        return None;
    }
    if let Some(stripped) = edge.strip_prefix('-') {
        (stripped.len() >= 2).then(|| stripped[..2].to_string())
    } else {
        Some(edge[..2].to_string())
    }
}

pub struct StaticRouteResult {
    pub xml: String,
    /// `fbd` ids that have detectors but no corresponding route-distribution
    /// file — surfaced so the caller can log them, per `generateStatic`.
    pub uncovered_fbd_ids: Vec<String>,
}

/// Assembles `static.rou.xml` by concatenating each edge's pre-generated
/// route-distribution fragment; when an edge's own file is missing, reuses
/// any sibling edge mapped to the same `fbd` id(s) that does have one,
/// rewriting the embedded `routedist_<id>` id to the missing edge's id
/// (a file copy, not a regeneration, per spec.md §4.9).
pub fn generate_static_routes(edges: &[String], edge_map: &HashMap<String, Vec<String>>, route_dir: &Path) -> Result<StaticRouteResult, Error> {
    let mut xml = String::from("<?xml version=\"1.0\"?>\n<routes>\n");
    let mut covered_fbd: HashSet<String> = HashSet::new();
    let mut uncovered_fbd: HashSet<String> = HashSet::new();
    let mut matched_map: HashMap<String, Vec<String>> = HashMap::new();
    let mut missed_edges: Vec<String> = Vec::new();

    for edge in edges {
        let Some(sub) = corpus_subdir(edge) else { continue };
        let path = route_dir.join(&sub).join(edge);
        if path.exists() {
            xml.push_str(&std::fs::read_to_string(&path)?);
            for fid in edge_map.get(edge).into_iter().flatten() {
                covered_fbd.insert(fid.clone());
                matched_map.entry(fid.clone()).or_default().push(edge.clone());
            }
        } else {
            for fid in edge_map.get(edge).into_iter().flatten() {
                uncovered_fbd.insert(fid.clone());
            }
            missed_edges.push(edge.clone());
        }
    }

    for missed in &missed_edges {
        let mut found = false;
        for fid in edge_map.get(missed).into_iter().flatten() {
            let Some(reference) = matched_map.get(fid).and_then(|v| v.first()) else { continue };
            let Some(sub) = corpus_subdir(reference) else {
                found = true;
                break;
            };
            let path = route_dir.join(&sub).join(reference);
            if path.exists() {
                let contents = std::fs::read_to_string(&path)?;
                for line in contents.lines() {
                    xml.push_str(&line.replacen(reference.as_str(), missed.as_str(), 1));
                    xml.push('\n');
                }
            }
            found = true;
            break;
        }
        if !found {
            log::warn!("no existing route distribution file suitable for edge {missed}");
        }
    }
    xml.push_str("</routes>\n");
    uncovered_fbd.retain(|f| !covered_fbd.contains(f));
    Ok(StaticRouteResult { xml, uncovered_fbd_ids: uncovered_fbd.into_iter().collect() })
}

/// Tracks the `DYNAMIC`/`INVALID` route-probe edge sets across iterations,
/// per `routeDistributions.py`'s module-level state.
#[derive(Debug, Default)]
pub struct RouteProbeTracker {
    pub dynamic: HashSet<String>,
    pub invalid: HashSet<String>,
    last_reset: Option<NaiveDateTime>,
}

impl RouteProbeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resets on the first call of the day, or once per day in the morning
    /// hours (`checkReset`). Returns whether a reset happened.
    pub fn check_reset(&mut self, is_first: bool, time: NaiveDateTime) -> bool {
        let due = self.last_reset.is_some_and(|last| time - last >= Duration::days(1) && time.hour() < 4);
        if is_first || due {
            self.dynamic.clear();
            self.invalid.clear();
            self.last_reset = Some(time);
            true
        } else {
            false
        }
    }

    /// Folds in one edge's most recent quality reading: newly invalid edges
    /// (quality below threshold, observed right after a reset) are
    /// quarantined for the rest of the day; everyone else accrues into
    /// `dynamic` once.
    pub fn observe(&mut self, edge: &str, quality: f64, quality_threshold: f64, just_reset: bool) {
        if just_reset && quality < quality_threshold {
            self.invalid.insert(edge.to_string());
        } else if !self.invalid.contains(edge) {
            self.dynamic.insert(edge.to_string());
        }
    }

    /// Renders `dynamic.rou.xml`'s `<routeProbe>` add-file content.
    pub fn write_xml(&self, route_interval: Duration, route_start_second: i64) -> Result<String, Error> {
        let mut edges: Vec<&String> = self.dynamic.iter().collect();
        edges.sort();
        let mut writer = xml_writer();
        writer.write_event(Event::Start(BytesStart::new("add"))).ok();
        for edge in edges {
            write_empty(
                &mut writer,
                "routeProbe",
                &[
                    ("id", format!("routedist_{edge}")),
                    ("edge", edge.clone()),
                    ("freq", route_interval.num_seconds().to_string()),
                    ("begin", route_start_second.to_string()),
                    ("file", "NUL".to_string()),
                ],
            )?;
        }
        writer.write_event(Event::End(BytesEnd::new("add"))).ok();
        Ok(finish(writer))
    }
}

// ---------------------------------------------------------------------
// SUMO configuration & invocation
// ---------------------------------------------------------------------

pub struct SumoConfigInputs<'a> {
    pub net_file: &'a str,
    pub route_files: &'a [String],
    pub additional_files: &'a [String],
    pub state_file_in: Option<&'a Path>,
    pub sim_begin_sec: i64,
    pub sim_end_sec: i64,
    pub save_state_file: &'a Path,
    pub save_state_second: i64,
}

/// Renders the `.sumocfg` content: net/route/additional inputs, optional
/// `<load-state>` (with a day-boundary `<load-state.offset value="86400"/>`
/// when the iteration begins exactly at midnight), save-state output, and
/// the begin/end/processing/report sections (`simulationRun.py::main`).
pub fn render_sumocfg(inputs: &SumoConfigInputs) -> Result<String, Error> {
    let mut writer = xml_writer();
    writer.write_event(Event::Start(BytesStart::new("configuration"))).ok();

    writer.write_event(Event::Start(BytesStart::new("input"))).ok();
    write_empty(&mut writer, "net-file", &[("value", inputs.net_file.to_string())])?;
    write_empty(&mut writer, "route-files", &[("value", inputs.route_files.join(","))])?;
    write_empty(&mut writer, "additional-files", &[("value", inputs.additional_files.join(","))])?;
    if let Some(state) = inputs.state_file_in {
        write_empty(&mut writer, "load-state", &[("value", state.display().to_string())])?;
        if inputs.sim_begin_sec == 0 {
            write_empty(&mut writer, "load-state.offset", &[("value", "86400".to_string())])?;
        }
    }
    writer.write_event(Event::End(BytesEnd::new("input"))).ok();

    writer.write_event(Event::Start(BytesStart::new("output"))).ok();
    write_empty(&mut writer, "save-state.files", &[("value", inputs.save_state_file.display().to_string())])?;
    write_empty(&mut writer, "save-state.times", &[("value", inputs.save_state_second.to_string())])?;
    writer.write_event(Event::End(BytesEnd::new("output"))).ok();

    writer.write_event(Event::Start(BytesStart::new("time"))).ok();
    write_empty(&mut writer, "begin", &[("value", inputs.sim_begin_sec.to_string())])?;
    write_empty(&mut writer, "end", &[("value", inputs.sim_end_sec.to_string())])?;
    writer.write_event(Event::End(BytesEnd::new("time"))).ok();

    writer.write_event(Event::Start(BytesStart::new("processing"))).ok();
    write_empty(&mut writer, "ignore-route-errors", &[("value", "true".to_string())])?;
    writer.write_event(Event::End(BytesEnd::new("processing"))).ok();

    writer.write_event(Event::Start(BytesStart::new("report"))).ok();
    write_empty(&mut writer, "no-step-log", &[("value", "true".to_string())])?;
    write_empty(&mut writer, "verbose", &[("value", "true".to_string())])?;
    write_empty(&mut writer, "xml-validation", &[("value", "never".to_string())])?;
    writer.write_event(Event::End(BytesEnd::new("report"))).ok();

    writer.write_event(Event::End(BytesEnd::new("configuration"))).ok();
    Ok(finish(writer))
}

/// Invokes the SUMO binary against `config_path`. A non-zero exit is a
/// soft failure — logged, not propagated — per spec.md §4.9's "treat
/// non-zero exit as a soft failure" contract; the caller proceeds to the
/// next iteration regardless.
pub async fn run_sumo(sumo_binary: &Path, config_path: &Path, extra_args: &[String]) -> Result<bool, Error> {
    let output = Command::new(sumo_binary).arg("-c").arg(config_path).args(extra_args).output().await?;
    if !output.status.success() {
        log::warn!("simulator run exited with {:?}: {}", output.status.code(), String::from_utf8_lossy(&output.stderr));
    }
    Ok(output.status.success())
}

// ---------------------------------------------------------------------
// Dump parsing
// ---------------------------------------------------------------------

/// One `(intervalEnd, trafficType, edgeId, count, speedKmh)` tuple ready
/// for the aggregator.
pub type DumpTuple = (NaiveDateTime, SourceType, i64, i64, f64);

/// Parses a gzipped edgeData CSV dump (`interval_id, interval_begin,
/// interval_end, edge_id, edge_speed, edge_departed, edge_entered,
/// edge_vaporized, …`), resolving each row's synthetic interval id through
/// `plan` and computing `count = departed + entered - vaporized`. Speed is
/// converted from SUMO's m/s to km/h.
pub fn parse_dump(path: &Path, plan: &DumpPlan) -> Result<Vec<DumpTuple>, Error> {
    let file = std::fs::File::open(path)?;
    let decoder = flate2::read::GzDecoder::new(file);
    let mut reader = csv::ReaderBuilder::new().delimiter(b';').has_headers(true).from_reader(decoder);
    let mut out = Vec::new();
    for record in reader.records() {
        let record = record?;
        let Some(interval_id) = record.get(0) else { continue };
        let Some(entry) = plan.entries.get(interval_id) else { continue };
        let edge_id: i64 = record.get(3).and_then(|s| s.parse().ok()).unwrap_or(0);
        let speed_mps: f64 = record.get(4).and_then(|s| s.parse().ok()).unwrap_or(0.0);
        let departed: i64 = record.get(5).and_then(|s| s.parse().ok()).unwrap_or(0);
        let entered: i64 = record.get(6).and_then(|s| s.parse().ok()).unwrap_or(0);
        let vaporized: i64 = record.get(7).and_then(|s| s.parse().ok()).unwrap_or(0);
        let count = departed + entered - vaporized;
        out.push((entry.interval_end, entry.traffic_type, edge_id, count, speed_mps * 3.6));
    }
    Ok(out)
}

// ---------------------------------------------------------------------
// Output mirroring & disk rotation
// ---------------------------------------------------------------------

/// Copies `simulation.txt`/`prediction.txt`/`compare.txt` from
/// `sim_output_dir` into `viewer_dir`, timestamp-suffixed, bracketed by a
/// `lock.txt` the viewer treats as a busy signal (`copyBackupClean`).
pub fn mirror_to_viewer(sim_output_dir: &Path, viewer_dir: &Path, current_time: NaiveDateTime) -> std::io::Result<()> {
    std::fs::create_dir_all(viewer_dir)?;
    let lock_path = viewer_dir.join("lock.txt");
    std::fs::write(&lock_path, format!("{current_time}\n"))?;
    let suffix = current_time.format("_%Y%m%d_%H%M00").to_string();
    for name in ["simulation", "prediction", "compare"] {
        let src = sim_output_dir.join(format!("{name}.txt"));
        if src.exists() {
            std::fs::copy(&src, viewer_dir.join(format!("{name}{suffix}.txt")))?;
        }
    }
    std::fs::remove_file(&lock_path)?;
    Ok(())
}

/// Lists, across `dirs`, every entry whose mtime is older than `deleteafter`
/// relative to `now`.
pub fn stale_entries(dirs: &[PathBuf], now: NaiveDateTime, deleteafter: Duration) -> std::io::Result<Vec<PathBuf>> {
    let mut stale = Vec::new();
    for dir in dirs {
        if !dir.exists() {
            continue;
        }
        let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)?.filter_map(|e| e.ok().map(|e| e.path())).collect();
        entries.sort();
        for entry in entries {
            let modified = std::fs::metadata(&entry)?.modified()?;
            let modified: chrono::DateTime<chrono::Local> = modified.into();
            if modified.naive_local() < now - deleteafter {
                stale.push(entry);
            }
        }
    }
    Ok(stale)
}

/// Removes every path in `victims`, logging (never propagating) a failure
/// on any individual entry (`onRemovalError`).
pub fn remove_all(victims: &[PathBuf]) {
    for victim in victims {
        let result = if victim.is_dir() { std::fs::remove_dir_all(victim) } else { std::fs::remove_file(victim) };
        if let Err(e) = result {
            log::warn!("could not remove {}: {e}", victim.display());
        }
    }
}

/// Oldest-first state-file deletion until `available_bytes()` reports at
/// least 10 GiB free, or no state files remain (`copyBackupClean`'s
/// free-space floor).
pub fn rotate_state_files(state_files: &mut [PathBuf], mut available_bytes: impl FnMut() -> u64) {
    state_files.sort();
    for file in state_files.iter() {
        if available_bytes() >= MIN_FREE_BYTES {
            break;
        }
        if let Err(e) = std::fs::remove_file(file) {
            log::warn!("could not remove {}: {e}", file.display());
        }
    }
}

// ---------------------------------------------------------------------
// DB cleanup
// ---------------------------------------------------------------------

/// Whether the `deleteafterDB` cleanup is due, given when it last ran.
pub fn db_cleanup_due(now: NaiveDateTime, last_cleanup: Option<NaiveDateTime>, deleteafter_db: Duration) -> bool {
    if deleteafter_db <= Duration::zero() {
        return false;
    }
    match last_cleanup {
        Some(last) => now - last > deleteafter_db,
        None => true,
    }
}

/// Deletes `EdgeInterval` rows (and their children) of the simulation and
/// prediction source types older than `now - deleteafter_db`.
pub async fn cleanup_simulation_db(store: &dyn crate::db::Store, now: NaiveDateTime, deleteafter_db: Duration) -> Result<u64, Error> {
    let before = now - deleteafter_db;
    let mut total = 0u64;
    for source in [SourceType::Simulation, SourceType::Prediction] {
        total += store.cleanup_intervals(source, before).await?;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dt(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d).unwrap().and_hms_opt(h, mi, s).unwrap()
    }

    #[test]
    fn plan_iteration_rejects_too_small_forecast() {
        let root = Path::new("/tmp/nonexistent-traffloop-test-root");
        let start = dt(2026, 7, 27, 8, 0, 0);
        let err = plan_iteration(root, "scn", start, true, Duration::minutes(5), Duration::minutes(2), Duration::minutes(5), Duration::minutes(5), Duration::minutes(1));
        assert!(err.is_err());
    }

    #[test]
    fn plan_iteration_accepts_well_formed_schedule() {
        let root = Path::new("/tmp/nonexistent-traffloop-test-root");
        let start = dt(2026, 7, 27, 8, 0, 0);
        let ctx = plan_iteration(root, "scn", start, true, Duration::minutes(10), Duration::minutes(5), Duration::minutes(5), Duration::minutes(5), Duration::minutes(30)).unwrap();
        assert_eq!(ctx.sim_begin, start - Duration::minutes(10));
        assert_eq!(ctx.sim_end, start + Duration::minutes(30));
        assert!(ctx.state_file_in.is_none());
    }

    #[test]
    fn dump_plan_synthesizes_ids_and_types() {
        let start = dt(2026, 7, 27, 8, 0, 0);
        let sim_end = start + Duration::minutes(15);
        let (plan, xml) = build_dump_plan(start, sim_end, Duration::minutes(5), Duration::minutes(10), Duration::minutes(15));
        assert_eq!(plan.entries.len(), 2 + 3);
        assert_eq!(plan.entries["simulation0"].traffic_type, SourceType::Simulation);
        assert_eq!(plan.entries["prediction0"].traffic_type, SourceType::Prediction);
        assert!(xml.contains("edgeData"));
    }

    #[test]
    fn navteq_replace_then_duration() {
        let reference = dt(2026, 7, 27, 0, 0, 0);
        let window_begin = dt(2026, 7, 20, 0, 0, 0);
        let window_end = dt(2026, 8, 3, 0, 0, 0);
        // [(h8m30){h2}] -> begin 08:30 same day, end 10:30 same day.
        let (begin, end) = parse_navteq_validity("[(h8m30){h2}]", reference, window_begin, window_end).unwrap();
        assert_eq!(begin, dt(2026, 7, 27, 8, 30, 0));
        assert_eq!(end, dt(2026, 7, 27, 10, 30, 0));
    }

    #[test]
    fn navteq_outside_window_is_none() {
        let reference = dt(2026, 7, 27, 0, 0, 0);
        let window_begin = dt(2026, 7, 27, 12, 0, 0);
        let window_end = dt(2026, 7, 27, 13, 0, 0);
        assert!(parse_navteq_validity("[(h1){h1}]", reference, window_begin, window_end).is_none());
    }

    #[test]
    fn navteq_unparseable_expression_is_none() {
        let reference = dt(2026, 7, 27, 0, 0, 0);
        assert!(parse_navteq_validity("garbage", reference, reference, reference + Duration::days(1)).is_none());
    }

    #[test]
    fn blockings_emit_vaporizer_and_rerouter() {
        let mut predecessors = HashMap::new();
        predecessors.insert(10i64, vec![1, 2]);
        let edge_map = HashMap::new();
        let interval_begin = dt(2026, 7, 27, 0, 0, 0);
        let interval_end = dt(2026, 7, 28, 0, 0, 0);
        let restrictions = vec![Restriction { edge_id: 10, validity_period: "[(h8){h2}]".to_string() }];
        let (xml, num_rerouters) = generate_blockings(&restrictions, &predecessors, &edge_map, interval_begin, interval_end).unwrap();
        assert!(xml.contains("vaporizer"));
        assert!(xml.contains("rerouter_10"));
        assert!(xml.contains("closingReroute"));
        assert_eq!(num_rerouters, 1);
    }

    #[test]
    fn blockings_skip_predecessor_also_blocked() {
        let mut predecessors = HashMap::new();
        predecessors.insert(10i64, vec![1]);
        let edge_map = HashMap::new();
        let interval_begin = dt(2026, 7, 27, 0, 0, 0);
        let interval_end = dt(2026, 7, 28, 0, 0, 0);
        let restrictions = vec![
            Restriction { edge_id: 10, validity_period: "[(h8){h2}]".to_string() },
            Restriction { edge_id: 1, validity_period: "[(h8){h2}]".to_string() },
        ];
        let (_xml, num_rerouters) = generate_blockings(&restrictions, &predecessors, &edge_map, interval_begin, interval_end).unwrap();
        assert_eq!(num_rerouters, 0);
    }

    #[test]
    fn route_probe_tracker_quarantines_low_quality_on_reset() {
        let mut tracker = RouteProbeTracker::new();
        let t = dt(2026, 7, 27, 1, 0, 0);
        let reset = tracker.check_reset(true, t);
        assert!(reset);
        tracker.observe("edgeA", 10.0, 50.0, reset);
        tracker.observe("edgeB", 90.0, 50.0, reset);
        assert!(tracker.invalid.contains("edgeA"));
        assert!(tracker.dynamic.contains("edgeB"));
        assert!(!tracker.dynamic.contains("edgeA"));
    }

    #[test]
    fn route_probe_tracker_resets_once_per_day_in_morning() {
        let mut tracker = RouteProbeTracker::new();
        tracker.check_reset(true, dt(2026, 7, 27, 1, 0, 0));
        assert!(!tracker.check_reset(false, dt(2026, 7, 27, 10, 0, 0)));
        assert!(!tracker.check_reset(false, dt(2026, 7, 28, 1, 0, 0) - Duration::hours(1)));
        assert!(tracker.check_reset(false, dt(2026, 7, 28, 2, 0, 0)));
    }

    #[test]
    fn rotate_state_files_stops_once_floor_is_met() {
        let mut files = vec![PathBuf::from("/tmp/does-not-exist-a"), PathBuf::from("/tmp/does-not-exist-b")];
        let mut calls = 0;
        rotate_state_files(&mut files, || {
            calls += 1;
            MIN_FREE_BYTES + 1
        });
        assert_eq!(calls, 1);
    }

    #[test]
    fn sumocfg_includes_load_state_offset_at_midnight() {
        let save_state = PathBuf::from("/tmp/state.xml.gz");
        let inputs = SumoConfigInputs {
            net_file: "net.xml",
            route_files: &["static.rou.xml".to_string()],
            additional_files: &["calibrators.add.xml".to_string()],
            state_file_in: Some(Path::new("/tmp/prev_state.xml.gz")),
            sim_begin_sec: 0,
            sim_end_sec: 900,
            save_state_file: &save_state,
            save_state_second: 300,
        };
        let xml = render_sumocfg(&inputs).unwrap();
        assert!(xml.contains("load-state.offset"));
        assert!(xml.contains("86400"));
    }
}
