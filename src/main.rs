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
//! Process entry point: parses the command line, loads the INI
//! configuration, and drives one of the three periodic loops
//! (`detector`, `simulation`, `checkdata`) to completion.
//!
//! Grounded on `original_source/sumo_ldl/main.py` (`parseArgs`, `_init`,
//! `TYPE2SECTION`) and `simulationRun.py::main`.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::{Duration, Local, NaiveDateTime};
use clap::{Parser, ValueEnum};

use traffloop::config::{self, Config};
use traffloop::corrector::{CorrectArgs, DetectorCorrector};
use traffloop::db::{self, DefaultSchema, Schema, Store};
use traffloop::extrapolate::{self, History, Sample};
use traffloop::fusion::{self, SourceContribution};
use traffloop::record::{self, SchemaUnits};
use traffloop::schedule::{IterationPlan, LoopDriver, LoopType};
use traffloop::simulate;
use traffloop::source::SourceType;
use traffloop::step::StepRunner;
use traffloop::window::DetectorId;
use traffloop::{aggregate, util};

/// Which of the three periodic loops this process instance drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LoopTypeArg {
    Detector,
    Simulation,
    Checkdata,
}

impl From<LoopTypeArg> for LoopType {
    fn from(value: LoopTypeArg) -> Self {
        match value {
            LoopTypeArg::Detector => LoopType::Detector,
            LoopTypeArg::Simulation => LoopType::Simulation,
            LoopTypeArg::Checkdata => LoopType::CheckData,
        }
    }
}

/// Continuously-running traffic-data pipeline: detector correction,
/// aggregation/fusion, and a SUMO-driving simulation loop.
#[derive(Debug, Parser)]
#[command(name = "traffloop", version, about)]
struct Cli {
    /// Dotted module path of the schema-translation layer to load. Only
    /// "default" is built in; anything else falls back to it with a
    /// warning (a real deployment plugs its own `db::Schema` in here).
    #[arg(long, default_value = "default")]
    schema: String,

    /// Deployment region selector, shadowing `.region`-suffixed config keys.
    #[arg(long)]
    region: Option<String>,

    /// Path to the INI configuration file.
    #[arg(long = "conf")]
    conf_file: PathBuf,

    /// Which loop this process instance drives.
    #[arg(long = "type", value_enum)]
    loop_type: LoopTypeArg,

    /// Overrides the configured start time (`YYYY-MM-DD HH:MM` or `-H:MM`).
    #[arg(long)]
    begin: Option<String>,

    /// Overrides the configured end time (`YYYY-MM-DD HH:MM` or `-H:MM`).
    #[arg(long)]
    end: Option<String>,

    /// Scenario name; selects the simulation staging subdirectory.
    #[arg(long, default_value = "default")]
    scenario: String,

    /// Path to a log4rs config file; falls back to console logging.
    #[arg(long = "log")]
    log_path: Option<PathBuf>,

    /// Runs disk/DB housekeeping once and exits, without entering the loop.
    #[arg(long)]
    clean: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match &cli.log_path {
        Some(path) => log4rs::init_file(path, Default::default()).map_err(|e| anyhow::anyhow!("{e}"))?,
        None => util::init_logging(),
    }

    if cli.schema != "default" {
        log::warn!("schema module {:?} is not built in; falling back to the default schema", cli.schema);
    }
    let schema = DefaultSchema::default();

    let config = Config::load(&cli.conf_file, cli.region.clone())?;
    let now = Local::now().naive_local();

    let section = LoopType::from(cli.loop_type).config_section();
    let begin = match &cli.begin {
        Some(raw) => config::parse_date(raw, now).map_err(|e| anyhow::anyhow!("--begin: {e}"))?,
        None => config.get_option_date(section, "starttime", now)?.unwrap_or(now),
    };
    let end = match &cli.end {
        Some(raw) => config::parse_date(raw, now).map_err(|e| anyhow::anyhow!("--end: {e}"))?,
        None => config.get_option_date(section, "endtime", now)?.unwrap_or(now + Duration::days(365)),
    };

    // A production deployment plugs in its own `db::Store` backed by the
    // real relational store (out of scope per spec: this crate only
    // defines the narrow trait boundary). The in-process `MemoryStore`
    // stands in here so the loops below are runnable end-to-end.
    let store = db::memory::MemoryStore::new(vec![]);

    if cli.clean {
        return run_clean(&cli, &config, now, &store).await;
    }

    match cli.loop_type {
        LoopTypeArg::Detector => run_detector_loop(&cli, &config, &schema, &store, begin, end).await,
        LoopTypeArg::Simulation => run_simulation_loop(&cli, &config, &store, begin, end).await,
        LoopTypeArg::Checkdata => run_checkdata_loop(&cli, &config, &store, begin, end).await,
    }
}

fn minutes(config: &Config, section: &str, key: &str, default_minutes: i64) -> anyhow::Result<Duration> {
    Ok(config.get_minutes(section, key)?.unwrap_or(Duration::minutes(default_minutes)))
}

// ---------------------------------------------------------------------
// Detector loop
// ---------------------------------------------------------------------

async fn run_detector_loop(
    cli: &Cli,
    config: &Config,
    schema: &dyn Schema,
    store: &dyn Store,
    begin: NaiveDateTime,
    end: NaiveDateTime,
) -> anyhow::Result<()> {
    let repeat = minutes(config, "Detector", "repeat", 5)?;
    let lookback = minutes(config, "Detector", "lookback", 0)?;
    let firstlookback = minutes(config, "Detector", "firstlookback", lookback.num_minutes().max(60))?;
    let lookahead = minutes(config, "Detector", "lookahead", 0)?;
    let update_interval = minutes(config, "Detector", "updateinterval", 1)?;
    let evaluation_interval = minutes(config, "Detector", "evaluationinterval", 60)?;
    let haslkw = config.get_bool("Detector", "haslkw", true);
    let checkdoubling = config.get_bool("Detector", "checkdoubling", true);

    // spec.md §4.10: every repeat, correctDetector then aggregateDetector,
    // aggregateFCD, optionally fusion, optionally extrapolation.
    let do_detector_aggregation = config.get_bool("Detector", "doDetectorAggregation", true);
    let aggregate_fcd = config.get_bool("Detector", "aggregateFCD", false);
    let tls_wait_fcd = config.get_bool("Detector", "tlsWaitFCD", false);
    let do_fusion = config.get_bool("Detector", "doFusion", false);
    let do_forecast = config.get_bool("Detector", "doForecast", false);

    let units = SchemaUnits {
        kmh_multiplier: if config.get_bool("Detector", "speedAlreadyKmh", false) { 1.0 } else { 3.6 },
        max_lane_speed: config.get_f64("Detector", "maxLaneSpeed")?.unwrap_or(250.0),
        update_interval_secs: update_interval.num_seconds() as f64,
    };
    let loop_flow_scale = schema.flow_scale(SourceType::Loop, units.update_interval_secs, repeat.num_seconds() as f64);
    let fcd_flow_scale = schema.flow_scale(SourceType::Fcd, units.update_interval_secs, repeat.num_seconds() as f64);

    let mut corrector = DetectorCorrector::new(units, haslkw, checkdoubling, update_interval, begin);
    let mut steps = StepRunner::new();
    let token_path = rendezvous_path(cli, "detector.token");

    let mut driver = LoopDriver { loop_type: LoopType::Detector, repeat, delay: Duration::zero(), end_time: end, now: || Local::now().naive_local(), monitoring_endpoint: None };
    driver
        .run(begin, |plan: IterationPlan| {
            let corrector = &mut corrector;
            let steps = &mut steps;
            let token_path = token_path.clone();
            let lookback_this_run = if plan.is_first { firstlookback } else { lookback };
            async move {
                let args = CorrectArgs {
                    is_first: plan.is_first,
                    correct_start: plan.start_time - lookback_this_run,
                    correct_end: plan.start_time,
                    forecast_end: plan.start_time + lookahead,
                    evaluation_interval,
                    update_interval,
                    eval_quality: true,
                };
                let outcome = steps
                    .run_async("correct detectors", async {
                        corrector.correct(store, args).await.map(|progress| (progress, String::new())).map_err(anyhow::Error::from)
                    })
                    .await;
                let progress = outcome.result.unwrap_or(false);
                if progress {
                    if let Some(path) = &token_path {
                        publish_token(path, plan.start_time);
                    }
                }

                let window_start = plan.start_time - repeat;
                let mut known_edges: HashSet<i64> = HashSet::new();
                let mut have_data: HashSet<i64> = HashSet::new();

                if do_detector_aggregation {
                    match store.detector_groups(update_interval.num_seconds()).await {
                        Ok(groups) => {
                            known_edges.extend(groups.values().copied());
                            match aggregate_loop_interval(store, &groups, haslkw, update_interval, window_start, plan.start_time, loop_flow_scale).await {
                                Ok(written) => have_data.extend(written),
                                Err(e) => log::warn!("loop aggregation failed: {e:#}"),
                            }
                        }
                        Err(e) => log::warn!("could not load detector groups: {e:#}"),
                    }
                }
                if aggregate_fcd {
                    match aggregate_fcd_interval(store, window_start, plan.start_time, tls_wait_fcd, fcd_flow_scale).await {
                        Ok(written) => have_data.extend(written),
                        Err(e) => log::warn!("fcd aggregation failed: {e:#}"),
                    }
                }
                if do_fusion {
                    if let Err(e) = fuse_latest_edges(store, plan.start_time).await {
                        log::warn!("fusion failed: {e:#}");
                    }
                }
                if do_forecast {
                    if let Err(e) = extrapolate_missing_edges(store, &known_edges, &have_data, plan.start_time, update_interval).await {
                        log::warn!("extrapolation failed: {e:#}");
                    }
                }

                (true, progress)
            }
        })
        .await;

    Ok(())
}

/// Rolls corrected detector readings up to per-edge loop aggregates for
/// `[window_start, window_end)`, grouping detectors through their
/// `DetectorGroup` (spec.md §4.6); the group id doubles as the edge id it
/// reports under, per `DetectorGroup`'s "one or more detectors on the same
/// edge" definition. Returns the set of edge ids written.
async fn aggregate_loop_interval(
    store: &dyn Store,
    groups: &HashMap<DetectorId, i64>,
    haslkw: bool,
    update_interval: Duration,
    window_start: NaiveDateTime,
    window_end: NaiveDateTime,
    flow_scale: f64,
) -> anyhow::Result<HashSet<i64>> {
    let expected_slots = ((window_end - window_start).num_seconds() as f64 / update_interval.num_seconds() as f64).max(1.0);
    let max_possible = record::max_quality_points(haslkw) as f64;

    let mut per_detector: HashMap<DetectorId, (f64, f64, f64, f64, u32)> = HashMap::new();
    for &detector in groups.keys() {
        let rows = store.load_corrected(detector, window_start, window_end).await?;
        let mut flow_sum = 0.0;
        let mut speed_weighted = 0.0;
        let mut quality_sum = 0.0;
        let mut entries = 0u32;
        for (t, r) in &rows {
            let flow = r.q_pkw.unwrap_or(0.0) + if haslkw { r.q_lkw.unwrap_or(0.0) } else { 0.0 };
            flow_sum += flow;
            if let Some(v) = r.v_pkw {
                speed_weighted += v * flow;
            }
            quality_sum += 100.0 * r.quality(*t, haslkw) as f64 / max_possible;
            entries += 1;
        }
        let coverage = entries as f64 / expected_slots;
        per_detector.insert(detector, (flow_sum, speed_weighted, quality_sum, coverage, entries));
    }

    let mut per_group: HashMap<i64, (f64, f64, f64, f64, u32, u32)> = HashMap::new();
    for (&detector, &group) in groups {
        let (flow, speed, quality, coverage, entries) = per_detector.get(&detector).copied().unwrap_or((0.0, 0.0, 0.0, 0.0, 0));
        let e = per_group.entry(group).or_insert((0.0, 0.0, 0.0, 0.0, 0, 0));
        e.0 += flow;
        e.1 += speed;
        e.2 += quality;
        e.3 += coverage;
        e.4 += entries;
        e.5 += 1;
    }

    let contributions: Vec<(i64, Option<f64>, Option<f64>, f64, f64, u32)> = per_group
        .into_iter()
        .filter(|(_, (_, _, _, _, entries, _))| *entries > 0)
        .map(|(group, (flow, speed, quality, coverage_sum, entries, members))| {
            let quality_avg = quality / entries as f64;
            let coverage_avg = coverage_sum / members.max(1) as f64;
            let speed_avg = if flow > 0.0 { Some(speed / flow) } else { None };
            (group, Some(flow), speed_avg, quality_avg, coverage_avg, entries)
        })
        .collect();
    if contributions.is_empty() {
        return Ok(HashSet::new());
    }

    let (edges, _unknown) = aggregate::accumulate_edges(contributions, None);
    let params = aggregate::AggregateParams { expected_entry_count: Some(expected_slots), source: SourceType::Loop, flow_scale };
    let rows: Vec<db::EdgeDataRow> = edges
        .into_iter()
        .map(|(edge_id, acc)| {
            let f = aggregate::finalize(&acc, &params);
            db::EdgeDataRow { edge_id, flow: f.flow, speed: f.speed, quality: f.quality }
        })
        .collect();
    let written: HashSet<i64> = rows.iter().map(|r| r.edge_id).collect();
    let interval_id = store.ensure_interval(SourceType::Loop, window_end).await?;
    store.replace_edge_data(interval_id, &rows).await?;
    Ok(written)
}

/// Rolls filtered FCD sightings up to per-edge aggregates for
/// `[window_start, window_end)`. Returns the set of edge ids written.
async fn aggregate_fcd_interval(
    store: &dyn Store,
    window_start: NaiveDateTime,
    window_end: NaiveDateTime,
    tls_wait_correction: bool,
    flow_scale: f64,
) -> anyhow::Result<HashSet<i64>> {
    let sightings = store.load_fcd_sightings(window_start, window_end).await?;
    if sightings.is_empty() {
        return Ok(HashSet::new());
    }
    let filtered = aggregate::filter_fcd(sightings, tls_wait_correction, aggregate::TLS_WAIT_DISTANCE_M, aggregate::TLS_WAIT_SPEED_THRESHOLD);
    let contributions = filtered.into_iter().map(|(edge_id, speed)| (edge_id, Some(1.0), speed, 100.0, 1.0, 1u32));
    let (edges, _unknown) = aggregate::accumulate_edges(contributions, None);
    let params = aggregate::AggregateParams { expected_entry_count: None, source: SourceType::Fcd, flow_scale };
    let rows: Vec<db::EdgeDataRow> = edges
        .into_iter()
        .map(|(edge_id, acc)| {
            let f = aggregate::finalize(&acc, &params);
            db::EdgeDataRow { edge_id, flow: f.flow, speed: f.speed, quality: f.quality }
        })
        .collect();
    if rows.is_empty() {
        return Ok(HashSet::new());
    }
    let written: HashSet<i64> = rows.iter().map(|r| r.edge_id).collect();
    let interval_id = store.ensure_interval(SourceType::Fcd, window_end).await?;
    store.replace_edge_data(interval_id, &rows).await?;
    Ok(written)
}

/// Historic-periodicity fallback (spec.md §4.8) for edges neither loop nor
/// FCD reported on this tick: samples the same weekday's `Fusion` history at
/// `WEEK_OFFSETS` weeks back (smoothed over `SMOOTHING_WIDTH` slots either
/// side) through exact-match interval reads, and writes an `Extrapolation`
/// row wherever that average yields a value. Skips the feedback-correction
/// and self-quality-assessment refinements of `extrapolate::feedback_predict`
/// / `estimate_quality`, which need a dense per-slot measured/predicted
/// comparison history this narrow store boundary doesn't cheaply provide.
async fn extrapolate_missing_edges(
    store: &dyn Store,
    known_edges: &HashSet<i64>,
    have_data: &HashSet<i64>,
    at: NaiveDateTime,
    update_interval: Duration,
) -> anyhow::Result<()> {
    let missing: Vec<i64> = known_edges.difference(have_data).copied().collect();
    if missing.is_empty() {
        return Ok(());
    }
    let offsets: Vec<NaiveDateTime> = extrapolate::WEEK_OFFSETS
        .iter()
        .flat_map(|&w| {
            (-extrapolate::SMOOTHING_WIDTH..=extrapolate::SMOOTHING_WIDTH)
                .map(move |k| at - Duration::days(7 * w) + update_interval * k as i32)
        })
        .collect();

    let mut by_edge: HashMap<i64, HashMap<NaiveDateTime, Sample>> = HashMap::new();
    for t in offsets {
        let rows = store.edge_data_at(SourceType::Fusion, t).await?;
        for (edge_id, row) in rows {
            by_edge
                .entry(edge_id)
                .or_default()
                .insert(t, Sample { flow: row.flow.map(|f| f as f64), speed: row.speed });
        }
    }

    let mut out_rows = Vec::new();
    for edge_id in missing {
        let Some(samples) = by_edge.get(&edge_id) else { continue };
        let history = History { samples, update_interval };
        let predicted = extrapolate::primary_predict(&history, at);
        if predicted.flow.is_none() && predicted.speed.is_none() {
            continue;
        }
        out_rows.push(db::EdgeDataRow {
            edge_id,
            flow: predicted.flow.map(|f| f.trunc() as i64),
            speed: predicted.speed,
            quality: 50.0,
        });
    }
    if out_rows.is_empty() {
        return Ok(());
    }
    let interval_id = store.ensure_interval(SourceType::Extrapolation, at).await?;
    store.replace_edge_data(interval_id, &out_rows).await?;
    Ok(())
}

// ---------------------------------------------------------------------
// Simulation loop
// ---------------------------------------------------------------------

async fn run_simulation_loop(cli: &Cli, config: &Config, store: &dyn Store, begin: NaiveDateTime, end: NaiveDateTime) -> anyhow::Result<()> {
    let repeat = minutes(config, "Loop", "repeat", 15)?;
    let overlap = minutes(config, "Loop", "overlap", 5)?;
    let prefirst = minutes(config, "Loop", "prefirst", repeat.num_minutes() + overlap.num_minutes())?;
    let forecast = minutes(config, "Loop", "forecast", 60)?;
    let aggregation = minutes(config, "Loop", "aggregate", 5)?;
    let deleteafter = minutes(config, "Loop", "deleteafter", 24 * 60)?;
    let deleteafterdb = minutes(config, "Loop", "deleteafterDB", 7 * 24 * 60)?;

    let net_file = config.require_string("Loop", "net")?;
    let sumo_binary = PathBuf::from(config.require_string("Loop", "sumobinary")?);
    let extra_args: Vec<String> = config
        .get_string("Loop", "sumoOptions")
        .map(|s| s.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default();
    let additional_files: Vec<String> = config
        .get_string("Loop", "adds")
        .map(|s| s.split(',').map(str::trim).map(str::to_string).collect())
        .unwrap_or_default();
    let root = PathBuf::from(config.get_string("Loop", "simRoot").unwrap_or_else(|| "sim".to_string()));
    let viewer_dir = config.get_string("Loop", "viewerData").map(PathBuf::from);

    let token_path = rendezvous_path(cli, "detector.token");
    let base_dir = root.join(&cli.scenario);
    let mut last_db_cleanup: Option<NaiveDateTime> = None;
    let mut steps = StepRunner::new();

    let mut driver = LoopDriver { loop_type: LoopType::Simulation, repeat, delay: Duration::zero(), end_time: end, now: || Local::now().naive_local(), monitoring_endpoint: None };
    driver
        .run(begin, |plan: IterationPlan| {
            let root = root.clone();
            let net_file = net_file.clone();
            let sumo_binary = sumo_binary.clone();
            let extra_args = extra_args.clone();
            let additional_files = additional_files.clone();
            let viewer_dir = viewer_dir.clone();
            let token_path = token_path.clone();
            let base_dir = base_dir.clone();
            let scenario = cli.scenario.clone();
            let last_db_cleanup = &mut last_db_cleanup;
            let steps = &mut steps;
            async move {
                if let Some(path) = &token_path {
                    wait_for_token(path, plan.start_time).await;
                }
                let result = run_simulation_iteration(SimulationIterationInputs {
                    root: &root,
                    scenario: &scenario,
                    plan,
                    prefirst,
                    overlap,
                    repeat,
                    aggregation,
                    forecast,
                    net_file: &net_file,
                    sumo_binary: &sumo_binary,
                    extra_args: &extra_args,
                    additional_files: &additional_files,
                    viewer_dir: viewer_dir.as_deref(),
                    store,
                    steps,
                })
                .await;
                if let Err(e) = &result {
                    log::error!("simulation iteration failed: {e:#}");
                }

                let dirs = vec![base_dir.join("check"), base_dir.join("sim_inputs"), base_dir.join("sim_outputs")];
                match simulate::stale_entries(&dirs, plan.start_time, deleteafter) {
                    Ok(stale) => simulate::remove_all(&stale),
                    Err(e) => log::warn!("disk rotation scan failed: {e}"),
                }
                if simulate::db_cleanup_due(plan.start_time, *last_db_cleanup, deleteafterdb) {
                    match simulate::cleanup_simulation_db(store, plan.start_time, deleteafterdb).await {
                        Ok(deleted) => {
                            log::info!("cleaned up {deleted} stale simulation/prediction intervals");
                            *last_db_cleanup = Some(plan.start_time);
                        }
                        Err(e) => log::warn!("db cleanup failed: {e}"),
                    }
                }

                (true, result.is_ok())
            }
        })
        .await;

    Ok(())
}

struct SimulationIterationInputs<'a> {
    root: &'a Path,
    scenario: &'a str,
    plan: IterationPlan,
    prefirst: Duration,
    overlap: Duration,
    repeat: Duration,
    aggregation: Duration,
    forecast: Duration,
    net_file: &'a str,
    sumo_binary: &'a Path,
    extra_args: &'a [String],
    additional_files: &'a [String],
    viewer_dir: Option<&'a Path>,
    store: &'a dyn Store,
    steps: &'a mut StepRunner,
}

/// One full simulation iteration: stages directories, fuses the latest
/// loop/FCD edge snapshots, runs SUMO, parses its dump, writes the
/// resulting simulation/prediction edge data, mirrors viewer artifacts and
/// rotates the saved-state file.
async fn run_simulation_iteration(inputs: SimulationIterationInputs<'_>) -> anyhow::Result<()> {
    let ctx = simulate::plan_iteration(
        inputs.root,
        inputs.scenario,
        inputs.plan.start_time,
        inputs.plan.is_first,
        inputs.prefirst,
        inputs.overlap,
        inputs.repeat,
        inputs.aggregation,
        inputs.forecast,
    )?;
    simulate::stage_dirs(&ctx)?;

    fuse_latest_edges(inputs.store, inputs.plan.start_time).await?;

    let (_dump_plan, dump_xml) = simulate::build_dump_plan(inputs.plan.start_time, ctx.sim_end, inputs.aggregation, inputs.repeat, inputs.forecast);
    let dump_plan_path = ctx.input_dir.join("dump.add.xml");
    std::fs::write(&dump_plan_path, dump_xml)?;

    let mut route_files = Vec::new();
    let mut additional_files: Vec<String> = vec![dump_plan_path.display().to_string()];
    additional_files.extend(inputs.additional_files.iter().cloned());

    // Calibrators and the static route distribution are both driven by the
    // just-fused edge snapshot: an edge with no fused reading this tick gets
    // neither a calibrator flow nor a route file.
    let fused = inputs.store.latest_edge_data(SourceType::Fusion, inputs.plan.start_time).await?;
    if !fused.is_empty() {
        let samples: HashMap<String, Vec<simulate::CalibratorSample>> = fused
            .iter()
            .map(|(edge_id, row)| {
                let sample = simulate::CalibratorSample {
                    time: inputs.plan.start_time,
                    agg_interval: inputs.aggregation,
                    flow: row.flow.map(|f| f as f64),
                    speed: row.speed,
                    quality: row.quality,
                    is_extrapolation: false,
                };
                (edge_id.to_string(), vec![sample])
            })
            .collect();
        let calibrator_xml = simulate::write_calibrators(&samples, ctx.sim_begin, inputs.aggregation, "calibrator_out.xml", false)?;
        let calibrator_path = ctx.input_dir.join("calibrators.add.xml");
        std::fs::write(&calibrator_path, calibrator_xml)?;
        additional_files.push(calibrator_path.display().to_string());

        // No Store surface maps a sim edge to the fbd id(s) it was derived
        // from, so the missing-file fallback in `generate_static_routes`
        // (reuse a sibling edge's route file) never triggers here; an edge
        // without its own pre-generated corpus file is simply left out.
        let edges: Vec<String> = fused.keys().map(|id| id.to_string()).collect();
        let route_dir = inputs.root.join("infra");
        let static_routes = simulate::generate_static_routes(&edges, &HashMap::new(), &route_dir)?;
        let route_path = ctx.input_dir.join("static.rou.xml");
        std::fs::write(&route_path, static_routes.xml)?;
        route_files.push(route_path.display().to_string());
    }

    let restrictions = inputs.store.restrictions().await?;
    if !restrictions.is_empty() {
        let predecessors = inputs.store.edge_predecessors().await?;
        let edge_map = inputs.store.simulation_edge_map().await?;
        let (blockings_xml, num_rerouters) = simulate::generate_blockings(&restrictions, &predecessors, &edge_map, ctx.sim_begin, ctx.sim_end)?;
        log::info!("generated {num_rerouters} rerouters from {} active restrictions", restrictions.len());
        let blockings_path = ctx.input_dir.join("blockings.add.xml");
        std::fs::write(&blockings_path, blockings_xml)?;
        additional_files.push(blockings_path.display().to_string());
    }

    let sumocfg_inputs = simulate::SumoConfigInputs {
        net_file: inputs.net_file,
        route_files: &route_files,
        additional_files: &additional_files,
        state_file_in: ctx.state_file_in.as_deref(),
        sim_begin_sec: 0,
        sim_end_sec: (ctx.sim_end - ctx.sim_begin).num_seconds(),
        save_state_file: &ctx.state_file_out,
        save_state_second: (ctx.save_state_time - ctx.sim_begin).num_seconds(),
    };
    let sumocfg = simulate::render_sumocfg(&sumocfg_inputs)?;
    let sumocfg_path = ctx.input_dir.join("sim.sumocfg");
    std::fs::write(&sumocfg_path, sumocfg)?;

    let outcome = inputs
        .steps
        .run_async("run sumo", async {
            simulate::run_sumo(inputs.sumo_binary, &sumocfg_path, inputs.extra_args).await.map(|ok| (ok, String::new())).map_err(anyhow::Error::from)
        })
        .await;
    let ran_cleanly = outcome.result.unwrap_or(false);
    if !ran_cleanly {
        log::warn!("simulator run for {} reported a non-zero exit", inputs.plan.start_time);
    }

    let dump_path = ctx.output_dir.join("dump.csv.gz");
    if dump_path.exists() {
        let rows = simulate::parse_dump(&dump_path, &ctx.dump_plan)?;
        write_simulation_rows(inputs.store, rows).await?;
    }

    write_comparison(inputs.store, &ctx.output_dir, inputs.plan.start_time).await?;

    if let Some(viewer_dir) = inputs.viewer_dir {
        simulate::mirror_to_viewer(&ctx.output_dir, viewer_dir, inputs.plan.start_time)?;
    }

    Ok(())
}

/// Writes `compare.txt`: the latest snapshot of every source type, side by
/// side per edge, for whoever is watching this scenario run.
async fn write_comparison(store: &dyn Store, output_dir: &Path, at: NaiveDateTime) -> anyhow::Result<()> {
    const COMPARISON_TYPES: [SourceType; 4] = [SourceType::Loop, SourceType::Fcd, SourceType::Fusion, SourceType::Simulation];

    let mut by_type = Vec::with_capacity(COMPARISON_TYPES.len());
    for source in COMPARISON_TYPES {
        by_type.push(store.latest_edge_data(source, at).await?);
    }

    let mut edge_ids: Vec<i64> = by_type.iter().flat_map(|m| m.keys()).copied().collect();
    edge_ids.sort_unstable();
    edge_ids.dedup();
    if edge_ids.is_empty() {
        return Ok(());
    }

    let rows: Vec<aggregate::ComparisonRow> = edge_ids
        .into_iter()
        .map(|edge_id| {
            let values = COMPARISON_TYPES
                .iter()
                .zip(by_type.iter())
                .filter_map(|(source, data)| data.get(&edge_id).map(|row| (*source, (row.flow, row.speed))))
                .collect();
            aggregate::ComparisonRow { edge_id, values }
        })
        .collect();

    let report = aggregate::generate_comparison(at, &rows, &COMPARISON_TYPES);
    std::fs::write(output_dir.join("compare.txt"), report)?;
    Ok(())
}

/// Writes the parsed dump rows to the store, grouped by `(source, interval)`.
async fn write_simulation_rows(store: &dyn Store, rows: Vec<simulate::DumpTuple>) -> anyhow::Result<()> {
    use std::collections::HashMap;

    let mut by_interval: HashMap<(SourceType, NaiveDateTime), Vec<(i64, i64, f64)>> = HashMap::new();
    for (interval_end, source, edge_id, count, speed_kmh) in rows {
        by_interval.entry((source, interval_end)).or_default().push((edge_id, count, speed_kmh));
    }

    for ((source, interval_end), entries) in by_interval {
        let mut edges: HashMap<i64, aggregate::EdgeAccumulator> = HashMap::new();
        for (edge_id, count, speed_kmh) in entries {
            edges.entry(edge_id).or_default().add(Some(count as f64), Some(speed_kmh), 100.0, 1.0, 1);
        }
        let params = aggregate::AggregateParams { expected_entry_count: Some(1.0), source, flow_scale: 1.0 };
        let edge_rows: Vec<db::EdgeDataRow> = edges
            .into_iter()
            .map(|(edge_id, acc)| {
                let final_values = aggregate::finalize(&acc, &params);
                db::EdgeDataRow { edge_id, flow: final_values.flow, speed: final_values.speed, quality: final_values.quality }
            })
            .collect();
        let interval_id = store.ensure_interval(source, interval_end).await?;
        store.replace_edge_data(interval_id, &edge_rows).await?;
    }
    Ok(())
}

/// Fuses the latest loop and FCD edge snapshots into a `Fusion`-typed
/// interval, ahead of the calibrator stage that consumes it.
async fn fuse_latest_edges(store: &dyn Store, at: NaiveDateTime) -> anyhow::Result<()> {
    let loop_data = store.latest_edge_data(SourceType::Loop, at).await?;
    let fcd_data = store.latest_edge_data(SourceType::Fcd, at).await?;
    if loop_data.is_empty() && fcd_data.is_empty() {
        return Ok(());
    }

    let mut edge_ids: Vec<i64> = loop_data.keys().chain(fcd_data.keys()).copied().collect();
    edge_ids.sort_unstable();
    edge_ids.dedup();

    let mut rows = Vec::new();
    for edge_id in edge_ids {
        let mut contributions = Vec::new();
        if let Some(row) = loop_data.get(&edge_id) {
            contributions.push(SourceContribution { source: SourceType::Loop, flow: row.flow.map(|f| f as f64), speed: row.speed, quality_pct: row.quality });
        }
        if let Some(row) = fcd_data.get(&edge_id) {
            contributions.push(SourceContribution { source: SourceType::Fcd, flow: row.flow.map(|f| f as f64), speed: row.speed, quality_pct: row.quality });
        }
        if let Some(fused) = fusion::fuse_edge(&contributions) {
            rows.push(db::EdgeDataRow { edge_id, flow: fused.flow.map(|f| f as i64), speed: fused.speed, quality: fused.quality_pct });
        }
    }
    if rows.is_empty() {
        return Ok(());
    }
    let interval_id = store.ensure_interval(SourceType::Fusion, at).await?;
    store.replace_edge_data(interval_id, &rows).await?;
    Ok(())
}

// ---------------------------------------------------------------------
// Checkdata loop: read-only staleness sweep
// ---------------------------------------------------------------------

async fn run_checkdata_loop(cli: &Cli, config: &Config, store: &dyn Store, begin: NaiveDateTime, end: NaiveDateTime) -> anyhow::Result<()> {
    let _ = cli;
    let repeat = minutes(config, "PSM", "repeat", 15)?;
    let update_interval = minutes(config, "Detector", "updateinterval", 1)?;
    let staleness_threshold = minutes(config, "PSM", "stalenessThreshold", 15)?;

    let mut driver = LoopDriver { loop_type: LoopType::CheckData, repeat, delay: Duration::zero(), end_time: end, now: || Local::now().naive_local(), monitoring_endpoint: None };
    driver
        .run(begin, |plan: IterationPlan| async move {
            match check_staleness(store, plan.start_time, staleness_threshold, update_interval).await {
                Ok(stale) => {
                    if stale > 0 {
                        log::warn!("{stale} detectors have no corrected data within the last {} minutes", staleness_threshold.num_minutes());
                    }
                    (true, stale)
                }
                Err(e) => {
                    log::error!("checkdata sweep failed: {e:#}");
                    (true, 0)
                }
            }
        })
        .await;
    Ok(())
}

/// Logs, but never corrects, detectors whose most recent corrected row is
/// older than `threshold` relative to `at`.
async fn check_staleness(store: &dyn Store, at: NaiveDateTime, threshold: Duration, update_interval: Duration) -> anyhow::Result<u32> {
    let ids = store.detector_ids(update_interval.num_seconds()).await?;
    let mut stale = 0u32;
    for detector in ids {
        let rows = store.load_corrected(detector, at - threshold, at).await?;
        if rows.is_empty() {
            log::warn!("detector {detector} has no corrected data since {}", at - threshold);
            stale += 1;
        }
    }
    Ok(stale)
}

// ---------------------------------------------------------------------
// Housekeeping (`--clean`)
// ---------------------------------------------------------------------

async fn run_clean(cli: &Cli, config: &Config, now: NaiveDateTime, store: &dyn Store) -> anyhow::Result<()> {
    let deleteafter = minutes(config, "Loop", "deleteafter", 24 * 60)?;
    let deleteafterdb = minutes(config, "Loop", "deleteafterDB", 7 * 24 * 60)?;
    let root = PathBuf::from(config.get_string("Loop", "simRoot").unwrap_or_else(|| "sim".to_string()));
    let base = root.join(&cli.scenario);

    let dirs = vec![base.join("check"), base.join("sim_inputs"), base.join("sim_outputs")];
    let stale = simulate::stale_entries(&dirs, now, deleteafter)?;
    log::info!("removing {} stale iteration directories", stale.len());
    simulate::remove_all(&stale);

    let deleted = simulate::cleanup_simulation_db(store, now, deleteafterdb).await?;
    log::info!("cleaned up {deleted} stale simulation/prediction intervals");
    Ok(())
}

// ---------------------------------------------------------------------
// File-based rendezvous token
// ---------------------------------------------------------------------
//
// Replaces STOP/CONT child-process signaling (spec design note): the
// detector loop, after each successful iteration, writes the
// `intervalEnd` it just committed to a small token file; the simulation
// loop polls that file until a published value reaches its own required
// bound. This crate's `schedule::RendezvousToken` offers the same
// contract over an in-memory `tokio::sync::watch` channel for tests and
// for a single-binary deployment running both loops as tasks; here, where
// each loop is its own process per spec.md §6's process surface, the
// coordination has to cross a process boundary, hence the token file.

fn rendezvous_path(cli: &Cli, name: &str) -> Option<PathBuf> {
    Some(PathBuf::from(&cli.scenario).join(name))
}

fn publish_token(path: &Path, interval_end: NaiveDateTime) {
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    if let Err(e) = std::fs::write(path, interval_end.format("%Y-%m-%d %H:%M:%S").to_string()) {
        log::warn!("could not publish rendezvous token to {}: {e}", path.display());
    }
}

fn read_token(path: &Path) -> Option<NaiveDateTime> {
    let contents = std::fs::read_to_string(path).ok()?;
    NaiveDateTime::parse_from_str(contents.trim(), "%Y-%m-%d %H:%M:%S").ok()
}

async fn wait_for_token(path: &Path, required: NaiveDateTime) {
    loop {
        if let Some(published) = read_token(path) {
            if published >= required {
                return;
            }
        }
        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
    }
}
