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
//! The two periodic driver loops (detector correction, simulation) plus
//! the `checkdata` variant, their pacing/alignment arithmetic, and the
//! rendezvous-token mechanism that replaces STOP/CONT child-process
//! signaling for cross-loop ordering.
//!
//! Grounded on `original_source/sumo_ldl/main.py` (`_init`, `_startLoop`,
//! `sendMessageToPsm`).

use std::future::Future;

use chrono::{Duration, NaiveDateTime};
use tokio::sync::watch;
use tokio::time::sleep;

use crate::time_index::day_minute;

/// Which config section and `mainFunc` a run dispatches to (`TYPE2SECTION`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopType {
    Detector,
    Simulation,
    CheckData,
}

impl LoopType {
    pub fn config_section(self) -> &'static str {
        match self {
            LoopType::Detector => "Detector",
            LoopType::Simulation => "Loop",
            LoopType::CheckData => "PSM",
        }
    }
}

/// Rounds `start_time` down to a multiple of `repeat`, then bumps it
/// forward if the result still isn't aligned to `repeat` within the day —
/// the `tools.roundToMinute(..., ROUND_DOWN)` + `startTime.minute %
/// repeatMin` bump from `main.py::_init`.
pub fn align_start_time(start_time: NaiveDateTime, repeat: Duration) -> NaiveDateTime {
    let rounded = crate::time_index::round_to_minute(start_time, repeat, crate::time_index::Rounding::Down);
    let repeat_min = repeat.num_minutes();
    if repeat_min <= 0 {
        return rounded;
    }
    let minute_of_day = day_minute(rounded);
    let remainder = minute_of_day % repeat_min;
    if remainder > 0 {
        rounded + Duration::minutes(repeat_min - remainder)
    } else {
        rounded
    }
}

/// `waitTime = startTime + delay - now`, per `_startLoop`.
pub fn wait_time(next_start_time: NaiveDateTime, delay: Duration, now: NaiveDateTime) -> Duration {
    next_start_time + delay - now
}

/// Whether `start_time` lands exactly on a day boundary (`dayMinute==0`),
/// triggering a `beginNewDay` run.
pub fn is_day_boundary(start_time: NaiveDateTime) -> bool {
    day_minute(start_time) == 0
}

/// One iteration's timing inputs, as computed by the driver before calling
/// into the detector-correction or simulation-run entry point.
#[derive(Debug, Clone, Copy)]
pub struct IterationPlan {
    pub start_time: NaiveDateTime,
    pub is_first: bool,
    pub begin_new_day: bool,
}

/// Drives one periodic loop: calls `run_once` with `(is_first,
/// begin_new_day, start_time)` at each iteration, advancing `start_time`
/// by `repeat` and sleeping `waitTime` between iterations (logging instead
/// of sleeping when the budget has already elapsed), until `start_time >=
/// end_time` or `run_once` returns `false` (`doContinue`).
///
/// `now` is supplied by the caller rather than read from the system clock,
/// so the pacing arithmetic is deterministic and testable; in production
/// the caller passes `chrono::Local::now().naive_local()`.
pub struct LoopDriver<NowFn> {
    pub loop_type: LoopType,
    pub repeat: Duration,
    pub delay: Duration,
    pub end_time: NaiveDateTime,
    pub now: NowFn,
    /// External process-state monitoring webhook (`sendMessageToPsm`'s
    /// target), forwarded as-is to [`traffloop_utils::notify::send_process_state`].
    /// `None` just logs locally.
    pub monitoring_endpoint: Option<String>,
}

impl<NowFn> LoopDriver<NowFn>
where
    NowFn: FnMut() -> NaiveDateTime,
{
    /// Runs the loop to completion. `run_once` returns `(doContinue,
    /// result)`; the driver stops early (without sleeping) if it returns
    /// `false`, mirroring `_startLoop`'s `while doContinue and startTime <
    /// endTime`.
    pub async fn run<F, Fut, T>(&mut self, mut start_time: NaiveDateTime, mut run_once: F) -> Vec<T>
    where
        F: FnMut(IterationPlan) -> Fut,
        Fut: Future<Output = (bool, T)>,
    {
        let endpoint = self.monitoring_endpoint.as_deref();
        traffloop_utils::notify::send_process_state(endpoint, format!("{:?} loop starting at {start_time}", self.loop_type));

        let mut results = Vec::new();
        let mut is_first = true;
        loop {
            let begin_new_day = !is_first && is_day_boundary(start_time);
            let plan = IterationPlan { start_time, is_first, begin_new_day };
            let (keep_going, result) = run_once(plan).await;
            results.push(result);
            is_first = false;
            if !keep_going || start_time >= self.end_time {
                traffloop_utils::notify::send_process_state(endpoint, format!("{:?} loop stopping at {start_time}", self.loop_type));
                break;
            }
            let started_time = start_time;
            start_time += self.repeat;
            if start_time >= self.end_time {
                break;
            }
            let now = (self.now)();
            let wait = wait_time(start_time, self.delay, now);
            if wait > Duration::zero() {
                log::info!("waiting {} seconds till begin", wait.num_seconds());
                sleep(wait.to_std().unwrap_or_default()).await;
            } else {
                log::warn!("delayed by {} seconds since {}", -wait.num_seconds(), started_time);
                traffloop_utils::notify::send_process_state(endpoint, format!("{:?} loop delayed since {started_time}", self.loop_type));
            }
        }
        results
    }
}

// ---------------------------------------------------------------------
// Rendezvous-token cross-loop coordination
// ---------------------------------------------------------------------

/// Replaces STOP/CONT child-process signaling (spec.md §9's legacy
/// alternative) with a published watermark: the detector loop publishes
/// the `intervalEnd` of the correction it just committed, and the
/// simulation loop waits until that watermark reaches a required bound
/// before consuming corrected data. Cheaper and race-free in a
/// single-binary multi-loop deployment, where both loops are tasks rather
/// than signal-coordinated sibling processes.
#[derive(Debug, Clone)]
pub struct RendezvousToken {
    tx: watch::Sender<Option<NaiveDateTime>>,
}

#[derive(Debug, Clone)]
pub struct RendezvousWaiter {
    rx: watch::Receiver<Option<NaiveDateTime>>,
}

impl RendezvousToken {
    pub fn new() -> (Self, RendezvousWaiter) {
        let (tx, rx) = watch::channel(None);
        (RendezvousToken { tx }, RendezvousWaiter { rx })
    }

    /// Publishes the `intervalEnd` just committed by the detector loop.
    pub fn publish(&self, interval_end: NaiveDateTime) {
        let _ = self.tx.send(Some(interval_end));
    }
}

impl RendezvousWaiter {
    /// Blocks until a published watermark is `>= required`.
    pub async fn wait_for(&mut self, required: NaiveDateTime) -> NaiveDateTime {
        loop {
            if let Some(published) = *self.rx.borrow() {
                if published >= required {
                    return published;
                }
            }
            if self.rx.changed().await.is_err() {
                // Publisher side dropped; nothing more will ever arrive.
                return required;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn dt(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 7, 27).unwrap().and_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn align_start_time_rounds_down_then_bumps_to_grid() {
        let repeat = Duration::minutes(15);
        // 08:07 rounds down to 08:00, already a multiple of 15 -> unchanged.
        assert_eq!(align_start_time(dt(8, 7), repeat), dt(8, 0));
    }

    #[test]
    fn align_start_time_bumps_misaligned_minute() {
        // repeat=20min: day_minute(08:00)=480, 480%20=0 -> aligned already.
        // Use repeat=7min against a day_minute not a multiple of 7.
        let repeat = Duration::minutes(7);
        let aligned = align_start_time(dt(8, 3), repeat);
        assert_eq!(day_minute(aligned) % 7, 0);
        assert!(aligned >= crate::time_index::round_to_minute(dt(8, 3), repeat, crate::time_index::Rounding::Down));
    }

    #[test]
    fn wait_time_is_positive_when_ahead_of_schedule() {
        let next = dt(9, 0);
        let now = dt(8, 55);
        let w = wait_time(next, Duration::zero(), now);
        assert_eq!(w, Duration::minutes(5));
    }

    #[test]
    fn day_boundary_detection() {
        assert!(is_day_boundary(dt(0, 0)));
        assert!(!is_day_boundary(dt(0, 1)));
    }

    #[tokio::test]
    async fn loop_driver_stops_at_end_time() {
        let end_time = dt(8, 30);
        let mut ticks = vec![dt(8, 10), dt(8, 20), dt(8, 40)].into_iter();
        let mut driver = LoopDriver { loop_type: LoopType::Detector, repeat: Duration::minutes(10), delay: Duration::zero(), end_time, now: move || ticks.next().unwrap_or(dt(9, 0)), monitoring_endpoint: None };
        let mut calls = 0;
        let results = driver
            .run(dt(8, 0), |plan| {
                calls += 1;
                async move { (true, plan.start_time) }
            })
            .await;
        assert!(calls <= 4);
        assert!(results.last().unwrap() >= &dt(8, 20));
    }

    #[tokio::test]
    async fn loop_driver_honors_do_continue_false() {
        let mut driver = LoopDriver { loop_type: LoopType::Simulation, repeat: Duration::minutes(5), delay: Duration::zero(), end_time: dt(23, 0), now: || dt(8, 0), monitoring_endpoint: None };
        let results = driver.run(dt(8, 0), |_plan| async move { (false, ()) }).await;
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn rendezvous_waiter_unblocks_on_publish() {
        let (token, mut waiter) = RendezvousToken::new();
        let required = dt(8, 5);
        let handle = tokio::spawn(async move { waiter.wait_for(required).await });
        token.publish(dt(8, 5));
        let published = handle.await.unwrap();
        assert_eq!(published, dt(8, 5));
    }

    #[tokio::test]
    async fn rendezvous_waiter_ignores_stale_publication() {
        let (token, mut waiter) = RendezvousToken::new();
        token.publish(dt(8, 0));
        let required = dt(8, 10);
        let wait_task = tokio::spawn(async move { waiter.wait_for(required).await });
        tokio::task::yield_now().await;
        token.publish(dt(8, 10));
        let published = wait_task.await.unwrap();
        assert_eq!(published, dt(8, 10));
    }
}
