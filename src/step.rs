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
//! Uniform step wrapping with timing, output capture, and warning/error
//! summarization, shared by the detector and simulation loops.
//!
//! Grounded on `original_source/sumo_ldl/step.py` (`_checkOutput`,
//! `pythonStep`, `systemStep`).

use std::time::{Duration, Instant};

/// Outcome of one step's output scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Ok,
    Warned,
    Errored,
}

/// Classifies captured stdout/stderr text the way `_checkOutput` does:
/// case-insensitive scan for "error"/"exception" (errors win), then
/// "warning", else "ok" or an empty capture.
pub fn check_output(captured: &str) -> StepStatus {
    let lower = captured.to_ascii_lowercase();
    if lower.contains("error") || lower.contains("exception") {
        StepStatus::Errored
    } else if lower.contains("warning") {
        StepStatus::Warned
    } else {
        StepStatus::Ok
    }
}

/// A named unit of work, numbered sequentially within one loop's lifetime.
/// On failure, logs and reports [`StepStatus::Errored`] without panicking or
/// aborting the loop — the caller (the scheduler) decides whether to set
/// `errorOnLastRun` and whether later steps still run.
pub struct StepRunner {
    pub counter: u64,
}

impl Default for StepRunner {
    fn default() -> Self {
        StepRunner { counter: 0 }
    }
}

pub struct StepOutcome<T> {
    pub status: StepStatus,
    pub elapsed: Duration,
    pub result: Option<T>,
}

impl StepRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `work`, logging a banner before and a timing/status summary
    /// after. `work` returns `(T, captured_output)`; `captured_output` is
    /// scanned by [`check_output`] the same way a child process's stdout/
    /// stderr would be.
    pub fn run<T>(&mut self, comment: &str, work: impl FnOnce() -> anyhow::Result<(T, String)>) -> StepOutcome<T> {
        let step = self.counter;
        self.counter += 1;
        log::info!("step#{step} ({comment})");
        let start = Instant::now();
        let outcome = match work() {
            Ok((result, captured)) => {
                let status = check_output(&captured);
                match status {
                    StepStatus::Errored => log::error!("step#{step} had errors:\n{captured}"),
                    StepStatus::Warned => log::warn!("step#{step} had warnings:\n{captured}"),
                    StepStatus::Ok => {}
                }
                StepOutcome { status, elapsed: start.elapsed(), result: Some(result) }
            }
            Err(e) => {
                log::error!("step#{step} ({comment}) failed: {e:#}");
                StepOutcome { status: StepStatus::Errored, elapsed: start.elapsed(), result: None }
            }
        };
        log::info!("step#{step} done, needed {:?}", outcome.elapsed);
        log::info!("{}", "- ".repeat(39));
        outcome
    }

    /// Async variant of [`run`], for steps that await a DB call or a child
    /// process.
    pub async fn run_async<T, F>(&mut self, comment: &str, work: F) -> StepOutcome<T>
    where
        F: std::future::Future<Output = anyhow::Result<(T, String)>>,
    {
        let step = self.counter;
        self.counter += 1;
        log::info!("step#{step} ({comment})");
        let start = Instant::now();
        let outcome = match work.await {
            Ok((result, captured)) => {
                let status = check_output(&captured);
                match status {
                    StepStatus::Errored => log::error!("step#{step} had errors:\n{captured}"),
                    StepStatus::Warned => log::warn!("step#{step} had warnings:\n{captured}"),
                    StepStatus::Ok => {}
                }
                StepOutcome { status, elapsed: start.elapsed(), result: Some(result) }
            }
            Err(e) => {
                log::error!("step#{step} ({comment}) failed: {e:#}");
                StepOutcome { status: StepStatus::Errored, elapsed: start.elapsed(), result: None }
            }
        };
        log::info!("step#{step} done, needed {:?}", outcome.elapsed);
        log::info!("{}", "- ".repeat(39));
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_errors_before_warnings() {
        assert_eq!(check_output("an Exception was raised"), StepStatus::Errored);
        assert_eq!(check_output("just a Warning here"), StepStatus::Warned);
        assert_eq!(check_output(""), StepStatus::Ok);
        assert_eq!(check_output("simulation ended at time 100: OK"), StepStatus::Ok);
    }

    #[test]
    fn run_reports_errored_status_on_failure() {
        let mut runner = StepRunner::new();
        let outcome: StepOutcome<()> = runner.run("a step that fails", || Err(anyhow::anyhow!("boom")));
        assert_eq!(outcome.status, StepStatus::Errored);
        assert!(outcome.result.is_none());
    }

    #[test]
    fn run_numbers_steps_sequentially() {
        let mut runner = StepRunner::new();
        runner.run("first", || Ok(((), String::new())));
        runner.run("second", || Ok(((), String::new())));
        assert_eq!(runner.counter, 2);
    }
}
