//! Aggregates the outcome of every task run into load test statistics.
//!
//! Virtual users report each task they run as a [`RunEvent`]. The
//! [`StatisticsEngine`] folds those events into an [`AggregateStatistics`] record and
//! one [`TaskStatistics`] record per task, tracking counts, durations, errors and a
//! sliding window used to calculate the current requests per second. Derived values
//! (percentiles, averages and the current RPS) are only updated by
//! [`StatisticsEngine::calculate`], which every snapshot invokes.
//!
//! ## Locking
//!
//! The aggregate record, the map of task records, and each task record are guarded by
//! their own locks, always acquired in that order: aggregate, then task map, then task
//! record. Ingestion holds the aggregate lock until the task record is updated, so an
//! event is never partially visible to a snapshot or split by a reset.

use chrono::prelude::*;
use itertools::Itertools;
use num_format::{Locale, ToFormattedString};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::{fmt, time::Duration};

use crate::task::TaskResult;
use crate::util;
use crate::{LoadTestError, LoadTestStatus};

/// How many seconds of the RPS window count toward the current RPS.
pub const RPS_WINDOW_SECONDS: i64 = 10;

/// How often the janitor prunes the RPS window.
pub const JANITOR_INTERVAL: Duration = Duration::from_secs(30);

/// Percentiles and averages are reported as 0 until at least this many runs.
pub const MIN_RUNS_TO_CALCULATE: u64 = 10;

/// The percentiles calculated for every task.
pub const PERCENTILES: [f64; 5] = [0.50, 0.75, 0.85, 0.95, 0.99];

/// How a single task run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunOutcome {
    Success,
    /// The task failed with this error message.
    Failure(String),
}

/// The outcome of a single task run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunEvent {
    /// Full name of the task that ran.
    pub name: String,
    /// How long the task function took.
    pub elapsed: Duration,
    pub outcome: RunOutcome,
    /// Unix timestamp (seconds) of when the run completed.
    pub completed_at: i64,
}
impl RunEvent {
    /// Creates an event for a run that just completed with `result`.
    pub fn new(name: String, elapsed: Duration, result: &TaskResult) -> Self {
        let outcome = match result {
            Ok(()) => RunOutcome::Success,
            Err(e) => RunOutcome::Failure(e.to_string()),
        };
        RunEvent {
            name,
            elapsed,
            outcome,
            completed_at: Utc::now().timestamp(),
        }
    }

    /// Creates a successful event that just completed.
    pub fn success(name: &str, elapsed: Duration) -> Self {
        RunEvent::new(name.to_string(), elapsed, &Ok(()))
    }

    /// Creates a failed event that just completed.
    pub fn failure(name: &str, elapsed: Duration, message: &str) -> Self {
        RunEvent {
            outcome: RunOutcome::Failure(message.to_string()),
            ..RunEvent::success(name, elapsed)
        }
    }

    /// Overrides when the run completed.
    pub fn completed_at(mut self, timestamp: i64) -> Self {
        self.completed_at = timestamp;
        self
    }

    /// The elapsed time in whole milliseconds, the granularity of all statistics.
    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed.as_millis() as u64
    }

    pub fn is_success(&self) -> bool {
        self.outcome == RunOutcome::Success
    }
}

/// Statistics for one task, keyed by the task's full name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskStatistics {
    pub name: String,
    pub num_total: u64,
    pub num_successful: u64,
    pub num_failed: u64,
    /// Sum of all run durations, in milliseconds.
    pub total_duration: u64,
    pub min_duration: u64,
    pub max_duration: u64,
    /// How many runs took each number of milliseconds.
    #[serde(skip)]
    pub durations: BTreeMap<u64, u64>,
    /// Percentile (50 for p50) to duration in milliseconds.
    pub percentiles: BTreeMap<u32, u64>,
    pub average_duration: f32,
    /// Error message to number of occurrences.
    pub errors: BTreeMap<String, u64>,
}
impl TaskStatistics {
    pub fn new(name: &str) -> Self {
        TaskStatistics {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Adds a single run.
    pub fn record(&mut self, event: &RunEvent) {
        let elapsed = event.elapsed_ms();
        self.num_total += 1;
        match &event.outcome {
            RunOutcome::Success => self.num_successful += 1,
            RunOutcome::Failure(message) => {
                self.num_failed += 1;
                *self.errors.entry(message.clone()).or_insert(0) += 1;
            }
        }
        self.total_duration += elapsed;
        self.min_duration = update_min_duration(self.min_duration, self.num_total, elapsed);
        self.max_duration = self.max_duration.max(elapsed);
        *self.durations.entry(elapsed).or_insert(0) += 1;
    }

    /// Updates percentiles and the average duration.
    ///
    /// Until the task has run [`MIN_RUNS_TO_CALCULATE`] times, all percentiles and the
    /// average are reported as 0.
    pub fn calculate(&mut self) {
        if self.num_total < MIN_RUNS_TO_CALCULATE {
            for percentile in PERCENTILES {
                self.percentiles.insert(percentile_key(percentile), 0);
            }
            self.average_duration = 0.0;
            return;
        }

        for percentile in PERCENTILES {
            let value = bucketed_percentile(&self.durations, self.num_total, percentile);
            self.percentiles.insert(percentile_key(percentile), value);
        }
        self.average_duration = self.total_duration as f32 / self.num_total as f32;
    }

    /// Clears all counters, keeping the name.
    pub fn reset(&mut self) {
        *self = TaskStatistics::new(&self.name);
    }
}

/// Totals across all tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateStatistics {
    /// When the statistics were created or last reset.
    pub start_time: DateTime<Local>,
    /// When the load test last stopped.
    pub end_time: Option<DateTime<Local>>,
    pub status: LoadTestStatus,
    /// Number of users in the population.
    pub users: usize,
    pub num_total: u64,
    pub num_successful: u64,
    pub num_failed: u64,
    /// Sum of all run durations, in milliseconds.
    pub total_duration: u64,
    pub min_duration: u64,
    pub max_duration: u64,
    /// Unix timestamp (seconds) to the number of runs completed that second.
    #[serde(skip)]
    pub rps_window: BTreeMap<i64, u64>,
    pub current_rps: f32,
    pub average_duration: f32,
}
impl AggregateStatistics {
    pub fn new() -> Self {
        AggregateStatistics {
            start_time: Local::now(),
            end_time: None,
            status: LoadTestStatus::Stopped,
            users: 0,
            num_total: 0,
            num_successful: 0,
            num_failed: 0,
            total_duration: 0,
            min_duration: 0,
            max_duration: 0,
            rps_window: BTreeMap::new(),
            current_rps: 0.0,
            average_duration: 0.0,
        }
    }

    /// Adds a single run.
    pub fn record(&mut self, event: &RunEvent) {
        let elapsed = event.elapsed_ms();
        self.num_total += 1;
        if event.is_success() {
            self.num_successful += 1;
        } else {
            self.num_failed += 1;
        }
        self.total_duration += elapsed;
        self.min_duration = update_min_duration(self.min_duration, self.num_total, elapsed);
        self.max_duration = self.max_duration.max(elapsed);
        *self.rps_window.entry(event.completed_at).or_insert(0) += 1;
    }

    /// Updates the current RPS and the average duration as of `now` (unix seconds).
    pub fn calculate(&mut self, now: i64) {
        let horizon = now - RPS_WINDOW_SECONDS;
        let recent: u64 = self.rps_window.range(horizon..).map(|(_, count)| count).sum();
        self.current_rps = recent as f32 / RPS_WINDOW_SECONDS as f32;

        self.average_duration = if self.num_total >= MIN_RUNS_TO_CALCULATE {
            self.total_duration as f32 / self.num_total as f32
        } else {
            0.0
        };
    }

    /// Removes RPS window entries older than [`RPS_WINDOW_SECONDS`] before `now`,
    /// returning how many were removed.
    pub fn clean_rps_window(&mut self, now: i64) -> usize {
        let horizon = now - RPS_WINDOW_SECONDS;
        let before = self.rps_window.len();
        self.rps_window = self.rps_window.split_off(&horizon);
        before - self.rps_window.len()
    }

    /// Clears all counters and restarts the start time. Status and users describe the
    /// population rather than the statistics, and are kept.
    pub fn reset(&mut self) {
        *self = AggregateStatistics {
            status: self.status,
            users: self.users,
            ..AggregateStatistics::new()
        };
    }
}
impl Default for AggregateStatistics {
    fn default() -> Self {
        AggregateStatistics::new()
    }
}

/// A consistent copy of all statistics at one moment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticsSnapshot {
    #[serde(flatten)]
    pub aggregate: AggregateStatistics,
    /// Task full name to its statistics.
    pub tasks: BTreeMap<String, TaskStatistics>,
}
impl StatisticsSnapshot {
    fn fmt_tasks(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            fmt,
            "\n === PER TASK STATISTICS ===\n ------------------------------------------------------------------------------"
        )?;
        writeln!(
            fmt,
            " {:<24} | {:>13} | {:>14} | {:>10} | {:>8}",
            "Name", "# times run", "# fails", "average", "min/max"
        )?;
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        for task in self.tasks.values() {
            writeln!(
                fmt,
                " {:<24} | {:>13} | {:>14} | {:>10.2} | {}/{}",
                util::ellipsize(&task.name, 24),
                task.num_total.to_formatted_string(&Locale::en),
                format_failures(task.num_failed, task.num_total),
                task.average_duration,
                task.min_duration,
                task.max_duration,
            )?;
        }
        let aggregate = &self.aggregate;
        writeln!(
            fmt,
            " -------------------------+---------------+----------------+------------+---------"
        )?;
        writeln!(
            fmt,
            " {:<24} | {:>13} | {:>14} | {:>10.2} | {}/{}",
            "Aggregated",
            aggregate.num_total.to_formatted_string(&Locale::en),
            format_failures(aggregate.num_failed, aggregate.num_total),
            aggregate.average_duration,
            aggregate.min_duration,
            aggregate.max_duration,
        )
    }

    fn fmt_percentiles(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        writeln!(
            fmt,
            " Slowest task run within specified percentile of runs (in ms):"
        )?;
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        let header = PERCENTILES
            .iter()
            .map(|p| format!("{:>6}", format!("{}%", percentile_key(*p))))
            .join(" | ");
        writeln!(fmt, " {:<24} | {}", "Name", header)?;
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        for task in self.tasks.values() {
            let values = PERCENTILES
                .iter()
                .map(|p| {
                    let value = task.percentiles.get(&percentile_key(*p)).unwrap_or(&0);
                    format!("{:>6}", value.to_formatted_string(&Locale::en))
                })
                .join(" | ");
            writeln!(fmt, " {:<24} | {}", util::ellipsize(&task.name, 24), values)?;
        }
        Ok(())
    }

    fn fmt_errors(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let errors: Vec<(u64, String)> = self
            .tasks
            .values()
            .flat_map(|task| {
                task.errors
                    .iter()
                    .map(move |(error, count)| (*count, format!("{}: {}", task.name, error)))
            })
            .collect();
        if errors.is_empty() {
            return Ok(());
        }

        writeln!(
            fmt,
            "\n === ERRORS ===\n ------------------------------------------------------------------------------"
        )?;
        writeln!(fmt, " {:<11} | Error", "Count")?;
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        // Most frequent first.
        for (count, error) in errors.iter().sorted().rev() {
            writeln!(fmt, " {:<12}  {}", count.to_formatted_string(&Locale::en), error)?;
        }
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )
    }
}

impl fmt::Display for StatisticsSnapshot {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let aggregate = &self.aggregate;
        writeln!(
            fmt,
            " Status: {}, users: {}, started: {}, current rps: {:.2}",
            aggregate.status,
            aggregate.users,
            aggregate.start_time.format("%Y-%m-%d %H:%M:%S"),
            aggregate.current_rps,
        )?;
        if let Some(end_time) = aggregate.end_time {
            writeln!(fmt, " Stopped: {}", end_time.format("%Y-%m-%d %H:%M:%S"))?;
        }
        if self.tasks.is_empty() {
            return writeln!(fmt, " No tasks have run.");
        }
        self.fmt_tasks(fmt)?;
        self.fmt_percentiles(fmt)?;
        self.fmt_errors(fmt)
    }
}

/// Collects run events into statistics, safe to share between all users, the
/// ingestion task and the control plane.
#[derive(Debug, Default)]
pub struct StatisticsEngine {
    aggregate: Mutex<AggregateStatistics>,
    tasks: RwLock<HashMap<String, Arc<Mutex<TaskStatistics>>>>,
}
impl StatisticsEngine {
    pub fn new() -> Self {
        StatisticsEngine::default()
    }

    /// Adds a single run to the aggregate and the task's statistics.
    pub fn ingest(&self, event: &RunEvent) {
        let mut aggregate = self.aggregate.lock();
        aggregate.record(event);
        let task = self.task_record(&event.name);
        task.lock().record(event);
    }

    // Returns the record for `name`, creating it if this is the first run.
    fn task_record(&self, name: &str) -> Arc<Mutex<TaskStatistics>> {
        if let Some(task) = self.tasks.read().get(name) {
            return Arc::clone(task);
        }
        let mut tasks = self.tasks.write();
        Arc::clone(
            tasks
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(TaskStatistics::new(name)))),
        )
    }

    /// Updates all derived values: current RPS, averages and percentiles.
    pub fn calculate(&self) {
        let mut aggregate = self.aggregate.lock();
        self.calculate_locked(&mut aggregate, Utc::now().timestamp());
    }

    fn calculate_locked(&self, aggregate: &mut AggregateStatistics, now: i64) {
        aggregate.calculate(now);
        for task in self.tasks.read().values() {
            task.lock().calculate();
        }
    }

    /// Clears all statistics and restarts the start time.
    pub fn reset(&self) {
        let mut aggregate = self.aggregate.lock();
        aggregate.reset();
        for task in self.tasks.read().values() {
            task.lock().reset();
        }
        info!("statistics reset");
    }

    /// Calculates all derived values and returns a copy of all statistics.
    pub fn snapshot(&self) -> StatisticsSnapshot {
        self.with_snapshot(|snapshot| snapshot.clone())
    }

    /// Calculates all derived values and serializes all statistics as JSON.
    pub fn snapshot_json(&self) -> Result<String, LoadTestError> {
        self.with_snapshot(|snapshot| serde_json::to_string(snapshot))
            .map_err(LoadTestError::from)
    }

    // Runs `f` on a snapshot while still holding the aggregate lock.
    fn with_snapshot<T, F>(&self, f: F) -> T
    where
        F: FnOnce(&StatisticsSnapshot) -> T,
    {
        let mut aggregate = self.aggregate.lock();
        self.calculate_locked(&mut aggregate, Utc::now().timestamp());
        let tasks = self
            .tasks
            .read()
            .iter()
            .map(|(name, task)| (name.clone(), task.lock().clone()))
            .collect();
        let snapshot = StatisticsSnapshot {
            aggregate: aggregate.clone(),
            tasks,
        };
        f(&snapshot)
    }

    /// Removes RPS window entries that no longer count toward the current RPS.
    pub fn clean_rps_window(&self) -> usize {
        self.clean_rps_window_at(Utc::now().timestamp())
    }

    /// Removes RPS window entries older than [`RPS_WINDOW_SECONDS`] before `now`.
    pub fn clean_rps_window_at(&self, now: i64) -> usize {
        let removed = self.aggregate.lock().clean_rps_window(now);
        trace!("removed {} entries from the rps window", removed);
        removed
    }

    /// Records the current population size and status.
    pub fn set_population(&self, users: usize, status: LoadTestStatus) {
        let mut aggregate = self.aggregate.lock();
        aggregate.users = users;
        aggregate.status = status;
    }

    /// Stamps the end time, when the population has fully stopped.
    pub fn mark_ended(&self) {
        self.aggregate.lock().end_time = Some(Local::now());
    }

    /// Clears the end time, when the population starts again.
    pub fn mark_started(&self) {
        self.aggregate.lock().end_time = None;
    }
}

/// Consumes run events until every sender is dropped.
pub(crate) async fn statistics_main(
    receiver: flume::Receiver<RunEvent>,
    statistics: Arc<StatisticsEngine>,
) {
    while let Ok(event) = receiver.recv_async().await {
        statistics.ingest(&event);
    }
    debug!("run event channel closed, exiting statistics ingestion");
}

/// Periodically prunes the RPS window.
pub(crate) async fn janitor_main(statistics: Arc<StatisticsEngine>) {
    let mut interval = tokio::time::interval(JANITOR_INTERVAL);
    loop {
        interval.tick().await;
        statistics.clean_rps_window();
    }
}

/// The key a percentile is stored under, `50` for `0.50`.
pub fn percentile_key(percentile: f64) -> u32 {
    (percentile * 100.0).round() as u32
}

/// Returns the smallest duration such that at least `ceil(total * percentile)` runs
/// took no longer, based on a histogram of durations.
pub fn bucketed_percentile(durations: &BTreeMap<u64, u64>, total: u64, percentile: f64) -> u64 {
    let rank = ((total as f64 * percentile).ceil() as u64).max(1);
    let mut seen = 0;
    for (duration, count) in durations {
        seen += count;
        if seen >= rank {
            return *duration;
        }
    }
    durations.keys().next_back().copied().unwrap_or(0)
}

// The first run always sets the minimum.
fn update_min_duration(current: u64, num_total: u64, elapsed: u64) -> u64 {
    if num_total == 1 {
        elapsed
    } else {
        current.min(elapsed)
    }
}

fn format_failures(failed: u64, total: u64) -> String {
    let percent = if total > 0 {
        failed as f32 / total as f32 * 100.0
    } else {
        0.0
    };
    if percent as usize == 100 || percent as usize == 0 {
        format!("{} ({}%)", failed.to_formatted_string(&Locale::en), percent as usize)
    } else {
        format!("{} ({:.1}%)", failed.to_formatted_string(&Locale::en), percent)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn event(name: &str, millis: u64) -> RunEvent {
        RunEvent::success(name, Duration::from_millis(millis))
    }

    #[test]
    fn run_event() {
        let event = RunEvent::new("a".to_string(), Duration::from_micros(2_500), &Ok(()));
        assert!(event.is_success());
        assert_eq!(event.elapsed_ms(), 2);
        assert!((Utc::now().timestamp() - event.completed_at).abs() <= 1);

        let event = RunEvent::new(
            "b".to_string(),
            Duration::from_millis(1),
            &Err("nope".into()),
        );
        assert_eq!(event.outcome, RunOutcome::Failure("nope".to_string()));

        let event = RunEvent::failure("c", Duration::from_millis(1), "bad").completed_at(100);
        assert_eq!(event.name, "c");
        assert_eq!(event.completed_at, 100);
        assert!(!event.is_success());
    }

    #[test]
    fn task_statistics_record() {
        let mut task = TaskStatistics::new("root / a");
        task.record(&event("root / a", 20));
        task.record(&event("root / a", 10));
        task.record(&RunEvent::failure("root / a", Duration::from_millis(30), "boom"));
        task.record(&RunEvent::failure("root / a", Duration::from_millis(10), "boom"));

        assert_eq!(task.num_total, 4);
        assert_eq!(task.num_successful, 2);
        assert_eq!(task.num_failed, 2);
        assert_eq!(task.total_duration, 70);
        assert_eq!(task.min_duration, 10);
        assert_eq!(task.max_duration, 30);
        assert_eq!(task.durations.get(&10), Some(&2));
        assert_eq!(task.errors.get("boom"), Some(&2));
        assert_eq!(task.durations.values().sum::<u64>(), task.num_total);

        task.reset();
        assert_eq!(task, TaskStatistics::new("root / a"));
    }

    #[test]
    fn too_few_runs_report_zero() {
        let mut task = TaskStatistics::new("a");
        for millis in 1..MIN_RUNS_TO_CALCULATE {
            task.record(&event("a", millis * 100));
        }
        task.calculate();
        assert_eq!(task.percentiles.len(), PERCENTILES.len());
        assert!(task.percentiles.values().all(|value| *value == 0));
        assert_eq!(task.average_duration, 0.0);

        // The tenth run enables calculation.
        task.record(&event("a", 1_000));
        task.calculate();
        assert_eq!(task.percentiles[&50], 500);
        assert_eq!(task.percentiles[&99], 1_000);
        assert_eq!(task.average_duration, 550.0);
    }

    #[test]
    fn percentiles() {
        let mut durations = BTreeMap::new();
        // 1..=100 ms, one run each.
        for millis in 1..=100 {
            durations.insert(millis, 1);
        }
        assert_eq!(bucketed_percentile(&durations, 100, 0.50), 50);
        assert_eq!(bucketed_percentile(&durations, 100, 0.75), 75);
        assert_eq!(bucketed_percentile(&durations, 100, 0.99), 99);
        assert_eq!(bucketed_percentile(&durations, 100, 0.0), 1);
        assert_eq!(bucketed_percentile(&durations, 100, 1.0), 100);

        // Bucketed: most runs share a single duration.
        let mut durations = BTreeMap::new();
        durations.insert(5, 90);
        durations.insert(500, 10);
        assert_eq!(bucketed_percentile(&durations, 100, 0.85), 5);
        assert_eq!(bucketed_percentile(&durations, 100, 0.95), 500);

        assert_eq!(bucketed_percentile(&BTreeMap::new(), 0, 0.5), 0);
        assert_eq!(percentile_key(0.85), 85);
    }

    #[test]
    fn percentiles_never_decrease() {
        let mut task = TaskStatistics::new("a");
        // A skewed, irregular distribution.
        for i in 0..1_000_u64 {
            task.record(&event("a", (i * i * 7919) % 997 / (1 + i % 13)));
        }
        task.calculate();
        let values: Vec<u64> = PERCENTILES
            .iter()
            .map(|p| task.percentiles[&percentile_key(*p)])
            .collect();
        assert!(values.windows(2).all(|pair| pair[0] <= pair[1]), "{:?}", values);
        assert!(values[values.len() - 1] <= task.max_duration);
        assert!(values[0] >= task.min_duration);
    }

    #[test]
    fn rps_window() {
        let mut aggregate = AggregateStatistics::new();
        let now = 1_000_000;
        for (offset, count) in [(0, 5), (3, 10), (9, 5), (10, 20), (11, 100), (45, 7)] {
            for _ in 0..count {
                aggregate.record(&event("a", 1).completed_at(now - offset));
            }
        }
        aggregate.calculate(now);
        // Only runs completed within the last 10 seconds count.
        assert_eq!(aggregate.current_rps, 4.0);

        assert_eq!(aggregate.clean_rps_window(now), 2);
        assert!(aggregate.rps_window.keys().all(|ts| *ts >= now - RPS_WINDOW_SECONDS));
        assert_eq!(aggregate.rps_window.len(), 4);
        // Pruning does not recalculate.
        assert_eq!(aggregate.current_rps, 4.0);
        // Nothing left to prune.
        assert_eq!(aggregate.clean_rps_window(now), 0);
    }

    #[test]
    fn engine_snapshot() {
        let statistics = StatisticsEngine::new();
        for millis in 1..=20 {
            statistics.ingest(&event("root / a", millis));
        }
        statistics.ingest(&RunEvent::failure("root / b", Duration::from_millis(40), "oops"));
        statistics.set_population(3, LoadTestStatus::Running);

        let snapshot = statistics.snapshot();
        assert_eq!(snapshot.aggregate.num_total, 21);
        assert_eq!(snapshot.aggregate.num_successful, 20);
        assert_eq!(snapshot.aggregate.num_failed, 1);
        assert_eq!(snapshot.aggregate.min_duration, 1);
        assert_eq!(snapshot.aggregate.max_duration, 40);
        assert_eq!(snapshot.aggregate.users, 3);
        assert_eq!(snapshot.aggregate.status, LoadTestStatus::Running);
        assert_eq!(snapshot.aggregate.average_duration, 250.0 / 21.0);
        assert!(snapshot.aggregate.current_rps > 0.0);

        let a = &snapshot.tasks["root / a"];
        assert_eq!(a.num_total, 20);
        assert_eq!(a.percentiles[&50], 10);
        let b = &snapshot.tasks["root / b"];
        assert_eq!(b.num_failed, 1);
        assert!(b.percentiles.values().all(|value| *value == 0));
        for task in snapshot.tasks.values() {
            assert_eq!(task.num_successful + task.num_failed, task.num_total);
            assert_eq!(task.durations.values().sum::<u64>(), task.num_total);
        }

        let json = statistics.snapshot_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["num_total"], 21);
        assert_eq!(value["status"], "running");
        assert_eq!(value["tasks"]["root / a"]["percentiles"]["50"], 10);
        assert!(value.get("rps_window").is_none());
        assert!(value["tasks"]["root / a"].get("durations").is_none());

        let display = snapshot.to_string();
        assert!(display.contains("PER TASK STATISTICS"));
        assert!(display.contains("root / a"));
        assert!(display.contains("ERRORS"));
        assert!(display.contains("oops"));
    }

    #[test]
    fn engine_reset() {
        let statistics = StatisticsEngine::new();
        statistics.set_population(2, LoadTestStatus::Spawning);
        for _ in 0..5 {
            statistics.ingest(&event("a", 5));
        }
        let before = statistics.snapshot().aggregate.start_time;
        statistics.reset();
        let snapshot = statistics.snapshot();
        assert_eq!(snapshot.aggregate.num_total, 0);
        assert!(snapshot.aggregate.rps_window.is_empty());
        assert!(snapshot.aggregate.start_time >= before);
        // Population details survive a reset.
        assert_eq!(snapshot.aggregate.users, 2);
        assert_eq!(snapshot.tasks["a"].num_total, 0);
        assert!(snapshot.tasks["a"].errors.is_empty());
    }

    #[test]
    fn reset_then_concurrent_burst() {
        let statistics = Arc::new(StatisticsEngine::new());
        for _ in 0..50 {
            statistics.ingest(&event("a", 5));
        }
        statistics.reset();

        let threads: Vec<_> = (0..8)
            .map(|thread| {
                let statistics = Arc::clone(&statistics);
                std::thread::spawn(move || {
                    for i in 0..250 {
                        let name = if i % 2 == 0 { "a" } else { "b" };
                        statistics.ingest(&event(name, thread + i));
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        let snapshot = statistics.snapshot();
        assert_eq!(snapshot.aggregate.num_total, 2_000);
        let per_task: u64 = snapshot.tasks.values().map(|task| task.num_total).sum();
        assert_eq!(per_task, 2_000);
        assert_eq!(snapshot.tasks["a"].num_total, 1_000);
        assert_eq!(snapshot.tasks["b"].durations.values().sum::<u64>(), 1_000);
    }

    #[test]
    fn reset_during_ingestion_is_atomic() {
        let statistics = Arc::new(StatisticsEngine::new());
        let writer = {
            let statistics = Arc::clone(&statistics);
            std::thread::spawn(move || {
                for i in 0..5_000 {
                    statistics.ingest(&event("a", i % 50));
                }
            })
        };
        for _ in 0..50 {
            statistics.reset();
            let snapshot = statistics.snapshot();
            // Aggregate and task always agree, whatever the interleaving.
            let task_total = snapshot.tasks.get("a").map_or(0, |task| task.num_total);
            assert_eq!(snapshot.aggregate.num_total, task_total);
        }
        writer.join().unwrap();
    }

    #[tokio::test]
    async fn ingestion_task_drains() {
        let statistics = Arc::new(StatisticsEngine::new());
        let (tx, rx) = flume::unbounded();
        let ingestion = tokio::spawn(statistics_main(rx, Arc::clone(&statistics)));
        for millis in 0..100 {
            tx.send(event("a", millis)).unwrap();
        }
        drop(tx);
        ingestion.await.unwrap();
        assert_eq!(statistics.snapshot().aggregate.num_total, 100);
    }

    #[test]
    fn end_time() {
        let statistics = StatisticsEngine::new();
        assert!(statistics.snapshot().aggregate.end_time.is_none());
        statistics.mark_ended();
        assert!(statistics.snapshot().aggregate.end_time.is_some());
        statistics.mark_started();
        assert!(statistics.snapshot().aggregate.end_time.is_none());
    }
}
