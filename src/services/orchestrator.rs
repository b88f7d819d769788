use crate::pool::ConnectionPool;
use crate::services::backfill::backfill_windows;
use crate::services::fetch::{
    FetchWindow, FetchWorker, ReadingSink, ReadingSource, WorkerError, WorkerReport, WorkerSettings,
};
use crate::services::partition::Partition;
use crate::services::watermarks::Watermarks;
use crate::transport::Sleeper;
use chrono::{Duration, NaiveDateTime};
use log::{error, info, warn};
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::thread;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunMode {
    /// Resume every partition from its watermarks.
    Incremental,
    /// Re-read everything since `from` in `block`-wide windows.
    Backfill { from: NaiveDateTime, block: Duration },
}

#[derive(Debug, Clone)]
pub struct PartitionFailure {
    pub partition: Partition,
    pub error: String,
}

#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub partitions: usize,
    pub fetched: usize,
    pub inserted: usize,
    pub skipped: usize,
    pub failures: Vec<PartitionFailure>,
}

impl RunSummary {
    fn absorb(&mut self, partition: Partition, outcome: Result<WorkerReport, String>) {
        self.partitions += 1;
        match outcome {
            Ok(report) => {
                self.fetched += report.fetched;
                self.inserted += report.inserted;
                self.skipped += report.skipped;
            }
            Err(error) => self.failures.push(PartitionFailure { partition, error }),
        }
    }

    pub fn log(&self) {
        info!(
            "Run: {} partition(s), {} reading(s) fetched, {} inserted, {} skipped, {} failed",
            self.partitions,
            self.fetched,
            self.inserted,
            self.skipped,
            self.failures.len()
        );
        for f in &self.failures {
            error!("Run: {} failed: {}", f.partition, f.error);
        }
    }
}

/// Windows each partition has to walk, all ending at the same `end`.
pub fn plan_jobs(
    partitions: Vec<Partition>,
    marks: &Watermarks,
    mode: &RunMode,
    end: NaiveDateTime,
) -> Vec<(Partition, Vec<FetchWindow>)> {
    partitions
        .into_iter()
        .filter_map(|p| {
            let windows = match mode {
                RunMode::Incremental => {
                    let start = marks.window_start(&p.sensors);
                    if start < end {
                        vec![FetchWindow { start, end }]
                    } else {
                        Vec::new()
                    }
                }
                RunMode::Backfill { from, block } => backfill_windows(*from, end, *block),
            };
            if windows.is_empty() {
                warn!("Run: {} has nothing to fetch before {}", p, end);
                None
            } else {
                Some((p, windows))
            }
        })
        .collect()
}

/// Run `work` for every job on at most `concurrency` threads. Results keep job order.
/// A failing job does not stop the others.
pub fn dispatch<P, R, F>(jobs: Vec<P>, concurrency: usize, work: F) -> Vec<(P, Result<R, String>)>
where
    P: Send,
    R: Send,
    F: Fn(&P) -> Result<R, String> + Sync,
{
    let total = jobs.len();
    let queue = Mutex::new(jobs.into_iter().enumerate().collect::<VecDeque<_>>());
    let done = Mutex::new(Vec::with_capacity(total));
    let threads = concurrency.max(1).min(total);

    thread::scope(|s| {
        for _ in 0..threads {
            s.spawn(|| {
                loop {
                    let next = queue.lock().unwrap_or_else(PoisonError::into_inner).pop_front();
                    let Some((idx, job)) = next else { break };
                    let outcome = work(&job);
                    done.lock().unwrap_or_else(PoisonError::into_inner).push((idx, job, outcome));
                }
            });
        }
    });

    let mut done = done.into_inner().unwrap_or_else(PoisonError::into_inner);
    done.sort_by_key(|(idx, _, _)| *idx);
    done.into_iter().map(|(_, job, outcome)| (job, outcome)).collect()
}

/// Shared by every worker of a run; built once and passed by reference.
pub struct IngestContext<'a, S, C, Z> {
    pub source: &'a S,
    pub pool: &'a ConnectionPool<C>,
    pub settings: &'a WorkerSettings,
    pub sleeper: &'a Z,
}

/// One fetch worker per job; each holds a single pooled connection for its whole life.
pub fn run_partitions<S, C, Z>(
    ctx: &IngestContext<'_, S, C, Z>,
    jobs: Vec<(Partition, Vec<FetchWindow>)>,
    concurrency: usize,
) -> RunSummary
where
    S: ReadingSource,
    C: ReadingSink + Send,
    Z: Sleeper,
{
    info!(
        "Run: dispatching {} partition(s) on {} worker(s)",
        jobs.len(),
        concurrency.min(jobs.len())
    );
    let outcomes = dispatch(jobs, concurrency, |(partition, windows)| {
        let mut conn = ctx
            .pool
            .acquire()
            .map_err(|e| format!("no database connection: {}", e))?;
        let result = FetchWorker {
            partition,
            settings: ctx.settings,
            source: ctx.source,
            sink: &mut *conn,
            sleeper: ctx.sleeper,
        }
        .run(windows);
        result.map_err(|e| {
            error!("Worker[{}]: {}", partition, e);
            // a failed commit may leave the session unusable
            if matches!(e, WorkerError::Persist { .. }) {
                conn.discard();
            }
            e.to_string()
        })
    });

    let mut summary = RunSummary::default();
    for ((partition, _), outcome) in outcomes {
        summary.absorb(partition, outcome);
    }
    summary
}
