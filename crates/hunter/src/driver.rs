//! Parallel task driver.
//!
//! A single producer fills a bounded work channel with unit indices, W
//! workers consume and run the task, and a completion channel carries each
//! unit's result back. Ordering across workers is irrelevant: extraction
//! writes commute under address-keyed accumulation. The pool is terminated
//! by closing the work channel; a stop flag ends workers between units
//! (in-progress units run to completion).

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crossbeam::channel::bounded;
use tracing::{info, warn};

use crate::error::HunterError;

/// Default number of worker threads that execute in parallel.
pub const DEFAULT_WORKERS: usize = 4;

/// Default wall-clock budget for round-based test runs.
pub const DEFAULT_TIME_LIMIT: Duration = Duration::from_secs(1800);

/// Outcome of one pool run.
#[derive(Debug, Default)]
pub struct ExecStats {
    /// Units that ran to completion.
    pub completed: u64,
    /// Units skipped over recoverable errors.
    pub skipped: u64,
    /// Whether a task requested early termination (or the budget ran out).
    pub stopped_early: bool,
}

pub struct TaskPool {
    name: String,
    workers: usize,
    time_limit: Option<Duration>,
}

impl TaskPool {
    pub fn new(name: impl Into<String>, workers: usize) -> Self {
        TaskPool {
            name: name.into(),
            workers: workers.max(1),
            time_limit: None,
        }
    }

    /// Stop scheduling new units once this much wall-clock time has passed.
    pub fn with_time_limit(mut self, limit: Duration) -> Self {
        self.time_limit = Some(limit);
        self
    }

    /// Run `task` over every unit.
    ///
    /// The task returns `Ok(true)` to request that no further units be
    /// scheduled (the current generation drains first). Recoverable errors
    /// are counted and skipped; the first non-recoverable error aborts the
    /// run and is returned.
    pub fn execute<T, F>(&self, units: &[T], task: F) -> Result<ExecStats, HunterError>
    where
        T: Sync,
        F: Fn(&T) -> Result<bool, HunterError> + Sync,
    {
        let start = Instant::now();
        info!(pool = %self.name, units = units.len(), workers = self.workers, "pool start");

        let (work_tx, work_rx) = bounded::<usize>(self.workers * 10);
        let (done_tx, done_rx) = bounded::<Result<bool, HunterError>>(self.workers * 10);
        let stop = AtomicBool::new(false);

        let result = std::thread::scope(|scope| {
            let stop = &stop;
            let task = &task;
            let time_limit = self.time_limit;

            scope.spawn(move || {
                for index in 0..units.len() {
                    if stop.load(Ordering::Relaxed) {
                        break;
                    }
                    if let Some(limit) = time_limit
                        && start.elapsed() > limit
                    {
                        info!(elapsed = ?start.elapsed(), "time budget consumed");
                        stop.store(true, Ordering::Relaxed);
                        break;
                    }
                    if work_tx.send(index).is_err() {
                        break;
                    }
                }
                // dropping the sender closes the work channel
            });

            for _ in 0..self.workers {
                let work_rx = work_rx.clone();
                let done_tx = done_tx.clone();
                scope.spawn(move || {
                    for index in work_rx.iter() {
                        if stop.load(Ordering::Relaxed) {
                            break;
                        }
                        if done_tx.send(task(&units[index])).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(work_rx);
            drop(done_tx);

            let mut stats = ExecStats::default();
            let mut fatal: Option<HunterError> = None;
            for outcome in done_rx.iter() {
                match outcome {
                    Ok(stop_requested) => {
                        stats.completed += 1;
                        if stop_requested {
                            stats.stopped_early = true;
                            stop.store(true, Ordering::Relaxed);
                        }
                        if stats.completed % 1000 == 0 {
                            let per_sec =
                                stats.completed as f64 / start.elapsed().as_secs_f64().max(1e-9);
                            info!(completed = stats.completed, per_sec, "pool progress");
                        }
                    }
                    Err(e) if e.is_recoverable() => {
                        stats.skipped += 1;
                        warn!(pool = %self.name, "skipping unit: {e}");
                    }
                    Err(e) => {
                        if fatal.is_none() {
                            fatal = Some(e);
                        }
                        stop.store(true, Ordering::Relaxed);
                    }
                }
            }
            stats.stopped_early |= stop.load(Ordering::Relaxed) && fatal.is_none();
            match fatal {
                Some(e) => Err(e),
                None => Ok(stats),
            }
        });

        if let Ok(stats) = &result {
            let elapsed = start.elapsed();
            let per_sec = stats.completed as f64 / elapsed.as_secs_f64().max(1e-9);
            info!(
                pool = %self.name,
                completed = stats.completed,
                skipped = stats.skipped,
                ?elapsed,
                per_sec,
                "pool done"
            );
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64;

    use super::*;

    #[test]
    fn runs_every_unit() {
        let units: Vec<u64> = (0..100).collect();
        let sum = AtomicU64::new(0);
        let pool = TaskPool::new("test", 4);
        let stats = pool
            .execute(&units, |u| {
                sum.fetch_add(*u, Ordering::Relaxed);
                Ok(false)
            })
            .unwrap();
        assert_eq!(stats.completed, 100);
        assert_eq!(stats.skipped, 0);
        assert_eq!(sum.load(Ordering::Relaxed), (0..100).sum::<u64>());
    }

    #[test]
    fn recoverable_errors_are_counted_not_fatal() {
        let units: Vec<u64> = (0..10).collect();
        let pool = TaskPool::new("test", 2);
        let stats = pool
            .execute(&units, |u| {
                if *u % 2 == 0 {
                    Err(HunterError::MalformedTx {
                        block: *u,
                        tx_index: 0,
                        cause: "test".into(),
                    })
                } else {
                    Ok(false)
                }
            })
            .unwrap();
        assert_eq!(stats.completed, 5);
        assert_eq!(stats.skipped, 5);
    }

    #[test]
    fn first_fatal_error_aborts() {
        let units: Vec<u64> = (0..1000).collect();
        let pool = TaskPool::new("test", 2);
        let err = pool
            .execute(&units, |u| {
                if *u == 3 {
                    Err(HunterError::InvalidArgument("boom".into()))
                } else {
                    Ok(false)
                }
            })
            .unwrap_err();
        assert!(matches!(err, HunterError::InvalidArgument(_)));
    }

    #[test]
    fn early_stop_request_halts_scheduling() {
        let units: Vec<u64> = (0..10_000).collect();
        let pool = TaskPool::new("test", 2);
        let stats = pool
            .execute(&units, |u| Ok(*u == 0))
            .unwrap();
        assert!(stats.stopped_early);
        assert!(stats.completed < 10_000);
    }

    #[test]
    fn zero_units_is_a_noop() {
        let units: Vec<u64> = Vec::new();
        let pool = TaskPool::new("test", 4);
        let stats = pool.execute(&units, |_| Ok(false)).unwrap();
        assert_eq!(stats.completed, 0);
    }
}
