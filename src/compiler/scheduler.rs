// src/compiler/scheduler.rs

//! Bounded parallel execution behind a dependency barrier
//!
//! Jobs run on a rayon pool of `concurrency` threads. The calling thread
//! only dispatches: it starts every job whose dependencies are done, then
//! waits on a completion channel. A failed job skips everything that
//! transitively depends on it; unrelated jobs keep running.

use crate::error::{Error, Result};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use tracing::debug;

/// How a job ended
#[derive(Debug)]
pub(crate) enum Outcome<T> {
    Done(T),
    Failed(Error),
    /// Not run because the job at `dependency` failed
    Skipped { dependency: usize },
}

pub(crate) struct Scheduler {
    pool: ThreadPool,
}

impl Scheduler {
    pub fn new(concurrency: usize) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(concurrency.max(1))
            .thread_name(|i| format!("kiln-worker-{}", i))
            .build()
            .map_err(|e| Error::InitError(format!("Failed to start worker pool: {}", e)))?;
        Ok(Self { pool })
    }

    /// Run `job(i)` for every node of the graph
    ///
    /// `dependencies[i]` lists the nodes that must be `Done` before `i`
    /// starts. The graph must be acyclic. `labels` name nodes in errors.
    pub fn run<T, F>(&self, labels: &[String], dependencies: &[Vec<usize>], job: F) -> Vec<Outcome<T>>
    where
        T: Send,
        F: Fn(usize) -> Result<T> + Send + Sync,
    {
        let n = dependencies.len();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (i, deps) in dependencies.iter().enumerate() {
            for &d in deps {
                dependents[d].push(i);
            }
        }
        let mut waiting: Vec<usize> = dependencies.iter().map(Vec::len).collect();
        let mut outcomes: Vec<Option<Outcome<T>>> = (0..n).map(|_| None).collect();

        let (tx, rx) = mpsc::channel::<(usize, Result<T>)>();
        let job = &job;

        self.pool.in_place_scope(|scope| {
            let launch = |i: usize| {
                let tx = tx.clone();
                let label = labels.get(i).cloned().unwrap_or_default();
                scope.spawn(move |_| {
                    let result = panic::catch_unwind(AssertUnwindSafe(|| job(i))).unwrap_or_else(|_| {
                        Err(Error::BuildError {
                            package: label,
                            reason: "worker panicked".to_string(),
                        })
                    });
                    let _ = tx.send((i, result));
                });
            };

            let mut running = 0;
            for i in 0..n {
                if waiting[i] == 0 {
                    launch(i);
                    running += 1;
                }
            }

            while running > 0 {
                let Ok((i, result)) = rx.recv() else {
                    break;
                };
                running -= 1;

                match result {
                    Ok(value) => {
                        outcomes[i] = Some(Outcome::Done(value));
                        for &d in &dependents[i] {
                            waiting[d] -= 1;
                            if waiting[d] == 0 && outcomes[d].is_none() {
                                launch(d);
                                running += 1;
                            }
                        }
                    }
                    Err(e) => {
                        debug!("Job {} failed: {}", i, e);
                        outcomes[i] = Some(Outcome::Failed(e));
                        let mut stack = dependents[i].clone();
                        while let Some(d) = stack.pop() {
                            if outcomes[d].is_none() {
                                outcomes[d] = Some(Outcome::Skipped { dependency: i });
                                stack.extend(dependents[d].iter().copied());
                            }
                        }
                    }
                }
            }
        });

        outcomes
            .into_iter()
            .enumerate()
            .map(|(i, o)| o.unwrap_or(Outcome::Skipped { dependency: i }))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    fn labels(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("job{}", i)).collect()
    }

    #[test]
    fn test_dependencies_finish_first() {
        // 0 <- 1 <- 2, 0 <- 3
        let deps = vec![vec![], vec![0], vec![1], vec![0]];
        let finished = Mutex::new(Vec::new());

        let scheduler = Scheduler::new(4).unwrap();
        let outcomes = scheduler.run(&labels(4), &deps, |i| {
            thread::sleep(Duration::from_millis(5));
            finished.lock().unwrap().push(i);
            Ok(i * 10)
        });

        assert!(outcomes.iter().all(|o| matches!(o, Outcome::Done(_))));
        let finished = finished.into_inner().unwrap();
        let pos = |x| finished.iter().position(|&v| v == x).unwrap();
        assert!(pos(0) < pos(1));
        assert!(pos(1) < pos(2));
        assert!(pos(0) < pos(3));
    }

    #[test]
    fn test_concurrency_is_bounded() {
        let deps = vec![Vec::new(); 8];
        let active = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);

        let scheduler = Scheduler::new(2).unwrap();
        scheduler.run(&labels(8), &deps, |_| {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(10));
            active.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        });

        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn test_failure_skips_dependents_only() {
        // 1 depends on 0, 2 depends on 1, 3 is independent
        let deps = vec![vec![], vec![0], vec![1], vec![]];
        let scheduler = Scheduler::new(2).unwrap();
        let outcomes = scheduler.run(&labels(4), &deps, |i| {
            if i == 0 {
                Err(Error::BuildError {
                    package: "job0".into(),
                    reason: "boom".into(),
                })
            } else {
                Ok(i)
            }
        });

        assert!(matches!(outcomes[0], Outcome::Failed(_)));
        assert!(matches!(outcomes[1], Outcome::Skipped { dependency: 0 }));
        assert!(matches!(outcomes[2], Outcome::Skipped { dependency: 0 }));
        assert!(matches!(outcomes[3], Outcome::Done(3)));
    }

    #[test]
    fn test_panicking_job_is_a_failure() {
        let deps = vec![vec![], vec![]];
        let scheduler = Scheduler::new(1).unwrap();
        let outcomes = scheduler.run(&labels(2), &deps, |i| {
            if i == 0 {
                panic!("worker exploded");
            }
            Ok(i)
        });

        assert!(matches!(outcomes[0], Outcome::Failed(Error::BuildError { .. })));
        assert!(matches!(outcomes[1], Outcome::Done(1)));
    }
}
