//! Per-key sequential execution lanes over a bounded worker pool
//!
//! Jobs submitted under the same key run one at a time in submission order.
//! Different keys run in parallel, limited by a global permit count. Jobs are
//! blocking closures and execute on tokio's blocking pool.

use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{Notify, Semaphore, mpsc};
use tracing::{debug, error, warn};

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Clone)]
struct Lane {
    tx: mpsc::UnboundedSender<Job>,
    pending: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl Lane {
    fn release(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    fn send(&self, key: i64, job: Job) {
        if self.tx.send(job).is_err() {
            warn!(lane = key, "Lane closed, dropping job");
            self.release();
        }
    }
}

/// "Run serially per key" dispatcher
#[derive(Clone)]
pub struct LaneDispatcher {
    handle: Handle,
    lanes: Arc<DashMap<i64, Lane>>,
    permits: Arc<Semaphore>,
}

impl std::fmt::Debug for LaneDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaneDispatcher")
            .field("lanes", &self.lanes.len())
            .field("available_permits", &self.permits.available_permits())
            .finish()
    }
}

impl LaneDispatcher {
    pub fn new(handle: Handle, workers: usize) -> Self {
        Self {
            handle,
            lanes: Arc::new(DashMap::new()),
            permits: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    fn lane(&self, key: i64) -> Lane {
        self.lanes
            .entry(key)
            .or_insert_with(|| self.spawn_lane(key))
            .clone()
    }

    fn spawn_lane(&self, key: i64) -> Lane {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let lane = Lane {
            tx,
            pending: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
        };

        let permits = Arc::clone(&self.permits);
        let worker = lane.clone();
        self.handle.spawn(async move {
            while let Some(job) = rx.recv().await {
                let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                    break;
                };
                let run = tokio::task::spawn_blocking(move || {
                    job();
                    drop(permit);
                });
                if let Err(e) = run.await {
                    error!(lane = key, error = %e, "Lane job failed");
                }
                worker.release();
            }
            debug!(lane = key, "Lane stopped");
        });
        debug!(lane = key, "Lane started");
        lane
    }

    /// Queue `job` on the lane for `key`
    pub fn submit<F>(&self, key: i64, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let lane = self.lane(key);
        lane.pending.fetch_add(1, Ordering::SeqCst);
        lane.send(key, Box::new(job));
    }

    /// Queue `job` on the lane for `key` once `delay` has elapsed. The lane
    /// counts as busy while the timer runs.
    pub fn submit_after<F>(&self, key: i64, delay: Duration, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let lane = self.lane(key);
        lane.pending.fetch_add(1, Ordering::SeqCst);
        let job: Job = Box::new(job);
        self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            lane.send(key, job);
        });
    }

    /// Jobs queued, running or waiting on a timer for `key`
    #[must_use]
    pub fn pending(&self, key: i64) -> usize {
        self.lanes
            .get(&key)
            .map_or(0, |lane| lane.pending.load(Ordering::SeqCst))
    }

    /// Wait until the lane for `key` has nothing queued, running or scheduled
    pub async fn flush(&self, key: i64) {
        let Some(lane) = self.lanes.get(&key).map(|lane| lane.clone()) else {
            return;
        };
        loop {
            let idle = lane.idle.notified();
            if lane.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            idle.await;
        }
    }
}
