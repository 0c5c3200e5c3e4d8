//! Worker lanes for message processing
//!
//! Each [`ExecutorRole`] owns one bounded queue drained by a fixed set of
//! workers. Submission never waits: a full queue rejects the job and the
//! caller decides what to log. All workers stop on the service's
//! cancellation token.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// A unit of work for a lane
pub type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Logical lanes work can be submitted to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutorRole {
    /// Inbound SIP messages bound for the transaction layer
    SipProcessing,
}

impl fmt::Display for ExecutorRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutorRole::SipProcessing => f.write_str("sip-processing"),
        }
    }
}

/// Why a submission was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    /// The lane's queue is at capacity
    Full,
    /// No lane is running for the role, or it has shut down
    Closed,
}

struct Lane {
    tx: mpsc::Sender<Job>,
    workers: Vec<JoinHandle<()>>,
    rejected: AtomicU64,
}

/// Owner of the worker lanes
pub struct ExecutorService {
    lanes: RwLock<HashMap<ExecutorRole, Lane>>,
    cancel: CancellationToken,
}

impl ExecutorService {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            lanes: RwLock::new(HashMap::new()),
            cancel,
        }
    }

    /// Start `workers` workers behind a queue of `capacity` jobs for `role`
    pub fn start_lane(&self, role: ExecutorRole, workers: usize, capacity: usize) -> Result<()> {
        if workers == 0 || capacity == 0 {
            return Err(Error::config(format!("lane {} needs workers and capacity", role)));
        }
        let mut lanes = self.lanes.write();
        if lanes.contains_key(&role) {
            return Err(Error::config(format!("lane {} already running", role)));
        }

        let (tx, rx) = mpsc::channel::<Job>(capacity);
        let rx = Arc::new(Mutex::new(rx));
        let handles = (0..workers)
            .map(|index| {
                let rx = rx.clone();
                let cancel = self.cancel.clone();
                tokio::spawn(async move {
                    loop {
                        let job = tokio::select! {
                            _ = cancel.cancelled() => break,
                            job = async { rx.lock().await.recv().await } => job,
                        };
                        match job {
                            Some(job) => job.await,
                            None => break,
                        }
                    }
                    debug!("{} worker {} stopped", role, index);
                })
            })
            .collect();

        info!("Started {} lane with {} workers, queue {}", role, workers, capacity);
        lanes.insert(
            role,
            Lane {
                tx,
                workers: handles,
                rejected: AtomicU64::new(0),
            },
        );
        Ok(())
    }

    /// Queue `job` on `role` without waiting
    pub fn submit(&self, role: ExecutorRole, job: Job) -> std::result::Result<(), SubmitError> {
        let lanes = self.lanes.read();
        let Some(lane) = lanes.get(&role) else {
            return Err(SubmitError::Closed);
        };
        match lane.tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                lane.rejected.fetch_add(1, Ordering::Relaxed);
                Err(SubmitError::Full)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SubmitError::Closed),
        }
    }

    /// Jobs refused on `role` because its queue was full
    pub fn rejected(&self, role: ExecutorRole) -> u64 {
        self.lanes
            .read()
            .get(&role)
            .map_or(0, |lane| lane.rejected.load(Ordering::Relaxed))
    }

    /// Stop every lane, waiting up to `timeout` for workers to finish their current job
    pub async fn shutdown(&self, timeout: Duration) {
        self.cancel.cancel();
        let lanes: Vec<(ExecutorRole, Lane)> = self.lanes.write().drain().collect();
        for (role, lane) in lanes {
            drop(lane.tx);
            for handle in lane.workers {
                if tokio::time::timeout(timeout, handle).await.is_err() {
                    warn!("{} worker did not stop within {:?}", role, timeout);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_jobs_run_on_lane() {
        let executor = ExecutorService::new(CancellationToken::new());
        executor.start_lane(ExecutorRole::SipProcessing, 2, 16).unwrap();

        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        for i in 0..8 {
            let done_tx = done_tx.clone();
            executor
                .submit(ExecutorRole::SipProcessing, Box::pin(async move {
                    let _ = done_tx.send(i);
                }))
                .unwrap();
        }
        let mut seen = Vec::new();
        for _ in 0..8 {
            seen.push(done_rx.recv().await.unwrap());
        }
        seen.sort();
        assert_eq!(seen, (0..8).collect::<Vec<_>>());
        executor.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_full_lane_rejects() {
        let executor = ExecutorService::new(CancellationToken::new());
        executor.start_lane(ExecutorRole::SipProcessing, 1, 1).unwrap();

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let started = Arc::new(AtomicUsize::new(0));
        let started_in_job = started.clone();
        executor
            .submit(ExecutorRole::SipProcessing, Box::pin(async move {
                started_in_job.fetch_add(1, Ordering::SeqCst);
                let _ = release_rx.await;
            }))
            .unwrap();
        while started.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        // One job fills the queue, the next is refused
        executor.submit(ExecutorRole::SipProcessing, Box::pin(async {})).unwrap();
        let refused = executor.submit(ExecutorRole::SipProcessing, Box::pin(async {}));
        assert_eq!(refused, Err(SubmitError::Full));
        assert_eq!(executor.rejected(ExecutorRole::SipProcessing), 1);

        let _ = release_tx.send(());
        executor.shutdown(Duration::from_secs(1)).await;
        assert_eq!(
            executor.submit(ExecutorRole::SipProcessing, Box::pin(async {})),
            Err(SubmitError::Closed)
        );
    }

    #[test]
    fn test_lane_needs_workers() {
        let executor = ExecutorService::new(CancellationToken::new());
        assert!(executor.start_lane(ExecutorRole::SipProcessing, 0, 8).is_err());
    }
}
