//! Bounded background worker pool for work that must not delay a response.
//!
//! Submission never blocks: a full or closed queue refuses the job and the
//! refusal is counted. Shutdown stops intake and drains what was accepted,
//! up to a grace period.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::metrics;

type BoxedJob = Pin<Box<dyn Future<Output = ()> + Send>>;

struct Job {
    name: &'static str,
    work: BoxedJob,
}

pub struct BackgroundQueue {
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    pending: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl BackgroundQueue {
    /// Spawn `workers` tasks sharing a queue of `capacity` jobs.
    pub fn start(workers: usize, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel::<Job>(capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let pending = Arc::new(AtomicUsize::new(0));
        let idle = Arc::new(Notify::new());

        let handles = (0..workers.max(1))
            .map(|worker| {
                let rx = Arc::clone(&rx);
                let pending = Arc::clone(&pending);
                let idle = Arc::clone(&idle);
                tokio::spawn(async move {
                    loop {
                        let job = {
                            let mut rx = rx.lock().await;
                            rx.recv().await
                        };
                        let Some(job) = job else { break };

                        debug!(worker, job = job.name, "Running background job");
                        if let Err(e) = tokio::spawn(job.work).await {
                            error!(worker, job = job.name, error = %e, "Background job panicked");
                        }

                        let left = pending.fetch_sub(1, Ordering::SeqCst) - 1;
                        metrics::QUEUE_DEPTH.set(left as i64);
                        if left == 0 {
                            idle.notify_waiters();
                        }
                    }
                    debug!(worker, "Background worker stopped");
                })
            })
            .collect();

        Self {
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(handles),
            pending,
            idle,
        }
    }

    /// Queue a job. Returns false (and counts the refusal) when the queue is
    /// full or shutting down.
    pub fn try_submit<F>(&self, name: &'static str, work: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let sender = match self.sender.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        let Some(sender) = sender else {
            warn!(job = name, "Background queue closed, dropping job");
            metrics::QUEUE_REJECTIONS.with_label_values(&[name]).inc();
            return false;
        };

        self.pending.fetch_add(1, Ordering::SeqCst);
        let job = Job {
            name,
            work: Box::pin(work),
        };
        match sender.try_send(job) {
            Ok(()) => {
                metrics::QUEUE_DEPTH.set(self.depth() as i64);
                true
            }
            Err(e) => {
                let left = self.pending.fetch_sub(1, Ordering::SeqCst) - 1;
                if left == 0 {
                    self.idle.notify_waiters();
                }
                warn!(job = name, error = %e, "Background queue refused job");
                metrics::QUEUE_REJECTIONS.with_label_values(&[name]).inc();
                false
            }
        }
    }

    /// Jobs accepted but not yet finished.
    pub fn depth(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Wait until every accepted job (including ones submitted meanwhile) has run.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Stop accepting jobs and drain the queue, aborting whatever is still
    /// running after `grace`.
    pub async fn shutdown(&self, grace: Duration) {
        match self.sender.lock() {
            Ok(mut guard) => drop(guard.take()),
            Err(poisoned) => drop(poisoned.into_inner().take()),
        }

        let handles: Vec<JoinHandle<()>> = match self.workers.lock() {
            Ok(mut guard) => guard.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        info!(pending = self.depth(), "Draining background queue");

        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        let drain = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(grace, drain).await.is_err() {
            warn!(pending = self.depth(), "Background queue did not drain in time, aborting");
            for abort in aborts {
                abort.abort();
            }
        }
    }
}
