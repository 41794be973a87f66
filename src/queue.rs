//! Admission queue for GPU work
//!
//! Every task that touches the accelerator goes through this queue. A single worker takes
//! tasks in submission order and runs each to completion before looking at the next, so at
//! most one task executes at any instant.
//!
//! ```text
//! submit ─▶ [ unbounded channel ] ─▶ worker ─▶ spawn(task) ─▶ cleanup ─▶ next
//!    ▲                                            │
//!    └──────────────── oneshot result ◀───────────┘
//! ```
//!
//! Each task runs on its own spawned tokio task, so a panic is contained and reported to that
//! task's waiter. The worker itself never exits until [`AdmissionQueue::stop`].
use futures_util::future::BoxFuture;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// The queue stopped before the task ran.
    #[error("GPU queue stopped before the task ran")]
    Cancelled,

    /// The queue has been stopped and no longer accepts tasks.
    #[error("GPU queue is not accepting tasks")]
    Closed,

    #[error("task panicked: {0}")]
    Panicked(String),

    #[error("GPU queue worker already started")]
    AlreadyStarted,
}

type Job = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Runs after every task, on the blocking pool.
pub type Cleanup = Arc<dyn Fn() + Send + Sync>;

struct QueueInner {
    tx: mpsc::UnboundedSender<Job>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Job>>>,
    pending: Arc<AtomicUsize>,
    accepting: AtomicBool,
    shutdown: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    cleanup: Option<Cleanup>,
}

/// Serializes access to the accelerator.
#[derive(Clone)]
pub struct AdmissionQueue {
    inner: Arc<QueueInner>,
}

impl std::fmt::Debug for AdmissionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionQueue")
            .field("pending", &self.pending())
            .field("accepting", &self.is_accepting())
            .finish()
    }
}

impl Default for AdmissionQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl AdmissionQueue {
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Create a queue that calls `cleanup` after every task, before dequeuing the next.
    pub fn with_cleanup(cleanup: impl Fn() + Send + Sync + 'static) -> Self {
        Self::build(Some(Arc::new(cleanup)))
    }

    fn build(cleanup: Option<Cleanup>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(QueueInner {
                tx,
                rx: Mutex::new(Some(rx)),
                pending: Arc::new(AtomicUsize::new(0)),
                accepting: AtomicBool::new(true),
                shutdown,
                worker: Mutex::new(None),
                cleanup,
            }),
        }
    }

    /// Start the single worker. Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<(), QueueError> {
        let rx = lock(&self.inner.rx).take().ok_or(QueueError::AlreadyStarted)?;
        let worker = tokio::spawn(run_worker(
            rx,
            Arc::clone(&self.inner.pending),
            self.inner.shutdown.subscribe(),
            self.inner.cleanup.clone(),
        ));
        *lock(&self.inner.worker) = Some(worker);
        info!("GPU queue worker started");
        Ok(())
    }

    /// Number of tasks submitted but not yet picked up by the worker.
    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::SeqCst)
    }

    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::SeqCst)
    }

    /// Submit a task and wait for its result.
    ///
    /// The task is never run on the caller's task. If the caller stops waiting before the task
    /// starts, the task is skipped; once started it runs to completion and the result is
    /// discarded.
    pub async fn submit<T, E, F, Fut>(&self, task: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: From<QueueError> + Send + 'static,
    {
        if !self.is_accepting() {
            return Err(QueueError::Closed.into());
        }

        let (result_tx, result_rx) = oneshot::channel::<Result<T, E>>();
        let job: Job = Box::new(move || {
            Box::pin(async move {
                if result_tx.is_closed() {
                    debug!("Waiter went away, skipping task");
                    return;
                }
                let outcome = match tokio::spawn(task()).await {
                    Ok(result) => result,
                    Err(e) if e.is_panic() => {
                        error!(error = %e, "GPU task panicked");
                        Err(QueueError::Panicked(e.to_string()).into())
                    }
                    Err(_) => Err(QueueError::Cancelled.into()),
                };
                if result_tx.send(outcome).is_err() {
                    debug!("Waiter went away, discarding result");
                }
            })
        });

        self.inner.pending.fetch_add(1, Ordering::SeqCst);
        if self.inner.tx.send(job).is_err() {
            self.inner.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(QueueError::Closed.into());
        }
        trace!(pending = self.pending(), "Task queued");

        match result_rx.await {
            Ok(result) => result,
            Err(_) => Err(QueueError::Cancelled.into()),
        }
    }

    /// Stop accepting work, cancel everything still queued and wait for the worker to exit.
    ///
    /// A task that is already running finishes and its waiter gets the real result.
    pub async fn stop(&self) {
        self.inner.accepting.store(false, Ordering::SeqCst);
        self.inner.shutdown.send_replace(true);

        let worker = lock(&self.inner.worker).take();
        match worker {
            Some(handle) => {
                if let Err(e) = handle.await {
                    error!(error = %e, "GPU queue worker failed");
                }
            }
            None => {
                // Never started: cancel anything submitted in the meantime.
                let rx = lock(&self.inner.rx).take();
                if let Some(rx) = rx {
                    cancel_remaining(rx, &self.inner.pending);
                }
            }
        }
        info!("GPU queue worker stopped");
    }
}

async fn run_worker(
    mut rx: mpsc::UnboundedReceiver<Job>,
    pending: Arc<AtomicUsize>,
    mut shutdown: watch::Receiver<bool>,
    cleanup: Option<Cleanup>,
) {
    loop {
        let job = tokio::select! {
            biased;
            _ = shutdown.wait_for(|stop| *stop) => break,
            job = rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };
        pending.fetch_sub(1, Ordering::SeqCst);

        job().await;

        if let Some(cleanup) = &cleanup {
            let cleanup = Arc::clone(cleanup);
            if let Err(e) = tokio::task::spawn_blocking(move || cleanup()).await {
                warn!(error = %e, "Cleanup after GPU task failed");
            }
        }
    }

    cancel_remaining(rx, &pending);
}

/// Close the channel and drop every queued job. Dropping a job drops its result sender, which
/// resolves the waiter with `QueueError::Cancelled`.
fn cancel_remaining(mut rx: mpsc::UnboundedReceiver<Job>, pending: &AtomicUsize) {
    rx.close();
    let mut cancelled = 0usize;
    while let Ok(job) = rx.try_recv() {
        pending.fetch_sub(1, Ordering::SeqCst);
        drop(job);
        cancelled += 1;
    }
    if cancelled > 0 {
        warn!(cancelled, "Cancelled queued GPU tasks on shutdown");
    }
}
