//! Single-threaded cooperative event loop.
//!
//! One dedicated OS thread runs a current-thread tokio runtime; every task
//! the proxy spawns lands on that runtime, so user callbacks, pipe
//! continuations, and timer dispatch all execute on the one worker thread.
//! Foreign threads hand work to the loop through a FIFO queue; the loop
//! drains it between ticks.
//!
//! Panics inside work items or callbacks are caught, reported through the
//! observer's error sink, and never kill the loop.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::events::ProxyEvents;
use crate::proxy::session::Session;

/// A unit of work executed exactly once on the worker thread.
///
/// Items run inside the runtime context, so they may spawn tasks.
pub(crate) type WorkItem = Box<dyn FnOnce() + Send + 'static>;

/// The proxy's scheduler: worker thread, work queue, ticks, shutdown.
pub struct EventLoop {
    shared: Arc<LoopShared>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

pub(crate) struct LoopShared {
    config: ProxyConfig,
    work_tx: mpsc::UnboundedSender<WorkItem>,
    shutdown_tx: watch::Sender<bool>,
    disposing: AtomicBool,
    tick_period_ms: AtomicU64,
    started: Instant,
    worker_thread: OnceLock<ThreadId>,
    events: Arc<dyn ProxyEvents>,
    sessions: Mutex<Vec<Arc<Session>>>,
}

impl EventLoop {
    /// Starts the worker thread and its runtime.
    pub fn new(config: &ProxyConfig, events: Arc<dyn ProxyEvents>) -> std::io::Result<Self> {
        let (work_tx, work_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(LoopShared {
            config: config.clone(),
            work_tx,
            shutdown_tx,
            disposing: AtomicBool::new(false),
            tick_period_ms: AtomicU64::new(config.tick_period.as_millis() as u64),
            started: Instant::now(),
            worker_thread: OnceLock::new(),
            events,
            sessions: Mutex::new(Vec::new()),
        });

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let worker_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("nulproxy-worker".to_string())
            .spawn(move || {
                let _ = worker_shared.worker_thread.set(thread::current().id());
                runtime.block_on(worker_main(Arc::clone(&worker_shared), work_rx, shutdown_rx));
                // Dropping the runtime cancels leftover tasks, closing any
                // sockets they still hold.
            })?;

        Ok(Self {
            shared,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Enqueues a work item for the worker. Fails once the loop is disposing.
    pub fn schedule(&self, f: impl FnOnce() + Send + 'static) -> Result<(), ProxyError> {
        self.shared.schedule(Box::new(f))
    }

    /// True iff called on the loop's worker thread.
    pub fn is_worker_thread(&self) -> bool {
        self.shared.is_worker_thread()
    }

    /// Minimum interval between tick emissions.
    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(self.shared.tick_period_ms.load(Ordering::Relaxed))
    }

    /// Sets the minimum interval between tick emissions. Zero means spin.
    pub fn set_tick_period(&self, period: Duration) {
        self.shared
            .tick_period_ms
            .store(period.as_millis() as u64, Ordering::Relaxed);
    }

    /// Stops the loop and releases its resources. Idempotent.
    ///
    /// Live sessions emit their disconnected event and both of their sockets
    /// close before the worker exits. When called from the worker itself the
    /// thread join is handed to a helper thread; a thread cannot join itself.
    pub fn dispose(&self) {
        if self.shared.disposing.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.shared.shutdown_tx.send(true);
        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            if self.shared.is_worker_thread() {
                thread::spawn(move || {
                    let _ = handle.join();
                });
            } else {
                let _ = handle.join();
            }
        }
    }

    pub(crate) fn shared(&self) -> &Arc<LoopShared> {
        &self.shared
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl LoopShared {
    pub(crate) fn schedule(&self, item: WorkItem) -> Result<(), ProxyError> {
        if self.disposing.load(Ordering::Acquire) {
            return Err(ProxyError::ShuttingDown);
        }
        self.work_tx.send(item).map_err(|_| ProxyError::ShuttingDown)
    }

    pub(crate) fn is_worker_thread(&self) -> bool {
        self.worker_thread
            .get()
            .is_some_and(|id| *id == thread::current().id())
    }

    pub(crate) fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub(crate) fn events(&self) -> &Arc<dyn ProxyEvents> {
        &self.events
    }

    /// A receiver on the loop's cancellation signal; observed by every
    /// socket operation.
    pub(crate) fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub(crate) fn register(&self, session: Arc<Session>) {
        self.sessions.lock().unwrap().push(session);
    }

    pub(crate) fn unregister(&self, id: u64) {
        self.sessions.lock().unwrap().retain(|s| s.id() != id);
    }
}

async fn worker_main(
    shared: Arc<LoopShared>,
    mut work_rx: mpsc::UnboundedReceiver<WorkItem>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let events = Arc::clone(&shared.events);
    let mut last_tick: Option<Instant> = None;

    loop {
        let period = Duration::from_millis(shared.tick_period_ms.load(Ordering::Relaxed));

        // Wait up to one tick period for work, then drain everything
        // immediately available.
        let stop = tokio::select! {
            biased;
            _ = shutdown_rx.wait_for(|stop| *stop) => true,
            item = work_rx.recv() => match item {
                Some(item) => {
                    run_work_item(item, &events);
                    while let Ok(item) = work_rx.try_recv() {
                        run_work_item(item, &events);
                    }
                    false
                }
                None => true,
            },
            _ = tokio::time::sleep(period) => false,
        };
        if stop {
            break;
        }

        if last_tick.map_or(true, |t| t.elapsed() >= period) {
            let elapsed_ms = shared.started.elapsed().as_millis() as u64;
            if let Err(panic) = AssertUnwindSafe(events.on_tick(elapsed_ms))
                .catch_unwind()
                .await
            {
                events.on_error("tick callback", panic_message(panic));
            }
            last_tick = Some(Instant::now());
        }
    }

    // Dispose every live session before the runtime goes away, so each emits
    // its disconnected event exactly once.
    let live: Vec<Arc<Session>> = shared.sessions.lock().unwrap().drain(..).collect();
    if !live.is_empty() {
        debug!(sessions = live.len(), "disposing live sessions at shutdown");
    }
    for session in live {
        session.dispose_on_worker().await;
    }
}

fn run_work_item(item: WorkItem, events: &Arc<dyn ProxyEvents>) {
    if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(item)) {
        events.on_error("work item", panic_message(panic));
    }
}

/// Best-effort rendering of a panic payload.
pub(crate) fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}
