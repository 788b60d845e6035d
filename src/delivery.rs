//! Delivery scheduler.
//!
//! A fixed pool of worker tasks pulls queue tasks from one shared channel. A
//! delivery task runs one [`QueueHandler::deliver_batch`] round per turn and goes
//! straight back on the channel while it makes progress; an idle round parks it
//! for the configured delay first. Expiry tasks sweep a queue for expired
//! messages once per expiry interval.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, OnceLock, Weak,
    },
    time::Duration,
};

use chrono::Utc;
use futures_util::future::BoxFuture;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{config::Config, error::Result, message::Message, queue::QueueHandler};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// The run made progress and the queue may have more work.
    Active,
    Idle,
}

/// Moves a message out of its queue onto the dead-letter exchange.
pub trait DeadLetterRouter: Send + Sync {
    /// Publishes a dead-letter copy of `message` and, once that succeeded,
    /// acknowledges the original on `queue`.
    fn dead_letter<'a>(
        &'a self,
        queue: &'a Arc<QueueHandler>,
        message: &'a Message,
    ) -> BoxFuture<'a, Result<()>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskKind {
    Delivery,
    Expiry,
}

struct Task {
    kind: TaskKind,
    queue: Weak<QueueHandler>,
    cancelled: AtomicBool,
}

impl Task {
    fn new(kind: TaskKind, queue: &Arc<QueueHandler>) -> Arc<Self> {
        Arc::new(Self {
            kind,
            queue: Arc::downgrade(queue),
            cancelled: AtomicBool::new(false),
        })
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

struct Workers {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

struct SchedulerInner {
    workers: usize,
    batch_size: usize,
    idle_delay: Duration,
    expiry_batch_size: usize,
    expiry_interval: Duration,

    tx: mpsc::UnboundedSender<Arc<Task>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Arc<Task>>>,

    delivery: papaya::HashMap<String, Arc<Task>>,
    expiry: papaya::HashMap<String, Arc<Task>>,

    running: Mutex<Option<Workers>>,
    dead_letters: OnceLock<Weak<dyn DeadLetterRouter>>,
}

/// Handle to the shared scheduler. Cloning is cheap.
#[derive(Clone)]
pub struct DeliveryScheduler {
    inner: Arc<SchedulerInner>,
}

impl DeliveryScheduler {
    pub fn new(config: &Config) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();

        Self {
            inner: Arc::new(SchedulerInner {
                workers: config.delivery_workers(),
                batch_size: config.delivery_batch_size(),
                idle_delay: config.idle_delay(),
                expiry_batch_size: config.expiry_batch_size(),
                expiry_interval: config.expiry_interval(),
                tx,
                rx: tokio::sync::Mutex::new(rx),
                delivery: papaya::HashMap::new(),
                expiry: papaya::HashMap::new(),
                running: Mutex::new(None),
                dead_letters: OnceLock::new(),
            }),
        }
    }

    pub(crate) fn set_dead_letter_router(&self, router: Weak<dyn DeadLetterRouter>) {
        let _ = self.inner.dead_letters.set(router);
    }

    /// Schedules delivery for `queue`. Tasks registered while the scheduler is
    /// stopped wait on the channel until it starts.
    pub fn register(&self, queue: &Arc<QueueHandler>) {
        self.inner.submit(&self.inner.delivery, TaskKind::Delivery, queue);
    }

    pub fn deregister(&self, queue: &str) {
        if let Some(task) = self.inner.delivery.pin().remove(queue) {
            task.cancel();
        }
    }

    pub fn register_expiry(&self, queue: &Arc<QueueHandler>) {
        self.inner.submit(&self.inner.expiry, TaskKind::Expiry, queue);
    }

    pub fn deregister_expiry(&self, queue: &str) {
        if let Some(task) = self.inner.expiry.pin().remove(queue) {
            task.cancel();
        }
    }

    pub fn is_registered(&self, queue: &str) -> bool {
        self.inner.delivery.pin().contains_key(queue)
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock_running().is_some()
    }

    /// Spawns the worker pool. Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut running = self.inner.lock_running();
        if running.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let handles = (0..self.inner.workers)
            .map(|index| tokio::spawn(worker(Arc::clone(&self.inner), token.clone(), index)))
            .collect();

        *running = Some(Workers { token, handles });
        tracing::info!(workers = self.inner.workers, "message delivery started");
    }

    /// Stops the worker pool. Rounds already in progress finish first; their
    /// tasks stay queued for the next start.
    pub async fn stop(&self) {
        let Some(workers) = self.inner.lock_running().take() else {
            return;
        };

        workers.token.cancel();
        for handle in workers.handles {
            if let Err(e) = handle.await {
                tracing::error!("delivery worker panicked: {e}");
            }
        }

        tracing::info!("message delivery stopped");
    }

    /// Cancels every task, for shutdown.
    pub fn clear(&self) {
        for map in [&self.inner.delivery, &self.inner.expiry] {
            let map = map.pin();
            for task in map.values() {
                task.cancel();
            }
            map.clear();
        }
    }
}

impl SchedulerInner {
    fn lock_running(&self) -> std::sync::MutexGuard<'_, Option<Workers>> {
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn submit(
        &self,
        tasks: &papaya::HashMap<String, Arc<Task>>,
        kind: TaskKind,
        queue: &Arc<QueueHandler>,
    ) {
        let task = Task::new(kind, queue);
        if let Some(previous) = tasks.pin().insert(queue.name().to_owned(), Arc::clone(&task)) {
            previous.cancel();
        }

        // Only fails once the scheduler is dropped.
        let _ = self.tx.send(task);
    }

    fn reschedule(&self, task: Arc<Task>, state: RunState) {
        if task.is_cancelled() {
            return;
        }

        let delay = match (task.kind, state) {
            (TaskKind::Delivery, RunState::Active) => None,
            (TaskKind::Delivery, RunState::Idle) => Some(self.idle_delay),
            (TaskKind::Expiry, _) => Some(self.expiry_interval),
        };

        match delay {
            None => {
                let _ = self.tx.send(task);
            }
            Some(delay) => {
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if !task.is_cancelled() {
                        let _ = tx.send(task);
                    }
                });
            }
        }
    }

    async fn next_task(&self) -> Option<Arc<Task>> {
        self.rx.lock().await.recv().await
    }

    /// Sweeps one batch of expired messages off `queue`.
    async fn expire(&self, queue: &Arc<QueueHandler>) -> RunState {
        let expired = queue.expired_batch(self.expiry_batch_size, Utc::now());
        if expired.is_empty() {
            return RunState::Idle;
        }

        let router = if queue.queue().dead_letters_expired() {
            self.dead_letters.get().and_then(Weak::upgrade)
        } else {
            None
        };

        tracing::debug!(queue = queue.name(), count = expired.len(), "expiring messages");

        for message in expired {
            match &router {
                Some(router) => {
                    if let Err(e) = router.dead_letter(queue, &message).await {
                        tracing::warn!(
                            queue = queue.name(),
                            message = message.id(),
                            "failed to dead-letter expired message, keeping it: {e}"
                        );
                        queue.return_message(message);
                    }
                }
                None => {
                    if let Err(e) = queue.acknowledge(&message).await {
                        tracing::error!(
                            queue = queue.name(),
                            message = message.id(),
                            "failed to drop expired message: {e}"
                        );
                    }
                }
            }
        }

        RunState::Active
    }
}

async fn worker(inner: Arc<SchedulerInner>, token: CancellationToken, index: usize) {
    tracing::trace!(worker = index, "delivery worker started");

    loop {
        let task = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            task = inner.next_task() => task,
        };

        let Some(task) = task else {
            break;
        };
        if task.is_cancelled() {
            continue;
        }
        let Some(queue) = task.queue.upgrade() else {
            continue;
        };

        let state = match task.kind {
            TaskKind::Delivery => queue.deliver_batch(inner.batch_size).await,
            TaskKind::Expiry => inner.expire(&queue).await,
        };
        drop(queue);

        inner.reschedule(task, state);
    }

    tracing::trace!(worker = index, "delivery worker stopped");
}
