use std::{
    collections::{HashMap, VecDeque},
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use chrono::{DateTime, Utc};

use crate::{
    consumer::Consumer,
    delivery::{DeliveryScheduler, RunState},
    error::{Error, Result},
    message::Message,
    queue::{Queue, QueueEvent, QueueListener},
    store::MessageStore,
    transaction::Xid,
};

#[derive(Default)]
struct Staged {
    enqueues: Vec<Message>,
    detaches: Vec<Message>,
    /// Detached copies rebuilt from storage for a recovered branch. They are not
    /// held by anyone else, so a rollback puts them back in the buffer.
    recovered: Vec<Message>,
}

/// Runtime state of one queue: its buffers, consumers and transactional staging.
pub struct QueueHandler {
    queue: Queue,
    store: MessageStore,
    scheduler: DeliveryScheduler,
    listener: Option<Arc<dyn QueueListener>>,

    messages: Mutex<VecDeque<Message>>,
    /// Requeued messages, always delivered before `messages`.
    redelivery: Mutex<VecDeque<Message>>,

    consumers: papaya::HashMap<u64, Arc<Consumer>>,
    /// Serializes consumer membership changes with scheduler registration.
    membership: tokio::sync::Mutex<()>,
    cursor: AtomicUsize,

    staged: Mutex<HashMap<Xid, Staged>>,
    deleted: AtomicBool,
}

impl fmt::Debug for QueueHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueHandler")
            .field("queue", &self.name())
            .field("messages", &self.message_count())
            .field("consumers", &self.consumer_count())
            .field("deleted", &self.is_deleted())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl QueueHandler {
    pub fn new(
        queue: Queue,
        store: MessageStore,
        scheduler: DeliveryScheduler,
        listener: Option<Arc<dyn QueueListener>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| {
            // A fresh queue has no handler yet, so this cannot fail.
            let _ = queue.attach_handler(weak.clone());

            Self {
                queue,
                store,
                scheduler,
                listener,
                messages: Mutex::new(VecDeque::new()),
                redelivery: Mutex::new(VecDeque::new()),
                consumers: papaya::HashMap::new(),
                membership: tokio::sync::Mutex::new(()),
                cursor: AtomicUsize::new(0),
                staged: Mutex::new(HashMap::new()),
                deleted: AtomicBool::new(false),
            }
        })
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    pub fn name(&self) -> &str {
        self.queue.name()
    }

    pub fn is_durable(&self) -> bool {
        self.queue.is_durable()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    fn emit(&self, event: QueueEvent) {
        if let Some(listener) = &self.listener {
            listener.on_event(self.name(), &event);
        }
    }

    fn persists(&self, message: &Message) -> bool {
        self.queue.is_durable() && message.is_persistent()
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.is_deleted() {
            return Err(Error::queue_not_found(self.name()));
        }
        Ok(())
    }

    fn ensure_owned(&self, message: &Message) -> Result<()> {
        if message.queue() != Some(self.name()) {
            return Err(Error::validation(format!(
                "message {} is not held by queue {}",
                message.id(),
                self.name()
            )));
        }
        Ok(())
    }

    /// Copies staged by open transactions that will land in this queue on commit.
    fn staged_enqueue_count(&self) -> usize {
        lock(&self.staged).values().map(|s| s.enqueues.len()).sum()
    }

    fn ensure_capacity(&self) -> Result<()> {
        match self.queue.capacity() {
            Some(capacity) if self.message_count() + self.staged_enqueue_count() >= capacity => {
                Err(Error::validation(format!(
                    "queue {} is full ({capacity} messages)",
                    self.name()
                )))
            }
            _ => Ok(()),
        }
    }

    pub fn message_count(&self) -> usize {
        lock(&self.messages).len() + lock(&self.redelivery).len()
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.pin().len()
    }

    /// Adds a copy of `message` to the queue. Copies bound for storage are handed
    /// to the store before they become visible to consumers.
    pub async fn enqueue(&self, message: &Message) -> Result<()> {
        self.ensure_alive()?;
        self.ensure_capacity()?;

        let copy = message.shallow_copy_for(self.name());
        if self.persists(&copy) {
            if let Err(e) = self.store.add_message(&copy).await {
                copy.release();
                return Err(e);
            }
        }

        {
            // `close` flags the handler before draining, so the flag is final here.
            let mut messages = lock(&self.messages);
            if !self.is_deleted() {
                messages.push_back(copy);
                return Ok(());
            }
        }

        if copy.release() && self.persists(&copy) {
            if let Err(e) = self.store.delete_message(&copy).await {
                tracing::warn!(
                    queue = self.name(),
                    message = copy.id(),
                    "failed to drop message of deleted queue: {e}"
                );
            }
        }
        Err(Error::queue_not_found(self.name()))
    }

    /// Puts back a copy read from storage during reload. Nothing is written.
    pub(crate) fn restore(&self, message: &Message) {
        let copy = message.shallow_copy_for(self.name());
        lock(&self.messages).push_back(copy);
    }

    /// Returns a copy to the head of the queue after a failed hand-off.
    pub(crate) fn return_message(&self, message: Message) {
        lock(&self.messages).push_front(message);
    }

    /// Loads the body of a message reloaded without content.
    pub(crate) async fn ensure_content(&self, message: &Message) -> Result<()> {
        if !message.is_content_loaded() {
            let content = self.store.read_content(message).await?;
            message.load_content(content);
        }
        Ok(())
    }

    /// Next message to deliver, requeued messages first.
    pub async fn take_for_delivery(&self) -> Option<Message> {
        let redelivered = lock(&self.redelivery).pop_front();
        let message = match redelivered {
            Some(message) => message,
            None => lock(&self.messages).pop_front()?,
        };

        if let Err(e) = self.ensure_content(&message).await {
            tracing::error!(
                queue = self.name(),
                message = message.id(),
                "failed to load message content: {e}"
            );
            lock(&self.redelivery).push_front(message);
            return None;
        }

        Some(message)
    }

    /// Drops this queue's ownership of a delivered copy. The store deletes the
    /// message when no queue holds it any more and otherwise forgets only this
    /// queue's association.
    pub async fn acknowledge(&self, message: &Message) -> Result<()> {
        self.ensure_owned(message)?;

        let orphaned = message.release();
        if !message.is_persistent() {
            return Ok(());
        }

        let result = if orphaned {
            self.store.delete_message(message).await
        } else if self.queue.is_durable() {
            self.store.detach_message(message).await
        } else {
            Ok(())
        };

        if result.is_err() {
            message.reattach();
        }
        result
    }

    /// Hands a delivered copy back for redelivery ahead of the main buffer.
    pub fn requeue(&self, mut message: Message) -> Result<()> {
        self.ensure_owned(&message)?;
        self.ensure_alive()?;

        message.mark_redelivered();
        lock(&self.redelivery).push_back(message);
        Ok(())
    }

    /// Drops every undelivered message. Returns how many were dropped.
    pub async fn purge(&self) -> Result<usize> {
        let mut drained: Vec<Message> = lock(&self.redelivery).drain(..).collect();
        drained.extend(lock(&self.messages).drain(..));

        let count = drained.len();
        for message in &drained {
            if let Err(e) = self.acknowledge(message).await {
                tracing::error!(queue = self.name(), message = message.id(), "failed to purge message: {e}");
            }
        }

        tracing::debug!(queue = self.name(), count, "queue purged");
        self.emit(QueueEvent::Purged { count });
        Ok(count)
    }

    /// Removes up to `limit` messages that expired at or before `now`.
    pub fn expired_batch(&self, limit: usize, now: DateTime<Utc>) -> Vec<Message> {
        let mut expired = Vec::new();

        for buffer in [&self.redelivery, &self.messages] {
            lock(buffer).retain(|message| {
                if expired.len() < limit && message.is_expired_at(now) {
                    expired.push(message.clone());
                    false
                } else {
                    true
                }
            });
        }

        expired
    }

    /// Snapshot of the consumers, ordered by id.
    pub fn consumers(&self) -> Vec<Arc<Consumer>> {
        let mut consumers: Vec<Arc<Consumer>> = self.consumers.pin().values().cloned().collect();
        consumers.sort_by_key(|c| c.id());
        consumers
    }

    pub async fn add_consumer(self: &Arc<Self>, consumer: Consumer) -> Result<Arc<Consumer>> {
        let _membership = self.membership.lock().await;
        self.ensure_alive()?;

        if consumer.queue() != self.name() {
            return Err(Error::validation(format!(
                "consumer for queue {} cannot attach to queue {}",
                consumer.queue(),
                self.name()
            )));
        }

        let consumer = Arc::new(consumer);
        let first = {
            let consumers = self.consumers.pin();
            if consumer.is_exclusive() && !consumers.is_empty() {
                return Err(Error::validation(format!(
                    "queue {} already has consumers; exclusive access denied",
                    self.name()
                )));
            }
            if consumers.values().any(|c| c.is_exclusive()) {
                return Err(Error::validation(format!(
                    "queue {} has an exclusive consumer",
                    self.name()
                )));
            }

            let first = consumers.is_empty();
            consumers.insert(consumer.id(), Arc::clone(&consumer));
            first
        };

        if first {
            self.scheduler.register(self);
        }

        tracing::debug!(queue = self.name(), consumer = consumer.id(), "consumer added");
        self.emit(QueueEvent::ConsumerAdded {
            consumer: consumer.id(),
        });
        Ok(consumer)
    }

    /// Removes a consumer. Returns `true` when the queue is auto-delete and just
    /// lost its last consumer; deleting it is left to the caller.
    pub async fn remove_consumer(&self, id: u64) -> Result<bool> {
        let _membership = self.membership.lock().await;

        let (removed, last) = {
            let consumers = self.consumers.pin();
            let removed = consumers.remove(&id).cloned();
            (removed, consumers.is_empty())
        };

        let Some(consumer) = removed else {
            return Err(Error::not_found(format!(
                "consumer {id} on queue {}",
                self.name()
            )));
        };

        if last {
            self.scheduler.deregister(self.name());
        }

        tracing::debug!(queue = self.name(), consumer = consumer.id(), "consumer removed");
        self.emit(QueueEvent::ConsumerRemoved {
            consumer: consumer.id(),
        });
        Ok(last && self.queue.is_auto_delete())
    }

    /// Marks the handler deleted, detaches every consumer and releases the
    /// buffered copies. Storage cleanup is the caller's.
    pub(crate) async fn close(&self) -> usize {
        let _membership = self.membership.lock().await;
        if self.deleted.swap(true, Ordering::AcqRel) {
            return 0;
        }

        self.consumers.pin().clear();
        self.scheduler.deregister(self.name());
        self.scheduler.deregister_expiry(self.name());

        let mut dropped: Vec<Message> = lock(&self.redelivery).drain(..).collect();
        dropped.extend(lock(&self.messages).drain(..));
        for message in &dropped {
            message.release();
        }
        for (_, staged) in lock(&self.staged).drain() {
            for message in staged.enqueues {
                message.release();
            }
        }

        self.emit(QueueEvent::Deleted);
        dropped.len()
    }

    /// Runs one delivery round: walks the consumers round-robin, handing each
    /// ready one the next message, until `batch_size` attempts were made, the
    /// queue is empty or no consumer is ready.
    pub async fn deliver_batch(&self, batch_size: usize) -> RunState {
        let consumers = self.consumers();
        if consumers.is_empty() {
            return RunState::Idle;
        }

        let mut cycle = ConsumerCycle::new(consumers, self.cursor.load(Ordering::Relaxed));
        let mut delivered = 0;

        for _ in 0..batch_size {
            let Some((index, consumer)) = cycle.next_ready() else {
                break;
            };
            let Some(message) = self.take_for_delivery().await else {
                break;
            };
            cycle.advance_past(index);

            match consumer.deliver(message.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!(
                        queue = self.name(),
                        consumer = consumer.id(),
                        "delivery failed, requeueing message: {e}"
                    );
                    if let Err(e) = self.requeue(message.clone()) {
                        tracing::warn!(
                            queue = self.name(),
                            message = message.id(),
                            "dropping undeliverable message: {e}"
                        );
                        message.release();
                    }
                }
            }
        }

        self.cursor.store(cycle.position(), Ordering::Relaxed);

        if delivered > 0 {
            RunState::Active
        } else {
            RunState::Idle
        }
    }

    /// Stages a copy of `message` for transaction `xid`. The copy is invisible
    /// until [`QueueHandler::commit`].
    pub fn prepare_for_enqueue(&self, xid: &Xid, message: &Message) -> Result<Message> {
        self.ensure_alive()?;
        self.ensure_capacity()?;

        let copy = message.shallow_copy_for(self.name());
        lock(&self.staged)
            .entry(xid.clone())
            .or_default()
            .enqueues
            .push(copy.clone());
        Ok(copy)
    }

    /// Stages the acknowledgement of a delivered copy for transaction `xid`.
    pub fn prepare_for_detach(&self, xid: &Xid, message: &Message) -> Result<()> {
        self.ensure_owned(message)?;

        lock(&self.staged)
            .entry(xid.clone())
            .or_default()
            .detaches
            .push(message.clone());
        Ok(())
    }

    /// Rebuilds, for a branch recovered from storage, the staged removal of a
    /// message that reload left out of this queue. Returns the copy to stage.
    pub(crate) fn restore_detach(&self, xid: &Xid, message: &Message) -> Message {
        let copy = message.shallow_copy_for(self.name());

        let mut staged = lock(&self.staged);
        let staged = staged.entry(xid.clone()).or_default();
        staged.detaches.push(copy.clone());
        staged.recovered.push(copy.clone());
        copy
    }

    /// Makes the copies staged by `xid` deliverable.
    pub fn commit(&self, xid: &Xid) {
        let Some(staged) = lock(&self.staged).remove(xid) else {
            return;
        };

        if self.is_deleted() {
            for message in &staged.enqueues {
                message.release();
            }
            return;
        }

        lock(&self.messages).extend(staged.enqueues);
    }

    /// Forgets the work staged by `xid`. Staged acknowledgements are dropped, so
    /// the delivered copies stay unacknowledged; recovered copies go back into the
    /// buffer.
    pub fn rollback(&self, xid: &Xid) {
        let Some(staged) = lock(&self.staged).remove(xid) else {
            return;
        };

        for message in &staged.enqueues {
            message.release();
        }

        if self.is_deleted() {
            for message in &staged.recovered {
                message.release();
            }
        } else {
            lock(&self.messages).extend(staged.recovered);
        }
    }

    pub fn staged_transactions(&self) -> usize {
        lock(&self.staged).len()
    }
}

/// Round-robin walk over a consumer snapshot.
struct ConsumerCycle {
    consumers: Vec<Arc<Consumer>>,
    position: usize,
}

impl ConsumerCycle {
    fn new(consumers: Vec<Arc<Consumer>>, start: usize) -> Self {
        let position = start % consumers.len().max(1);
        Self {
            consumers,
            position,
        }
    }

    /// The first ready consumer from the current position, with its index. Gives
    /// up after one full lap in which every consumer was skipped. The position only
    /// moves through [`ConsumerCycle::advance_past`].
    fn next_ready(&self) -> Option<(usize, Arc<Consumer>)> {
        let len = self.consumers.len();
        (0..len)
            .map(|step| (self.position + step) % len)
            .find(|&index| self.consumers[index].is_ready())
            .map(|index| (index, Arc::clone(&self.consumers[index])))
    }

    /// Moves past the consumer at `index` once it was handed a message.
    fn advance_past(&mut self, index: usize) {
        self.position = (index + 1) % self.consumers.len().max(1);
    }

    fn position(&self) -> usize {
        self.position
    }
}
