//! Asynchronous persistence pipeline.
//!
//! Store operations are written into a fixed ring of reusable [`EventSlot`]s and
//! flow through three stages, each a tokio task fed by a channel of slot sequence
//! numbers:
//!
//! 1. **matcher**: keeps a sliding window of recent message ids. A delete cancels
//!    the not yet persisted inserts and detaches of the same id, so a message that
//!    is consumed quickly never reaches storage.
//! 2. **access**: groups surviving events by type and issues one bulk backend call
//!    per type per batch.
//! 3. **final**: answers read waiters and hands the slot back to the ring.
//!
//! Every stage claims a slot with a guarded state transition before touching it.
//! The matcher is the only writer of the window; producers only ever write slots
//! they were handed by the ring.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{
        atomic::{AtomicU64, AtomicU8, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use bytes::Bytes;
use tokio::{
    sync::{mpsc, oneshot, Semaphore},
    task::JoinHandle,
};

use crate::{
    error::{Error, Result},
    message::Message,
    store::StorageBackend,
};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Available = 0,
    Processing = 1,
    Processed = 2,
    Persist = 3,
}

impl SlotState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Processing,
            2 => Self::Processed,
            3 => Self::Persist,
            _ => Self::Available,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Insert,
    Delete,
    Detach,
    Read,
    /// Barrier resolved once every earlier event has been finalized.
    Flush,
}

enum Reply {
    Read(oneshot::Sender<Result<Vec<Bytes>>>),
    Flush(oneshot::Sender<()>),
}

#[derive(Default)]
struct EventData {
    kind: Option<EventKind>,
    message: Option<Message>,
    content: Option<Vec<Bytes>>,
    error: Option<eyre::Report>,
    reply: Option<Reply>,
}

impl EventData {
    /// Turns the event into a no-op while keeping any waiter attached.
    fn cancel(&mut self) {
        self.kind = None;
        self.message = None;
    }
}

pub struct EventSlot {
    state: AtomicU8,
    sequence: AtomicU64,
    data: Mutex<EventData>,
}

impl EventSlot {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(SlotState::Available as u8),
            sequence: AtomicU64::new(u64::MAX),
            data: Mutex::new(EventData::default()),
        }
    }

    pub fn state(&self) -> SlotState {
        SlotState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: SlotState, to: SlotState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn set_state(&self, state: SlotState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn lock(&self) -> MutexGuard<'_, EventData> {
        self.data
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct Ring {
    slots: Box<[EventSlot]>,
    free: Semaphore,
    failures: AtomicU64,
}

impl Ring {
    fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| EventSlot::new()).collect(),
            free: Semaphore::new(capacity),
            failures: AtomicU64::new(0),
        }
    }

    fn slot(&self, sequence: u64) -> &EventSlot {
        &self.slots[(sequence % self.slots.len() as u64) as usize]
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn release(&self, sequence: u64) {
        self.slot(sequence).set_state(SlotState::Available);
        self.free.add_permits(1);
    }
}

struct Producer {
    next: u64,
    tx: mpsc::Sender<u64>,
}

#[derive(Default)]
struct Tracked {
    inserts: Vec<u64>,
    detaches: Vec<u64>,
}

/// The matcher stage's view of recently seen message ids.
struct MatchWindow {
    capacity: usize,
    order: VecDeque<u64>,
    tracked: HashMap<u64, Tracked>,
}

impl MatchWindow {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            tracked: HashMap::with_capacity(capacity),
        }
    }

    fn track(&mut self, id: u64) -> &mut Tracked {
        if !self.tracked.contains_key(&id) {
            if self.order.len() == self.capacity {
                if let Some(evicted) = self.order.pop_front() {
                    self.tracked.remove(&evicted);
                }
            }
            self.order.push_back(id);
        }
        self.tracked.entry(id).or_default()
    }

    fn process(&mut self, ring: &Ring, sequence: u64) {
        let slot = ring.slot(sequence);
        if !slot.transition(SlotState::Available, SlotState::Processing) {
            tracing::warn!(sequence, state = ?slot.state(), "matcher could not claim slot");
            return;
        }

        let (kind, id) = {
            let data = slot.lock();
            (data.kind, data.message.as_ref().map(Message::id))
        };

        if let (Some(kind), Some(id)) = (kind, id) {
            match kind {
                EventKind::Insert => self.track(id).inserts.push(sequence),
                EventKind::Detach => self.track(id).detaches.push(sequence),
                EventKind::Delete => {
                    let tracked = std::mem::take(self.track(id));

                    let mut insert_cancelled = !tracked.inserts.is_empty();
                    for insert in tracked.inserts {
                        insert_cancelled &= cancel(ring, insert);
                    }
                    for detach in tracked.detaches {
                        cancel(ring, detach);
                    }

                    if insert_cancelled {
                        slot.lock().cancel();
                        tracing::trace!(id, "insert cancelled by delete before persisting");
                    }
                }
                EventKind::Read | EventKind::Flush => {}
            }
        }

        slot.set_state(SlotState::Processed);
    }
}

/// Cancels a matched but not yet persisted event. Fails if the access stage has
/// already claimed the slot or the slot has been reused.
fn cancel(ring: &Ring, sequence: u64) -> bool {
    let slot = ring.slot(sequence);
    if !slot.transition(SlotState::Processed, SlotState::Processing) {
        return false;
    }

    let current = slot.sequence.load(Ordering::Acquire) == sequence;
    if current {
        slot.lock().cancel();
    }
    slot.set_state(SlotState::Processed);

    current
}

async fn run_matcher(ring: Arc<Ring>, mut rx: mpsc::Receiver<u64>, tx: mpsc::Sender<u64>) {
    let mut window = MatchWindow::new(ring.capacity());
    let mut batch = Vec::with_capacity(ring.capacity());

    while let Some(sequence) = rx.recv().await {
        batch.push(sequence);
        while batch.len() < ring.capacity() {
            match rx.try_recv() {
                Ok(sequence) => batch.push(sequence),
                Err(_) => break,
            }
        }

        for &sequence in &batch {
            window.process(&ring, sequence);
        }

        for sequence in batch.drain(..) {
            if tx.send(sequence).await.is_err() {
                return;
            }
        }
    }

    tracing::debug!("persistence matcher stage stopped");
}

/// Waits out a concurrent cancellation and claims the slot for persisting.
async fn claim(slot: &EventSlot) -> bool {
    loop {
        if slot.transition(SlotState::Processed, SlotState::Persist) {
            return true;
        }
        if slot.state() != SlotState::Processing {
            return false;
        }
        tokio::task::yield_now().await;
    }
}

fn attach_error(ring: &Ring, sequences: &[u64], error: &eyre::Report) {
    for &sequence in sequences {
        ring.slot(sequence).lock().error = Some(eyre::eyre!("{error:#}"));
    }
}

#[derive(Default)]
struct Batch {
    inserts: Vec<(u64, Message)>,
    deletes: Vec<(u64, u64)>,
    detaches: Vec<(u64, String, u64)>,
    reads: Vec<(u64, u64)>,
}

async fn persist_batch(ring: &Ring, backend: &dyn StorageBackend, sequences: &[u64]) {
    let mut batch = Batch::default();

    for &sequence in sequences {
        let slot = ring.slot(sequence);
        if !claim(slot).await {
            continue;
        }

        let data = slot.lock();
        let (Some(kind), Some(message)) = (data.kind, data.message.as_ref()) else {
            continue;
        };

        match kind {
            EventKind::Insert => batch.inserts.push((sequence, message.clone())),
            EventKind::Delete => batch.deletes.push((sequence, message.id())),
            EventKind::Detach => {
                if let Some(queue) = message.queue() {
                    batch
                        .detaches
                        .push((sequence, queue.to_owned(), message.id()));
                }
            }
            EventKind::Read => batch.reads.push((sequence, message.id())),
            EventKind::Flush => {}
        }
    }

    if !batch.inserts.is_empty() {
        let (sequences, messages): (Vec<u64>, Vec<Message>) = batch.inserts.into_iter().unzip();
        if let Err(e) = backend.store_messages(&messages).await {
            tracing::error!(count = messages.len(), "failed to persist messages: {e:#}");
            attach_error(ring, &sequences, &e);
        }
    }

    if !batch.detaches.is_empty() {
        let mut by_queue: BTreeMap<String, Vec<u64>> = BTreeMap::new();
        let mut sequences = Vec::with_capacity(batch.detaches.len());
        for (sequence, queue, id) in batch.detaches {
            by_queue.entry(queue).or_default().push(id);
            sequences.push(sequence);
        }
        if let Err(e) = backend.detach_from_queues(&by_queue).await {
            tracing::error!(count = sequences.len(), "failed to detach messages: {e:#}");
            attach_error(ring, &sequences, &e);
        }
    }

    if !batch.deletes.is_empty() {
        let (sequences, mut ids): (Vec<u64>, Vec<u64>) = batch.deletes.into_iter().unzip();
        ids.sort_unstable();
        ids.dedup();
        if let Err(e) = backend.delete_messages(&ids).await {
            tracing::error!(count = ids.len(), "failed to delete messages: {e:#}");
            attach_error(ring, &sequences, &e);
        }
    }

    if !batch.reads.is_empty() {
        let mut ids: Vec<u64> = batch.reads.iter().map(|(_, id)| *id).collect();
        ids.sort_unstable();
        ids.dedup();
        match backend.read_content(&ids).await {
            Ok(contents) => {
                for (sequence, id) in batch.reads {
                    let mut data = ring.slot(sequence).lock();
                    match contents.get(&id) {
                        Some(content) => data.content = Some(content.clone()),
                        None => {
                            data.error = Some(eyre::eyre!("content of message {id} not found"))
                        }
                    }
                }
            }
            Err(e) => {
                let sequences: Vec<u64> = batch.reads.iter().map(|(s, _)| *s).collect();
                attach_error(ring, &sequences, &e);
            }
        }
    }
}

async fn run_access(
    ring: Arc<Ring>,
    backend: Arc<dyn StorageBackend>,
    max_batch_size: usize,
    mut rx: mpsc::Receiver<u64>,
    tx: mpsc::Sender<u64>,
) {
    let mut batch = Vec::with_capacity(max_batch_size);

    while let Some(sequence) = rx.recv().await {
        batch.push(sequence);
        while batch.len() < max_batch_size {
            match rx.try_recv() {
                Ok(sequence) => batch.push(sequence),
                Err(_) => break,
            }
        }

        persist_batch(&ring, backend.as_ref(), &batch).await;

        for sequence in batch.drain(..) {
            if tx.send(sequence).await.is_err() {
                return;
            }
        }
    }

    tracing::debug!("persistence access stage stopped");
}

async fn run_final(ring: Arc<Ring>, mut rx: mpsc::Receiver<u64>) {
    while let Some(sequence) = rx.recv().await {
        let data = std::mem::take(&mut *ring.slot(sequence).lock());

        if data.error.is_some() {
            ring.failures.fetch_add(1, Ordering::Relaxed);
        }

        match data.reply {
            Some(Reply::Read(waiter)) => {
                let result = match (data.content, data.error) {
                    (Some(content), _) => Ok(content),
                    (None, Some(source)) => Err(Error::Storage { source }),
                    (None, None) => Err(Error::opaque("read event was dropped")),
                };
                let _ = waiter.send(result);
            }
            Some(Reply::Flush(waiter)) => {
                let _ = waiter.send(());
            }
            None => {}
        }

        ring.release(sequence);
    }

    tracing::debug!("persistence final stage stopped");
}

/// Handle to a running pipeline.
pub struct Pipeline {
    ring: Arc<Ring>,
    producer: tokio::sync::Mutex<Option<Producer>>,
    stages: Mutex<Vec<JoinHandle<()>>>,
}

impl Pipeline {
    /// Spawns the three stages. Must be called from within a tokio runtime.
    pub fn start(backend: Arc<dyn StorageBackend>, capacity: usize, max_batch_size: usize) -> Self {
        let ring = Arc::new(Ring::new(capacity));

        let (producer_tx, matcher_rx) = mpsc::channel(capacity);
        let (matcher_tx, access_rx) = mpsc::channel(capacity);
        let (access_tx, final_rx) = mpsc::channel(capacity);

        let stages = vec![
            tokio::spawn(run_matcher(Arc::clone(&ring), matcher_rx, matcher_tx)),
            tokio::spawn(run_access(
                Arc::clone(&ring),
                backend,
                max_batch_size,
                access_rx,
                access_tx,
            )),
            tokio::spawn(run_final(Arc::clone(&ring), final_rx)),
        ];

        tracing::debug!(capacity, max_batch_size, "persistence pipeline started");

        Self {
            ring,
            producer: tokio::sync::Mutex::new(Some(Producer {
                next: 0,
                tx: producer_tx,
            })),
            stages: Mutex::new(stages),
        }
    }

    async fn publish(&self, kind: EventKind, message: Option<Message>, reply: Option<Reply>) -> Result<()> {
        // Waiting for a free slot is the pipeline's only backpressure.
        let permit = self
            .ring
            .free
            .acquire()
            .await
            .map_err(|_| Error::ShuttingDown)?;

        let mut guard = self.producer.lock().await;
        let Some(producer) = guard.as_mut() else {
            return Err(Error::ShuttingDown);
        };
        permit.forget();

        let sequence = producer.next;
        producer.next += 1;

        let slot = self.ring.slot(sequence);
        *slot.lock() = EventData {
            kind: Some(kind),
            message,
            reply,
            ..Default::default()
        };
        slot.sequence.store(sequence, Ordering::Release);

        if producer.tx.send(sequence).await.is_err() {
            *slot.lock() = EventData::default();
            self.ring.release(sequence);
            return Err(Error::ShuttingDown);
        }

        Ok(())
    }

    pub async fn insert(&self, message: Message) -> Result<()> {
        self.publish(EventKind::Insert, Some(message), None).await
    }

    pub async fn delete(&self, message: Message) -> Result<()> {
        self.publish(EventKind::Delete, Some(message), None).await
    }

    pub async fn detach(&self, message: Message) -> Result<()> {
        self.publish(EventKind::Detach, Some(message), None).await
    }

    pub async fn read(&self, message: Message) -> Result<Vec<Bytes>> {
        let (tx, rx) = oneshot::channel();
        self.publish(EventKind::Read, Some(message), Some(Reply::Read(tx)))
            .await?;
        rx.await.map_err(|_| Error::ShuttingDown)?
    }

    /// Resolves once every event published before the call has been finalized.
    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.publish(EventKind::Flush, None, Some(Reply::Flush(tx)))
            .await?;
        rx.await.map_err(|_| Error::ShuttingDown)
    }

    pub fn failures(&self) -> u64 {
        self.ring.failures.load(Ordering::Relaxed)
    }

    /// Stops accepting events and drains the stages.
    pub async fn close(&self) {
        if self.producer.lock().await.take().is_none() {
            return;
        }
        self.ring.free.close();

        let stages = std::mem::take(
            &mut *self
                .stages
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for stage in stages {
            if let Err(e) = stage.await {
                tracing::error!("persistence stage panicked: {e}");
            }
        }

        let failures = self.failures();
        if failures > 0 {
            tracing::warn!(failures, "persistence pipeline closed with failed events");
        } else {
            tracing::debug!("persistence pipeline closed");
        }
    }
}
