//! In-process [`StorageBackend`] that keeps everything in maps.
//!
//! Used when no external store is configured and by the test suite, which also
//! reads back the log of calls the broker made.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{Arc, Mutex, MutexGuard},
};

use bytes::Bytes;
use futures_util::{future::BoxFuture, FutureExt};

use crate::{
    message::{Message, Metadata},
    store::{BindingRecord, ExchangeRecord, QueueRecord, StorageBackend, StoredMessage},
    transaction::{TransactionData, Xid},
};

/// One call made against the backend, as recorded for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageCall {
    StoreMessages(Vec<u64>),
    DeleteMessages(Vec<u64>),
    DetachFromQueues(BTreeMap<String, Vec<u64>>),
    ReadContent(Vec<u64>),
    StoreQueue(String),
    DeleteQueue(String),
    StoreExchange(String),
    DeleteExchange(String),
    StoreBinding(BindingRecord),
    DeleteBinding(BindingRecord),
    CommitTransaction(Vec<u64>),
    Prepare(Xid),
    CommitPrepared(Xid),
    RollbackPrepared(Xid),
}

impl StorageCall {
    /// Narrows a message call down to `id`, or `None` if the call never touched it.
    fn project(&self, id: u64) -> Option<StorageCall> {
        let only = |ids: &Vec<u64>| ids.contains(&id).then(|| vec![id]);

        match self {
            Self::StoreMessages(ids) => only(ids).map(Self::StoreMessages),
            Self::DeleteMessages(ids) => only(ids).map(Self::DeleteMessages),
            Self::ReadContent(ids) => only(ids).map(Self::ReadContent),
            Self::CommitTransaction(ids) => only(ids).map(Self::CommitTransaction),
            Self::DetachFromQueues(detaches) => {
                let narrowed: BTreeMap<String, Vec<u64>> = detaches
                    .iter()
                    .filter(|(_, ids)| ids.contains(&id))
                    .map(|(queue, _)| (queue.clone(), vec![id]))
                    .collect();
                (!narrowed.is_empty()).then_some(Self::DetachFromQueues(narrowed))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct StoredEntry {
    metadata: Metadata,
    content: Vec<Bytes>,
    queues: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct PreparedBranch {
    enqueues: BTreeMap<u64, StoredEntry>,
    dequeues: BTreeMap<String, Vec<u64>>,
}

#[derive(Debug, Default)]
struct State {
    messages: BTreeMap<u64, StoredEntry>,
    queues: BTreeMap<String, QueueRecord>,
    exchanges: BTreeMap<String, ExchangeRecord>,
    bindings: Vec<BindingRecord>,
    prepared: HashMap<Xid, PreparedBranch>,
    calls: Vec<StorageCall>,
    failing: bool,
}

impl State {
    fn check(&self) -> eyre::Result<()> {
        if self.failing {
            eyre::bail!("memory backend configured to fail writes");
        }
        Ok(())
    }

    fn insert(&mut self, messages: &[Message]) {
        for message in messages {
            let entry = self
                .messages
                .entry(message.id())
                .or_insert_with(|| StoredEntry {
                    metadata: message.metadata().clone(),
                    content: message.content().map(<[Bytes]>::to_vec).unwrap_or_default(),
                    queues: BTreeSet::new(),
                });
            if let Some(queue) = message.queue() {
                entry.queues.insert(queue.to_owned());
            }
        }
    }

    fn detach(&mut self, detaches: &BTreeMap<String, Vec<u64>>) {
        for (queue, ids) in detaches {
            for id in ids {
                if let Some(entry) = self.messages.get_mut(id) {
                    entry.queues.remove(queue);
                }
            }
        }
    }

    fn delete(&mut self, ids: &[u64]) {
        for id in ids {
            self.messages.remove(id);
        }
    }

    /// `(queue, id)` pairs held back by prepared branches.
    fn prepared_dequeues(&self) -> BTreeSet<(&str, u64)> {
        self.prepared
            .values()
            .flat_map(|branch| branch.dequeues.iter())
            .flat_map(|(queue, ids)| ids.iter().map(move |id| (queue.as_str(), *id)))
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<State>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Makes every subsequent write fail until reset.
    pub fn set_failing(&self, failing: bool) {
        self.lock().failing = failing;
    }

    pub fn calls(&self) -> Vec<StorageCall> {
        self.lock().calls.clone()
    }

    /// The message calls that touched `id`, narrowed to that id.
    pub fn calls_for(&self, id: u64) -> Vec<StorageCall> {
        self.lock()
            .calls
            .iter()
            .filter_map(|call| call.project(id))
            .collect()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn contains_message(&self, id: u64) -> bool {
        self.lock().messages.contains_key(&id)
    }

    pub fn message_queues(&self, id: u64) -> Vec<String> {
        self.lock()
            .messages
            .get(&id)
            .map(|entry| entry.queues.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn message_count(&self) -> usize {
        self.lock().messages.len()
    }
}

impl StorageBackend for MemoryBackend {
    fn store_messages<'a>(&'a self, messages: &'a [Message]) -> BoxFuture<'a, eyre::Result<()>> {
        async move {
            let mut state = self.lock();
            state
                .calls
                .push(StorageCall::StoreMessages(messages.iter().map(Message::id).collect()));
            state.check()?;
            state.insert(messages);
            Ok(())
        }
        .boxed()
    }

    fn delete_messages<'a>(&'a self, ids: &'a [u64]) -> BoxFuture<'a, eyre::Result<()>> {
        async move {
            let mut state = self.lock();
            state.calls.push(StorageCall::DeleteMessages(ids.to_vec()));
            state.check()?;
            state.delete(ids);
            Ok(())
        }
        .boxed()
    }

    fn detach_from_queues<'a>(
        &'a self,
        detaches: &'a BTreeMap<String, Vec<u64>>,
    ) -> BoxFuture<'a, eyre::Result<()>> {
        async move {
            let mut state = self.lock();
            state.calls.push(StorageCall::DetachFromQueues(detaches.clone()));
            state.check()?;
            state.detach(detaches);
            Ok(())
        }
        .boxed()
    }

    fn read_content<'a>(
        &'a self,
        ids: &'a [u64],
    ) -> BoxFuture<'a, eyre::Result<HashMap<u64, Vec<Bytes>>>> {
        async move {
            let mut state = self.lock();
            state.calls.push(StorageCall::ReadContent(ids.to_vec()));

            Ok(ids
                .iter()
                .filter_map(|id| {
                    let entry = state.messages.get(id)?;
                    Some((*id, entry.content.clone()))
                })
                .collect())
        }
        .boxed()
    }

    fn retrieve_messages<'a>(
        &'a self,
        queue: &'a str,
    ) -> BoxFuture<'a, eyre::Result<Vec<StoredMessage>>> {
        async move {
            let state = self.lock();
            let held = state.prepared_dequeues();

            Ok(state
                .messages
                .iter()
                .filter(|(id, entry)| entry.queues.contains(queue) && !held.contains(&(queue, **id)))
                .map(|(id, entry)| StoredMessage {
                    id: *id,
                    metadata: entry.metadata.clone(),
                    content: None,
                    queues: vec![queue.to_owned()],
                })
                .collect())
        }
        .boxed()
    }

    fn store_queue<'a>(&'a self, queue: &'a QueueRecord) -> BoxFuture<'a, eyre::Result<()>> {
        async move {
            let mut state = self.lock();
            state.calls.push(StorageCall::StoreQueue(queue.name.clone()));
            state.check()?;
            state.queues.insert(queue.name.clone(), queue.clone());
            Ok(())
        }
        .boxed()
    }

    fn delete_queue<'a>(&'a self, name: &'a str) -> BoxFuture<'a, eyre::Result<()>> {
        async move {
            let mut state = self.lock();
            state.calls.push(StorageCall::DeleteQueue(name.to_owned()));
            state.check()?;
            state.queues.remove(name);
            state.bindings.retain(|b| b.queue != name);
            for entry in state.messages.values_mut() {
                entry.queues.remove(name);
            }
            state.messages.retain(|_, entry| !entry.queues.is_empty());
            Ok(())
        }
        .boxed()
    }

    fn retrieve_queues(&self) -> BoxFuture<'_, eyre::Result<Vec<QueueRecord>>> {
        async move { Ok(self.lock().queues.values().cloned().collect()) }.boxed()
    }

    fn store_exchange<'a>(
        &'a self,
        exchange: &'a ExchangeRecord,
    ) -> BoxFuture<'a, eyre::Result<()>> {
        async move {
            let mut state = self.lock();
            state.calls.push(StorageCall::StoreExchange(exchange.name.clone()));
            state.check()?;
            state.exchanges.insert(exchange.name.clone(), exchange.clone());
            Ok(())
        }
        .boxed()
    }

    fn delete_exchange<'a>(&'a self, name: &'a str) -> BoxFuture<'a, eyre::Result<()>> {
        async move {
            let mut state = self.lock();
            state.calls.push(StorageCall::DeleteExchange(name.to_owned()));
            state.check()?;
            state.exchanges.remove(name);
            state.bindings.retain(|b| b.exchange != name);
            Ok(())
        }
        .boxed()
    }

    fn retrieve_exchanges(&self) -> BoxFuture<'_, eyre::Result<Vec<ExchangeRecord>>> {
        async move { Ok(self.lock().exchanges.values().cloned().collect()) }.boxed()
    }

    fn store_binding<'a>(
        &'a self,
        binding: &'a BindingRecord,
    ) -> BoxFuture<'a, eyre::Result<()>> {
        async move {
            let mut state = self.lock();
            state.calls.push(StorageCall::StoreBinding(binding.clone()));
            state.check()?;
            if !state.bindings.contains(binding) {
                state.bindings.push(binding.clone());
            }
            Ok(())
        }
        .boxed()
    }

    fn delete_binding<'a>(
        &'a self,
        binding: &'a BindingRecord,
    ) -> BoxFuture<'a, eyre::Result<()>> {
        async move {
            let mut state = self.lock();
            state.calls.push(StorageCall::DeleteBinding(binding.clone()));
            state.check()?;
            state.bindings.retain(|b| {
                !(b.exchange == binding.exchange
                    && b.queue == binding.queue
                    && b.pattern == binding.pattern)
            });
            Ok(())
        }
        .boxed()
    }

    fn retrieve_bindings(&self) -> BoxFuture<'_, eyre::Result<Vec<BindingRecord>>> {
        async move { Ok(self.lock().bindings.clone()) }.boxed()
    }

    fn commit_transaction<'a>(
        &'a self,
        data: &'a TransactionData,
    ) -> BoxFuture<'a, eyre::Result<()>> {
        async move {
            let mut state = self.lock();

            let mut touched: Vec<u64> = data.enqueues().iter().map(Message::id).collect();
            touched.extend(data.detaches().values().flatten().copied());
            touched.extend(data.deletes().iter().copied());
            touched.sort_unstable();
            touched.dedup();
            state.calls.push(StorageCall::CommitTransaction(touched));

            state.check()?;
            state.insert(data.enqueues());
            state.detach(data.detaches());
            state.delete(data.deletes());
            Ok(())
        }
        .boxed()
    }

    fn prepare<'a>(
        &'a self,
        xid: &'a Xid,
        data: &'a TransactionData,
    ) -> BoxFuture<'a, eyre::Result<()>> {
        async move {
            let mut state = self.lock();
            state.calls.push(StorageCall::Prepare(xid.clone()));
            state.check()?;

            if state.prepared.contains_key(xid) {
                eyre::bail!("transaction {xid} is already prepared");
            }

            let mut branch = PreparedBranch {
                dequeues: data.dequeues(),
                ..Default::default()
            };
            for message in data.enqueues() {
                let entry = branch
                    .enqueues
                    .entry(message.id())
                    .or_insert_with(|| StoredEntry {
                        metadata: message.metadata().clone(),
                        content: message.content().map(<[Bytes]>::to_vec).unwrap_or_default(),
                        queues: BTreeSet::new(),
                    });
                if let Some(queue) = message.queue() {
                    entry.queues.insert(queue.to_owned());
                }
            }

            state.prepared.insert(xid.clone(), branch);
            Ok(())
        }
        .boxed()
    }

    fn commit_prepared<'a>(&'a self, xid: &'a Xid) -> BoxFuture<'a, eyre::Result<()>> {
        async move {
            let mut state = self.lock();
            state.calls.push(StorageCall::CommitPrepared(xid.clone()));
            state.check()?;

            let Some(branch) = state.prepared.remove(xid) else {
                eyre::bail!("no prepared transaction {xid}");
            };

            for (id, enqueued) in branch.enqueues {
                let entry = state.messages.entry(id).or_insert_with(|| StoredEntry {
                    queues: BTreeSet::new(),
                    ..enqueued.clone()
                });
                entry.queues.extend(enqueued.queues);
            }

            state.detach(&branch.dequeues);
            let orphaned: Vec<u64> = branch
                .dequeues
                .values()
                .flatten()
                .copied()
                .filter(|id| {
                    state
                        .messages
                        .get(id)
                        .is_some_and(|entry| entry.queues.is_empty())
                })
                .collect();
            state.delete(&orphaned);

            Ok(())
        }
        .boxed()
    }

    fn rollback_prepared<'a>(&'a self, xid: &'a Xid) -> BoxFuture<'a, eyre::Result<()>> {
        async move {
            let mut state = self.lock();
            state.calls.push(StorageCall::RollbackPrepared(xid.clone()));
            state.check()?;
            state.prepared.remove(xid);
            Ok(())
        }
        .boxed()
    }

    fn stored_xids(&self) -> BoxFuture<'_, eyre::Result<Vec<Xid>>> {
        async move {
            let mut xids: Vec<Xid> = self.lock().prepared.keys().cloned().collect();
            xids.sort();
            Ok(xids)
        }
        .boxed()
    }

    fn enqueued_messages<'a>(
        &'a self,
        xid: &'a Xid,
    ) -> BoxFuture<'a, eyre::Result<Vec<StoredMessage>>> {
        async move {
            let state = self.lock();
            let branch = state
                .prepared
                .get(xid)
                .ok_or_else(|| eyre::eyre!("no prepared transaction {xid}"))?;

            Ok(branch
                .enqueues
                .iter()
                .map(|(id, entry)| StoredMessage {
                    id: *id,
                    metadata: entry.metadata.clone(),
                    content: Some(entry.content.clone()),
                    queues: entry.queues.iter().cloned().collect(),
                })
                .collect())
        }
        .boxed()
    }

    fn dequeued_messages<'a>(
        &'a self,
        xid: &'a Xid,
    ) -> BoxFuture<'a, eyre::Result<Vec<StoredMessage>>> {
        async move {
            let state = self.lock();
            let branch = state
                .prepared
                .get(xid)
                .ok_or_else(|| eyre::eyre!("no prepared transaction {xid}"))?;

            let mut queues: BTreeMap<u64, Vec<String>> = BTreeMap::new();
            for (queue, ids) in &branch.dequeues {
                for id in ids {
                    queues.entry(*id).or_default().push(queue.clone());
                }
            }

            Ok(queues
                .into_iter()
                .filter_map(|(id, queues)| {
                    state.messages.get(&id).map(|entry| StoredMessage {
                        id,
                        metadata: entry.metadata.clone(),
                        content: None,
                        queues,
                    })
                })
                .collect())
        }
        .boxed()
    }
}
