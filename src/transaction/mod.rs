//! Local and distributed transactions.
//!
//! A [`Branch`] stages enqueues and acknowledgements in the queue handlers it
//! touches and in a [`TransactionData`] buffer. Nothing becomes visible until
//! commit, which first writes to the store and only then releases the staged copies
//! in the handlers. Local transactions are a branch committed in one phase.

mod data;
mod xid;

use std::{collections::BTreeMap, sync::Arc};

pub use data::TransactionData;
pub use xid::{Xid, LOCAL_FORMAT_ID};

use crate::{
    broker::Broker,
    error::{Error, Result},
    message::Message,
    queue::QueueHandler,
    store::MessageStore,
};

/// Callback run once a transaction's outcome is final.
pub trait TransactionAction: Send + Sync {
    fn post_commit(&self);
    fn on_rollback(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum BranchState {
    Active,
    Prepared,
    /// A commit failed; the only way out is rollback.
    RollbackOnly,
}

pub struct Branch {
    xid: Xid,
    state: BranchState,
    data: TransactionData,
    participants: BTreeMap<String, Arc<QueueHandler>>,
    actions: Vec<Box<dyn TransactionAction>>,
}

impl Branch {
    pub fn new(xid: Xid) -> Self {
        Self {
            xid,
            state: BranchState::Active,
            data: TransactionData::new(),
            participants: BTreeMap::new(),
            actions: Vec::new(),
        }
    }

    /// A branch found prepared in storage during activation.
    pub(crate) fn recovered(xid: Xid) -> Self {
        Self {
            state: BranchState::Prepared,
            ..Self::new(xid)
        }
    }

    pub fn xid(&self) -> &Xid {
        &self.xid
    }

    pub fn state(&self) -> BranchState {
        self.state
    }

    pub fn add_action(&mut self, action: impl TransactionAction + 'static) {
        self.actions.push(Box::new(action));
    }

    fn ensure_active(&self) -> Result<()> {
        if self.state != BranchState::Active {
            return Err(Error::validation(format!(
                "transaction {} is {} and no longer accepts work",
                self.xid, self.state
            )));
        }
        Ok(())
    }

    fn join(&mut self, handler: &Arc<QueueHandler>) {
        self.participants
            .entry(handler.name().to_owned())
            .or_insert_with(|| Arc::clone(handler));
    }

    pub fn enqueue(&mut self, handler: &Arc<QueueHandler>, message: &Message) -> Result<()> {
        self.ensure_active()?;
        self.stage_enqueue(handler, message)
    }

    pub(crate) fn stage_enqueue(
        &mut self,
        handler: &Arc<QueueHandler>,
        message: &Message,
    ) -> Result<()> {
        let copy = handler.prepare_for_enqueue(&self.xid, message)?;
        self.data.stage_enqueue(copy, handler.is_durable());
        self.join(handler);
        Ok(())
    }

    /// Re-stages the removal of a stored message from `handler` for a branch
    /// recovered after restart. Rolling back returns the message to the queue.
    pub(crate) fn restore_dequeue(&mut self, handler: &Arc<QueueHandler>, message: &Message) {
        let copy = handler.restore_detach(&self.xid, message);
        self.data.stage_dequeue(copy, handler.is_durable());
        self.join(handler);
    }

    /// Stages the acknowledgement of `message`, a copy delivered from `handler`.
    pub fn dequeue(&mut self, handler: &Arc<QueueHandler>, message: Message) -> Result<()> {
        self.ensure_active()?;
        handler.prepare_for_detach(&self.xid, &message)?;
        self.data.stage_dequeue(message, handler.is_durable());
        self.join(handler);
        Ok(())
    }

    pub async fn prepare(&mut self, store: &MessageStore) -> Result<()> {
        self.ensure_active()?;

        if let Err(e) = store.prepare(&self.xid, &self.data).await {
            self.state = BranchState::RollbackOnly;
            return Err(e);
        }

        self.state = BranchState::Prepared;
        tracing::debug!(xid = %self.xid, "transaction prepared");
        Ok(())
    }

    pub async fn commit(&mut self, store: &MessageStore, one_phase: bool) -> Result<()> {
        let prepared = match self.state {
            BranchState::Prepared => true,
            BranchState::Active if one_phase => false,
            BranchState::Active => {
                return Err(Error::validation(format!(
                    "transaction {} must be prepared before a two-phase commit",
                    self.xid
                )))
            }
            BranchState::RollbackOnly => {
                return Err(Error::validation(format!(
                    "transaction {} is marked rollback-only",
                    self.xid
                )))
            }
        };

        self.data.settle();
        let result = if prepared {
            store.commit_prepared(&self.xid).await
        } else {
            store.commit_transaction(&self.data).await
        };

        if let Err(e) = result {
            self.data.restore();
            if !prepared {
                self.state = BranchState::RollbackOnly;
            }
            tracing::warn!(xid = %self.xid, "transaction commit failed: {e}");
            return Err(e);
        }

        for handler in self.participants.values() {
            handler.commit(&self.xid);
        }
        self.finish();

        for action in std::mem::take(&mut self.actions) {
            action.post_commit();
        }

        tracing::debug!(xid = %self.xid, "transaction committed");
        Ok(())
    }

    pub async fn rollback(&mut self, store: &MessageStore) -> Result<()> {
        if self.state == BranchState::Prepared {
            store.rollback_prepared(&self.xid).await?;
        }

        for handler in self.participants.values() {
            handler.rollback(&self.xid);
        }
        self.finish();

        for action in std::mem::take(&mut self.actions) {
            action.on_rollback();
        }

        tracing::debug!(xid = %self.xid, "transaction rolled back");
        Ok(())
    }

    /// Releases staged work in the handlers without touching the store. Only
    /// valid for branches that were never prepared.
    fn discard(&mut self) {
        for handler in self.participants.values() {
            handler.rollback(&self.xid);
        }
        self.finish();
    }

    fn finish(&mut self) {
        self.data.clear();
        self.participants.clear();
        self.state = BranchState::Active;
    }
}

/// A transaction scoped to one session. Work is staged until [`commit`] or
/// [`rollback`]. Dropping it discards whatever is still staged.
///
/// [`commit`]: LocalTransaction::commit
/// [`rollback`]: LocalTransaction::rollback
pub struct LocalTransaction {
    broker: Broker,
    branch: Branch,
}

impl LocalTransaction {
    pub(crate) fn new(broker: Broker) -> Self {
        Self {
            broker,
            branch: Branch::new(Xid::local()),
        }
    }

    pub fn xid(&self) -> &Xid {
        self.branch.xid()
    }

    /// Routes `message` and stages a copy on every target queue. Returns the
    /// number of queues the message will reach on commit.
    pub async fn enqueue(&mut self, message: Message) -> Result<usize> {
        let targets = self.broker.route(&message).await?;
        for handler in &targets {
            self.branch.enqueue(handler, &message)?;
        }
        Ok(targets.len())
    }

    pub async fn dequeue(&mut self, queue: &str, message: Message) -> Result<()> {
        let handler = self.broker.handler(queue).await?;
        self.branch.dequeue(&handler, message)
    }

    pub fn add_action(&mut self, action: impl TransactionAction + 'static) {
        self.branch.add_action(action);
    }

    /// Commits everything staged so far. The transaction stays usable afterwards.
    pub async fn commit(&mut self) -> Result<()> {
        self.branch.commit(self.broker.store(), true).await
    }

    pub async fn rollback(&mut self) -> Result<()> {
        self.branch.rollback(self.broker.store()).await
    }
}

impl Drop for LocalTransaction {
    fn drop(&mut self) {
        if !self.branch.participants.is_empty() {
            tracing::debug!(xid = %self.branch.xid, "discarding unfinished local transaction");
            self.branch.discard();
        }
    }
}

/// Registry of open distributed transaction branches.
#[derive(Default)]
pub struct DistributedTransactions {
    branches: papaya::HashMap<Xid, Arc<tokio::sync::Mutex<Branch>>>,
}

impl DistributedTransactions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self, xid: Xid) -> Result<()> {
        let branch = Arc::new(tokio::sync::Mutex::new(Branch::new(xid.clone())));
        if self.branches.pin().try_insert(xid.clone(), branch).is_err() {
            return Err(Error::validation(format!("transaction {xid} already exists")));
        }
        Ok(())
    }

    pub(crate) fn restore(&self, branch: Branch) {
        let xid = branch.xid().clone();
        self.branches
            .pin()
            .insert(xid, Arc::new(tokio::sync::Mutex::new(branch)));
    }

    pub fn get(&self, xid: &Xid) -> Result<Arc<tokio::sync::Mutex<Branch>>> {
        self.branches
            .pin()
            .get(xid)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("transaction {xid}")))
    }

    pub fn remove(&self, xid: &Xid) {
        self.branches.pin().remove(xid);
    }

    pub fn xids(&self) -> Vec<Xid> {
        let mut xids: Vec<Xid> = self.branches.pin().keys().cloned().collect();
        xids.sort();
        xids
    }

    pub fn clear(&self) {
        self.branches.pin().clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use bytes::Bytes;

    use super::*;
    use crate::{
        config::Config,
        delivery::DeliveryScheduler,
        message::Metadata,
        queue::Queue,
        store::{MemoryBackend, StorageCall},
    };

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<&'static str>>>);

    struct Record(Recorder, &'static str);

    impl TransactionAction for Record {
        fn post_commit(&self) {
            self.0 .0.lock().unwrap().push(self.1);
        }

        fn on_rollback(&self) {
            self.0 .0.lock().unwrap().push("rollback");
        }
    }

    fn handler(store: &MessageStore, name: &str) -> Arc<QueueHandler> {
        QueueHandler::new(
            Queue::builder().name(name).durable(true).build(),
            store.clone(),
            DeliveryScheduler::new(&Config::default()),
            None,
        )
    }

    fn persistent() -> Message {
        Message::new(
            Metadata::builder().persistent(true).build(),
            vec![Bytes::from_static(b"x")],
        )
    }

    #[tokio::test]
    async fn test_commit_makes_enqueues_visible_and_runs_actions_in_order() {
        let backend = MemoryBackend::new();
        let store = MessageStore::durable(Arc::new(backend.clone()), &Config::default());
        let queue = handler(&store, "q1");
        let recorder = Recorder::default();

        let message = persistent();
        let mut branch = Branch::new(Xid::local());
        branch.enqueue(&queue, &message).unwrap();
        branch.add_action(Record(recorder.clone(), "first"));
        branch.add_action(Record(recorder.clone(), "second"));

        assert_eq!(queue.message_count(), 0);
        assert!(!backend.contains_message(message.id()));

        branch.commit(&store, true).await.unwrap();

        assert_eq!(queue.message_count(), 1);
        assert!(backend.contains_message(message.id()));
        assert_eq!(*recorder.0.lock().unwrap(), vec!["first", "second"]);
        store.close().await;
    }

    #[tokio::test]
    async fn test_rollback_discards_everything() {
        let backend = MemoryBackend::new();
        let store = MessageStore::durable(Arc::new(backend.clone()), &Config::default());
        let queue = handler(&store, "q1");
        let recorder = Recorder::default();

        let message = persistent();
        let mut branch = Branch::new(Xid::local());
        branch.enqueue(&queue, &message).unwrap();
        branch.add_action(Record(recorder.clone(), "commit"));
        branch.rollback(&store).await.unwrap();

        assert_eq!(queue.message_count(), 0);
        assert!(message.owning_queues().is_empty());
        assert!(backend.calls_for(message.id()).is_empty());
        assert_eq!(*recorder.0.lock().unwrap(), vec!["rollback"]);
        store.close().await;
    }

    #[tokio::test]
    async fn test_failed_commit_restores_ownership() {
        let backend = MemoryBackend::new();
        let store = MessageStore::durable(Arc::new(backend.clone()), &Config::default());
        let queue = handler(&store, "q1");

        queue.enqueue(&persistent()).await.unwrap();
        let delivered = queue.take_for_delivery().await.unwrap();

        backend.set_failing(true);
        let mut branch = Branch::new(Xid::local());
        branch.dequeue(&queue, delivered.clone()).unwrap();
        assert!(branch.commit(&store, true).await.is_err());
        assert_eq!(branch.state(), BranchState::RollbackOnly);
        assert_eq!(delivered.owning_queues(), vec!["q1".to_owned()]);

        backend.set_failing(false);
        branch.rollback(&store).await.unwrap();
        store.close().await;
    }

    #[tokio::test]
    async fn test_two_phase_commit_requires_prepare() {
        let backend = MemoryBackend::new();
        let store = MessageStore::durable(Arc::new(backend.clone()), &Config::default());
        let queue = handler(&store, "q1");

        let xid = Xid::new(1, b"gtrid".to_vec(), b"b1".to_vec());
        let mut branch = Branch::new(xid.clone());
        branch.enqueue(&queue, &persistent()).unwrap();

        assert!(branch.commit(&store, false).await.unwrap_err().is_validation());

        branch.prepare(&store).await.unwrap();
        assert_eq!(branch.state(), BranchState::Prepared);
        assert!(branch.enqueue(&queue, &persistent()).unwrap_err().is_validation());

        branch.commit(&store, false).await.unwrap();
        assert_eq!(queue.message_count(), 1);
        assert!(backend
            .calls()
            .ends_with(&[StorageCall::Prepare(xid.clone()), StorageCall::CommitPrepared(xid)]));
        store.close().await;
    }

    #[tokio::test]
    async fn test_registry() {
        let registry = DistributedTransactions::new();
        let xid = Xid::new(1, b"g".to_vec(), b"b".to_vec());

        registry.begin(xid.clone()).unwrap();
        assert!(registry.begin(xid.clone()).unwrap_err().is_validation());
        assert!(registry.get(&xid).is_ok());

        registry.remove(&xid);
        assert!(matches!(registry.get(&xid), Err(e) if e.is_not_found()));
    }
}
