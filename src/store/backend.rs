//! The storage contract the broker core consumes.
//!
//! The core never talks SQL or files; it hands batches to a [`StorageBackend`] and
//! relies on the ordering guarantees of the persistence pipeline. Message calls are
//! bulk calls, issued at most once per event type per pipeline batch.

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use futures_util::future::BoxFuture;

use crate::{
    message::{Message, Metadata},
    store::{BindingRecord, ExchangeRecord, QueueRecord},
    transaction::{TransactionData, Xid},
};

/// A message as read back from storage.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: u64,
    pub metadata: Metadata,
    /// `None` when the backend only returned metadata; the body is read on demand.
    pub content: Option<Vec<Bytes>>,
    pub queues: Vec<String>,
}

impl StoredMessage {
    pub fn into_message(self) -> Message {
        Message::from_stored(self.id, self.metadata, self.content)
    }
}

pub trait StorageBackend: Send + Sync + 'static {
    /// Persists messages, associating each with the queue of its copy. Inserting
    /// an id that already exists only adds the queue association.
    fn store_messages<'a>(&'a self, messages: &'a [Message]) -> BoxFuture<'a, eyre::Result<()>>;

    /// Removes messages and every queue association they still have.
    fn delete_messages<'a>(&'a self, ids: &'a [u64]) -> BoxFuture<'a, eyre::Result<()>>;

    /// Removes queue associations, keyed by queue name.
    fn detach_from_queues<'a>(
        &'a self,
        detaches: &'a BTreeMap<String, Vec<u64>>,
    ) -> BoxFuture<'a, eyre::Result<()>>;

    fn read_content<'a>(
        &'a self,
        ids: &'a [u64],
    ) -> BoxFuture<'a, eyre::Result<HashMap<u64, Vec<Bytes>>>>;

    /// Messages still associated with `queue`, oldest first, excluding messages
    /// whose removal from the queue is part of a prepared transaction.
    fn retrieve_messages<'a>(
        &'a self,
        queue: &'a str,
    ) -> BoxFuture<'a, eyre::Result<Vec<StoredMessage>>>;

    fn store_queue<'a>(&'a self, queue: &'a QueueRecord) -> BoxFuture<'a, eyre::Result<()>>;
    fn delete_queue<'a>(&'a self, name: &'a str) -> BoxFuture<'a, eyre::Result<()>>;
    fn retrieve_queues(&self) -> BoxFuture<'_, eyre::Result<Vec<QueueRecord>>>;

    fn store_exchange<'a>(
        &'a self,
        exchange: &'a ExchangeRecord,
    ) -> BoxFuture<'a, eyre::Result<()>>;
    fn delete_exchange<'a>(&'a self, name: &'a str) -> BoxFuture<'a, eyre::Result<()>>;
    fn retrieve_exchanges(&self) -> BoxFuture<'_, eyre::Result<Vec<ExchangeRecord>>>;

    fn store_binding<'a>(&'a self, binding: &'a BindingRecord)
        -> BoxFuture<'a, eyre::Result<()>>;
    fn delete_binding<'a>(
        &'a self,
        binding: &'a BindingRecord,
    ) -> BoxFuture<'a, eyre::Result<()>>;
    fn retrieve_bindings(&self) -> BoxFuture<'_, eyre::Result<Vec<BindingRecord>>>;

    /// Applies a local transaction atomically: enqueues, then detaches, then deletes.
    fn commit_transaction<'a>(
        &'a self,
        data: &'a TransactionData,
    ) -> BoxFuture<'a, eyre::Result<()>>;

    /// Durably records a distributed branch without making it visible.
    fn prepare<'a>(
        &'a self,
        xid: &'a Xid,
        data: &'a TransactionData,
    ) -> BoxFuture<'a, eyre::Result<()>>;

    /// Makes a prepared branch visible. Messages left without any queue are deleted.
    fn commit_prepared<'a>(&'a self, xid: &'a Xid) -> BoxFuture<'a, eyre::Result<()>>;

    fn rollback_prepared<'a>(&'a self, xid: &'a Xid) -> BoxFuture<'a, eyre::Result<()>>;

    fn stored_xids(&self) -> BoxFuture<'_, eyre::Result<Vec<Xid>>>;

    /// Messages enqueued by a prepared branch, with the queues they were routed to.
    fn enqueued_messages<'a>(
        &'a self,
        xid: &'a Xid,
    ) -> BoxFuture<'a, eyre::Result<Vec<StoredMessage>>>;

    /// Messages a prepared branch removes, with the queues they are removed from.
    /// Content is not loaded.
    fn dequeued_messages<'a>(
        &'a self,
        xid: &'a Xid,
    ) -> BoxFuture<'a, eyre::Result<Vec<StoredMessage>>>;
}
