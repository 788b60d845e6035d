mod backend;
mod memory;
mod pipeline;
mod records;

use std::sync::Arc;

use bytes::Bytes;

pub use backend::{StorageBackend, StoredMessage};
pub use memory::{MemoryBackend, StorageCall};
pub use pipeline::{EventKind, Pipeline, SlotState};
pub use records::{BindingRecord, ExchangeRecord, QueueRecord};

use crate::{
    config::Config,
    error::{Error, Result},
    message::Message,
    transaction::{TransactionData, Xid},
};

pub struct DurableStore {
    pipeline: Pipeline,
    backend: Arc<dyn StorageBackend>,
}

/// The broker's view of persistence.
///
/// Message writes go through the asynchronous [`Pipeline`]; topology and
/// transaction writes are rare and call the backend directly. The `Null` variant
/// keeps nothing and is used in in-memory mode.
#[derive(Clone)]
pub enum MessageStore {
    Durable(Arc<DurableStore>),
    Null,
}

impl MessageStore {
    /// Starts a pipeline over `backend`. Must be called from within a tokio runtime.
    pub fn durable(backend: Arc<dyn StorageBackend>, config: &Config) -> Self {
        let pipeline = Pipeline::start(
            Arc::clone(&backend),
            config.pipeline_capacity(),
            config.max_batch_size(),
        );

        Self::Durable(Arc::new(DurableStore { pipeline, backend }))
    }

    pub fn is_durable(&self) -> bool {
        matches!(self, Self::Durable(_))
    }

    pub async fn add_message(&self, message: &Message) -> Result<()> {
        match self {
            Self::Durable(store) => store.pipeline.insert(message.clone()).await,
            Self::Null => Ok(()),
        }
    }

    /// Removes the association between `message` and the queue owning the copy.
    pub async fn detach_message(&self, message: &Message) -> Result<()> {
        match self {
            Self::Durable(store) => store.pipeline.detach(message.clone()).await,
            Self::Null => Ok(()),
        }
    }

    pub async fn delete_message(&self, message: &Message) -> Result<()> {
        match self {
            Self::Durable(store) => store.pipeline.delete(message.clone()).await,
            Self::Null => Ok(()),
        }
    }

    pub async fn read_content(&self, message: &Message) -> Result<Vec<Bytes>> {
        match self {
            Self::Durable(store) => store.pipeline.read(message.clone()).await,
            Self::Null => Err(Error::not_found(format!(
                "content of message {}",
                message.id()
            ))),
        }
    }

    pub async fn flush(&self) -> Result<()> {
        match self {
            Self::Durable(store) => store.pipeline.flush().await,
            Self::Null => Ok(()),
        }
    }

    pub async fn close(&self) {
        if let Self::Durable(store) = self {
            store.pipeline.close().await;
        }
    }

    pub async fn retrieve_messages(&self, queue: &str) -> Result<Vec<StoredMessage>> {
        match self {
            Self::Durable(store) => Ok(store.backend.retrieve_messages(queue).await?),
            Self::Null => Ok(Vec::new()),
        }
    }

    pub async fn store_queue(&self, queue: &QueueRecord) -> Result<()> {
        match self {
            Self::Durable(store) => Ok(store.backend.store_queue(queue).await?),
            Self::Null => Ok(()),
        }
    }

    pub async fn delete_queue(&self, name: &str) -> Result<()> {
        match self {
            Self::Durable(store) => {
                // Pending writes for the queue's messages must land before the queue goes.
                store.pipeline.flush().await?;
                Ok(store.backend.delete_queue(name).await?)
            }
            Self::Null => Ok(()),
        }
    }

    pub async fn retrieve_queues(&self) -> Result<Vec<QueueRecord>> {
        match self {
            Self::Durable(store) => Ok(store.backend.retrieve_queues().await?),
            Self::Null => Ok(Vec::new()),
        }
    }

    pub async fn store_exchange(&self, exchange: &ExchangeRecord) -> Result<()> {
        match self {
            Self::Durable(store) => Ok(store.backend.store_exchange(exchange).await?),
            Self::Null => Ok(()),
        }
    }

    pub async fn delete_exchange(&self, name: &str) -> Result<()> {
        match self {
            Self::Durable(store) => Ok(store.backend.delete_exchange(name).await?),
            Self::Null => Ok(()),
        }
    }

    pub async fn retrieve_exchanges(&self) -> Result<Vec<ExchangeRecord>> {
        match self {
            Self::Durable(store) => Ok(store.backend.retrieve_exchanges().await?),
            Self::Null => Ok(Vec::new()),
        }
    }

    pub async fn store_binding(&self, binding: &BindingRecord) -> Result<()> {
        match self {
            Self::Durable(store) => Ok(store.backend.store_binding(binding).await?),
            Self::Null => Ok(()),
        }
    }

    pub async fn delete_binding(&self, binding: &BindingRecord) -> Result<()> {
        match self {
            Self::Durable(store) => Ok(store.backend.delete_binding(binding).await?),
            Self::Null => Ok(()),
        }
    }

    pub async fn retrieve_bindings(&self) -> Result<Vec<BindingRecord>> {
        match self {
            Self::Durable(store) => Ok(store.backend.retrieve_bindings().await?),
            Self::Null => Ok(Vec::new()),
        }
    }

    /// Applies a local transaction. Earlier pipeline writes are flushed first so
    /// the transaction never overtakes them.
    pub async fn commit_transaction(&self, data: &TransactionData) -> Result<()> {
        match self {
            Self::Durable(store) => {
                store.pipeline.flush().await?;
                Ok(store.backend.commit_transaction(data).await?)
            }
            Self::Null => Ok(()),
        }
    }

    pub async fn prepare(&self, xid: &Xid, data: &TransactionData) -> Result<()> {
        match self {
            Self::Durable(store) => {
                store.pipeline.flush().await?;
                Ok(store.backend.prepare(xid, data).await?)
            }
            Self::Null => Ok(()),
        }
    }

    pub async fn commit_prepared(&self, xid: &Xid) -> Result<()> {
        match self {
            Self::Durable(store) => Ok(store.backend.commit_prepared(xid).await?),
            Self::Null => Ok(()),
        }
    }

    pub async fn rollback_prepared(&self, xid: &Xid) -> Result<()> {
        match self {
            Self::Durable(store) => Ok(store.backend.rollback_prepared(xid).await?),
            Self::Null => Ok(()),
        }
    }

    pub async fn stored_xids(&self) -> Result<Vec<Xid>> {
        match self {
            Self::Durable(store) => Ok(store.backend.stored_xids().await?),
            Self::Null => Ok(Vec::new()),
        }
    }

    pub async fn enqueued_messages(&self, xid: &Xid) -> Result<Vec<StoredMessage>> {
        match self {
            Self::Durable(store) => Ok(store.backend.enqueued_messages(xid).await?),
            Self::Null => Ok(Vec::new()),
        }
    }

    pub async fn dequeued_messages(&self, xid: &Xid) -> Result<Vec<StoredMessage>> {
        match self {
            Self::Durable(store) => Ok(store.backend.dequeued_messages(xid).await?),
            Self::Null => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Metadata;

    #[tokio::test]
    async fn test_null_store_accepts_everything() {
        let store = MessageStore::Null;
        let message = Message::new(Metadata::builder().build(), vec![]).shallow_copy_for("q");

        assert!(!store.is_durable());
        store.add_message(&message).await.unwrap();
        store.delete_message(&message).await.unwrap();
        store.flush().await.unwrap();
        assert!(store.retrieve_queues().await.unwrap().is_empty());
        assert!(store.read_content(&message).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_durable_store_flushes_before_transactions() {
        let backend = MemoryBackend::new();
        let store = MessageStore::durable(Arc::new(backend.clone()), &Config::default());

        let message = Message::new(
            Metadata::builder().persistent(true).build(),
            vec![Bytes::from_static(b"x")],
        )
        .shallow_copy_for("q");
        store.add_message(&message).await.unwrap();
        store
            .commit_transaction(&TransactionData::default())
            .await
            .unwrap();

        let calls = backend.calls();
        assert_eq!(calls[0], StorageCall::StoreMessages(vec![message.id()]));
        assert_eq!(calls[1], StorageCall::CommitTransaction(vec![]));

        store.close().await;
    }
}
