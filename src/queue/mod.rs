//! Queues and their runtime handlers.

mod handler;

use std::sync::{Arc, OnceLock, Weak};

pub use handler::QueueHandler;

use crate::{
    error::{Error, Result},
    store::QueueRecord,
};

/// Name of the dead-letter channel queue created with every broker.
pub const DEAD_LETTER_QUEUE: &str = "DeadLetterChannel";

/// A queue declaration.
#[derive(Debug, bon::Builder)]
pub struct Queue {
    #[builder(into)]
    name: String,
    #[builder(default)]
    durable: bool,
    /// Deleted once its last consumer is removed.
    #[builder(default)]
    auto_delete: bool,
    /// Maximum number of undelivered messages. Unbounded when absent.
    capacity: Option<usize>,
    /// Move expired messages to the dead-letter exchange instead of dropping them.
    #[builder(default)]
    dead_letter_expired: bool,
    #[builder(skip)]
    handler: OnceLock<Weak<QueueHandler>>,
}

impl Queue {
    pub fn from_record(record: &QueueRecord) -> Self {
        Self::builder()
            .name(record.name.clone())
            .durable(record.durable)
            .auto_delete(record.auto_delete)
            .maybe_capacity(record.capacity)
            .dead_letter_expired(record.dead_letter_expired)
            .build()
    }

    pub fn record(&self) -> QueueRecord {
        QueueRecord {
            name: self.name.clone(),
            durable: self.durable,
            auto_delete: self.auto_delete,
            capacity: self.capacity,
            dead_letter_expired: self.dead_letter_expired,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn is_auto_delete(&self) -> bool {
        self.auto_delete
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    pub fn dead_letters_expired(&self) -> bool {
        self.dead_letter_expired
    }

    /// The handler wrapping this queue, while it is alive.
    pub fn handler(&self) -> Option<Arc<QueueHandler>> {
        self.handler.get().and_then(Weak::upgrade)
    }

    pub(crate) fn attach_handler(&self, handler: Weak<QueueHandler>) -> Result<()> {
        self.handler
            .set(handler)
            .map_err(|_| Error::opaque(format!("queue {} already has a handler", self.name)))
    }
}

/// Lifecycle notifications emitted by a [`QueueHandler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    ConsumerAdded { consumer: u64 },
    ConsumerRemoved { consumer: u64 },
    Purged { count: usize },
    Deleted,
}

pub trait QueueListener: Send + Sync {
    fn on_event(&self, queue: &str, event: &QueueEvent);
}
