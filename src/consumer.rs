use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use tokio::sync::mpsc::{self, error::TrySendError};

use crate::{
    error::{Error, Result},
    message::Message,
};

static NEXT_CONSUMER_ID: AtomicU64 = AtomicU64::new(1);

/// Where a consumer's messages go. Implemented by the protocol layer; the core
/// ships a channel-backed sink.
pub trait MessageSink: Send + Sync {
    /// Whether the sink can take a message right now (credit, prefetch, flow).
    fn is_ready(&self) -> bool;

    fn deliver(&self, message: Message) -> Result<()>;
}

pub struct Consumer {
    id: u64,
    queue: String,
    exclusive: bool,
    sink: Box<dyn MessageSink>,
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("id", &self.id)
            .field("queue", &self.queue)
            .field("exclusive", &self.exclusive)
            .finish()
    }
}

impl PartialEq for Consumer {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Consumer {}

impl Consumer {
    pub fn new(queue: impl Into<String>, exclusive: bool, sink: impl MessageSink + 'static) -> Self {
        Self {
            id: NEXT_CONSUMER_ID.fetch_add(1, Ordering::Relaxed),
            queue: queue.into(),
            exclusive,
            sink: Box::new(sink),
        }
    }

    /// A consumer feeding a bounded channel. It reports ready while the channel has
    /// room for another `prefetch`-limited message.
    pub fn channel(
        queue: impl Into<String>,
        exclusive: bool,
        prefetch: usize,
    ) -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(prefetch.max(1));
        (Self::new(queue, exclusive, ChannelSink { tx }), rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn is_ready(&self) -> bool {
        self.sink.is_ready()
    }

    pub fn deliver(&self, message: Message) -> Result<()> {
        self.sink.deliver(message)
    }
}

struct ChannelSink {
    tx: mpsc::Sender<Message>,
}

impl MessageSink for ChannelSink {
    fn is_ready(&self) -> bool {
        !self.tx.is_closed() && self.tx.capacity() > 0
    }

    fn deliver(&self, message: Message) -> Result<()> {
        self.tx.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => Error::opaque("consumer channel is full"),
            TrySendError::Closed(_) => Error::opaque("consumer channel is closed"),
        })
    }
}
