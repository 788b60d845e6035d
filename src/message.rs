//! Messages and their routing metadata.
//!
//! A [`Message`] is a cheap handle: the metadata and content chunks live behind an
//! `Arc` and are shared by every copy made while fanning a publish out to several
//! queues. Each copy belongs to at most one queue, and the set of queues still
//! holding a copy acts as the message's reference count. Once that set is empty the
//! message can be deleted from the store and its buffers are dropped with the last
//! handle.

use std::{
    collections::BTreeSet,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, OnceLock,
    },
};

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};

/// Header recording the queue a dead-lettered message was taken from.
pub const ORIGIN_QUEUE_HEADER: &str = "x-origin-queue";
/// Header recording the exchange a dead-lettered message was first published to.
pub const ORIGIN_EXCHANGE_HEADER: &str = "x-origin-exchange";
/// Header recording the routing key a dead-lettered message was first published with.
pub const ORIGIN_ROUTING_KEY_HEADER: &str = "x-origin-routing-key";

static NEXT_MESSAGE_ID: AtomicU64 = AtomicU64::new(1);

fn next_message_id() -> u64 {
    NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Ordered header table with unique keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `key`, replacing an existing value in place so the original order is kept.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();

        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some((_, v)) => *v = value,
            None => self.0.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let position = self.0.iter().position(|(k, _)| k == key)?;
        Some(self.0.remove(position).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for Headers
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut headers = Headers::new();
        for (k, v) in iter {
            headers.insert(k, v);
        }
        headers
    }
}

/// Routing metadata attached to a published message.
#[derive(Debug, Clone, bon::Builder)]
pub struct Metadata {
    #[builder(into, default)]
    routing_key: String,
    #[builder(into, default)]
    exchange: String,
    #[builder(default)]
    content_length: usize,
    #[builder(default)]
    headers: Headers,
    expiration: Option<DateTime<Utc>>,
    /// Persistent messages are written to the store when they land on a durable queue.
    #[builder(default)]
    persistent: bool,
}

impl Metadata {
    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn content_length(&self) -> usize {
        self.content_length
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn expiration(&self) -> Option<DateTime<Utc>> {
        self.expiration
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }
}

struct MessageCore {
    id: u64,
    metadata: Metadata,
    content: OnceLock<Vec<Bytes>>,
    owners: Mutex<BTreeSet<String>>,
}

/// A message handle. Cloning a handle does not create a new queue copy; use
/// [`Message::shallow_copy_for`] for that.
#[derive(Clone)]
pub struct Message {
    core: Arc<MessageCore>,
    queue: Option<Arc<str>>,
    redelivered: bool,
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.core.id)
            .field("queue", &self.queue)
            .field("routing_key", &self.core.metadata.routing_key)
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

impl Message {
    pub fn new(mut metadata: Metadata, content: Vec<Bytes>) -> Self {
        metadata.content_length = content.iter().map(Bytes::len).sum();

        Self::with_id(next_message_id(), metadata, Some(content))
    }

    /// Rebuilds a message read back from the storage backend. The content may be
    /// left unloaded and fetched lazily on delivery.
    pub fn from_stored(id: u64, metadata: Metadata, content: Option<Vec<Bytes>>) -> Self {
        NEXT_MESSAGE_ID.fetch_max(id + 1, Ordering::Relaxed);

        Self::with_id(id, metadata, content)
    }

    fn with_id(id: u64, metadata: Metadata, content: Option<Vec<Bytes>>) -> Self {
        let cell = OnceLock::new();
        if let Some(content) = content {
            let _ = cell.set(content);
        }

        Self {
            core: Arc::new(MessageCore {
                id,
                metadata,
                content: cell,
                owners: Mutex::new(BTreeSet::new()),
            }),
            queue: None,
            redelivered: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.core.id
    }

    pub fn metadata(&self) -> &Metadata {
        &self.core.metadata
    }

    pub fn routing_key(&self) -> &str {
        &self.core.metadata.routing_key
    }

    pub fn exchange(&self) -> &str {
        &self.core.metadata.exchange
    }

    pub fn is_persistent(&self) -> bool {
        self.core.metadata.persistent
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.core
            .metadata
            .expiration
            .is_some_and(|expiration| expiration <= now)
    }

    /// Content chunks, or `None` while the body still lives only in the store.
    pub fn content(&self) -> Option<&[Bytes]> {
        self.core.content.get().map(Vec::as_slice)
    }

    pub fn is_content_loaded(&self) -> bool {
        self.core.content.get().is_some()
    }

    /// The whole body as one contiguous buffer.
    pub fn body(&self) -> Option<Bytes> {
        let chunks = self.content()?;
        match chunks {
            [single] => Some(single.clone()),
            chunks => {
                let mut body = BytesMut::with_capacity(self.core.metadata.content_length);
                for chunk in chunks {
                    body.extend_from_slice(chunk);
                }
                Some(body.freeze())
            }
        }
    }

    pub(crate) fn load_content(&self, content: Vec<Bytes>) {
        let _ = self.core.content.set(content);
    }

    /// The queue owning this copy, if any.
    pub fn queue(&self) -> Option<&str> {
        self.queue.as_deref()
    }

    pub fn is_redelivered(&self) -> bool {
        self.redelivered
    }

    pub(crate) fn mark_redelivered(&mut self) {
        self.redelivered = true;
    }

    /// Creates the copy held by `queue`, registering the queue as an owner.
    /// The payload is shared, not duplicated.
    pub fn shallow_copy_for(&self, queue: &str) -> Message {
        self.lock_owners().insert(queue.to_owned());

        Message {
            core: Arc::clone(&self.core),
            queue: Some(Arc::from(queue)),
            redelivered: false,
        }
    }

    /// Drops this copy's ownership. Returns `true` when no queue owns the message
    /// any more.
    pub(crate) fn release(&self) -> bool {
        let mut owners = self.lock_owners();
        if let Some(queue) = &self.queue {
            owners.remove(queue.as_ref());
        }
        owners.is_empty()
    }

    /// Undoes [`Message::release`] after a failed storage write.
    pub(crate) fn reattach(&self) {
        if let Some(queue) = &self.queue {
            self.lock_owners().insert(queue.to_string());
        }
    }

    pub fn owning_queues(&self) -> Vec<String> {
        self.lock_owners().iter().cloned().collect()
    }

    /// Builds a fresh message for the dead-letter exchange, annotated with where
    /// this copy came from. Content chunks are shared with the original.
    pub fn dead_letter_copy(&self, exchange: &str, routing_key: &str) -> Message {
        let original = &self.core.metadata;

        let mut headers = original.headers.clone();
        if let Some(queue) = self.queue() {
            headers.insert(ORIGIN_QUEUE_HEADER, queue);
        }
        headers.insert(ORIGIN_EXCHANGE_HEADER, original.exchange.as_str());
        headers.insert(ORIGIN_ROUTING_KEY_HEADER, original.routing_key.as_str());

        let metadata = Metadata {
            routing_key: routing_key.to_owned(),
            exchange: exchange.to_owned(),
            content_length: original.content_length,
            headers,
            expiration: None,
            persistent: original.persistent,
        };

        Self::with_id(next_message_id(), metadata, self.core.content.get().cloned())
    }

    fn lock_owners(&self) -> std::sync::MutexGuard<'_, BTreeSet<String>> {
        // Owner bookkeeping never panics while locked, so a poisoned lock still holds
        // a consistent set.
        self.core
            .owners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
