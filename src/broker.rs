//! The routing engine.
//!
//! A [`Broker`] owns every exchange and queue handler behind one read-write lock.
//! Publishing, lookups and listings take the read side; declarations, deletions and
//! binding changes take the write side. Locks are never upgraded: work that has to
//! follow a read-side decision with a structural change (auto-delete) re-checks
//! its premise under the write lock.

use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};

use futures_util::{future::BoxFuture, FutureExt};
use itertools::Itertools;
use tokio::sync::{Mutex, RwLock};

use crate::{
    binding::Binding,
    config::Config,
    consumer::Consumer,
    delivery::{DeadLetterRouter, DeliveryScheduler},
    error::{Error, Result},
    exchange::{
        self, Exchange, ExchangeInfo, ExchangeKind, BUILTIN_EXCHANGES, DEAD_LETTER_EXCHANGE,
        DEFAULT_EXCHANGE,
    },
    filter::{FilterCompiler, HeaderSelectorCompiler, SELECTOR_ARGUMENT},
    message::{Headers, Message},
    queue::{Queue, QueueHandler, QueueListener, DEAD_LETTER_QUEUE},
    store::{BindingRecord, MessageStore, StorageBackend},
    transaction::{Branch, BranchState, DistributedTransactions, LocalTransaction, Xid},
};

#[derive(Default)]
struct Topology {
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, Arc<QueueHandler>>,
}

impl Topology {
    fn exchange(&self, name: &str) -> Result<&Exchange> {
        self.exchanges
            .get(name)
            .ok_or_else(|| Error::exchange_not_found(name))
    }

    fn exchange_mut(&mut self, name: &str) -> Result<&mut Exchange> {
        self.exchanges
            .get_mut(name)
            .ok_or_else(|| Error::exchange_not_found(name))
    }

    fn queue(&self, name: &str) -> Result<&Arc<QueueHandler>> {
        self.queues
            .get(name)
            .ok_or_else(|| Error::queue_not_found(name))
    }

    /// Handlers that should receive `message`, each at most once.
    fn route(&self, message: &Message) -> Result<Vec<Arc<QueueHandler>>> {
        let name = match message.exchange() {
            "" => DEFAULT_EXCHANGE,
            name => name,
        };
        let exchange = self.exchange(name)?;
        let bindings = exchange.bindings_for_route(message.routing_key());

        Ok(bindings
            .target_queues(message.metadata())
            .unique()
            .filter_map(|queue| match self.queues.get(queue) {
                Some(handler) => Some(Arc::clone(handler)),
                None => {
                    tracing::warn!(exchange = name, queue, "binding points at a missing queue");
                    None
                }
            })
            .collect())
    }

    /// Binds `handler` to the default exchange under its own name.
    fn bind_default(&mut self, handler: &QueueHandler) -> Result<()> {
        let name = handler.name();
        self.exchange_mut(DEFAULT_EXCHANGE)?.bind(Binding::new(
            DEFAULT_EXCHANGE,
            name,
            name,
            Headers::new(),
            None,
        ))?;
        Ok(())
    }
}

#[derive(Default)]
struct HaState {
    active: bool,
    /// Messages were loaded from storage once. Later activations keep the live
    /// buffers, which also know about delivered but unacknowledged messages.
    loaded: bool,
    /// Delivery was requested; honoured whenever the broker is active.
    delivery_requested: bool,
}

struct BrokerInner {
    topology: RwLock<Topology>,
    store: MessageStore,
    scheduler: DeliveryScheduler,
    transactions: DistributedTransactions,
    filters: Arc<dyn FilterCompiler>,
    listener: Option<Arc<dyn QueueListener>>,
    ha: Mutex<HaState>,
}

/// Handle to a broker. Cloning is cheap and every clone drives the same broker.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

#[bon::bon]
impl Broker {
    /// Builds a broker with its built-in exchanges and the dead-letter channel.
    /// Without a backend, or in in-memory mode, nothing is persisted.
    ///
    /// Must be called from within a tokio runtime.
    #[builder]
    pub fn new(
        backend: Option<Arc<dyn StorageBackend>>,
        #[builder(default)] config: Config,
        #[builder(default = Arc::new(HeaderSelectorCompiler) as Arc<dyn FilterCompiler>)] filters: Arc<dyn FilterCompiler>,
        listener: Option<Arc<dyn QueueListener>>,
    ) -> Result<Self> {
        let store = match backend {
            Some(backend) if !config.in_memory_mode() => MessageStore::durable(backend, &config),
            _ => MessageStore::Null,
        };
        let scheduler = DeliveryScheduler::new(&config);

        let mut topology = Topology::default();
        for (name, kind) in BUILTIN_EXCHANGES {
            topology
                .exchanges
                .insert(name.to_owned(), Exchange::new(name, kind));
        }

        let dead_letters = QueueHandler::new(
            Queue::builder().name(DEAD_LETTER_QUEUE).durable(true).build(),
            store.clone(),
            scheduler.clone(),
            listener.clone(),
        );
        scheduler.register_expiry(&dead_letters);
        topology.bind_default(&dead_letters)?;
        topology
            .exchange_mut(DEAD_LETTER_EXCHANGE)?
            .bind(Binding::new(
                DEAD_LETTER_EXCHANGE,
                DEAD_LETTER_QUEUE,
                DEAD_LETTER_QUEUE,
                Headers::new(),
                None,
            ))?;
        topology
            .queues
            .insert(DEAD_LETTER_QUEUE.to_owned(), dead_letters);

        let inner = Arc::new(BrokerInner {
            topology: RwLock::new(topology),
            store,
            scheduler,
            transactions: DistributedTransactions::new(),
            filters,
            listener,
            ha: Mutex::new(HaState::default()),
        });

        let router: Weak<dyn DeadLetterRouter> = Arc::downgrade(&inner) as Weak<dyn DeadLetterRouter>;
        inner.scheduler.set_dead_letter_router(router);

        Ok(Self { inner })
    }
}

impl Broker {
    pub(crate) fn store(&self) -> &MessageStore {
        &self.inner.store
    }

    /// Routes `message` through the exchange named in its metadata and enqueues a
    /// copy on every matching queue. An empty exchange name means the default
    /// exchange. A queue that refuses the copy (full) is skipped. Returns the number
    /// of queues that took the message.
    pub async fn publish(&self, message: Message) -> Result<usize> {
        self.inner.publish(&message).await
    }

    pub(crate) async fn route(&self, message: &Message) -> Result<Vec<Arc<QueueHandler>>> {
        self.inner.topology.read().await.route(message)
    }

    pub async fn handler(&self, queue: impl AsRef<str>) -> Result<Arc<QueueHandler>> {
        let topology = self.inner.topology.read().await;
        topology.queue(queue.as_ref()).cloned()
    }

    /// Checks or creates an exchange. A passive declaration only checks that the
    /// exchange exists with the same kind.
    pub async fn declare_exchange(
        &self,
        name: impl AsRef<str>,
        kind: ExchangeKind,
        passive: bool,
    ) -> Result<()> {
        let name = name.as_ref();
        if passive {
            let topology = self.inner.topology.read().await;
            return topology.exchange(name)?.ensure_kind(kind);
        }

        self.create_exchange(name, kind).await
    }

    pub async fn create_exchange(&self, name: impl AsRef<str>, kind: ExchangeKind) -> Result<()> {
        let name = name.as_ref();
        if name.is_empty() {
            return Err(Error::validation("exchange name must not be empty"));
        }

        let mut topology = self.inner.topology.write().await;
        if topology.exchanges.contains_key(name) {
            return Err(Error::validation(format!("exchange {name} already exists")));
        }

        let exchange = Exchange::new(name, kind);
        self.inner.store.store_exchange(&exchange.record()).await?;
        topology.exchanges.insert(name.to_owned(), exchange);

        tracing::debug!(exchange = name, %kind, "exchange created");
        Ok(())
    }

    /// Deletes an exchange. Built-ins are never deleted; with `if_unused` an
    /// exchange that still has bindings is kept.
    pub async fn delete_exchange(&self, name: impl AsRef<str>, if_unused: bool) -> Result<()> {
        let name = name.as_ref();
        if exchange::is_builtin(name) {
            return Err(Error::validation(format!(
                "built-in exchange {name} cannot be deleted"
            )));
        }

        let mut topology = self.inner.topology.write().await;
        let exchange = topology.exchange(name)?;
        if if_unused && exchange.has_bindings() {
            return Err(Error::validation(format!("exchange {name} is in use")));
        }

        self.inner.store.delete_exchange(name).await?;
        topology.exchanges.remove(name);

        tracing::debug!(exchange = name, "exchange deleted");
        Ok(())
    }

    /// Declares a queue and binds it to the default exchange under its name.
    pub async fn create_queue(&self, queue: Queue) -> Result<Arc<QueueHandler>> {
        let name = queue.name().to_owned();
        if name.is_empty() {
            return Err(Error::validation("queue name must not be empty"));
        }

        let mut topology = self.inner.topology.write().await;
        if topology.queues.contains_key(&name) {
            return Err(Error::validation(format!("queue {name} already exists")));
        }

        if queue.is_durable() {
            self.inner.store.store_queue(&queue.record()).await?;
        }

        let handler = self.inner.new_handler(queue);
        topology.bind_default(&handler)?;
        topology.queues.insert(name.clone(), Arc::clone(&handler));

        tracing::debug!(queue = name, durable = handler.is_durable(), "queue created");
        Ok(handler)
    }

    /// Deletes a queue, its bindings and its messages. Attached consumers are
    /// dropped first.
    pub async fn delete_queue(&self, name: impl AsRef<str>) -> Result<()> {
        let name = name.as_ref();
        if name == DEAD_LETTER_QUEUE {
            return Err(Error::validation(format!(
                "queue {DEAD_LETTER_QUEUE} cannot be deleted"
            )));
        }

        let mut topology = self.inner.topology.write().await;
        self.inner.delete_queue_locked(&mut topology, name).await
    }

    pub async fn queue_exists(&self, name: impl AsRef<str>) -> bool {
        self.inner
            .topology
            .read()
            .await
            .queues
            .contains_key(name.as_ref())
    }

    pub async fn purge_queue(&self, name: impl AsRef<str>) -> Result<usize> {
        self.handler(name).await?.purge().await
    }

    /// Binds `queue` to `exchange` under `pattern`. A `x-filter-selector`
    /// argument restricts the binding to messages whose headers satisfy the
    /// selector. Returns `false` when the same binding already existed.
    pub async fn bind(
        &self,
        exchange: impl AsRef<str>,
        queue: impl AsRef<str>,
        pattern: impl AsRef<str>,
        arguments: Headers,
    ) -> Result<bool> {
        let (exchange, queue, pattern) = (exchange.as_ref(), queue.as_ref(), pattern.as_ref());
        if exchange == DEFAULT_EXCHANGE {
            return Err(Error::validation("queues cannot be bound to the default exchange"));
        }

        let filter = arguments
            .get(SELECTOR_ARGUMENT)
            .map(|selector| self.inner.filters.compile(selector))
            .transpose()?;

        let mut topology = self.inner.topology.write().await;
        let durable = topology.queue(queue)?.is_durable();
        let target = topology.exchange_mut(exchange)?;

        let binding = Binding::new(exchange, queue, pattern, arguments, filter);
        let record = binding.record();
        if !target.bind(binding)? {
            return Ok(false);
        }

        if durable {
            if let Err(e) = self.inner.store.store_binding(&record).await {
                let _ = target.unbind(queue, pattern);
                return Err(e);
            }
        }

        tracing::debug!(exchange, queue, pattern, "queue bound");
        Ok(true)
    }

    pub async fn unbind(
        &self,
        exchange: impl AsRef<str>,
        queue: impl AsRef<str>,
        pattern: impl AsRef<str>,
    ) -> Result<()> {
        let (exchange, queue, pattern) = (exchange.as_ref(), queue.as_ref(), pattern.as_ref());
        if exchange == DEFAULT_EXCHANGE {
            return Err(Error::validation("default exchange bindings cannot be removed"));
        }

        let mut topology = self.inner.topology.write().await;
        let durable = topology.queues.get(queue).is_some_and(|q| q.is_durable());
        let binding = topology.exchange_mut(exchange)?.unbind(queue, pattern)?;

        if durable {
            self.inner.store.delete_binding(&binding.record()).await?;
        }

        tracing::debug!(exchange, queue, pattern, "queue unbound");
        Ok(())
    }

    /// Attaches a consumer to the queue it names.
    pub async fn add_consumer(&self, consumer: Consumer) -> Result<Arc<Consumer>> {
        let handler = self.handler(consumer.queue()).await?;
        handler.add_consumer(consumer).await
    }

    /// Detaches a consumer. An auto-delete queue losing its last consumer is
    /// deleted, unless a consumer attached again in the meantime.
    pub async fn remove_consumer(&self, queue: impl AsRef<str>, consumer: u64) -> Result<()> {
        let queue = queue.as_ref();
        let handler = self.handler(queue).await?;
        if !handler.remove_consumer(consumer).await? {
            return Ok(());
        }

        let mut topology = self.inner.topology.write().await;
        let unchanged = topology
            .queues
            .get(queue)
            .is_some_and(|current| Arc::ptr_eq(current, &handler));
        if unchanged && handler.consumer_count() == 0 {
            tracing::debug!(queue, "auto-deleting queue without consumers");
            self.inner.delete_queue_locked(&mut topology, queue).await?;
        }

        Ok(())
    }

    /// Acknowledges a delivered copy on the queue it came from.
    pub async fn acknowledge(&self, message: &Message) -> Result<()> {
        self.inner.owning_handler(message).await?.acknowledge(message).await
    }

    /// Hands a delivered copy back for redelivery.
    pub async fn requeue(&self, message: Message) -> Result<()> {
        self.inner.owning_handler(&message).await?.requeue(message)
    }

    /// Moves a delivered copy to the dead-letter channel. The original is only
    /// acknowledged once the dead-letter copy was accepted.
    pub async fn move_to_dlc(&self, message: &Message) -> Result<()> {
        let handler = self.inner.owning_handler(message).await?;
        self.inner.dead_letter_message(&handler, message).await
    }

    /// Every queue, ordered by name.
    pub async fn all_queues(&self) -> Vec<Arc<QueueHandler>> {
        let topology = self.inner.topology.read().await;
        topology
            .queues
            .values()
            .cloned()
            .sorted_by(|a, b| a.name().cmp(b.name()))
            .collect()
    }

    pub async fn all_exchanges(&self) -> Vec<ExchangeInfo> {
        let topology = self.inner.topology.read().await;
        topology
            .exchanges
            .values()
            .map(Exchange::info)
            .sorted_by(|a, b| a.name.cmp(&b.name))
            .collect()
    }

    pub async fn all_bindings_for_exchange(&self, name: impl AsRef<str>) -> Result<Vec<Binding>> {
        let topology = self.inner.topology.read().await;
        Ok(topology
            .exchange(name.as_ref())?
            .bindings()
            .cloned()
            .sorted_by(|a, b| (a.pattern(), a.queue()).cmp(&(b.pattern(), b.queue())))
            .collect())
    }

    /// Starts delivery now if the broker is active, otherwise once it is activated.
    pub async fn start_message_delivery(&self) {
        let mut ha = self.inner.ha.lock().await;
        ha.delivery_requested = true;

        if ha.active {
            self.inner.scheduler.start();
        } else {
            tracing::info!("broker inactive, deferring message delivery until activation");
        }
    }

    pub async fn stop_message_delivery(&self) {
        let mut ha = self.inner.ha.lock().await;
        ha.delivery_requested = false;
        self.inner.scheduler.stop().await;
    }

    pub async fn is_active(&self) -> bool {
        self.inner.ha.lock().await.active
    }

    pub fn is_delivering(&self) -> bool {
        self.inner.scheduler.is_running()
    }

    /// Reloads exchanges, queues, bindings and messages from storage, recovers
    /// prepared transactions and resumes delivery if it was requested.
    pub async fn activate(&self) -> Result<()> {
        let mut ha = self.inner.ha.lock().await;
        if ha.active {
            return Ok(());
        }

        let messages = self.inner.reload(!ha.loaded).await?;
        self.inner.recover_transactions(messages).await?;

        ha.loaded = true;
        ha.active = true;
        if ha.delivery_requested {
            self.inner.scheduler.start();
        }

        tracing::info!("broker activated");
        Ok(())
    }

    /// Stops delivery while keeping every queue and message.
    pub async fn deactivate(&self) {
        let mut ha = self.inner.ha.lock().await;
        if !ha.active {
            return;
        }

        self.inner.scheduler.stop().await;
        ha.active = false;
        tracing::info!("broker deactivated");
    }

    /// Stops delivery, then drains and closes the store.
    pub async fn shutdown(&self) {
        {
            let mut ha = self.inner.ha.lock().await;
            self.inner.scheduler.stop().await;
            ha.active = false;
            ha.delivery_requested = false;
        }

        self.inner.scheduler.clear();
        self.inner.store.close().await;
        tracing::info!("broker shut down");
    }

    /// Starts a local transaction.
    pub fn begin(&self) -> LocalTransaction {
        LocalTransaction::new(self.clone())
    }

    /// Opens a distributed transaction branch.
    pub fn branch(&self, xid: Xid) -> Result<()> {
        self.inner.transactions.begin(xid)
    }

    /// Routes `message` and stages a copy on every target queue within `xid`.
    pub async fn enqueue(&self, xid: &Xid, message: Message) -> Result<usize> {
        let branch = self.inner.transactions.get(xid)?;
        let mut branch = branch.lock().await;

        let targets = self.route(&message).await?;
        for handler in &targets {
            branch.enqueue(handler, &message)?;
        }
        Ok(targets.len())
    }

    /// Stages the acknowledgement of a delivered copy within `xid`.
    pub async fn dequeue(&self, xid: &Xid, queue: impl AsRef<str>, message: Message) -> Result<()> {
        let branch = self.inner.transactions.get(xid)?;
        let mut branch = branch.lock().await;

        let handler = self.handler(queue).await?;
        branch.dequeue(&handler, message)
    }

    pub async fn prepare(&self, xid: &Xid) -> Result<()> {
        let branch = self.inner.transactions.get(xid)?;
        let mut branch = branch.lock().await;
        branch.prepare(&self.inner.store).await
    }

    pub async fn commit(&self, xid: &Xid, one_phase: bool) -> Result<()> {
        let branch = self.inner.transactions.get(xid)?;
        let mut branch = branch.lock().await;

        branch.commit(&self.inner.store, one_phase).await?;
        self.inner.transactions.remove(xid);
        Ok(())
    }

    pub async fn rollback(&self, xid: &Xid) -> Result<()> {
        let branch = self.inner.transactions.get(xid)?;
        let mut branch = branch.lock().await;

        branch.rollback(&self.inner.store).await?;
        self.inner.transactions.remove(xid);
        Ok(())
    }

    /// Branches that are prepared and waiting for an outcome.
    pub async fn recover(&self) -> Vec<Xid> {
        let mut prepared = Vec::new();
        for xid in self.inner.transactions.xids() {
            let Ok(branch) = self.inner.transactions.get(&xid) else {
                continue;
            };
            if branch.lock().await.state() == BranchState::Prepared {
                prepared.push(xid);
            }
        }
        prepared
    }

    pub async fn flush(&self) -> Result<()> {
        self.inner.store.flush().await
    }
}

impl BrokerInner {
    fn new_handler(&self, queue: Queue) -> Arc<QueueHandler> {
        let handler = QueueHandler::new(
            queue,
            self.store.clone(),
            self.scheduler.clone(),
            self.listener.clone(),
        );
        self.scheduler.register_expiry(&handler);
        handler
    }

    async fn publish(&self, message: &Message) -> Result<usize> {
        // Enqueueing may wait on storage backpressure, so the topology is not held.
        let targets = self.topology.read().await.route(message)?;

        let mut accepted = 0;
        for handler in &targets {
            match handler.enqueue(message).await {
                Ok(()) => accepted += 1,
                Err(e) if e.is_validation() || e.is_not_found() => {
                    tracing::warn!(
                        queue = handler.name(),
                        message = message.id(),
                        "queue refused message: {e}"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        tracing::trace!(
            message = message.id(),
            routing_key = message.routing_key(),
            queues = accepted,
            "message published"
        );
        Ok(accepted)
    }

    async fn owning_handler(&self, message: &Message) -> Result<Arc<QueueHandler>> {
        let queue = message.queue().ok_or_else(|| {
            Error::validation(format!("message {} is not held by any queue", message.id()))
        })?;
        self.topology.read().await.queue(queue).cloned()
    }

    async fn delete_queue_locked(&self, topology: &mut Topology, name: &str) -> Result<()> {
        let handler = topology.queue(name)?.clone();

        if handler.is_durable() {
            self.store.delete_queue(name).await?;
        }

        topology.queues.remove(name);
        for exchange in topology.exchanges.values_mut() {
            exchange.unbind_queue(name);
        }
        let dropped = handler.close().await;

        tracing::debug!(queue = name, dropped, "queue deleted");
        Ok(())
    }

    async fn dead_letter_message(&self, handler: &Arc<QueueHandler>, message: &Message) -> Result<()> {
        handler.ensure_content(message).await?;

        let copy = message.dead_letter_copy(DEAD_LETTER_EXCHANGE, DEAD_LETTER_QUEUE);
        if self.publish(&copy).await? == 0 {
            return Err(Error::opaque(format!(
                "dead-letter channel refused message {}",
                message.id()
            )));
        }

        handler.acknowledge(message).await
    }

    /// Loads exchanges, queues and bindings from storage, skipping what already
    /// exists. Stored messages go into handlers created here and, when `first`,
    /// into existing handlers that hold nothing yet. Returns the loaded messages
    /// by id.
    async fn reload(&self, first: bool) -> Result<HashMap<u64, Message>> {
        let exchanges = self.store.retrieve_exchanges().await?;
        let queues = self.store.retrieve_queues().await?;
        let bindings = self.store.retrieve_bindings().await?;

        let mut topology = self.topology.write().await;

        for record in exchanges {
            topology
                .exchanges
                .entry(record.name.clone())
                .or_insert_with(|| Exchange::new(record.name, record.kind));
        }

        if !queues.iter().any(|q| q.name == DEAD_LETTER_QUEUE) {
            if let Some(dead_letters) = topology.queues.get(DEAD_LETTER_QUEUE) {
                self.store.store_queue(&dead_letters.queue().record()).await?;
            }
        }

        // One message value per id, so copies on several queues share ownership.
        let mut loaded: HashMap<u64, Message> = HashMap::new();
        let mut restored = 0;

        for record in queues {
            let handler = match topology.queues.get(&record.name) {
                Some(_) if !first => continue,
                Some(handler) if handler.message_count() > 0 => continue,
                Some(handler) => Arc::clone(handler),
                None => {
                    let handler = self.new_handler(Queue::from_record(&record));
                    topology.bind_default(&handler)?;
                    topology
                        .queues
                        .insert(record.name.clone(), Arc::clone(&handler));
                    handler
                }
            };

            for stored in self.store.retrieve_messages(&record.name).await? {
                let message = loaded
                    .entry(stored.id)
                    .or_insert_with(|| stored.into_message());
                handler.restore(message);
                restored += 1;
            }
        }

        for record in bindings {
            self.restore_binding(&mut topology, record);
        }

        tracing::info!(
            exchanges = topology.exchanges.len(),
            queues = topology.queues.len(),
            messages = restored,
            "topology reloaded"
        );
        Ok(loaded)
    }

    fn restore_binding(&self, topology: &mut Topology, record: BindingRecord) {
        if !topology.queues.contains_key(&record.queue) {
            tracing::warn!(queue = %record.queue, "skipping binding of unknown queue");
            return;
        }

        let filter = match record.filter.as_deref().map(|s| self.filters.compile(s)).transpose() {
            Ok(filter) => filter,
            Err(e) => {
                tracing::warn!(queue = %record.queue, "skipping binding with invalid filter: {e}");
                return;
            }
        };

        let binding = Binding::new(
            record.exchange.clone(),
            record.queue,
            record.pattern,
            record.arguments.into_iter().collect(),
            filter,
        );
        let result = topology
            .exchange_mut(&record.exchange)
            .and_then(|exchange| exchange.bind(binding));
        if let Err(e) = result {
            tracing::warn!(exchange = %record.exchange, "skipping stored binding: {e}");
        }
    }

    /// Rebuilds prepared branches found in storage. `loaded` holds the messages
    /// reload put back, so recovered copies share ownership with them.
    async fn recover_transactions(&self, mut loaded: HashMap<u64, Message>) -> Result<()> {
        let xids = self.store.stored_xids().await?;
        if xids.is_empty() {
            return Ok(());
        }

        let topology = self.topology.read().await;
        for xid in xids {
            if self.transactions.get(&xid).is_ok() {
                continue;
            }

            let mut branch = Branch::recovered(xid.clone());
            for stored in self.store.enqueued_messages(&xid).await? {
                let queues = stored.queues.clone();
                let message = stored.into_message();
                for queue in queues {
                    match topology.queues.get(&queue) {
                        Some(handler) => branch.stage_enqueue(handler, &message)?,
                        None => tracing::warn!(%xid, %queue, "prepared message targets a missing queue"),
                    }
                }
            }

            for stored in self.store.dequeued_messages(&xid).await? {
                let queues = stored.queues.clone();
                let message = loaded
                    .entry(stored.id)
                    .or_insert_with(|| stored.into_message())
                    .clone();
                for queue in queues {
                    match topology.queues.get(&queue) {
                        Some(handler) => branch.restore_dequeue(handler, &message),
                        None => tracing::warn!(%xid, %queue, "prepared removal targets a missing queue"),
                    }
                }
            }

            tracing::info!(%xid, "recovered prepared transaction");
            self.transactions.restore(branch);
        }

        Ok(())
    }
}

impl DeadLetterRouter for BrokerInner {
    fn dead_letter<'a>(
        &'a self,
        queue: &'a Arc<QueueHandler>,
        message: &'a Message,
    ) -> BoxFuture<'a, Result<()>> {
        self.dead_letter_message(queue, message).boxed()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::{
        message::{Metadata, ORIGIN_QUEUE_HEADER},
        store::MemoryBackend,
    };

    fn broker() -> Broker {
        Broker::builder().build().unwrap()
    }

    fn message(exchange: &str, routing_key: &str) -> Message {
        Message::new(
            Metadata::builder()
                .exchange(exchange)
                .routing_key(routing_key)
                .build(),
            vec![Bytes::from_static(b"payload")],
        )
    }

    #[tokio::test]
    async fn test_builtins_exist_and_cannot_be_deleted() {
        let broker = broker();

        let names: Vec<String> = broker.all_exchanges().await.into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["<<default>>", "amq.direct", "amq.dlx", "amq.topic"]);

        for (name, _) in BUILTIN_EXCHANGES {
            assert!(broker.delete_exchange(name, false).await.unwrap_err().is_validation());
        }
        assert!(broker.queue_exists(DEAD_LETTER_QUEUE).await);
        assert!(broker.delete_queue(DEAD_LETTER_QUEUE).await.unwrap_err().is_validation());
    }

    #[tokio::test]
    async fn test_declare_exchange() {
        let broker = broker();

        assert!(broker
            .declare_exchange("orders", ExchangeKind::Topic, true)
            .await
            .unwrap_err()
            .is_not_found());
        broker.declare_exchange("orders", ExchangeKind::Topic, false).await.unwrap();
        broker.declare_exchange("orders", ExchangeKind::Topic, true).await.unwrap();
        assert!(broker
            .declare_exchange("orders", ExchangeKind::Direct, true)
            .await
            .unwrap_err()
            .is_validation());
        assert!(broker
            .declare_exchange("orders", ExchangeKind::Topic, false)
            .await
            .unwrap_err()
            .is_validation());
    }

    #[tokio::test]
    async fn test_delete_exchange_if_unused() {
        let broker = broker();
        broker.create_exchange("orders", ExchangeKind::Direct).await.unwrap();
        broker.create_queue(Queue::builder().name("q").build()).await.unwrap();
        broker.bind("orders", "q", "created", Headers::new()).await.unwrap();

        assert!(broker.delete_exchange("orders", true).await.unwrap_err().is_validation());
        broker.delete_exchange("orders", false).await.unwrap();
        assert!(broker.delete_exchange("orders", false).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_default_exchange_routes_by_queue_name() {
        let broker = broker();
        let queue = broker.create_queue(Queue::builder().name("inbox").build()).await.unwrap();

        assert_eq!(broker.publish(message("", "inbox")).await.unwrap(), 1);
        assert_eq!(broker.publish(message(DEFAULT_EXCHANGE, "inbox")).await.unwrap(), 1);
        assert_eq!(broker.publish(message("", "elsewhere")).await.unwrap(), 0);
        assert_eq!(queue.message_count(), 2);

        assert!(broker.publish(message("missing", "inbox")).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_publish_reaches_each_queue_once() {
        let broker = broker();
        let queue = broker.create_queue(Queue::builder().name("q").build()).await.unwrap();
        broker.bind(exchange::TOPIC_EXCHANGE, "q", "a.*", Headers::new()).await.unwrap();
        broker.bind(exchange::TOPIC_EXCHANGE, "q", "a.#", Headers::new()).await.unwrap();

        assert_eq!(broker.publish(message(exchange::TOPIC_EXCHANGE, "a.b")).await.unwrap(), 1);
        assert_eq!(queue.message_count(), 1);
    }

    #[tokio::test]
    async fn test_full_queue_is_skipped() {
        let broker = broker();
        broker
            .create_queue(Queue::builder().name("small").capacity(1).build())
            .await
            .unwrap();
        broker.create_queue(Queue::builder().name("big").build()).await.unwrap();
        broker.bind(exchange::DIRECT_EXCHANGE, "small", "k", Headers::new()).await.unwrap();
        broker.bind(exchange::DIRECT_EXCHANGE, "big", "k", Headers::new()).await.unwrap();

        assert_eq!(broker.publish(message(exchange::DIRECT_EXCHANGE, "k")).await.unwrap(), 2);
        assert_eq!(broker.publish(message(exchange::DIRECT_EXCHANGE, "k")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_selector_bindings() {
        let broker = broker();
        let eu = broker.create_queue(Queue::builder().name("eu").build()).await.unwrap();
        let mut arguments = Headers::new();
        arguments.insert(SELECTOR_ARGUMENT, "region = 'eu'");
        broker.bind(exchange::TOPIC_EXCHANGE, "eu", "orders.#", arguments).await.unwrap();

        let mut bad = Headers::new();
        bad.insert(SELECTOR_ARGUMENT, "region ==");
        assert!(broker
            .bind(exchange::TOPIC_EXCHANGE, "eu", "other.#", bad)
            .await
            .unwrap_err()
            .is_validation());

        let tagged = |region: &str| {
            Message::new(
                Metadata::builder()
                    .exchange(exchange::TOPIC_EXCHANGE)
                    .routing_key("orders.created")
                    .headers([("region", region)].into_iter().collect())
                    .build(),
                vec![],
            )
        };
        assert_eq!(broker.publish(tagged("eu")).await.unwrap(), 1);
        assert_eq!(broker.publish(tagged("us")).await.unwrap(), 0);
        assert_eq!(eu.message_count(), 1);
    }

    #[tokio::test]
    async fn test_bind_errors() {
        let broker = broker();
        broker.create_queue(Queue::builder().name("q").build()).await.unwrap();

        assert!(broker
            .bind("missing", "q", "k", Headers::new())
            .await
            .unwrap_err()
            .is_not_found());
        assert!(broker
            .bind(exchange::DIRECT_EXCHANGE, "missing", "k", Headers::new())
            .await
            .unwrap_err()
            .is_not_found());
        assert!(broker
            .bind(DEFAULT_EXCHANGE, "q", "k", Headers::new())
            .await
            .unwrap_err()
            .is_validation());
        assert!(broker
            .unbind(exchange::DIRECT_EXCHANGE, "q", "k")
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_delete_queue_removes_bindings() {
        let broker = broker();
        broker.create_queue(Queue::builder().name("q").build()).await.unwrap();
        broker.bind(exchange::TOPIC_EXCHANGE, "q", "a.#", Headers::new()).await.unwrap();

        broker.delete_queue("q").await.unwrap();
        assert!(!broker.queue_exists("q").await);
        assert!(broker
            .all_bindings_for_exchange(exchange::TOPIC_EXCHANGE)
            .await
            .unwrap()
            .is_empty());
        assert!(broker.delete_queue("q").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_auto_delete_queue_goes_with_last_consumer() {
        let broker = broker();
        broker
            .create_queue(Queue::builder().name("temp").auto_delete(true).build())
            .await
            .unwrap();

        let (consumer, _rx) = Consumer::channel("temp", false, 1);
        let consumer = broker.add_consumer(consumer).await.unwrap();
        assert!(broker.queue_exists("temp").await);

        broker.remove_consumer("temp", consumer.id()).await.unwrap();
        assert!(!broker.queue_exists("temp").await);
    }

    #[tokio::test]
    async fn test_move_to_dlc_annotates_copy() {
        let broker = broker();
        let queue = broker.create_queue(Queue::builder().name("work").build()).await.unwrap();
        broker.publish(message("", "work")).await.unwrap();

        let delivered = queue.take_for_delivery().await.unwrap();
        broker.move_to_dlc(&delivered).await.unwrap();

        assert!(delivered.owning_queues().is_empty());
        let dlc = broker.handler(DEAD_LETTER_QUEUE).await.unwrap();
        let dead = dlc.take_for_delivery().await.unwrap();
        assert_eq!(dead.metadata().headers().get(ORIGIN_QUEUE_HEADER), Some("work"));
        assert_eq!(dead.body(), delivered.body());
    }

    #[tokio::test]
    async fn test_delivery_deferred_until_activation() {
        let broker = broker();
        broker.start_message_delivery().await;
        assert!(!broker.is_delivering());

        broker.activate().await.unwrap();
        assert!(broker.is_delivering());

        broker.deactivate().await;
        assert!(!broker.is_delivering());
        broker.activate().await.unwrap();
        assert!(broker.is_delivering());

        broker.shutdown().await;
        assert!(!broker.is_delivering());
    }

    #[tokio::test]
    async fn test_durable_topology_is_persisted() {
        let backend = MemoryBackend::new();
        let broker = Broker::builder()
            .backend(Arc::new(backend.clone()))
            .build()
            .unwrap();
        broker.activate().await.unwrap();

        broker.create_exchange("orders", ExchangeKind::Topic).await.unwrap();
        broker
            .create_queue(Queue::builder().name("durable").durable(true).build())
            .await
            .unwrap();
        broker
            .create_queue(Queue::builder().name("transient").build())
            .await
            .unwrap();
        broker.bind("orders", "durable", "orders.#", Headers::new()).await.unwrap();
        broker.bind("orders", "transient", "orders.#", Headers::new()).await.unwrap();

        let queues: Vec<String> = backend
            .retrieve_queues()
            .await
            .unwrap()
            .into_iter()
            .map(|q| q.name)
            .collect();
        assert_eq!(queues, vec![DEAD_LETTER_QUEUE.to_owned(), "durable".to_owned()]);
        assert_eq!(backend.retrieve_bindings().await.unwrap().len(), 1);

        broker.shutdown().await;
    }
}
