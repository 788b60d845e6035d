use std::collections::BTreeMap;

use crate::message::Message;

#[derive(Debug)]
struct Dequeued {
    message: Message,
    durable: bool,
}

/// Staging buffer of one transaction: what it enqueues and which delivered copies
/// it acknowledges.
///
/// Only copies that live on durable queues and carry persistent messages produce
/// storage work; everything else is tracked for in-memory ownership only.
#[derive(Debug, Default)]
pub struct TransactionData {
    enqueues: Vec<Message>,
    dequeued: Vec<Dequeued>,
    deletes: Vec<u64>,
    detaches: BTreeMap<String, Vec<u64>>,
}

impl TransactionData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.enqueues.is_empty() && self.dequeued.is_empty()
    }

    /// Stages a queue copy produced by the transaction.
    pub fn stage_enqueue(&mut self, copy: Message, durable: bool) {
        if durable && copy.is_persistent() {
            self.enqueues.push(copy);
        }
    }

    /// Stages the acknowledgement of a delivered copy.
    pub fn stage_dequeue(&mut self, copy: Message, durable: bool) {
        self.dequeued.push(Dequeued {
            message: copy,
            durable,
        });
    }

    /// Drops the ownership of every dequeued copy and sorts the storage work into
    /// deletes (last owner gone) and detaches (other queues still hold the message).
    pub fn settle(&mut self) {
        self.deletes.clear();
        self.detaches.clear();

        for Dequeued { message, durable } in &self.dequeued {
            let orphaned = message.release();

            if !message.is_persistent() {
                continue;
            }
            if orphaned {
                self.deletes.push(message.id());
            } else if *durable {
                if let Some(queue) = message.queue() {
                    self.detaches
                        .entry(queue.to_owned())
                        .or_default()
                        .push(message.id());
                }
            }
        }

        self.deletes.sort_unstable();
        self.deletes.dedup();
    }

    /// Undoes [`TransactionData::settle`] after the store refused the commit.
    pub fn restore(&mut self) {
        for Dequeued { message, .. } in &self.dequeued {
            message.reattach();
        }
        self.deletes.clear();
        self.detaches.clear();
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Durable copies to write, each tagged with its queue.
    pub fn enqueues(&self) -> &[Message] {
        &self.enqueues
    }

    /// Message ids with no owner left, available after [`TransactionData::settle`].
    pub fn deletes(&self) -> &[u64] {
        &self.deletes
    }

    /// Queue associations to remove, available after [`TransactionData::settle`].
    pub fn detaches(&self) -> &BTreeMap<String, Vec<u64>> {
        &self.detaches
    }

    /// Every durable association the transaction removes, whether or not the
    /// message ends up orphaned. Recorded when a distributed branch is prepared.
    pub fn dequeues(&self) -> BTreeMap<String, Vec<u64>> {
        let mut dequeues: BTreeMap<String, Vec<u64>> = BTreeMap::new();
        for Dequeued { message, durable } in &self.dequeued {
            if !durable || !message.is_persistent() {
                continue;
            }
            if let Some(queue) = message.queue() {
                dequeues.entry(queue.to_owned()).or_default().push(message.id());
            }
        }
        dequeues
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::message::Metadata;

    fn persistent() -> Message {
        Message::new(
            Metadata::builder().persistent(true).build(),
            vec![Bytes::from_static(b"x")],
        )
    }

    #[test]
    fn test_only_durable_persistent_enqueues_are_stored() {
        let mut data = TransactionData::new();
        let message = persistent();

        data.stage_enqueue(message.shallow_copy_for("durable"), true);
        data.stage_enqueue(message.shallow_copy_for("transient"), false);
        data.stage_enqueue(
            Message::new(Metadata::builder().build(), vec![]).shallow_copy_for("durable"),
            true,
        );

        assert_eq!(data.enqueues().len(), 1);
        assert_eq!(data.enqueues()[0].queue(), Some("durable"));
    }

    #[test]
    fn test_settle_splits_deletes_and_detaches() {
        let shared = persistent();
        let q1 = shared.shallow_copy_for("q1");
        let _q2 = shared.shallow_copy_for("q2");
        let single = persistent().shallow_copy_for("q1");

        let mut data = TransactionData::new();
        data.stage_dequeue(q1, true);
        data.stage_dequeue(single.clone(), true);
        data.settle();

        assert_eq!(data.deletes(), &[single.id()]);
        assert_eq!(
            data.detaches(),
            &BTreeMap::from([("q1".to_owned(), vec![shared.id()])])
        );
        assert_eq!(shared.owning_queues(), vec!["q2".to_owned()]);
        assert!(single.owning_queues().is_empty());

        data.restore();
        assert_eq!(shared.owning_queues(), vec!["q1".to_owned(), "q2".to_owned()]);
        assert_eq!(single.owning_queues(), vec!["q1".to_owned()]);
        assert!(data.deletes().is_empty());
    }

    #[test]
    fn test_dequeues_cover_every_durable_copy() {
        let message = persistent();
        let mut data = TransactionData::new();
        data.stage_dequeue(message.shallow_copy_for("q1"), true);
        data.stage_dequeue(message.shallow_copy_for("q2"), false);

        assert_eq!(
            data.dequeues(),
            BTreeMap::from([("q1".to_owned(), vec![message.id()])])
        );
    }
}
