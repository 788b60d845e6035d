//! Exchanges: direct (exact routing key) and topic (pattern) routers.

use std::borrow::Cow;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::{
    binding::{Binding, BindingRegistry, BindingSet},
    error::{Error, Result},
    store::ExchangeRecord,
    topic::TopicMatcher,
};

/// The nameless exchange every queue is implicitly bound to under its own name.
pub const DEFAULT_EXCHANGE: &str = "<<default>>";
pub const DIRECT_EXCHANGE: &str = "amq.direct";
pub const TOPIC_EXCHANGE: &str = "amq.topic";
pub const DEAD_LETTER_EXCHANGE: &str = "amq.dlx";

pub const BUILTIN_EXCHANGES: [(&str, ExchangeKind); 4] = [
    (DEFAULT_EXCHANGE, ExchangeKind::Direct),
    (DIRECT_EXCHANGE, ExchangeKind::Direct),
    (TOPIC_EXCHANGE, ExchangeKind::Topic),
    (DEAD_LETTER_EXCHANGE, ExchangeKind::Direct),
];

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Direct,
    Topic,
}

#[derive(Debug, Clone)]
enum Router {
    Direct,
    Topic(TopicMatcher),
}

#[derive(Debug, Clone)]
pub struct Exchange {
    name: String,
    bindings: BindingRegistry,
    router: Router,
}

/// Public description of an exchange, as returned by listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeInfo {
    pub name: String,
    pub kind: ExchangeKind,
    pub builtin: bool,
    pub binding_count: usize,
}

impl Exchange {
    pub fn new(name: impl Into<String>, kind: ExchangeKind) -> Self {
        let router = match kind {
            ExchangeKind::Direct => Router::Direct,
            ExchangeKind::Topic => Router::Topic(TopicMatcher::new()),
        };

        Self {
            name: name.into(),
            bindings: BindingRegistry::new(),
            router,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ExchangeKind {
        match self.router {
            Router::Direct => ExchangeKind::Direct,
            Router::Topic(_) => ExchangeKind::Topic,
        }
    }

    pub fn is_builtin(&self) -> bool {
        is_builtin(&self.name)
    }

    pub fn has_bindings(&self) -> bool {
        !self.bindings.is_empty()
    }

    pub fn info(&self) -> ExchangeInfo {
        ExchangeInfo {
            name: self.name.clone(),
            kind: self.kind(),
            builtin: self.is_builtin(),
            binding_count: self.bindings.iter().count(),
        }
    }

    pub fn record(&self) -> ExchangeRecord {
        ExchangeRecord {
            name: self.name.clone(),
            kind: self.kind(),
        }
    }

    /// Registers `binding`. Returns `Ok(false)` if the same binding already existed.
    pub fn bind(&mut self, binding: Binding) -> Result<bool> {
        let pattern = binding.pattern().to_owned();
        let added = self.bindings.add(binding)?;

        if let Router::Topic(matcher) = &mut self.router {
            matcher.add(&pattern);
        }

        Ok(added)
    }

    pub fn unbind(&mut self, queue: &str, pattern: &str) -> Result<Binding> {
        let (binding, last) = self.bindings.remove(queue, pattern)?;

        if last {
            self.forget_pattern(pattern);
        }

        Ok(binding)
    }

    /// Drops every binding pointing at `queue`.
    pub fn unbind_queue(&mut self, queue: &str) -> Vec<Binding> {
        let (removed, unused) = self.bindings.remove_queue(queue);
        for pattern in &unused {
            self.forget_pattern(pattern);
        }
        removed
    }

    fn forget_pattern(&mut self, pattern: &str) {
        if let Router::Topic(matcher) = &mut self.router {
            matcher.remove(pattern);
        }
    }

    pub fn bindings(&self) -> impl Iterator<Item = &Binding> {
        self.bindings.iter()
    }

    /// The bindings a message published with `routing_key` should follow.
    pub fn bindings_for_route(&self, routing_key: &str) -> Cow<'_, BindingSet> {
        match &self.router {
            Router::Direct => Cow::Borrowed(self.bindings.get(routing_key)),
            Router::Topic(_) if routing_key.is_empty() => Cow::Borrowed(BindingSet::empty()),
            Router::Topic(matcher) => BindingSet::union(
                matcher
                    .matches(routing_key)
                    .into_iter()
                    .map(|pattern| self.bindings.get(pattern)),
            ),
        }
    }

    /// Checks that a declaration of `kind` is compatible with this exchange.
    pub fn ensure_kind(&self, kind: ExchangeKind) -> Result<()> {
        if self.kind() != kind {
            return Err(Error::validation(format!(
                "exchange {} is declared as {}, not {kind}",
                self.name,
                self.kind()
            )));
        }
        Ok(())
    }
}

pub fn is_builtin(name: &str) -> bool {
    BUILTIN_EXCHANGES.iter().any(|(builtin, _)| *builtin == name)
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeSet, str::FromStr};

    use super::*;
    use crate::message::{Headers, Metadata};

    fn bind(exchange: &mut Exchange, queue: &str, pattern: &str) -> bool {
        exchange
            .bind(Binding::new(
                exchange.name().to_owned(),
                queue,
                pattern,
                Headers::new(),
                None,
            ))
            .unwrap()
    }

    fn routed(exchange: &Exchange, routing_key: &str) -> BTreeSet<String> {
        let metadata = Metadata::builder().routing_key(routing_key).build();
        exchange
            .bindings_for_route(routing_key)
            .target_queues(&metadata)
            .map(str::to_owned)
            .collect()
    }

    #[test]
    fn test_kind_strings() {
        assert_eq!(ExchangeKind::Topic.to_string(), "topic");
        assert_eq!(ExchangeKind::from_str("direct").unwrap(), ExchangeKind::Direct);
        assert!(ExchangeKind::from_str("fanout").is_err());
    }

    #[test]
    fn test_direct_routes_by_exact_key() {
        let mut exchange = Exchange::new("orders", ExchangeKind::Direct);
        bind(&mut exchange, "q1", "created");
        bind(&mut exchange, "q2", "created");
        bind(&mut exchange, "q3", "deleted");

        assert_eq!(routed(&exchange, "created"), BTreeSet::from(["q1".into(), "q2".into()]));
        assert!(routed(&exchange, "created.eu").is_empty());
        assert!(routed(&exchange, "").is_empty());
    }

    #[test]
    fn test_topic_unions_matching_patterns() {
        let mut exchange = Exchange::new(TOPIC_EXCHANGE, ExchangeKind::Topic);
        bind(&mut exchange, "queue1", "orders.*");
        bind(&mut exchange, "queue2", "orders.created");
        bind(&mut exchange, "queue1", "orders.#");
        bind(&mut exchange, "queue3", "payments.#");

        assert_eq!(
            routed(&exchange, "orders.created"),
            BTreeSet::from(["queue1".into(), "queue2".into()])
        );
        assert!(routed(&exchange, "").is_empty());
    }

    #[test]
    fn test_topic_pattern_is_kept_until_last_unbind() {
        let mut exchange = Exchange::new(TOPIC_EXCHANGE, ExchangeKind::Topic);
        bind(&mut exchange, "q1", "a.*");
        bind(&mut exchange, "q2", "a.*");

        exchange.unbind("q1", "a.*").unwrap();
        assert_eq!(routed(&exchange, "a.b"), BTreeSet::from(["q2".into()]));

        exchange.unbind("q2", "a.*").unwrap();
        assert!(routed(&exchange, "a.b").is_empty());
        assert!(!exchange.has_bindings());
        assert!(exchange.unbind("q2", "a.*").unwrap_err().is_not_found());
    }

    #[test]
    fn test_unbind_queue() {
        let mut exchange = Exchange::new(TOPIC_EXCHANGE, ExchangeKind::Topic);
        bind(&mut exchange, "q1", "a.*");
        bind(&mut exchange, "q1", "b.#");
        bind(&mut exchange, "q2", "b.#");

        assert_eq!(exchange.unbind_queue("q1").len(), 2);
        assert!(routed(&exchange, "a.x").is_empty());
        assert_eq!(routed(&exchange, "b.x"), BTreeSet::from(["q2".into()]));
    }

    #[test]
    fn test_builtins() {
        assert!(Exchange::new(DEFAULT_EXCHANGE, ExchangeKind::Direct).is_builtin());
        assert!(is_builtin(DEAD_LETTER_EXCHANGE));
        assert!(!is_builtin("orders"));
    }

    #[test]
    fn test_ensure_kind() {
        let exchange = Exchange::new("orders", ExchangeKind::Topic);
        assert!(exchange.ensure_kind(ExchangeKind::Topic).is_ok());
        assert!(exchange.ensure_kind(ExchangeKind::Direct).unwrap_err().is_validation());
    }
}
