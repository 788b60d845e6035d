//! Binding filters.
//!
//! A [`Filter`] is an opaque predicate over message metadata, remembered together
//! with the source text it was compiled from (the source is what binding equality
//! compares). The broker compiles selector strings through a [`FilterCompiler`];
//! [`HeaderSelectorCompiler`] understands header comparisons joined by `AND`/`OR`,
//! e.g. `region = 'eu' AND tier <> 'free'`.

use std::{fmt, sync::Arc};

use pom::parser::{end, is_a, list, none_of, one_of, seq, sym, Parser};

use crate::{
    error::{Error, Result},
    message::Metadata,
    utils::from_pom_error,
};

/// Binding argument holding the selector source.
pub const SELECTOR_ARGUMENT: &str = "x-filter-selector";

type Predicate = dyn Fn(&Metadata) -> bool + Send + Sync;

#[derive(Clone)]
pub struct Filter {
    source: Arc<str>,
    predicate: Arc<Predicate>,
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Filter").field(&self.source).finish()
    }
}

impl Filter {
    pub fn new<F>(source: impl Into<Arc<str>>, predicate: F) -> Self
    where
        F: Fn(&Metadata) -> bool + Send + Sync + 'static,
    {
        Self {
            source: source.into(),
            predicate: Arc::new(predicate),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, metadata: &Metadata) -> bool {
        (self.predicate)(metadata)
    }
}

pub trait FilterCompiler: Send + Sync + 'static {
    /// Compiles `source`, returning a validation error if it is malformed.
    fn compile(&self, source: &str) -> Result<Filter>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    Eq,
    NotEq,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Comparison {
    header: String,
    operator: Operator,
    value: String,
}

impl Comparison {
    fn eval(&self, metadata: &Metadata) -> bool {
        // A missing header never satisfies a comparison.
        let Some(actual) = metadata.headers().get(&self.header) else {
            return false;
        };

        match self.operator {
            Operator::Eq => actual == self.value,
            Operator::NotEq => actual != self.value,
        }
    }
}

/// Disjunction of conjunctions.
type Selector = Vec<Vec<Comparison>>;

fn space<'a>() -> Parser<'a, u8, ()> {
    one_of(b" \t\r\n").repeat(0..).discard()
}

fn identifier<'a>() -> Parser<'a, u8, String> {
    let first = is_a(|c: u8| c.is_ascii_alphabetic() || c == b'_');
    let rest = is_a(|c: u8| c.is_ascii_alphanumeric() || matches!(c, b'_' | b'-' | b'.'));

    (first + rest.repeat(0..))
        .collect()
        .convert(|bytes| String::from_utf8(bytes.to_vec()))
}

fn literal<'a>() -> Parser<'a, u8, String> {
    (sym(b'\'') * none_of(b"'").repeat(0..) - sym(b'\'')).convert(String::from_utf8)
}

fn operator<'a>() -> Parser<'a, u8, Operator> {
    seq(b"<>").map(|_| Operator::NotEq) | sym(b'=').map(|_| Operator::Eq)
}

fn comparison<'a>() -> Parser<'a, u8, Comparison> {
    (identifier() - space() + operator() - space() + literal()).map(
        |((header, operator), value)| Comparison {
            header,
            operator,
            value,
        },
    )
}

fn selector<'a>() -> Parser<'a, u8, Selector> {
    let conjunction = list(comparison(), space() * seq(b"AND") - space());
    space() * list(conjunction, space() * seq(b"OR") - space()) - space() - end()
}

fn parse_selector(source: &str) -> Result<Selector> {
    selector()
        .parse(source.as_bytes())
        .map_err(|e| from_pom_error(e, source))
        .and_then(|selector| {
            if selector.iter().any(Vec::is_empty) || selector.is_empty() {
                Err(Error::validation(format!("empty selector: {source:?}")))
            } else {
                Ok(selector)
            }
        })
}

/// Compiles `header = 'value'` / `header <> 'value'` comparisons joined by `AND`
/// (binding tighter) and `OR`.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeaderSelectorCompiler;

impl FilterCompiler for HeaderSelectorCompiler {
    fn compile(&self, source: &str) -> Result<Filter> {
        let selector = parse_selector(source)?;

        Ok(Filter::new(source, move |metadata: &Metadata| {
            selector
                .iter()
                .any(|conjunction| conjunction.iter().all(|c| c.eval(metadata)))
        }))
    }
}
