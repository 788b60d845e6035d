use serde::{Deserialize, Serialize};

use crate::exchange::ExchangeKind;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueRecord {
    pub name: String,
    pub durable: bool,
    pub auto_delete: bool,
    pub capacity: Option<usize>,
    #[serde(default)]
    pub dead_letter_expired: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeRecord {
    pub name: String,
    pub kind: ExchangeKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingRecord {
    pub exchange: String,
    pub queue: String,
    pub pattern: String,
    pub arguments: Vec<(String, String)>,
    pub filter: Option<String>,
}
