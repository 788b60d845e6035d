use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use serde::{Deserialize, Serialize};

/// Format id of the identifiers generated for local transactions.
pub const LOCAL_FORMAT_ID: i32 = -1;

static NEXT_LOCAL_ID: AtomicU64 = AtomicU64::new(1);

/// Identifier of a distributed transaction branch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Xid {
    format_id: i32,
    global_id: Vec<u8>,
    branch_qualifier: Vec<u8>,
}

impl Xid {
    pub fn new(
        format_id: i32,
        global_id: impl Into<Vec<u8>>,
        branch_qualifier: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            format_id,
            global_id: global_id.into(),
            branch_qualifier: branch_qualifier.into(),
        }
    }

    /// A fresh identifier for a local transaction. Never persisted.
    pub fn local() -> Self {
        let id = NEXT_LOCAL_ID.fetch_add(1, Ordering::Relaxed);
        Self::new(LOCAL_FORMAT_ID, id.to_be_bytes(), Vec::new())
    }

    pub fn format_id(&self) -> i32 {
        self.format_id
    }

    pub fn global_id(&self) -> &[u8] {
        &self.global_id
    }

    pub fn branch_qualifier(&self) -> &[u8] {
        &self.branch_qualifier
    }

    pub fn is_local(&self) -> bool {
        self.format_id == LOCAL_FORMAT_ID
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.format_id)?;
        for byte in &self.global_id {
            write!(f, "{byte:02x}")?;
        }
        f.write_str(":")?;
        for byte in &self.branch_qualifier {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}
