pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub use memory::MemoryStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionId(pub Uuid);

impl TransactionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Unit-of-work boundary supplied by the persistence layer.
#[async_trait]
pub trait TransactionManager: Send + Sync {
    async fn begin(&self) -> Result<TransactionId>;
    async fn commit(&self, tx: TransactionId) -> Result<()>;
    async fn rollback(&self, tx: TransactionId) -> Result<()>;
}
