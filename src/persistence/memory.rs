use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use super::{TransactionId, TransactionManager};

#[derive(Debug, Clone)]
enum Write {
    Put(String, Value),
    Delete(String),
}

#[derive(Debug, Default)]
struct State {
    committed: HashMap<String, Value>,
    open: HashMap<TransactionId, Vec<Write>>,
}

#[derive(Debug, Default)]
struct Counters {
    begun: AtomicU64,
    committed: AtomicU64,
    rolled_back: AtomicU64,
    fail_commits: AtomicBool,
    fail_rollbacks: AtomicBool,
}

/// In-memory read-committed key/value store. Writes are buffered per
/// transaction and become visible to `get` only on commit.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    counters: Arc<Counters>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put(&self, tx: TransactionId, key: &str, value: Value) -> Result<()> {
        self.buffer(tx, Write::Put(key.to_string(), value)).await
    }

    pub async fn delete(&self, tx: TransactionId, key: &str) -> Result<()> {
        self.buffer(tx, Write::Delete(key.to_string())).await
    }

    async fn buffer(&self, tx: TransactionId, write: Write) -> Result<()> {
        let mut state = self.state.lock().await;
        match state.open.get_mut(&tx) {
            Some(writes) => {
                writes.push(write);
                Ok(())
            }
            None => bail!("transaction {tx} is not open"),
        }
    }

    /// Committed value only.
    pub async fn get(&self, key: &str) -> Option<Value> {
        self.state.lock().await.committed.get(key).cloned()
    }

    /// Value as seen from inside `tx`, including its own uncommitted writes.
    pub async fn get_in(&self, tx: TransactionId, key: &str) -> Option<Value> {
        let state = self.state.lock().await;
        let own = state.open.get(&tx).and_then(|writes| {
            writes.iter().rev().find_map(|w| match w {
                Write::Put(k, v) if k == key => Some(Some(v.clone())),
                Write::Delete(k) if k == key => Some(None),
                _ => None,
            })
        });
        match own {
            Some(value) => value,
            None => state.committed.get(key).cloned(),
        }
    }

    pub async fn open_transactions(&self) -> usize {
        self.state.lock().await.open.len()
    }

    pub fn begun(&self) -> u64 {
        self.counters.begun.load(Ordering::SeqCst)
    }

    pub fn committed(&self) -> u64 {
        self.counters.committed.load(Ordering::SeqCst)
    }

    pub fn rolled_back(&self) -> u64 {
        self.counters.rolled_back.load(Ordering::SeqCst)
    }

    /// Make subsequent commits fail, leaving the transaction open.
    pub fn fail_commits(&self, fail: bool) {
        self.counters.fail_commits.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent rollbacks fail. The buffered writes are still dropped.
    pub fn fail_rollbacks(&self, fail: bool) {
        self.counters.fail_rollbacks.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl TransactionManager for MemoryStore {
    async fn begin(&self) -> Result<TransactionId> {
        let tx = TransactionId::new();
        self.state.lock().await.open.insert(tx, Vec::new());
        self.counters.begun.fetch_add(1, Ordering::SeqCst);
        debug!(transaction = %tx, "transaction begun");
        Ok(tx)
    }

    async fn commit(&self, tx: TransactionId) -> Result<()> {
        if self.counters.fail_commits.load(Ordering::SeqCst) {
            bail!("commit rejected by storage");
        }
        let mut state = self.state.lock().await;
        let Some(writes) = state.open.remove(&tx) else {
            bail!("transaction {tx} is not open");
        };
        for write in writes {
            match write {
                Write::Put(k, v) => {
                    state.committed.insert(k, v);
                }
                Write::Delete(k) => {
                    state.committed.remove(&k);
                }
            }
        }
        self.counters.committed.fetch_add(1, Ordering::SeqCst);
        debug!(transaction = %tx, "transaction committed");
        Ok(())
    }

    async fn rollback(&self, tx: TransactionId) -> Result<()> {
        let discarded = self.state.lock().await.open.remove(&tx);
        if self.counters.fail_rollbacks.load(Ordering::SeqCst) {
            bail!("rollback rejected by storage");
        }
        if discarded.is_none() {
            bail!("transaction {tx} is not open");
        }
        self.counters.rolled_back.fetch_add(1, Ordering::SeqCst);
        debug!(transaction = %tx, "transaction rolled back");
        Ok(())
    }
}
