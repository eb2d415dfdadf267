//! Per-account accumulation state owned by the orchestrator
//!
//! One engine per account, created on the account's first cycle and kept for
//! the life of the process. The engine sits behind that account's own async
//! lock; the orchestrator takes the lock with `try_lock_owned` so an account
//! whose previous task is still running is skipped instead of queued.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::domain::accumulation::{AccumulationEngine, KeywordScanner};
use crate::domain::record::AccumulatedRecord;

pub type EngineGuard = OwnedMutexGuard<AccumulationEngine>;

#[derive(Debug, Clone, Default)]
pub struct AccountRegistry {
    engines: Arc<Mutex<HashMap<String, Arc<AsyncMutex<AccumulationEngine>>>>>,
}

impl AccountRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared handle to the account's engine, creating it on first use
    pub fn engine_for(&self, account: &str, scanner: &KeywordScanner) -> Arc<AsyncMutex<AccumulationEngine>> {
        let mut engines = self.engines.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        engines
            .entry(account.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(AccumulationEngine::new(account, scanner.clone()))))
            .clone()
    }

    /// Exclusive access for one task, or `None` if the account is still busy
    pub fn try_acquire(&self, account: &str, scanner: &KeywordScanner) -> Option<EngineGuard> {
        self.engine_for(account, scanner).try_lock_owned().ok()
    }

    /// Seed an account's baseline from stored records; existing engines are left alone
    pub fn restore(&self, account: &str, scanner: &KeywordScanner, records: Vec<AccumulatedRecord>) -> bool {
        let mut engines = self.engines.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if engines.contains_key(account) {
            return false;
        }
        let engine = AccumulationEngine::restore(account, scanner.clone(), records);
        engines.insert(account.to_string(), Arc::new(AsyncMutex::new(engine)));
        true
    }

    pub fn forget(&self, account: &str) -> bool {
        let mut engines = self.engines.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        engines.remove(account).is_some()
    }

    pub fn accounts(&self) -> Vec<String> {
        let engines = self.engines.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut accounts: Vec<_> = engines.keys().cloned().collect();
        accounts.sort();
        accounts
    }

    pub fn len(&self) -> usize {
        self.engines.lock().unwrap_or_else(std::sync::PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
