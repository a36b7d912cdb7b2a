use log::{debug, warn};
use std::{
    collections::{HashMap, HashSet},
    sync::Mutex,
};

use crate::store::{ResourceStore, ResourceType};

#[derive(Default, Debug)]
struct Pool {
    fresh: Vec<String>,
    spent: HashSet<String>,
}

/// Replay nonces per ACME directory. A nonce leaves the pool the moment it is
/// handed out and is never handed out again.
#[derive(Default, Debug)]
pub struct NoncePool {
    pools: Mutex<HashMap<String, Pool>>,
}

impl NoncePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds the pools from the `nonces` resources persisted in the store.
    /// Those may be stale; a stale one costs a single rejected request.
    pub fn restore(store: &ResourceStore) -> Self {
        let pool = NoncePool::new();
        for r in store.list().filter(|r| r.kind == ResourceType::Nonces) {
            let nonces = r
                .resource
                .as_ref()
                .and_then(|v| v.get("nonces"))
                .and_then(|v| v.as_array())
                .map(|a| a.iter().filter_map(|n| n.as_str()).collect::<Vec<_>>())
                .unwrap_or_default();
            for n in nonces {
                pool.deposit(&r.parent, n);
            }
        }
        pool
    }

    /// `None` means the pool is dry and a newNonce exchange is needed first.
    pub fn acquire(&self, directory_url: &str) -> Option<String> {
        let mut pools = self.lock();
        let pool = pools.get_mut(directory_url)?;
        let nonce = pool.fresh.pop()?;
        pool.spent.insert(nonce.clone());
        debug!("Took nonce {} for {}, {} left", nonce, directory_url, pool.fresh.len());
        Some(nonce)
    }

    /// Returns false if the nonce was already pooled or already used.
    pub fn deposit(&self, directory_url: &str, nonce: &str) -> bool {
        let mut pools = self.lock();
        let pool = pools.entry(directory_url.to_string()).or_default();
        if pool.spent.contains(nonce) || pool.fresh.iter().any(|n| n == nonce) {
            warn!("Ignore repeated nonce {} for {}", nonce, directory_url);
            return false;
        }
        pool.fresh.push(nonce.to_string());
        true
    }

    pub fn available(&self, directory_url: &str) -> Vec<String> {
        self.lock()
            .get(directory_url)
            .map(|p| p.fresh.clone())
            .unwrap_or_default()
    }

    pub fn len(&self, directory_url: &str) -> usize {
        self.lock().get(directory_url).map_or(0, |p| p.fresh.len())
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Pool>> {
        // the map stays consistent even if a holder panicked
        self.pools.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub fn pool_url(directory_url: &str) -> String {
    format!("{}/nonces", directory_url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const D: &str = "https://ca/directory";

    #[test]
    fn deposit_then_acquire() {
        let pool = NoncePool::new();
        assert!(pool.deposit(D, "n"));
        assert_eq!(pool.acquire(D).as_deref(), Some("n"));
        assert_eq!(pool.acquire(D), None);
    }

    #[test]
    fn exhausted_never_reissues() {
        let pool = NoncePool::new();
        pool.deposit(D, "a");
        pool.deposit(D, "b");
        let mut got = vec![pool.acquire(D).unwrap(), pool.acquire(D).unwrap()];
        got.sort();
        assert_eq!(got, vec!["a", "b"]);
        assert_eq!(pool.acquire(D), None);

        assert!(!pool.deposit(D, "a"));
        assert_eq!(pool.acquire(D), None);
    }

    #[test]
    fn no_duplicates_and_scoped_per_directory() {
        let pool = NoncePool::new();
        assert!(pool.deposit(D, "x"));
        assert!(!pool.deposit(D, "x"));
        assert!(pool.deposit("https://other/dir", "x"));
        assert_eq!(pool.len(D), 1);
        assert_eq!(pool.acquire("https://unknown"), None);
    }

    #[test]
    fn restore_from_store() {
        let mut store = ResourceStore::in_memory();
        store
            .put(&pool_url(D), "Nonce Pool (2)", ResourceType::Nonces, D, Some(json!({"nonces": ["a", "b"]})), None)
            .unwrap();
        let pool = NoncePool::restore(&store);
        assert_eq!(pool.available(D), vec!["a", "b"]);
    }
}
