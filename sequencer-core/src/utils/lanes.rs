//! Per-key guarded state.
//!
//! Each key (normally a wallet address) maps to its own `Mutex`, so work on one
//! wallet never contends with work on another. The outer `RwLock` is only held
//! long enough to look up or insert a lane.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

#[derive(Debug)]
pub struct LaneMap<V> {
    lanes: RwLock<HashMap<String, Arc<Mutex<V>>>>,
}

impl<V> Default for LaneMap<V> {
    fn default() -> Self {
        Self {
            lanes: RwLock::new(HashMap::new()),
        }
    }
}

impl<V> LaneMap<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &str) -> Option<Arc<Mutex<V>>> {
        self.lanes.read().await.get(key).cloned()
    }

    pub async fn get_or_insert_with<F>(&self, key: &str, init: F) -> Arc<Mutex<V>>
    where
        F: FnOnce() -> V,
    {
        if let Some(lane) = self.lanes.read().await.get(key) {
            return Arc::clone(lane);
        }
        let mut lanes = self.lanes.write().await;
        Arc::clone(
            lanes
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(init()))),
        )
    }

    /// Inserts a new lane. Returns false if the key already exists.
    pub async fn insert(&self, key: &str, value: V) -> bool {
        let mut lanes = self.lanes.write().await;
        if lanes.contains_key(key) {
            return false;
        }
        lanes.insert(key.to_string(), Arc::new(Mutex::new(value)));
        true
    }

    /// All lanes, sorted by key.
    pub async fn snapshot(&self) -> Vec<(String, Arc<Mutex<V>>)> {
        let lanes = self.lanes.read().await;
        let mut all: Vec<_> = lanes
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Drops the lane for `key` unless a caller still holds a handle to it.
    pub async fn remove_idle(&self, key: &str) -> bool {
        let mut lanes = self.lanes.write().await;
        match lanes.get(key) {
            Some(lane) if Arc::strong_count(lane) == 1 => {
                lanes.remove(key);
                true
            }
            _ => false,
        }
    }

    pub async fn clear(&self) {
        self.lanes.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_or_insert_reuses_lane() {
        let lanes: LaneMap<u64> = LaneMap::new();
        let a = lanes.get_or_insert_with("w1", || 1).await;
        let b = lanes.get_or_insert_with("w1", || 99).await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(*b.lock().await, 1);
    }

    #[tokio::test]
    async fn test_independent_lanes_do_not_block() {
        let lanes: LaneMap<u64> = LaneMap::new();
        lanes.insert("w1", 0).await;
        lanes.insert("w2", 0).await;

        let w1 = lanes.get("w1").await.unwrap();
        let _held = w1.lock().await;

        let w2 = lanes.get("w2").await.unwrap();
        assert!(w2.try_lock().is_ok());
    }

    #[tokio::test]
    async fn test_insert_rejects_duplicates() {
        let lanes: LaneMap<u64> = LaneMap::new();
        assert!(lanes.insert("w1", 0).await);
        assert!(!lanes.insert("w1", 1).await);
        assert_eq!(*lanes.get("w1").await.unwrap().lock().await, 0);

    }

    #[tokio::test]
    async fn test_remove_idle_keeps_held_lanes() {
        let lanes: LaneMap<()> = LaneMap::new();
        let held = lanes.get_or_insert_with("req-1", || ()).await;
        assert!(!lanes.remove_idle("req-1").await);

        drop(held);
        assert!(lanes.remove_idle("req-1").await);
        assert!(lanes.get("req-1").await.is_none());
        assert!(!lanes.remove_idle("req-1").await);
    }
}
