//! `CloneCache<K, V>`: a `RwLock<HashMap<K, V>>` with cheap,
//! `Clone`-based read access. Backs `HostRegistry` and the
//! connection table in `warp_server`, and `ClientState`'s per-id maps
//! in `warp_client`. Every instance is owned by the handler/state
//! that creates it — never reached through a process-global.

use std::collections::HashMap;
use std::hash::Hash;

use tokio::sync::RwLock;

#[derive(Debug)]
pub struct CloneCache<K: Eq + Hash, V: Clone>(RwLock<HashMap<K, V>>);

impl<K: Eq + Hash, V: Clone> Default for CloneCache<K, V> {
  fn default() -> Self {
    Self(RwLock::new(HashMap::new()))
  }
}

impl<K: Eq + Hash + Clone, V: Clone> CloneCache<K, V> {
  pub fn new() -> Self {
    Self::default()
  }

  pub async fn get(&self, key: &K) -> Option<V> {
    self.0.read().await.get(key).cloned()
  }

  pub async fn contains(&self, key: &K) -> bool {
    self.0.read().await.contains_key(key)
  }

  /// Inserts `val` at `key`, returning whatever was there before.
  pub async fn insert(&self, key: K, val: V) -> Option<V> {
    self.0.write().await.insert(key, val)
  }

  pub async fn remove(&self, key: &K) -> Option<V> {
    self.0.write().await.remove(key)
  }

  pub async fn len(&self) -> usize {
    self.0.read().await.len()
  }

  pub async fn is_empty(&self) -> bool {
    self.len().await == 0
  }

  pub async fn get_entries(&self) -> Vec<(K, V)> {
    self
      .0
      .read()
      .await
      .iter()
      .map(|(k, v)| (k.clone(), v.clone()))
      .collect()
  }

  /// Removes the entry at `key` only if its current value satisfies
  /// `predicate`, returning it. Used by `HostRegistry` teardown: drop
  /// a host this connection claimed only if it still points at that
  /// connection — one already reassigned elsewhere is left alone.
  pub async fn remove_if(
    &self,
    key: &K,
    mut predicate: impl FnMut(&V) -> bool,
  ) -> Option<V> {
    let mut guard = self.0.write().await;
    if guard.get(key).is_some_and(&mut predicate) {
      guard.remove(key)
    } else {
      None
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn insert_get_remove_round_trip() {
    let cache: CloneCache<String, i32> = CloneCache::new();
    assert_eq!(cache.insert("a".into(), 1).await, None);
    assert_eq!(cache.get(&"a".to_string()).await, Some(1));
    assert_eq!(cache.insert("a".into(), 2).await, Some(1));
    assert_eq!(cache.remove(&"a".to_string()).await, Some(2));
    assert_eq!(cache.get(&"a".to_string()).await, None);
  }

  #[tokio::test]
  async fn remove_if_leaves_entry_whose_value_no_longer_matches() {
    let cache: CloneCache<String, u32> = CloneCache::new();
    cache.insert("x.test".into(), 1).await;
    // Connection 1 is displaced by connection 2 for the same host.
    cache.insert("x.test".into(), 2).await;
    cache.insert("y.test".into(), 1).await;
    // Connection 1 tears down: only hosts still pointing at it go.
    assert_eq!(
      cache.remove_if(&"x.test".to_string(), |owner| *owner == 1).await,
      None
    );
    assert_eq!(
      cache.remove_if(&"y.test".to_string(), |owner| *owner == 1).await,
      Some(1)
    );
    assert_eq!(cache.get(&"x.test".to_string()).await, Some(2));
    assert_eq!(cache.get(&"y.test".to_string()).await, None);
  }
}
