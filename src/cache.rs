//! Single-value cache with a time-to-live, used for the daily quote.

use std::time::{Duration, Instant};

use tokio::sync::RwLock;

pub struct TtlCache<T> {
  ttl: Duration,
  slot: RwLock<Option<(Instant, T)>>,
}

impl<T: Clone> TtlCache<T> {
  pub fn new(ttl: Duration) -> Self {
    Self { ttl, slot: RwLock::new(None) }
  }

  /// Cached value if it is younger than the TTL.
  pub async fn get(&self) -> Option<T> {
    let guard = self.slot.read().await;
    match guard.as_ref() {
      Some((at, value)) if at.elapsed() < self.ttl => Some(value.clone()),
      _ => None,
    }
  }

  pub async fn put(&self, value: T) {
    *self.slot.write().await = Some((Instant::now(), value));
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn fresh_value_is_served() {
    let cache = TtlCache::new(Duration::from_secs(3600));
    assert_eq!(cache.get().await, None::<String>);
    cache.put("carpe diem".to_string()).await;
    assert_eq!(cache.get().await.as_deref(), Some("carpe diem"));
  }

  #[tokio::test]
  async fn zero_ttl_never_hits() {
    let cache = TtlCache::new(Duration::ZERO);
    cache.put(1u32).await;
    assert_eq!(cache.get().await, None);
  }
}
