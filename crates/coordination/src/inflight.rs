use std::{
  collections::HashSet,
  fmt,
  sync::{Mutex, MutexGuard, PoisonError},
};
use tracing::debug;

/// InFlight tracks the resource keys (volume IDs, volume/node pairs, ...)
/// that currently have an operation running against them.
///
/// There is no queueing: a second operation on a key that is already
/// present is rejected and the caller is expected to report the request
/// as "already in progress" so the CO retries later.
#[derive(Default)]
pub struct InFlight {
  keys: Mutex<HashSet<String>>,
}

impl InFlight {
  pub fn new() -> Self {
    Self::default()
  }

  fn keys(&self) -> MutexGuard<'_, HashSet<String>> {
    self.keys.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Insert marks `key` as in-flight. Returns false if an operation on
  /// `key` is already running, in which case nothing is changed.
  ///
  /// Every successful insert must be paired with exactly one
  /// [delete](InFlight::delete). Prefer [try_acquire](InFlight::try_acquire),
  /// which pairs them automatically.
  pub fn insert(&self, key: &str) -> bool {
    let mut keys = self.keys();
    if keys.contains(key) {
      drop(keys);
      debug!(key, "operation already in flight");
      return false;
    }

    keys.insert(key.to_owned())
  }

  /// Delete removes `key` unconditionally.
  pub fn delete(&self, key: &str) {
    self.keys().remove(key);
  }

  #[inline]
  pub fn contains(&self, key: &str) -> bool {
    self.keys().contains(key)
  }

  #[inline]
  pub fn len(&self) -> usize {
    self.keys().len()
  }

  #[inline]
  pub fn is_empty(&self) -> bool {
    self.keys().is_empty()
  }

  /// Marks `key` as in-flight and returns a guard that releases it when
  /// dropped, on every exit path (including unwinding). Returns `None` if
  /// the key is already in flight.
  pub fn try_acquire(&self, key: impl Into<String>) -> Option<InFlightGuard<'_>> {
    let key = key.into();
    if self.insert(&key) {
      Some(InFlightGuard {
        inflight: self,
        key,
      })
    } else {
      None
    }
  }
}

impl fmt::Debug for InFlight {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("InFlight")
      .field("keys", &format!("length={}", self.len()))
      .finish()
  }
}

pub struct InFlightGuard<'a> {
  inflight: &'a InFlight,
  key: String,
}

impl InFlightGuard<'_> {
  #[inline]
  pub fn key(&self) -> &str {
    &self.key
  }
}

impl fmt::Debug for InFlightGuard<'_> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_tuple("InFlightGuard").field(&self.key).finish()
  }
}

impl Drop for InFlightGuard<'_> {
  fn drop(&mut self) {
    self.inflight.delete(&self.key);
  }
}
