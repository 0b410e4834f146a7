use once_cell::sync::Lazy;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// Slot names currently in use on an instance, mapped to the volume that
/// holds them.
pub type ExistingNames = HashMap<String, String>;

/// Candidate slot suffixes, in allocation order: `ba..bz` then `ca..cz`.
/// `a` is left alone as the first letter so root and ephemeral devices
/// (`xvda`, `sda1`, ...) never collide with an allocation.
static DEVICE_NAMES: Lazy<Vec<String>> = Lazy::new(|| {
  let mut names = Vec::with_capacity(2 * 26);
  for first in &['b', 'c'] {
    for second in b'a'..=b'z' {
      let mut name = String::with_capacity(2);
      name.push(*first);
      name.push(second as char);
      names.push(name);
    }
  }

  names
});

#[inline]
pub(crate) fn device_names() -> &'static [String] {
  &DEVICE_NAMES
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[error("there are no names available")]
pub struct NamesExhausted;

/// NameAllocator picks the next free slot for one instance.
///
/// Slots that were recently released can be deprioritized: the next
/// allocation only hands them out once every other free slot has been
/// passed over, after which they return to normal priority.
#[derive(Debug, Default)]
pub(crate) struct NameAllocator {
  deprioritized: HashSet<String>,
}

impl NameAllocator {
  pub(crate) fn new() -> Self {
    Self::default()
  }

  pub(crate) fn get_next(&mut self, existing: &ExistingNames) -> Result<String, NamesExhausted> {
    let deprioritized = std::mem::take(&mut self.deprioritized);
    let free = || {
      device_names()
        .iter()
        .filter(|name| !existing.contains_key(name.as_str()))
    };

    free()
      .find(|name| !deprioritized.contains(name.as_str()))
      .or_else(|| free().next())
      .cloned()
      .ok_or(NamesExhausted)
  }

  pub(crate) fn deprioritize(&mut self, name: &str) {
    self.deprioritized.insert(name.to_owned());
  }

  #[cfg(test)]
  pub(crate) fn is_deprioritized(&self, name: &str) -> bool {
    self.deprioritized.contains(name)
  }
}
