use std::{env, fmt::Display, num::NonZeroUsize, str::FromStr, time::Duration};
use tracing::warn;

pub const MODIFY_VOLUME_BATCH_SIZE_ENV: &str = "CSI_MODIFY_VOLUME_BATCH_SIZE";
pub const MODIFY_VOLUME_MAX_DELAY_ENV: &str = "CSI_MODIFY_VOLUME_MAX_DELAY_MS";

const DEFAULT_MODIFY_VOLUME_BATCH_SIZE: usize = 500;

// Kept well below the timeouts of the external resizer and attacher, so a
// batched request still answers before the CO gives up on it.
const DEFAULT_MODIFY_VOLUME_MAX_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverOptions {
  /// Number of distinct volume modifications that forces a batch out.
  pub modify_volume_batch_size: NonZeroUsize,

  /// How long a volume modification may wait for others to join its batch.
  pub modify_volume_max_delay: Duration,
}

impl Default for DriverOptions {
  fn default() -> Self {
    Self {
      modify_volume_batch_size: NonZeroUsize::new(DEFAULT_MODIFY_VOLUME_BATCH_SIZE)
        .unwrap_or(NonZeroUsize::MIN),
      modify_volume_max_delay: DEFAULT_MODIFY_VOLUME_MAX_DELAY,
    }
  }
}

impl DriverOptions {
  /// Defaults, overridden by any `CSI_*` environment variables that are set.
  pub fn from_env() -> Self {
    Self::from_lookup(|name| env::var(name).ok())
  }

  fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
    let mut options = Self::default();

    if let Some(v) = parse::<NonZeroUsize>(&lookup, MODIFY_VOLUME_BATCH_SIZE_ENV) {
      options.modify_volume_batch_size = v;
    }

    if let Some(v) = parse::<u64>(&lookup, MODIFY_VOLUME_MAX_DELAY_ENV) {
      options.modify_volume_max_delay = Duration::from_millis(v);
    }

    options
  }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T>
where
  T: FromStr,
  T::Err: Display,
{
  let raw = lookup(name)?;
  match raw.trim().parse() {
    Ok(v) => Some(v),
    Err(e) => {
      warn!(name, value = %raw, "ignoring invalid option: {}", e);
      None
    }
  }
}
