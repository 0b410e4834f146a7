mod allocator;

use allocator::{ExistingNames, NameAllocator};
use std::{
  collections::HashMap,
  fmt,
  sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use thiserror::Error;
use tracing::{debug, instrument, warn};

pub use allocator::NamesExhausted;

/// Host path prefix allocated slots are exposed under.
pub const DEVICE_PATH_PREFIX: &str = "/dev/xvd";

const DEVICE_NAME_PREFIXES: &[&str] = &["/dev/xvd", "/dev/sd"];

pub type Result<T> = std::result::Result<T, DeviceError>;

#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
  /// Every candidate slot on the instance is either attached or reserved.
  /// This will not resolve itself until a volume is detached.
  #[error("too many volumes attached to instance {instance_id}")]
  MaxVolumesAttached { instance_id: String },
}

/// One entry of an instance's block device inventory, as reported by the
/// cloud provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlockDeviceMapping {
  device_name: String,
  volume_id: String,
}

impl BlockDeviceMapping {
  pub fn new(device_name: impl Into<String>, volume_id: impl Into<String>) -> Self {
    Self {
      device_name: device_name.into(),
      volume_id: volume_id.into(),
    }
  }

  /// Device name as reported by the provider, e.g. `/dev/xvdba`.
  #[inline]
  pub fn device_name(&self) -> &str {
    &self.device_name
  }

  #[inline]
  pub fn volume_id(&self) -> &str {
    &self.volume_id
  }
}

/// Strips the vendor device prefix, leaving the bare slot name.
pub fn normalize_device_name(device_name: &str) -> &str {
  DEVICE_NAME_PREFIXES
    .iter()
    .find_map(|prefix| device_name.strip_prefix(prefix))
    .unwrap_or(device_name)
}

// Lowest slot held by `volume_id`, if any.
fn slot_of(names: &ExistingNames, volume_id: &str) -> Option<String> {
  names
    .iter()
    .filter(|(_, v)| *v == volume_id)
    .map(|(name, _)| name)
    .min()
    .cloned()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
  instance_id: String,
  volume_id: String,
  name: String,
  is_already_assigned: bool,
}

impl Device {
  #[inline]
  pub fn instance_id(&self) -> &str {
    &self.instance_id
  }

  #[inline]
  pub fn volume_id(&self) -> &str {
    &self.volume_id
  }

  /// The slot name, e.g. `ba`.
  #[inline]
  pub fn name(&self) -> &str {
    &self.name
  }

  /// The host path the volume is (or will be) attached at.
  pub fn path(&self) -> String {
    format!("{}{}", DEVICE_PATH_PREFIX, self.name)
  }

  /// Whether the volume already held this slot, either attached or
  /// reserved by an earlier call.
  #[inline]
  pub fn is_already_assigned(&self) -> bool {
    self.is_already_assigned
  }
}

#[derive(Default)]
struct Inner {
  allocators: HashMap<String, Arc<Mutex<NameAllocator>>>,
  /// instance ID -> slot name -> volume ID, for slots handed out but not
  /// yet confirmed attached.
  attaching: HashMap<String, ExistingNames>,
}

impl Inner {
  fn allocator(&mut self, instance_id: &str) -> Arc<Mutex<NameAllocator>> {
    self
      .allocators
      .entry(instance_id.to_owned())
      .or_insert_with(|| Arc::new(Mutex::new(NameAllocator::new())))
      .clone()
  }

  fn assignments(&self, instance_id: &str, mut inventory: ExistingNames) -> ExistingNames {
    if let Some(attaching) = self.attaching.get(instance_id) {
      for (name, volume_id) in attaching {
        match inventory.get(name) {
          None => {
            inventory.insert(name.clone(), volume_id.clone());
          }
          Some(attached) if attached != volume_id => warn!(
            instance_id,
            device = %name,
            %attached,
            reserved = %volume_id,
            "device reserved for one volume but attached to another"
          ),
          Some(_) => (),
        }
      }
    }

    inventory
  }
}

/// DeviceManager hands out device slots for volume attachments and
/// remembers which slots are reserved but not yet attached.
///
/// Locks are always taken manager first, then the per-instance allocator.
#[derive(Default)]
pub struct DeviceManager {
  inner: Mutex<Inner>,
}

impl DeviceManager {
  pub fn new() -> Self {
    Self::default()
  }

  fn inner(&self) -> MutexGuard<'_, Inner> {
    self.inner.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Finds the slot `volume_id` holds on `instance_id`, looking at both
  /// the `attached` inventory and this manager's pending reservations.
  ///
  /// If there is none and `assign` is set, a free slot is reserved for the
  /// volume until [end_attaching](DeviceManager::end_attaching) is called.
  /// Returns `Ok(None)` only when `assign` is not set.
  #[instrument(name = "device_manager.get_device", skip(self, attached))]
  pub fn get_device(
    &self,
    instance_id: &str,
    attached: &[BlockDeviceMapping],
    volume_id: &str,
    assign: bool,
  ) -> Result<Option<Device>> {
    let inventory = attached
      .iter()
      .map(|m| {
        (
          normalize_device_name(m.device_name()).to_owned(),
          m.volume_id().to_owned(),
        )
      })
      .collect::<ExistingNames>();

    let attached_as = slot_of(&inventory, volume_id);
    let mut inner = self.inner();
    let assignments = inner.assignments(instance_id, inventory);

    if let Some(name) = attached_as.or_else(|| slot_of(&assignments, volume_id)) {
      debug!(device = %name, "volume already assigned");
      return Ok(Some(Device {
        instance_id: instance_id.to_owned(),
        volume_id: volume_id.to_owned(),
        name,
        is_already_assigned: true,
      }));
    }

    if !assign {
      return Ok(None);
    }

    let allocator = inner.allocator(instance_id);
    let name = allocator
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .get_next(&assignments)
      .map_err(|NamesExhausted| DeviceError::MaxVolumesAttached {
        instance_id: instance_id.to_owned(),
      })?;

    inner
      .attaching
      .entry(instance_id.to_owned())
      .or_default()
      .insert(name.clone(), volume_id.to_owned());

    debug!(device = %name, "device reserved");
    Ok(Some(Device {
      instance_id: instance_id.to_owned(),
      volume_id: volume_id.to_owned(),
      name,
      is_already_assigned: false,
    }))
  }

  /// Drops the reservation of `name` on `instance_id`, but only while it
  /// still belongs to `volume_id`. Returns whether a reservation was removed.
  ///
  /// A slot owned by another volume means a newer allocation reused it
  /// after a slow confirmation; that is logged and otherwise ignored.
  pub fn end_attaching(&self, instance_id: &str, volume_id: &str, name: &str) -> bool {
    let name = normalize_device_name(name);
    let mut inner = self.inner();
    let attaching = match inner.attaching.get_mut(instance_id) {
      None => return false,
      Some(v) => v,
    };

    match attaching.get(name) {
      Some(v) if v == volume_id => (),
      Some(other) => {
        warn!(
          instance_id,
          volume_id,
          device = name,
          reserved_for = %other,
          "device reservation belongs to another volume, leaving it in place"
        );
        return false;
      }
      None => return false,
    }

    attaching.remove(name);
    if attaching.is_empty() {
      inner.attaching.remove(instance_id);
    }

    true
  }

  /// Returns a guard that calls [end_attaching](DeviceManager::end_attaching)
  /// for `device` when dropped, on every exit path of the attach including
  /// the future being cancelled.
  pub fn reservation(&self, device: &Device) -> Reservation<'_> {
    Reservation {
      manager: self,
      instance_id: device.instance_id.clone(),
      volume_id: device.volume_id.clone(),
      name: device.name.clone(),
    }
  }

  /// Makes the next allocation on `instance_id` avoid `name` unless no
  /// other slot is free. Reservations are left untouched.
  pub fn deprioritize_device(&self, instance_id: &str, name: &str) {
    let name = normalize_device_name(name);
    let allocator = self.inner().allocator(instance_id);
    allocator
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .deprioritize(name);
  }
}

#[must_use = "the reservation ends as soon as the guard is dropped"]
pub struct Reservation<'a> {
  manager: &'a DeviceManager,
  instance_id: String,
  volume_id: String,
  name: String,
}

impl fmt::Debug for Reservation<'_> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Reservation")
      .field("instance_id", &self.instance_id)
      .field("volume_id", &self.volume_id)
      .field("name", &self.name)
      .finish()
  }
}

impl Drop for Reservation<'_> {
  fn drop(&mut self) {
    self
      .manager
      .end_attaching(&self.instance_id, &self.volume_id, &self.name);
  }
}

impl fmt::Debug for DeviceManager {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let inner = self.inner();
    f.debug_struct("DeviceManager")
      .field("instances", &inner.allocators.len())
      .field(
        "attaching",
        &inner.attaching.values().map(HashMap::len).sum::<usize>(),
      )
      .finish()
  }
}
