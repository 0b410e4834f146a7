use crate::cloud::{Cloud, CloudError, Instance, ModificationState, VolumeModification};
use async_trait::async_trait;
use csi_coordination::{devicemanager::normalize_device_name, BlockDeviceMapping};
use std::{
  collections::{HashMap, HashSet},
  sync::{Mutex, MutexGuard, PoisonError},
  time::Duration,
};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeAction {
  Attach {
    volume_id: String,
    instance_id: String,
    device_path: String,
  },

  Detach {
    volume_id: String,
    instance_id: String,
  },

  Modify {
    modifications: Vec<VolumeModification>,
  },
}

type AttachFunc = Box<dyn Fn(&str, &str) -> Option<CloudError> + Send>;

#[derive(Default)]
struct FakeCloudInner {
  instances: HashMap<String, Vec<BlockDeviceMapping>>,
  volumes: HashSet<String>,
  log: Vec<FakeAction>,
  attach_func: Option<AttachFunc>,
  attach_delay: Option<Duration>,
  stale_detach: bool,
}

/// In-memory [Cloud] that records every mutating call.
#[derive(Default)]
pub struct FakeCloud(Mutex<FakeCloudInner>);

impl FakeCloud {
  pub fn new() -> Self {
    Self::default()
  }

  fn inner(&self) -> MutexGuard<'_, FakeCloudInner> {
    self.0.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn add_instance(
    &self,
    instance_id: impl Into<String>,
    mappings: impl IntoIterator<Item = BlockDeviceMapping>,
  ) {
    self
      .inner()
      .instances
      .insert(instance_id.into(), mappings.into_iter().collect());
  }

  pub fn add_volume(&self, volume_id: impl Into<String>) {
    self.inner().volumes.insert(volume_id.into());
  }

  /// Called with `(volume_id, instance_id)` before every attach; returning
  /// an error fails the attach.
  pub fn set_attach_func(&self, f: impl Fn(&str, &str) -> Option<CloudError> + Send + 'static) {
    self.inner().attach_func = Some(Box::new(f));
  }

  pub fn set_attach_delay(&self, delay: Duration) {
    self.inner().attach_delay = Some(delay);
  }

  /// When set, detaching leaves the device in the instance inventory, like a
  /// provider whose describe calls have not caught up yet.
  pub fn set_stale_detach(&self, stale: bool) {
    self.inner().stale_detach = stale;
  }

  pub fn reset_log(&self) {
    self.inner().log.clear();
  }

  pub fn get_log(&self) -> Vec<FakeAction> {
    self.inner().log.clone()
  }
}

#[async_trait]
impl Cloud for FakeCloud {
  async fn describe_instance(&self, instance_id: &str) -> Result<Instance, CloudError> {
    let inner = self.inner();
    let mappings = inner
      .instances
      .get(instance_id)
      .ok_or_else(|| CloudError::InstanceNotFound(instance_id.to_owned()))?;

    Ok(Instance::new(instance_id, mappings.iter().cloned()))
  }

  async fn attach_disk(
    &self,
    volume_id: &str,
    instance_id: &str,
    device_path: &str,
  ) -> Result<(), CloudError> {
    let delay = self.inner().attach_delay;
    if let Some(delay) = delay {
      tokio::time::sleep(delay).await;
    }

    let mut inner = self.inner();
    if !inner.volumes.contains(volume_id) {
      return Err(CloudError::VolumeNotFound(volume_id.to_owned()));
    }

    if !inner.instances.contains_key(instance_id) {
      return Err(CloudError::InstanceNotFound(instance_id.to_owned()));
    }

    if let Some(e) = inner
      .attach_func
      .as_ref()
      .and_then(|f| f(volume_id, instance_id))
    {
      return Err(e);
    }

    let slot = normalize_device_name(device_path);
    let mappings = inner.instances.entry(instance_id.to_owned()).or_default();
    if mappings
      .iter()
      .any(|m| normalize_device_name(m.device_name()) == slot)
    {
      return Err(CloudError::Other(format!(
        "device {} is already in use on {}",
        device_path, instance_id
      )));
    }

    mappings.push(BlockDeviceMapping::new(device_path, volume_id));
    info!("Fake cloud: attached {} to {} at {}", volume_id, instance_id, device_path);
    inner.log.push(FakeAction::Attach {
      volume_id: volume_id.to_owned(),
      instance_id: instance_id.to_owned(),
      device_path: device_path.to_owned(),
    });

    Ok(())
  }

  async fn detach_disk(&self, volume_id: &str, instance_id: &str) -> Result<(), CloudError> {
    let mut inner = self.inner();
    let stale = inner.stale_detach;
    let mappings = inner
      .instances
      .get_mut(instance_id)
      .ok_or_else(|| CloudError::InstanceNotFound(instance_id.to_owned()))?;

    if !mappings.iter().any(|m| m.volume_id() == volume_id) {
      return Err(CloudError::VolumeNotFound(volume_id.to_owned()));
    }

    if !stale {
      mappings.retain(|m| m.volume_id() != volume_id);
    }

    info!("Fake cloud: detached {} from {}", volume_id, instance_id);
    inner.log.push(FakeAction::Detach {
      volume_id: volume_id.to_owned(),
      instance_id: instance_id.to_owned(),
    });

    Ok(())
  }

  async fn modify_volumes(
    &self,
    modifications: Vec<VolumeModification>,
  ) -> Result<HashMap<VolumeModification, ModificationState>, CloudError> {
    let mut inner = self.inner();
    inner.log.push(FakeAction::Modify {
      modifications: modifications.clone(),
    });

    let states = modifications
      .into_iter()
      .filter(|m| inner.volumes.contains(&m.volume_id))
      .map(|m| (m, ModificationState::Optimizing))
      .collect();

    Ok(states)
  }
}
