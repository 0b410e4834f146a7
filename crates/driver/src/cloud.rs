use async_trait::async_trait;
use csi_coordination::BlockDeviceMapping;
use std::collections::HashMap;
use thiserror::Error;

/// The parts of a compute instance the driver cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
  instance_id: String,
  block_device_mappings: Vec<BlockDeviceMapping>,
}

impl Instance {
  pub fn new(
    instance_id: impl Into<String>,
    block_device_mappings: impl IntoIterator<Item = BlockDeviceMapping>,
  ) -> Self {
    Self {
      instance_id: instance_id.into(),
      block_device_mappings: block_device_mappings.into_iter().collect(),
    }
  }

  #[inline]
  pub fn instance_id(&self) -> &str {
    &self.instance_id
  }

  /// Devices currently attached to the instance. May lag behind attach and
  /// detach calls that were just made.
  #[inline]
  pub fn block_device_mappings(&self) -> &[BlockDeviceMapping] {
    &self.block_device_mappings
  }
}

/// A requested change to a volume. Identical modifications submitted close
/// together are sent upstream once.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VolumeModification {
  pub volume_id: String,
  pub size_gib: Option<u64>,
  pub iops: Option<u32>,
  pub throughput: Option<u32>,
  pub volume_type: Option<String>,
}

impl VolumeModification {
  pub fn new(volume_id: impl Into<String>) -> Self {
    Self {
      volume_id: volume_id.into(),
      size_gib: None,
      iops: None,
      throughput: None,
      volume_type: None,
    }
  }

  pub fn is_empty(&self) -> bool {
    self.size_gib.is_none()
      && self.iops.is_none()
      && self.throughput.is_none()
      && self.volume_type.is_none()
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModificationState {
  Modifying,
  Optimizing,
  Completed,
  Failed,
}

#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CloudError {
  #[error("Instance not found: {0}")]
  InstanceNotFound(String),

  #[error("Volume not found: {0}")]
  VolumeNotFound(String),

  /// The provider rejected the call because of request rate limits.
  #[error("Request throttled: {0}")]
  Throttled(String),

  #[error("Cloud request failed: {0}")]
  Other(String),
}

/// Cloud is the block storage provider the driver talks to.
///
/// Implementations must be safe to call concurrently; in particular
/// [modify_volumes](Cloud::modify_volumes) may be running for several
/// batches at once.
#[async_trait]
pub trait Cloud: Send + Sync + 'static {
  async fn describe_instance(&self, instance_id: &str) -> Result<Instance, CloudError>;

  /// Attaches the volume at `device_path` and returns once the provider
  /// reports it attached.
  async fn attach_disk(
    &self,
    volume_id: &str,
    instance_id: &str,
    device_path: &str,
  ) -> Result<(), CloudError>;

  async fn detach_disk(&self, volume_id: &str, instance_id: &str) -> Result<(), CloudError>;

  /// Applies a batch of modifications in one call. Volumes the provider
  /// does not know about are left out of the returned map.
  async fn modify_volumes(
    &self,
    modifications: Vec<VolumeModification>,
  ) -> Result<HashMap<VolumeModification, ModificationState>, CloudError>;
}
