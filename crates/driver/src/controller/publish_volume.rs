use crate::{cloud::CloudError, utils::required};
use csi_coordination::DeviceError;
use std::collections::HashMap;
use thiserror::Error;

/// Publish context key carrying the host path of the attached device.
pub const DEVICE_PATH_KEY: &str = "devicePath";

#[derive(Debug, Clone)]
pub struct ControllerPublishVolumeRequest {
  volume_id: String,
  node_id: String,
}

impl ControllerPublishVolumeRequest {
  pub fn new(
    volume_id: impl Into<String>,
    node_id: impl Into<String>,
  ) -> Result<Self, tonic::Status> {
    let volume_id = required(
      volume_id.into(),
      "ControllerPublishVolumeRequest.volume_id",
    )?;
    let node_id = required(node_id.into(), "ControllerPublishVolumeRequest.node_id")?;

    Ok(Self { volume_id, node_id })
  }

  /// The ID of the volume to be used on a node.
  #[inline]
  pub fn volume_id(&self) -> &str {
    &self.volume_id
  }

  /// The ID of the node, which is the ID of the compute instance.
  #[inline]
  pub fn node_id(&self) -> &str {
    &self.node_id
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerPublishVolumeResponse {
  publish_context: HashMap<String, String>,
}

impl ControllerPublishVolumeResponse {
  pub(crate) fn new(device_path: String) -> Self {
    let mut publish_context = HashMap::with_capacity(1);
    publish_context.insert(DEVICE_PATH_KEY.to_owned(), device_path);

    Self { publish_context }
  }

  /// Opaque publish properties, passed on to `NodeStageVolume`.
  #[inline]
  pub fn publish_context(&self) -> &HashMap<String, String> {
    &self.publish_context
  }

  #[inline]
  pub fn device_path(&self) -> Option<&str> {
    self.publish_context.get(DEVICE_PATH_KEY).map(String::as_str)
  }
}

#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ControllerPublishVolumeError {
  /// Another operation on the same volume and node is still running.
  #[error("An operation with the given volume is already in progress: {0}")]
  AlreadyInProgress(String),

  /// Indicates that a volume corresponding to the specified `volume_id` does not exist.
  #[error("Volume does not exist: {0}")]
  VolumeDoesNotExist(String),

  /// Indicates that a node corresponding to the specified `node_id` does not exist.
  #[error("Node does not exist: {0}")]
  NodeDoesNotExist(String),

  /// Indicates that the maximum supported number of volumes that can be attached to the
  /// specified node are already attached. Therefore, this operation will fail until at
  /// least one of the existing attached volumes is detached from the node.
  #[error("Max volumes attached: {0}")]
  MaxVolumesAttached(String),

  #[error(transparent)]
  #[doc(hidden)]
  Other(#[from] tonic::Status),
}

impl From<DeviceError> for ControllerPublishVolumeError {
  fn from(value: DeviceError) -> Self {
    match value {
      DeviceError::MaxVolumesAttached { .. } => {
        ControllerPublishVolumeError::MaxVolumesAttached(value.to_string())
      }
      value => ControllerPublishVolumeError::Other(tonic::Status::internal(value.to_string())),
    }
  }
}

impl From<CloudError> for ControllerPublishVolumeError {
  fn from(value: CloudError) -> Self {
    match value {
      CloudError::VolumeNotFound(v) => ControllerPublishVolumeError::VolumeDoesNotExist(v),
      CloudError::InstanceNotFound(v) => ControllerPublishVolumeError::NodeDoesNotExist(v),
      value => ControllerPublishVolumeError::Other(tonic::Status::internal(value.to_string())),
    }
  }
}

impl From<ControllerPublishVolumeError> for tonic::Status {
  fn from(value: ControllerPublishVolumeError) -> tonic::Status {
    use tonic::{Code, Status};

    match value {
      ControllerPublishVolumeError::AlreadyInProgress(v) => Status::new(Code::Aborted, v),
      ControllerPublishVolumeError::VolumeDoesNotExist(v) => Status::new(Code::NotFound, v),
      ControllerPublishVolumeError::NodeDoesNotExist(v) => Status::new(Code::NotFound, v),
      ControllerPublishVolumeError::MaxVolumesAttached(v) => {
        Status::new(Code::ResourceExhausted, v)
      }
      ControllerPublishVolumeError::Other(v) => v,
    }
  }
}
