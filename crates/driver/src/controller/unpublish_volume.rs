use crate::{cloud::CloudError, utils::required};
use thiserror::Error;
use tonic::{Code, Status};

#[derive(Debug, Clone)]
pub struct ControllerUnpublishVolumeRequest {
  volume_id: String,
  node_id: String,
}

impl ControllerUnpublishVolumeRequest {
  pub fn new(volume_id: impl Into<String>, node_id: impl Into<String>) -> Result<Self, Status> {
    let volume_id = required(
      volume_id.into(),
      "ControllerUnpublishVolumeRequest.volume_id",
    )?;
    let node_id = required(node_id.into(), "ControllerUnpublishVolumeRequest.node_id")?;

    Ok(Self { volume_id, node_id })
  }

  #[inline]
  pub fn volume_id(&self) -> &str {
    &self.volume_id
  }

  #[inline]
  pub fn node_id(&self) -> &str {
    &self.node_id
  }
}

#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ControllerUnpublishVolumeError {
  /// Another operation on the same volume and node is still running.
  #[error("An operation with the given volume is already in progress: {0}")]
  AlreadyInProgress(String),

  #[error(transparent)]
  #[doc(hidden)]
  Other(#[from] tonic::Status),
}

impl From<CloudError> for ControllerUnpublishVolumeError {
  fn from(value: CloudError) -> Self {
    ControllerUnpublishVolumeError::Other(Status::internal(value.to_string()))
  }
}

impl From<ControllerUnpublishVolumeError> for tonic::Status {
  fn from(value: ControllerUnpublishVolumeError) -> Self {
    match value {
      ControllerUnpublishVolumeError::Other(v) => v,
      value => {
        let code = match &value {
          ControllerUnpublishVolumeError::AlreadyInProgress(_) => Code::Aborted,
          ControllerUnpublishVolumeError::Other(_) => unreachable!(),
        };

        Status::new(code, value.to_string())
      }
    }
  }
}
