use crate::{
  cloud::{CloudError, ModificationState, VolumeModification},
  utils::required,
};
use csi_coordination::BatchError;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct ModifyVolumeRequest {
  modification: VolumeModification,
}

impl ModifyVolumeRequest {
  /// Builds a request from a modification. At least one property must be
  /// changed.
  pub fn new(modification: VolumeModification) -> Result<Self, tonic::Status> {
    let VolumeModification {
      volume_id,
      size_gib,
      iops,
      throughput,
      volume_type,
    } = modification;
    let volume_id = required(volume_id, "ModifyVolumeRequest.volume_id")?;
    let modification = VolumeModification {
      volume_id,
      size_gib,
      iops,
      throughput,
      volume_type,
    };

    if modification.is_empty() {
      return Err(tonic::Status::invalid_argument(
        "ModifyVolumeRequest does not modify anything",
      ));
    }

    Ok(Self { modification })
  }

  #[inline]
  pub fn volume_id(&self) -> &str {
    &self.modification.volume_id
  }

  #[inline]
  pub fn modification(&self) -> &VolumeModification {
    &self.modification
  }

  pub(crate) fn into_modification(self) -> VolumeModification {
    self.modification
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModifyVolumeResponse {
  state: ModificationState,
}

impl ModifyVolumeResponse {
  pub(crate) fn new(state: ModificationState) -> Self {
    Self { state }
  }

  #[inline]
  pub fn state(&self) -> ModificationState {
    self.state
  }
}

#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ModifyVolumeError {
  /// Indicates that a volume corresponding to the specified `volume_id` does not exist.
  #[error("Volume does not exist: {0}")]
  VolumeNotFound(String),

  /// The provider is rate limiting modifications. Retrying later may succeed.
  #[error("Modification throttled: {0}")]
  Throttled(String),

  #[error(transparent)]
  #[doc(hidden)]
  Other(#[from] tonic::Status),
}

impl From<BatchError> for ModifyVolumeError {
  fn from(value: BatchError) -> Self {
    use tonic::Status;

    match &value {
      BatchError::Closed => ModifyVolumeError::Other(Status::unavailable(value.to_string())),
      BatchError::Execute(e) => match e.downcast_ref::<CloudError>() {
        Some(CloudError::VolumeNotFound(v)) => ModifyVolumeError::VolumeNotFound(v.clone()),
        Some(CloudError::Throttled(v)) => ModifyVolumeError::Throttled(v.clone()),
        _ => ModifyVolumeError::Other(Status::internal(value.to_string())),
      },
      _ => ModifyVolumeError::Other(Status::internal(value.to_string())),
    }
  }
}

impl From<ModifyVolumeError> for tonic::Status {
  fn from(value: ModifyVolumeError) -> Self {
    use tonic::{Code, Status};

    match value {
      ModifyVolumeError::VolumeNotFound(v) => Status::new(Code::NotFound, v),
      ModifyVolumeError::Throttled(v) => Status::new(Code::Unavailable, v),
      ModifyVolumeError::Other(v) => v,
    }
  }
}
