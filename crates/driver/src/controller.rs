mod modify_volume;
mod publish_volume;
mod unpublish_volume;

use crate::{
  cloud::{Cloud, CloudError, ModificationState, VolumeModification},
  options::DriverOptions,
  utils::Record,
};
use csi_coordination::{Batcher, DeviceManager, InFlight};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

pub use modify_volume::*;
pub use publish_volume::*;
pub use unpublish_volume::*;

/// Controller serves the attach, detach and modify calls of the CSI
/// controller service on top of a [Cloud].
///
/// Attach and detach of a volume/node pair are serialized through an
/// in-flight set; concurrent duplicates are rejected rather than queued.
/// Modifications from all callers share one batcher.
pub struct Controller<C: Cloud> {
  cloud: Arc<C>,
  inflight: InFlight,
  devices: DeviceManager,
  modifications: Batcher<VolumeModification, ModificationState>,
}

impl<C: Cloud> Controller<C> {
  /// Must be called from within a tokio runtime.
  pub fn new(cloud: Arc<C>, options: &DriverOptions) -> Self {
    let modifier = cloud.clone();
    let modifications = Batcher::new(
      options.modify_volume_batch_size,
      options.modify_volume_max_delay,
      move |batch: Vec<VolumeModification>| {
        let cloud = modifier.clone();
        async move { cloud.modify_volumes(batch).await }
      },
    );

    Self {
      cloud,
      inflight: InFlight::new(),
      devices: DeviceManager::new(),
      modifications,
    }
  }

  #[inline]
  pub fn cloud(&self) -> &Arc<C> {
    &self.cloud
  }

  #[instrument(
    name = "controller.controller_publish_volume",
    skip(self, request),
    fields(request, response)
  )]
  pub async fn controller_publish_volume(
    &self,
    request: ControllerPublishVolumeRequest,
  ) -> Result<ControllerPublishVolumeResponse, ControllerPublishVolumeError> {
    let request = request.record_request();
    let volume_id = request.volume_id();
    let node_id = request.node_id();

    let _guard = self
      .inflight
      .try_acquire(inflight_key(volume_id, node_id))
      .ok_or_else(|| ControllerPublishVolumeError::AlreadyInProgress(volume_id.to_owned()))?;

    let instance = self.cloud.describe_instance(node_id).await?;
    let device = self
      .devices
      .get_device(node_id, instance.block_device_mappings(), volume_id, true)?
      .ok_or_else(|| tonic::Status::internal("no device was assigned"))?;

    if device.is_already_assigned() {
      debug!(device = %device.path(), "volume already attached");
      return Ok(ControllerPublishVolumeResponse::new(device.path()).record_response());
    }

    // Ends once the attach returns or is abandoned. The inventory then
    // either lists the device or never will.
    let _reservation = self.devices.reservation(&device);
    self
      .cloud
      .attach_disk(volume_id, node_id, &device.path())
      .await?;

    Ok(ControllerPublishVolumeResponse::new(device.path()).record_response())
  }

  #[instrument(
    name = "controller.controller_unpublish_volume",
    skip(self, request),
    fields(request)
  )]
  pub async fn controller_unpublish_volume(
    &self,
    request: ControllerUnpublishVolumeRequest,
  ) -> Result<(), ControllerUnpublishVolumeError> {
    let request = request.record_request();
    let volume_id = request.volume_id();
    let node_id = request.node_id();

    let _guard = self
      .inflight
      .try_acquire(inflight_key(volume_id, node_id))
      .ok_or_else(|| ControllerUnpublishVolumeError::AlreadyInProgress(volume_id.to_owned()))?;

    let instance = match self.cloud.describe_instance(node_id).await {
      Ok(v) => v,
      Err(CloudError::InstanceNotFound(_)) => {
        debug!("instance is gone, volume assumed detached");
        return Ok(());
      }
      Err(e) => return Err(e.into()),
    };

    let device = match self
      .devices
      .get_device(node_id, instance.block_device_mappings(), volume_id, false)
      .map_err(|e| tonic::Status::internal(e.to_string()))?
    {
      Some(v) => v,
      None => {
        debug!("volume is not attached");
        return Ok(());
      }
    };

    match self.cloud.detach_disk(volume_id, node_id).await {
      Ok(()) => (),
      Err(CloudError::VolumeNotFound(_)) => warn!("volume disappeared while detaching"),
      Err(e) => return Err(e.into()),
    }

    self.devices.deprioritize_device(node_id, device.name());
    Ok(())
  }

  /// Queues the modification with every other one requested in the same
  /// window and waits for the batch it ends up in.
  #[instrument(
    name = "controller.modify_volume",
    skip(self, request),
    fields(request, response)
  )]
  pub async fn modify_volume(
    &self,
    request: ModifyVolumeRequest,
  ) -> Result<ModifyVolumeResponse, ModifyVolumeError> {
    let request = request.record_request();
    let volume_id = request.volume_id().to_owned();

    match self.modifications.execute(request.into_modification()).await? {
      Some(state) => Ok(ModifyVolumeResponse::new(state).record_response()),
      None => Err(ModifyVolumeError::VolumeNotFound(volume_id)),
    }
  }

  /// Flushes pending modifications and waits for them to complete.
  pub async fn close(&self) {
    self.modifications.close().await;
  }
}

/// Attach and detach of the same volume/node pair share one key.
fn inflight_key(volume_id: &str, node_id: &str) -> String {
  format!("{}/{}", volume_id, node_id)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::fake::{FakeAction, FakeCloud};
  use csi_coordination::BlockDeviceMapping;
  use std::{num::NonZeroUsize, time::Duration};
  use test_case::test_case;
  use tokio::time;
  use tonic::Code;

  const NODE: &str = "i-0123456789";

  fn controller(cloud: FakeCloud) -> Controller<FakeCloud> {
    let options = DriverOptions {
      modify_volume_batch_size: NonZeroUsize::new(10).unwrap(),
      modify_volume_max_delay: Duration::from_millis(100),
    };

    Controller::new(Arc::new(cloud), &options)
  }

  fn cloud_with(volumes: &[&str]) -> FakeCloud {
    let cloud = FakeCloud::new();
    cloud.add_instance(NODE, vec![BlockDeviceMapping::new("/dev/xvda", "vol-root")]);
    for volume in volumes {
      cloud.add_volume(*volume);
    }

    cloud
  }

  async fn publish(
    controller: &Controller<FakeCloud>,
    volume_id: &str,
  ) -> Result<ControllerPublishVolumeResponse, ControllerPublishVolumeError> {
    let request = ControllerPublishVolumeRequest::new(volume_id, NODE).unwrap();
    controller.controller_publish_volume(request).await
  }

  async fn unpublish(
    controller: &Controller<FakeCloud>,
    volume_id: &str,
  ) -> Result<(), ControllerUnpublishVolumeError> {
    let request = ControllerUnpublishVolumeRequest::new(volume_id, NODE).unwrap();
    controller.controller_unpublish_volume(request).await
  }

  fn code<E: Into<tonic::Status>>(e: E) -> Code {
    e.into().code()
  }

  #[test]
  fn empty_ids_are_rejected() {
    let e = ControllerPublishVolumeRequest::new("", NODE).unwrap_err();
    assert_eq!(e.code(), Code::InvalidArgument);

    let e = ControllerUnpublishVolumeRequest::new("vol-1", "").unwrap_err();
    assert_eq!(e.code(), Code::InvalidArgument);

    let e = ModifyVolumeRequest::new(VolumeModification::new("vol-1")).unwrap_err();
    assert_eq!(e.code(), Code::InvalidArgument);
  }

  #[tokio::test]
  async fn publish_attaches_at_reserved_device() {
    let controller = controller(cloud_with(&["vol-1"]));

    let response = publish(&controller, "vol-1").await.unwrap();
    assert_eq!(response.device_path(), Some("/dev/xvdba"));
    assert_eq!(
      controller.cloud().get_log(),
      vec![FakeAction::Attach {
        volume_id: "vol-1".into(),
        instance_id: NODE.into(),
        device_path: "/dev/xvdba".into(),
      }]
    );
    assert!(controller.inflight.is_empty());
  }

  #[tokio::test]
  async fn publish_is_idempotent() {
    let controller = controller(cloud_with(&["vol-1"]));

    let first = publish(&controller, "vol-1").await.unwrap();
    let second = publish(&controller, "vol-1").await.unwrap();

    assert_eq!(first, second);
    assert_eq!(controller.cloud().get_log().len(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn concurrent_publish_is_rejected() {
    let cloud = cloud_with(&["vol-1"]);
    cloud.set_attach_delay(Duration::from_secs(1));
    let controller = controller(cloud);

    let (first, second) = tokio::join!(publish(&controller, "vol-1"), publish(&controller, "vol-1"));

    assert!(first.is_ok());
    assert_eq!(code(second.unwrap_err()), Code::Aborted);
    assert!(controller.inflight.is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn concurrent_publish_of_different_volumes_gets_distinct_devices() {
    let cloud = cloud_with(&["vol-1", "vol-2", "vol-3"]);
    cloud.set_attach_delay(Duration::from_secs(1));
    let controller = controller(cloud);

    let (a, b, c) = tokio::join!(
      publish(&controller, "vol-1"),
      publish(&controller, "vol-2"),
      publish(&controller, "vol-3"),
    );

    let mut paths = vec![
      a.unwrap().device_path().unwrap().to_owned(),
      b.unwrap().device_path().unwrap().to_owned(),
      c.unwrap().device_path().unwrap().to_owned(),
    ];
    paths.sort();
    assert_eq!(paths, vec!["/dev/xvdba", "/dev/xvdbb", "/dev/xvdbc"]);
  }

  #[tokio::test]
  async fn failed_attach_releases_device() {
    let cloud = cloud_with(&["vol-1", "vol-2"]);
    cloud.set_attach_func(|volume_id, _| {
      if volume_id == "vol-1" {
        Some(CloudError::Other("attachment limit".into()))
      } else {
        None
      }
    });
    let controller = controller(cloud);

    assert_eq!(
      code(publish(&controller, "vol-1").await.unwrap_err()),
      Code::Internal
    );
    let response = publish(&controller, "vol-2").await.unwrap();
    assert_eq!(response.device_path(), Some("/dev/xvdba"));
  }

  #[tokio::test(start_paused = true)]
  async fn cancelled_publish_releases_device() {
    let cloud = cloud_with(&["vol-1"]);
    cloud.set_attach_delay(Duration::from_secs(30));
    let controller = controller(cloud);

    let cancelled = time::timeout(Duration::from_secs(1), publish(&controller, "vol-1")).await;
    assert!(cancelled.is_err());
    assert!(controller.inflight.is_empty());
    assert!(controller.cloud().get_log().is_empty());

    let response = publish(&controller, "vol-1").await.unwrap();
    assert_eq!(response.device_path(), Some("/dev/xvdba"));
    assert_eq!(
      controller.cloud().get_log(),
      vec![FakeAction::Attach {
        volume_id: "vol-1".into(),
        instance_id: NODE.into(),
        device_path: "/dev/xvdba".into(),
      }]
    );
  }

  #[test_case(("vol-1", "i-1"), ("vol-1", "i-1") => true ; "same pair")]
  #[test_case(("vol-1", "i-1"), ("vol-1", "i-2") => false ; "other node")]
  #[test_case(("vol-1", "i-1"), ("vol-1i", "-1") => false ; "ambiguous concatenation")]
  #[test_case(("vol-1", "1i-1"), ("vol-11", "i-1") => false ; "shifted boundary")]
  fn inflight_keys(a: (&str, &str), b: (&str, &str)) -> bool {
    inflight_key(a.0, a.1) == inflight_key(b.0, b.1)
  }

  #[tokio::test]
  async fn publish_missing_volume_or_node() {
    let controller = controller(cloud_with(&[]));

    assert_eq!(
      code(publish(&controller, "vol-404").await.unwrap_err()),
      Code::NotFound
    );

    let request = ControllerPublishVolumeRequest::new("vol-1", "i-404").unwrap();
    let e = controller.controller_publish_volume(request).await.unwrap_err();
    assert!(matches!(e, ControllerPublishVolumeError::NodeDoesNotExist(_)));
  }

  #[tokio::test]
  async fn publish_to_full_instance() {
    let cloud = FakeCloud::new();
    let mappings = (b'b'..=b'c')
      .flat_map(|first| (b'a'..=b'z').map(move |second| (first as char, second as char)))
      .map(|(first, second)| {
        BlockDeviceMapping::new(
          format!("/dev/xvd{}{}", first, second),
          format!("vol-{}{}", first, second),
        )
      })
      .collect::<Vec<_>>();
    cloud.add_instance(NODE, mappings);
    cloud.add_volume("vol-new");
    let controller = controller(cloud);

    let e = publish(&controller, "vol-new").await.unwrap_err();
    assert!(matches!(e, ControllerPublishVolumeError::MaxVolumesAttached(_)));
    assert_eq!(code(e), Code::ResourceExhausted);
  }

  #[tokio::test]
  async fn unpublish_detaches_and_avoids_reuse() {
    let controller = controller(cloud_with(&["vol-1", "vol-2"]));

    publish(&controller, "vol-1").await.unwrap();
    unpublish(&controller, "vol-1").await.unwrap();

    let response = publish(&controller, "vol-2").await.unwrap();
    assert_eq!(response.device_path(), Some("/dev/xvdbb"));
  }

  #[tokio::test]
  async fn unpublish_with_stale_inventory() {
    let cloud = cloud_with(&["vol-1", "vol-2"]);
    cloud.set_stale_detach(true);
    let controller = controller(cloud);

    let first = publish(&controller, "vol-1").await.unwrap();
    unpublish(&controller, "vol-1").await.unwrap();

    let second = publish(&controller, "vol-2").await.unwrap();
    assert_ne!(first.device_path(), second.device_path());
  }

  #[tokio::test]
  async fn unpublish_is_idempotent() {
    let controller = controller(cloud_with(&["vol-1"]));

    unpublish(&controller, "vol-1").await.unwrap();

    let request = ControllerUnpublishVolumeRequest::new("vol-1", "i-404").unwrap();
    controller.controller_unpublish_volume(request).await.unwrap();
    assert!(controller.cloud().get_log().is_empty());
  }

  #[tokio::test]
  async fn unpublish_while_in_flight() {
    let controller = controller(cloud_with(&["vol-1"]));
    let _guard = controller
      .inflight
      .try_acquire(inflight_key("vol-1", NODE))
      .unwrap();

    let e = unpublish(&controller, "vol-1").await.unwrap_err();
    assert_eq!(code(e), Code::Aborted);
  }

  #[tokio::test(start_paused = true)]
  async fn modifications_are_batched() {
    let controller = controller(cloud_with(&["vol-1", "vol-2"]));

    let mut fast = VolumeModification::new("vol-1");
    fast.iops = Some(6000);
    let mut big = VolumeModification::new("vol-2");
    big.size_gib = Some(200);

    let (a, b, c) = tokio::join!(
      controller.modify_volume(ModifyVolumeRequest::new(fast.clone()).unwrap()),
      controller.modify_volume(ModifyVolumeRequest::new(big.clone()).unwrap()),
      controller.modify_volume(ModifyVolumeRequest::new(fast.clone()).unwrap()),
    );

    assert_eq!(a.unwrap().state(), ModificationState::Optimizing);
    assert_eq!(b.unwrap().state(), ModificationState::Optimizing);
    assert_eq!(c.unwrap().state(), ModificationState::Optimizing);

    let log = controller.cloud().get_log();
    assert_eq!(log.len(), 1);
    match &log[0] {
      FakeAction::Modify { modifications } => {
        assert_eq!(modifications.len(), 2);
        assert!(modifications.contains(&fast));
        assert!(modifications.contains(&big));
      }
      other => panic!("unexpected action: {:?}", other),
    }
  }

  #[tokio::test(start_paused = true)]
  async fn modify_missing_volume() {
    let controller = controller(cloud_with(&[]));
    let mut modification = VolumeModification::new("vol-404");
    modification.throughput = Some(500);

    let e = controller
      .modify_volume(ModifyVolumeRequest::new(modification).unwrap())
      .await
      .unwrap_err();
    assert!(matches!(e, ModifyVolumeError::VolumeNotFound(ref v) if v == "vol-404"));
    assert_eq!(code(e), Code::NotFound);
  }

  #[tokio::test]
  async fn close_rejects_later_modifications() {
    let controller = controller(cloud_with(&["vol-1"]));
    controller.close().await;

    let mut modification = VolumeModification::new("vol-1");
    modification.iops = Some(3000);
    let e = controller
      .modify_volume(ModifyVolumeRequest::new(modification).unwrap())
      .await
      .unwrap_err();
    assert_eq!(code(e), Code::Unavailable);
  }
}
