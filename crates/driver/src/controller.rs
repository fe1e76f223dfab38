use crate::{
  capability,
  cloud::{CloudError, Disk, DiskOptions, DiskStore},
  parameters::VolumeParameters,
  size::{self, gib_to_bytes},
};
use async_trait::async_trait;
use csi_proto::{
  controller::{
    Confirmed, ControllerCapabilities, ControllerExpandVolumeError, ControllerExpandVolumeRequest,
    ControllerExpandVolumeResponse, ControllerPublishVolumeError, ControllerPublishVolumeRequest,
    ControllerPublishVolumeResponse, ControllerUnpublishVolumeError,
    ControllerUnpublishVolumeRequest, CreateVolumeError, CreateVolumeRequest, DeleteVolumeError,
    DeleteVolumeRequest, ValidateVolumeCapabilitiesError, ValidateVolumeCapabilitiesRequest,
    ValidateVolumeCapabilitiesResponse, Volume,
  },
  ControllerService, IdentityService, VolumeExpansionSupport,
};
use std::{iter, num::NonZeroU64, sync::Arc};
use tonic::Status;
use tracing::{debug, info};

/// Publish context key carrying the device's world wide name.
pub const WWN_KEY: &str = "WWN";

/// Volume lifecycle on top of a [`DiskStore`]. Holds no per-volume state:
/// every call re-reads what it needs from the store, so retried and
/// concurrent requests converge on the same outcome.
pub struct VolumeController<S: DiskStore + ?Sized> {
  name: String,
  store: Arc<S>,
}

impl<S: DiskStore + ?Sized> VolumeController<S> {
  pub fn new(name: impl Into<String>, store: Arc<S>) -> Self {
    VolumeController {
      name: name.into(),
      store,
    }
  }

  /// Resolves a create that lost a race against another create of the same
  /// name.
  async fn existing_disk(&self, name: &str, options: &DiskOptions) -> Result<Disk, CreateVolumeError> {
    let disk = self.store.get_disk_by_name(name).await.map_err(|err| {
      Status::internal(format!(
        "Could not get volume {:?} after create conflict: {}",
        name, err
      ))
    })?;

    match disk.mismatch(options) {
      None => Ok(disk),
      Some(reason) => Err(CreateVolumeError::AlreadyExists(format!(
        "Could not create volume {:?}: {}",
        name,
        CloudError::IdempotentParameterMismatch(reason)
      ))),
    }
  }
}

fn create_error(name: &str, err: CloudError) -> CreateVolumeError {
  let message = format!("Could not create volume {:?}: {}", name, err);
  match err {
    CloudError::NotFound => CreateVolumeError::NotFound(message),
    CloudError::IdempotentParameterMismatch(_) | CloudError::AlreadyExists => {
      CreateVolumeError::AlreadyExists(message)
    }
    CloudError::Provider(_) => Status::internal(message).into(),
  }
}

fn to_volume(disk: &Disk) -> Volume {
  Volume::new(disk.volume_id.clone(), gib_to_bytes(disk.capacity_gib))
}

impl<S: DiskStore + ?Sized> IdentityService for VolumeController<S> {
  fn name(&self) -> &str {
    &self.name
  }

  fn version(&self) -> &str {
    env!("CARGO_PKG_VERSION")
  }

  fn volume_expansion_support(&self) -> VolumeExpansionSupport {
    VolumeExpansionSupport::Online
  }
}

#[async_trait]
impl<S: DiskStore + ?Sized> ControllerService for VolumeController<S> {
  fn capabilities(&self) -> ControllerCapabilities {
    ControllerCapabilities::CREATE_DELETE_VOLUME
      | ControllerCapabilities::PUBLISH_UNPUBLISH_VOLUME
      | ControllerCapabilities::EXPAND_VOLUME
  }

  async fn create_volume(&self, request: CreateVolumeRequest) -> Result<Volume, CreateVolumeError> {
    let name = request.name();
    debug!(name, "CreateVolume: called");

    let invalid = |reason: &dyn std::fmt::Display| {
      CreateVolumeError::InvalidArgument(format!("Could not create volume {:?}: {}", name, reason))
    };

    let capacity_bytes = size::normalize(request.capacity_range()).map_err(|err| invalid(&err))?;

    let capabilities = request.volume_capabilities();
    if !capability::all_supported(capabilities) {
      return Err(invalid(&capability::unsupported_message(capabilities)));
    }

    let parameters = VolumeParameters::parse(request.parameters()).map_err(|err| invalid(&err))?;

    let options = DiskOptions {
      shareable: false,
      capacity_bytes,
      volume_type: parameters.volume_type().map(str::to_owned),
    };

    let disk = match self.store.create_disk(name, &options).await {
      Ok(disk) => disk,
      Err(CloudError::AlreadyExists) => {
        debug!(name, "CreateVolume: create conflict, looking up existing volume");
        self.existing_disk(name, &options).await?
      }
      Err(err) => return Err(create_error(name, err)),
    };

    info!(
      name,
      volume_id = %disk.volume_id,
      capacity_gib = disk.capacity_gib,
      "CreateVolume: volume ready"
    );
    Ok(to_volume(&disk))
  }

  async fn delete_volume(&self, request: DeleteVolumeRequest) -> Result<(), DeleteVolumeError> {
    let volume_id = request.volume_id();
    debug!(volume_id, "DeleteVolume: called");

    match self.store.get_disk_by_id(volume_id).await {
      Ok(_) => (),
      Err(CloudError::NotFound) => {
        debug!(volume_id, "DeleteVolume: volume not found, returning with success");
        return Ok(());
      }
      Err(err) => debug!(volume_id, %err, "DeleteVolume: lookup failed, deleting anyway"),
    }

    match self.store.delete_disk(volume_id).await {
      Ok(()) => {
        info!(volume_id, "DeleteVolume: volume deleted");
        Ok(())
      }
      Err(CloudError::NotFound) => {
        debug!(volume_id, "DeleteVolume: volume already gone, returning with success");
        Ok(())
      }
      Err(err) => Err(
        Status::internal(format!("Could not delete volume ID {:?}: {}", volume_id, err)).into(),
      ),
    }
  }

  async fn controller_publish_volume(
    &self,
    request: ControllerPublishVolumeRequest,
  ) -> Result<ControllerPublishVolumeResponse, ControllerPublishVolumeError> {
    let volume_id = request.volume_id();
    let node_id = request.node_id();
    debug!(volume_id, node_id, "ControllerPublishVolume: called");

    let capability = request.volume_capability();
    if !capability::is_supported(capability) {
      return Err(
        Status::invalid_argument(format!(
          "Could not publish volume {:?} to node {:?}: {}",
          volume_id,
          node_id,
          capability::unsupported_message(&[capability.clone()])
        ))
        .into(),
      );
    }

    if let Err(err) = self.store.get_instance_by_id(node_id).await {
      return Err(ControllerPublishVolumeError::NodeDoesNotExist(format!(
        "Instance {:?} not found, err: {}",
        node_id, err
      )));
    }

    let disk = match self.store.get_disk_by_id(volume_id).await {
      Ok(disk) => disk,
      Err(CloudError::NotFound) => {
        return Err(ControllerPublishVolumeError::VolumeDoesNotExist(format!(
          "Volume {:?} not found",
          volume_id
        )))
      }
      Err(err) => {
        return Err(
          Status::internal(format!(
            "Could not get volume with ID {:?}: {}",
            volume_id, err
          ))
          .into(),
        )
      }
    };

    let response = ControllerPublishVolumeResponse::new(
      iter::once((WWN_KEY.to_owned(), disk.wwn)).collect(),
    );

    match self.store.is_attached(volume_id, node_id).await {
      Ok(true) => {
        debug!(
          volume_id,
          node_id, "ControllerPublishVolume: volume already attached, returning with success"
        );
        return Ok(response);
      }
      Ok(false) => (),
      Err(err) => debug!(
        volume_id,
        node_id,
        %err,
        "ControllerPublishVolume: attachment status unknown, attaching"
      ),
    }

    match self.store.attach_disk(volume_id, node_id).await {
      Ok(()) => {
        info!(volume_id, node_id, "ControllerPublishVolume: volume attached");
        Ok(response)
      }
      Err(CloudError::AlreadyExists) => Err(ControllerPublishVolumeError::AlreadyExists(format!(
        "Volume {:?} is attached to a node other than {:?}",
        volume_id, node_id
      ))),
      Err(err) => Err(
        Status::internal(format!(
          "Could not attach volume {:?} to node {:?}: {}",
          volume_id, node_id, err
        ))
        .into(),
      ),
    }
  }

  async fn controller_unpublish_volume(
    &self,
    request: ControllerUnpublishVolumeRequest,
  ) -> Result<(), ControllerUnpublishVolumeError> {
    let volume_id = request.volume_id();
    let node_id = request.node_id();
    debug!(volume_id, node_id, "ControllerUnpublishVolume: called");

    if let Err(CloudError::NotFound) = self.store.get_disk_by_id(volume_id).await {
      debug!(
        volume_id,
        "ControllerUnpublishVolume: volume not found, returning with success"
      );
      return Ok(());
    }

    // A failed status query counts as detached so cleanup never blocks on it.
    match self.store.is_attached(volume_id, node_id).await {
      Ok(true) => (),
      Ok(false) => {
        debug!(
          volume_id,
          node_id, "ControllerUnpublishVolume: volume is not attached, returning with success"
        );
        return Ok(());
      }
      Err(err) => {
        debug!(
          volume_id,
          node_id,
          %err,
          "ControllerUnpublishVolume: attachment status unknown, returning with success"
        );
        return Ok(());
      }
    }

    self
      .store
      .detach_disk(volume_id, node_id)
      .await
      .map_err(|err| {
        Status::internal(format!(
          "Could not detach volume {:?} from node {:?}: {}",
          volume_id, node_id, err
        ))
      })?;

    info!(volume_id, node_id, "ControllerUnpublishVolume: volume detached");
    Ok(())
  }

  async fn validate_volume_capabilities(
    &self,
    request: ValidateVolumeCapabilitiesRequest,
  ) -> Result<ValidateVolumeCapabilitiesResponse, ValidateVolumeCapabilitiesError> {
    let volume_id = request.volume_id();
    debug!(volume_id, "ValidateVolumeCapabilities: called");

    match self.store.get_disk_by_id(volume_id).await {
      Ok(_) => (),
      Err(CloudError::NotFound) => {
        return Err(ValidateVolumeCapabilitiesError::VolumeNotFound(format!(
          "Volume {:?} not found",
          volume_id
        )))
      }
      Err(err) => {
        return Err(
          Status::internal(format!(
            "Could not get volume with ID {:?}: {}",
            volume_id, err
          ))
          .into(),
        )
      }
    }

    let capabilities = request.volume_capabilities();
    Ok(if capability::all_supported(capabilities) {
      ValidateVolumeCapabilitiesResponse::Confirmed(Confirmed::new(capabilities.to_vec()))
    } else {
      ValidateVolumeCapabilitiesResponse::Message(capability::unsupported_message(capabilities))
    })
  }

  async fn controller_expand_volume(
    &self,
    request: ControllerExpandVolumeRequest,
  ) -> Result<ControllerExpandVolumeResponse, ControllerExpandVolumeError> {
    let volume_id = request.volume_id();
    debug!(volume_id, "ControllerExpandVolume: called");

    let requested_bytes = size::normalize(Some(request.capacity_range())).map_err(|err| {
      ControllerExpandVolumeError::InvalidArgument(format!(
        "Could not expand volume {:?}: {}",
        volume_id, err
      ))
    })?;

    let capacity_gib = self
      .store
      .resize_disk(volume_id, requested_bytes)
      .await
      .map_err(|err| {
        Status::internal(format!("Could not resize volume {:?}: {}", volume_id, err))
      })?;

    let capacity_bytes = match NonZeroU64::new(gib_to_bytes(capacity_gib)) {
      Some(bytes) if bytes.get() >= requested_bytes => bytes,
      _ => {
        return Err(
          Status::internal(format!(
            "Volume {:?} was resized to {}GiB, less than the requested {} bytes",
            volume_id, capacity_gib, requested_bytes
          ))
          .into(),
        )
      }
    };

    info!(volume_id, capacity_gib, "ControllerExpandVolume: volume resized");
    Ok(ControllerExpandVolumeResponse::new(capacity_bytes, true))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    cloud::{DiskAction, DiskOp, Instance, MemoryDiskStore},
    size::GIB,
  };
  use csi_proto::{
    controller::{AccessMode, AccessType, VolumeCapability},
    proto,
  };
  use std::convert::TryFrom;
  use test_case::test_case;
  use tonic::Code;

  const NODE_A: &str = "node-A";
  const NODE_B: &str = "node-B";

  fn setup() -> (Arc<MemoryDiskStore>, VolumeController<MemoryDiskStore>) {
    let store = Arc::new(MemoryDiskStore::new());
    store.add_instance(NODE_A, "worker-a");
    store.add_instance(NODE_B, "worker-b");
    let controller = VolumeController::new("blockvol.csi.io", store.clone());
    (store, controller)
  }

  fn capability(mode: AccessMode) -> proto::VolumeCapability {
    VolumeCapability::new(mode, AccessType::Block).into()
  }

  fn create_request(
    name: &str,
    required_bytes: i64,
    limit_bytes: i64,
    parameters: &[(&str, &str)],
  ) -> CreateVolumeRequest {
    CreateVolumeRequest::try_from(proto::CreateVolumeRequest {
      name: name.to_owned(),
      capacity_range: Some(proto::CapacityRange {
        required_bytes,
        limit_bytes,
      }),
      volume_capabilities: vec![capability(AccessMode::SingleNodeWriter)],
      parameters: parameters
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect(),
      ..Default::default()
    })
    .unwrap()
  }

  fn delete_request(volume_id: &str) -> DeleteVolumeRequest {
    DeleteVolumeRequest::try_from(proto::DeleteVolumeRequest {
      volume_id: volume_id.to_owned(),
      ..Default::default()
    })
    .unwrap()
  }

  fn publish_request(volume_id: &str, node_id: &str) -> ControllerPublishVolumeRequest {
    publish_request_with_mode(volume_id, node_id, AccessMode::SingleNodeWriter)
  }

  fn publish_request_with_mode(
    volume_id: &str,
    node_id: &str,
    mode: AccessMode,
  ) -> ControllerPublishVolumeRequest {
    ControllerPublishVolumeRequest::try_from(proto::ControllerPublishVolumeRequest {
      volume_id: volume_id.to_owned(),
      node_id: node_id.to_owned(),
      volume_capability: Some(capability(mode)),
      ..Default::default()
    })
    .unwrap()
  }

  fn unpublish_request(volume_id: &str, node_id: &str) -> ControllerUnpublishVolumeRequest {
    ControllerUnpublishVolumeRequest::try_from(proto::ControllerUnpublishVolumeRequest {
      volume_id: volume_id.to_owned(),
      node_id: node_id.to_owned(),
      ..Default::default()
    })
    .unwrap()
  }

  fn validate_request(volume_id: &str, modes: &[AccessMode]) -> ValidateVolumeCapabilitiesRequest {
    ValidateVolumeCapabilitiesRequest::try_from(proto::ValidateVolumeCapabilitiesRequest {
      volume_id: volume_id.to_owned(),
      volume_capabilities: modes.iter().copied().map(capability).collect(),
      ..Default::default()
    })
    .unwrap()
  }

  fn expand_request(
    volume_id: &str,
    required_bytes: i64,
    limit_bytes: i64,
  ) -> ControllerExpandVolumeRequest {
    ControllerExpandVolumeRequest::try_from(proto::ControllerExpandVolumeRequest {
      volume_id: volume_id.to_owned(),
      capacity_range: Some(proto::CapacityRange {
        required_bytes,
        limit_bytes,
      }),
      ..Default::default()
    })
    .unwrap()
  }

  fn code(err: impl Into<Status>) -> Code {
    err.into().code()
  }

  fn count(store: &MemoryDiskStore, matches: impl Fn(&DiskAction) -> bool) -> usize {
    store.actions().iter().filter(|a| matches(a)).count()
  }

  async fn create(controller: &VolumeController<MemoryDiskStore>, name: &str) -> Volume {
    controller
      .create_volume(create_request(name, GIB as i64, 0, &[]))
      .await
      .unwrap()
  }

  #[tokio::test]
  async fn create_is_idempotent() {
    let (store, controller) = setup();

    let first = controller
      .create_volume(create_request("vol1", 2_000_000_000, 0, &[("type", "tier1")]))
      .await
      .unwrap();
    assert_eq!(first.capacity_bytes(), 2_147_483_648);

    let second = controller
      .create_volume(create_request("vol1", 2_000_000_000, 0, &[("type", "tier1")]))
      .await
      .unwrap();
    assert_eq!(second.volume_id(), first.volume_id());
    assert_eq!(
      count(&store, |a| matches!(a, DiskAction::Created { .. })),
      1
    );

    let err = controller
      .create_volume(create_request("vol1", 4_000_000_000, 0, &[("type", "tier1")]))
      .await
      .unwrap_err();
    let status = Status::from(err);
    assert_eq!(status.code(), Code::AlreadyExists);
    assert!(status.message().contains("capacity"), "{}", status.message());
  }

  #[tokio::test]
  async fn create_detects_type_conflict() {
    let (_, controller) = setup();
    controller
      .create_volume(create_request("vol1", GIB as i64, 0, &[("type", "tier1")]))
      .await
      .unwrap();

    let err = controller
      .create_volume(create_request("vol1", GIB as i64, 0, &[("type", "tier3")]))
      .await
      .unwrap_err();
    let status = Status::from(err);
    assert_eq!(status.code(), Code::AlreadyExists);
    assert!(status.message().contains("type"), "{}", status.message());
  }

  #[tokio::test]
  async fn create_defaults_to_one_gib() {
    let (_, controller) = setup();
    let volume = controller
      .create_volume(create_request("vol1", 0, 0, &[]))
      .await
      .unwrap();

    assert_eq!(volume.capacity_bytes(), GIB);
  }

  #[test_case(create_request("vol1", 5_000_000_000, 4_000_000_000, &[]) ; "over limit")]
  #[test_case(create_request("vol1", 0, 1024, &[]) ; "default over limit")]
  #[test_case(create_request("vol1", GIB as i64, 0, &[("iops", "100")]) ; "unknown parameter")]
  #[test_case(create_request("vol1", i64::MAX, 0, &[]) ; "rounds past int64")]
  #[tokio::test]
  async fn create_rejects_before_any_store_call(request: CreateVolumeRequest) {
    let (store, controller) = setup();
    let status = Status::from(controller.create_volume(request).await.unwrap_err());

    assert_eq!(status.code(), Code::InvalidArgument);
    assert!(
      status.message().starts_with("Could not create volume \"vol1\": "),
      "{}",
      status.message()
    );
    assert!(store.actions().is_empty());
  }

  #[tokio::test]
  async fn create_rejects_unsupported_capability() {
    let (store, controller) = setup();
    let request = CreateVolumeRequest::try_from(proto::CreateVolumeRequest {
      name: "vol1".to_owned(),
      volume_capabilities: vec![
        capability(AccessMode::SingleNodeWriter),
        capability(AccessMode::MultiNodeMultiWriter),
      ],
      ..Default::default()
    })
    .unwrap();

    let status = Status::from(controller.create_volume(request).await.unwrap_err());
    assert_eq!(status.code(), Code::InvalidArgument);
    assert_eq!(
      status.message(),
      "Could not create volume \"vol1\": Volume capabilities SINGLE_NODE_WRITER, MULTI_NODE_MULTI_WRITER not supported. Only AccessModes[ReadWriteOnce] supported."
    );
    assert!(store.actions().is_empty());
  }

  #[test_case(CloudError::NotFound, Code::NotFound ; "not found")]
  #[test_case(CloudError::IdempotentParameterMismatch("capacity".to_owned()), Code::AlreadyExists ; "mismatch")]
  #[test_case(CloudError::Provider("quota exceeded".to_owned()), Code::Internal ; "provider")]
  #[tokio::test]
  async fn create_classifies_store_errors(err: CloudError, expected: Code) {
    let (store, controller) = setup();
    store.fail_next(DiskOp::Create, err);

    let err = controller
      .create_volume(create_request("vol1", GIB as i64, 0, &[]))
      .await
      .unwrap_err();
    assert_eq!(code(err), expected);
  }

  #[tokio::test]
  async fn create_race_resolves_to_existing_volume() {
    let (store, controller) = setup();
    let existing = store
      .create_disk(
        "vol1",
        &DiskOptions {
          capacity_bytes: 2 * GIB,
          volume_type: Some("tier1".to_owned()),
          ..Default::default()
        },
      )
      .await
      .unwrap();
    store.fail_next(DiskOp::Create, CloudError::AlreadyExists);

    let volume = controller
      .create_volume(create_request("vol1", 2_000_000_000, 0, &[("type", "tier1")]))
      .await
      .unwrap();

    assert_eq!(volume.volume_id(), existing.volume_id);
    assert_eq!(
      count(&store, |a| matches!(a, DiskAction::Created { .. })),
      1
    );
  }

  #[tokio::test]
  async fn create_race_with_different_parameters_conflicts() {
    let (store, controller) = setup();
    store
      .create_disk(
        "vol1",
        &DiskOptions {
          capacity_bytes: 2 * GIB,
          ..Default::default()
        },
      )
      .await
      .unwrap();
    store.fail_next(DiskOp::Create, CloudError::AlreadyExists);

    let err = controller
      .create_volume(create_request("vol1", 8 * GIB as i64, 0, &[]))
      .await
      .unwrap_err();
    assert_eq!(code(err), Code::AlreadyExists);
  }

  #[tokio::test]
  async fn create_race_lookup_failure_is_internal() {
    let (store, controller) = setup();
    store.fail_next(DiskOp::Create, CloudError::AlreadyExists);
    store.fail_next(DiskOp::GetDiskByName, CloudError::Provider("timeout".to_owned()));

    let err = controller
      .create_volume(create_request("vol1", GIB as i64, 0, &[]))
      .await
      .unwrap_err();
    assert_eq!(code(err), Code::Internal);
  }

  #[tokio::test]
  async fn delete_is_idempotent() {
    let (store, controller) = setup();
    controller.delete_volume(delete_request("vol-404")).await.unwrap();
    controller.delete_volume(delete_request("vol-404")).await.unwrap();

    let volume = create(&controller, "vol1").await;
    controller
      .delete_volume(delete_request(volume.volume_id()))
      .await
      .unwrap();
    controller
      .delete_volume(delete_request(volume.volume_id()))
      .await
      .unwrap();

    assert_eq!(
      count(&store, |a| matches!(a, DiskAction::Deleted { .. })),
      1
    );
  }

  #[tokio::test]
  async fn delete_proceeds_when_lookup_fails() {
    let (store, controller) = setup();
    let volume = create(&controller, "vol1").await;
    store.fail_next(DiskOp::GetDiskById, CloudError::Provider("timeout".to_owned()));

    controller
      .delete_volume(delete_request(volume.volume_id()))
      .await
      .unwrap();
    assert_eq!(
      count(&store, |a| matches!(a, DiskAction::Deleted { .. })),
      1
    );
  }

  #[tokio::test]
  async fn delete_failure_is_internal() {
    let (store, controller) = setup();
    let volume = create(&controller, "vol1").await;
    store.fail_next(DiskOp::Delete, CloudError::Provider("busy".to_owned()));

    let err = controller
      .delete_volume(delete_request(volume.volume_id()))
      .await
      .unwrap_err();
    assert_eq!(code(err), Code::Internal);
  }

  #[tokio::test]
  async fn publish_is_idempotent() {
    let (store, controller) = setup();
    let volume = create(&controller, "vol1").await;
    let wwn = store.get_disk_by_id(volume.volume_id()).await.unwrap().wwn;

    let first = controller
      .controller_publish_volume(publish_request(volume.volume_id(), NODE_A))
      .await
      .unwrap();
    let second = controller
      .controller_publish_volume(publish_request(volume.volume_id(), NODE_A))
      .await
      .unwrap();

    assert_eq!(first, second);
    assert_eq!(first.publish_context().get(WWN_KEY), Some(&wwn));
    assert_eq!(
      count(&store, |a| matches!(a, DiskAction::Attached { .. })),
      1
    );
  }

  #[tokio::test]
  async fn publish_to_second_node_conflicts_until_unpublished() {
    let (store, controller) = setup();
    let volume = create(&controller, "v-123").await;
    let id = volume.volume_id();

    controller
      .controller_publish_volume(publish_request(id, NODE_A))
      .await
      .unwrap();
    let err = controller
      .controller_publish_volume(publish_request(id, NODE_B))
      .await
      .unwrap_err();
    assert_eq!(code(err), Code::AlreadyExists);

    controller
      .controller_unpublish_volume(unpublish_request(id, NODE_A))
      .await
      .unwrap();
    controller
      .controller_publish_volume(publish_request(id, NODE_B))
      .await
      .unwrap();
    assert_eq!(store.attachment(id).as_deref(), Some(NODE_B));
  }

  #[tokio::test]
  async fn publish_unknown_node_or_volume_is_not_found() {
    let (_, controller) = setup();
    let volume = create(&controller, "vol1").await;

    let err = controller
      .controller_publish_volume(publish_request(volume.volume_id(), "node-Z"))
      .await
      .unwrap_err();
    assert!(matches!(err, ControllerPublishVolumeError::NodeDoesNotExist(_)));
    assert_eq!(code(err), Code::NotFound);

    let err = controller
      .controller_publish_volume(publish_request("vol-404", NODE_A))
      .await
      .unwrap_err();
    assert!(matches!(err, ControllerPublishVolumeError::VolumeDoesNotExist(_)));
    assert_eq!(code(err), Code::NotFound);
  }

  #[tokio::test]
  async fn publish_volume_lookup_failure_is_internal() {
    let (store, controller) = setup();
    let volume = create(&controller, "vol1").await;
    store.fail_next(DiskOp::GetDiskById, CloudError::Provider("timeout".to_owned()));

    let err = controller
      .controller_publish_volume(publish_request(volume.volume_id(), NODE_A))
      .await
      .unwrap_err();
    assert_eq!(code(err), Code::Internal);
  }

  #[tokio::test]
  async fn publish_rejects_unsupported_capability() {
    let (store, controller) = setup();
    let volume = create(&controller, "vol1").await;

    let err = controller
      .controller_publish_volume(publish_request_with_mode(
        volume.volume_id(),
        NODE_A,
        AccessMode::MultiNodeReaderOnly,
      ))
      .await
      .unwrap_err();
    let status = Status::from(err);
    assert_eq!(status.code(), Code::InvalidArgument);
    assert!(status.message().contains(volume.volume_id()), "{}", status.message());
    assert!(status.message().contains(NODE_A), "{}", status.message());
    assert_eq!(store.attachment(volume.volume_id()), None);
  }

  #[tokio::test]
  async fn publish_attaches_when_status_unknown() {
    let (store, controller) = setup();
    let volume = create(&controller, "vol1").await;
    store.fail_next(DiskOp::IsAttached, CloudError::Provider("timeout".to_owned()));

    controller
      .controller_publish_volume(publish_request(volume.volume_id(), NODE_A))
      .await
      .unwrap();
    assert_eq!(store.attachment(volume.volume_id()).as_deref(), Some(NODE_A));
  }

  #[tokio::test]
  async fn publish_attach_failure_is_internal() {
    let (store, controller) = setup();
    let volume = create(&controller, "vol1").await;
    store.fail_next(DiskOp::Attach, CloudError::Provider("busy".to_owned()));

    let err = controller
      .controller_publish_volume(publish_request(volume.volume_id(), NODE_A))
      .await
      .unwrap_err();
    assert_eq!(code(err), Code::Internal);
  }

  #[tokio::test]
  async fn unpublish_always_succeeds_without_attachment() {
    let (store, controller) = setup();
    controller
      .controller_unpublish_volume(unpublish_request("vol-404", NODE_A))
      .await
      .unwrap();

    let volume = create(&controller, "vol1").await;
    controller
      .controller_unpublish_volume(unpublish_request(volume.volume_id(), NODE_A))
      .await
      .unwrap();

    controller
      .controller_publish_volume(publish_request(volume.volume_id(), NODE_A))
      .await
      .unwrap();
    controller
      .controller_unpublish_volume(unpublish_request(volume.volume_id(), NODE_B))
      .await
      .unwrap();
    assert_eq!(store.attachment(volume.volume_id()).as_deref(), Some(NODE_A));

    controller
      .controller_unpublish_volume(unpublish_request(volume.volume_id(), NODE_A))
      .await
      .unwrap();
    controller
      .controller_unpublish_volume(unpublish_request(volume.volume_id(), NODE_A))
      .await
      .unwrap();
    assert_eq!(store.attachment(volume.volume_id()), None);
    assert_eq!(
      count(&store, |a| matches!(a, DiskAction::Detached { .. })),
      1
    );
  }

  #[tokio::test]
  async fn unpublish_treats_status_failure_as_detached() {
    let (store, controller) = setup();
    let volume = create(&controller, "vol1").await;
    controller
      .controller_publish_volume(publish_request(volume.volume_id(), NODE_A))
      .await
      .unwrap();
    store.fail_next(DiskOp::IsAttached, CloudError::Provider("timeout".to_owned()));

    controller
      .controller_unpublish_volume(unpublish_request(volume.volume_id(), NODE_A))
      .await
      .unwrap();
    assert_eq!(store.attachment(volume.volume_id()).as_deref(), Some(NODE_A));
  }

  #[tokio::test]
  async fn unpublish_detach_failure_is_internal() {
    let (store, controller) = setup();
    let volume = create(&controller, "vol1").await;
    controller
      .controller_publish_volume(publish_request(volume.volume_id(), NODE_A))
      .await
      .unwrap();
    store.fail_next(DiskOp::Detach, CloudError::Provider("busy".to_owned()));

    let err = controller
      .controller_unpublish_volume(unpublish_request(volume.volume_id(), NODE_A))
      .await
      .unwrap_err();
    assert_eq!(code(err), Code::Internal);
  }

  #[test_case(&[AccessMode::SingleNodeWriter], true ; "supported")]
  #[test_case(&[AccessMode::SingleNodeWriter, AccessMode::MultiNodeMultiWriter], false ; "one unsupported")]
  #[test_case(&[AccessMode::SingleNodeReaderOnly], false ; "reader only")]
  #[tokio::test]
  async fn validate_confirms_only_supported(modes: &'static [AccessMode], confirmed: bool) {
    let (store, controller) = setup();
    let volume = create(&controller, "vol1").await;
    let actions = store.actions();

    let response = controller
      .validate_volume_capabilities(validate_request(volume.volume_id(), modes))
      .await
      .unwrap();
    assert_eq!(store.actions(), actions);

    match response {
      ValidateVolumeCapabilitiesResponse::Confirmed(c) => {
        assert!(confirmed);
        assert_eq!(c.volume_capabilities().len(), modes.len());
      }
      ValidateVolumeCapabilitiesResponse::Message(message) => {
        assert!(!confirmed);
        assert!(message.contains("not supported"), "{}", message);
      }
    }
  }

  #[tokio::test]
  async fn validate_classifies_lookup_errors() {
    let (store, controller) = setup();
    let err = controller
      .validate_volume_capabilities(validate_request("vol-404", &[AccessMode::SingleNodeWriter]))
      .await
      .unwrap_err();
    assert_eq!(code(err), Code::NotFound);

    let volume = create(&controller, "vol1").await;
    store.fail_next(DiskOp::GetDiskById, CloudError::Provider("timeout".to_owned()));
    let err = controller
      .validate_volume_capabilities(validate_request(
        volume.volume_id(),
        &[AccessMode::SingleNodeWriter],
      ))
      .await
      .unwrap_err();
    assert_eq!(code(err), Code::Internal);
  }

  #[test_case(5_000_000_000, 4_000_000_000 ; "over limit")]
  #[test_case(i64::MAX, 0 ; "rounds past int64")]
  #[tokio::test]
  async fn expand_out_of_range_issues_no_resize(required_bytes: i64, limit_bytes: i64) {
    let (store, controller) = setup();
    let volume = create(&controller, "v-123").await;

    let err = controller
      .controller_expand_volume(expand_request(
        volume.volume_id(),
        required_bytes,
        limit_bytes,
      ))
      .await
      .unwrap_err();
    let status = Status::from(err);
    assert_eq!(status.code(), Code::InvalidArgument);
    assert!(
      status
        .message()
        .starts_with(&format!("Could not expand volume {:?}: ", volume.volume_id())),
      "{}",
      status.message()
    );
    assert_eq!(
      count(&store, |a| matches!(a, DiskAction::Resized { .. })),
      0
    );
  }

  #[test_case(5_000_000_000, 5 * GIB ; "grows rounded up")]
  #[test_case(GIB as i64, 2 * GIB ; "already larger")]
  #[test_case(0, 2 * GIB ; "default size")]
  #[tokio::test]
  async fn expand_returns_at_least_requested(required_bytes: i64, expected: u64) {
    let (_, controller) = setup();
    let volume = controller
      .create_volume(create_request("vol1", 2 * GIB as i64, 0, &[]))
      .await
      .unwrap();

    let response = controller
      .controller_expand_volume(expand_request(volume.volume_id(), required_bytes, 0))
      .await
      .unwrap();
    assert!(response.node_expansion_required());
    assert!(response.capacity_bytes() >= size::round_up_bytes(required_bytes as u64));
    assert_eq!(response.capacity_bytes(), expected);
  }

  #[test_case(CloudError::NotFound ; "missing volume")]
  #[test_case(CloudError::Provider("busy".to_owned()) ; "provider")]
  #[tokio::test]
  async fn expand_resize_failure_is_internal(err: CloudError) {
    let (store, controller) = setup();
    let volume = create(&controller, "vol1").await;
    store.fail_next(DiskOp::Resize, err);

    let err = controller
      .controller_expand_volume(expand_request(volume.volume_id(), 3 * GIB as i64, 0))
      .await
      .unwrap_err();
    assert_eq!(code(err), Code::Internal);
  }

  /// Reports every resize as 1 GiB no matter what was asked.
  struct Undersized(MemoryDiskStore);

  #[async_trait]
  impl DiskStore for Undersized {
    async fn create_disk(&self, name: &str, options: &DiskOptions) -> Result<Disk, CloudError> {
      self.0.create_disk(name, options).await
    }

    async fn delete_disk(&self, volume_id: &str) -> Result<(), CloudError> {
      self.0.delete_disk(volume_id).await
    }

    async fn get_disk_by_id(&self, volume_id: &str) -> Result<Disk, CloudError> {
      self.0.get_disk_by_id(volume_id).await
    }

    async fn get_disk_by_name(&self, name: &str) -> Result<Disk, CloudError> {
      self.0.get_disk_by_name(name).await
    }

    async fn get_instance_by_id(&self, instance_id: &str) -> Result<Instance, CloudError> {
      self.0.get_instance_by_id(instance_id).await
    }

    async fn attach_disk(&self, volume_id: &str, instance_id: &str) -> Result<(), CloudError> {
      self.0.attach_disk(volume_id, instance_id).await
    }

    async fn detach_disk(&self, volume_id: &str, instance_id: &str) -> Result<(), CloudError> {
      self.0.detach_disk(volume_id, instance_id).await
    }

    async fn is_attached(&self, volume_id: &str, instance_id: &str) -> Result<bool, CloudError> {
      self.0.is_attached(volume_id, instance_id).await
    }

    async fn resize_disk(&self, _volume_id: &str, _new_size_bytes: u64) -> Result<u64, CloudError> {
      Ok(1)
    }
  }

  #[tokio::test]
  async fn expand_rejects_undersized_result() {
    let store = Arc::new(Undersized(MemoryDiskStore::new()));
    let controller = VolumeController::new("blockvol.csi.io", store);
    let volume = controller
      .create_volume(create_request("vol1", GIB as i64, 0, &[]))
      .await
      .unwrap();

    let err = controller
      .controller_expand_volume(expand_request(volume.volume_id(), 4 * GIB as i64, 0))
      .await
      .unwrap_err();
    assert_eq!(code(err), Code::Internal);
  }

  #[test]
  fn reports_lifecycle_capabilities() {
    let (_, controller) = setup();

    assert_eq!(
      controller.capabilities(),
      ControllerCapabilities::CREATE_DELETE_VOLUME
        | ControllerCapabilities::PUBLISH_UNPUBLISH_VOLUME
        | ControllerCapabilities::EXPAND_VOLUME
    );
    assert_eq!(controller.volume_expansion_support(), VolumeExpansionSupport::Online);
    assert_eq!(controller.name(), "blockvol.csi.io");
  }

  #[tokio::test]
  async fn works_behind_a_trait_object() {
    let store: Arc<dyn DiskStore> = Arc::new(MemoryDiskStore::new());
    let controller = VolumeController::new("blockvol.csi.io", store);

    let volume = controller
      .create_volume(create_request("vol1", GIB as i64, 0, &[]))
      .await
      .unwrap();
    assert_eq!(volume.capacity_bytes(), GIB);
    assert!(volume.volume_context().is_empty());
  }
}
