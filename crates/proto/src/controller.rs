mod capabilities;
mod create_volume;
mod delete_volume;
mod expand_volume;
mod publish_volume;
mod unpublish_volume;
mod validate_volume_capabilities;

use crate::{
  plugin, proto,
  secrets::Secrets,
  utils::{record_request, Record},
  IdentityService,
};
use async_trait::async_trait;
use std::{convert::TryInto, sync::Arc};
use tracing::instrument;

pub use crate::volume::*;
pub use capabilities::*;
pub use create_volume::*;
pub use delete_volume::*;
pub use expand_volume::*;
pub use publish_volume::*;
pub use unpublish_volume::*;
pub use validate_volume_capabilities::*;

#[async_trait]
pub trait ControllerService: IdentityService {
  /// Get the set of services provided by this controller.
  #[inline]
  fn capabilities(&self) -> ControllerCapabilities {
    ControllerCapabilities::empty()
  }

  /// A Controller Plugin MUST implement this RPC call if it has `CREATE_DELETE_VOLUME`
  /// controller capability.
  ///
  /// This RPC will be called by the CO to provision a new volume on behalf of a user
  /// (to be consumed as either a block device or a mounted filesystem).
  ///
  /// This operation MUST be idempotent.
  ///
  /// If a volume corresponding to the specified volume `name` already exists, is
  /// accessible from `accessibility_requirements`, and is compatible with the specified
  /// `capacity_range`, `volume_capabilities` and `parameters` in the `CreateVolumeRequest`,
  /// the Plugin MUST reply `0 OK` with the corresponding `CreateVolumeResponse`.
  #[allow(unused_variables)]
  async fn create_volume(&self, request: CreateVolumeRequest) -> Result<Volume, CreateVolumeError> {
    unsupported!("CreateVolume")
  }

  /// A Controller Plugin MUST implement this RPC call if it has CREATE_DELETE_VOLUME capability.
  /// This RPC will be called by the CO to deprovision a volume.
  ///
  /// This operation MUST be idempotent. If a volume corresponding to the specified volume_id
  /// does not exist or the artifacts associated with the volume do not exist anymore, the
  /// Plugin MUST reply 0 OK.
  #[allow(unused_variables)]
  async fn delete_volume(&self, request: DeleteVolumeRequest) -> Result<(), DeleteVolumeError> {
    unsupported!("DeleteVolume")
  }

  /// A Controller Plugin MUST implement this RPC call if it has PUBLISH_UNPUBLISH_VOLUME
  /// controller capability. This RPC will be called by the CO when it wants to place a workload
  /// that uses the volume onto a node. The Plugin SHOULD perform the work that is necessary for
  /// making the volume available on the given node. The Plugin MUST NOT assume that this RPC
  /// will be executed on the node where the volume will be used.
  ///
  /// This operation MUST be idempotent. If the volume corresponding to the volume_id has
  /// already been published at the node corresponding to the node_id, and is compatible with
  /// the specified volume_capability and readonly flag, the Plugin MUST reply 0 OK.
  #[allow(unused_variables)]
  async fn controller_publish_volume(
    &self,
    request: ControllerPublishVolumeRequest,
  ) -> Result<ControllerPublishVolumeResponse, ControllerPublishVolumeError> {
    unsupported!("ControllerPublishVolume")
  }

  /// Controller Plugin MUST implement this RPC call if it has PUBLISH_UNPUBLISH_VOLUME
  /// controller capability. This RPC is a reverse operation of ControllerPublishVolume.
  ///
  /// This operation MUST be idempotent. If the volume corresponding to the volume_id is
  /// not attached to the node corresponding to the node_id, the Plugin MUST reply 0 OK.
  /// If the volume corresponding to the volume_id or the node corresponding to node_id cannot
  /// be found by the Plugin and the volume can be safely regarded as ControllerUnpublished
  /// from the node, the plugin SHOULD return 0 OK.
  #[allow(unused_variables)]
  async fn controller_unpublish_volume(
    &self,
    request: ControllerUnpublishVolumeRequest,
  ) -> Result<(), ControllerUnpublishVolumeError> {
    unsupported!("ControllerUnpublishVolume")
  }

  /// A Controller Plugin MUST implement this RPC call. This RPC will be called by the
  /// CO to check if a pre-provisioned volume has all the capabilities that the CO wants.
  /// This RPC call SHALL return confirmed only if all the volume capabilities specified
  /// in the request are supported. This operation MUST be idempotent.
  async fn validate_volume_capabilities(
    &self,
    request: ValidateVolumeCapabilitiesRequest,
  ) -> Result<ValidateVolumeCapabilitiesResponse, ValidateVolumeCapabilitiesError>;

  /// A Controller plugin MUST implement this RPC call if plugin has `EXPAND_VOLUME`
  /// controller capability. This RPC allows the CO to expand the size of a volume.
  ///
  /// This operation MUST be idempotent. If a volume corresponding to the specified
  /// volume ID is already larger than or equal to the target capacity of the expansion
  /// request, the plugin SHOULD reply 0 OK.
  ///
  /// If plugin has `EXPAND_VOLUME` node capability, then `NodeExpandVolume` MUST be
  /// called after successful `ControllerExpandVolume` and `node_expansion_required` in
  /// `ControllerExpandVolumeResponse` is `true`.
  #[allow(unused_variables)]
  async fn controller_expand_volume(
    &self,
    request: ControllerExpandVolumeRequest,
  ) -> Result<ControllerExpandVolumeResponse, ControllerExpandVolumeError> {
    unsupported!("ControllerExpandVolume")
  }
}

/// Wires a [`ControllerService`] into the generated identity and controller
/// servers. Shape errors in requests are rejected here, before the service
/// is called.
pub(crate) struct Controller<T: ControllerService>(Arc<T>);

impl<T: ControllerService> Controller<T> {
  #[inline]
  pub(crate) fn new(service: Arc<T>) -> Self {
    Controller(service)
  }
}

impl<T: ControllerService> Clone for Controller<T> {
  #[inline]
  fn clone(&self) -> Self {
    Controller(self.0.clone())
  }
}

#[async_trait]
impl<T: ControllerService> proto::identity_server::Identity for Controller<T> {
  #[instrument(
    name = "identity.get_plugin_info",
    skip(self, _request),
    fields(name, vendor_version, manifest)
  )]
  async fn get_plugin_info(
    &self,
    _request: tonic::Request<proto::GetPluginInfoRequest>,
  ) -> Result<tonic::Response<proto::GetPluginInfoResponse>, tonic::Status> {
    let response = proto::GetPluginInfoResponse {
      name: self.0.name().record_field("name").into(),
      vendor_version: self.0.version().record_field("vendor_version").into(),
      manifest: self.0.manifest().record_field("manifest").clone(),
    };

    Ok(tonic::Response::new(response))
  }

  #[instrument(
    name = "identity.get_plugin_capabilities",
    skip(self, _request),
    fields(response)
  )]
  async fn get_plugin_capabilities(
    &self,
    _request: tonic::Request<proto::GetPluginCapabilitiesRequest>,
  ) -> Result<tonic::Response<proto::GetPluginCapabilitiesResponse>, tonic::Status> {
    let response = plugin::get_capabilities(&*self.0).record_response();
    Ok(tonic::Response::new(response))
  }

  #[instrument(name = "identity.probe", skip(self, _request), fields(ready))]
  async fn probe(
    &self,
    _request: tonic::Request<proto::ProbeRequest>,
  ) -> Result<tonic::Response<proto::ProbeResponse>, tonic::Status> {
    let response = proto::ProbeResponse {
      ready: Some(self.0.ready().record_field("ready")),
    };

    Ok(tonic::Response::new(response))
  }
}

#[async_trait]
impl<T: ControllerService> proto::controller_server::Controller for Controller<T> {
  #[instrument(
    name = "controller.create_volume",
    skip(self, request),
    fields(request, response)
  )]
  async fn create_volume(
    &self,
    request: tonic::Request<proto::CreateVolumeRequest>,
  ) -> Result<tonic::Response<proto::CreateVolumeResponse>, tonic::Status> {
    let request = record_request(request.into_inner().try_into()?);
    let response = self
      .0
      .create_volume(request)
      .await?
      .record_response()
      .try_into()?;
    Ok(tonic::Response::new(response))
  }

  #[instrument(
    name = "controller.delete_volume",
    skip(self, request),
    fields(request)
  )]
  async fn delete_volume(
    &self,
    request: tonic::Request<proto::DeleteVolumeRequest>,
  ) -> Result<tonic::Response<proto::DeleteVolumeResponse>, tonic::Status> {
    let request = record_request(request.into_inner().try_into()?);
    self.0.delete_volume(request).await?;
    let response = proto::DeleteVolumeResponse {};
    Ok(tonic::Response::new(response))
  }

  #[instrument(
    name = "controller.controller_publish_volume",
    skip(self, request),
    fields(request, response)
  )]
  async fn controller_publish_volume(
    &self,
    request: tonic::Request<proto::ControllerPublishVolumeRequest>,
  ) -> Result<tonic::Response<proto::ControllerPublishVolumeResponse>, tonic::Status> {
    let request = record_request(request.into_inner().try_into()?);
    let response = self
      .0
      .controller_publish_volume(request)
      .await?
      .record_response()
      .try_into()?;
    Ok(tonic::Response::new(response))
  }

  #[instrument(
    name = "controller.controller_unpublish_volume",
    skip(self, request),
    fields(request)
  )]
  async fn controller_unpublish_volume(
    &self,
    request: tonic::Request<proto::ControllerUnpublishVolumeRequest>,
  ) -> Result<tonic::Response<proto::ControllerUnpublishVolumeResponse>, tonic::Status> {
    let request = record_request(request.into_inner().try_into()?);
    self.0.controller_unpublish_volume(request).await?;
    let response = proto::ControllerUnpublishVolumeResponse {};
    Ok(tonic::Response::new(response))
  }

  #[instrument(
    name = "controller.validate_volume_capabilities",
    skip(self, request),
    fields(request, response)
  )]
  async fn validate_volume_capabilities(
    &self,
    request: tonic::Request<proto::ValidateVolumeCapabilitiesRequest>,
  ) -> Result<tonic::Response<proto::ValidateVolumeCapabilitiesResponse>, tonic::Status> {
    let request = record_request(request.into_inner().try_into()?);
    let response = self
      .0
      .validate_volume_capabilities(request)
      .await?
      .record_response()
      .try_into()?;
    Ok(tonic::Response::new(response))
  }

  #[instrument(name = "controller.list_volumes", skip(self, _request))]
  async fn list_volumes(
    &self,
    _request: tonic::Request<proto::ListVolumesRequest>,
  ) -> Result<tonic::Response<proto::ListVolumesResponse>, tonic::Status> {
    unsupported!("ListVolumes")
  }

  #[instrument(name = "controller.get_capacity", skip(self, _request))]
  async fn get_capacity(
    &self,
    _request: tonic::Request<proto::GetCapacityRequest>,
  ) -> Result<tonic::Response<proto::GetCapacityResponse>, tonic::Status> {
    unsupported!("GetCapacity")
  }

  #[instrument(
    name = "controller.controller_get_capabilities",
    skip(self),
    fields(response)
  )]
  async fn controller_get_capabilities(
    &self,
    _: tonic::Request<proto::ControllerGetCapabilitiesRequest>,
  ) -> Result<tonic::Response<proto::ControllerGetCapabilitiesResponse>, tonic::Status> {
    let response = self.0.capabilities().record_response().try_into()?;
    Ok(tonic::Response::new(response))
  }

  #[instrument(name = "controller.create_snapshot", skip(self, _request))]
  async fn create_snapshot(
    &self,
    _request: tonic::Request<proto::CreateSnapshotRequest>,
  ) -> Result<tonic::Response<proto::CreateSnapshotResponse>, tonic::Status> {
    unsupported!("CreateSnapshot")
  }

  #[instrument(name = "controller.delete_snapshot", skip(self, _request))]
  async fn delete_snapshot(
    &self,
    _request: tonic::Request<proto::DeleteSnapshotRequest>,
  ) -> Result<tonic::Response<proto::DeleteSnapshotResponse>, tonic::Status> {
    unsupported!("DeleteSnapshot")
  }

  #[instrument(name = "controller.list_snapshots", skip(self, _request))]
  async fn list_snapshots(
    &self,
    _request: tonic::Request<proto::ListSnapshotsRequest>,
  ) -> Result<tonic::Response<proto::ListSnapshotsResponse>, tonic::Status> {
    unsupported!("ListSnapshots")
  }

  #[instrument(
    name = "controller.controller_expand_volume",
    skip(self, request),
    fields(request, response)
  )]
  async fn controller_expand_volume(
    &self,
    request: tonic::Request<proto::ControllerExpandVolumeRequest>,
  ) -> Result<tonic::Response<proto::ControllerExpandVolumeResponse>, tonic::Status> {
    let request = record_request(request.into_inner().try_into()?);
    let response = self
      .0
      .controller_expand_volume(request)
      .await?
      .record_response()
      .try_into()?;
    Ok(tonic::Response::new(response))
  }

  #[instrument(name = "controller.controller_get_volume", skip(self, _request))]
  async fn controller_get_volume(
    &self,
    _request: tonic::Request<proto::ControllerGetVolumeRequest>,
  ) -> Result<tonic::Response<proto::ControllerGetVolumeResponse>, tonic::Status> {
    unsupported!("ControllerGetVolume")
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::VolumeExpansionSupport;
  use proto::{controller_server::Controller as _, identity_server::Identity as _};
  use std::sync::atomic::{AtomicUsize, Ordering};
  use tonic::{Code, Request};

  #[derive(Default)]
  struct Stub {
    calls: AtomicUsize,
  }

  impl IdentityService for Stub {
    fn name(&self) -> &str {
      "stub.csi.io"
    }

    fn version(&self) -> &str {
      "0.0.1"
    }

    fn volume_expansion_support(&self) -> VolumeExpansionSupport {
      VolumeExpansionSupport::Online
    }
  }

  #[async_trait]
  impl ControllerService for Stub {
    fn capabilities(&self) -> ControllerCapabilities {
      ControllerCapabilities::CREATE_DELETE_VOLUME | ControllerCapabilities::EXPAND_VOLUME
    }

    async fn delete_volume(&self, _request: DeleteVolumeRequest) -> Result<(), DeleteVolumeError> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      Ok(())
    }

    async fn validate_volume_capabilities(
      &self,
      request: ValidateVolumeCapabilitiesRequest,
    ) -> Result<ValidateVolumeCapabilitiesResponse, ValidateVolumeCapabilitiesError> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      Err(ValidateVolumeCapabilitiesError::VolumeNotFound(
        request.volume_id().to_owned(),
      ))
    }
  }

  fn adapter() -> (Arc<Stub>, Controller<Stub>) {
    let stub = Arc::new(Stub::default());
    (stub.clone(), Controller::new(stub))
  }

  #[tokio::test]
  async fn unimplemented_rpcs() {
    let (_, controller) = adapter();

    let codes = vec![
      controller
        .list_volumes(Request::new(Default::default()))
        .await
        .unwrap_err()
        .code(),
      controller
        .get_capacity(Request::new(Default::default()))
        .await
        .unwrap_err()
        .code(),
      controller
        .controller_get_volume(Request::new(Default::default()))
        .await
        .unwrap_err()
        .code(),
      controller
        .create_snapshot(Request::new(Default::default()))
        .await
        .unwrap_err()
        .code(),
      controller
        .delete_snapshot(Request::new(Default::default()))
        .await
        .unwrap_err()
        .code(),
      controller
        .list_snapshots(Request::new(Default::default()))
        .await
        .unwrap_err()
        .code(),
    ];

    assert!(codes.iter().all(|c| *c == Code::Unimplemented), "{:?}", codes);
  }

  #[tokio::test]
  async fn default_operations_are_unimplemented() {
    let (_, controller) = adapter();
    let err = controller
      .create_volume(Request::new(proto::CreateVolumeRequest {
        name: "pvc-1".to_owned(),
        volume_capabilities: vec![VolumeCapability::new(
          AccessMode::SingleNodeWriter,
          AccessType::Block,
        )
        .into()],
        ..Default::default()
      }))
      .await
      .unwrap_err();

    assert_eq!(err.code(), Code::Unimplemented);
  }

  #[tokio::test]
  async fn malformed_request_never_reaches_service() {
    let (stub, controller) = adapter();
    let err = controller
      .delete_volume(Request::new(proto::DeleteVolumeRequest::default()))
      .await
      .unwrap_err();

    assert_eq!(err.code(), Code::InvalidArgument);
    assert_eq!(stub.calls.load(Ordering::SeqCst), 0);

    controller
      .delete_volume(Request::new(proto::DeleteVolumeRequest {
        volume_id: "vol-1".to_owned(),
        ..Default::default()
      }))
      .await
      .unwrap();
    assert_eq!(stub.calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn service_errors_become_status() {
    let (_, controller) = adapter();
    let err = controller
      .validate_volume_capabilities(Request::new(proto::ValidateVolumeCapabilitiesRequest {
        volume_id: "vol-9".to_owned(),
        volume_capabilities: vec![VolumeCapability::new(
          AccessMode::SingleNodeWriter,
          AccessType::Block,
        )
        .into()],
        ..Default::default()
      }))
      .await
      .unwrap_err();

    assert_eq!(err.code(), Code::NotFound);
  }

  #[tokio::test]
  async fn controller_capabilities() {
    let (_, controller) = adapter();
    let response = controller
      .controller_get_capabilities(Request::new(Default::default()))
      .await
      .unwrap()
      .into_inner();

    assert_eq!(response.capabilities.len(), 2);
  }

  #[tokio::test]
  async fn plugin_identity() {
    let (_, controller) = adapter();
    let info = controller
      .get_plugin_info(Request::new(Default::default()))
      .await
      .unwrap()
      .into_inner();
    assert_eq!(info.name, "stub.csi.io");
    assert_eq!(info.vendor_version, "0.0.1");

    let probe = controller
      .probe(Request::new(Default::default()))
      .await
      .unwrap()
      .into_inner();
    assert_eq!(probe.ready, Some(true));

    let capabilities = controller
      .get_plugin_capabilities(Request::new(Default::default()))
      .await
      .unwrap()
      .into_inner()
      .capabilities;
    let controller_service = proto::PluginCapability {
      r#type: Some(proto::plugin_capability::Type::Service(
        proto::plugin_capability::Service {
          r#type: proto::plugin_capability::service::Type::ControllerService.into(),
        },
      )),
    };
    assert_eq!(
      capabilities
        .iter()
        .filter(|c| **c == controller_service)
        .count(),
      1
    );
    assert_eq!(capabilities.len(), 2);
  }
}
