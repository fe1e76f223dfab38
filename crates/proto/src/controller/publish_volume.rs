use super::{Secrets, VolumeCapability};
use crate::proto;
use std::{
  collections::HashMap,
  convert::{TryFrom, TryInto},
};
use thiserror::Error;

#[derive(Debug)]
pub struct ControllerPublishVolumeRequest {
  volume_id: String,
  node_id: String,
  volume_capability: VolumeCapability,
  readonly: bool,
  secrets: Secrets,
  volume_context: HashMap<String, String>,
}

impl ControllerPublishVolumeRequest {
  /// The ID of the volume to be used on a node.
  /// This field is REQUIRED.
  #[inline]
  pub fn volume_id(&self) -> &str {
    &self.volume_id
  }

  /// The ID of the node. This field is REQUIRED. The CO SHALL set this
  /// field to match the node ID returned by `NodeGetInfo`.
  #[inline]
  pub fn node_id(&self) -> &str {
    &self.node_id
  }

  /// Volume capability describing how the CO intends to use this volume.
  /// SP MUST ensure the CO can use the published volume as described.
  /// Otherwise SP MUST return the appropriate gRPC error code.
  #[inline]
  pub fn volume_capability(&self) -> &VolumeCapability {
    &self.volume_capability
  }

  /// Indicates SP MUST publish the volume in readonly mode.
  #[inline]
  pub fn readonly(&self) -> bool {
    self.readonly
  }

  /// Secrets required by plugin to complete controller publish volume
  /// request. This field is OPTIONAL.
  #[inline]
  pub fn secrets(&self) -> &HashMap<String, String> {
    self.secrets.as_ref()
  }

  /// Volume context as returned by SP in
  /// CreateVolumeResponse.Volume.volume_context.
  #[inline]
  pub fn volume_context(&self) -> &HashMap<String, String> {
    &self.volume_context
  }
}

impl TryFrom<proto::ControllerPublishVolumeRequest> for ControllerPublishVolumeRequest {
  type Error = tonic::Status;

  fn try_from(value: proto::ControllerPublishVolumeRequest) -> Result<Self, Self::Error> {
    let volume_id = match value.volume_id {
      v if v.is_empty() => {
        return Err(tonic::Status::invalid_argument(
          "ControllerPublishVolumeRequest.volume_id is empty",
        ))
      }
      v => v,
    };

    let node_id = match value.node_id {
      v if v.is_empty() => {
        return Err(tonic::Status::invalid_argument(
          "ControllerPublishVolumeRequest.node_id is empty",
        ))
      }
      v => v,
    };

    let volume_capability = match value.volume_capability {
      None => {
        return Err(tonic::Status::invalid_argument(
          "ControllerPublishVolumeRequest.volume_capability missing",
        ))
      }
      Some(v) => v.try_into()?,
    };

    Ok(ControllerPublishVolumeRequest {
      volume_id,
      node_id,
      volume_capability,
      readonly: value.readonly,
      secrets: value.secrets.into(),
      volume_context: value.volume_context,
    })
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ControllerPublishVolumeResponse {
  /// Opaque static publish properties of the volume, handed to the node
  /// on `NodeStageVolume` and `NodePublishVolume`. MUST NOT change for the
  /// lifetime of a publication and SHOULD NOT contain sensitive
  /// information.
  publish_context: HashMap<String, String>,
}

impl ControllerPublishVolumeResponse {
  #[inline]
  pub fn new(publish_context: HashMap<String, String>) -> Self {
    ControllerPublishVolumeResponse { publish_context }
  }

  #[inline]
  pub fn publish_context(&self) -> &HashMap<String, String> {
    &self.publish_context
  }
}

impl TryFrom<ControllerPublishVolumeResponse> for proto::ControllerPublishVolumeResponse {
  type Error = tonic::Status;

  fn try_from(value: ControllerPublishVolumeResponse) -> Result<Self, Self::Error> {
    Ok(proto::ControllerPublishVolumeResponse {
      publish_context: value.publish_context,
    })
  }
}

#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ControllerPublishVolumeError {
  /// Indicates that a volume corresponding to the specified `volume_id` does not exist.
  #[error("Volume does not exist: {0}")]
  VolumeDoesNotExist(String),

  /// Indicates that a node corresponding to the specified `node_id` does not exist.
  #[error("Node does not exist: {0}")]
  NodeDoesNotExist(String),

  /// Indicates that the volume corresponding to the specified `volume_id`
  /// is already published at another node and cannot be shared. The
  /// message SHOULD name the node involved.
  #[error("Volume already published: {0}")]
  AlreadyExists(String),

  #[error(transparent)]
  #[doc(hidden)]
  Other(#[from] tonic::Status),
}

impl From<ControllerPublishVolumeError> for tonic::Status {
  fn from(value: ControllerPublishVolumeError) -> tonic::Status {
    use tonic::{Code, Status};

    match value {
      ControllerPublishVolumeError::VolumeDoesNotExist(v) => Status::new(Code::NotFound, v),
      ControllerPublishVolumeError::NodeDoesNotExist(v) => Status::new(Code::NotFound, v),
      ControllerPublishVolumeError::AlreadyExists(v) => Status::new(Code::AlreadyExists, v),
      ControllerPublishVolumeError::Other(v) => v,
    }
  }
}
