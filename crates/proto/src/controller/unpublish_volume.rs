use super::Secrets;
use crate::proto;
use std::{collections::HashMap, convert::TryFrom};
use thiserror::Error;

#[derive(Debug)]
pub struct ControllerUnpublishVolumeRequest {
  volume_id: String,
  node_id: String,
  secrets: Secrets,
}

impl ControllerUnpublishVolumeRequest {
  /// The ID of the volume. This field is REQUIRED.
  #[inline]
  pub fn volume_id(&self) -> &str {
    &self.volume_id
  }

  /// The ID of the node to unpublish the volume from.
  #[inline]
  pub fn node_id(&self) -> &str {
    &self.node_id
  }

  /// Secrets required by plugin to complete controller unpublish volume
  /// request. This SHOULD be the same secrets passed to the
  /// ControllerPublishVolume call for the specified volume.
  #[inline]
  pub fn secrets(&self) -> &HashMap<String, String> {
    self.secrets.as_ref()
  }
}

impl TryFrom<proto::ControllerUnpublishVolumeRequest> for ControllerUnpublishVolumeRequest {
  type Error = tonic::Status;

  fn try_from(value: proto::ControllerUnpublishVolumeRequest) -> Result<Self, Self::Error> {
    let volume_id = match value.volume_id {
      v if v.is_empty() => {
        return Err(tonic::Status::invalid_argument(
          "ControllerUnpublishVolumeRequest.volume_id is empty",
        ))
      }
      v => v,
    };

    // The CO may leave the node unset to mean "every node", which a
    // single-writer plugin has no use for.
    let node_id = match value.node_id {
      v if v.is_empty() => {
        return Err(tonic::Status::invalid_argument(
          "ControllerUnpublishVolumeRequest.node_id is empty",
        ))
      }
      v => v,
    };

    Ok(ControllerUnpublishVolumeRequest {
      volume_id,
      node_id,
      secrets: value.secrets.into(),
    })
  }
}

/// A volume or node that cannot be found is treated as already unpublished,
/// so only backend failures remain.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ControllerUnpublishVolumeError {
  #[error(transparent)]
  #[doc(hidden)]
  Other(#[from] tonic::Status),
}

impl From<ControllerUnpublishVolumeError> for tonic::Status {
  fn from(value: ControllerUnpublishVolumeError) -> Self {
    match value {
      ControllerUnpublishVolumeError::Other(v) => v,
    }
  }
}
