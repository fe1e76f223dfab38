use super::{CapacityRange, Secrets, VolumeCapability};
use crate::proto;
use std::{
  collections::HashMap,
  convert::{TryFrom, TryInto},
};
use thiserror::Error;

#[derive(Debug)]
pub struct CreateVolumeRequest {
  name: String,
  capacity_range: Option<CapacityRange>,
  volume_capabilities: Vec<VolumeCapability>,
  parameters: HashMap<String, String>,
  secrets: Secrets,
}

impl CreateVolumeRequest {
  /// The suggested name for the storage space. This field is REQUIRED.
  /// It serves two purposes:
  /// 1) Idempotency - This name is generated by the CO to achieve
  ///    idempotency. The Plugin SHOULD ensure that multiple
  ///    `CreateVolume` calls for the same name do not result in more
  ///    than one piece of storage provisioned corresponding to that
  ///    name. If a Plugin is unable to enforce idempotency, the CO's
  ///    error recovery logic could result in multiple (unused) volumes
  ///    being provisioned.
  /// 2) Suggested name - Some storage systems allow callers to specify
  ///    an identifier by which to refer to the newly provisioned
  ///    storage.
  #[inline]
  pub fn name(&self) -> &str {
    &self.name
  }

  /// This field is OPTIONAL. This allows the CO to specify the capacity
  /// requirement of the volume to be provisioned. If not specified, the
  /// Plugin MAY choose an implementation-defined capacity range.
  #[inline]
  pub fn capacity_range(&self) -> Option<&CapacityRange> {
    self.capacity_range.as_ref()
  }

  /// The capabilities that the provisioned volume MUST have. SP MUST
  /// provision a volume that will satisfy ALL of the capabilities
  /// specified in this list. This field is REQUIRED, so the list is
  /// never empty.
  #[inline]
  pub fn volume_capabilities(&self) -> &[VolumeCapability] {
    &self.volume_capabilities
  }

  /// Plugin specific parameters passed in as opaque key-value pairs.
  /// This field is OPTIONAL. The Plugin is responsible for parsing and
  /// validating these parameters.
  #[inline]
  pub fn parameters(&self) -> &HashMap<String, String> {
    &self.parameters
  }

  /// Secrets required by plugin to complete volume creation request.
  /// This field is OPTIONAL.
  #[inline]
  pub fn secrets(&self) -> &HashMap<String, String> {
    self.secrets.as_ref()
  }
}

impl TryFrom<proto::CreateVolumeRequest> for CreateVolumeRequest {
  type Error = tonic::Status;

  fn try_from(value: proto::CreateVolumeRequest) -> Result<Self, Self::Error> {
    let name = match value.name {
      v if v.is_empty() => {
        return Err(tonic::Status::invalid_argument(
          "CreateVolumeRequest.name is empty",
        ))
      }
      v => v,
    };

    let capacity_range = value.capacity_range.map(TryInto::try_into).transpose()?;

    let volume_capabilities = match value.volume_capabilities {
      v if v.is_empty() => {
        return Err(tonic::Status::invalid_argument(
          "CreateVolumeRequest.volume_capabilities is empty",
        ))
      }
      v => v
        .into_iter()
        .map(TryInto::try_into)
        .collect::<Result<_, _>>()?,
    };

    let parameters = value.parameters;
    let secrets = value.secrets.into();

    Ok(CreateVolumeRequest {
      name,
      capacity_range,
      volume_capabilities,
      parameters,
      secrets,
    })
  }
}

#[non_exhaustive]
#[derive(Debug, Error)]
pub enum CreateVolumeError {
  /// Indicates that the request is well formed but asks for something the
  /// plugin does not support, such as an unknown parameter, an unsupported
  /// access mode or a size beyond the requested limit.
  #[error("Invalid argument: {0}")]
  InvalidArgument(String),

  /// Indicates that the backing storage reported a referenced resource as
  /// missing while provisioning.
  #[error("Not found: {0}")]
  NotFound(String),

  /// Indicates that a volume corresponding to the specified volume `name`
  /// already exists but is incompatible with the specified `capacity_range`,
  /// `volume_capabilities` or `parameters`.
  #[error("Volume already exists but is incompatible: {0}")]
  AlreadyExists(String),

  #[error(transparent)]
  #[doc(hidden)]
  Other(#[from] tonic::Status),
}

impl From<CreateVolumeError> for tonic::Status {
  fn from(value: CreateVolumeError) -> tonic::Status {
    use tonic::{Code, Status};

    match value {
      CreateVolumeError::InvalidArgument(v) => Status::new(Code::InvalidArgument, v),
      CreateVolumeError::NotFound(v) => Status::new(Code::NotFound, v),
      CreateVolumeError::AlreadyExists(v) => Status::new(Code::AlreadyExists, v),
      CreateVolumeError::Other(v) => v,
    }
  }
}
