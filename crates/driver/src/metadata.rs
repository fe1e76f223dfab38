use std::str::FromStr;
use thiserror::Error;

const PROVIDER_ID_PARTS: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MetadataError {
  #[error(
    "invalid ProviderID format - {provider_id}, expected format - \
     <scheme>://<region>/<zone>/<service_instance_id>/<machine_id>, err: {reason}"
  )]
  InvalidProviderId {
    provider_id: String,
    reason: &'static str,
  },
}

/// Location of the instance the driver runs on, decoded from the node's
/// provider ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
  region: String,
  zone: String,
  cloud_instance_id: String,
  pvm_instance_id: String,
}

impl Metadata {
  #[inline]
  pub fn region(&self) -> &str {
    &self.region
  }

  #[inline]
  pub fn zone(&self) -> &str {
    &self.zone
  }

  /// The service instance that owns the disks.
  #[inline]
  pub fn cloud_instance_id(&self) -> &str {
    &self.cloud_instance_id
  }

  /// The machine the driver runs on.
  #[inline]
  pub fn pvm_instance_id(&self) -> &str {
    &self.pvm_instance_id
  }
}

impl FromStr for Metadata {
  type Err = MetadataError;

  fn from_str(provider_id: &str) -> Result<Self, Self::Err> {
    let invalid = |reason| MetadataError::InvalidProviderId {
      provider_id: provider_id.to_owned(),
      reason,
    };

    let parts = provider_id.split('/').collect::<Vec<_>>();
    if parts.len() != PROVIDER_ID_PARTS {
      return Err(invalid("invalid length"));
    }

    let required = |index: usize, reason| match parts[index] {
      "" => Err(invalid(reason)),
      part => Ok(part.to_owned()),
    };

    Ok(Metadata {
      region: required(2, "region can't be empty")?,
      zone: required(3, "zone can't be empty")?,
      cloud_instance_id: required(4, "service_instance_id can't be empty")?,
      pvm_instance_id: required(5, "machine_id can't be empty")?,
    })
  }
}
