use std::collections::HashMap;
use thiserror::Error;

/// Parameter selecting the provider's volume type (tier).
pub const VOLUME_TYPE_KEY: &str = "type";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParameterError {
  #[error("Invalid parameter key {0} for CreateVolume")]
  UnknownKey(String),
}

/// Options a CO may pass through the storage class when creating a volume.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumeParameters {
  volume_type: Option<String>,
}

impl VolumeParameters {
  /// Keys are matched without regard to case. Any key other than `type` is
  /// rejected.
  pub fn parse(parameters: &HashMap<String, String>) -> Result<Self, ParameterError> {
    let mut result = VolumeParameters::default();
    for (key, value) in parameters {
      if key.eq_ignore_ascii_case(VOLUME_TYPE_KEY) {
        result.volume_type = Some(value.clone());
      } else {
        return Err(ParameterError::UnknownKey(key.clone()));
      }
    }

    Ok(result)
  }

  /// Requested volume type; `None` lets the provider pick its default.
  #[inline]
  pub fn volume_type(&self) -> Option<&str> {
    self.volume_type.as_deref()
  }
}
