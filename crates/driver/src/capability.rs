use csi_proto::controller::{AccessMode, VolumeCapability};

/// Access modes the driver can honour. Attachment is exclusive, so only a
/// single read/write node is supported.
pub const SUPPORTED_ACCESS_MODES: &[AccessMode] = &[AccessMode::SingleNodeWriter];

#[inline]
pub fn is_supported(capability: &VolumeCapability) -> bool {
  SUPPORTED_ACCESS_MODES.contains(&capability.access_mode())
}

/// True when every capability is supported. An empty list is never
/// supported.
pub fn all_supported(capabilities: &[VolumeCapability]) -> bool {
  !capabilities.is_empty() && capabilities.iter().all(is_supported)
}

pub fn unsupported_message(capabilities: &[VolumeCapability]) -> String {
  let modes = capabilities
    .iter()
    .map(|c| c.access_mode().as_str())
    .collect::<Vec<_>>()
    .join(", ");

  format!(
    "Volume capabilities {} not supported. Only AccessModes[ReadWriteOnce] supported.",
    modes
  )
}
