use std::{
  collections::HashMap,
  convert::{TryFrom, TryInto},
  fmt,
  num::NonZeroU64,
};

use crate::proto;

pub(crate) fn bytes_to_i64(value: u64, field: &'static str) -> Result<i64, tonic::Status> {
  i64::try_from(value)
    .map_err(|_| tonic::Status::internal(format!("{} {} does not fit in int64", field, value)))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
  volume_id: String,
  capacity_bytes: Option<NonZeroU64>,
  volume_context: HashMap<String, String>,
}

impl Volume {
  /// A volume as reported back to the CO. A `capacity_bytes` of 0 means the
  /// capacity is unknown.
  pub fn new(volume_id: impl Into<String>, capacity_bytes: u64) -> Self {
    Volume {
      volume_id: volume_id.into(),
      capacity_bytes: NonZeroU64::new(capacity_bytes),
      volume_context: HashMap::new(),
    }
  }

  #[inline]
  pub fn volume_id(&self) -> &str {
    &self.volume_id
  }

  #[inline]
  pub fn capacity_bytes(&self) -> u64 {
    self.capacity_bytes.map(NonZeroU64::get).unwrap_or_default()
  }

  #[inline]
  pub fn volume_context(&self) -> &HashMap<String, String> {
    &self.volume_context
  }
}

impl TryFrom<Volume> for proto::Volume {
  type Error = tonic::Status;

  fn try_from(value: Volume) -> Result<Self, Self::Error> {
    let capacity_bytes = bytes_to_i64(value.capacity_bytes(), "Volume.capacity_bytes")?;
    let volume_id = value.volume_id;
    let volume_context = value.volume_context;

    Ok(proto::Volume {
      capacity_bytes,
      volume_id,
      volume_context,
      content_source: None,
      accessible_topology: Vec::new(),
    })
  }
}

impl TryFrom<Volume> for proto::CreateVolumeResponse {
  type Error = tonic::Status;

  fn try_from(value: Volume) -> Result<Self, Self::Error> {
    let volume = Some(value.try_into()?);

    Ok(proto::CreateVolumeResponse { volume })
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeCapability {
  access_mode: AccessMode,
  access_type: AccessType,
}

impl VolumeCapability {
  #[inline]
  pub fn new(access_mode: AccessMode, access_type: AccessType) -> Self {
    VolumeCapability {
      access_mode,
      access_type,
    }
  }

  /// How the volume may be shared between nodes.
  #[inline]
  pub fn access_mode(&self) -> AccessMode {
    self.access_mode
  }

  /// Whether the volume is consumed as a raw block device or a filesystem.
  #[inline]
  pub fn access_type(&self) -> &AccessType {
    &self.access_type
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum AccessMode {
  Unknown,
  /// Can only be published once as read/write on a single node, at
  /// any given time.
  SingleNodeWriter,
  /// Can only be published once as readonly on a single node, at
  /// any given time.
  SingleNodeReaderOnly,
  /// Can be published as readonly at multiple nodes simultaneously.
  MultiNodeReaderOnly,
  /// Can be published at multiple nodes simultaneously. Only one of
  /// the node can be used as read/write. The rest will be readonly.
  MultiNodeSingleWriter,
  /// Can be published as read/write at multiple nodes
  /// simultaneously.
  MultiNodeMultiWriter,
}

impl AccessMode {
  /// The mode's name as spelled in the CSI protocol.
  pub fn as_str(self) -> &'static str {
    match self {
      AccessMode::Unknown => "UNKNOWN",
      AccessMode::SingleNodeWriter => "SINGLE_NODE_WRITER",
      AccessMode::SingleNodeReaderOnly => "SINGLE_NODE_READER_ONLY",
      AccessMode::MultiNodeReaderOnly => "MULTI_NODE_READER_ONLY",
      AccessMode::MultiNodeSingleWriter => "MULTI_NODE_SINGLE_WRITER",
      AccessMode::MultiNodeMultiWriter => "MULTI_NODE_MULTI_WRITER",
    }
  }
}

impl fmt::Display for AccessMode {
  #[inline]
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl From<proto::volume_capability::AccessMode> for AccessMode {
  fn from(value: proto::volume_capability::AccessMode) -> Self {
    use proto::volume_capability::access_mode::Mode;

    match Mode::from_i32(value.mode) {
      Some(Mode::SingleNodeWriter) => AccessMode::SingleNodeWriter,
      Some(Mode::SingleNodeReaderOnly) => AccessMode::SingleNodeReaderOnly,
      Some(Mode::MultiNodeReaderOnly) => AccessMode::MultiNodeReaderOnly,
      Some(Mode::MultiNodeSingleWriter) => AccessMode::MultiNodeSingleWriter,
      Some(Mode::MultiNodeMultiWriter) => AccessMode::MultiNodeMultiWriter,
      Some(Mode::Unknown) | None => AccessMode::Unknown,
    }
  }
}

impl From<AccessMode> for proto::volume_capability::AccessMode {
  fn from(value: AccessMode) -> Self {
    use proto::volume_capability::access_mode::Mode;

    let mode = match value {
      AccessMode::Unknown => Mode::Unknown,
      AccessMode::SingleNodeWriter => Mode::SingleNodeWriter,
      AccessMode::SingleNodeReaderOnly => Mode::SingleNodeReaderOnly,
      AccessMode::MultiNodeReaderOnly => Mode::MultiNodeReaderOnly,
      AccessMode::MultiNodeSingleWriter => Mode::MultiNodeSingleWriter,
      AccessMode::MultiNodeMultiWriter => Mode::MultiNodeMultiWriter,
    } as i32;

    proto::volume_capability::AccessMode { mode }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessType {
  /// Indicate that the volume will be accessed via the block device API.
  Block,

  /// Indicate that the volume will be accessed via the filesystem API.
  Mount(MountVolume),
}

impl From<proto::volume_capability::AccessType> for AccessType {
  fn from(value: proto::volume_capability::AccessType) -> Self {
    match value {
      proto::volume_capability::AccessType::Block(_) => AccessType::Block,
      proto::volume_capability::AccessType::Mount(v) => AccessType::Mount(v.into()),
    }
  }
}

impl From<AccessType> for proto::volume_capability::AccessType {
  fn from(value: AccessType) -> Self {
    match value {
      AccessType::Block => {
        proto::volume_capability::AccessType::Block(proto::volume_capability::BlockVolume {})
      }
      AccessType::Mount(v) => proto::volume_capability::AccessType::Mount(v.into()),
    }
  }
}

#[derive(Clone, PartialEq, Eq, Default)]
pub struct MountVolume {
  fs_type: Option<String>,
  mount_flags: Vec<String>,
}

impl MountVolume {
  #[inline]
  pub fn new(fs_type: Option<String>, mount_flags: Vec<String>) -> Self {
    MountVolume {
      fs_type,
      mount_flags,
    }
  }

  /// The filesystem type.
  #[inline]
  pub fn fs_type(&self) -> Option<&str> {
    self.fs_type.as_deref()
  }

  /// The mount options that can be used for the volume. This field is
  /// OPTIONAL. `mount_flags` MAY contain sensitive information.
  /// Therefore, the CO and the Plugin MUST NOT leak this information
  /// to untrusted entities.
  pub fn mount_flags(&self) -> impl Iterator<Item = &str> + ExactSizeIterator {
    self.mount_flags.iter().map(|v| &**v)
  }
}

impl From<proto::volume_capability::MountVolume> for MountVolume {
  fn from(value: proto::volume_capability::MountVolume) -> Self {
    let fs_type = match value.fs_type {
      v if v.is_empty() => None,
      v => Some(v),
    };

    MountVolume {
      fs_type,
      mount_flags: value.mount_flags,
    }
  }
}

impl From<MountVolume> for proto::volume_capability::MountVolume {
  fn from(value: MountVolume) -> Self {
    proto::volume_capability::MountVolume {
      fs_type: value.fs_type.unwrap_or_default(),
      mount_flags: value.mount_flags,
    }
  }
}

impl fmt::Debug for MountVolume {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MountVolume")
      .field("fs_type", &self.fs_type)
      .field(
        "mount_flags",
        &format!("REDACTED ({} items)", self.mount_flags.len()),
      )
      .finish()
  }
}

impl TryFrom<proto::VolumeCapability> for VolumeCapability {
  type Error = tonic::Status;

  fn try_from(value: proto::VolumeCapability) -> Result<Self, Self::Error> {
    let access_mode = value
      .access_mode
      .ok_or_else(|| tonic::Status::invalid_argument("Missing access_mode for VolumeCapability"))?
      .into();

    let access_type = value
      .access_type
      .ok_or_else(|| tonic::Status::invalid_argument("Missing access_type for VolumeCapability"))?
      .into();

    Ok(VolumeCapability {
      access_mode,
      access_type,
    })
  }
}

impl From<VolumeCapability> for proto::VolumeCapability {
  fn from(value: VolumeCapability) -> Self {
    proto::VolumeCapability {
      access_mode: Some(value.access_mode.into()),
      access_type: Some(value.access_type.into()),
    }
  }
}

/// Requested size bounds for a volume. A bound of 0 on the wire means the
/// CO left it unspecified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CapacityRange {
  required_bytes: Option<NonZeroU64>,
  limit_bytes: Option<NonZeroU64>,
}

impl CapacityRange {
  #[inline]
  pub fn new(required_bytes: u64, limit_bytes: u64) -> Self {
    CapacityRange {
      required_bytes: NonZeroU64::new(required_bytes),
      limit_bytes: NonZeroU64::new(limit_bytes),
    }
  }

  /// Volume MUST be at least this big; 0 when unspecified.
  #[inline]
  pub fn required_bytes(&self) -> u64 {
    self.required_bytes.map(NonZeroU64::get).unwrap_or_default()
  }

  /// Volume MUST not be bigger than this, if set.
  #[inline]
  pub fn limit_bytes(&self) -> Option<NonZeroU64> {
    self.limit_bytes
  }
}

impl TryFrom<proto::CapacityRange> for CapacityRange {
  type Error = tonic::Status;

  fn try_from(value: proto::CapacityRange) -> Result<Self, Self::Error> {
    let required_bytes = u64::try_from(value.required_bytes).map_err(|_| {
      tonic::Status::invalid_argument("CapacityRange.required_bytes cannot be negative")
    })?;
    let limit_bytes = u64::try_from(value.limit_bytes)
      .map_err(|_| tonic::Status::invalid_argument("CapacityRange.limit_bytes cannot be negative"))?;

    Ok(CapacityRange::new(required_bytes, limit_bytes))
  }
}
