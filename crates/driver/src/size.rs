//! Allocation sizes. Disks are provisioned in whole GiB, so every requested
//! byte count is rounded up to that unit before it reaches the disk store.

use csi_proto::controller::CapacityRange;
use thiserror::Error;

pub const GIB: u64 = 1 << 30;

/// Size used when the CO does not ask for one.
pub const DEFAULT_VOLUME_SIZE: u64 = GIB;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SizeError {
  #[error("After round-up, volume size {size} exceeds the limit specified ({limit})")]
  ExceedsLimit { size: u64, limit: u64 },

  #[error("After round-up, volume size {size} exceeds the largest supported size ({max})")]
  TooLarge { size: u64, max: u64 },
}

/// Largest size that can be reported back in an int64 capacity field.
pub const MAX_VOLUME_SIZE: u64 = i64::MAX as u64;

/// Number of GiB needed to hold `bytes`.
#[inline]
pub fn bytes_to_gib(bytes: u64) -> u64 {
  bytes / GIB + u64::from(bytes % GIB != 0)
}

#[inline]
pub fn gib_to_bytes(gib: u64) -> u64 {
  gib.saturating_mul(GIB)
}

#[inline]
pub fn round_up_bytes(bytes: u64) -> u64 {
  gib_to_bytes(bytes_to_gib(bytes))
}

/// Turns a requested range into the allocation size for a disk. Both create
/// and expand go through here so a volume is rounded the same way for its
/// whole life.
pub fn normalize(range: Option<&CapacityRange>) -> Result<u64, SizeError> {
  let required = range.map(CapacityRange::required_bytes).unwrap_or_default();
  let size = match required {
    0 => DEFAULT_VOLUME_SIZE,
    n => round_up_bytes(n),
  };

  if size > MAX_VOLUME_SIZE {
    return Err(SizeError::TooLarge {
      size,
      max: MAX_VOLUME_SIZE,
    });
  }

  match range.and_then(CapacityRange::limit_bytes) {
    Some(limit) if limit.get() < size => Err(SizeError::ExceedsLimit {
      size,
      limit: limit.get(),
    }),
    _ => Ok(size),
  }
}
