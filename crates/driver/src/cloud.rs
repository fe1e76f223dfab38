//! The disk store the controller drives. Every piece of volume state lives
//! there; the controller keeps nothing between calls.

mod memory;

use crate::size::bytes_to_gib;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

pub use memory::{DiskAction, DiskOp, MemoryDiskStore};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CloudError {
  #[error("resource was not found")]
  NotFound,

  #[error("resource already exists")]
  AlreadyExists,

  /// A resource with the same name exists but was created with different
  /// parameters.
  #[error("parameters on this idempotent request were inconsistent with parameters given in a previous request: {0}")]
  IdempotentParameterMismatch(String),

  #[error("provider error: {0}")]
  Provider(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disk {
  pub volume_id: String,
  pub name: String,
  pub capacity_gib: u64,
  pub volume_type: Option<String>,
  /// World wide name of the device once attached.
  pub wwn: String,
  pub shareable: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiskOptions {
  pub shareable: bool,
  pub capacity_bytes: u64,
  pub volume_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
  pub instance_id: String,
  pub name: String,
}

impl Disk {
  /// Describes how this disk differs from what `options` asks for, or `None`
  /// when the disk satisfies them. A request without a volume type accepts
  /// whatever type the provider picked.
  pub fn mismatch(&self, options: &DiskOptions) -> Option<String> {
    let mut reasons = Vec::new();

    let requested_gib = bytes_to_gib(options.capacity_bytes);
    if requested_gib != self.capacity_gib {
      reasons.push(format!(
        "capacity {}GiB does not match existing {}GiB",
        requested_gib, self.capacity_gib
      ));
    }

    if let Some(requested) = options.volume_type.as_deref() {
      if self.volume_type.as_deref() != Some(requested) {
        reasons.push(format!(
          "type {:?} does not match existing {:?}",
          requested,
          self.volume_type.as_deref().unwrap_or_default()
        ));
      }
    }

    if options.shareable != self.shareable {
      reasons.push(format!(
        "shareable {} does not match existing {}",
        options.shareable, self.shareable
      ));
    }

    if reasons.is_empty() {
      None
    } else {
      Some(reasons.join(", "))
    }
  }
}

/// Client of the remote disk store. Calls are independent and may run
/// concurrently, including for the same disk.
#[async_trait]
pub trait DiskStore: Send + Sync + 'static {
  /// Creates a disk, or returns the existing one if a disk with `name`
  /// already exists and matches `options`.
  async fn create_disk(&self, name: &str, options: &DiskOptions) -> Result<Disk, CloudError>;

  async fn delete_disk(&self, volume_id: &str) -> Result<(), CloudError>;

  async fn get_disk_by_id(&self, volume_id: &str) -> Result<Disk, CloudError>;

  async fn get_disk_by_name(&self, name: &str) -> Result<Disk, CloudError>;

  async fn get_instance_by_id(&self, instance_id: &str) -> Result<Instance, CloudError>;

  /// Fails with [`CloudError::AlreadyExists`] when the disk is attached to
  /// another instance.
  async fn attach_disk(&self, volume_id: &str, instance_id: &str) -> Result<(), CloudError>;

  async fn detach_disk(&self, volume_id: &str, instance_id: &str) -> Result<(), CloudError>;

  async fn is_attached(&self, volume_id: &str, instance_id: &str) -> Result<bool, CloudError>;

  /// Grows the disk to hold at least `new_size_bytes` and returns the size
  /// it ended up with, in GiB.
  async fn resize_disk(&self, volume_id: &str, new_size_bytes: u64) -> Result<u64, CloudError>;
}

#[async_trait]
impl<S: DiskStore + ?Sized> DiskStore for Arc<S> {
  #[inline]
  async fn create_disk(&self, name: &str, options: &DiskOptions) -> Result<Disk, CloudError> {
    (**self).create_disk(name, options).await
  }

  #[inline]
  async fn delete_disk(&self, volume_id: &str) -> Result<(), CloudError> {
    (**self).delete_disk(volume_id).await
  }

  #[inline]
  async fn get_disk_by_id(&self, volume_id: &str) -> Result<Disk, CloudError> {
    (**self).get_disk_by_id(volume_id).await
  }

  #[inline]
  async fn get_disk_by_name(&self, name: &str) -> Result<Disk, CloudError> {
    (**self).get_disk_by_name(name).await
  }

  #[inline]
  async fn get_instance_by_id(&self, instance_id: &str) -> Result<Instance, CloudError> {
    (**self).get_instance_by_id(instance_id).await
  }

  #[inline]
  async fn attach_disk(&self, volume_id: &str, instance_id: &str) -> Result<(), CloudError> {
    (**self).attach_disk(volume_id, instance_id).await
  }

  #[inline]
  async fn detach_disk(&self, volume_id: &str, instance_id: &str) -> Result<(), CloudError> {
    (**self).detach_disk(volume_id, instance_id).await
  }

  #[inline]
  async fn is_attached(&self, volume_id: &str, instance_id: &str) -> Result<bool, CloudError> {
    (**self).is_attached(volume_id, instance_id).await
  }

  #[inline]
  async fn resize_disk(&self, volume_id: &str, new_size_bytes: u64) -> Result<u64, CloudError> {
    (**self).resize_disk(volume_id, new_size_bytes).await
  }
}
