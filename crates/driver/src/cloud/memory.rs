use super::{CloudError, Disk, DiskOptions, DiskStore, Instance};
use crate::size::bytes_to_gib;
use async_trait::async_trait;
use std::{
  collections::HashMap,
  sync::{Mutex, MutexGuard, PoisonError},
};
use tracing::debug;

/// Type given to disks created without one.
pub const DEFAULT_VOLUME_TYPE: &str = "tier3";

const WWN_PREFIX: u128 = 0x6005_0768_1081_0000_0000_0000_0000_0000;

/// Store operations that can be made to fail with [`MemoryDiskStore::fail_next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiskOp {
  Create,
  Delete,
  GetDiskById,
  GetDiskByName,
  GetInstance,
  Attach,
  Detach,
  IsAttached,
  Resize,
}

/// A mutation applied to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiskAction {
  Created { volume_id: String, capacity_gib: u64 },
  Deleted { volume_id: String },
  Attached { volume_id: String, instance_id: String },
  Detached { volume_id: String, instance_id: String },
  Resized { volume_id: String, capacity_gib: u64 },
}

#[derive(Default)]
struct State {
  next_id: u64,
  disks: HashMap<String, Disk>,
  // volume id -> instance id
  attachments: HashMap<String, String>,
  instances: HashMap<String, Instance>,
  actions: Vec<DiskAction>,
  failures: HashMap<DiskOp, CloudError>,
}

impl State {
  fn check(&mut self, op: DiskOp) -> Result<(), CloudError> {
    match self.failures.remove(&op) {
      Some(err) => {
        debug!(?op, %err, "injected failure");
        Err(err)
      }
      None => Ok(()),
    }
  }

  fn disk(&self, volume_id: &str) -> Result<&Disk, CloudError> {
    self.disks.get(volume_id).ok_or(CloudError::NotFound)
  }
}

/// A disk store held in process memory. Disks are sized in whole GiB and can
/// be attached to one instance at a time.
#[derive(Default)]
pub struct MemoryDiskStore {
  state: Mutex<State>,
}

impl MemoryDiskStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn state(&self) -> MutexGuard<'_, State> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Makes an instance known to the store so disks can be attached to it.
  pub fn add_instance(&self, instance_id: impl Into<String>, name: impl Into<String>) {
    let instance = Instance {
      instance_id: instance_id.into(),
      name: name.into(),
    };

    self
      .state()
      .instances
      .insert(instance.instance_id.clone(), instance);
  }

  /// Every mutation applied so far, oldest first.
  pub fn actions(&self) -> Vec<DiskAction> {
    self.state().actions.clone()
  }

  /// The next call of `op` fails with `err` without touching the store.
  pub fn fail_next(&self, op: DiskOp, err: CloudError) {
    self.state().failures.insert(op, err);
  }

  /// Instance the disk is attached to, if any.
  pub fn attachment(&self, volume_id: &str) -> Option<String> {
    self.state().attachments.get(volume_id).cloned()
  }
}

#[async_trait]
impl DiskStore for MemoryDiskStore {
  async fn create_disk(&self, name: &str, options: &DiskOptions) -> Result<Disk, CloudError> {
    let mut state = self.state();
    state.check(DiskOp::Create)?;

    if let Some(disk) = state.disks.values().find(|d| d.name == name) {
      return match disk.mismatch(options) {
        Some(reason) => Err(CloudError::IdempotentParameterMismatch(reason)),
        None => Ok(disk.clone()),
      };
    }

    state.next_id += 1;
    let id = state.next_id;
    let disk = Disk {
      volume_id: format!("vol-{}", id),
      name: name.to_owned(),
      capacity_gib: bytes_to_gib(options.capacity_bytes),
      volume_type: Some(
        options
          .volume_type
          .clone()
          .unwrap_or_else(|| DEFAULT_VOLUME_TYPE.to_owned()),
      ),
      wwn: format!("{:032X}", WWN_PREFIX | u128::from(id)),
      shareable: options.shareable,
    };

    state.actions.push(DiskAction::Created {
      volume_id: disk.volume_id.clone(),
      capacity_gib: disk.capacity_gib,
    });
    state.disks.insert(disk.volume_id.clone(), disk.clone());
    Ok(disk)
  }

  async fn delete_disk(&self, volume_id: &str) -> Result<(), CloudError> {
    let mut state = self.state();
    state.check(DiskOp::Delete)?;

    state.disks.remove(volume_id).ok_or(CloudError::NotFound)?;
    state.attachments.remove(volume_id);
    state.actions.push(DiskAction::Deleted {
      volume_id: volume_id.to_owned(),
    });
    Ok(())
  }

  async fn get_disk_by_id(&self, volume_id: &str) -> Result<Disk, CloudError> {
    let mut state = self.state();
    state.check(DiskOp::GetDiskById)?;
    state.disk(volume_id).map(Clone::clone)
  }

  async fn get_disk_by_name(&self, name: &str) -> Result<Disk, CloudError> {
    let mut state = self.state();
    state.check(DiskOp::GetDiskByName)?;
    state
      .disks
      .values()
      .find(|d| d.name == name)
      .cloned()
      .ok_or(CloudError::NotFound)
  }

  async fn get_instance_by_id(&self, instance_id: &str) -> Result<Instance, CloudError> {
    let mut state = self.state();
    state.check(DiskOp::GetInstance)?;
    state
      .instances
      .get(instance_id)
      .cloned()
      .ok_or(CloudError::NotFound)
  }

  async fn attach_disk(&self, volume_id: &str, instance_id: &str) -> Result<(), CloudError> {
    let mut state = self.state();
    state.check(DiskOp::Attach)?;
    state.disk(volume_id)?;
    if !state.instances.contains_key(instance_id) {
      return Err(CloudError::NotFound);
    }

    match state.attachments.get(volume_id) {
      Some(current) if current == instance_id => return Ok(()),
      Some(_) => return Err(CloudError::AlreadyExists),
      None => (),
    }

    state
      .attachments
      .insert(volume_id.to_owned(), instance_id.to_owned());
    state.actions.push(DiskAction::Attached {
      volume_id: volume_id.to_owned(),
      instance_id: instance_id.to_owned(),
    });
    Ok(())
  }

  async fn detach_disk(&self, volume_id: &str, instance_id: &str) -> Result<(), CloudError> {
    let mut state = self.state();
    state.check(DiskOp::Detach)?;
    state.disk(volume_id)?;

    if state.attachments.get(volume_id).map(String::as_str) == Some(instance_id) {
      state.attachments.remove(volume_id);
      state.actions.push(DiskAction::Detached {
        volume_id: volume_id.to_owned(),
        instance_id: instance_id.to_owned(),
      });
    }

    Ok(())
  }

  async fn is_attached(&self, volume_id: &str, instance_id: &str) -> Result<bool, CloudError> {
    let mut state = self.state();
    state.check(DiskOp::IsAttached)?;
    state.disk(volume_id)?;
    Ok(state.attachments.get(volume_id).map(String::as_str) == Some(instance_id))
  }

  async fn resize_disk(&self, volume_id: &str, new_size_bytes: u64) -> Result<u64, CloudError> {
    let mut state = self.state();
    state.check(DiskOp::Resize)?;

    let requested_gib = bytes_to_gib(new_size_bytes);
    let disk = state
      .disks
      .get_mut(volume_id)
      .ok_or(CloudError::NotFound)?;
    if requested_gib <= disk.capacity_gib {
      return Ok(disk.capacity_gib);
    }

    disk.capacity_gib = requested_gib;
    state.actions.push(DiskAction::Resized {
      volume_id: volume_id.to_owned(),
      capacity_gib: requested_gib,
    });
    Ok(requested_gib)
  }
}
