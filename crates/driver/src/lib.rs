pub mod capability;
pub mod cloud;
pub mod controller;
pub mod metadata;
pub mod options;
pub mod parameters;
pub mod size;

pub use cloud::{CloudError, DiskStore, MemoryDiskStore};
pub use controller::VolumeController;
pub use metadata::{Metadata, MetadataError};
pub use options::DriverOptions;
