//! The core, UI-agnostic library for the `blockgate` storage utility.
//!
//! `blockgate-core` discovers removable USB storage devices and hands out
//! exclusive raw access to them. It can be used by any front-end, whether it's
//! a command-line interface (like `blockgate`) or a graphical one.
//!
//! The library is structured into several key modules:
//! - [`service`]: [`StorageDeviceService`], the entry point that wires a
//!   platform backend into everything else.
//! - [`device`], [`partition`], [`mountpoint`]: the entity model. Devices
//!   produce their partitions and mountpoints on demand, never caching them.
//! - [`mod@file`]: [`StorageDeviceFile`], which unmounts a device before
//!   opening it and keeps every transfer sector-aligned.
//! - [`native`] and [`platform`]: the [`NativeProvider`] contract and its
//!   per-OS implementations.
//!
//! Nothing in the public entity API returns an error. Platform failures are
//! logged through `tracing` and reported as `false`, an empty list or a
//! zero-byte transfer.
//!
//! ## Example: Overwriting the First Sector of a Stick
//!
//! ```rust,no_run
//! use blockgate_core::{OpenMode, StorageDeviceService};
//!
//! let service = StorageDeviceService::new();
//! let devices = service.get_available_storage_devices();
//! let Some(device) = devices.first() else {
//!     println!("No USB storage devices found.");
//!     return;
//! };
//!
//! let mut file = service.make_storage_device_file(device.file_path(), device.clone());
//! if !file.open(OpenMode::ReadWrite) {
//!     println!("{device} is busy or could not be opened.");
//!     return;
//! }
//!
//! // A short write is padded with zeros to a full 512-byte sector.
//! assert_eq!(file.write(b"hello"), 5);
//! file.sync();
//! file.close();
//! ```

mod aligned;
pub mod device;
pub mod error;
pub mod file;
pub mod mountpoint;
pub mod native;
pub mod partition;
pub mod platform;
pub mod service;

#[cfg(test)]
mod testing;

pub use aligned::SECTOR_SIZE;
pub use device::StorageDeviceInfo;
pub use error::NativeError;
pub use file::{DeviceFileBackend, StorageDeviceFile};
pub use mountpoint::{Mountpoint, MountpointFactory, MountpointLock};
pub use native::{
    DeviceRecord, LockToken, MountRecord, NativeProvider, OpenMode, PartitionRecord,
};
pub use partition::{Partition, PartitionFactory};
pub use service::StorageDeviceService;
