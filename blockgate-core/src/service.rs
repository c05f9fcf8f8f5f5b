//! The composition root: wires a [`NativeProvider`] into entity factories.

use crate::device::{NativeDeviceInfo, StorageDeviceInfo};
use crate::file::{NativeDeviceFile, StorageDeviceFile};
use crate::mountpoint::{Mountpoint, MountpointFactory, NativeMountpoint};
use crate::native::NativeProvider;
use crate::partition::{NativePartition, Partition, PartitionFactory};
use crate::platform::PlatformProvider;
use std::sync::Arc;
use tracing::{debug, warn};

/// Entry point for device discovery and raw device access.
///
/// The service owns only the provider and the factories it builds from it.
/// Every device info and device file it returns belongs to the caller.
pub struct StorageDeviceService<P: NativeProvider = PlatformProvider> {
    provider: Arc<P>,
    mountpoints: MountpointFactory,
    partitions: PartitionFactory,
}

impl StorageDeviceService<PlatformProvider> {
    /// A service backed by the provider for the current platform.
    pub fn new() -> Self {
        Self::with_provider(Arc::new(PlatformProvider::default()))
    }
}

impl Default for StorageDeviceService<PlatformProvider> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: NativeProvider> StorageDeviceService<P> {
    pub fn with_provider(provider: Arc<P>) -> Self {
        let mountpoints: MountpointFactory = {
            let provider = Arc::clone(&provider);
            Arc::new(move |fs_path: &str| -> Box<dyn Mountpoint> {
                Box::new(NativeMountpoint::new(fs_path, Arc::clone(&provider)))
            })
        };

        let partitions: PartitionFactory = {
            let provider = Arc::clone(&provider);
            let mountpoints = Arc::clone(&mountpoints);
            Arc::new(move |path: &str, label: &str| -> Box<dyn Partition> {
                Box::new(NativePartition::new(
                    path,
                    label,
                    Arc::clone(&provider),
                    Arc::clone(&mountpoints),
                ))
            })
        };

        Self {
            provider,
            mountpoints,
            partitions,
        }
    }

    pub fn provider(&self) -> &Arc<P> {
        &self.provider
    }

    /// A fresh snapshot of the attached USB storage devices.
    ///
    /// Nothing is filtered or cached. If the platform query fails the result
    /// is empty; partition and mountpoint failures only surface later, when
    /// those are requested from a device.
    pub fn get_available_storage_devices(&self) -> Vec<Arc<dyn StorageDeviceInfo>> {
        let records = match self.provider.enumerate_devices() {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "could not enumerate storage devices");
                return Vec::new();
            }
        };
        debug!(count = records.len(), "storage devices found");

        records
            .into_iter()
            .map(|r| -> Arc<dyn StorageDeviceInfo> {
                Arc::new(NativeDeviceInfo::new(
                    r.vendor_id,
                    r.product_id,
                    &r.device_path,
                    &r.usb_port_path,
                    Arc::clone(&self.provider),
                    Arc::clone(&self.partitions),
                    Arc::clone(&self.mountpoints),
                ))
            })
            .collect()
    }

    /// Builds a closed device file for `device_file_name`. No I/O happens here.
    pub fn make_storage_device_file(
        &self,
        device_file_name: &str,
        device_info: Arc<dyn StorageDeviceInfo>,
    ) -> StorageDeviceFile {
        StorageDeviceFile::new(Box::new(NativeDeviceFile::new(
            device_file_name,
            device_info,
            Arc::clone(&self.provider),
        )))
    }
}
