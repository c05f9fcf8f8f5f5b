use crate::mountpoint::{Mountpoint, MountpointFactory, query_mountpoints};
use crate::native::NativeProvider;
use crate::partition::{Partition, PartitionFactory};
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// A physical storage device discovered on the system.
///
/// Identity fields never change after construction. Partitions and
/// mountpoints are not cached: every call asks the platform again, so a
/// device info never holds stale mount state.
pub trait StorageDeviceInfo: Send + Sync {
    /// USB vendor id.
    fn vid(&self) -> u16;
    /// USB product id.
    fn pid(&self) -> u16;
    /// The system path to the whole device (e.g. `/dev/sdb`).
    fn file_path(&self) -> &str;
    /// The USB topology path (e.g. `1-1.2`).
    fn usb_port_path(&self) -> &str;

    fn mountpoints(&self) -> Vec<Box<dyn Mountpoint>>;
    fn partitions(&self) -> Vec<Box<dyn Partition>>;
}

impl fmt::Display for dyn StorageDeviceInfo + '_ {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<15} {:04x}:{:04x} [USB {}]",
            self.file_path(),
            self.vid(),
            self.pid(),
            self.usb_port_path()
        )
    }
}

pub(crate) struct NativeDeviceInfo<P: NativeProvider> {
    vid: u16,
    pid: u16,
    file_path: String,
    usb_port_path: String,
    provider: Arc<P>,
    partitions: PartitionFactory,
    mountpoints: MountpointFactory,
}

impl<P: NativeProvider> NativeDeviceInfo<P> {
    pub(crate) fn new(
        vid: u16,
        pid: u16,
        file_path: &str,
        usb_port_path: &str,
        provider: Arc<P>,
        partitions: PartitionFactory,
        mountpoints: MountpointFactory,
    ) -> Self {
        Self {
            vid,
            pid,
            file_path: file_path.to_string(),
            usb_port_path: usb_port_path.to_string(),
            provider,
            partitions,
            mountpoints,
        }
    }
}

impl<P: NativeProvider> StorageDeviceInfo for NativeDeviceInfo<P> {
    fn vid(&self) -> u16 {
        self.vid
    }

    fn pid(&self) -> u16 {
        self.pid
    }

    fn file_path(&self) -> &str {
        &self.file_path
    }

    fn usb_port_path(&self) -> &str {
        &self.usb_port_path
    }

    fn mountpoints(&self) -> Vec<Box<dyn Mountpoint>> {
        query_mountpoints(self.provider.as_ref(), &self.file_path, &self.mountpoints)
    }

    fn partitions(&self) -> Vec<Box<dyn Partition>> {
        match self.provider.enumerate_partitions(&self.file_path) {
            Ok(parts) => parts
                .iter()
                .map(|p| (self.partitions)(&p.partition_path, &p.label))
                .collect(),
            Err(e) => {
                warn!(device = %self.file_path, error = %e, "could not enumerate partitions");
                Vec::new()
            }
        }
    }
}
