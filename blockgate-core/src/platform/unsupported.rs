use crate::error::{NativeError, Result};
use crate::native::{DeviceRecord, MountRecord, NativeProvider, OpenMode, PartitionRecord};
use std::convert::Infallible;

/// Stands in on targets without a native backend.
///
/// Enumeration comes back empty and every device operation fails, so a
/// device can never be opened. Handles and locks cannot exist.
#[derive(Debug, Default)]
pub struct UnsupportedProvider;

impl NativeProvider for UnsupportedProvider {
    type Handle = Infallible;
    type Lock = Infallible;

    fn enumerate_devices(&self) -> Result<Vec<DeviceRecord>> {
        Err(NativeError::Unsupported("device enumeration"))
    }

    fn enumerate_partitions(&self, _device_path: &str) -> Result<Vec<PartitionRecord>> {
        Err(NativeError::Unsupported("partition enumeration"))
    }

    fn enumerate_mountpoints(&self, _path_prefix: &str) -> Result<Vec<MountRecord>> {
        Err(NativeError::Unsupported("mountpoint enumeration"))
    }

    fn mount(&self, _partition_path: &str, _target_path: &str) -> Result<()> {
        Err(NativeError::Unsupported("mount"))
    }

    fn unmount_one(&self, _mountpoint_path: &str) -> Result<Infallible> {
        Err(NativeError::Unsupported("unmount"))
    }

    fn unmount_whole(&self, _device_path: &str) -> Result<()> {
        Err(NativeError::Unsupported("whole-disk unmount"))
    }

    fn open_raw(&self, _device_path: &str, _mode: OpenMode, _authorized: bool) -> Result<Infallible> {
        Err(NativeError::Unsupported("raw device access"))
    }

    fn read(&self, handle: &mut Infallible, _buf: &mut [u8]) -> Result<usize> {
        match *handle {}
    }

    fn write(&self, handle: &mut Infallible, _buf: &[u8]) -> Result<usize> {
        match *handle {}
    }

    fn seek(&self, handle: &mut Infallible, _position: u64) -> Result<()> {
        match *handle {}
    }

    fn sync(&self, handle: &mut Infallible) -> Result<()> {
        match *handle {}
    }
}
