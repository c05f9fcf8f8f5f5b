//! The primitive operations every platform backend provides.
//!
//! The rest of the crate only talks to the operating system through the
//! [`NativeProvider`] trait. Each backend in [`crate::platform`] picks its own
//! concrete handle and lock types, so no code ever has to recover a platform
//! struct from an opaque pointer.

use crate::error::Result;
use std::convert::Infallible;

/// One physical storage device as reported by the platform.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceRecord {
    pub vendor_id: u16,
    pub product_id: u16,
    /// The device node (e.g. `/dev/sdb`).
    pub device_path: String,
    /// The USB topology path (e.g. `1-1.2`).
    pub usb_port_path: String,
}

/// One partition of a device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionRecord {
    pub partition_path: String,
    /// Filesystem label, empty when the partition has none.
    pub label: String,
}

/// One mounted filesystem and the device node backing it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountRecord {
    pub root_path: String,
    pub device_path: String,
}

/// How a raw device handle is opened.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl OpenMode {
    pub fn is_readable(self) -> bool {
        matches!(self, OpenMode::ReadOnly | OpenMode::ReadWrite)
    }

    pub fn is_writable(self) -> bool {
        matches!(self, OpenMode::WriteOnly | OpenMode::ReadWrite)
    }
}

/// Proof that the platform has unmounted a filesystem for us.
///
/// `release` is called exactly once, by [`MountpointLock`](crate::MountpointLock).
pub trait LockToken: Send {
    fn release(self: Box<Self>);
}

impl LockToken for Infallible {
    fn release(self: Box<Self>) {
        match *self {}
    }
}

/// Platform primitives for enumeration, (un)mounting and raw block I/O.
///
/// All calls block the calling thread. None of them retry unless a backend
/// documents otherwise.
pub trait NativeProvider: Send + Sync + 'static {
    /// An open raw device. Dropping it flushes and closes the OS handle.
    type Handle: Send + 'static;
    /// A held unmount of one mountpoint.
    type Lock: LockToken + 'static;

    fn enumerate_devices(&self) -> Result<Vec<DeviceRecord>>;

    fn enumerate_partitions(&self, device_path: &str) -> Result<Vec<PartitionRecord>>;

    /// Every mounted filesystem backed by the node at `path_prefix` or by one
    /// of its partitions. A partition's prefix never matches its siblings.
    fn enumerate_mountpoints(&self, path_prefix: &str) -> Result<Vec<MountRecord>>;

    fn mount(&self, partition_path: &str, target_path: &str) -> Result<()>;

    fn unmount_one(&self, mountpoint_path: &str) -> Result<Self::Lock>;

    /// Unmount every filesystem of a disk in one step, where the platform can.
    fn unmount_whole(&self, device_path: &str) -> Result<()>;

    fn open_raw(&self, device_path: &str, mode: OpenMode, authorized: bool)
    -> Result<Self::Handle>;

    fn read(&self, handle: &mut Self::Handle, buf: &mut [u8]) -> Result<usize>;

    fn write(&self, handle: &mut Self::Handle, buf: &[u8]) -> Result<usize>;

    /// Absolute positioning.
    fn seek(&self, handle: &mut Self::Handle, position: u64) -> Result<()>;

    /// Flush buffered writes and drop the kernel's cached view of the device.
    fn sync(&self, handle: &mut Self::Handle) -> Result<()>;

    fn device_size(&self, handle: &mut Self::Handle) -> Result<u64> {
        let _ = handle;
        Err(crate::error::NativeError::Unsupported("device size query"))
    }
}
