//! Exclusive raw access to a whole storage device.
//!
//! [`StorageDeviceFile`] is the public face: it checks the open/closed state
//! and argument preconditions, then hands the call to a
//! [`DeviceFileBackend`]. The provider-backed backend, `NativeDeviceFile`,
//! implements the unmount-before-open protocol:
//!
//! 1. try a whole-disk unmount;
//! 2. otherwise unmount every current mountpoint of the device one by one,
//!    stopping at the first failure;
//! 3. only then ask the platform for the raw handle.
//!
//! If any step fails the file stays closed and holds nothing.

use crate::aligned::{self, SECTOR_SIZE};
use crate::device::StorageDeviceInfo;
use crate::mountpoint::MountpointLock;
use crate::native::{NativeProvider, OpenMode};
use std::io;
use std::sync::Arc;
use tracing::{debug, info_span, warn};

/// The operations a [`StorageDeviceFile`] delegates to once its own
/// preconditions hold.
pub trait DeviceFileBackend: Send {
    fn file_name(&self) -> &str;

    /// Called only while closed. Must leave nothing held when it returns `false`.
    fn open(&mut self, mode: OpenMode, authorized: bool) -> bool;

    /// Releases the handle and anything acquired by `open`.
    fn close(&mut self);

    /// Returns `buf.len()` on success, 0 on any failure.
    fn read(&mut self, buf: &mut [u8]) -> usize;

    /// Returns `data.len()` on success, 0 on any failure.
    fn write(&mut self, data: &[u8]) -> usize;

    fn seek(&mut self, position: u64) -> bool;

    fn sync(&mut self);

    fn size(&mut self) -> Option<u64> {
        None
    }
}

/// A random-access byte stream over an entire physical device.
///
/// Constructed closed. Opening a file that is already open is a programming
/// error and panics. Failed reads and writes report zero bytes.
///
/// The inherent [`read`](Self::read) and [`write`](Self::write) move whole
/// sectors on the device: a short request is zero-padded and the device
/// position advances by the padded length. The [`io::Read`], [`io::Write`]
/// and [`io::Seek`] impls are byte-granular instead. They read the sectors a
/// request touches, patch them in memory and write them back, so a stream of
/// unaligned writes lands byte for byte. Unaligned writes to a file opened
/// [`WriteOnly`](OpenMode::WriteOnly) must start on a sector boundary and
/// zero the rest of their last sector.
pub struct StorageDeviceFile {
    backend: Box<dyn DeviceFileBackend>,
    mode: Option<OpenMode>,
    position: u64,
}

impl StorageDeviceFile {
    pub fn new(backend: Box<dyn DeviceFileBackend>) -> Self {
        Self {
            backend,
            mode: None,
            position: 0,
        }
    }

    pub fn file_name(&self) -> &str {
        self.backend.file_name()
    }

    pub fn is_open(&self) -> bool {
        self.mode.is_some()
    }

    pub fn mode(&self) -> Option<OpenMode> {
        self.mode
    }

    pub fn is_readable(&self) -> bool {
        self.mode.is_some_and(OpenMode::is_readable)
    }

    pub fn is_writable(&self) -> bool {
        self.mode.is_some_and(OpenMode::is_writable)
    }

    /// The byte offset the next transfer starts at.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Unmounts the device and acquires the raw handle.
    ///
    /// # Panics
    ///
    /// Panics if the file is already open.
    pub fn open(&mut self, mode: OpenMode) -> bool {
        self.open_with(mode, false)
    }

    /// Like [`open`](Self::open), but asks the platform for an authorized handle.
    ///
    /// Platforms without an authorization service always fail this call.
    pub fn auth_open(&mut self, mode: OpenMode) -> bool {
        self.open_with(mode, true)
    }

    fn open_with(&mut self, mode: OpenMode, authorized: bool) -> bool {
        assert!(
            !self.is_open(),
            "{} is already open; close it before opening again",
            self.file_name()
        );

        if !self.backend.open(mode, authorized) {
            return false;
        }
        self.mode = Some(mode);
        self.position = 0;
        true
    }

    pub fn close(&mut self) {
        if self.is_open() {
            self.backend.close();
            self.mode = None;
        }
    }

    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        debug_assert!(self.is_readable(), "read from a file not open for reading");
        if buf.is_empty() || !self.is_readable() {
            return 0;
        }
        let n = self.backend.read(buf);
        if n > 0 {
            self.position += aligned::padded_len(n, SECTOR_SIZE) as u64;
        }
        n
    }

    pub fn write(&mut self, data: &[u8]) -> usize {
        debug_assert!(self.is_writable(), "write to a file not open for writing");
        if data.is_empty() || !self.is_writable() {
            return 0;
        }
        let n = self.backend.write(data);
        if n > 0 {
            self.position += aligned::padded_len(n, SECTOR_SIZE) as u64;
        }
        n
    }

    /// Moves to an absolute byte offset. Rejected when closed or negative.
    pub fn seek(&mut self, position: i64) -> bool {
        if !self.is_open() {
            warn!(device = %self.file_name(), "seek on a closed device file");
            return false;
        }
        let Ok(position) = u64::try_from(position) else {
            warn!(device = %self.file_name(), position, "negative seek position");
            return false;
        };
        if !self.backend.seek(position) {
            return false;
        }
        self.position = position;
        true
    }

    pub fn sync(&mut self) {
        if self.is_open() {
            self.backend.sync();
        }
    }

    /// Size of the device in bytes, if the platform can tell.
    pub fn size(&mut self) -> Option<u64> {
        if self.is_open() {
            self.backend.size()
        } else {
            None
        }
    }

    /// End of the byte range the io impls can reach: the last whole sector.
    fn sector_limit(&mut self) -> Option<u64> {
        self.size().map(|size| size - size % SECTOR_SIZE as u64)
    }

    /// Reads whole sectors at `start` without touching `position`.
    fn read_sectors(&mut self, start: u64, buf: &mut [u8]) -> io::Result<()> {
        if self.backend.seek(start) && self.backend.read(buf) == buf.len() {
            Ok(())
        } else {
            Err(io::Error::other(format!(
                "raw read from {} at byte {start} failed",
                self.file_name()
            )))
        }
    }

    /// Writes whole sectors at `start` without touching `position`.
    fn write_sectors(&mut self, start: u64, data: &[u8]) -> io::Result<()> {
        if self.backend.seek(start) && self.backend.write(data) == data.len() {
            Ok(())
        } else {
            Err(io::Error::other(format!(
                "raw write to {} at byte {start} failed",
                self.file_name()
            )))
        }
    }
}

fn sector_floor(position: u64) -> u64 {
    position - position % SECTOR_SIZE as u64
}

fn sector_ceil(position: u64) -> u64 {
    sector_floor(position + SECTOR_SIZE as u64 - 1)
}

impl Drop for StorageDeviceFile {
    fn drop(&mut self) {
        self.close();
    }
}

impl io::Read for StorageDeviceFile {
    /// Returns `Ok(0)` once the position reaches the end of the device.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.is_readable() {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("{} is not open for reading", self.file_name()),
            ));
        }

        let mut len = buf.len();
        if let Some(limit) = self.sector_limit() {
            let remaining = limit.saturating_sub(self.position);
            len = len.min(usize::try_from(remaining).unwrap_or(usize::MAX));
        }
        if len == 0 {
            return Ok(0);
        }

        let position = self.position;
        let start = sector_floor(position);
        let end = sector_ceil(position + len as u64);
        if start == position && end == position + len as u64 {
            self.read_sectors(start, &mut buf[..len])?;
        } else {
            let mut scratch = vec![0u8; (end - start) as usize];
            self.read_sectors(start, &mut scratch)?;
            let offset = (position - start) as usize;
            buf[..len].copy_from_slice(&scratch[offset..offset + len]);
        }

        self.position = position + len as u64;
        Ok(len)
    }
}

impl io::Write for StorageDeviceFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.is_writable() {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("{} is not open for writing", self.file_name()),
            ));
        }
        if buf.is_empty() {
            return Ok(0);
        }

        let position = self.position;
        let start = sector_floor(position);
        let end = position + buf.len() as u64;
        let span_end = sector_ceil(end);

        if start == position && span_end == end {
            self.write_sectors(start, buf)?;
        } else {
            let mut scratch = vec![0u8; (span_end - start) as usize];
            // Sectors past the end of the current contents start out zeroed.
            let existing = self.sector_limit().map_or(span_end, |limit| limit.min(span_end));
            if existing > start {
                if self.is_readable() {
                    self.read_sectors(start, &mut scratch[..(existing - start) as usize])?;
                } else if start != position {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!(
                            "{} is write-only; writes must start on a {SECTOR_SIZE}-byte boundary",
                            self.file_name()
                        ),
                    ));
                }
            }
            let offset = (position - start) as usize;
            scratch[offset..offset + buf.len()].copy_from_slice(buf);
            self.write_sectors(start, &scratch)?;
        }

        self.position = end;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.sync();
        Ok(())
    }
}

impl io::Seek for StorageDeviceFile {
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        let target = match pos {
            io::SeekFrom::Start(offset) => Some(offset),
            io::SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
            io::SeekFrom::End(delta) => {
                let size = self.size().ok_or_else(|| {
                    io::Error::new(io::ErrorKind::Unsupported, "device size is unknown")
                })?;
                size.checked_add_signed(delta)
            }
        }
        .ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek before the start of the device")
        })?;

        let position = i64::try_from(target)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "seek offset too large"))?;
        if StorageDeviceFile::seek(self, position) {
            Ok(target)
        } else {
            Err(io::Error::other(format!("seek on {} failed", self.file_name())))
        }
    }
}

/// The provider-backed device file.
pub(crate) struct NativeDeviceFile<P: NativeProvider> {
    file_name: String,
    device_info: Arc<dyn StorageDeviceInfo>,
    provider: Arc<P>,
    handle: Option<P::Handle>,
    locks: Vec<MountpointLock>,
    sector_size: usize,
}

impl<P: NativeProvider> NativeDeviceFile<P> {
    pub(crate) fn new(
        file_name: &str,
        device_info: Arc<dyn StorageDeviceInfo>,
        provider: Arc<P>,
    ) -> Self {
        Self {
            file_name: file_name.to_string(),
            device_info,
            provider,
            handle: None,
            locks: Vec::new(),
            sector_size: SECTOR_SIZE,
        }
    }

    /// Gets every filesystem of the device off the OS.
    ///
    /// Returns the locks to keep for as long as the file stays open, or `None`
    /// when some mountpoint refused. Locks taken before the refusal are dropped
    /// with the partial list; dropping does not remount anything.
    fn unmount_device(&self) -> Option<Vec<MountpointLock>> {
        let device_path = self.device_info.file_path();
        match self.provider.unmount_whole(device_path) {
            Ok(()) => {
                debug!("whole-disk unmount succeeded");
                return Some(Vec::new());
            }
            Err(e) => debug!(error = %e, "whole-disk unmount unavailable, unmounting one by one"),
        }

        let mut locks = Vec::new();
        for mountpoint in self.device_info.mountpoints() {
            let lock = mountpoint.umount();
            if !lock.locked() {
                warn!(
                    mountpoint = %mountpoint.fs_path(),
                    "mountpoint refused to unmount, not opening device"
                );
                return None;
            }
            locks.push(lock);
        }
        Some(locks)
    }

    #[cfg(test)]
    pub(crate) fn held_locks(&self) -> &[MountpointLock] {
        &self.locks
    }
}

impl<P: NativeProvider> DeviceFileBackend for NativeDeviceFile<P> {
    fn file_name(&self) -> &str {
        &self.file_name
    }

    fn open(&mut self, mode: OpenMode, authorized: bool) -> bool {
        let span = info_span!("open", device = %self.file_name, ?mode, authorized);
        let _enter = span.enter();

        let Some(locks) = self.unmount_device() else {
            return false;
        };

        match self.provider.open_raw(&self.file_name, mode, authorized) {
            Ok(handle) => {
                debug!(locks = locks.len(), "device open");
                self.handle = Some(handle);
                self.locks = locks;
                true
            }
            Err(e) => {
                warn!(error = %e, "could not acquire raw device handle");
                false
            }
        }
    }

    fn close(&mut self) {
        // The handle flushes pending writes as it drops.
        self.handle = None;
        for lock in &mut self.locks {
            lock.release();
        }
        self.locks.clear();
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        match self.handle.as_mut() {
            Some(handle) => aligned::read_aligned(self.provider.as_ref(), handle, buf, self.sector_size),
            None => 0,
        }
    }

    fn write(&mut self, data: &[u8]) -> usize {
        match self.handle.as_mut() {
            Some(handle) => {
                aligned::write_aligned(self.provider.as_ref(), handle, data, self.sector_size)
            }
            None => 0,
        }
    }

    fn seek(&mut self, position: u64) -> bool {
        let Some(handle) = self.handle.as_mut() else {
            return false;
        };
        match self.provider.seek(handle, position) {
            Ok(()) => true,
            Err(e) => {
                warn!(device = %self.file_name, position, error = %e, "seek failed");
                false
            }
        }
    }

    fn sync(&mut self) {
        if let Some(handle) = self.handle.as_mut() {
            if let Err(e) = self.provider.sync(handle) {
                warn!(device = %self.file_name, error = %e, "sync failed");
            }
        }
    }

    fn size(&mut self) -> Option<u64> {
        let handle = self.handle.as_mut()?;
        match self.provider.device_size(handle) {
            Ok(size) => Some(size),
            Err(e) => {
                debug!(device = %self.file_name, error = %e, "device size unavailable");
                None
            }
        }
    }
}

impl<P: NativeProvider> Drop for NativeDeviceFile<P> {
    fn drop(&mut self) {
        self.close();
    }
}
