use crate::error::{NativeError, Result};
use crate::native::{
    DeviceRecord, LockToken, MountRecord, NativeProvider, OpenMode, PartitionRecord,
};
use anyhow::{Context, anyhow};
use nix::errno::Errno;
use nix::mount::{MntFlags, umount2};
use nix::{ioctl_none, ioctl_read};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

ioctl_read!(blkgetsize64, 0x12, 114, u64);
ioctl_none!(blkflsbuf, 0x12, 97);

#[derive(Clone, Debug, PartialEq, Eq)]
struct UsbIdentity {
    vendor_id: u16,
    product_id: u16,
    port_path: String,
}

/// The Linux backend, built on sysfs, `umount2(2)` and block-device ioctls.
///
/// USB identities read from sysfs are memoized per provider, keyed by the
/// USB device's sysfs directory. [`clear_cache`](Self::clear_cache) forgets them.
pub struct LinuxProvider {
    sys_block: PathBuf,
    dev_dir: PathBuf,
    by_label: PathBuf,
    usb_cache: Mutex<HashMap<PathBuf, UsbIdentity>>,
}

impl Default for LinuxProvider {
    fn default() -> Self {
        Self::with_roots("/sys/block", "/dev", "/dev/disk/by-label")
    }
}

/// An open raw device. `fsync`s on drop.
pub struct LinuxHandle {
    file: File,
    path: String,
}

impl Drop for LinuxHandle {
    fn drop(&mut self) {
        if let Err(e) = self.file.sync_all() {
            warn!(device = %self.path, error = %e, "could not flush device on close");
        }
    }
}

/// A filesystem this process unmounted. Releasing it leaves the filesystem unmounted.
pub struct LinuxMountLock {
    mountpoint: String,
}

impl LockToken for LinuxMountLock {
    fn release(self: Box<Self>) {
        debug!(mountpoint = %self.mountpoint, "released unmount hold");
    }
}

/// Helper to read a specific attribute file from a sysfs directory.
fn read_sys_value(dir: &Path, file: &str) -> io::Result<String> {
    fs::read_to_string(dir.join(file)).map(|s| s.trim().to_string())
}

fn read_hex_id(dir: &Path, file: &str) -> anyhow::Result<u16> {
    let raw = read_sys_value(dir, file)
        .with_context(|| format!("could not read {file} in {}", dir.display()))?;
    u16::from_str_radix(&raw, 16).with_context(|| format!("invalid {file} value {raw:?}"))
}

/// Whether a sysfs directory name is a USB topology path such as `1-1.2`.
fn is_usb_port_path(name: &str) -> bool {
    let Some((bus, ports)) = name.split_once('-') else {
        return false;
    };
    let all_digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    all_digits(bus) && ports.split('.').all(all_digits)
}

/// Whether `device` is the node `prefix` names or one of its partitions.
///
/// `/dev/sdb` owns `/dev/sdb1` but not `/dev/sdbc`; `/dev/sdb1` does not own
/// `/dev/sdb10`. Disks whose names end in a digit number their partitions
/// after a `p`, as in `/dev/nvme0n1p2` and `/dev/mmcblk0p1`.
fn is_backed_by(device: &str, prefix: &str) -> bool {
    let Some(rest) = device.strip_prefix(prefix) else {
        return false;
    };
    if rest.is_empty() {
        return true;
    }
    let digits = match rest.strip_prefix('p') {
        Some(number) if prefix.ends_with(|c: char| c.is_ascii_digit()) => number,
        _ if prefix.ends_with(|c: char| c.is_ascii_digit()) => return false,
        _ => rest,
    };
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

/// Decodes the `\xNN` escapes udev uses in `/dev/disk/by-label` names.
fn unescape_label(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && bytes.get(i + 1) == Some(&b'x') {
            if let Some(byte) = raw
                .get(i + 2..i + 4)
                .and_then(|hex| u8::from_str_radix(hex, 16).ok())
            {
                out.push(byte);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

impl LinuxProvider {
    /// A provider reading block devices from `sys_block`, naming device nodes
    /// under `dev_dir` and resolving labels from `by_label`.
    pub fn with_roots(
        sys_block: impl Into<PathBuf>,
        dev_dir: impl Into<PathBuf>,
        by_label: impl Into<PathBuf>,
    ) -> Self {
        Self {
            sys_block: sys_block.into(),
            dev_dir: dev_dir.into(),
            by_label: by_label.into(),
            usb_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn clear_cache(&self) {
        self.cache().clear();
    }

    fn cache(&self) -> MutexGuard<'_, HashMap<PathBuf, UsbIdentity>> {
        self.usb_cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn node_path(&self, name: &str) -> String {
        self.dev_dir.join(name).to_string_lossy().into_owned()
    }

    /// Finds the USB device a block device hangs off and reads its ids.
    ///
    /// `device_dir` is the resolved `device` link of a block device. The
    /// deepest ancestor named like a USB topology path is the USB device
    /// itself; hubs sit above it.
    fn usb_identity(&self, device_dir: &Path) -> anyhow::Result<Option<UsbIdentity>> {
        let Some(usb_dir) = device_dir.ancestors().find(|dir| {
            dir.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(is_usb_port_path)
        }) else {
            return Ok(None);
        };

        let cached = self.cache().get(usb_dir).cloned();
        if let Some(identity) = cached {
            return Ok(Some(identity));
        }

        let identity = UsbIdentity {
            vendor_id: read_hex_id(usb_dir, "idVendor")?,
            product_id: read_hex_id(usb_dir, "idProduct")?,
            port_path: usb_dir
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
        };
        self.cache().insert(usb_dir.to_path_buf(), identity.clone());
        Ok(Some(identity))
    }

    /// Scans sysfs for USB-attached block devices.
    ///
    /// Loop and RAM disks are skipped, as are devices reporting a size of
    /// zero (usually empty card readers) and anything not behind a USB port.
    fn scan_devices(&self) -> anyhow::Result<Vec<DeviceRecord>> {
        let entries = fs::read_dir(&self.sys_block)
            .with_context(|| format!("could not read {}", self.sys_block.display()))?;

        let mut devices = Vec::new();
        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name().to_string_lossy().into_owned();
            if ["loop", "ram", "zram"].iter().any(|p| name.starts_with(p)) {
                continue;
            }

            let sectors = read_sys_value(&entry.path(), "size")
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(0);
            if sectors == 0 {
                continue;
            }

            let Ok(device_dir) = fs::canonicalize(entry.path().join("device")) else {
                continue;
            };

            let identity = match self.usb_identity(&device_dir) {
                Ok(Some(identity)) => identity,
                Ok(None) => continue,
                Err(e) => {
                    warn!(device = %name, error = %format!("{e:#}"), "skipping device with unreadable USB ids");
                    continue;
                }
            };

            devices.push(DeviceRecord {
                vendor_id: identity.vendor_id,
                product_id: identity.product_id,
                device_path: self.node_path(&name),
                usb_port_path: identity.port_path,
            });
        }

        devices.sort_by(|a, b| a.device_path.cmp(&b.device_path));
        Ok(devices)
    }

    fn scan_partitions(&self, device_path: &str) -> anyhow::Result<Vec<PartitionRecord>> {
        let name = Path::new(device_path)
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| anyhow!("{device_path} does not name a device node"))?;
        let dir = self.sys_block.join(name);
        let entries =
            fs::read_dir(&dir).with_context(|| format!("could not read {}", dir.display()))?;

        let mut found = Vec::new();
        for entry in entries.filter_map(|e| e.ok()) {
            let Ok(number) = read_sys_value(&entry.path(), "partition") else {
                continue;
            };
            let number = number.parse::<u32>().unwrap_or(u32::MAX);
            found.push((number, entry.file_name().to_string_lossy().into_owned()));
        }
        found.sort();

        let labels = self.labels();
        Ok(found
            .into_iter()
            .map(|(_, part)| PartitionRecord {
                partition_path: self.node_path(&part),
                label: labels.get(&part).cloned().unwrap_or_default(),
            })
            .collect())
    }

    /// Partition node name -> filesystem label, from the by-label links.
    fn labels(&self) -> HashMap<String, String> {
        let Ok(entries) = fs::read_dir(&self.by_label) else {
            return HashMap::new();
        };
        entries
            .filter_map(|e| e.ok())
            .filter_map(|entry| {
                let target = fs::read_link(entry.path()).ok()?;
                let node = target.file_name()?.to_string_lossy().into_owned();
                Some((node, unescape_label(&entry.file_name().to_string_lossy())))
            })
            .collect()
    }
}

impl NativeProvider for LinuxProvider {
    type Handle = LinuxHandle;
    type Lock = LinuxMountLock;

    fn enumerate_devices(&self) -> Result<Vec<DeviceRecord>> {
        Ok(self.scan_devices()?)
    }

    fn enumerate_partitions(&self, device_path: &str) -> Result<Vec<PartitionRecord>> {
        Ok(self.scan_partitions(device_path)?)
    }

    fn enumerate_mountpoints(&self, path_prefix: &str) -> Result<Vec<MountRecord>> {
        let disks = sysinfo::Disks::new_with_refreshed_list();
        Ok(disks
            .iter()
            .filter_map(|disk| {
                let device = disk.name().to_string_lossy();
                is_backed_by(&device, path_prefix).then(|| MountRecord {
                    root_path: disk.mount_point().to_string_lossy().into_owned(),
                    device_path: device.into_owned(),
                })
            })
            .collect())
    }

    fn mount(&self, partition_path: &str, target_path: &str) -> Result<()> {
        let status = Command::new("mount")
            .arg(partition_path)
            .arg(target_path)
            .status()?;
        if status.success() {
            Ok(())
        } else {
            Err(NativeError::Mount {
                device: partition_path.to_string(),
                target: target_path.to_string(),
                status: status.to_string(),
            })
        }
    }

    fn unmount_one(&self, mountpoint_path: &str) -> Result<LinuxMountLock> {
        umount2(mountpoint_path, MntFlags::empty()).map_err(|errno| NativeError::Unmount {
            path: mountpoint_path.to_string(),
            source: io::Error::from(errno),
        })?;
        Ok(LinuxMountLock {
            mountpoint: mountpoint_path.to_string(),
        })
    }

    fn unmount_whole(&self, _device_path: &str) -> Result<()> {
        Err(NativeError::Unsupported("whole-disk unmount"))
    }

    fn open_raw(&self, device_path: &str, mode: OpenMode, authorized: bool) -> Result<LinuxHandle> {
        if authorized {
            return Err(NativeError::Unsupported("authorized open"));
        }

        let file = OpenOptions::new()
            .read(mode.is_readable())
            .write(mode.is_writable())
            .custom_flags(libc::O_SYNC)
            .open(device_path)
            .map_err(|source| NativeError::Open {
                path: device_path.to_string(),
                source,
            })?;

        Ok(LinuxHandle {
            file,
            path: device_path.to_string(),
        })
    }

    fn read(&self, handle: &mut LinuxHandle, buf: &mut [u8]) -> Result<usize> {
        Ok(handle.file.read(buf)?)
    }

    fn write(&self, handle: &mut LinuxHandle, buf: &[u8]) -> Result<usize> {
        Ok(handle.file.write(buf)?)
    }

    fn seek(&self, handle: &mut LinuxHandle, position: u64) -> Result<()> {
        handle.file.seek(SeekFrom::Start(position))?;
        Ok(())
    }

    fn sync(&self, handle: &mut LinuxHandle) -> Result<()> {
        handle.file.sync_all()?;

        // Drop the kernel's buffer cache so a read-back sees the device itself.
        // SAFETY: BLKFLSBUF takes no argument and the descriptor stays open
        // for the lifetime of `handle`.
        match unsafe { blkflsbuf(handle.file.as_raw_fd()) } {
            Ok(_) => Ok(()),
            Err(Errno::ENOTTY) => {
                debug!(device = %handle.path, "not a block device, no buffer cache to flush");
                Ok(())
            }
            Err(errno) => Err(NativeError::Io(errno.into())),
        }
    }

    fn device_size(&self, handle: &mut LinuxHandle) -> Result<u64> {
        let mut size_bytes: u64 = 0;
        // SAFETY: BLKGETSIZE64 writes exactly one u64 through the pointer.
        match unsafe { blkgetsize64(handle.file.as_raw_fd(), &mut size_bytes) } {
            Ok(_) => Ok(size_bytes),
            Err(Errno::ENOTTY) => Ok(handle.file.metadata()?.len()),
            Err(errno) => Err(NativeError::Io(errno.into())),
        }
    }
}
