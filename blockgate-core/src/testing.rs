//! An in-memory provider that records every native call.

use crate::error::{NativeError, Result};
use crate::native::{
    DeviceRecord, LockToken, MountRecord, NativeProvider, OpenMode, PartitionRecord,
};
use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::{Arc, Mutex};

#[derive(Default)]
pub(crate) struct FakeState {
    pub devices: Vec<DeviceRecord>,
    pub partitions: HashMap<String, Vec<PartitionRecord>>,
    pub mounts: Vec<MountRecord>,
    pub busy_mountpoints: HashSet<String>,
    pub unmountable_targets: HashSet<String>,
    pub whole_disk_unmount: bool,
    pub deny_open: bool,
    pub fail_enumeration: bool,
    /// Cap on the bytes a single native write/read transfers.
    pub transfer_limit: Option<usize>,
    pub disk: Vec<u8>,
    pub writes: Vec<Vec<u8>>,
    pub reads: Vec<usize>,
}

#[derive(Default)]
pub(crate) struct FakeProvider {
    pub state: Mutex<FakeState>,
    pub events: Arc<Mutex<Vec<String>>>,
}

pub(crate) struct FakeHandle {
    position: usize,
}

pub(crate) struct FakeLock {
    mountpoint: String,
    events: Arc<Mutex<Vec<String>>>,
}

impl LockToken for FakeLock {
    fn release(self: Box<Self>) {
        self.events
            .lock()
            .unwrap()
            .push(format!("release {}", self.mountpoint));
    }
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(configure: impl FnOnce(&mut FakeState)) -> Arc<Self> {
        let provider = Self::new();
        configure(&mut provider.state.lock().unwrap());
        Arc::new(provider)
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn record(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }

    fn enumeration_guard(&self, state: &FakeState) -> Result<()> {
        if state.fail_enumeration {
            return Err(NativeError::Enumeration(anyhow::anyhow!("probe failed")));
        }
        Ok(())
    }
}

impl NativeProvider for FakeProvider {
    type Handle = FakeHandle;
    type Lock = FakeLock;

    fn enumerate_devices(&self) -> Result<Vec<DeviceRecord>> {
        self.record("enumerate devices".into());
        let state = self.state.lock().unwrap();
        self.enumeration_guard(&state)?;
        Ok(state.devices.clone())
    }

    fn enumerate_partitions(&self, device_path: &str) -> Result<Vec<PartitionRecord>> {
        self.record(format!("enumerate partitions {device_path}"));
        let state = self.state.lock().unwrap();
        self.enumeration_guard(&state)?;
        Ok(state.partitions.get(device_path).cloned().unwrap_or_default())
    }

    fn enumerate_mountpoints(&self, path_prefix: &str) -> Result<Vec<MountRecord>> {
        self.record(format!("enumerate mountpoints {path_prefix}"));
        let state = self.state.lock().unwrap();
        self.enumeration_guard(&state)?;
        Ok(state
            .mounts
            .iter()
            .filter(|m| m.device_path.starts_with(path_prefix))
            .cloned()
            .collect())
    }

    fn mount(&self, partition_path: &str, target_path: &str) -> Result<()> {
        self.record(format!("mount {partition_path} {target_path}"));
        let mut state = self.state.lock().unwrap();
        if state.unmountable_targets.contains(target_path) {
            return Err(NativeError::Mount {
                device: partition_path.into(),
                target: target_path.into(),
                status: "exit status: 32".into(),
            });
        }
        state.mounts.push(MountRecord {
            root_path: target_path.into(),
            device_path: partition_path.into(),
        });
        Ok(())
    }

    fn unmount_one(&self, mountpoint_path: &str) -> Result<FakeLock> {
        let mut state = self.state.lock().unwrap();
        if state.busy_mountpoints.contains(mountpoint_path) {
            self.record(format!("unmount {mountpoint_path} failed"));
            return Err(NativeError::Unmount {
                path: mountpoint_path.into(),
                source: io::Error::other("device or resource busy"),
            });
        }
        self.record(format!("unmount {mountpoint_path}"));
        state.mounts.retain(|m| m.root_path != mountpoint_path);
        Ok(FakeLock {
            mountpoint: mountpoint_path.into(),
            events: Arc::clone(&self.events),
        })
    }

    fn unmount_whole(&self, device_path: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.whole_disk_unmount {
            self.record(format!("unmount disk {device_path} failed"));
            return Err(NativeError::Unsupported("whole-disk unmount"));
        }
        self.record(format!("unmount disk {device_path}"));
        state.mounts.retain(|m| !m.device_path.starts_with(device_path));
        Ok(())
    }

    fn open_raw(
        &self,
        device_path: &str,
        _mode: OpenMode,
        authorized: bool,
    ) -> Result<FakeHandle> {
        let state = self.state.lock().unwrap();
        if state.deny_open || authorized {
            self.record(format!("open {device_path} failed"));
            return Err(NativeError::Open {
                path: device_path.into(),
                source: io::Error::from(io::ErrorKind::PermissionDenied),
            });
        }
        self.record(format!("open {device_path}"));
        Ok(FakeHandle { position: 0 })
    }

    fn read(&self, handle: &mut FakeHandle, buf: &mut [u8]) -> Result<usize> {
        let mut state = self.state.lock().unwrap();
        state.reads.push(buf.len());
        let limit = state.transfer_limit.unwrap_or(usize::MAX);
        let available = state.disk.len().saturating_sub(handle.position);
        let n = buf.len().min(available).min(limit);
        buf[..n].copy_from_slice(&state.disk[handle.position..handle.position + n]);
        handle.position += n;
        Ok(n)
    }

    fn write(&self, handle: &mut FakeHandle, buf: &[u8]) -> Result<usize> {
        let mut state = self.state.lock().unwrap();
        state.writes.push(buf.to_vec());
        let n = buf.len().min(state.transfer_limit.unwrap_or(usize::MAX));
        let end = handle.position + n;
        if state.disk.len() < end {
            state.disk.resize(end, 0);
        }
        state.disk[handle.position..end].copy_from_slice(&buf[..n]);
        handle.position = end;
        Ok(n)
    }

    fn seek(&self, handle: &mut FakeHandle, position: u64) -> Result<()> {
        handle.position = position as usize;
        Ok(())
    }

    fn sync(&self, _handle: &mut FakeHandle) -> Result<()> {
        self.record("sync".into());
        Ok(())
    }

    fn device_size(&self, _handle: &mut FakeHandle) -> Result<u64> {
        Ok(self.state.lock().unwrap().disk.len() as u64)
    }
}

pub(crate) fn usb_stick(device_path: &str) -> DeviceRecord {
    DeviceRecord {
        vendor_id: 0x0781,
        product_id: 0x5567,
        device_path: device_path.into(),
        usb_port_path: "1-1.2".into(),
    }
}

pub(crate) fn mounted(root_path: &str, device_path: &str) -> MountRecord {
    MountRecord {
        root_path: root_path.into(),
        device_path: device_path.into(),
    }
}
