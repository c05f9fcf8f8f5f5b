use crate::mountpoint::{Mountpoint, MountpointFactory, query_mountpoints};
use crate::native::NativeProvider;
use std::sync::Arc;
use tracing::warn;

/// Builds a [`Partition`] from its path and label.
pub type PartitionFactory = Arc<dyn Fn(&str, &str) -> Box<dyn Partition> + Send + Sync>;

/// One partition of a physical device.
pub trait Partition: Send {
    /// The partition's device node or volume id.
    fn file_path(&self) -> &str;

    /// The filesystem label, possibly empty.
    fn label(&self) -> &str;

    /// Mounts the partition at `target_path`.
    ///
    /// Never fails outright: when the mount does not happen the returned
    /// mountpoint reports `is_mounted() == false`.
    fn mount(&self, target_path: &str) -> Box<dyn Mountpoint>;

    /// A fresh snapshot of where this partition is mounted.
    fn mountpoints(&self) -> Vec<Box<dyn Mountpoint>>;
}

pub(crate) struct NativePartition<P: NativeProvider> {
    file_path: String,
    label: String,
    provider: Arc<P>,
    mountpoints: MountpointFactory,
}

impl<P: NativeProvider> NativePartition<P> {
    pub(crate) fn new(
        file_path: &str,
        label: &str,
        provider: Arc<P>,
        mountpoints: MountpointFactory,
    ) -> Self {
        Self {
            file_path: file_path.to_string(),
            label: label.to_string(),
            provider,
            mountpoints,
        }
    }
}

impl<P: NativeProvider> Partition for NativePartition<P> {
    fn file_path(&self) -> &str {
        &self.file_path
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn mount(&self, target_path: &str) -> Box<dyn Mountpoint> {
        match self.provider.mount(&self.file_path, target_path) {
            Ok(()) => (self.mountpoints)(target_path),
            Err(e) => {
                warn!(partition = %self.file_path, target = %target_path, error = %e, "mount failed");
                (self.mountpoints)("")
            }
        }
    }

    fn mountpoints(&self) -> Vec<Box<dyn Mountpoint>> {
        query_mountpoints(self.provider.as_ref(), &self.file_path, &self.mountpoints)
    }
}
