//! Mount locations and the locks that keep them unmounted.

use crate::native::{LockToken, NativeProvider};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Builds a [`Mountpoint`] for a filesystem path. An empty path means "not mounted".
pub type MountpointFactory = Arc<dyn Fn(&str) -> Box<dyn Mountpoint> + Send + Sync>;

/// One OS mount location.
pub trait Mountpoint: Send {
    /// The mount root, or an empty string when nothing is mounted.
    fn fs_path(&self) -> &str;

    /// Unmounts this location and hands back the lock that keeps it unmounted.
    ///
    /// A failed unmount yields a lock whose [`MountpointLock::locked`] is `false`.
    fn umount(&self) -> MountpointLock;

    fn is_mounted(&self) -> bool {
        !self.fs_path().is_empty()
    }
}

/// A held unmount of one mountpoint.
///
/// The lock only ever moves from locked to released. Releasing twice is a
/// no-op and dropping a held lock releases it.
pub struct MountpointLock {
    token: Option<Box<dyn LockToken>>,
}

impl MountpointLock {
    pub fn held(token: Box<dyn LockToken>) -> Self {
        Self { token: Some(token) }
    }

    /// A lock that never held anything, the result of a failed unmount.
    pub fn unlocked() -> Self {
        Self { token: None }
    }

    pub fn locked(&self) -> bool {
        self.token.is_some()
    }

    pub fn release(&mut self) {
        if let Some(token) = self.token.take() {
            token.release();
        }
    }
}

impl Drop for MountpointLock {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for MountpointLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MountpointLock")
            .field("locked", &self.locked())
            .finish()
    }
}

/// A mountpoint whose unmount goes through a [`NativeProvider`].
pub(crate) struct NativeMountpoint<P: NativeProvider> {
    fs_path: String,
    provider: Arc<P>,
}

impl<P: NativeProvider> NativeMountpoint<P> {
    pub(crate) fn new(fs_path: &str, provider: Arc<P>) -> Self {
        Self {
            fs_path: fs_path.to_string(),
            provider,
        }
    }
}

impl<P: NativeProvider> Mountpoint for NativeMountpoint<P> {
    fn fs_path(&self) -> &str {
        &self.fs_path
    }

    fn umount(&self) -> MountpointLock {
        if !self.is_mounted() {
            debug!("nothing mounted, no lock to take");
            return MountpointLock::unlocked();
        }

        match self.provider.unmount_one(&self.fs_path) {
            Ok(token) => {
                debug!(mountpoint = %self.fs_path, "unmounted");
                MountpointLock::held(Box::new(token))
            }
            Err(e) => {
                warn!(mountpoint = %self.fs_path, error = %e, "unmount failed");
                MountpointLock::unlocked()
            }
        }
    }
}

/// Asks the provider for every mount backed by `path_prefix` and wraps each
/// one with `factory`. Enumeration failures yield an empty list.
pub(crate) fn query_mountpoints<P: NativeProvider>(
    provider: &P,
    path_prefix: &str,
    factory: &MountpointFactory,
) -> Vec<Box<dyn Mountpoint>> {
    match provider.enumerate_mountpoints(path_prefix) {
        Ok(mounts) => mounts.iter().map(|m| factory(&m.root_path)).collect(),
        Err(e) => {
            warn!(device = %path_prefix, error = %e, "could not enumerate mountpoints");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeProvider, mounted};

    fn factory(provider: &Arc<FakeProvider>) -> MountpointFactory {
        let provider = Arc::clone(provider);
        Arc::new(move |fs_path: &str| -> Box<dyn Mountpoint> {
            Box::new(NativeMountpoint::new(fs_path, Arc::clone(&provider)))
        })
    }

    #[test]
    fn is_mounted_follows_fs_path() {
        let provider = Arc::new(FakeProvider::new());
        let make = factory(&provider);

        assert!(make("/media/usb").is_mounted());
        assert!(!make("").is_mounted());
    }

    #[test]
    fn umount_of_empty_path_never_reaches_the_provider() {
        let provider = Arc::new(FakeProvider::new());
        let lock = factory(&provider)("").umount();

        assert!(!lock.locked());
        assert!(provider.events().is_empty());
    }

    #[test]
    fn release_is_idempotent_and_monotonic() {
        let provider = FakeProvider::with_state(|s| s.mounts.push(mounted("/media/a", "/dev/sdb1")));
        let mut lock = factory(&provider)("/media/a").umount();
        assert!(lock.locked());

        lock.release();
        assert!(!lock.locked());
        lock.release();
        assert!(!lock.locked());

        let releases = provider
            .events()
            .iter()
            .filter(|e| e.starts_with("release"))
            .count();
        assert_eq!(releases, 1);
    }

    #[test]
    fn dropping_a_held_lock_releases_it() {
        let provider = FakeProvider::with_state(|s| s.mounts.push(mounted("/media/a", "/dev/sdb1")));
        {
            let lock = factory(&provider)("/media/a").umount();
            assert!(lock.locked());
        }
        assert_eq!(provider.events(), vec!["unmount /media/a", "release /media/a"]);
    }

    #[test]
    fn busy_mountpoint_yields_unlocked_lock() {
        let provider = FakeProvider::with_state(|s| {
            s.mounts.push(mounted("/media/a", "/dev/sdb1"));
            s.busy_mountpoints.insert("/media/a".into());
        });
        let lock = factory(&provider)("/media/a").umount();

        assert!(!lock.locked());
    }

    #[test]
    fn locks_are_independent() {
        let provider = FakeProvider::with_state(|s| {
            s.mounts.push(mounted("/media/a", "/dev/sdb1"));
            s.mounts.push(mounted("/media/b", "/dev/sdb2"));
        });
        let make = factory(&provider);
        let mut first = make("/media/a").umount();
        let second = make("/media/b").umount();

        first.release();
        assert!(!first.locked());
        assert!(second.locked());
    }

    #[test]
    fn query_mountpoints_filters_by_prefix() {
        let provider = FakeProvider::with_state(|s| {
            s.mounts.push(mounted("/media/a", "/dev/sdb1"));
            s.mounts.push(mounted("/", "/dev/nvme0n1p2"));
        });
        let found = query_mountpoints(provider.as_ref(), "/dev/sdb", &factory(&provider));

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].fs_path(), "/media/a");
    }

    #[test]
    fn query_mountpoints_swallows_enumeration_failure() {
        let provider = FakeProvider::with_state(|s| s.fail_enumeration = true);
        let found = query_mountpoints(provider.as_ref(), "/dev/sdb", &factory(&provider));

        assert!(found.is_empty());
    }
}
