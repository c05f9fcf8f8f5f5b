//! Provides platform-specific functionality.
//!
//! Each submodule implements [`NativeProvider`](crate::native::NativeProvider)
//! for one operating system. Conditional compilation (`#[cfg]`) picks the one
//! for the target and exports it as [`PlatformProvider`], so the rest of the
//! library never has to know which platform it runs on.

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use self::linux::*;

/// The provider [`StorageDeviceService::new`](crate::StorageDeviceService::new) uses.
#[cfg(target_os = "linux")]
pub type PlatformProvider = LinuxProvider;

#[cfg(not(target_os = "linux"))]
mod unsupported;
#[cfg(not(target_os = "linux"))]
pub use self::unsupported::*;

#[cfg(not(target_os = "linux"))]
pub type PlatformProvider = UnsupportedProvider;
