//! Mount operations trait.

use crate::HalResult;
use std::path::Path;

/// Trait for mounting and unmounting filesystems.
pub trait MountOps {
    /// Mount a device to a target path.
    ///
    /// # Arguments
    /// * `device` - Device path (e.g., `/dev/loop0p2`), or a pseudo source such as `proc`
    /// * `target` - Mount point path
    /// * `fstype` - Optional filesystem type (e.g., `"ext4"`, `"vfat"`)
    /// * `options` - Mount flags and data
    fn mount_device(
        &self,
        device: &Path,
        target: &Path,
        fstype: Option<&str>,
        options: &MountOptions,
    ) -> HalResult<()>;

    /// Unmount a filesystem.
    fn unmount(&self, target: &Path) -> HalResult<()>;

    /// Check if a path is currently a mount point.
    fn is_mounted(&self, path: &Path) -> HalResult<bool>;
}

/// Mount options and flags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountOptions {
    /// Filesystem specific data as a comma-separated string (e.g., "errors=remount-ro")
    pub options: Option<String>,
    /// Mount read-only (`MS_RDONLY`).
    pub read_only: bool,
    /// Bind an existing directory instead of mounting a filesystem (`MS_BIND`).
    pub bind: bool,
}

impl MountOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read_only() -> Self {
        Self {
            read_only: true,
            ..Self::default()
        }
    }

    pub fn bind() -> Self {
        Self {
            bind: true,
            ..Self::default()
        }
    }
}
