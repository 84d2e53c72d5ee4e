//! Filesystem formatting operations trait.

use crate::HalResult;
use std::path::Path;

/// Trait for creating filesystems on block devices or image files.
pub trait FormatOps {
    /// Format a device or image file with an ext4 filesystem.
    fn format_ext4(&self, device: &Path, opts: &FormatOptions) -> HalResult<()>;

    /// Format a device or image file with VFAT, used for the EFI boot image.
    fn format_vfat(&self, device: &Path, label: &str) -> HalResult<()>;
}

/// Options for formatting operations.
#[derive(Debug, Clone, Default)]
pub struct FormatOptions {
    /// Filesystem block size in bytes (`mkfs.ext4 -b`).
    pub block_size: Option<u32>,
}

impl FormatOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_block_size(mut self, block_size: u32) -> Self {
        self.block_size = Some(block_size);
        self
    }
}
