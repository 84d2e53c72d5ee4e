//! HAL trait definitions and implementations.
//!
//! This module defines the core traits for system operations and provides
//! both real (LinuxHal) and fake (FakeHal) implementations.

pub mod fake_hal;
pub mod format_ops;
pub mod linux_hal;
pub mod loop_ops;
pub mod mount_ops;
pub mod process_ops;
pub mod root_ops;

pub use fake_hal::{mirror_tree, success_output, FailPoint, FakeCommand, FakeHal, Operation};
pub use format_ops::{FormatOps, FormatOptions};
pub use linux_hal::LinuxHal;
pub use loop_ops::LoopOps;
pub use mount_ops::{MountOps, MountOptions};
pub use process_ops::ProcessOps;
pub use root_ops::{RootOps, SavedRoot};

/// Complete HAL combining all operations the image pipeline needs.
pub trait ImageHal: LoopOps + MountOps + FormatOps + ProcessOps + RootOps + Send + Sync {}

/// Automatically implement ImageHal for any type implementing all required traits.
impl<T> ImageHal for T where
    T: LoopOps + MountOps + FormatOps + ProcessOps + RootOps + Send + Sync
{
}
