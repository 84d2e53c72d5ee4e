//! imgcust Host Abstraction Layer (HAL).
//!
//! Every operation that touches the host (loop devices, mounts, mkfs, external commands,
//! the process root) goes through the traits in [`hal`], so the image pipeline can run
//! against [`LinuxHal`] in production and [`FakeHal`] in tests.

pub mod hal;
pub mod procfs;
pub mod sysfs;

pub use hal::*;
pub use imgcust_error::{HalError, HalResult};
