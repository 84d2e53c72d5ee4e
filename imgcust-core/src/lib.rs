//! imgcust core library.
//!
//! Turns a provisioned disk image into a bootable live ISO: the root filesystem is staged
//! into a writable image, prepared for a live boot, compressed into a squashfs and packed
//! together with a regenerated initramfs and the EFI boot loaders.

pub mod artifacts;
pub mod boot_config;
pub mod capacity;
pub mod cli;
pub mod config;
pub mod extract;
pub mod initrd;
pub mod iso;
pub mod kernel;
pub mod liveos;
pub mod logging;
pub mod pipeline;
pub mod preflight;
pub mod resources;
pub mod stager;
pub mod tools;

pub use imgcust_error::{HalError, ImageError, ImageResult};
