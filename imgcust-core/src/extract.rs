//! Boot loader extraction from the EFI system partition.

use crate::artifacts::IsoArtifacts;
use crate::config::IsoWorkingDirs;
use crate::resources::Mount;
use anyhow::{Context, Result};
use imgcust_error::ImageError;
use imgcust_hal::{MountOps, MountOptions};
use std::fs;
use std::path::{Path, PathBuf};

pub const EFI_BOOT_DIR: &str = "EFI/BOOT";
pub const BOOTX64_EFI: &str = "bootx64.efi";
pub const GRUBX64_EFI: &str = "grubx64.efi";

/// Copy `src` to `dst`, failing with a missing-artifact error when `src` is absent.
pub(crate) fn copy_artifact(src: &Path, dst: &Path) -> Result<PathBuf> {
    if !src.is_file() {
        return Err(ImageError::MissingArtifact(src.display().to_string()).into());
    }
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    fs::copy(src, dst)
        .with_context(|| format!("Failed to copy {} to {}", src.display(), dst.display()))?;
    log::debug!("copied {} -> {}", src.display(), dst.display());
    Ok(dst.to_path_buf())
}

/// Mount the boot partition read-only and copy the EFI boot loaders to the output dir.
pub fn extract_boot_artifacts<H: MountOps + ?Sized>(
    hal: &H,
    boot_device: &Path,
    fs_type: &str,
    dirs: &IsoWorkingDirs,
    artifacts: &mut IsoArtifacts,
) -> Result<()> {
    let mount_dir = dirs.build_dir.join("ro-boot");
    log::info!(
        "🥾 Extracting boot loaders from {} ({})",
        boot_device.display(),
        fs_type
    );

    let mut mount = Mount::new(
        hal,
        boot_device,
        &mount_dir,
        Some(fs_type),
        MountOptions::read_only(),
    )
    .context("failed to mount boot partition")?;

    let efi_dir = mount_dir.join(EFI_BOOT_DIR);
    let bootx64 = copy_artifact(&efi_dir.join(BOOTX64_EFI), &dirs.output_dir.join(BOOTX64_EFI))?;
    let grubx64 = copy_artifact(&efi_dir.join(GRUBX64_EFI), &dirs.output_dir.join(GRUBX64_EFI))?;

    mount
        .clean_close()
        .context("failed to release boot partition")?;

    artifacts.bootx64_efi = Some(bootx64);
    artifacts.grubx64_efi = Some(grubx64);
    Ok(())
}
