//! Conversion of the writable rootfs into a LiveOS payload.

use crate::artifacts::IsoArtifacts;
use crate::boot_config;
use crate::config::IsoWorkingDirs;
use crate::extract::{copy_artifact, BOOTX64_EFI, EFI_BOOT_DIR, GRUBX64_EFI};
use crate::initrd::generate_initrd;
use crate::kernel::select_kernel_version;
use crate::resources::ImageConnection;
use crate::tools::run_tool;
use anyhow::{Context, Result};
use imgcust_error::ImageError;
use imgcust_hal::ImageHal;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Squashfs root image written to the output directory.
pub const SQUASHFS_NAME: &str = "rootfs.img";

/// Prepare `rw_image` for a live boot, squash it and build a matching initramfs.
///
/// The EFI boot loaders must already be recorded in `artifacts`. On success the kernel,
/// the extracted boot menu, the squashfs root and the initramfs are recorded too. Steps
/// that completed before a failure are not undone.
pub fn convert_to_live_image<H: ImageHal + ?Sized>(
    hal: &H,
    dirs: &IsoWorkingDirs,
    rw_image: &Path,
    staging_subpath: &str,
    artifacts: &mut IsoArtifacts,
) -> Result<String> {
    let mount_dir = dirs.build_dir.join("rw-rootfs");
    log::info!("💿 Converting {} to a live image", rw_image.display());

    let mut conn = ImageConnection::connect_filesystem(hal, rw_image, &mount_dir, "ext4")
        .context("failed to mount writable rootfs")?;

    let kernel_version = select_kernel_version(&mount_dir.join("usr/lib/modules"))?;
    log::info!("kernel version: {}", kernel_version);

    let vmlinuz_src = mount_dir.join(format!("boot/vmlinuz-{kernel_version}"));
    let grub_cfg = copy_artifact(
        &mount_dir.join("boot/grub2/grub.cfg"),
        &dirs.output_dir.join("grub.cfg"),
    )?;
    let vmlinuz = copy_artifact(&vmlinuz_src, &dirs.output_dir.join("vmlinuz"))?;

    embed_boot_payload(&mount_dir, staging_subpath, artifacts, &vmlinuz_src)
        .context("failed to embed boot payload")?;
    prepare_for_dracut(&mount_dir).context("failed to prepare rootfs for dracut")?;

    let squashfs = dirs.output_dir.join(SQUASHFS_NAME);
    match fs::remove_file(&squashfs) {
        Ok(()) => log::debug!("removed stale {}", squashfs.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to remove {}", squashfs.display()))
        }
    }
    let src = mount_dir.to_string_lossy().to_string();
    let dst = squashfs.to_string_lossy().to_string();
    run_tool(hal, "squashfs", "mksquashfs", &[&src, &dst])?;

    conn.clean_close()
        .context("failed to release writable rootfs")?;
    fs::remove_dir_all(&mount_dir)
        .with_context(|| format!("Failed to remove {}", mount_dir.display()))?;

    let initrd = generate_initrd(
        hal,
        dirs,
        rw_image,
        &kernel_version,
        staging_subpath,
        &dirs.output_dir.join("initrd.img"),
    )?;

    artifacts.grub_cfg = Some(grub_cfg);
    artifacts.vmlinuz = Some(vmlinuz);
    artifacts.squashfs = Some(squashfs);
    artifacts.initrd = Some(initrd);
    Ok(kernel_version)
}

/// Boot loaders under `<staging>/efi/EFI/BOOT`, the kernel as `<staging>/vmlinuz`.
fn embed_boot_payload(
    root: &Path,
    staging_subpath: &str,
    artifacts: &IsoArtifacts,
    vmlinuz: &Path,
) -> Result<()> {
    let staging = root.join(staging_subpath.trim_start_matches('/'));
    let loaders = staging.join("efi").join(EFI_BOOT_DIR);

    for (recorded, name) in [
        (&artifacts.bootx64_efi, BOOTX64_EFI),
        (&artifacts.grubx64_efi, GRUBX64_EFI),
    ] {
        let src: &PathBuf = recorded
            .as_ref()
            .ok_or_else(|| ImageError::MissingArtifact(format!("{name} was not extracted")))?;
        copy_artifact(src, &loaders.join(name))?;
    }
    copy_artifact(vmlinuz, &staging.join("vmlinuz"))?;
    Ok(())
}

fn prepare_for_dracut(root: &Path) -> Result<()> {
    let fstab = root.join("etc/fstab");
    match fs::remove_file(&fstab) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            log::debug!("{} already absent", fstab.display())
        }
        Err(e) => return Err(e).with_context(|| format!("Failed to remove {}", fstab.display())),
    }
    boot_config::write_dracut_live_conf(root)?;
    Ok(())
}
