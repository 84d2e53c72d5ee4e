//! Initramfs regeneration inside the staged root.

use crate::config::IsoWorkingDirs;
use crate::extract::copy_artifact;
use crate::resources::ImageConnection;
use crate::tools::run_tool;
use anyhow::{Context, Result};
use imgcust_hal::ImageHal;
use std::path::{Path, PathBuf};

/// Initramfs path inside the chroot.
const INITRD_IN_ROOT: &str = "/initrd.img";

/// Run dracut inside `rw_image` and copy the initramfs to `output`.
///
/// The image is connected afresh; the initramfs is copied out before the connection is
/// released.
pub fn generate_initrd<H: ImageHal + ?Sized>(
    hal: &H,
    dirs: &IsoWorkingDirs,
    rw_image: &Path,
    kernel_version: &str,
    staging_subpath: &str,
    output: &Path,
) -> Result<PathBuf> {
    log::info!("🧰 Generating initramfs for kernel {}", kernel_version);

    let mount_dir = dirs
        .build_dir
        .join("initrd-generated")
        .join("customized-rootfs-image-mount");
    let mut conn = ImageConnection::connect_filesystem(hal, rw_image, &mount_dir, "ext4")
        .context("failed to connect writable rootfs for dracut")?;

    conn.chroot()?
        .unsafe_run(|| {
            run_tool(
                hal,
                "generate initrd",
                "dracut",
                &[
                    INITRD_IN_ROOT,
                    "--kver",
                    kernel_version,
                    "--filesystems",
                    "squashfs",
                    "--include",
                    staging_subpath,
                    "/boot",
                ],
            )?;
            Ok(())
        })
        .context("failed to run dracut")?;

    let initrd = copy_artifact(
        &mount_dir.join(INITRD_IN_ROOT.trim_start_matches('/')),
        output,
    )
    .context("dracut produced no initramfs")?;

    conn.clean_close()
        .context("failed to release writable rootfs after dracut")?;
    Ok(initrd)
}
