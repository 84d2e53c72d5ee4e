//! End-to-end conversion of a disk image into a live ISO.

use crate::artifacts::IsoArtifacts;
use crate::boot_config::{self, LIVE_DIR, LIVE_ROOT_IMAGE};
use crate::config::IsoBuildConfig;
use crate::extract::extract_boot_artifacts;
use crate::iso::IsoMaker;
use crate::liveos::convert_to_live_image;
use crate::resources::ImageConnection;
use crate::stager::create_writeable_rootfs;
use anyhow::{anyhow, Context, Result};
use imgcust_hal::ImageHal;
use std::path::{Path, PathBuf};

/// In-image directory that carries the boot loaders and kernel into the initramfs.
pub const BOOT_STAGING_SUBPATH: &str = "/boot-staging";

#[derive(Debug, Clone)]
pub struct LiveIsoOutput {
    pub iso: PathBuf,
    pub release_version: String,
    pub kernel_version: String,
    pub squashfs: PathBuf,
    pub initrd: PathBuf,
    pub grub_cfg: PathBuf,
}

/// Build a live ISO from the partitioned disk image `image`.
pub fn create_live_iso<H: ImageHal + ?Sized>(
    hal: &H,
    cfg: &IsoBuildConfig,
    image: &Path,
) -> Result<LiveIsoOutput> {
    cfg.validate()?;
    let dirs = &cfg.dirs;
    // Fail on unsupported ISO options before any work is done.
    let maker = IsoMaker::new(hal, dirs, &cfg.iso)?;
    dirs.create_all()?;

    let root_spec = cfg
        .root_partition()
        .ok_or_else(|| anyhow!("partition layout has no root partition"))?;
    let boot_spec = cfg
        .boot_partition()
        .ok_or_else(|| anyhow!("partition layout has no /boot/efi or /boot partition"))?;

    log::info!("🚀 Building live ISO from {}", image.display());
    let mut artifacts = IsoArtifacts::default();
    let rw_image = dirs.tmp_dir.join("writeable-rootfs.img");

    {
        // Read-only, so extraction and staging can mount the same partitions read-only again.
        let mut conn = ImageConnection::connect_partitioned(
            hal,
            image,
            &dirs.build_dir.join("imageroot"),
            &cfg.partitions,
            true,
        )
        .with_context(|| format!("failed to connect {}", image.display()))?;

        let (boot_device, boot_fs) = mounted_source(&conn, &boot_spec.target)?;
        extract_boot_artifacts(hal, &boot_device, &boot_fs, dirs, &mut artifacts)
            .context("boot artifact extraction failed")?;

        let (root_device, root_fs) = mounted_source(&conn, &root_spec.target)?;
        create_writeable_rootfs(hal, dirs, &root_device, &root_fs, &rw_image)
            .context("writable rootfs staging failed")?;

        conn.clean_close()
            .with_context(|| format!("failed to release {}", image.display()))?;
    }

    let kernel_version =
        convert_to_live_image(hal, dirs, &rw_image, BOOT_STAGING_SUBPATH, &mut artifacts)
            .context("LiveOS conversion failed")?;

    let grub_cfg = artifacts
        .grub_cfg
        .clone()
        .ok_or_else(|| anyhow!("boot menu was not extracted"))?;
    boot_config::write_live_grub_cfg(&grub_cfg, &cfg.iso.volume_label)?;

    let squashfs = artifacts
        .squashfs
        .clone()
        .ok_or_else(|| anyhow!("squashfs root was not produced"))?;
    let initrd = artifacts
        .initrd
        .clone()
        .ok_or_else(|| anyhow!("initramfs was not produced"))?;

    let release_version = maker.release_version();
    let inputs = artifacts.into_inputs(&format!("/{LIVE_DIR}/{LIVE_ROOT_IMAGE}"))?;
    let iso = maker
        .make(inputs, &release_version)
        .context("ISO assembly failed")?;

    Ok(LiveIsoOutput {
        iso,
        release_version,
        kernel_version,
        squashfs,
        initrd,
        grub_cfg,
    })
}

/// Device and filesystem type of the connection's mount at `target`.
fn mounted_source<H: ImageHal + ?Sized>(
    conn: &ImageConnection<'_, H>,
    target: &str,
) -> Result<(PathBuf, String)> {
    let mount = conn
        .mount_for(target)
        .ok_or_else(|| anyhow!("{} is not mounted", target))?;
    let fs_type = mount
        .fs_type()
        .ok_or_else(|| anyhow!("{} has no filesystem type", target))?;
    Ok((mount.source().to_path_buf(), fs_type.to_string()))
}
