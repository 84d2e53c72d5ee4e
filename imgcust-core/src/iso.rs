//! ISO assembly.
//!
//! Lays out an ISO staging tree, builds the FAT image holding the EFI boot loaders and
//! runs `xorriso` to produce a UEFI-bootable hybrid ISO.

use crate::artifacts::IsoInputs;
use crate::config::{IsoOptions, IsoWorkingDirs};
use crate::extract::{copy_artifact, BOOTX64_EFI, GRUBX64_EFI};
use crate::tools::run_tool;
use anyhow::{bail, Context, Result};
use imgcust_error::ImageError;
use imgcust_hal::ImageHal;
use std::fs;
use std::path::{Path, PathBuf};

/// FAT32 needs at least ~33 MiB.
const EFIBOOT_SIZE_MB: u32 = 64;
const EFIBOOT_IMAGE: &str = "boot/grub2/efiboot.img";
const EFIBOOT_LABEL: &str = "EFIBOOT";

pub struct IsoMaker<'a, H: ImageHal + ?Sized> {
    hal: &'a H,
    dirs: &'a IsoWorkingDirs,
    options: &'a IsoOptions,
}

impl<'a, H: ImageHal + ?Sized> IsoMaker<'a, H> {
    /// Unattended installs and BIOS boot are not supported; such options are rejected.
    pub fn new(hal: &'a H, dirs: &'a IsoWorkingDirs, options: &'a IsoOptions) -> Result<Self> {
        if options.unattended_install {
            bail!("unattended-install ISOs are not supported");
        }
        if options.bios_boot {
            bail!("BIOS boot is not supported; ISOs boot through UEFI only");
        }
        Ok(Self { hal, dirs, options })
    }

    /// `<prefix><YYYYMMDD-HHMM>` from the local clock unless pinned in the options.
    pub fn release_version(&self) -> String {
        match &self.options.release_version {
            Some(fixed) => fixed.clone(),
            None => format!(
                "{}{}",
                self.options.release_prefix,
                chrono::Local::now().format("%Y%m%d-%H%M")
            ),
        }
    }

    pub fn output_path(&self, release_version: &str) -> PathBuf {
        self.dirs.output_dir.join(format!(
            "{}{}{}.iso",
            self.options.base_name, release_version, self.options.image_tag
        ))
    }

    /// Build the ISO and return its path.
    pub fn make(&self, inputs: IsoInputs, release_version: &str) -> Result<PathBuf> {
        let staging = self.dirs.build_dir.join("iso-staging");
        log::info!("📀 Laying out ISO tree in {}", staging.display());
        self.layout(&staging, &inputs)
            .context("failed to lay out ISO tree")?;

        let efiboot = staging.join(EFIBOOT_IMAGE);
        self.build_efiboot(&efiboot, &inputs)
            .context("failed to build EFI boot image")?;

        fs::create_dir_all(&self.dirs.output_dir).with_context(|| {
            format!("Failed to create {}", self.dirs.output_dir.display())
        })?;
        let iso = self.output_path(release_version);
        if iso.exists() {
            fs::remove_file(&iso)
                .with_context(|| format!("Failed to remove stale {}", iso.display()))?;
        }

        let iso_str = iso.to_string_lossy().to_string();
        let staging_str = staging.to_string_lossy().to_string();
        run_tool(
            self.hal,
            "assemble iso",
            "xorriso",
            &[
                "-as",
                "mkisofs",
                "-o",
                &iso_str,
                "-V",
                &self.options.volume_label,
                "-R",
                "-J",
                "-e",
                EFIBOOT_IMAGE,
                "-no-emul-boot",
                "-isohybrid-gpt-basdat",
                &staging_str,
            ],
        )?;

        if !iso.is_file() {
            return Err(ImageError::MissingArtifact(format!(
                "xorriso did not write {}",
                iso.display()
            ))
            .into());
        }
        log::info!("✅ ISO written to {}", iso.display());
        Ok(iso)
    }

    fn layout(&self, staging: &Path, inputs: &IsoInputs) -> Result<()> {
        if staging.exists() {
            fs::remove_dir_all(staging)
                .with_context(|| format!("Failed to clean {}", staging.display()))?;
        }

        let efi = staging.join("EFI/BOOT");
        copy_artifact(&inputs.bootx64_efi, &efi.join(BOOTX64_EFI))?;
        copy_artifact(&inputs.grubx64_efi, &efi.join(GRUBX64_EFI))?;
        copy_artifact(&inputs.grub_cfg, &efi.join("grub.cfg"))?;
        copy_artifact(&inputs.grub_cfg, &staging.join("boot/grub2/grub.cfg"))?;
        copy_artifact(&inputs.vmlinuz, &staging.join("isolinux/vmlinuz"))?;
        copy_artifact(&inputs.initrd, &staging.join("isolinux/initrd.img"))?;

        for (src, dst) in &inputs.additional_files {
            copy_artifact(src, &staging.join(dst.trim_start_matches('/')))?;
        }
        Ok(())
    }

    fn build_efiboot(&self, image: &Path, inputs: &IsoInputs) -> Result<()> {
        let img = image.to_string_lossy().to_string();
        run_tool(
            self.hal,
            "efi boot image",
            "dd",
            &[
                "if=/dev/zero",
                &format!("of={img}"),
                "bs=1M",
                &format!("count={EFIBOOT_SIZE_MB}"),
            ],
        )?;
        self.hal
            .format_vfat(image, EFIBOOT_LABEL)
            .map_err(|e| ImageError::tool("efi boot image", e))?;
        run_tool(
            self.hal,
            "efi boot image",
            "mmd",
            &["-i", &img, "::EFI", "::EFI/BOOT"],
        )?;

        let bootx64 = inputs.bootx64_efi.to_string_lossy().to_string();
        let grubx64 = inputs.grubx64_efi.to_string_lossy().to_string();
        let grub_cfg = inputs.grub_cfg.to_string_lossy().to_string();
        run_tool(
            self.hal,
            "efi boot image",
            "mcopy",
            &["-i", &img, &bootx64, &grubx64, &grub_cfg, "::EFI/BOOT/"],
        )?;
        Ok(())
    }
}
