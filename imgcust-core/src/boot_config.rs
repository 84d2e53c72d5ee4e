//! Boot menu and dracut configuration for the live image.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// In-image path of the dracut live configuration.
pub const DRACUT_LIVE_CONF: &str = "etc/dracut.conf.d/20-live-cd.conf";

/// Kernel and initramfs locations inside the ISO.
pub const ISO_KERNEL_PATH: &str = "/isolinux/vmlinuz";
pub const ISO_INITRD_PATH: &str = "/isolinux/initrd.img";

/// Directory and file name of the squashfs root inside the ISO.
pub const LIVE_DIR: &str = "LiveOS";
pub const LIVE_ROOT_IMAGE: &str = "rootfs.img";

pub fn dracut_live_conf() -> &'static str {
    "add_dracutmodules+=\" dmsquash-live \"\nadd_drivers+=\" overlay squashfs \"\n"
}

/// Kernel command line booting the squashfs root with a writable overlay.
pub fn live_kernel_cmdline(volume_label: &str) -> String {
    format!(
        "root=live:LABEL={volume_label} rd.live.image rd.live.dir=/{LIVE_DIR} \
         rd.live.squashimg={LIVE_ROOT_IMAGE} rd.live.overlay.overlayfs=1 \
         rd.live.overlay.nouserconfirmprompt"
    )
}

pub fn render_live_grub_cfg(volume_label: &str) -> String {
    format!(
        "set timeout=0\n\
         search --no-floppy --set=root --label {volume_label}\n\
         \n\
         menuentry \"Live OS\" {{\n\
         \tlinux {ISO_KERNEL_PATH} {cmdline}\n\
         \tinitrd {ISO_INITRD_PATH}\n\
         }}\n",
        cmdline = live_kernel_cmdline(volume_label)
    )
}

/// Overwrite `path` with the live boot menu.
pub fn write_live_grub_cfg(path: &Path, volume_label: &str) -> Result<()> {
    fs::write(path, render_live_grub_cfg(volume_label))
        .with_context(|| format!("Failed to write {}", path.display()))
}

/// Write the dracut live configuration into the mounted root at `root`.
pub fn write_dracut_live_conf(root: &Path) -> Result<PathBuf> {
    let path = root.join(DRACUT_LIVE_CONF);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    fs::write(&path, dracut_live_conf())
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}
