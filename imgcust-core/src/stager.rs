//! Writable copy of the image's root filesystem.

use crate::capacity::{self, CapacityEstimate};
use crate::config::IsoWorkingDirs;
use crate::resources::{ImageConnection, Mount};
use crate::tools::run_tool;
use anyhow::{Context, Result};
use imgcust_hal::{FormatOptions, ImageHal, MountOptions};
use std::fs;
use std::path::Path;

const EXT4_BLOCK_SIZE: u32 = 4096;

/// Measure, allocate, format and populate `dest_image` from the filesystem on `source_device`.
///
/// The new image is twice the size of the used space of the source. Every mount and loop
/// device acquired here is released before returning.
pub fn create_writeable_rootfs<H: ImageHal + ?Sized>(
    hal: &H,
    dirs: &IsoWorkingDirs,
    source_device: &Path,
    source_fs_type: &str,
    dest_image: &Path,
) -> Result<CapacityEstimate> {
    log::info!(
        "📦 Staging writable rootfs {} from {}",
        dest_image.display(),
        source_device.display()
    );

    let src_dir = dirs.build_dir.join("ro-rootfs");
    let mut source = Mount::new(
        hal,
        source_device,
        &src_dir,
        Some(source_fs_type),
        MountOptions::read_only(),
    )
    .context("failed to mount source rootfs")?;
    let src = src_dir.to_string_lossy().to_string();

    let du = run_tool(hal, "measure rootfs", "du", &["-s", "-BM", &src])?;
    let estimate = capacity::estimate(&String::from_utf8_lossy(&du.stdout))?;
    log::info!("allocating {} for the writable rootfs", estimate);

    if let Some(parent) = dest_image.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let dest = dest_image.to_string_lossy().to_string();
    run_tool(
        hal,
        "allocate rootfs image",
        "dd",
        &[
            "if=/dev/zero",
            &format!("of={dest}"),
            &format!("bs={}", estimate.dd_block_size()),
            &format!("count={}", estimate.value),
        ],
    )?;

    hal.format_ext4(
        dest_image,
        &FormatOptions::new().with_block_size(EXT4_BLOCK_SIZE),
    )
    .map_err(|e| imgcust_error::ImageError::tool("format rootfs image", e))?;

    let dst_dir = dirs.output_dir.join("writeable-rootfs-mount");
    let mut dest_conn = ImageConnection::connect_filesystem(hal, dest_image, &dst_dir, "ext4")
        .context("failed to mount writable rootfs image")?;

    let dst = dst_dir.to_string_lossy().to_string();
    run_tool(hal, "copy rootfs", "cp", &["-aT", &src, &dst])?;

    dest_conn
        .clean_close()
        .context("failed to release writable rootfs image")?;
    source
        .clean_close()
        .context("failed to release source rootfs")?;
    if let Err(e) = fs::remove_dir(&dst_dir) {
        log::warn!("could not remove {}: {}", dst_dir.display(), e);
    }

    Ok(estimate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use imgcust_hal::{mirror_tree, success_output, FailPoint, FakeHal, LoopOps, Operation};
    use std::path::PathBuf;

    fn source_disk(hal: &FakeHal, dir: &Path) -> PathBuf {
        let image = dir.join("disk.raw");
        fs::write(&image, b"").unwrap();
        let root = dir.join("p2");
        fs::create_dir_all(root.join("etc")).unwrap();
        fs::write(root.join("etc/os-release"), "ID=azurelinux\n").unwrap();
        hal.back_partition(&image, 2, &root);
        let dev = hal.losetup_attach(&image, true).unwrap();
        PathBuf::from(format!("{dev}p2"))
    }

    fn script_tools(hal: &FakeHal) {
        hal.on_command("du", |cmd| {
            Ok(success_output(format!("421M\t{}\n", cmd.args[2])))
        });
        hal.on_command("dd", |cmd| {
            let of = cmd.args.iter().find_map(|a| a.strip_prefix("of=")).unwrap();
            fs::write(of, b"").unwrap();
            Ok(success_output(""))
        });
        hal.on_command("cp", |cmd| {
            mirror_tree(Path::new(&cmd.args[1]), Path::new(&cmd.args[2]))?;
            Ok(success_output(""))
        });
    }

    #[test]
    fn stages_a_copy_at_twice_the_used_size() {
        let dir = tempfile::tempdir().unwrap();
        let dirs = IsoWorkingDirs::under(dir.path());
        let hal = FakeHal::new();
        let device = source_disk(&hal, dir.path());
        script_tools(&hal);

        let dest = dirs.tmp_dir.join("writeable-rootfs.img");
        let estimate = create_writeable_rootfs(&hal, &dirs, &device, "ext4", &dest).unwrap();
        assert_eq!(estimate.to_string(), "842M");

        let dd = hal.commands("dd");
        assert!(matches!(
            &dd[0],
            Operation::Command { args, .. }
                if args.contains(&"bs=1M".to_string()) && args.contains(&"count=842".to_string())
        ));
        assert!(hal.has_operation(|op| matches!(
            op,
            Operation::FormatExt4 { block_size: Some(4096), .. }
        )));

        // Only the loop device attached by the test itself remains.
        assert_eq!(hal.attached_loops(), vec!["/dev/loop0".to_string()]);
        assert!(hal.mounted_paths().is_empty());
        assert!(!dirs.output_dir.join("writeable-rootfs-mount").exists());

        // The staged filesystem holds the source tree.
        let mnt = dir.path().join("check");
        let conn = ImageConnection::connect_filesystem(&hal, &dest, &mnt, "ext4").unwrap();
        assert_eq!(
            fs::read_to_string(mnt.join("etc/os-release")).unwrap(),
            "ID=azurelinux\n"
        );
        drop(conn);
    }

    #[test]
    fn copy_failure_releases_everything() {
        let dir = tempfile::tempdir().unwrap();
        let dirs = IsoWorkingDirs::under(dir.path());
        let hal = FakeHal::new();
        let device = source_disk(&hal, dir.path());
        script_tools(&hal);
        hal.fail_on(FailPoint::Command("cp".into()));

        let dest = dirs.tmp_dir.join("writeable-rootfs.img");
        let err = create_writeable_rootfs(&hal, &dirs, &device, "ext4", &dest).unwrap_err();
        assert!(format!("{err:#}").contains("copy rootfs"));
        assert!(hal.mounted_paths().is_empty());
        assert_eq!(hal.attached_loops(), vec!["/dev/loop0".to_string()]);
    }

    #[test]
    fn unparseable_du_output_aborts_before_allocation() {
        let dir = tempfile::tempdir().unwrap();
        let dirs = IsoWorkingDirs::under(dir.path());
        let hal = FakeHal::new();
        let device = source_disk(&hal, dir.path());
        hal.on_command("du", |_| Ok(success_output("du: cannot read\n")));

        let dest = dirs.tmp_dir.join("writeable-rootfs.img");
        let err = create_writeable_rootfs(&hal, &dirs, &device, "ext4", &dest).unwrap_err();
        assert!(err
            .downcast_ref::<imgcust_error::ImageError>()
            .is_some_and(|e| matches!(e, imgcust_error::ImageError::CapacityEstimation { .. })));
        assert!(hal.commands("dd").is_empty());
        assert!(hal.mounted_paths().is_empty());
    }
}
