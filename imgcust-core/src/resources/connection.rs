use super::{ChrootContext, LoopbackDevice, Mount};
use crate::config::PartitionSpec;
use imgcust_error::{ImageError, ImageResult};
use imgcust_hal::{HalError, ImageHal, MountOptions};
use once_cell::unsync::OnceCell;
use std::path::{Path, PathBuf};

/// A disk or filesystem image attached to a loop device with its filesystems mounted.
///
/// Resources are released in reverse acquisition order: nested mounts first, the root
/// mount next, the loop device last.
pub struct ImageConnection<'a, H: ImageHal + ?Sized> {
    hal: &'a H,
    // Field order is drop order: mounts go before the loop device.
    chroot: OnceCell<ChrootContext<'a, H>>,
    mounts: Vec<Mount<'a, H>>,
    loopback: Option<LoopbackDevice<'a, H>>,
    root_dir: Option<PathBuf>,
}

impl<'a, H: ImageHal + ?Sized> ImageConnection<'a, H> {
    pub fn new(hal: &'a H) -> Self {
        Self {
            hal,
            chroot: OnceCell::new(),
            mounts: Vec::new(),
            loopback: None,
            root_dir: None,
        }
    }

    /// Attach a partitioned disk image and mount `layout` under `root_dir`.
    ///
    /// With `read_only` set, the same partitions can be mounted read-only again elsewhere
    /// while this connection is held.
    pub fn connect_partitioned(
        hal: &'a H,
        image: &Path,
        root_dir: &Path,
        layout: &[PartitionSpec],
        read_only: bool,
    ) -> ImageResult<Self> {
        let mut conn = Self::new(hal);
        conn.connect_loopback(image, true)?;
        conn.mount_partitions(root_dir, layout, read_only)?;
        Ok(conn)
    }

    /// Attach a bare filesystem image and mount it at `root_dir`.
    pub fn connect_filesystem(
        hal: &'a H,
        image: &Path,
        root_dir: &Path,
        fs_type: &str,
    ) -> ImageResult<Self> {
        let mut conn = Self::new(hal);
        conn.connect_loopback(image, false)?;
        conn.mount_whole_device(root_dir, fs_type, MountOptions::new())?;
        Ok(conn)
    }

    pub fn connect_loopback(&mut self, image: &Path, scan_partitions: bool) -> ImageResult<()> {
        if let Some(existing) = &self.loopback {
            return Err(ImageError::acquisition(
                format!("loop device for {}", image.display()),
                HalError::Other(format!(
                    "connection already holds {}",
                    existing.device_path()
                )),
            ));
        }
        self.loopback = Some(LoopbackDevice::attach(self.hal, image, scan_partitions)?);
        Ok(())
    }

    fn loop_device(&self) -> ImageResult<&LoopbackDevice<'a, H>> {
        self.loopback.as_ref().ok_or_else(|| {
            ImageError::acquisition(
                "image mount",
                HalError::Other("no loop device attached".to_string()),
            )
        })
    }

    /// Mount the loop device itself (no partition table) as the root target.
    pub fn mount_whole_device(
        &mut self,
        root_dir: &Path,
        fs_type: &str,
        options: MountOptions,
    ) -> ImageResult<()> {
        let device = PathBuf::from(self.loop_device()?.device_path());
        let mount = Mount::new(self.hal, &device, root_dir, Some(fs_type), options)?;
        self.mounts.push(mount);
        self.root_dir = Some(root_dir.to_path_buf());
        Ok(())
    }

    /// Mount each partition of `layout` at its target under `root_dir`, root first.
    ///
    /// Targets of non-root partitions must already exist as directories inside the
    /// mounted root.
    pub fn mount_partitions(
        &mut self,
        root_dir: &Path,
        layout: &[PartitionSpec],
        read_only: bool,
    ) -> ImageResult<()> {
        let loopback = self.loop_device()?;
        let device = loopback.device_path().to_string();
        let partitions = loopback.partitions()?;

        let mut ordered: Vec<&PartitionSpec> = layout.iter().collect();
        ordered.sort_by_key(|spec| (!spec.is_root(), spec.target.matches('/').count()));
        match ordered.first() {
            Some(spec) if spec.is_root() => {}
            _ => {
                return Err(ImageError::acquisition(
                    format!("mounts of {device}"),
                    HalError::Other("partition layout has no root target".to_string()),
                ))
            }
        }

        for spec in ordered {
            let node = PathBuf::from(format!("{device}p{}", spec.partition));
            if !partitions.contains(&node) {
                return Err(ImageError::acquisition(
                    format!("partition {} of {device}", spec.partition),
                    HalError::Other(format!("{} does not exist", node.display())),
                ));
            }

            let target = root_dir.join(spec.target.trim_start_matches('/'));
            if !spec.is_root() && !target.is_dir() {
                return Err(ImageError::acquisition(
                    format!("mount {} -> {}", node.display(), target.display()),
                    HalError::Other(format!(
                        "{} is missing from the image root",
                        spec.target
                    )),
                ));
            }

            let options = MountOptions {
                options: spec.options.clone(),
                read_only,
                bind: false,
            };
            let mount = Mount::new(self.hal, &node, &target, Some(&spec.fs_type), options)?;
            self.mounts.push(mount);
            if spec.is_root() {
                self.root_dir = Some(root_dir.to_path_buf());
            }
        }
        Ok(())
    }

    pub fn loopback(&self) -> Option<&LoopbackDevice<'a, H>> {
        self.loopback.as_ref()
    }

    /// Mounts in acquisition order.
    pub fn mounts(&self) -> &[Mount<'a, H>] {
        &self.mounts
    }

    /// Mount whose target is `target` inside the image (`/`, `/boot/efi`, ...).
    pub fn mount_for(&self, target: &str) -> Option<&Mount<'a, H>> {
        let root = self.root_dir.as_ref()?;
        let wanted = root.join(target.trim_start_matches('/'));
        self.mounts.iter().find(|m| m.target() == wanted)
    }

    pub fn root_dir(&self) -> Option<&Path> {
        self.root_dir.as_deref()
    }

    /// Chroot context bound to the root mount, built on first use.
    pub fn chroot(&self) -> ImageResult<&ChrootContext<'a, H>> {
        let root = self.root_dir.clone().ok_or_else(|| {
            ImageError::acquisition(
                "chroot",
                HalError::Other("connection has no root mount".to_string()),
            )
        })?;
        Ok(self
            .chroot
            .get_or_init(|| ChrootContext::new(self.hal, root)))
    }

    /// Best-effort teardown in reverse order. Failures are logged and teardown continues.
    pub fn close(&mut self) {
        for mount in self.mounts.iter_mut().rev() {
            mount.close();
        }
        if let Some(loopback) = self.loopback.as_mut() {
            loopback.close();
        }
    }

    /// Strict teardown in reverse order, stopping at the first failure.
    pub fn clean_close(&mut self) -> ImageResult<()> {
        for mount in self.mounts.iter_mut().rev() {
            mount.clean_close()?;
        }
        if let Some(loopback) = self.loopback.as_mut() {
            loopback.detach()?;
        }
        Ok(())
    }
}

impl<H: ImageHal + ?Sized> Drop for ImageConnection<'_, H> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imgcust_hal::{FailPoint, FakeHal, Operation};
    use std::fs;

    struct Disk {
        _dir: tempfile::TempDir,
        image: PathBuf,
        root_dir: PathBuf,
    }

    fn disk(hal: &FakeHal) -> Disk {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("disk.raw");
        fs::write(&image, b"").unwrap();
        let efi = dir.path().join("backing/p1");
        let root = dir.path().join("backing/p2");
        fs::create_dir_all(efi.join("EFI/BOOT")).unwrap();
        fs::create_dir_all(root.join("boot/efi")).unwrap();
        hal.back_partition(&image, 1, &efi);
        hal.back_partition(&image, 2, &root);
        let root_dir = dir.path().join("imageroot");
        Disk {
            _dir: dir,
            image,
            root_dir,
        }
    }

    fn layout() -> Vec<PartitionSpec> {
        vec![
            PartitionSpec::new(1, "/boot/efi", "vfat"),
            PartitionSpec::new(2, "/", "ext4"),
        ]
    }

    fn release_ops(hal: &FakeHal) -> Vec<Operation> {
        hal.operations()
            .into_iter()
            .filter(|op| {
                matches!(
                    op,
                    Operation::Unmount { .. } | Operation::LosetupDetach { .. }
                )
            })
            .collect()
    }

    #[test]
    fn root_is_mounted_first_and_released_last() {
        let hal = FakeHal::new();
        let d = disk(&hal);
        let mut conn =
            ImageConnection::connect_partitioned(&hal, &d.image, &d.root_dir, &layout(), false)
                .unwrap();

        let targets: Vec<_> = conn.mounts().iter().map(|m| m.target().to_path_buf()).collect();
        assert_eq!(targets, vec![d.root_dir.clone(), d.root_dir.join("boot/efi")]);
        assert_eq!(
            conn.mount_for("/boot/efi").unwrap().source(),
            Path::new("/dev/loop0p1")
        );

        conn.clean_close().unwrap();
        assert_eq!(
            release_ops(&hal),
            vec![
                Operation::Unmount {
                    target: d.root_dir.join("boot/efi")
                },
                Operation::Unmount {
                    target: d.root_dir.clone()
                },
                Operation::LosetupDetach {
                    loop_device: "/dev/loop0".to_string()
                },
            ]
        );
    }

    #[test]
    fn close_is_idempotent_and_continues_past_failures() {
        let hal = FakeHal::new();
        let d = disk(&hal);
        let mut conn =
            ImageConnection::connect_partitioned(&hal, &d.image, &d.root_dir, &layout(), false)
                .unwrap();

        hal.fail_on(FailPoint::Unmount(d.root_dir.join("boot/efi")));
        conn.close();
        // The root cannot be unmounted while the nested mount is stuck, but the
        // loop device detach is still attempted.
        assert!(hal.has_operation(|op| matches!(op, Operation::LosetupDetach { .. })));

        hal.clear_failures();
        conn.close();
        conn.close();
        assert!(hal.mounted_paths().is_empty());
    }

    #[test]
    fn clean_close_stops_at_first_failure() {
        let hal = FakeHal::new();
        let d = disk(&hal);
        let mut conn =
            ImageConnection::connect_partitioned(&hal, &d.image, &d.root_dir, &layout(), false)
                .unwrap();

        hal.fail_on(FailPoint::Unmount(d.root_dir.join("boot/efi")));
        assert!(matches!(conn.clean_close(), Err(ImageError::Release { .. })));
        assert_eq!(release_ops(&hal).len(), 1);

        hal.clear_failures();
        drop(conn);
        assert!(hal.mounted_paths().is_empty());
        assert!(hal.attached_loops().is_empty());
    }

    #[test]
    fn failed_connect_releases_what_was_acquired() {
        let hal = FakeHal::new();
        let d = disk(&hal);
        let mut bad = layout();
        bad.push(PartitionSpec::new(7, "/srv", "ext4"));

        let err = ImageConnection::connect_partitioned(&hal, &d.image, &d.root_dir, &bad, false)
            .err()
            .unwrap();
        assert!(matches!(err, ImageError::ResourceAcquisition { .. }));
        assert!(hal.mounted_paths().is_empty());
        assert!(hal.attached_loops().is_empty());
    }

    #[test]
    fn nested_target_must_exist_in_root() {
        let hal = FakeHal::new();
        let d = disk(&hal);
        let layout = vec![
            PartitionSpec::new(2, "/", "ext4"),
            PartitionSpec::new(1, "/boot/missing", "vfat"),
        ];
        let err = ImageConnection::connect_partitioned(&hal, &d.image, &d.root_dir, &layout, false)
            .err()
            .unwrap();
        assert!(err.to_string().contains("/boot/missing"));
    }

    #[test]
    fn read_only_layout_allows_read_only_remounts() {
        let hal = FakeHal::new();
        let d = disk(&hal);
        let conn =
            ImageConnection::connect_partitioned(&hal, &d.image, &d.root_dir, &layout(), true)
                .unwrap();
        assert!(hal
            .operations()
            .iter()
            .filter(|op| matches!(op, Operation::Mount { .. }))
            .all(|op| matches!(op, Operation::Mount { read_only: true, .. })));

        let again = d._dir.path().join("ro-boot");
        let source = conn.mount_for("/boot/efi").unwrap().source().to_path_buf();
        let mut extra =
            Mount::new(&hal, &source, &again, Some("vfat"), MountOptions::read_only()).unwrap();
        assert!(again.join("EFI/BOOT").is_dir());
        extra.clean_close().unwrap();

        // A read-write layout would block the same re-mount.
        drop(conn);
        let rw =
            ImageConnection::connect_partitioned(&hal, &d.image, &d.root_dir, &layout(), false)
                .unwrap();
        let source = rw.mount_for("/").unwrap().source().to_path_buf();
        let err = Mount::new(&hal, &source, &again, Some("ext4"), MountOptions::read_only())
            .err()
            .unwrap();
        assert!(matches!(err, ImageError::ResourceAcquisition { .. }));
    }

    #[test]
    fn chroot_requires_root_mount() {
        let hal = FakeHal::new();
        let conn = ImageConnection::new(&hal);
        assert!(conn.chroot().is_err());
    }

    #[test]
    fn whole_device_mount_exposes_chroot() {
        let hal = FakeHal::new();
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("rootfs.img");
        fs::write(&image, b"").unwrap();
        let backing = dir.path().join("fs");
        fs::create_dir_all(backing.join("etc")).unwrap();
        hal.back_image(&image, &backing);

        let mnt = dir.path().join("mnt");
        let mut conn = ImageConnection::connect_filesystem(&hal, &image, &mnt, "ext4").unwrap();
        assert_eq!(conn.root_dir(), Some(mnt.as_path()));
        assert!(mnt.join("etc").is_dir());
        assert_eq!(conn.chroot().unwrap().root(), mnt.as_path());
        conn.clean_close().unwrap();
    }
}
