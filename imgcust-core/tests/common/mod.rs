//! Shared fixtures: a fake two-partition disk image and scripted external tools.

#![allow(dead_code)]

use imgcust_core::config::{IsoBuildConfig, IsoWorkingDirs};
use imgcust_hal::{mirror_tree, success_output, FakeHal, HalError};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use walkdir::WalkDir;

pub const KERNEL: &str = "6.6.14-1.azl3";

pub struct Fixture {
    pub dir: TempDir,
    pub hal: FakeHal,
    pub image: PathBuf,
    pub esp: PathBuf,
    pub root: PathBuf,
    pub cfg: IsoBuildConfig,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("disk.raw");
        fs::write(&image, b"").unwrap();

        let esp = dir.path().join("backing/esp");
        write(&esp.join("EFI/BOOT/bootx64.efi"), "shim");
        write(&esp.join("EFI/BOOT/grubx64.efi"), "grub");

        let root = dir.path().join("backing/root");
        write(&root.join("etc/fstab"), "UUID=1234 / ext4 defaults 0 1\n");
        write(&root.join("etc/os-release"), "ID=azurelinux\n");
        write(&root.join("usr/bin/bash"), "#!bash");
        set_mode(&root.join("usr/bin/bash"), 0o755);
        write(&root.join("etc/shadow"), "root:*:19000::::::\n");
        set_mode(&root.join("etc/shadow"), 0o600);
        fs::create_dir_all(root.join("var/tmp")).unwrap();
        set_mode(&root.join("var/tmp"), 0o1777);
        write(&root.join(format!("boot/vmlinuz-{KERNEL}")), "kernel");
        write(&root.join("boot/grub2/grub.cfg"), "set timeout=5\n");
        fs::create_dir_all(root.join(format!("usr/lib/modules/{KERNEL}/kernel"))).unwrap();
        fs::create_dir_all(root.join("boot/efi")).unwrap();
        std::os::unix::fs::symlink("usr/bin", root.join("bin")).unwrap();

        let hal = FakeHal::new();
        hal.back_partition(&image, 1, &esp);
        hal.back_partition(&image, 2, &root);
        script_tools(&hal);

        let mut cfg = IsoBuildConfig::default();
        cfg.dirs = IsoWorkingDirs::under(&dir.path().join("work"));

        Self {
            dir,
            hal,
            image,
            esp,
            root,
            cfg,
        }
    }
}

pub fn write(path: &Path, contents: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, contents).unwrap();
}

/// Path of the directory tree the fake `mksquashfs` saved next to its output.
pub fn squash_tree(squashfs: &Path) -> PathBuf {
    let mut name = squashfs.as_os_str().to_os_string();
    name.push(".tree");
    PathBuf::from(name)
}

pub fn set_mode(path: &Path, mode: u32) {
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).unwrap();
}

/// What a tree entry holds: file bytes, permission bits and symlink targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Dir { mode: u32 },
    File { mode: u32, contents: Vec<u8> },
    Symlink { target: PathBuf },
}

/// Every entry under `root`, keyed by relative path.
pub fn snapshot(root: &Path) -> BTreeMap<String, Node> {
    WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .map(|e| {
            let e = e.unwrap();
            let rel = e.path().strip_prefix(root).unwrap().to_string_lossy().to_string();
            let meta = e.path().symlink_metadata().unwrap();
            let mode = meta.permissions().mode() & 0o7777;
            let node = if meta.file_type().is_symlink() {
                Node::Symlink {
                    target: fs::read_link(e.path()).unwrap(),
                }
            } else if meta.is_dir() {
                Node::Dir { mode }
            } else {
                Node::File {
                    mode,
                    contents: fs::read(e.path()).unwrap(),
                }
            };
            (rel, node)
        })
        .collect()
}

/// Relative paths of every entry under `root`.
pub fn tree(root: &Path) -> BTreeSet<String> {
    snapshot(root).into_keys().collect()
}

fn script_tools(hal: &FakeHal) {
    hal.on_command("du", |cmd| {
        Ok(success_output(format!("421M\t{}\n", cmd.args.last().unwrap())))
    });
    hal.on_command("dd", |cmd| {
        let of = cmd
            .args
            .iter()
            .find_map(|a| a.strip_prefix("of="))
            .unwrap();
        fs::write(of, b"")?;
        Ok(success_output(""))
    });
    hal.on_command("cp", |cmd| {
        mirror_tree(Path::new(&cmd.args[1]), Path::new(&cmd.args[2]))?;
        Ok(success_output(""))
    });
    hal.on_command("mksquashfs", |cmd| {
        let src = Path::new(&cmd.args[0]);
        let dst = Path::new(&cmd.args[1]);
        if dst.exists() {
            return Err(HalError::Other("mksquashfs would append".into()));
        }
        mirror_tree(src, &squash_tree(dst))?;
        fs::write(dst, b"hsqs")?;
        Ok(success_output("Parallel mksquashfs: Using 4 processors\n"))
    });
    hal.on_command("dracut", |cmd| {
        if cmd.root == Path::new("/") {
            return Err(HalError::Other("dracut must run inside the image root".into()));
        }
        let kver = cmd.arg_after("--kver").unwrap_or("unknown");
        let staging = cmd.arg_after("--include").unwrap_or("/");
        if !cmd.host_path(staging).join("vmlinuz").is_file() {
            return Err(HalError::Other(format!("{staging}/vmlinuz missing")));
        }
        fs::write(cmd.host_path(&cmd.args[0]), format!("initrd {kver}"))?;
        Ok(success_output(""))
    });
    hal.on_command("xorriso", |cmd| {
        let out = cmd.arg_after("-o").unwrap();
        let staging = Path::new(cmd.args.last().unwrap());
        let listing: Vec<String> = tree(staging).into_iter().collect();
        fs::write(out, listing.join("\n"))?;
        Ok(success_output(""))
    });
}
