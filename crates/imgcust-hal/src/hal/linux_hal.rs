//! Linux HAL implementation using real system calls.

use super::{
    FormatOps, FormatOptions, LoopOps, MountOps, MountOptions, ProcessOps, RootOps, SavedRoot,
};
use crate::{HalError, HalResult};
use std::fs::{self, File};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

/// Real HAL implementation for Linux systems.
#[derive(Debug, Clone, Default)]
pub struct LinuxHal;

impl LinuxHal {
    pub fn new() -> Self {
        Self
    }
}

fn map_command_err(program: &str, err: std::io::Error) -> HalError {
    if err.kind() == std::io::ErrorKind::NotFound {
        return HalError::CommandNotFound(program.to_string());
    }
    HalError::Io(err)
}

fn output_failed(program: &str, output: &Output) -> HalError {
    HalError::CommandFailed {
        program: program.to_string(),
        code: output.status.code(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    }
}

fn run(program: &str, cmd: &mut Command) -> HalResult<Output> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let output = cmd.output().map_err(|e| map_command_err(program, e))?;
    if !output.status.success() {
        return Err(output_failed(program, &output));
    }
    Ok(output)
}

fn map_nix_err(err: nix::errno::Errno) -> HalError {
    use nix::errno::Errno;
    match err {
        Errno::EBUSY => HalError::DiskBusy,
        Errno::EACCES | Errno::EPERM => HalError::PermissionDenied,
        other => HalError::Nix(other),
    }
}

fn fchdir(dir: &File) -> HalResult<()> {
    // SAFETY: `dir` is an open directory descriptor owned by the caller for the whole call.
    let rc = unsafe { libc::fchdir(dir.as_raw_fd()) };
    nix::errno::Errno::result(rc).map_err(map_nix_err)?;
    Ok(())
}

impl ProcessOps for LinuxHal {
    fn command_output(&self, program: &str, args: &[&str]) -> HalResult<Output> {
        log::debug!("exec: {} {}", program, args.join(" "));
        let mut cmd = Command::new(program);
        cmd.args(args);
        run(program, &mut cmd)
    }
}

impl MountOps for LinuxHal {
    fn mount_device(
        &self,
        device: &Path,
        target: &Path,
        fstype: Option<&str>,
        options: &MountOptions,
    ) -> HalResult<()> {
        let mut flags = nix::mount::MsFlags::empty();
        if options.read_only {
            flags |= nix::mount::MsFlags::MS_RDONLY;
        }
        if options.bind {
            flags |= nix::mount::MsFlags::MS_BIND;
        }
        let data = options.options.as_deref();

        nix::mount::mount(Some(device), target, fstype, flags, data).map_err(map_nix_err)?;

        Ok(())
    }

    fn unmount(&self, target: &Path) -> HalResult<()> {
        nix::mount::umount2(target, nix::mount::MntFlags::empty()).map_err(map_nix_err)?;
        Ok(())
    }

    fn is_mounted(&self, path: &Path) -> HalResult<bool> {
        let content = fs::read_to_string("/proc/self/mountinfo")?;
        let entries = crate::procfs::mountinfo::parse_mountinfo(&content);
        Ok(crate::procfs::mountinfo::is_mounted_from_info(
            path, &entries,
        ))
    }
}

impl FormatOps for LinuxHal {
    fn format_ext4(&self, device: &Path, opts: &FormatOptions) -> HalResult<()> {
        let mut args: Vec<String> = Vec::new();
        if let Some(block_size) = opts.block_size {
            args.push("-b".to_string());
            args.push(block_size.to_string());
        }
        args.push(device.display().to_string());

        let mut cmd = Command::new("mkfs.ext4");
        cmd.args(&args);
        run("mkfs.ext4", &mut cmd)?;
        Ok(())
    }

    fn format_vfat(&self, device: &Path, label: &str) -> HalResult<()> {
        let mut args: Vec<String> = vec!["-F".to_string(), "32".to_string()];
        args.push("-n".to_string());
        args.push(label.to_string());
        args.push(device.display().to_string());

        let mut cmd = Command::new("mkfs.vfat");
        cmd.args(&args);
        run("mkfs.vfat", &mut cmd)?;
        Ok(())
    }
}

impl LoopOps for LinuxHal {
    fn losetup_attach(&self, image: &Path, scan_partitions: bool) -> HalResult<String> {
        let mut args = vec!["--show".to_string(), "-f".to_string()];
        if scan_partitions {
            args.push("-P".to_string());
        }
        args.push(image.display().to_string());

        let mut cmd = Command::new("losetup");
        cmd.args(&args);
        let output = run("losetup", &mut cmd)?;

        let device = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if device.is_empty() {
            return Err(HalError::Parse(format!(
                "losetup printed no device for {}",
                image.display()
            )));
        }
        Ok(device)
    }

    fn losetup_detach(&self, loop_device: &str) -> HalResult<()> {
        let mut cmd = Command::new("losetup");
        cmd.args(["-d", loop_device]);
        run("losetup", &mut cmd)?;
        Ok(())
    }

    fn loop_partitions(&self, loop_device: &str) -> HalResult<Vec<PathBuf>> {
        // Partition nodes appear asynchronously after `losetup -P`.
        let mut settle = Command::new("udevadm");
        settle.arg("settle");
        if let Err(e) = run("udevadm", &mut settle) {
            log::debug!("udevadm settle failed (continuing): {}", e);
        }
        crate::sysfs::block::partitions(Path::new(loop_device))
    }
}

impl RootOps for LinuxHal {
    fn enter_root(&self, new_root: &Path) -> HalResult<SavedRoot> {
        let root_dir = File::open("/")?;
        let cwd = File::open(".").ok();

        nix::unistd::chroot(new_root).map_err(map_nix_err)?;
        if let Err(e) = nix::unistd::chdir("/") {
            // Leave the process where it started.
            fchdir(&root_dir)?;
            nix::unistd::chroot(".").map_err(map_nix_err)?;
            return Err(map_nix_err(e));
        }

        Ok(SavedRoot {
            root_dir: Some(root_dir),
            cwd,
            previous: PathBuf::from("/"),
            entered: new_root.to_path_buf(),
        })
    }

    fn restore_root(&self, saved: SavedRoot) -> HalResult<()> {
        let root_dir = saved
            .root_dir
            .as_ref()
            .ok_or_else(|| HalError::Other("saved root has no descriptor".to_string()))?;
        fchdir(root_dir)?;
        nix::unistd::chroot(".").map_err(map_nix_err)?;
        match saved.cwd.as_ref() {
            Some(cwd) => fchdir(cwd)?,
            None => nix::unistd::chdir("/").map_err(map_nix_err)?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_program_maps_to_command_not_found() {
        let hal = LinuxHal::new();
        let err = hal
            .command_output("imgcust-definitely-not-a-real-tool", &[])
            .unwrap_err();
        assert!(matches!(
            err,
            HalError::CommandNotFound(p) if p == "imgcust-definitely-not-a-real-tool"
        ));
    }

    #[test]
    fn non_zero_exit_carries_code_and_stderr() {
        let hal = LinuxHal::new();
        let err = hal
            .command_output("sh", &["-c", "echo broken >&2; exit 3"])
            .unwrap_err();
        match err {
            HalError::CommandFailed {
                program,
                code,
                stderr,
            } => {
                assert_eq!(program, "sh");
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "broken");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn nix_errors_map_to_hal_errors() {
        use nix::errno::Errno;
        assert!(matches!(map_nix_err(Errno::EBUSY), HalError::DiskBusy));
        assert!(matches!(
            map_nix_err(Errno::EPERM),
            HalError::PermissionDenied
        ));
        assert!(matches!(
            map_nix_err(Errno::ENOENT),
            HalError::Nix(Errno::ENOENT)
        ));
    }
}
