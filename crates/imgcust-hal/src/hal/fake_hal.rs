//! Fake HAL implementation for testing.
//!
//! This implementation records all operations without touching the host, allowing for
//! CI-safe testing without root privileges.
//!
//! Filesystems are emulated with plain directories: an image file or a loop partition can be
//! given a *backing directory*. Mounting a backed device copies the backing tree into the
//! mount point, and unmounting a read-write mount copies the mount point back into the backing
//! directory and empties the mount point. Mounts without a backing (bind mounts, `proc`,
//! `sysfs`) are only recorded. External commands succeed with empty output unless a handler
//! is registered with [`FakeHal::on_command`].

use super::{
    FormatOps, FormatOptions, LoopOps, MountOps, MountOptions, ProcessOps, RootOps, SavedRoot,
};
use crate::{HalError, HalResult};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Output};
use std::sync::{Arc, Mutex, MutexGuard};

/// Operation records for testing and verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Mount {
        device: PathBuf,
        target: PathBuf,
        fstype: Option<String>,
        read_only: bool,
        bind: bool,
    },
    Unmount {
        target: PathBuf,
    },
    FormatExt4 {
        device: PathBuf,
        block_size: Option<u32>,
    },
    FormatVfat {
        device: PathBuf,
        label: String,
    },
    LosetupAttach {
        image: PathBuf,
        scan_partitions: bool,
        loop_device: String,
    },
    LosetupDetach {
        loop_device: String,
    },
    Command {
        program: String,
        args: Vec<String>,
        /// Process root the command ran under.
        root: PathBuf,
    },
    EnterRoot {
        root: PathBuf,
    },
    RestoreRoot {
        root: PathBuf,
    },
}

/// Operation that should fail when reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailPoint {
    Mount(PathBuf),
    Unmount(PathBuf),
    Attach(PathBuf),
    Detach(String),
    /// Any invocation of the named program.
    Command(String),
    EnterRoot,
}

/// A command invocation handed to a handler registered with [`FakeHal::on_command`].
#[derive(Debug, Clone)]
pub struct FakeCommand {
    pub program: String,
    pub args: Vec<String>,
    /// Process root at the time of the call (`/` outside any chroot).
    pub root: PathBuf,
}

impl FakeCommand {
    /// Host path of `path` as seen by the command, resolving it against the current root.
    pub fn host_path(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        self.root.join(path.strip_prefix("/").unwrap_or(path))
    }

    /// Value following `flag` in the argument list.
    pub fn arg_after(&self, flag: &str) -> Option<&str> {
        self.args
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.args.get(i + 1))
            .map(String::as_str)
    }
}

type CommandHandler = Arc<dyn Fn(&FakeCommand) -> HalResult<Output> + Send + Sync>;

#[derive(Debug, Clone)]
struct LoopRecord {
    image: PathBuf,
    scan_partitions: bool,
}

#[derive(Debug, Clone)]
struct MountRecord {
    /// Source device, `None` for bind mounts.
    device: Option<PathBuf>,
    backing: Option<PathBuf>,
    read_only: bool,
}

/// Shared state for FakeHal operations.
#[derive(Default)]
struct FakeHalState {
    operations: Vec<Operation>,
    mounted: BTreeMap<PathBuf, MountRecord>,
    loops: BTreeMap<String, LoopRecord>,
    image_backings: HashMap<PathBuf, PathBuf>,
    partition_backings: HashMap<PathBuf, BTreeMap<u32, PathBuf>>,
    roots: Vec<PathBuf>,
    failures: Vec<FailPoint>,
    handlers: HashMap<String, CommandHandler>,
}

impl fmt::Debug for FakeHalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FakeHalState")
            .field("operations", &self.operations)
            .field("mounted", &self.mounted)
            .field("loops", &self.loops)
            .field("roots", &self.roots)
            .field("failures", &self.failures)
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl FakeHalState {
    fn fails(&self, point: &FailPoint) -> bool {
        self.failures.contains(point)
    }

    fn current_root(&self) -> PathBuf {
        self.roots
            .last()
            .cloned()
            .unwrap_or_else(|| PathBuf::from("/"))
    }

    /// Backing directory for a loop device or loop partition node.
    fn backing_for(&self, device: &Path) -> Option<PathBuf> {
        let name = device.to_string_lossy();
        if let Some(record) = self.loops.get(name.as_ref()) {
            return self.image_backings.get(&record.image).cloned();
        }
        let (loop_dev, number) = split_partition(&name)?;
        let record = self.loops.get(loop_dev)?;
        if !record.scan_partitions {
            return None;
        }
        self.partition_backings
            .get(&record.image)?
            .get(&number)
            .cloned()
    }
}

/// Splits `/dev/loop3p2` into (`/dev/loop3`, 2).
fn split_partition(device: &str) -> Option<(&str, u32)> {
    let idx = device.rfind('p')?;
    let (head, tail) = device.split_at(idx);
    let number = tail[1..].parse().ok()?;
    head.rsplit('/')
        .next()
        .filter(|n| n.starts_with("loop"))
        .map(|_| (head, number))
}

fn injected(program: &str) -> HalError {
    HalError::CommandFailed {
        program: program.to_string(),
        code: Some(1),
        stderr: "injected failure".to_string(),
    }
}

/// Successful process output with the given stdout.
pub fn success_output(stdout: impl Into<Vec<u8>>) -> Output {
    Output {
        status: ExitStatus::from_raw(0),
        stdout: stdout.into(),
        stderr: Vec::new(),
    }
}

/// Copy the tree under `src` into `dst`, keeping symlinks and permissions.
pub fn mirror_tree(src: &Path, dst: &Path) -> io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in walkdir::WalkDir::new(src).min_depth(1) {
        let entry = entry.map_err(io::Error::other)?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(io::Error::other)?;
        let out = dst.join(rel);
        let file_type = entry.file_type();
        if file_type.is_symlink() {
            if out.symlink_metadata().is_ok() {
                fs::remove_file(&out)?;
            }
            std::os::unix::fs::symlink(fs::read_link(entry.path())?, &out)?;
        } else if file_type.is_dir() {
            fs::create_dir_all(&out)?;
            fs::set_permissions(&out, entry.metadata().map_err(io::Error::other)?.permissions())?;
        } else {
            fs::copy(entry.path(), &out)?;
        }
    }
    Ok(())
}

/// Remove everything inside `dir`, keeping `dir` itself.
fn clear_dir(dir: &Path) -> io::Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.symlink_metadata()?.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

/// Fake HAL implementation that records operations without executing them.
#[derive(Debug, Clone, Default)]
pub struct FakeHal {
    state: Arc<Mutex<FakeHalState>>,
}

impl FakeHal {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeHalState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Get all recorded operations.
    pub fn operations(&self) -> Vec<Operation> {
        self.state().operations.clone()
    }

    /// Get the number of operations recorded.
    pub fn operation_count(&self) -> usize {
        self.state().operations.len()
    }

    /// Check if a specific operation was recorded.
    pub fn has_operation(&self, check: impl Fn(&Operation) -> bool) -> bool {
        self.state().operations.iter().any(check)
    }

    /// Recorded invocations of `program`.
    pub fn commands(&self, program: &str) -> Vec<Operation> {
        self.state()
            .operations
            .iter()
            .filter(|op| matches!(op, Operation::Command { program: p, .. } if p == program))
            .cloned()
            .collect()
    }

    /// Currently mounted paths, sorted.
    pub fn mounted_paths(&self) -> Vec<PathBuf> {
        self.state().mounted.keys().cloned().collect()
    }

    /// Currently attached loop devices.
    pub fn attached_loops(&self) -> Vec<String> {
        self.state().loops.keys().cloned().collect()
    }

    /// Root the process is (pretending to be) confined to.
    pub fn current_root(&self) -> PathBuf {
        self.state().current_root()
    }

    /// Use `dir` as the filesystem of a whole (unpartitioned) image.
    pub fn back_image(&self, image: impl Into<PathBuf>, dir: impl Into<PathBuf>) {
        self.state().image_backings.insert(image.into(), dir.into());
    }

    /// Use `dir` as the filesystem of partition `number` of a partitioned image.
    pub fn back_partition(&self, image: impl Into<PathBuf>, number: u32, dir: impl Into<PathBuf>) {
        self.state()
            .partition_backings
            .entry(image.into())
            .or_default()
            .insert(number, dir.into());
    }

    /// Make the matching operation fail until [`FakeHal::clear_failures`] is called.
    pub fn fail_on(&self, point: FailPoint) {
        self.state().failures.push(point);
    }

    pub fn clear_failures(&self) {
        self.state().failures.clear();
    }

    /// Run `handler` for every invocation of `program`, replacing the default empty success.
    pub fn on_command(
        &self,
        program: &str,
        handler: impl Fn(&FakeCommand) -> HalResult<Output> + Send + Sync + 'static,
    ) {
        self.state()
            .handlers
            .insert(program.to_string(), Arc::new(handler));
    }

    fn record_operation(&self, op: Operation) {
        self.state().operations.push(op);
    }
}

impl ProcessOps for FakeHal {
    fn command_output(&self, program: &str, args: &[&str]) -> HalResult<Output> {
        let (handler, root) = {
            let mut state = self.state();
            let root = state.current_root();
            state.operations.push(Operation::Command {
                program: program.to_string(),
                args: args.iter().map(|s| s.to_string()).collect(),
                root: root.clone(),
            });
            if state.fails(&FailPoint::Command(program.to_string())) {
                return Err(injected(program));
            }
            (state.handlers.get(program).cloned(), root)
        };

        log::info!("FAKE HAL: exec {} {}", program, args.join(" "));

        match handler {
            Some(handler) => handler(&FakeCommand {
                program: program.to_string(),
                args: args.iter().map(|s| s.to_string()).collect(),
                root,
            }),
            None => Ok(success_output(Vec::new())),
        }
    }
}

impl MountOps for FakeHal {
    fn mount_device(
        &self,
        device: &Path,
        target: &Path,
        fstype: Option<&str>,
        options: &MountOptions,
    ) -> HalResult<()> {
        log::info!(
            "FAKE HAL: mount {} -> {} (type: {:?})",
            device.display(),
            target.display(),
            fstype
        );

        let mut state = self.state();
        state.operations.push(Operation::Mount {
            device: device.to_path_buf(),
            target: target.to_path_buf(),
            fstype: fstype.map(String::from),
            read_only: options.read_only,
            bind: options.bind,
        });
        if state.fails(&FailPoint::Mount(target.to_path_buf())) {
            return Err(HalError::PermissionDenied);
        }
        if state.mounted.contains_key(target) {
            return Err(HalError::DiskBusy);
        }
        if !target.is_dir() {
            return Err(HalError::Nix(nix::errno::Errno::ENOENT));
        }
        // A device mounted elsewhere shares its superblock, so the RO state must match.
        let changes_ro_state = !options.bind
            && state.mounted.values().any(|m| {
                m.device.as_deref() == Some(device) && m.read_only != options.read_only
            });
        if changes_ro_state {
            return Err(HalError::DiskBusy);
        }

        let backing = if options.bind {
            None
        } else {
            state.backing_for(device)
        };
        if let Some(dir) = &backing {
            mirror_tree(dir, target)?;
        }
        state.mounted.insert(
            target.to_path_buf(),
            MountRecord {
                device: (!options.bind).then(|| device.to_path_buf()),
                backing,
                read_only: options.read_only,
            },
        );
        Ok(())
    }

    fn unmount(&self, target: &Path) -> HalResult<()> {
        log::info!("FAKE HAL: unmount {}", target.display());

        let mut state = self.state();
        state.operations.push(Operation::Unmount {
            target: target.to_path_buf(),
        });
        if state.fails(&FailPoint::Unmount(target.to_path_buf())) {
            return Err(HalError::DiskBusy);
        }
        let nested = state
            .mounted
            .keys()
            .any(|p| p != target && p.starts_with(target));
        if nested {
            return Err(HalError::DiskBusy);
        }
        let record = state
            .mounted
            .remove(target)
            .ok_or(HalError::Nix(nix::errno::Errno::EINVAL))?;

        if let Some(backing) = record.backing {
            if !record.read_only {
                clear_dir(&backing)?;
                mirror_tree(target, &backing)?;
            }
            clear_dir(target)?;
        }
        Ok(())
    }

    fn is_mounted(&self, path: &Path) -> HalResult<bool> {
        Ok(self.state().mounted.contains_key(path))
    }
}

impl FormatOps for FakeHal {
    fn format_ext4(&self, device: &Path, opts: &FormatOptions) -> HalResult<()> {
        log::info!("FAKE HAL: mkfs.ext4 {}", device.display());

        let mut state = self.state();
        state.operations.push(Operation::FormatExt4 {
            device: device.to_path_buf(),
            block_size: opts.block_size,
        });
        if device.starts_with("/dev") {
            return Ok(());
        }

        // A fresh filesystem on an image file: start from an empty backing directory.
        let backing = match state.image_backings.get(device) {
            Some(dir) => dir.clone(),
            None => {
                let mut name = device.as_os_str().to_os_string();
                name.push(".fakefs");
                PathBuf::from(name)
            }
        };
        fs::create_dir_all(&backing)?;
        clear_dir(&backing)?;
        state.image_backings.insert(device.to_path_buf(), backing);
        Ok(())
    }

    fn format_vfat(&self, device: &Path, label: &str) -> HalResult<()> {
        log::info!("FAKE HAL: mkfs.vfat {} ({})", device.display(), label);

        self.record_operation(Operation::FormatVfat {
            device: device.to_path_buf(),
            label: label.to_string(),
        });
        Ok(())
    }
}

impl LoopOps for FakeHal {
    fn losetup_attach(&self, image: &Path, scan_partitions: bool) -> HalResult<String> {
        let mut state = self.state();
        if state.fails(&FailPoint::Attach(image.to_path_buf())) {
            return Err(injected("losetup"));
        }
        if !image.is_file() {
            return Err(HalError::CommandFailed {
                program: "losetup".to_string(),
                code: Some(1),
                stderr: format!("{}: failed to set up loop device", image.display()),
            });
        }

        let loop_device = (0u32..)
            .map(|n| format!("/dev/loop{n}"))
            .find(|dev| !state.loops.contains_key(dev))
            .unwrap_or_else(|| "/dev/loop0".to_string());
        state.loops.insert(
            loop_device.clone(),
            LoopRecord {
                image: image.to_path_buf(),
                scan_partitions,
            },
        );
        state.operations.push(Operation::LosetupAttach {
            image: image.to_path_buf(),
            scan_partitions,
            loop_device: loop_device.clone(),
        });
        log::info!("FAKE HAL: losetup {} -> {}", image.display(), loop_device);
        Ok(loop_device)
    }

    fn losetup_detach(&self, loop_device: &str) -> HalResult<()> {
        let mut state = self.state();
        state.operations.push(Operation::LosetupDetach {
            loop_device: loop_device.to_string(),
        });
        if state.fails(&FailPoint::Detach(loop_device.to_string())) {
            return Err(injected("losetup"));
        }
        if state.loops.remove(loop_device).is_none() {
            return Err(HalError::CommandFailed {
                program: "losetup".to_string(),
                code: Some(1),
                stderr: format!("{loop_device}: detach failed: No such device or address"),
            });
        }
        Ok(())
    }

    fn loop_partitions(&self, loop_device: &str) -> HalResult<Vec<PathBuf>> {
        let state = self.state();
        let record = state
            .loops
            .get(loop_device)
            .ok_or_else(|| HalError::Other(format!("{loop_device} is not attached")))?;
        if !record.scan_partitions {
            return Ok(Vec::new());
        }
        Ok(state
            .partition_backings
            .get(&record.image)
            .map(|parts| {
                parts
                    .keys()
                    .map(|n| PathBuf::from(format!("{loop_device}p{n}")))
                    .collect()
            })
            .unwrap_or_default())
    }
}

impl RootOps for FakeHal {
    fn enter_root(&self, new_root: &Path) -> HalResult<SavedRoot> {
        let mut state = self.state();
        state.operations.push(Operation::EnterRoot {
            root: new_root.to_path_buf(),
        });
        if state.fails(&FailPoint::EnterRoot) {
            return Err(HalError::PermissionDenied);
        }
        if !new_root.is_dir() {
            return Err(HalError::Nix(nix::errno::Errno::ENOENT));
        }
        let previous = state.current_root();
        state.roots.push(new_root.to_path_buf());
        Ok(SavedRoot {
            root_dir: None,
            cwd: None,
            previous,
            entered: new_root.to_path_buf(),
        })
    }

    fn restore_root(&self, saved: SavedRoot) -> HalResult<()> {
        let mut state = self.state();
        state.operations.push(Operation::RestoreRoot {
            root: saved.previous.clone(),
        });
        match state.roots.last() {
            Some(top) if *top == saved.entered => {
                state.roots.pop();
                Ok(())
            }
            _ => Err(HalError::Other(format!(
                "restore of {} does not match the current root",
                saved.entered.display()
            ))),
        }
    }
}
