use super::Mount;
use anyhow::{Context, Result};
use imgcust_error::ImageError;
use imgcust_hal::{MountOps, MountOptions, RootOps};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Serializes process-root changes within this process.
static ROOT_LOCK: Mutex<()> = Mutex::new(());

/// Host filesystems made visible inside the root while work runs: (source, target, type).
const SPECIAL_MOUNTS: &[(&str, &str, Option<&str>)] = &[
    ("proc", "proc", Some("proc")),
    ("sysfs", "sys", Some("sysfs")),
    ("/dev", "dev", None),
];

/// Runs work with the process root switched to a mounted tree.
pub struct ChrootContext<'a, H: MountOps + RootOps + ?Sized> {
    hal: &'a H,
    root: PathBuf,
}

impl<'a, H: MountOps + RootOps + ?Sized> ChrootContext<'a, H> {
    pub fn new(hal: &'a H, root: PathBuf) -> Self {
        Self { hal, root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Run `work` inside the root and always switch back before returning.
    ///
    /// The process root is global: anything else running in this process during `work`
    /// sees the new root too. Callers must not run other filesystem work concurrently.
    pub fn unsafe_run<T>(&self, work: impl FnOnce() -> Result<T>) -> Result<T> {
        let _guard = ROOT_LOCK.lock().unwrap_or_else(|e| e.into_inner());

        let mut specials: Vec<Mount<'a, H>> = Vec::new();
        for (source, rel, fs_type) in SPECIAL_MOUNTS {
            let options = if fs_type.is_none() {
                MountOptions::bind()
            } else {
                MountOptions::new()
            };
            let target = self.root.join(rel);
            match Mount::new(self.hal, Path::new(source), &target, *fs_type, options) {
                Ok(mount) => specials.push(mount),
                Err(e) => {
                    release(&mut specials);
                    return Err(e).context("failed to prepare chroot");
                }
            }
        }

        log::debug!("entering root {}", self.root.display());
        let saved = match self.hal.enter_root(&self.root) {
            Ok(saved) => saved,
            Err(e) => {
                release(&mut specials);
                return Err(ImageError::acquisition(
                    format!("process root {}", self.root.display()),
                    e,
                )
                .into());
            }
        };

        let result = work();

        let restored = self.hal.restore_root(saved);
        release(&mut specials);
        log::debug!("left root {}", self.root.display());

        match (result, restored) {
            (result, Ok(())) => result,
            (Ok(_), Err(e)) => Err(ImageError::release("process root", e).into()),
            (Err(work_err), Err(e)) => {
                log::error!("failed to restore process root: {}", e);
                Err(work_err)
            }
        }
    }
}

fn release<H: MountOps + ?Sized>(mounts: &mut Vec<Mount<'_, H>>) {
    while let Some(mut mount) = mounts.pop() {
        mount.close();
    }
}
