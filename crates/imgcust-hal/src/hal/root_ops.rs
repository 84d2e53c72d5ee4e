//! Process root operations (chroot).
//!
//! Changing the root directory is process-global. Callers must pair every successful
//! `enter_root` with `restore_root` and serialize against other root changes.

use crate::HalResult;
use std::fs::File;
use std::path::{Path, PathBuf};

/// Token describing the root that was active before `enter_root`.
///
/// Holds open descriptors to the previous root and working directory so the process can
/// escape the new root again.
#[derive(Debug)]
pub struct SavedRoot {
    pub(crate) root_dir: Option<File>,
    pub(crate) cwd: Option<File>,
    pub(crate) previous: PathBuf,
    pub(crate) entered: PathBuf,
}

impl SavedRoot {
    /// Root that will be restored.
    pub fn previous(&self) -> &Path {
        &self.previous
    }

    /// Root that was entered.
    pub fn entered(&self) -> &Path {
        &self.entered
    }
}

pub trait RootOps {
    /// Change the process root to `new_root` and the working directory to `/` inside it.
    fn enter_root(&self, new_root: &Path) -> HalResult<SavedRoot>;

    /// Return to the root and working directory captured in `saved`.
    fn restore_root(&self, saved: SavedRoot) -> HalResult<()>;
}
