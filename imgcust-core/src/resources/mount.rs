use imgcust_error::{ImageError, ImageResult};
use imgcust_hal::{HalError, MountOps, MountOptions};
use std::fs;
use std::path::{Path, PathBuf};

/// A mounted filesystem, unmounted on release.
pub struct Mount<'a, H: MountOps + ?Sized> {
    hal: &'a H,
    source: PathBuf,
    target: PathBuf,
    fs_type: Option<String>,
    mounted: bool,
}

impl<'a, H: MountOps + ?Sized> Mount<'a, H> {
    /// Mount `source` at `target`, creating `target` when missing.
    ///
    /// A `target` that is already a mount point is refused.
    pub fn new(
        hal: &'a H,
        source: &Path,
        target: &Path,
        fs_type: Option<&str>,
        options: MountOptions,
    ) -> ImageResult<Self> {
        let resource = format!("mount {} -> {}", source.display(), target.display());

        fs::create_dir_all(target).map_err(|e| ImageError::acquisition(&resource, e))?;
        match hal.is_mounted(target) {
            Ok(false) => {}
            Ok(true) => return Err(ImageError::acquisition(&resource, HalError::DiskBusy)),
            Err(e) => return Err(ImageError::acquisition(&resource, e)),
        }

        hal.mount_device(source, target, fs_type, &options)
            .map_err(|e| ImageError::acquisition(&resource, e))?;
        log::debug!(
            "mounted {} at {} ({})",
            source.display(),
            target.display(),
            fs_type.unwrap_or("bind")
        );

        Ok(Self {
            hal,
            source: source.to_path_buf(),
            target: target.to_path_buf(),
            fs_type: fs_type.map(str::to_string),
            mounted: true,
        })
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn fs_type(&self) -> Option<&str> {
        self.fs_type.as_deref()
    }

    /// Strict release.
    pub fn clean_close(&mut self) -> ImageResult<()> {
        if !self.mounted {
            return Ok(());
        }
        self.hal
            .unmount(&self.target)
            .map_err(|e| ImageError::release(format!("mount {}", self.target.display()), e))?;
        self.mounted = false;
        log::debug!("unmounted {}", self.target.display());
        Ok(())
    }

    /// Best-effort release. The mount stays marked as mounted when unmounting fails.
    pub fn close(&mut self) {
        if let Err(e) = self.clean_close() {
            log::warn!("{}", e);
        }
    }
}

impl<H: MountOps + ?Sized> Drop for Mount<'_, H> {
    fn drop(&mut self) {
        if self.mounted {
            log::warn!(
                "Mount dropped while mounted; unmounting {}",
                self.target.display()
            );
            self.close();
        }
    }
}
