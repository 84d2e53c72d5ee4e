use imgcust_error::{ImageError, ImageResult};
use imgcust_hal::{HalError, LoopOps};
use std::io;
use std::path::{Path, PathBuf};

/// A backing file bound to a kernel loop device.
pub struct LoopbackDevice<'a, H: LoopOps + ?Sized> {
    hal: &'a H,
    image: PathBuf,
    device: String,
    attached: bool,
}

impl<'a, H: LoopOps + ?Sized> LoopbackDevice<'a, H> {
    /// Bind `image` to a free loop device. With `scan_partitions` the kernel exposes the
    /// image's partitions as `<device>pN` nodes.
    pub fn attach(hal: &'a H, image: &Path, scan_partitions: bool) -> ImageResult<Self> {
        let resource = format!("loop device for {}", image.display());
        if !image.is_file() {
            return Err(ImageError::acquisition(
                resource,
                io::Error::new(io::ErrorKind::NotFound, "backing file does not exist"),
            ));
        }

        let device = hal
            .losetup_attach(image, scan_partitions)
            .map_err(|e| ImageError::acquisition(resource, e))?;
        log::info!("🔁 {} attached to {}", image.display(), device);

        Ok(Self {
            hal,
            image: image.to_path_buf(),
            device,
            attached: true,
        })
    }

    pub fn device_path(&self) -> &str {
        &self.device
    }

    /// Partition nodes of a partition-scanned attachment, ordered by partition number.
    pub fn partitions(&self) -> ImageResult<Vec<PathBuf>> {
        if !self.attached {
            return Err(ImageError::acquisition(
                format!("partitions of {}", self.image.display()),
                HalError::Other(format!("{} is detached", self.device)),
            ));
        }
        self.hal.loop_partitions(&self.device).map_err(|e| {
            ImageError::acquisition(format!("partitions of {}", self.device), e)
        })
    }

    /// Strict release. A second call after success does nothing.
    pub fn detach(&mut self) -> ImageResult<()> {
        if !self.attached {
            return Ok(());
        }
        self.hal
            .losetup_detach(&self.device)
            .map_err(|e| ImageError::release(format!("loop device {}", self.device), e))?;
        self.attached = false;
        log::debug!("loop device {} detached", self.device);
        Ok(())
    }

    /// Best-effort release.
    pub fn close(&mut self) {
        if let Err(e) = self.detach() {
            log::warn!("{}", e);
        }
    }
}

impl<H: LoopOps + ?Sized> Drop for LoopbackDevice<'_, H> {
    fn drop(&mut self) {
        if self.attached {
            log::warn!(
                "LoopbackDevice dropped while attached; detaching {}",
                self.device
            );
            self.close();
        }
    }
}
