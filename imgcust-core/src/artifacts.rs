//! Artifacts collected during one ISO build.

use imgcust_error::{ImageError, ImageResult};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Filled in stage by stage; consumed once by [`IsoArtifacts::into_inputs`].
#[derive(Debug, Clone, Default)]
pub struct IsoArtifacts {
    pub bootx64_efi: Option<PathBuf>,
    pub grubx64_efi: Option<PathBuf>,
    pub vmlinuz: Option<PathBuf>,
    pub grub_cfg: Option<PathBuf>,
    pub initrd: Option<PathBuf>,
    pub squashfs: Option<PathBuf>,
}

/// Complete ISO inputs.
#[derive(Debug, Clone)]
pub struct IsoInputs {
    pub bootx64_efi: PathBuf,
    pub grubx64_efi: PathBuf,
    pub vmlinuz: PathBuf,
    pub grub_cfg: PathBuf,
    pub initrd: PathBuf,
    /// Host file -> absolute path inside the ISO.
    pub additional_files: BTreeMap<PathBuf, String>,
}

fn require(value: Option<PathBuf>, name: &str) -> ImageResult<PathBuf> {
    let path =
        value.ok_or_else(|| ImageError::MissingArtifact(format!("{name} was not produced")))?;
    if !path.is_file() {
        return Err(ImageError::MissingArtifact(format!(
            "{name} not found at {}",
            path.display()
        )));
    }
    Ok(path)
}

impl IsoArtifacts {
    /// Check that every artifact exists and place the squashfs root at `root_image_iso_path`.
    pub fn into_inputs(self, root_image_iso_path: &str) -> ImageResult<IsoInputs> {
        let squashfs = require(self.squashfs, "squashfs root image")?;
        let mut additional_files = BTreeMap::new();
        additional_files.insert(squashfs, root_image_iso_path.to_string());

        Ok(IsoInputs {
            bootx64_efi: require(self.bootx64_efi, "bootx64.efi")?,
            grubx64_efi: require(self.grubx64_efi, "grubx64.efi")?,
            vmlinuz: require(self.vmlinuz, "kernel image")?,
            grub_cfg: require(self.grub_cfg, "grub.cfg")?,
            initrd: require(self.initrd, "initramfs")?,
            additional_files,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn missing_artifact_is_named() {
        let dir = tempfile::tempdir().unwrap();
        let squash = dir.path().join("rootfs.img");
        fs::write(&squash, b"hsqs").unwrap();
        let artifacts = IsoArtifacts {
            squashfs: Some(squash),
            ..IsoArtifacts::default()
        };
        let err = artifacts.into_inputs("/LiveOS/rootfs.img").unwrap_err();
        assert!(matches!(err, ImageError::MissingArtifact(ref m) if m.contains("bootx64.efi")));
    }

    #[test]
    fn recorded_but_absent_file_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = IsoArtifacts {
            squashfs: Some(dir.path().join("gone.img")),
            ..IsoArtifacts::default()
        };
        let err = artifacts.into_inputs("/LiveOS/rootfs.img").unwrap_err();
        assert!(err.to_string().contains("gone.img"));
    }

    #[test]
    fn complete_set_maps_root_image() {
        let dir = tempfile::tempdir().unwrap();
        let mut artifacts = IsoArtifacts::default();
        let file = |name: &str| {
            let p = dir.path().join(name);
            fs::write(&p, name).unwrap();
            Some(p)
        };
        artifacts.bootx64_efi = file("bootx64.efi");
        artifacts.grubx64_efi = file("grubx64.efi");
        artifacts.vmlinuz = file("vmlinuz");
        artifacts.grub_cfg = file("grub.cfg");
        artifacts.initrd = file("initrd.img");
        artifacts.squashfs = file("rootfs.img");

        let inputs = artifacts.into_inputs("/LiveOS/rootfs.img").unwrap();
        assert_eq!(
            inputs.additional_files.get(&dir.path().join("rootfs.img")).map(String::as_str),
            Some("/LiveOS/rootfs.img")
        );
    }
}
