//! Build configuration, loaded from TOML.
//!
//! ```toml
//! [dirs]
//! build_dir = "/var/tmp/imgcust/build"
//! tmp_dir = "/var/tmp/imgcust/tmp"
//! output_dir = "/var/tmp/imgcust/out"
//!
//! [iso]
//! base_name = "live"
//! volume_label = "CDROM"
//!
//! [[partitions]]
//! partition = 2
//! target = "/"
//! fs_type = "ext4"
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Working directories of one build.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IsoWorkingDirs {
    /// Scratch mount points and the ISO staging tree.
    pub build_dir: PathBuf,
    /// Intermediate images (the writable rootfs).
    pub tmp_dir: PathBuf,
    /// Extracted artifacts and the final ISO.
    pub output_dir: PathBuf,
}

impl Default for IsoWorkingDirs {
    fn default() -> Self {
        let base = PathBuf::from("/var/tmp/imgcust");
        Self {
            build_dir: base.join("build"),
            tmp_dir: base.join("tmp"),
            output_dir: base.join("out"),
        }
    }
}

impl IsoWorkingDirs {
    /// Working directories rooted at a single base directory.
    pub fn under(base: &Path) -> Self {
        Self {
            build_dir: base.join("build"),
            tmp_dir: base.join("tmp"),
            output_dir: base.join("out"),
        }
    }

    pub fn create_all(&self) -> Result<()> {
        for dir in [&self.build_dir, &self.tmp_dir, &self.output_dir] {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create working dir: {}", dir.display()))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IsoOptions {
    pub base_name: String,
    pub image_tag: String,
    pub volume_label: String,
    pub release_prefix: String,
    /// Fixed release version; the build timestamp is used when unset.
    pub release_version: Option<String>,
    pub unattended_install: bool,
    pub bios_boot: bool,
}

impl Default for IsoOptions {
    fn default() -> Self {
        Self {
            base_name: "live".to_string(),
            image_tag: String::new(),
            volume_label: "CDROM".to_string(),
            release_prefix: "2.0.".to_string(),
            release_version: None,
            unattended_install: false,
            bios_boot: false,
        }
    }
}

/// One partition of the disk image and where it is mounted inside the image root.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct PartitionSpec {
    /// 1-based partition number.
    pub partition: u32,
    /// Absolute path inside the image, `/` for the root filesystem.
    pub target: String,
    pub fs_type: String,
    #[serde(default)]
    pub options: Option<String>,
}

impl PartitionSpec {
    pub fn new(partition: u32, target: &str, fs_type: &str) -> Self {
        Self {
            partition,
            target: target.to_string(),
            fs_type: fs_type.to_string(),
            options: None,
        }
    }

    pub fn is_root(&self) -> bool {
        self.target.trim_end_matches('/').is_empty()
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IsoBuildConfig {
    pub dirs: IsoWorkingDirs,
    pub iso: IsoOptions,
    pub partitions: Vec<PartitionSpec>,
}

impl Default for IsoBuildConfig {
    fn default() -> Self {
        Self {
            dirs: IsoWorkingDirs::default(),
            iso: IsoOptions::default(),
            partitions: vec![
                PartitionSpec::new(1, "/boot/efi", "vfat"),
                PartitionSpec::new(2, "/", "ext4"),
            ],
        }
    }
}

impl IsoBuildConfig {
    pub fn parse(toml_text: &str) -> Result<Self> {
        let cfg: Self = toml::from_str(toml_text).context("failed to parse build config TOML")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Unable to read {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        let roots = self.partitions.iter().filter(|p| p.is_root()).count();
        if roots != 1 {
            bail!("partition layout needs exactly one root (\"/\") entry, found {roots}");
        }
        for spec in &self.partitions {
            if !spec.target.starts_with('/') {
                bail!("partition {} target must be absolute: {}", spec.partition, spec.target);
            }
            if spec.partition == 0 {
                bail!("partition numbers start at 1");
            }
        }
        if self.iso.volume_label.is_empty() {
            bail!("iso.volume_label must not be empty");
        }
        Ok(())
    }

    pub fn root_partition(&self) -> Option<&PartitionSpec> {
        self.partitions.iter().find(|p| p.is_root())
    }

    /// Partition holding the EFI boot loaders: `/boot/efi`, else `/boot`.
    pub fn boot_partition(&self) -> Option<&PartitionSpec> {
        ["/boot/efi", "/boot"].iter().find_map(|target| {
            self.partitions
                .iter()
                .find(|p| p.target.trim_end_matches('/') == *target)
        })
    }
}
