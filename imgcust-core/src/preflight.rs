use anyhow::{bail, Result};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

pub const REQUIRED_BINARIES: &[&str] = &[
    "losetup",
    "udevadm",
    "du",
    "dd",
    "mkfs.ext4",
    "cp",
    "mksquashfs",
    "mkfs.vfat",
    "mmd",
    "mcopy",
    "xorriso",
];

#[derive(Debug, Clone)]
pub struct PreflightConfig {
    pub required_binaries: Vec<String>,
    pub path_env: String,
    pub require_root: bool,
}

impl Default for PreflightConfig {
    fn default() -> Self {
        let path_env = std::env::var("PATH").unwrap_or_default();
        Self {
            required_binaries: REQUIRED_BINARIES.iter().map(|b| b.to_string()).collect(),
            path_env,
            require_root: true,
        }
    }
}

pub fn run() -> Result<()> {
    run_with(&PreflightConfig::default())
}

pub fn run_with(cfg: &PreflightConfig) -> Result<()> {
    log::info!("🧪 Preflight checks");

    if cfg.require_root && !nix::unistd::geteuid().is_root() {
        bail!("imgcust must run as root (loop devices, mounts and chroot)");
    }
    check_binaries(cfg)?;

    log::info!("✅ Preflight complete");
    Ok(())
}

fn check_binaries(cfg: &PreflightConfig) -> Result<()> {
    let mut missing = Vec::new();
    for bin in &cfg.required_binaries {
        match find_executable_in_path(bin, &cfg.path_env) {
            Some(path) => log::debug!("found {} at {}", bin, path.display()),
            None => missing.push(bin.clone()),
        }
    }
    if !missing.is_empty() {
        bail!("Missing required binaries on PATH: {}", missing.join(", "));
    }
    Ok(())
}

fn find_executable_in_path(binary: &str, path_env: &str) -> Option<PathBuf> {
    for dir in path_env.split(':').filter(|dir| !dir.is_empty()) {
        let candidate = Path::new(dir).join(binary);
        if let Ok(metadata) = fs::metadata(&candidate) {
            if metadata.is_file() && metadata.permissions().mode() & 0o111 != 0 {
                return Some(candidate);
            }
        }
    }
    None
}
