//! Helpers related to block devices in sysfs.

use crate::{HalError, HalResult};
use std::fs;
use std::path::{Path, PathBuf};

pub fn device_basename(path: &Path) -> HalResult<String> {
    let name = path
        .file_name()
        .ok_or_else(|| HalError::Parse(format!("invalid device path {}", path.display())))?
        .to_string_lossy()
        .to_string();
    Ok(name)
}

/// Lists the partition nodes of `device` (e.g. `/dev/loop3`) by reading
/// `<sys_class_block>/<name>/<name>pN` entries. Results are ordered by partition number.
pub fn partitions_in(sys_class_block: &Path, device: &Path) -> HalResult<Vec<PathBuf>> {
    let name = device_basename(device)?;
    let dev_dir = device.parent().unwrap_or_else(|| Path::new("/dev"));
    let prefix = format!("{name}p");

    let mut found: Vec<(u32, PathBuf)> = Vec::new();
    let entries = match fs::read_dir(sys_class_block.join(&name)) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    for entry in entries.flatten() {
        let entry_name = entry.file_name().to_string_lossy().to_string();
        let Some(number) = entry_name
            .strip_prefix(&prefix)
            .and_then(|n| n.parse::<u32>().ok())
        else {
            continue;
        };
        found.push((number, dev_dir.join(&entry_name)));
    }
    found.sort_by_key(|(number, _)| *number);
    Ok(found.into_iter().map(|(_, path)| path).collect())
}

pub fn partitions(device: &Path) -> HalResult<Vec<PathBuf>> {
    partitions_in(Path::new("/sys/class/block"), device)
}
