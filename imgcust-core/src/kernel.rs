//! Kernel version selection from `/usr/lib/modules`.

use imgcust_error::{ImageError, ImageResult};
use std::cmp::Ordering;
use std::fs;
use std::path::Path;

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Part {
    Num(u64),
    Text(String),
}

fn version_key(version: &str) -> Vec<Part> {
    let mut parts = Vec::new();
    let mut chars = version.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_ascii_digit() {
            let mut digits = String::new();
            while let Some(&d) = chars.peek().filter(|d| d.is_ascii_digit()) {
                digits.push(d);
                chars.next();
            }
            parts.push(Part::Num(digits.parse().unwrap_or(u64::MAX)));
        } else if c.is_ascii_alphabetic() {
            let mut text = String::new();
            while let Some(&a) = chars.peek().filter(|a| a.is_ascii_alphabetic()) {
                text.push(a);
                chars.next();
            }
            parts.push(Part::Text(text));
        } else {
            chars.next();
        }
    }
    parts
}

/// Compare two kernel release strings segment by segment (`6.6.10` > `6.6.9`).
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    version_key(a).cmp(&version_key(b)).then_with(|| a.cmp(b))
}

/// Pick the newest kernel among the directories of `modules_dir`.
pub fn select_kernel_version(modules_dir: &Path) -> ImageResult<String> {
    let entries = fs::read_dir(modules_dir).map_err(|e| {
        ImageError::MissingArtifact(format!(
            "found 0 kernels: cannot read {}: {}",
            modules_dir.display(),
            e
        ))
    })?;

    let mut versions: Vec<String> = Vec::new();
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            versions.push(entry.file_name().to_string_lossy().to_string());
        }
    }
    versions.sort_by(|a, b| compare_versions(a, b));
    log::debug!("kernels under {}: {:?}", modules_dir.display(), versions);

    let selected = versions.last().cloned().ok_or_else(|| {
        ImageError::MissingArtifact(format!("found 0 kernels in {}", modules_dir.display()))
    })?;
    if versions.len() > 1 {
        log::warn!(
            "found {} kernels, using the newest: {}",
            versions.len(),
            selected
        );
    }
    Ok(selected)
}
