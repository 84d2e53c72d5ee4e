use std::io;
use thiserror::Error;

pub type HalResult<T> = Result<T, HalError>;
pub type ImageResult<T> = Result<T, ImageError>;

/// Failures of a single host operation (syscall or external command).
#[derive(Error, Debug)]
pub enum HalError {
    #[error("Device or mount point is busy")]
    DiskBusy,

    #[error("Permission denied")]
    PermissionDenied,

    #[error("Command not found: {0}")]
    CommandNotFound(String),

    #[error("Command failed: {program} (exit={code:?}): {stderr}")]
    CommandFailed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("nix errno: {0}")]
    Nix(#[from] nix::errno::Errno),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("{0}")]
    Other(String),
}

/// Failures of the image pipeline resources and stages.
#[derive(Error, Debug)]
pub enum ImageError {
    /// Loop attach, mount or process-root change failed.
    #[error("failed to acquire {resource}: {source}")]
    ResourceAcquisition {
        resource: String,
        #[source]
        source: HalError,
    },

    /// An external command exited non-zero (or could not be started).
    #[error("{stage}: external tool failed: {source}")]
    ExternalTool {
        stage: String,
        #[source]
        source: HalError,
    },

    #[error("unable to estimate capacity from {input:?}: {reason}")]
    CapacityEstimation { input: String, reason: String },

    #[error("missing artifact: {0}")]
    MissingArtifact(String),

    /// A strict release (unmount or detach) failed.
    #[error("failed to release {resource}: {source}")]
    Release {
        resource: String,
        #[source]
        source: HalError,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ImageError {
    pub fn acquisition(resource: impl Into<String>, source: impl Into<HalError>) -> Self {
        Self::ResourceAcquisition {
            resource: resource.into(),
            source: source.into(),
        }
    }

    pub fn tool(stage: impl Into<String>, source: HalError) -> Self {
        Self::ExternalTool {
            stage: stage.into(),
            source,
        }
    }

    pub fn release(resource: impl Into<String>, source: HalError) -> Self {
        Self::Release {
            resource: resource.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_failure_names_program_and_stderr() {
        let err = ImageError::tool(
            "squashfs",
            HalError::CommandFailed {
                program: "mksquashfs".to_string(),
                code: Some(1),
                stderr: "No space left on device".to_string(),
            },
        );
        let chain = format!("{}: {}", err, std::error::Error::source(&err).unwrap());
        assert!(chain.contains("squashfs"));
        assert!(chain.contains("mksquashfs"));
        assert!(chain.contains("No space left on device"));
    }

    #[test]
    fn acquisition_wraps_io_errors() {
        let err = ImageError::acquisition(
            "loop device for /tmp/missing.img",
            io::Error::new(io::ErrorKind::NotFound, "no such file"),
        );
        assert!(matches!(
            err,
            ImageError::ResourceAcquisition {
                source: HalError::Io(_),
                ..
            }
        ));
    }
}
