use std::fmt;
use std::process::ExitStatus;

/// Failures of the bundle pipeline that callers inspect with `downcast_ref`.
#[derive(Debug)]
pub enum BundleError {
    /// Rendering both charts produced no container image reference.
    NoImages,
    /// The package run finished but some images could not be fetched.
    FailedImages { failed: usize, total: usize },
    /// The package run was interrupted before every image was fetched.
    Cancelled { completed: usize, total: usize },
    /// An image reference cannot be mapped to a directory inside the bundle.
    InvalidImageRef(String),
    /// An external tool (helm, crane, kubectl) exited unsuccessfully.
    CommandFailed {
        program: String,
        status: ExitStatus,
        stderr: String,
    },
}

impl fmt::Display for BundleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BundleError::NoImages => write!(f, "no images to download"),
            BundleError::FailedImages { failed, total } => {
                write!(f, "{failed} of {total} images failed to download")
            }
            BundleError::Cancelled { completed, total } => {
                write!(f, "download cancelled after {completed} of {total} images")
            }
            BundleError::InvalidImageRef(image) => {
                write!(f, "image reference {image:?} cannot be stored in the bundle")
            }
            BundleError::CommandFailed {
                program,
                status,
                stderr,
            } => {
                let stderr = stderr.trim();
                if stderr.is_empty() {
                    write!(f, "{program} failed ({status})")
                } else {
                    write!(f, "{program} failed ({status}): {stderr}")
                }
            }
        }
    }
}

impl std::error::Error for BundleError {}
