//! On-disk layout of an offline bundle.
//!
//! ```text
//! bundle/
//!   charts/<chart>/...          pulled and untarred charts
//!   images/<image-ref>/image.tgz
//!   spec.yaml                   { wandb: <channel values> }
//! ```

use super::error::BundleError;
use anyhow::{Context, Result};
use serde::Serialize;
use serde_yaml::Mapping;
use std::path::{Component, Path, PathBuf};

pub const DEFAULT_BUNDLE_DIR: &str = "bundle";
pub const IMAGE_ARCHIVE_NAME: &str = "image.tgz";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleLayout {
    root: PathBuf,
}

#[derive(Serialize)]
struct SpecFile<'a> {
    wandb: &'a Mapping,
}

impl Default for BundleLayout {
    fn default() -> Self {
        Self::new(DEFAULT_BUNDLE_DIR)
    }
}

impl BundleLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn charts_dir(&self) -> PathBuf {
        self.root.join("charts")
    }

    pub fn images_dir(&self) -> PathBuf {
        self.root.join("images")
    }

    pub fn spec_path(&self) -> PathBuf {
        self.root.join("spec.yaml")
    }

    /// Removes any bundle left by a previous run. A missing root is not an error.
    pub fn reset(&self) -> Result<()> {
        match std::fs::remove_dir_all(&self.root) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err)
                .with_context(|| format!("failed to remove {}", self.root.display())),
        }
    }

    pub fn prepare(&self) -> Result<()> {
        for dir in [self.charts_dir(), self.images_dir()] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }

    /// Directory that holds the archive of `image`. Image references contain `/` and `:`
    /// and map to nested directories; each reference gets a directory no other reference
    /// can reach.
    pub fn image_dir(&self, image: &str) -> Result<PathBuf> {
        let relative = Path::new(image);
        let valid = !image.trim().is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)))
            && !image.split('/').any(str::is_empty);
        if !valid {
            return Err(BundleError::InvalidImageRef(image.to_owned()).into());
        }
        Ok(self.images_dir().join(relative))
    }

    pub fn image_archive(&self, image: &str) -> Result<PathBuf> {
        Ok(self.image_dir(image)?.join(IMAGE_ARCHIVE_NAME))
    }

    /// Writes `{ wandb: values }` to `spec.yaml`.
    pub fn write_spec(&self, values: &Mapping) -> Result<PathBuf> {
        let path = self.spec_path();
        let yaml = serde_yaml::to_string(&SpecFile { wandb: values })
            .context("failed to serialize bundle spec")?;
        std::fs::write(&path, yaml)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(path)
    }
}
