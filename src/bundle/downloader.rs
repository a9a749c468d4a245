use super::command::run_tool;
use super::layout::{BundleLayout, IMAGE_ARCHIVE_NAME};
use crate::packages::fetch::{FetchPackage, PackageFuture};
use anyhow::Context;

pub const DEFAULT_PLATFORM: &str = "linux/amd64";
pub const DEFAULT_CRANE_PROGRAM: &str = "crane";

/// Saves one image per call as `images/<image-ref>/image.tgz` using `crane pull`.
///
/// Every image writes into its own directory, so concurrent calls never touch the same
/// files.
#[derive(Debug, Clone)]
pub struct ImageDownloader {
    layout: BundleLayout,
    platform: String,
    program: String,
}

impl ImageDownloader {
    pub fn new(layout: BundleLayout, platform: impl Into<String>) -> Self {
        Self {
            layout,
            platform: platform.into(),
            program: DEFAULT_CRANE_PROGRAM.to_owned(),
        }
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn platform(&self) -> &str {
        &self.platform
    }
}

impl FetchPackage for ImageDownloader {
    fn fetch<'a>(&'a self, item: &'a str) -> PackageFuture<'a> {
        Box::pin(async move {
            let dir = self.layout.image_dir(item)?;
            tokio::fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("failed to create {}", dir.display()))?;

            let archive = dir.join(IMAGE_ARCHIVE_NAME);
            let archive = archive.display().to_string();
            run_tool(
                &self.program,
                ["pull", "--platform", self.platform.as_str(), item, archive.as_str()],
                None,
            )
            .await?;
            Ok(())
        })
    }
}
