//! Offline bundle assembly: chart resolution, image discovery, the on-disk layout,
//! and the image download callback run by the package runner.

pub mod assembler;
pub mod channel;
pub mod charts;
pub mod command;
pub mod configmap;
pub mod downloader;
pub mod error;
pub mod images;
pub mod layout;
