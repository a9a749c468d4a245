//! Container image discovery in rendered Kubernetes manifests.

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_yaml::Value;
use std::collections::HashSet;

const CONTAINER_LIST_KEYS: [&str; 3] = ["containers", "initContainers", "ephemeralContainers"];

/// Returns every image referenced by a container of any workload in a multi-document YAML
/// stream, in document order. Duplicates are kept; see [`remove_duplicates`].
pub fn extract_images(manifests: &str) -> Result<Vec<String>> {
    let mut images = Vec::new();

    for (index, document) in serde_yaml::Deserializer::from_str(manifests).enumerate() {
        let value = Value::deserialize(document)
            .with_context(|| format!("failed to parse rendered manifest document {index}"))?;
        collect_images(&value, &mut images);
    }

    Ok(images)
}

fn collect_images(value: &Value, images: &mut Vec<String>) {
    match value {
        Value::Mapping(mapping) => {
            for (key, child) in mapping {
                let is_container_list = key
                    .as_str()
                    .is_some_and(|key| CONTAINER_LIST_KEYS.contains(&key));
                if let (true, Value::Sequence(containers)) = (is_container_list, child) {
                    images.extend(
                        containers
                            .iter()
                            .filter_map(|container| container.get("image"))
                            .filter_map(Value::as_str)
                            .filter(|image| !image.trim().is_empty())
                            .map(|image| image.trim().to_owned()),
                    );
                }
                collect_images(child, images);
            }
        }
        Value::Sequence(items) => {
            for item in items {
                collect_images(item, images);
            }
        }
        Value::Tagged(tagged) => collect_images(&tagged.value, images),
        _ => {}
    }
}

/// Drops repeated entries, keeping the first occurrence of each.
pub fn remove_duplicates(items: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::with_capacity(items.len());
    items
        .into_iter()
        .filter(|item| seen.insert(item.clone()))
        .collect()
}
