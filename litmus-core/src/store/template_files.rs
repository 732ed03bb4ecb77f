//! Templates read from a directory of YAML/JSON files

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;

use super::{StoreError, TemplateRepository};
use crate::model::Template;

const EXTENSIONS: [&str; 3] = ["yaml", "yml", "json"];

/// Looks up `<dir>/<id>.{yaml,yml,json}`; a missing `id` field defaults to the file stem
pub struct FileTemplateRepository {
    dir: PathBuf,
}

impl FileTemplateRepository {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn candidates(&self, id: &str) -> Vec<PathBuf> {
        EXTENSIONS
            .iter()
            .map(|ext| self.dir.join(format!("{}.{}", id, ext)))
            .collect()
    }
}

fn valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !id.starts_with('.')
}

fn parse(id: &str, path: &Path, text: &str) -> Result<Template, StoreError> {
    let invalid = |reason: String| StoreError::InvalidDocument {
        id: id.to_string(),
        reason,
    };

    let mut doc: Value = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(text).map_err(|e| invalid(e.to_string()))?,
        _ => serde_yaml::from_str(text).map_err(|e| invalid(e.to_string()))?,
    };

    if let Some(object) = doc.as_object_mut() {
        object
            .entry("id")
            .or_insert_with(|| Value::String(id.to_string()));
    }

    serde_json::from_value(doc).map_err(|e| invalid(e.to_string()))
}

#[async_trait]
impl TemplateRepository for FileTemplateRepository {
    async fn get_template(&self, id: &str) -> Result<Option<Template>, StoreError> {
        if !valid_id(id) {
            return Ok(None);
        }

        for path in self.candidates(id) {
            match tokio::fs::read_to_string(&path).await {
                Ok(text) => {
                    tracing::debug!(path = %path.display(), "Loaded template file");
                    return parse(id, &path, &text).map(Some);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(StoreError::Backend(format!(
                        "Failed to read {}: {}",
                        path.display(),
                        e
                    )));
                }
            }
        }
        Ok(None)
    }
}
