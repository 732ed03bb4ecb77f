//! Resolution of `[FILE: name]` references against a blob store

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::FileResolverConfig;
use crate::error::{LitmusError, Result};

/// File lookup failure. Never fatal: the reference stays literal.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FileError {
    #[error("file '{0}' not found")]
    NotFound(String),

    #[error("file name '{0}' is not allowed")]
    InvalidName(String),

    #[error("failed to read '{name}': {message}")]
    Read { name: String, message: String },

    #[error("lookup of '{name}' timed out after {timeout:?}")]
    Timeout { name: String, timeout: Duration },
}

/// Maps a file name to its text content
#[async_trait]
pub trait FileResolver: Send + Sync {
    async fn resolve(&self, name: &str) -> std::result::Result<String, FileError>;
}

/// Resolver used when no blob store is configured
pub struct NoFileResolver;

#[async_trait]
impl FileResolver for NoFileResolver {
    async fn resolve(&self, name: &str) -> std::result::Result<String, FileError> {
        Err(FileError::NotFound(name.to_string()))
    }
}

/// Reads files below a root directory
pub struct DirectoryFileResolver {
    root: PathBuf,
}

impl DirectoryFileResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Relative path inside the root; rejects absolute paths and `..`
    fn path_for(&self, name: &str) -> std::result::Result<PathBuf, FileError> {
        let relative = Path::new(name);
        let safe = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if name.is_empty() || !safe {
            return Err(FileError::InvalidName(name.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl FileResolver for DirectoryFileResolver {
    async fn resolve(&self, name: &str) -> std::result::Result<String, FileError> {
        let path = self.path_for(name)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(FileError::NotFound(name.to_string()))
            }
            Err(e) => Err(FileError::Read {
                name: name.to_string(),
                message: e.to_string(),
            }),
        }
    }
}

/// Fetches `GET {base_url}/{name}`
pub struct HttpFileResolver {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpFileResolver {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build().map_err(|e| {
            LitmusError::Configuration(format!("Failed to create blob store client: {}", e))
        })?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
        })
    }

    fn url_for(&self, name: &str) -> String {
        format!("{}/{}", self.base_url, urlencoding::encode(name))
    }
}

#[async_trait]
impl FileResolver for HttpFileResolver {
    async fn resolve(&self, name: &str) -> std::result::Result<String, FileError> {
        let read_error = |message: String| FileError::Read {
            name: name.to_string(),
            message,
        };

        let response = self
            .client
            .get(self.url_for(name))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    FileError::Timeout {
                        name: name.to_string(),
                        timeout: self.timeout,
                    }
                } else {
                    read_error(e.to_string())
                }
            })?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(FileError::NotFound(name.to_string()));
        }
        if !response.status().is_success() {
            return Err(read_error(format!("HTTP {}", response.status())));
        }

        response.text().await.map_err(|e| read_error(e.to_string()))
    }
}

/// Bounds every lookup of the wrapped resolver
pub struct TimedFileResolver {
    inner: Arc<dyn FileResolver>,
    timeout: Duration,
}

impl TimedFileResolver {
    pub fn new(inner: Arc<dyn FileResolver>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

#[async_trait]
impl FileResolver for TimedFileResolver {
    async fn resolve(&self, name: &str) -> std::result::Result<String, FileError> {
        tokio::time::timeout(self.timeout, self.inner.resolve(name))
            .await
            .unwrap_or_else(|_| {
                Err(FileError::Timeout {
                    name: name.to_string(),
                    timeout: self.timeout,
                })
            })
    }
}

/// Fixed set of files, for tests and embedded fixtures
#[derive(Default)]
pub struct InMemoryFileResolver {
    files: HashMap<String, String>,
}

impl InMemoryFileResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, name: impl Into<String>, content: impl Into<String>) -> Self {
        self.files.insert(name.into(), content.into());
        self
    }
}

#[async_trait]
impl FileResolver for InMemoryFileResolver {
    async fn resolve(&self, name: &str) -> std::result::Result<String, FileError> {
        self.files
            .get(name)
            .cloned()
            .ok_or_else(|| FileError::NotFound(name.to_string()))
    }
}

/// Build the resolver selected by `[files]`
///
/// # Errors
///
/// Fails when the blob store client cannot be built.
pub fn resolver_from_config(config: &FileResolverConfig, timeout: Duration) -> Result<Arc<dyn FileResolver>> {
    let resolver: Arc<dyn FileResolver> = match config {
        FileResolverConfig::Disabled => Arc::new(NoFileResolver),
        FileResolverConfig::Directory { root } => Arc::new(DirectoryFileResolver::new(root)),
        FileResolverConfig::Http { base_url } => Arc::new(HttpFileResolver::new(base_url.clone(), timeout)?),
    };
    Ok(resolver)
}
