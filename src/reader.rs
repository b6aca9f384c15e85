use async_trait::async_trait;
use std::io;
use std::path::PathBuf;
use tracing::debug;

/// Source of an item's content (file, URL, record store, ...).
#[async_trait]
pub trait ContentReader: Send + Sync {
    fn name(&self) -> &'static str;

    async fn read(&self, source: &str) -> io::Result<Vec<u8>>;
}

/// Reads item sources as file paths, optionally relative to a root.
#[derive(Debug, Clone, Default)]
pub struct FsReader {
    root: Option<PathBuf>,
}

impl FsReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        FsReader {
            root: Some(root.into()),
        }
    }
}

#[async_trait]
impl ContentReader for FsReader {
    fn name(&self) -> &'static str {
        "FsReader"
    }

    async fn read(&self, source: &str) -> io::Result<Vec<u8>> {
        let path = match &self.root {
            Some(root) => root.join(source),
            None => PathBuf::from(source),
        };
        debug!(path = %path.display(), "reading item content");
        tokio::fs::read(&path).await
    }
}
