use std::path::{Component, Path, PathBuf};

use futures::future::BoxFuture;
use tracing::debug;

use loglens_core::error::{LoglensError, Result};
use loglens_core::traits::ObjectStore;

/// Object store over a local directory.
///
/// Keys are relative slash-separated paths. URLs are `{public_base_url}/{key}`
/// when a base URL is configured, `file://` paths otherwise.
pub struct FsObjectStore {
    root: PathBuf,
    public_base_url: Option<String>,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            public_base_url: None,
        }
    }

    pub fn with_public_base_url(mut self, url: impl Into<String>) -> Self {
        self.public_base_url = Some(url.into().trim_end_matches('/').to_string());
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a key to a path under the root. Rejects absolute keys and `..`.
    pub fn path_for(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let valid = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(LoglensError::ObjectStore(format!("invalid key '{}'", key)));
        }
        Ok(self.root.join(relative))
    }

    pub fn url_for(&self, key: &str, path: &Path) -> String {
        match self.public_base_url {
            Some(ref base) => format!("{}/{}", base, key),
            None => format!("file://{}", path.display()),
        }
    }
}

impl ObjectStore for FsObjectStore {
    fn store(&self, key: &str, bytes: Vec<u8>) -> BoxFuture<'_, Result<String>> {
        let key = key.to_string();
        Box::pin(async move {
            let path = self.path_for(&key)?;
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            // Write then rename so readers never see a partial object.
            let tmp = path.with_extension("partial");
            tokio::fs::write(&tmp, &bytes).await?;
            tokio::fs::rename(&tmp, &path).await?;
            debug!(%key, size = bytes.len(), "Object stored");
            Ok(self.url_for(&key, &path))
        })
    }

    fn retrieve(&self, key: &str) -> BoxFuture<'_, Result<Vec<u8>>> {
        let key = key.to_string();
        Box::pin(async move {
            let path = self.path_for(&key)?;
            match tokio::fs::read(&path).await {
                Ok(bytes) => Ok(bytes),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    Err(LoglensError::NotFound(key))
                }
                Err(e) => Err(e.into()),
            }
        })
    }
}
