//! Tokens remembered between runs, one table per user in a TOML file.

use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt as _;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedTokens {
    pub id_token: String,
    pub refresh_token: String,
}

#[derive(Debug, Clone)]
pub struct TokenCache {
    path: PathBuf,
}

impl TokenCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `mysa-cloud/credentials.toml` under the user's config directory.
    pub fn default_location() -> Result<Self> {
        let dir = dirs::config_dir().context("could not determine the config directory")?;
        Ok(Self::new(dir.join("mysa-cloud").join("credentials.toml")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Tokens for `username`, or for the first user in the file when none is
    /// given. A missing file is an empty cache.
    pub async fn load(&self, username: Option<&str>) -> Result<Option<(String, CachedTokens)>> {
        let mut users = self.read().await?;
        let found = match username {
            Some(name) => users.shift_remove(name).map(|tokens| (name.to_owned(), tokens)),
            None => users.shift_remove_index(0),
        };
        if let Some((name, _)) = &found {
            debug!(user = %name, path = %self.path.display(), "found cached tokens");
        }
        Ok(found)
    }

    /// Saves the tokens of `username`, keeping every other user's. The file
    /// is readable by its owner only.
    pub async fn store(&self, username: &str, tokens: &CachedTokens) -> Result<()> {
        let mut users = match self.read().await {
            Ok(users) => users,
            Err(e) => {
                warn!("discarding unreadable credentials file: {e:#}");
                IndexMap::new()
            }
        };
        users.insert(username.to_owned(), tokens.clone());

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let text = toml::to_string(&users).context("failed to serialize credentials")?;
        tokio::fs::write(&self.path, text)
            .await
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        tokio::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))
            .await
            .with_context(|| format!("failed to restrict {}", self.path.display()))?;
        Ok(())
    }

    async fn read(&self) -> Result<IndexMap<String, CachedTokens>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => toml::from_str(&text)
                .with_context(|| format!("failed to parse {}", self.path.display())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(IndexMap::new()),
            Err(e) => Err(e).with_context(|| format!("failed to read {}", self.path.display())),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// A cache file in the temp directory, removed on drop.
    pub struct ScratchCache(pub TokenCache);

    impl ScratchCache {
        pub fn new() -> Self {
            let path = std::env::temp_dir()
                .join(format!("mysa-cloud-{}", uuid::Uuid::new_v4()))
                .join("credentials.toml");
            Self(TokenCache::new(path))
        }
    }

    impl Drop for ScratchCache {
        fn drop(&mut self) {
            if let Some(dir) = self.0.path().parent() {
                let _ = std::fs::remove_dir_all(dir);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt as _;

    use super::testing::ScratchCache;
    use super::*;

    fn tokens(id: &str) -> CachedTokens {
        CachedTokens {
            id_token: format!("id-{id}"),
            refresh_token: format!("refresh-{id}"),
        }
    }

    #[tokio::test]
    async fn missing_file_is_empty() {
        let cache = ScratchCache::new();

        assert!(cache.0.load(None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn keeps_one_table_per_user() {
        let cache = ScratchCache::new();
        cache.0.store("alice", &tokens("a")).await.unwrap();
        cache.0.store("bob", &tokens("b")).await.unwrap();
        cache.0.store("alice", &tokens("a2")).await.unwrap();

        assert_eq!(
            cache.0.load(None).await.unwrap(),
            Some(("alice".to_owned(), tokens("a2")))
        );
        assert_eq!(
            cache.0.load(Some("bob")).await.unwrap(),
            Some(("bob".to_owned(), tokens("b")))
        );
        assert!(cache.0.load(Some("carol")).await.unwrap().is_none());

        let mode = std::fs::metadata(cache.0.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn unparseable_file_is_replaced_on_store() {
        let cache = ScratchCache::new();
        std::fs::create_dir_all(cache.0.path().parent().unwrap()).unwrap();
        std::fs::write(cache.0.path(), "[mysa:alice\nid_token =").unwrap();

        assert!(cache.0.load(None).await.is_err());

        cache.0.store("alice", &tokens("a")).await.unwrap();
        assert_eq!(
            cache.0.load(Some("alice")).await.unwrap(),
            Some(("alice".to_owned(), tokens("a")))
        );
    }
}
