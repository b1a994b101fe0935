//! Conflict map - naming conflicts against looser backend namespaces
//!
//! Some backends fold case or auto-rename on collision. When `end_upload`
//! discovers the backend committed under a different name than requested,
//! the driver records the pair here; every later operation that names the
//! file resolves through the map first. Entries persist until a successful
//! delete or an explicit user rename, and each recording logs a
//! user-actionable warning.

use onitu_core::{DriverName, Result};
use onitu_store::{keys, Store};
use tracing::{debug, warn};

/// Persistent bijection between Onitu-side and backend-assigned names for
/// one driver.
#[derive(Clone)]
pub struct ConflictMap {
    store: Store,
    driver: DriverName,
}

impl ConflictMap {
    pub(crate) fn new(store: Store, driver: DriverName) -> Self {
        Self { store, driver }
    }

    /// The backend name mapped to an Onitu name, if a conflict is recorded.
    pub async fn backend_name(&self, onitu_name: &str) -> Result<Option<String>> {
        Ok(self
            .store
            .get(&keys::conflict(&self.driver, onitu_name))
            .await?)
    }

    /// Reverse lookup: the Onitu name whose conflict entry points at a
    /// backend name. Used during poll intake, where the backend reports its
    /// own spelling.
    pub async fn onitu_name(&self, backend_name: &str) -> Result<Option<String>> {
        let prefix = keys::conflict_prefix(&self.driver);
        for (key, value) in self.store.range(&prefix).await? {
            if value.as_str() == Some(backend_name) {
                let onitu = key[prefix.len()..].to_string();
                warn!(
                    onitu_name = %onitu,
                    backend_name,
                    "Name conflict on backend, mapping modifications of '{onitu}' to '{backend_name}', please rename it!"
                );
                return Ok(Some(onitu));
            }
        }
        Ok(None)
    }

    /// Resolves the name to use against the backend: the conflict mapping
    /// when one exists, the Onitu name otherwise.
    pub async fn resolve(&self, onitu_name: &str) -> Result<String> {
        match self.backend_name(onitu_name).await? {
            Some(mapped) => {
                warn!(
                    onitu_name,
                    backend_name = %mapped,
                    "Name conflict on backend, mapping modifications of '{onitu_name}' to '{mapped}', please rename it!"
                );
                Ok(mapped)
            }
            None => Ok(onitu_name.to_string()),
        }
    }

    /// Records a conflict discovered on commit.
    pub async fn record(&self, onitu_name: &str, backend_name: &str) -> Result<()> {
        self.store
            .put(&keys::conflict(&self.driver, onitu_name), &backend_name)
            .await?;
        warn!(
            onitu_name,
            backend_name,
            "Name conflict on backend! Onitu file '{onitu_name}' is now mapped to backend file '{backend_name}', please rename it!"
        );
        Ok(())
    }

    /// Drops a conflict entry after a successful delete or rename.
    pub async fn remove(&self, onitu_name: &str) -> Result<()> {
        self.store
            .delete(&keys::conflict(&self.driver, onitu_name))
            .await?;
        debug!(onitu_name, "Conflict entry removed");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Folder-qualified forms
    //
    // Adapters name files per folder; entries are stored under
    // "{folder}/{filename}" so the same filename in two folders cannot
    // collide.
    // ------------------------------------------------------------------

    fn qualify(folder: &str, filename: &str) -> String {
        format!("{folder}/{filename}")
    }

    /// Folder-qualified [`resolve`](ConflictMap::resolve): the backend
    /// filename to use for `(folder, filename)`.
    pub async fn resolve_in_folder(&self, folder: &str, filename: &str) -> Result<String> {
        let resolved = self.resolve(&Self::qualify(folder, filename)).await?;
        Ok(resolved
            .strip_prefix(&format!("{folder}/"))
            .map(ToString::to_string)
            .unwrap_or(resolved))
    }

    /// Folder-qualified [`record`](ConflictMap::record).
    pub async fn record_in_folder(
        &self,
        folder: &str,
        onitu_filename: &str,
        backend_filename: &str,
    ) -> Result<()> {
        self.record(
            &Self::qualify(folder, onitu_filename),
            &Self::qualify(folder, backend_filename),
        )
        .await
    }

    /// Folder-qualified reverse lookup: the Onitu filename mapped to a
    /// backend filename in one folder.
    pub async fn onitu_name_in_folder(
        &self,
        folder: &str,
        backend_filename: &str,
    ) -> Result<Option<String>> {
        let Some(qualified) = self
            .onitu_name(&Self::qualify(folder, backend_filename))
            .await?
        else {
            return Ok(None);
        };
        Ok(Some(
            qualified
                .strip_prefix(&format!("{folder}/"))
                .map(ToString::to_string)
                .unwrap_or(qualified),
        ))
    }

    /// Folder-qualified [`remove`](ConflictMap::remove).
    pub async fn remove_in_folder(&self, folder: &str, onitu_filename: &str) -> Result<()> {
        self.remove(&Self::qualify(folder, onitu_filename)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn map() -> ConflictMap {
        let store = Store::open_in_memory().await.unwrap();
        ConflictMap::new(store, DriverName::new("dbx").unwrap())
    }

    #[tokio::test]
    async fn test_resolve_without_conflict_is_identity() {
        let map = map().await;
        assert_eq!(map.resolve("docs/Foo.txt").await.unwrap(), "docs/Foo.txt");
    }

    #[tokio::test]
    async fn test_record_and_resolve() {
        let map = map().await;
        map.record("docs/foo.txt", "docs/foo (1).txt").await.unwrap();
        assert_eq!(
            map.resolve("docs/foo.txt").await.unwrap(),
            "docs/foo (1).txt"
        );
    }

    #[tokio::test]
    async fn test_reverse_lookup() {
        let map = map().await;
        map.record("docs/foo.txt", "docs/Foo.txt").await.unwrap();
        assert_eq!(
            map.onitu_name("docs/Foo.txt").await.unwrap().as_deref(),
            Some("docs/foo.txt")
        );
        assert!(map.onitu_name("docs/other.txt").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remove_restores_identity() {
        let map = map().await;
        map.record("a.txt", "A.txt").await.unwrap();
        map.remove("a.txt").await.unwrap();
        assert_eq!(map.resolve("a.txt").await.unwrap(), "a.txt");
    }

    #[tokio::test]
    async fn test_folder_qualified_round_trip() {
        let map = map().await;
        map.record_in_folder("docs", "foo.txt", "foo (1).txt")
            .await
            .unwrap();

        assert_eq!(
            map.resolve_in_folder("docs", "foo.txt").await.unwrap(),
            "foo (1).txt"
        );
        assert_eq!(
            map.onitu_name_in_folder("docs", "foo (1).txt")
                .await
                .unwrap()
                .as_deref(),
            Some("foo.txt")
        );
        // the same filename in another folder is untouched
        assert_eq!(
            map.resolve_in_folder("music", "foo.txt").await.unwrap(),
            "foo.txt"
        );

        map.remove_in_folder("docs", "foo.txt").await.unwrap();
        assert_eq!(
            map.resolve_in_folder("docs", "foo.txt").await.unwrap(),
            "foo.txt"
        );
    }
}
