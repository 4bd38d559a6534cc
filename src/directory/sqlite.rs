// ABOUTME: DirectoryConnection adapter over the sqlite-directory store
// ABOUTME: Used by the CLI and daemon for local polling and by end-to-end tests

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sqlite_directory::{DirectoryStore, Scope, SearchCursor, SearchEntry};

use super::{Connect, DirectoryConnection, Entry, EntryCursor, SearchScope, StoreError};

pub struct SqliteDirectory {
    store: DirectoryStore,
}

impl SqliteDirectory {
    pub fn open(path: &Path) -> Result<Self> {
        let store = DirectoryStore::open(path)
            .with_context(|| format!("Failed to open directory store {}", path.display()))?;
        Ok(Self { store })
    }

    pub fn from_store(store: DirectoryStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &DirectoryStore {
        &self.store
    }
}

impl DirectoryConnection for SqliteDirectory {
    fn search(
        &self,
        base: &str,
        filter: &str,
        scope: SearchScope,
        attributes: &[String],
    ) -> Result<Box<dyn EntryCursor + '_>, StoreError> {
        let cursor = self
            .store
            .search(base, to_store_scope(scope), filter, attributes)
            .map_err(|err| StoreError::Search(err.to_string()))?;
        Ok(Box::new(SqliteCursor { inner: cursor }))
    }
}

struct SqliteCursor<'a> {
    inner: SearchCursor<'a>,
}

impl EntryCursor for SqliteCursor<'_> {
    fn next_entry(&mut self) -> Result<Option<Entry>, StoreError> {
        self.inner
            .next_entry()
            .map(|entry| entry.map(to_entry))
            .map_err(|err| StoreError::Cursor(err.to_string()))
    }

    fn close(&mut self) -> Result<(), StoreError> {
        self.inner.close();
        Ok(())
    }
}

fn to_entry(entry: SearchEntry) -> Entry {
    Entry {
        dn: entry.dn,
        attributes: entry.attributes,
    }
}

fn to_store_scope(scope: SearchScope) -> Scope {
    match scope {
        SearchScope::Base => Scope::Base,
        SearchScope::OneLevel => Scope::OneLevel,
        SearchScope::Subtree => Scope::Subtree,
    }
}

/// Opens a fresh [`SqliteDirectory`] per sync cycle.
#[derive(Debug, Clone)]
pub struct SqliteConnector {
    path: PathBuf,
}

impl SqliteConnector {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Connect for SqliteConnector {
    type Connection = SqliteDirectory;

    fn connect(&self) -> Result<Self::Connection, StoreError> {
        SqliteDirectory::open(&self.path).map_err(StoreError::Backend)
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn adapter_streams_entries_and_closes() {
        let store = DirectoryStore::open_in_memory().unwrap();
        let mut attrs = BTreeMap::new();
        attrs.insert("cn".to_string(), vec!["Alice".to_string()]);
        store.add("uid=alice,dc=example", attrs, None).unwrap();

        let directory = SqliteDirectory::from_store(store);
        let mut cursor = directory
            .search("dc=example", "(cn=alice)", SearchScope::Subtree, &[])
            .unwrap();
        let entry = cursor.next_entry().unwrap().unwrap();
        assert_eq!(entry.dn, "uid=alice,dc=example");
        assert_eq!(entry.first_value("cn"), Some("Alice"));
        assert!(cursor.next_entry().unwrap().is_none());
        cursor.close().unwrap();
        assert!(matches!(cursor.next_entry(), Err(StoreError::Cursor(_))));
    }

    #[test]
    fn bad_filter_surfaces_as_search_error() {
        let directory = SqliteDirectory::from_store(DirectoryStore::open_in_memory().unwrap());
        assert!(matches!(
            directory.search("dc=example", "(|(cn=a)", SearchScope::Subtree, &[]),
            Err(StoreError::Search(_))
        ));
    }
}
