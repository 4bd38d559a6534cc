// ABOUTME: Store connection seam for change polling - entries, search cursors, scope
// ABOUTME: Backends implement DirectoryConnection; the scanner only sees these traits

#[cfg(feature = "sqlite-store")]
pub mod sqlite;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MODIFY_TIMESTAMP: &str = "modifyTimestamp";
pub const CREATE_TIMESTAMP: &str = "createTimestamp";
pub const MODIFIERS_NAME: &str = "modifiersName";
pub const CREATORS_NAME: &str = "creatorsName";
pub const OBJECT_CLASS: &str = "objectClass";

/// Failures raised by a directory backend. All of them are transport-level
/// from the scanner's point of view.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("search failed: {0}")]
    Search(String),
    #[error("cursor read failed: {0}")]
    Cursor(String),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// A native directory record: DN plus multi-valued attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub dn: String,
    pub attributes: BTreeMap<String, Vec<String>>,
}

impl Entry {
    pub fn new(dn: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute<I, V>(mut self, name: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        self.attributes.insert(
            name.to_string(),
            values.into_iter().map(Into::into).collect(),
        );
        self
    }

    /// Values of `name`, matched case-insensitively. Empty when absent.
    pub fn values(&self, name: &str) -> &[String] {
        self.attributes
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, values)| values.as_slice())
            .unwrap_or(&[])
    }

    pub fn first_value(&self, name: &str) -> Option<&str> {
        self.values(name).first().map(String::as_str)
    }

    pub fn has_value(&self, name: &str, value: &str) -> bool {
        self.values(name)
            .iter()
            .any(|candidate| candidate.eq_ignore_ascii_case(value))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    Base,
    OneLevel,
    Subtree,
}

impl fmt::Display for SearchScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchScope::Base => write!(f, "base"),
            SearchScope::OneLevel => write!(f, "one"),
            SearchScope::Subtree => write!(f, "sub"),
        }
    }
}

/// Read side of a directory connection.
pub trait DirectoryConnection {
    fn search(
        &self,
        base: &str,
        filter: &str,
        scope: SearchScope,
        attributes: &[String],
    ) -> Result<Box<dyn EntryCursor + '_>, StoreError>;
}

pub trait EntryCursor {
    fn next_entry(&mut self) -> Result<Option<Entry>, StoreError>;

    fn close(&mut self) -> Result<(), StoreError>;
}

impl<C: DirectoryConnection + ?Sized> DirectoryConnection for &C {
    fn search(
        &self,
        base: &str,
        filter: &str,
        scope: SearchScope,
        attributes: &[String],
    ) -> Result<Box<dyn EntryCursor + '_>, StoreError> {
        (**self).search(base, filter, scope, attributes)
    }
}

impl<C: DirectoryConnection + ?Sized> DirectoryConnection for Box<C> {
    fn search(
        &self,
        base: &str,
        filter: &str,
        scope: SearchScope,
        attributes: &[String],
    ) -> Result<Box<dyn EntryCursor + '_>, StoreError> {
        (**self).search(base, filter, scope, attributes)
    }
}

impl<C: DirectoryConnection + ?Sized> DirectoryConnection for Arc<C> {
    fn search(
        &self,
        base: &str,
        filter: &str,
        scope: SearchScope,
        attributes: &[String],
    ) -> Result<Box<dyn EntryCursor + '_>, StoreError> {
        (**self).search(base, filter, scope, attributes)
    }
}

/// Opens connections for long-running pollers, one per sync cycle.
pub trait Connect: Send + Sync + 'static {
    type Connection: DirectoryConnection;

    fn connect(&self) -> Result<Self::Connection, StoreError>;

    /// Location of the store, used in logs and persisted state.
    fn location(&self) -> String;
}

/// Owns a cursor for the duration of a scan and closes it exactly once:
/// explicitly through [`CursorGuard::close`], or on drop when the scan bails.
pub struct CursorGuard<'a> {
    cursor: Box<dyn EntryCursor + 'a>,
    closed: bool,
}

impl<'a> CursorGuard<'a> {
    pub fn new(cursor: Box<dyn EntryCursor + 'a>) -> Self {
        Self {
            cursor,
            closed: false,
        }
    }

    pub fn next_entry(&mut self) -> Result<Option<Entry>, StoreError> {
        self.cursor.next_entry()
    }

    pub fn close(mut self) -> Result<(), StoreError> {
        self.closed = true;
        self.cursor.close()
    }
}

impl Drop for CursorGuard<'_> {
    fn drop(&mut self) {
        if !self.closed {
            self.closed = true;
            // Already unwinding from a scan error; that error is the one reported.
            let _ = self.cursor.close();
        }
    }
}
