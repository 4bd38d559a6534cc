use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use thiserror::Error;
use tracing::debug;

use crate::entry::{format_timestamp, normalize_dn, SearchEntry, StoredEntry};
use crate::filter::{Filter, FilterError};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS entries (
    entry_id          INTEGER PRIMARY KEY AUTOINCREMENT,
    dn                TEXT NOT NULL,
    normalized_dn     TEXT NOT NULL UNIQUE,
    entry_uuid        TEXT NOT NULL,
    attributes        TEXT NOT NULL,
    creators_name     TEXT,
    create_timestamp  TEXT NOT NULL,
    modifiers_name    TEXT,
    modify_timestamp  TEXT
);
"#;

const ENTRY_COLUMNS: &str = "entry_id, dn, entry_uuid, attributes, creators_name, \
                             create_timestamp, modifiers_name, modify_timestamp";

const DEFAULT_PAGE_SIZE: usize = 256;

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("entry {0} already exists")]
    AlreadyExists(String),
    #[error("no such entry {0}")]
    NoSuchEntry(String),
    #[error("invalid search filter: {0}")]
    Filter(#[from] FilterError),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("corrupt attributes for {dn}: {source}")]
    Corrupt {
        dn: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("search cursor already closed")]
    CursorClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Base,
    OneLevel,
    Subtree,
}

impl Scope {
    /// Both DNs must already be normalized.
    fn contains(&self, base: &str, dn: &str) -> bool {
        match self {
            Scope::Base => dn == base,
            Scope::OneLevel => {
                if base.is_empty() {
                    return !dn.is_empty() && !dn.contains(',');
                }
                dn.strip_suffix(base)
                    .and_then(|head| head.strip_suffix(','))
                    .map(|rdn| !rdn.is_empty() && !rdn.contains(','))
                    .unwrap_or(false)
            }
            Scope::Subtree => {
                base.is_empty()
                    || dn == base
                    || dn
                        .strip_suffix(base)
                        .map(|head| head.ends_with(','))
                        .unwrap_or(false)
            }
        }
    }
}

pub struct DirectoryStore {
    path: Option<PathBuf>,
    conn: Connection,
    page_size: usize,
}

impl DirectoryStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create directory store folder {}", parent.display())
                })?;
                #[cfg(unix)]
                set_owner_perms(parent)?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open directory store {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "wal")
            .context("failed to enable WAL for directory store")?;
        conn.pragma_update(None, "synchronous", "normal").ok();
        conn.execute_batch(SCHEMA)
            .context("failed to initialize directory schema")?;
        Ok(Self {
            path: Some(path.to_path_buf()),
            conn,
            page_size: DEFAULT_PAGE_SIZE,
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory store")?;
        conn.execute_batch(SCHEMA)
            .context("failed to initialize directory schema")?;
        Ok(Self {
            path: None,
            conn,
            page_size: DEFAULT_PAGE_SIZE,
        })
    }

    /// Rows fetched per round trip by [`SearchCursor`].
    pub fn set_page_size(&mut self, page_size: usize) {
        self.page_size = page_size.max(1);
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn add(
        &self,
        dn: &str,
        attributes: BTreeMap<String, Vec<String>>,
        actor: Option<&str>,
    ) -> Result<StoredEntry, DirectoryError> {
        self.add_at(dn, attributes, actor, Utc::now())
    }

    pub fn add_at(
        &self,
        dn: &str,
        attributes: BTreeMap<String, Vec<String>>,
        actor: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<StoredEntry, DirectoryError> {
        if self.get(dn)?.is_some() {
            return Err(DirectoryError::AlreadyExists(dn.to_string()));
        }
        let attributes_json = serde_json::to_string(&attributes).map_err(|source| {
            DirectoryError::Corrupt {
                dn: dn.to_string(),
                source,
            }
        })?;
        self.conn.execute(
            "INSERT INTO entries(dn, normalized_dn, entry_uuid, attributes, creators_name,
                                  create_timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                dn,
                normalize_dn(dn),
                uuid::Uuid::new_v4().to_string(),
                attributes_json,
                actor,
                format_timestamp(at),
            ],
        )?;
        self.get(dn)?
            .ok_or_else(|| DirectoryError::NoSuchEntry(dn.to_string()))
    }

    pub fn modify(
        &self,
        dn: &str,
        changes: BTreeMap<String, Vec<String>>,
        actor: Option<&str>,
    ) -> Result<StoredEntry, DirectoryError> {
        self.modify_at(dn, changes, actor, Utc::now())
    }

    /// Replaces the values of every attribute in `changes`; an empty value list
    /// removes the attribute.
    pub fn modify_at(
        &self,
        dn: &str,
        changes: BTreeMap<String, Vec<String>>,
        actor: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<StoredEntry, DirectoryError> {
        let mut entry = self
            .get(dn)?
            .ok_or_else(|| DirectoryError::NoSuchEntry(dn.to_string()))?;
        for (name, values) in changes {
            entry
                .attributes
                .retain(|key, _| !key.eq_ignore_ascii_case(&name));
            if !values.is_empty() {
                entry.attributes.insert(name, values);
            }
        }
        let attributes_json = serde_json::to_string(&entry.attributes).map_err(|source| {
            DirectoryError::Corrupt {
                dn: dn.to_string(),
                source,
            }
        })?;
        self.conn.execute(
            "UPDATE entries SET attributes = ?1, modifiers_name = ?2, modify_timestamp = ?3
             WHERE entry_id = ?4",
            params![attributes_json, actor, format_timestamp(at), entry.id],
        )?;
        self.get(dn)?
            .ok_or_else(|| DirectoryError::NoSuchEntry(dn.to_string()))
    }

    pub fn delete(&self, dn: &str) -> Result<(), DirectoryError> {
        let removed = self.conn.execute(
            "DELETE FROM entries WHERE normalized_dn = ?1",
            [normalize_dn(dn)],
        )?;
        if removed == 0 {
            return Err(DirectoryError::NoSuchEntry(dn.to_string()));
        }
        Ok(())
    }

    pub fn get(&self, dn: &str) -> Result<Option<StoredEntry>, DirectoryError> {
        let row = self
            .conn
            .prepare(&format!(
                "SELECT {ENTRY_COLUMNS} FROM entries WHERE normalized_dn = ?1"
            ))?
            .query_row([normalize_dn(dn)], RawEntry::from_row)
            .optional()?;
        row.map(RawEntry::into_entry).transpose()
    }

    pub fn count(&self) -> Result<u64, DirectoryError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM entries", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Starts a search. The filter is parsed up front; matching happens lazily
    /// as the cursor pages through the table in insertion order.
    pub fn search(
        &self,
        base: &str,
        scope: Scope,
        filter: &str,
        attributes: &[String],
    ) -> Result<SearchCursor<'_>, DirectoryError> {
        let filter = Filter::parse(filter)?;
        debug!(base, ?scope, filter = %filter, "directory search started");
        Ok(SearchCursor {
            store: self,
            base: normalize_dn(base),
            scope,
            filter,
            attributes: attributes.to_vec(),
            last_id: 0,
            buffer: VecDeque::new(),
            exhausted: false,
            closed: false,
        })
    }

    fn fetch_page(&self, after_id: i64) -> Result<Vec<StoredEntry>, DirectoryError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM entries
             WHERE entry_id > ?1
             ORDER BY entry_id ASC
             LIMIT ?2"
        ))?;
        let mut rows = stmt.query(params![after_id, self.page_size as i64])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(RawEntry::from_row(row)?.into_entry()?);
        }
        Ok(out)
    }
}

/// Lazily evaluated search results.
pub struct SearchCursor<'a> {
    store: &'a DirectoryStore,
    base: String,
    scope: Scope,
    filter: Filter,
    attributes: Vec<String>,
    last_id: i64,
    buffer: VecDeque<StoredEntry>,
    exhausted: bool,
    closed: bool,
}

impl<'a> SearchCursor<'a> {
    pub fn next_entry(&mut self) -> Result<Option<SearchEntry>, DirectoryError> {
        if self.closed {
            return Err(DirectoryError::CursorClosed);
        }
        loop {
            if let Some(entry) = self.buffer.pop_front() {
                let dn = normalize_dn(&entry.dn);
                if self.scope.contains(&self.base, &dn) && self.filter.matches(&entry) {
                    return Ok(Some(entry.select(&self.attributes)));
                }
                continue;
            }
            if self.exhausted {
                return Ok(None);
            }
            let page = self.store.fetch_page(self.last_id)?;
            if page.len() < self.store.page_size {
                self.exhausted = true;
            }
            if let Some(last) = page.last() {
                self.last_id = last.id;
            }
            self.buffer.extend(page);
        }
    }

    /// Idempotent.
    pub fn close(&mut self) {
        self.closed = true;
        self.buffer.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn filter(&self) -> &Filter {
        &self.filter
    }
}

struct RawEntry {
    id: i64,
    dn: String,
    entry_uuid: String,
    attributes: String,
    creators_name: Option<String>,
    create_timestamp: String,
    modifiers_name: Option<String>,
    modify_timestamp: Option<String>,
}

impl RawEntry {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            dn: row.get(1)?,
            entry_uuid: row.get(2)?,
            attributes: row.get(3)?,
            creators_name: row.get(4)?,
            create_timestamp: row.get(5)?,
            modifiers_name: row.get(6)?,
            modify_timestamp: row.get(7)?,
        })
    }

    fn into_entry(self) -> Result<StoredEntry, DirectoryError> {
        let attributes = serde_json::from_str(&self.attributes).map_err(|source| {
            DirectoryError::Corrupt {
                dn: self.dn.clone(),
                source,
            }
        })?;
        Ok(StoredEntry {
            id: self.id,
            dn: self.dn,
            entry_uuid: self.entry_uuid,
            attributes,
            creators_name: self.creators_name,
            create_timestamp: self.create_timestamp,
            modifiers_name: self.modifiers_name,
            modify_timestamp: self.modify_timestamp,
        })
    }
}

#[cfg(unix)]
fn set_owner_perms(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let metadata = fs::metadata(path)?;
    let mut perms = metadata.permissions();
    perms.set_mode(0o700);
    fs::set_permissions(path, perms)?;
    Ok(())
}
