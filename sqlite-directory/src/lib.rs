pub mod entry;
pub mod filter;
pub mod store;

pub use entry::{normalize_dn, SearchEntry, StoredEntry};
pub use filter::{Filter, FilterError};
pub use store::{DirectoryError, DirectoryStore, Scope, SearchCursor};
