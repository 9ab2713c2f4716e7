//! Metadata repository interface.
//!
//! The orchestrator only talks to these traits; `db::Database` is the sled
//! implementation used in production.

use super::error::VaultError;
use super::types::{FileRecord, FileRecordDraft, Tag, TagId};
use std::collections::{BTreeMap, BTreeSet};

pub trait TagRegistry: Send + Sync {
    /// Finds or creates one tag per distinct, non-empty (trimmed) name.
    /// Concurrent calls for the same new name converge on a single tag.
    fn resolve(&self, names: &[String]) -> Result<Vec<TagId>, VaultError>;

    /// All tags, sorted by name.
    fn list_tags(&self) -> Result<Vec<Tag>, VaultError>;
}

pub trait MetadataStore: TagRegistry {
    /// Inserts the record and its tag links as one unit. On error nothing is
    /// visible to later reads.
    ///
    /// Besides `Persistence`, fails with `Conflict` when the stored name is
    /// taken and `NotFound` when a tag id is not (or no longer) registered.
    fn create(
        &self,
        draft: FileRecordDraft,
        tag_ids: &BTreeSet<TagId>,
    ) -> Result<FileRecord, VaultError>;

    /// Every record, newest first.
    fn list_all(&self) -> Result<Vec<FileRecord>, VaultError>;

    fn find_by_stored_name(&self, stored_name: &str) -> Result<Option<FileRecord>, VaultError>;

    /// Records whose original name or any tag name contains `query`,
    /// case-insensitively. A blank query matches nothing.
    fn search(&self, query: &str) -> Result<Vec<FileRecord>, VaultError>;

    /// Storage path -> stored name for every record, plus stored names whose
    /// row is missing. An undecodable row fails with `Corruption`.
    fn storage_paths(&self) -> Result<BTreeMap<String, String>, VaultError>;

    fn flush(&self) -> Result<(), VaultError>;
}
