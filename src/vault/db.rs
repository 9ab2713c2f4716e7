use crate::vault::{
    error::VaultError,
    store::MetadataStore,
    types::{FileRecord, FileRecordDraft, Iv, MimeType, Tag, TagId, VaultMetadata, blob_key},
};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, ConflictableTransactionResult, TransactionError};
use sled::{Config, Db, Transactional, Tree};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::str::from_utf8;
use time::OffsetDateTime;
use tracing::warn;
use uuid::Uuid;

const CURRENT_VAULT_VERSION: u32 = 1;

/// Persisted shape of a file record. Tags are stored by id and joined back
/// to their names on read.
#[derive(Serialize, Deserialize)]
struct FileRow {
    id: Uuid,
    original_name: String,
    stored_name: String,
    mime_type: MimeType,
    size: u64,
    storage_path: String,
    iv: Iv,
    created_at: u64,
    tag_ids: Vec<TagId>,
}

impl FileRow {
    fn from_draft(draft: FileRecordDraft, tag_ids: &BTreeSet<TagId>) -> Self {
        Self {
            id: draft.id,
            original_name: draft.original_name,
            stored_name: draft.stored_name,
            mime_type: draft.mime_type,
            size: draft.size,
            storage_path: draft.storage_path,
            iv: draft.iv,
            created_at: draft.created_at,
            tag_ids: tag_ids.iter().copied().collect(),
        }
    }

    fn into_record(self, tags: Vec<Tag>) -> FileRecord {
        FileRecord {
            id: self.id,
            original_name: self.original_name,
            stored_name: self.stored_name,
            mime_type: self.mime_type,
            size: self.size,
            storage_path: self.storage_path,
            iv: self.iv,
            created_at: self.created_at,
            tags,
        }
    }

    fn hydrate(self, tag_names: &HashMap<TagId, String>) -> FileRecord {
        let tags = self
            .tag_ids
            .iter()
            .filter_map(|id| {
                tag_names.get(id).map(|name| Tag {
                    id: *id,
                    name: name.clone(),
                })
            })
            .collect();
        self.into_record(tags)
    }
}

#[derive(Clone)]
pub struct Database {
    db: Db,
    // record id -> FileRow
    files: Tree,
    // stored name -> record id
    stored_names: Tree,
    // tag name -> tag id
    pub(super) tags: Tree,
    // tag id -> tag name
    pub(super) tag_names: Tree,
    // tag id ++ record id -> ()
    tag_files: Tree,
}

impl Database {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, VaultError> {
        Self::from_db(Config::new().path(path).open()?)
    }

    #[cfg(test)]
    pub fn temporary() -> Result<Self, VaultError> {
        Self::from_db(Config::new().temporary(true).open()?)
    }

    fn from_db(db: Db) -> Result<Self, VaultError> {
        Ok(Self {
            files: db.open_tree("files")?,
            stored_names: db.open_tree("stored_names")?,
            tags: db.open_tree("tags")?,
            tag_names: db.open_tree("tag_names")?,
            tag_files: db.open_tree("tag_files")?,
            db,
        })
    }

    /// Replaces the raw row behind `stored_name`.
    #[cfg(test)]
    pub(super) fn overwrite_row(&self, stored_name: &str, bytes: &[u8]) -> Result<(), VaultError> {
        let id = self
            .stored_names
            .get(stored_name.as_bytes())?
            .ok_or_else(|| VaultError::NotFound(stored_name.to_string()))?;
        self.files.insert(id, bytes)?;
        Ok(())
    }

    pub(super) fn generate_id(&self) -> Result<u64, VaultError> {
        Ok(self.db.generate_id()?)
    }

    // --- Vault Metadata ---

    /// Loads metadata (version, salt, key check) or creates it if new.
    pub fn load_or_init_metadata(&self) -> Result<VaultMetadata, VaultError> {
        match self.db.get("vault_version")? {
            Some(v) => {
                let ver = from_utf8(&v)?.parse::<u32>()?;
                if ver != CURRENT_VAULT_VERSION {
                    return Err(VaultError::InvalidVersion {
                        expected: CURRENT_VAULT_VERSION,
                        found: ver,
                    });
                }

                let created_at_bytes = self
                    .db
                    .get("created_at")?
                    .ok_or(VaultError::Corruption("No date".into()))?;
                let created_at = from_utf8(&created_at_bytes)?.parse::<i64>()?;

                let key_salt = self
                    .db
                    .get("key_salt")?
                    .and_then(|x| <[u8; 16]>::try_from(&x[..]).ok())
                    .ok_or(VaultError::Corruption("Missing or malformed key salt".into()))?;

                Ok(VaultMetadata {
                    vault_version: ver,
                    created_at,
                    key_salt,
                    key_check: self.db.get("key_check")?.map(|x| x.to_vec()),
                })
            }
            None => {
                let ts = OffsetDateTime::now_utc().unix_timestamp();
                let salt = rand::random::<[u8; 16]>();
                self.db.insert(
                    "vault_version",
                    CURRENT_VAULT_VERSION.to_string().as_bytes(),
                )?;
                self.db.insert("created_at", ts.to_string().as_bytes())?;
                self.db.insert("key_salt", &salt[..])?;
                self.flush_db()?;

                Ok(VaultMetadata {
                    vault_version: CURRENT_VAULT_VERSION,
                    created_at: ts,
                    key_salt: salt,
                    key_check: None,
                })
            }
        }
    }

    pub fn save_key_check(&self, check: &[u8]) -> Result<(), VaultError> {
        self.db.insert("key_check", check)?;
        self.flush_db()
    }

    fn flush_db(&self) -> Result<(), VaultError> {
        self.db.flush()?;
        Ok(())
    }

    // --- Row Helpers ---

    fn tag_name_map(&self) -> Result<HashMap<TagId, String>, VaultError> {
        let mut map = HashMap::new();
        for item in self.tag_names.iter() {
            let (id, name) = item?;
            let id = TagId::from_be_slice(&id)
                .ok_or_else(|| VaultError::Corruption("Malformed tag id".into()))?;
            map.insert(id, from_utf8(&name)?.to_string());
        }
        Ok(map)
    }

    /// Reads and decodes every row. Undecodable rows are skipped.
    fn rows(&self) -> Result<Vec<FileRow>, VaultError> {
        // 1. I/O Phase: sequential read from sled
        let raw_rows = self
            .files
            .iter()
            .collect::<Result<Vec<_>, sled::Error>>()?;

        // 2. CPU Phase: parallel decode
        let rows = raw_rows
            .par_iter()
            .filter_map(|(k, v)| match postcard::from_bytes::<FileRow>(v) {
                Ok(row) => Some(row),
                Err(e) => {
                    warn!(key = %hex::encode(k), error = %e, "skipping undecodable file row");
                    None
                }
            })
            .collect();

        Ok(rows)
    }

    fn newest_first(records: &mut [FileRecord]) {
        records.par_sort_unstable_by(|a, b| b.created_at.cmp(&a.created_at));
    }
}

impl MetadataStore for Database {
    fn create(
        &self,
        draft: FileRecordDraft,
        tag_ids: &BTreeSet<TagId>,
    ) -> Result<FileRecord, VaultError> {
        let row = FileRow::from_draft(draft, tag_ids);
        let row_bytes = postcard::to_stdvec(&row)?;
        let id_bytes = *row.id.as_bytes();

        let tags = (&self.files, &self.stored_names, &self.tag_names, &self.tag_files)
            .transaction(
                |(files, stored_names, tag_names, tag_files)| -> ConflictableTransactionResult<Vec<Tag>, VaultError> {
                    if stored_names.get(row.stored_name.as_bytes())?.is_some() {
                        return Err(ConflictableTransactionError::Abort(VaultError::Conflict(
                            row.stored_name.clone(),
                        )));
                    }

                    let mut tags = Vec::with_capacity(row.tag_ids.len());
                    for tag_id in &row.tag_ids {
                        let tag_key = tag_id.to_be_bytes();
                        let name = tag_names.get(tag_key)?.ok_or_else(|| {
                            ConflictableTransactionError::Abort(VaultError::NotFound(format!(
                                "tag {}",
                                tag_id.0
                            )))
                        })?;
                        let name = String::from_utf8(name.to_vec()).map_err(|_| {
                            ConflictableTransactionError::Abort(VaultError::Corruption(
                                "Tag name is not UTF-8".into(),
                            ))
                        })?;

                        let mut link = tag_key.to_vec();
                        link.extend_from_slice(&id_bytes);
                        tag_files.insert(link, Vec::<u8>::new())?;

                        tags.push(Tag { id: *tag_id, name });
                    }

                    files.insert(&id_bytes[..], row_bytes.as_slice())?;
                    stored_names.insert(row.stored_name.as_bytes(), &id_bytes[..])?;
                    Ok(tags)
                },
            )
            .map_err(|e| match e {
                TransactionError::Abort(e) => e,
                TransactionError::Storage(e) => VaultError::Persistence(e),
            })?;

        Ok(row.into_record(tags))
    }

    fn list_all(&self) -> Result<Vec<FileRecord>, VaultError> {
        let tag_names = self.tag_name_map()?;
        let mut records: Vec<FileRecord> = self
            .rows()?
            .into_iter()
            .map(|row| row.hydrate(&tag_names))
            .collect();

        Self::newest_first(&mut records);
        Ok(records)
    }

    fn find_by_stored_name(&self, stored_name: &str) -> Result<Option<FileRecord>, VaultError> {
        let Some(id) = self.stored_names.get(stored_name.as_bytes())? else {
            return Ok(None);
        };
        let raw = self.files.get(&id)?.ok_or_else(|| {
            VaultError::Corruption(format!("Stored name {stored_name} points at a missing row"))
        })?;
        let row: FileRow = postcard::from_bytes(&raw)?;

        let mut tags = Vec::with_capacity(row.tag_ids.len());
        for tag_id in &row.tag_ids {
            if let Some(name) = self.tag_names.get(tag_id.to_be_bytes())? {
                tags.push(Tag {
                    id: *tag_id,
                    name: from_utf8(&name)?.to_string(),
                });
            }
        }

        Ok(Some(row.into_record(tags)))
    }

    fn search(&self, query: &str) -> Result<Vec<FileRecord>, VaultError> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return Ok(Vec::new());
        }

        let tag_names = self.tag_name_map()?;

        // Files linked to any tag whose name contains the needle
        let mut tagged: HashSet<Uuid> = HashSet::new();
        for (tag_id, name) in &tag_names {
            if !name.to_lowercase().contains(&needle) {
                continue;
            }
            for item in self.tag_files.scan_prefix(tag_id.to_be_bytes()) {
                let (link, _) = item?;
                if let Some(id) = link.get(8..).and_then(|b| Uuid::from_slice(b).ok()) {
                    tagged.insert(id);
                }
            }
        }

        let mut records: Vec<FileRecord> = self
            .rows()?
            .into_par_iter()
            .filter(|row| {
                tagged.contains(&row.id) || row.original_name.to_lowercase().contains(&needle)
            })
            .map(|row| row.hydrate(&tag_names))
            .collect();

        Self::newest_first(&mut records);
        Ok(records)
    }

    fn storage_paths(&self) -> Result<BTreeMap<String, String>, VaultError> {
        let mut paths = BTreeMap::new();

        for item in self.files.iter() {
            let (id, raw) = item?;
            let row: FileRow = postcard::from_bytes(&raw).map_err(|e| {
                VaultError::Corruption(format!("Undecodable file row {}: {e}", hex::encode(&id)))
            })?;
            paths.insert(row.storage_path, row.stored_name);
        }

        // A stored name whose row vanished still owns its blob
        for item in self.stored_names.iter() {
            let (name, _) = item?;
            let name = from_utf8(&name)?;
            paths
                .entry(blob_key(name))
                .or_insert_with(|| name.to_string());
        }

        Ok(paths)
    }

    fn flush(&self) -> Result<(), VaultError> {
        self.flush_db()
    }
}
