mod blob;
mod cipher;
mod db;
mod error;
mod store;
mod tags;
mod types;

pub use error::VaultError;
pub use types::sanitize_name;

use crate::config::{KeySource, StorageConfig};
use crate::vault::blob::{BlobStore, FilesystemBlobStore, PendingBlob};
use crate::vault::cipher::KeyMaterial;
use crate::vault::db::Database;
use crate::vault::store::MetadataStore;
use crate::vault::types::{FileRecord, FileRecordDraft, MimeType, Tag, blob_key, stored_name};
use secrecy::ExposeSecret;
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{info, instrument, warn};
use uuid::Uuid;

const DATABASE_DIR: &str = "db";
const DATA_DIR: &str = "storage";

/// Differences between the blob store and the metadata store.
#[derive(Serialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Blobs with no record pointing at them.
    pub orphaned_blobs: Vec<String>,
    /// Records whose blob is gone.
    pub missing_blobs: Vec<String>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.orphaned_blobs.is_empty() && self.missing_blobs.is_empty()
    }
}

/// Encrypted file storage: ciphertext in a `BlobStore`, records and tags in
/// a `MetadataStore`, one key for the whole vault.
pub struct Vault {
    key: KeyMaterial,
    metadata: Arc<dyn MetadataStore>,
    blobs: Arc<dyn BlobStore>,
    max_file_size: usize,
}

impl Vault {
    /// Opens (or creates) the vault under `config.data_dir`. The configured
    /// key must match the key check stored on first open.
    pub async fn open(config: &StorageConfig) -> Result<Self, VaultError> {
        let db = Database::open(config.data_dir.join(DATABASE_DIR))?;
        let metadata = db.load_or_init_metadata()?;

        let key = match &config.key {
            KeySource::Hex(hex) => KeyMaterial::from_hex(hex.expose_secret())?,
            KeySource::Passphrase(passphrase) => {
                KeyMaterial::derive(passphrase.expose_secret(), &metadata.key_salt)?
            }
        };

        match &metadata.key_check {
            Some(check) => cipher::verify_key_check(&key, check)?,
            None => {
                db.save_key_check(&cipher::key_check(&key))?;
                info!("Initialised key check for new vault");
            }
        }

        let blobs = FilesystemBlobStore::new(config.data_dir.join(DATA_DIR)).await?;
        info!(
            version = metadata.vault_version,
            created_at = metadata.created_at,
            backend = blobs.backend_name(),
            "Opened vault"
        );

        Ok(Self::new(
            key,
            Arc::new(db),
            Arc::new(blobs),
            config.max_file_size,
        ))
    }

    pub fn new(
        key: KeyMaterial,
        metadata: Arc<dyn MetadataStore>,
        blobs: Arc<dyn BlobStore>,
        max_file_size: usize,
    ) -> Self {
        Self {
            key,
            metadata,
            blobs,
            max_file_size,
        }
    }

    pub fn max_file_size(&self) -> usize {
        self.max_file_size
    }

    // --- Ingest ---

    /// Validates, encrypts and stores a file. The blob is written before the
    /// record and deleted again if the record cannot be created.
    #[instrument(skip(self, plaintext), fields(size = plaintext.len(), mime = %mime_type))]
    pub async fn ingest(
        &self,
        plaintext: &[u8],
        original_name: &str,
        mime_type: &str,
        raw_tags: Option<&str>,
    ) -> Result<FileRecord, VaultError> {
        // 1. Validation, before any crypto work
        if plaintext.len() > self.max_file_size {
            return Err(VaultError::Validation(format!(
                "File size {} exceeds the {} byte limit",
                plaintext.len(),
                self.max_file_size
            )));
        }
        let mime_type = MimeType::parse(mime_type)?;
        let original_name = original_name.trim();
        if original_name.is_empty() {
            return Err(VaultError::Validation("File name cannot be empty".into()));
        }
        let tag_names = tags::parse_tags(raw_tags)?;

        // 2. Naming
        let id = Uuid::new_v4();
        let created_at = now_millis();
        let stored = stored_name(created_at, id, original_name);
        let key = blob_key(&stored);

        // 3. Encrypt + write blob
        let (iv, ciphertext) = cipher::encrypt(&self.key, plaintext);
        let pending = PendingBlob::write(self.blobs.clone(), key.clone(), &ciphertext)
            .await
            .map_err(|source| VaultError::BlobWrite {
                path: key.clone(),
                source,
            })?;

        // 4. Tags + record
        let draft = FileRecordDraft {
            id,
            original_name: original_name.to_string(),
            stored_name: stored,
            mime_type,
            size: plaintext.len() as u64,
            storage_path: key,
            iv,
            created_at,
        };

        let created = self
            .metadata
            .resolve(&tag_names)
            .map(|ids| ids.into_iter().collect::<BTreeSet<_>>())
            .and_then(|ids| self.metadata.create(draft, &ids))
            .map_err(|e| match e {
                // A tag id that vanished mid-ingest is not the caller's missing file
                VaultError::NotFound(what) => {
                    VaultError::Conflict(format!("{what} disappeared during ingest"))
                }
                other => other,
            });

        match created {
            Ok(record) => {
                pending.commit();
                info!(stored_name = %record.stored_name, tags = record.tags.len(), "Stored file");
                Ok(record)
            }
            Err(e) => {
                warn!(error = %e, "Record creation failed, removing blob");
                if let Err(cleanup) = pending.discard().await {
                    warn!(error = %cleanup, "Failed to remove blob after rollback");
                }
                Err(e)
            }
        }
    }

    // --- Retrieval ---

    /// Decrypted contents and declared MIME type of a stored file.
    pub async fn retrieve(&self, stored_name: &str) -> Result<(MimeType, Vec<u8>), VaultError> {
        let (record, plaintext) = self.retrieve_file(stored_name).await?;
        Ok((record.mime_type, plaintext))
    }

    /// Like `retrieve`, but returns the whole record.
    #[instrument(skip(self))]
    pub async fn retrieve_file(
        &self,
        stored_name: &str,
    ) -> Result<(FileRecord, Vec<u8>), VaultError> {
        let record = self
            .metadata
            .find_by_stored_name(stored_name)?
            .ok_or_else(|| VaultError::NotFound(stored_name.to_string()))?;

        let ciphertext =
            self.blobs
                .read(&record.storage_path)
                .await
                .map_err(|source| VaultError::BlobRead {
                    path: record.storage_path.clone(),
                    source,
                })?;

        let plaintext = cipher::decrypt(&self.key, record.iv.as_bytes(), &ciphertext)?;
        if plaintext.len() as u64 != record.size {
            return Err(VaultError::Decryption(format!(
                "expected {} bytes, decrypted {}",
                record.size,
                plaintext.len()
            )));
        }

        Ok((record, plaintext))
    }

    // --- Search/List ---

    pub fn search(&self, query: &str) -> Result<Vec<FileRecord>, VaultError> {
        self.metadata.search(query)
    }

    pub fn list_files(&self) -> Result<Vec<FileRecord>, VaultError> {
        self.metadata.list_all()
    }

    pub fn list_tags(&self) -> Result<Vec<Tag>, VaultError> {
        self.metadata.list_tags()
    }

    // --- Maintenance ---

    /// Compares blob keys with record storage paths. Fails rather than
    /// guessing when a record cannot be decoded.
    #[instrument(skip(self), fields(backend = self.blobs.backend_name()))]
    pub async fn reconcile(&self) -> Result<ReconcileReport, VaultError> {
        let blobs: HashSet<String> = self.blobs.list().await?.into_iter().collect();
        let referenced = self.metadata.storage_paths()?;

        let mut orphaned_blobs: Vec<String> = blobs
            .iter()
            .filter(|key| !referenced.contains_key(key.as_str()))
            .cloned()
            .collect();
        orphaned_blobs.sort();

        let mut missing_blobs: Vec<String> = referenced
            .iter()
            .filter(|(path, _)| !blobs.contains(path.as_str()))
            .map(|(_, stored_name)| stored_name.clone())
            .collect();
        missing_blobs.sort();

        Ok(ReconcileReport {
            orphaned_blobs,
            missing_blobs,
        })
    }

    /// Deletes the orphaned blobs in `report` that still have no record.
    /// Returns how many were removed. Nothing is deleted if any record is
    /// unreadable.
    pub async fn purge_orphans(&self, report: &ReconcileReport) -> Result<usize, VaultError> {
        let referenced = self.metadata.storage_paths()?;

        let mut removed = 0;
        for key in &report.orphaned_blobs {
            if referenced.contains_key(key) {
                continue;
            }
            match self.blobs.delete(key).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(removed)
    }

    pub fn shutdown(&self) -> Result<(), VaultError> {
        self.metadata.flush()
    }
}

fn now_millis() -> u64 {
    let nanos = OffsetDateTime::now_utc().unix_timestamp_nanos();
    u64::try_from(nanos / 1_000_000).unwrap_or_default()
}
