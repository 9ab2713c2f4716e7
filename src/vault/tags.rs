use crate::vault::{
    db::Database,
    error::VaultError,
    store::TagRegistry,
    types::{MAX_TAG_CHARS, Tag, TagId},
};
use sled::Transactional;
use sled::transaction::{ConflictableTransactionError, ConflictableTransactionResult, TransactionError};
use std::collections::HashSet;
use std::str::from_utf8;

/// Splits a comma-separated tag string. Names are trimmed, blanks dropped and
/// duplicates removed; case is preserved.
pub fn parse_tags(raw: Option<&str>) -> Result<Vec<String>, VaultError> {
    let mut seen = HashSet::new();
    let mut names = Vec::new();

    for name in raw.unwrap_or_default().split(',').map(str::trim) {
        if name.is_empty() || !seen.insert(name) {
            continue;
        }
        if name.chars().count() > MAX_TAG_CHARS {
            return Err(VaultError::Validation(format!(
                "Tag cannot exceed {MAX_TAG_CHARS} characters"
            )));
        }
        names.push(name.to_string());
    }

    Ok(names)
}

impl Database {
    /// Get-or-insert keyed by tag name. The name and id trees are updated in a
    /// single transaction, so racing callers always converge on one id.
    fn upsert_tag(&self, name: &str) -> Result<TagId, VaultError> {
        if let Some(existing) = self.tags.get(name.as_bytes())? {
            return TagId::from_be_slice(&existing)
                .ok_or_else(|| VaultError::Corruption(format!("Malformed id for tag {name}")));
        }

        let candidate = TagId(self.generate_id()?);

        (&self.tags, &self.tag_names)
            .transaction(
                |(tags, tag_names)| -> ConflictableTransactionResult<TagId, VaultError> {
                    if let Some(existing) = tags.get(name.as_bytes())? {
                        return TagId::from_be_slice(&existing).ok_or_else(|| {
                            ConflictableTransactionError::Abort(VaultError::Corruption(format!(
                                "Malformed id for tag {name}"
                            )))
                        });
                    }

                    tags.insert(name.as_bytes(), &candidate.to_be_bytes()[..])?;
                    tag_names.insert(&candidate.to_be_bytes()[..], name.as_bytes())?;
                    Ok(candidate)
                },
            )
            .map_err(|e| match e {
                TransactionError::Abort(e) => e,
                TransactionError::Storage(e) => VaultError::Persistence(e),
            })
    }
}

impl TagRegistry for Database {
    fn resolve(&self, names: &[String]) -> Result<Vec<TagId>, VaultError> {
        let mut seen = HashSet::new();
        let mut ids = Vec::with_capacity(names.len());

        for name in names.iter().map(|n| n.trim()) {
            if name.is_empty() || !seen.insert(name) {
                continue;
            }
            ids.push(self.upsert_tag(name)?);
        }

        Ok(ids)
    }

    fn list_tags(&self) -> Result<Vec<Tag>, VaultError> {
        let mut tags = Vec::new();
        for item in self.tags.iter() {
            let (name, id) = item?;
            let id = TagId::from_be_slice(&id)
                .ok_or_else(|| VaultError::Corruption("Malformed tag id".into()))?;
            tags.push(Tag {
                id,
                name: from_utf8(&name)?.to_string(),
            });
        }
        // sled iterates keys in byte order, which is name order
        Ok(tags)
    }
}
