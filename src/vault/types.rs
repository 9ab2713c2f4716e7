use super::error::VaultError;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const IV_LEN: usize = 16;
pub const MAX_TAG_CHARS: usize = 64;
const MAX_NAME_CHARS: usize = 128;

/// Per-file CBC initialization vector. Serialized as hex, both in the
/// metadata store and in API responses.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Iv(#[serde(with = "hex::serde")] [u8; IV_LEN]);

impl Iv {
    /// Draws a fresh IV from the thread-local CSPRNG.
    pub fn generate() -> Self {
        Self(rand::random::<[u8; IV_LEN]>())
    }

    pub fn as_bytes(&self) -> &[u8; IV_LEN] {
        &self.0
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MimeType {
    #[serde(rename = "image/jpeg")]
    Jpeg,
    #[serde(rename = "image/png")]
    Png,
    #[serde(rename = "application/pdf")]
    Pdf,
    #[serde(rename = "text/plain")]
    PlainText,
}

impl MimeType {
    pub const ALLOWED: [MimeType; 4] = [Self::Jpeg, Self::Png, Self::Pdf, Self::PlainText];

    /// Matches a declared content type against the allow-list. Parameters
    /// such as `; charset=utf-8` are ignored and the match is case-insensitive.
    pub fn parse(raw: &str) -> Result<Self, VaultError> {
        let essence = raw.split(';').next().unwrap_or_default().trim();

        Self::ALLOWED
            .into_iter()
            .find(|mime| mime.as_str().eq_ignore_ascii_case(essence))
            .ok_or_else(|| VaultError::Validation(format!("Unsupported file type: {raw}")))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Pdf => "application/pdf",
            Self::PlainText => "text/plain",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TagId(pub u64);

impl TagId {
    pub fn to_be_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    pub fn from_be_slice(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok().map(|b| Self(u64::from_be_bytes(b)))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub id: TagId,
    pub name: String,
}

/// Everything the orchestrator knows about a file before the metadata store
/// has linked it to its tags.
#[derive(Debug, Clone)]
pub struct FileRecordDraft {
    pub id: Uuid,
    pub original_name: String,
    pub stored_name: String,
    pub mime_type: MimeType,
    pub size: u64,
    pub storage_path: String,
    pub iv: Iv,
    pub created_at: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct FileRecord {
    pub id: Uuid,
    pub original_name: String,
    pub stored_name: String,
    pub mime_type: MimeType,
    /// Plaintext length in bytes.
    pub size: u64,
    pub storage_path: String,
    pub iv: Iv,
    /// Unix milliseconds at ingest.
    pub created_at: u64,
    pub tags: Vec<Tag>,
}

#[cfg(test)]
impl FileRecord {
    pub fn has_tag(&self, name: &str) -> bool {
        self.tags.iter().any(|t| t.name == name)
    }
}

#[derive(Clone)]
pub struct VaultMetadata {
    pub vault_version: u32,
    pub created_at: i64,
    pub key_salt: [u8; 16],
    pub key_check: Option<Vec<u8>>,
}

/// Builds the unique on-disk name for an upload: ingest time, a slice of the
/// record id, then the sanitised original name.
pub fn stored_name(created_at_ms: u64, id: Uuid, original_name: &str) -> String {
    let suffix = &id.simple().to_string()[..8];
    format!("{created_at_ms}-{suffix}-{}", sanitize_name(original_name))
}

/// Keeps ASCII alphanumerics, `.`, `-` and `_`; everything else becomes `_`.
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .take(MAX_NAME_CHARS)
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Blob key for a stored name.
pub fn blob_key(stored_name: &str) -> String {
    format!("{stored_name}.enc")
}
