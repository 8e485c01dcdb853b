//! Storage key conventions.
//!
//! Remote objects live at `users/{owner}/{uuid}.{ext}`, local objects at
//! `user_{owner}/{uuid}.{ext}` under the configured root.

use crate::storage::models::{StorageLocator, StorageType};

const MAX_EXTENSION_LEN: usize = 16;

/// The per-upload object identity shared by the local and remote keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectName {
    pub id: String,
    pub extension: Option<String>,
}

impl ObjectName {
    pub fn new(id: impl Into<String>, file_name: &str) -> Self {
        Self {
            id: id.into(),
            extension: extension_of(file_name),
        }
    }

    fn file_part(&self) -> String {
        match self.extension {
            Some(ref ext) => format!("{}.{ext}", self.id),
            None => self.id.clone(),
        }
    }
}

pub fn remote_key(owner_id: &str, name: &ObjectName) -> String {
    format!("users/{owner_id}/{}", name.file_part())
}

pub fn local_key(owner_id: &str, name: &ObjectName) -> String {
    format!("user_{owner_id}/{}", name.file_part())
}

/// Whether a locator sits inside the owner's namespace for its backend.
pub fn belongs_to(owner_id: &str, locator: &StorageLocator) -> bool {
    let prefix = match locator.storage_type {
        StorageType::Local => format!("user_{owner_id}/"),
        StorageType::S3Compatible | StorageType::ManagedObjectStore => {
            format!("users/{owner_id}/")
        }
    };
    locator.key.starts_with(&prefix) && !locator.key.contains("..")
}

/// Owner ids become path components, so only a conservative alphabet is allowed.
pub fn is_valid_owner_id(owner_id: &str) -> bool {
    !owner_id.is_empty()
        && owner_id.len() <= 128
        && owner_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Lowercased alphanumeric extension of a file name, if it has a usable one.
pub fn extension_of(file_name: &str) -> Option<String> {
    let (stem, ext) = file_name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() || ext.len() > MAX_EXTENSION_LEN {
        return None;
    }
    if !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}
