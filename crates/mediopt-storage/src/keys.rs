//! Shared key generation for storage backends.
//!
//! Key format: `{folder}/{uuid}.{extension}`, public id `{folder}/{uuid}`.

use uuid::Uuid;

use crate::traits::{StorageError, StorageResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageKey {
    pub key: String,
    pub public_id: String,
}

/// Generate a fresh key under `folder` for an object with the given extension.
pub fn generate_storage_key(folder: &str, extension: &str) -> StorageKey {
    let folder = folder.trim_matches('/');
    let id = Uuid::new_v4();
    let public_id = if folder.is_empty() {
        id.to_string()
    } else {
        format!("{}/{}", folder, id)
    };
    StorageKey {
        key: format!("{}.{}", public_id, extension.trim_start_matches('.')),
        public_id,
    }
}

/// Reject keys that could escape the bucket or base directory.
pub fn validate_key(storage_key: &str) -> StorageResult<()> {
    if storage_key.is_empty() || storage_key.contains("..") || storage_key.starts_with('/') {
        return Err(StorageError::InvalidKey(format!(
            "Storage key contains invalid characters: {}",
            storage_key
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let key = generate_storage_key("/optimized/images/", "webp");
        assert!(key.key.starts_with("optimized/images/"));
        assert!(key.key.ends_with(".webp"));
        assert_eq!(key.key, format!("{}.webp", key.public_id));
        validate_key(&key.key).unwrap();
    }

    #[test]
    fn test_keys_are_unique() {
        let a = generate_storage_key("v", "mp4");
        let b = generate_storage_key("v", "mp4");
        assert_ne!(a.key, b.key);
    }

    #[test]
    fn test_validate_rejects_traversal() {
        assert!(validate_key("../etc/passwd").is_err());
        assert!(validate_key("/abs/path").is_err());
        assert!(validate_key("").is_err());
    }
}
