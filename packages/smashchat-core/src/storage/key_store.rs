//! # Key Store
//!
//! Where private key material lives on the client.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         KEY STORE                                       │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │  KeyStore Trait                                                 │   │
//! │  │  ──────────────                                                  │   │
//! │  │                                                                 │   │
//! │  │  • put(id, value)     - Store (replaces)                        │   │
//! │  │  • get(id)            - Load, zeroized on drop                  │   │
//! │  │  • delete(id)         - Remove                                  │   │
//! │  │  • list(prefix)       - Ids starting with prefix                │   │
//! │  │                                                                 │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! │  ┌───────────────┐  ┌───────────────────┐  ┌───────────────┐           │
//! │  │ MemoryKeyStore│  │ EncryptedKeyStore │  │ FileKeyStore  │           │
//! │  │               │  │ <S: KeyStore>     │  │               │           │
//! │  │ - tests,      │  │ - AES-GCM at rest │  │ - one file    │           │
//! │  │   ephemeral   │  │ - AAD = key id    │  │   per id      │           │
//! │  └───────────────┘  └───────────────────┘  └───────────────┘           │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Binding the key id as AAD means a stored blob moved to a different id
//! fails to decrypt instead of silently yielding the wrong key.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use zeroize::Zeroizing;

use crate::crypto::{decrypt, encrypt, EncryptionKey, Nonce, NONCE_SIZE};
use crate::error::{Error, Result};

/// Well-known key ids
pub mod ids {
    /// Identity secret of one user
    pub fn identity(user_id: &str) -> String {
        format!("smash.identity.{}", user_id)
    }

    /// Prefix shared by all versions of one conversation key
    pub fn conversation_prefix(conversation_id: &str) -> String {
        format!("smash.conversation.{}.v", conversation_id)
    }

    /// One version of one conversation key
    pub fn conversation(conversation_id: &str, version: u32) -> String {
        format!("{}{}", conversation_prefix(conversation_id), version)
    }

    /// Version number from a conversation key id, if it is one
    pub fn conversation_version(conversation_id: &str, id: &str) -> Option<u32> {
        id.strip_prefix(&conversation_prefix(conversation_id))?
            .parse()
            .ok()
    }
}

/// Capability interface for storing secret key material
pub trait KeyStore: Send + Sync {
    /// Store a value under `id`, replacing any previous value
    fn put(&self, id: &str, value: &[u8]) -> Result<()>;

    /// Load the value stored under `id`
    fn get(&self, id: &str) -> Result<Option<Zeroizing<Vec<u8>>>>;

    /// Remove `id`, returning whether it existed
    fn delete(&self, id: &str) -> Result<bool>;

    /// All stored ids starting with `prefix`
    fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Check if an id exists
    fn exists(&self, id: &str) -> Result<bool> {
        Ok(self.get(id)?.is_some())
    }
}

// ============================================================================
// MEMORY
// ============================================================================

/// In-memory key store
#[derive(Default)]
pub struct MemoryKeyStore {
    entries: RwLock<HashMap<String, Zeroizing<Vec<u8>>>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyStore for MemoryKeyStore {
    fn put(&self, id: &str, value: &[u8]) -> Result<()> {
        self.entries
            .write()
            .insert(id.to_string(), Zeroizing::new(value.to_vec()));
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<Zeroizing<Vec<u8>>>> {
        Ok(self.entries.read().get(id).cloned())
    }

    fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.entries.write().remove(id).is_some())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self
            .entries
            .read()
            .keys()
            .filter(|id| id.starts_with(prefix))
            .cloned()
            .collect();
        ids.sort();
        Ok(ids)
    }

    fn exists(&self, id: &str) -> Result<bool> {
        Ok(self.entries.read().contains_key(id))
    }
}

// ============================================================================
// ENCRYPTED
// ============================================================================

/// Encrypts every value before handing it to an inner store
pub struct EncryptedKeyStore<S> {
    inner: S,
    key: EncryptionKey,
}

impl<S: KeyStore> EncryptedKeyStore<S> {
    /// Wrap `inner`, encrypting with `key` (see
    /// [`crate::crypto::derive_storage_key`])
    pub fn new(inner: S, key: EncryptionKey) -> Self {
        Self { inner, key }
    }

    /// The wrapped store
    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: KeyStore> KeyStore for EncryptedKeyStore<S> {
    fn put(&self, id: &str, value: &[u8]) -> Result<()> {
        let (nonce, ciphertext) = encrypt(&self.key, value, id.as_bytes())?;
        let mut sealed = nonce.as_bytes().to_vec();
        sealed.extend_from_slice(&ciphertext);
        self.inner.put(id, &sealed)
    }

    fn get(&self, id: &str) -> Result<Option<Zeroizing<Vec<u8>>>> {
        let sealed = match self.inner.get(id)? {
            Some(data) => data,
            None => return Ok(None),
        };

        if sealed.len() < NONCE_SIZE {
            return Err(Error::StorageCorrupted(format!(
                "Stored value for {} is too short",
                id
            )));
        }
        let nonce = Nonce::from_slice(&sealed[..NONCE_SIZE])?;

        let plaintext = decrypt(&self.key, &nonce, &sealed[NONCE_SIZE..], id.as_bytes())
            .map_err(|_| Error::StorageCorrupted(format!("Stored value for {} failed to decrypt", id)))?;
        Ok(Some(Zeroizing::new(plaintext)))
    }

    fn delete(&self, id: &str) -> Result<bool> {
        self.inner.delete(id)
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.inner.list(prefix)
    }

    fn exists(&self, id: &str) -> Result<bool> {
        self.inner.exists(id)
    }
}

// ============================================================================
// FILE
// ============================================================================

/// One file per id inside a directory.
///
/// File names are the hex encoding of the id so any id is a safe file name.
/// Writes go to a temporary file first and are renamed into place.
pub struct FileKeyStore {
    dir: PathBuf,
}

const FILE_EXTENSION: &str = "key";

impl FileKeyStore {
    /// Open (creating if needed) a store rooted at `dir`
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| {
            Error::StorageWriteError(format!("Cannot create {}: {}", dir.display(), e))
        })?;
        Ok(Self { dir })
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{}", hex::encode(id.as_bytes()), FILE_EXTENSION))
    }
}

impl KeyStore for FileKeyStore {
    fn put(&self, id: &str, value: &[u8]) -> Result<()> {
        let path = self.path_for(id);
        let tmp = path.with_extension("tmp");

        let write = || -> std::io::Result<()> {
            let mut file = fs::File::create(&tmp)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                file.set_permissions(fs::Permissions::from_mode(0o600))?;
            }
            file.write_all(value)?;
            file.sync_all()?;
            fs::rename(&tmp, &path)
        };

        write().map_err(|e| Error::StorageWriteError(format!("Cannot write key {}: {}", id, e)))
    }

    fn get(&self, id: &str) -> Result<Option<Zeroizing<Vec<u8>>>> {
        match fs::read(self.path_for(id)) {
            Ok(bytes) => Ok(Some(Zeroizing::new(bytes))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::StorageReadError(format!(
                "Cannot read key {}: {}",
                id, e
            ))),
        }
    }

    fn delete(&self, id: &str) -> Result<bool> {
        match fs::remove_file(self.path_for(id)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::StorageWriteError(format!(
                "Cannot delete key {}: {}",
                id, e
            ))),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(FILE_EXTENSION) {
                continue;
            }
            let decoded = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| hex::decode(s).ok())
                .and_then(|b| String::from_utf8(b).ok());
            if let Some(id) = decoded {
                if id.starts_with(prefix) {
                    ids.push(id);
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn exists(&self, id: &str) -> Result<bool> {
        Ok(self.path_for(id).exists())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(store: &dyn KeyStore) {
        store.put("smash.identity.alice", b"secret-a").unwrap();
        store.put("smash.conversation.c1.v1", b"k1").unwrap();
        store.put("smash.conversation.c1.v2", b"k2").unwrap();

        let value = store.get("smash.identity.alice").unwrap().unwrap();
        assert_eq!(&**value, b"secret-a");
        assert!(store.exists("smash.identity.alice").unwrap());
        assert!(store.get("missing").unwrap().is_none());

        assert_eq!(
            store.list("smash.conversation.c1.").unwrap(),
            vec!["smash.conversation.c1.v1", "smash.conversation.c1.v2"]
        );

        // Replace
        store.put("smash.identity.alice", b"secret-b").unwrap();
        assert_eq!(
            &**store.get("smash.identity.alice").unwrap().unwrap(),
            b"secret-b"
        );

        assert!(store.delete("smash.identity.alice").unwrap());
        assert!(!store.delete("smash.identity.alice").unwrap());
        assert!(!store.exists("smash.identity.alice").unwrap());
    }

    #[test]
    fn test_memory_store() {
        exercise(&MemoryKeyStore::new());
    }

    #[test]
    fn test_encrypted_store() {
        let store = EncryptedKeyStore::new(MemoryKeyStore::new(), EncryptionKey::generate());
        exercise(&store);
    }

    #[test]
    fn test_file_store() {
        let dir = tempfile::tempdir().unwrap();
        exercise(&FileKeyStore::open(dir.path()).unwrap());
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        FileKeyStore::open(dir.path())
            .unwrap()
            .put("smash.identity.bob", b"persisted")
            .unwrap();

        let reopened = FileKeyStore::open(dir.path()).unwrap();
        assert_eq!(
            &**reopened.get("smash.identity.bob").unwrap().unwrap(),
            b"persisted"
        );
    }

    #[test]
    fn test_encrypted_store_hides_plaintext() {
        let store = EncryptedKeyStore::new(MemoryKeyStore::new(), EncryptionKey::generate());
        store.put("id", b"plaintext-secret").unwrap();

        let raw = store.inner().get("id").unwrap().unwrap();
        assert!(!raw.windows(16).any(|w| w == b"plaintext-secret"));
    }

    #[test]
    fn test_encrypted_store_binds_id() {
        let store = EncryptedKeyStore::new(MemoryKeyStore::new(), EncryptionKey::generate());
        store.put("a", b"value").unwrap();

        // Move the sealed blob under another id
        let raw = store.inner().get("a").unwrap().unwrap();
        store.inner().put("b", &raw).unwrap();

        assert!(matches!(store.get("b"), Err(Error::StorageCorrupted(_))));
    }

    #[test]
    fn test_conversation_ids() {
        assert_eq!(ids::conversation("c1", 3), "smash.conversation.c1.v3");
        assert_eq!(ids::conversation_version("c1", "smash.conversation.c1.v3"), Some(3));
        assert_eq!(ids::conversation_version("c1", "smash.conversation.c10.v3"), None);
        assert_eq!(ids::identity("alice"), "smash.identity.alice");
    }
}
