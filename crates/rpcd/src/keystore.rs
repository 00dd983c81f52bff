//! Persistent key storage.
//!
//! Two files live in the node's data directory:
//! - `identity.key`: the node's static private key in base64 text form.
//! - `authorized_keys.json`: the client public keys allowed to call this
//!   node, with a name and the time they were added.
//!
//! The authorized list is held in memory behind a `RwLock` and written back
//! atomically; the server's live allow-list is refreshed from it with
//! [`KeyStore::public_keys`].

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use protocol::{KeyFingerprint, PrivateKey, PublicKey};
use serde::{Deserialize, Serialize};

/// An allow-listed client key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizedKey {
    /// Human-readable label.
    pub name: String,
    /// The client's static public key.
    #[serde(with = "public_key_serde")]
    pub public_key: PublicKey,
    /// Unix seconds when the key was added.
    pub added_at: u64,
}

impl AuthorizedKey {
    /// Creates an entry stamped with the current time.
    pub fn new(name: impl Into<String>, public_key: PublicKey) -> Self {
        let added_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            name: name.into(),
            public_key,
            added_at,
        }
    }
}

/// Serde support for public keys (serialized as base64).
mod public_key_serde {
    use protocol::PublicKey;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(key: &PublicKey, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        key.to_base64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<PublicKey, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded: String = Deserialize::deserialize(deserializer)?;
        PublicKey::from_base64(&encoded).map_err(serde::de::Error::custom)
    }
}

/// On-disk layout of the authorized keys file.
#[derive(Debug, Serialize, Deserialize)]
struct KeyStoreData {
    /// Version of the store format.
    version: u32,
    /// The authorized keys.
    keys: Vec<AuthorizedKey>,
}

impl Default for KeyStoreData {
    fn default() -> Self {
        Self {
            version: 1,
            keys: Vec::new(),
        }
    }
}

/// Thread-safe store for authorized client keys.
pub struct KeyStore {
    /// The path to the JSON file.
    path: PathBuf,
    /// The entries, keyed by key fingerprint.
    keys: RwLock<HashMap<KeyFingerprint, AuthorizedKey>>,
}

impl KeyStore {
    /// Creates a key store that will persist to the given path.
    ///
    /// This does not load the file; call `load()` to read existing data.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            keys: RwLock::new(HashMap::new()),
        }
    }

    /// Creates a key store and loads it from `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let store = Self::new(path);
        store.load()?;
        Ok(store)
    }

    /// Returns the path to the key store file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the key store from the JSON file, replacing the in-memory set.
    ///
    /// If the file does not exist, the store will be empty.
    /// If the file exists but is invalid, returns an error and leaves the
    /// in-memory set untouched.
    pub fn load(&self) -> Result<()> {
        let data = if self.path.exists() {
            let contents = fs::read_to_string(&self.path)
                .with_context(|| format!("Failed to read key store: {}", self.path.display()))?;
            serde_json::from_str::<KeyStoreData>(&contents)
                .with_context(|| format!("Failed to parse key store: {}", self.path.display()))?
        } else {
            tracing::debug!("Key store file not found at {:?}, starting empty", self.path);
            KeyStoreData::default()
        };

        if data.version != 1 {
            anyhow::bail!(
                "Unsupported key store version {} in {}",
                data.version,
                self.path.display()
            );
        }

        let mut keys = self
            .keys
            .write()
            .map_err(|_| anyhow::anyhow!("Failed to acquire write lock on key store"))?;

        keys.clear();
        for entry in data.keys {
            keys.insert(entry.public_key.fingerprint(), entry);
        }

        tracing::info!("Loaded {} authorized keys from {:?}", keys.len(), self.path);
        Ok(())
    }

    /// Saves the key store to the JSON file.
    ///
    /// Uses atomic write (write to temp file, then rename) to prevent corruption.
    /// Creates parent directories if they don't exist.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create key store directory: {}", parent.display())
            })?;
        }

        let data = KeyStoreData {
            version: 1,
            keys: self.list()?,
        };

        let contents =
            serde_json::to_string_pretty(&data).context("Failed to serialize key store")?;

        let temp_path = self.path.with_extension("json.tmp");
        fs::write(&temp_path, &contents)
            .with_context(|| format!("Failed to write temp key store: {}", temp_path.display()))?;

        fs::rename(&temp_path, &self.path).with_context(|| {
            format!(
                "Failed to rename temp key store {} to {}",
                temp_path.display(),
                self.path.display()
            )
        })?;

        tracing::debug!("Saved {} authorized keys to {:?}", data.keys.len(), self.path);
        Ok(())
    }

    /// Adds a key under `name`.
    ///
    /// Returns `false` and keeps the existing entry if the key is already
    /// present. Does not automatically save.
    pub fn add(&self, name: impl Into<String>, key: PublicKey) -> Result<bool> {
        let mut keys = self
            .keys
            .write()
            .map_err(|_| anyhow::anyhow!("Failed to acquire write lock on key store"))?;

        let fingerprint = key.fingerprint();
        if keys.contains_key(&fingerprint) {
            return Ok(false);
        }

        let entry = AuthorizedKey::new(name, key);
        tracing::info!(key_id = %key.key_id(), name = %entry.name, "Authorizing key");
        keys.insert(fingerprint, entry);
        Ok(true)
    }

    /// Removes a key.
    ///
    /// Returns the removed entry if it existed. Does not automatically save.
    pub fn remove(&self, key: &PublicKey) -> Result<Option<AuthorizedKey>> {
        let mut keys = self
            .keys
            .write()
            .map_err(|_| anyhow::anyhow!("Failed to acquire write lock on key store"))?;

        let removed = keys.remove(&key.fingerprint());
        if let Some(ref entry) = removed {
            tracing::info!(key_id = %key.key_id(), name = %entry.name, "Revoked key");
        }
        Ok(removed)
    }

    /// Returns true if `key` is authorized.
    pub fn contains(&self, key: &PublicKey) -> Result<bool> {
        let keys = self
            .keys
            .read()
            .map_err(|_| anyhow::anyhow!("Failed to acquire read lock on key store"))?;
        Ok(keys.contains_key(&key.fingerprint()))
    }

    /// Lists all entries, oldest first.
    pub fn list(&self) -> Result<Vec<AuthorizedKey>> {
        let keys = self
            .keys
            .read()
            .map_err(|_| anyhow::anyhow!("Failed to acquire read lock on key store"))?;

        let mut entries: Vec<_> = keys.values().cloned().collect();
        entries.sort_by(|a, b| a.added_at.cmp(&b.added_at).then_with(|| a.name.cmp(&b.name)));
        Ok(entries)
    }

    /// Returns just the public keys.
    pub fn public_keys(&self) -> Result<Vec<PublicKey>> {
        Ok(self.list()?.into_iter().map(|e| e.public_key).collect())
    }

    /// Returns the number of keys in the store.
    pub fn len(&self) -> Result<usize> {
        let keys = self
            .keys
            .read()
            .map_err(|_| anyhow::anyhow!("Failed to acquire read lock on key store"))?;
        Ok(keys.len())
    }

    /// Returns true if the store is empty.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

/// Loads the identity key at `path`, generating and saving one if absent.
pub fn load_or_generate_identity(path: &Path) -> Result<PrivateKey> {
    if path.exists() {
        return load_identity(path);
    }

    let key = PrivateKey::generate().context("Failed to generate identity key")?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    write_secret(path, &key.to_base64())
        .with_context(|| format!("Failed to write identity file: {}", path.display()))?;

    tracing::info!(key_id = %key.public_key().key_id(), "Generated new identity key at {:?}", path);
    Ok(key)
}

/// Loads an existing identity key.
pub fn load_identity(path: &Path) -> Result<PrivateKey> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read identity file: {}", path.display()))?;
    PrivateKey::from_base64(&contents)
        .with_context(|| format!("Invalid identity file: {}", path.display()))
}

#[cfg(unix)]
fn write_secret(path: &Path, contents: &str) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents.as_bytes())?;
    file.write_all(b"\n")
}

#[cfg(not(unix))]
fn write_secret(path: &Path, contents: &str) -> std::io::Result<()> {
    fs::write(path, format!("{}\n", contents))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    fn random_key() -> PublicKey {
        PrivateKey::generate().unwrap().public_key()
    }

    fn temp_store() -> (KeyStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = KeyStore::new(temp_dir.path().join("authorized_keys.json"));
        (store, temp_dir)
    }

    #[test]
    fn test_key_store_new_is_empty() {
        let (store, _temp_dir) = temp_store();
        assert!(store.is_empty().unwrap());
        assert!(store.path().ends_with("authorized_keys.json"));
    }

    #[test]
    fn test_key_store_add() {
        let (store, _temp_dir) = temp_store();
        let key = random_key();

        assert!(store.add("laptop", key).unwrap());
        assert!(store.contains(&key).unwrap());
        assert_eq!(store.len().unwrap(), 1);

        let entry = &store.list().unwrap()[0];
        assert_eq!(entry.name, "laptop");
        assert_eq!(entry.public_key, key);
        assert!(entry.added_at > 0);
    }

    #[test]
    fn test_key_store_add_is_idempotent() {
        let (store, _temp_dir) = temp_store();
        let key = random_key();

        assert!(store.add("first", key).unwrap());
        assert!(!store.add("second", key).unwrap());
        assert_eq!(store.len().unwrap(), 1);
        assert_eq!(store.list().unwrap()[0].name, "first");
    }

    #[test]
    fn test_key_store_remove() {
        let (store, _temp_dir) = temp_store();
        let key = random_key();
        store.add("laptop", key).unwrap();

        let removed = store.remove(&key).unwrap();
        assert_eq!(removed.map(|e| e.name), Some("laptop".to_string()));
        assert!(!store.contains(&key).unwrap());
        assert!(store.remove(&key).unwrap().is_none());
    }

    #[test]
    fn test_key_store_save_and_load() {
        let (store, _temp_dir) = temp_store();
        let a = random_key();
        let b = random_key();
        store.add("a", a).unwrap();
        store.add("b", b).unwrap();
        store.save().unwrap();

        let reloaded = KeyStore::open(store.path()).unwrap();
        assert_eq!(reloaded.len().unwrap(), 2);
        assert!(reloaded.contains(&a).unwrap());
        assert!(reloaded.contains(&b).unwrap());

        let mut keys = reloaded.public_keys().unwrap();
        keys.sort_by_key(|k| k.to_base64());
        let mut expected = vec![a, b];
        expected.sort_by_key(|k| k.to_base64());
        assert_eq!(keys, expected);
    }

    #[test]
    fn test_key_store_load_replaces_memory() {
        let (store, _temp_dir) = temp_store();
        let kept = random_key();
        store.add("kept", kept).unwrap();
        store.save().unwrap();

        store.add("unsaved", random_key()).unwrap();
        store.load().unwrap();

        assert_eq!(store.public_keys().unwrap(), vec![kept]);
    }

    #[test]
    fn test_key_store_load_nonexistent_file() {
        let (store, _temp_dir) = temp_store();
        store.load().unwrap();
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn test_key_store_load_invalid_json() {
        let (store, _temp_dir) = temp_store();
        fs::write(store.path(), "{ not json").unwrap();
        let err = store.load().unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to parse key store"));
    }

    #[test]
    fn test_key_store_load_bad_key() {
        let (store, _temp_dir) = temp_store();
        fs::write(
            store.path(),
            r#"{"version":1,"keys":[{"name":"x","public_key":"AAAA","added_at":0}]}"#,
        )
        .unwrap();
        assert!(store.load().is_err());
    }

    #[test]
    fn test_key_store_rejects_unknown_version() {
        let (store, _temp_dir) = temp_store();
        fs::write(store.path(), r#"{"version":2,"keys":[]}"#).unwrap();
        let err = store.load().unwrap_err();
        assert!(err.to_string().contains("Unsupported key store version"));
    }

    #[test]
    fn test_key_store_file_format() {
        let (store, _temp_dir) = temp_store();
        let key = random_key();
        store.add("laptop", key).unwrap();
        store.save().unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(json["version"], 1);
        assert_eq!(json["keys"][0]["name"], "laptop");
        assert_eq!(json["keys"][0]["public_key"], key.to_base64());
        assert!(json["keys"][0]["added_at"].is_u64());
    }

    #[test]
    fn test_key_store_atomic_write() {
        let (store, temp_dir) = temp_store();
        store.add("laptop", random_key()).unwrap();
        store.save().unwrap();

        assert!(store.path().exists());
        assert!(!temp_dir.path().join("authorized_keys.json.tmp").exists());
    }

    #[test]
    fn test_key_store_creates_parent_directories() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("dir").join("keys.json");
        let store = KeyStore::new(&path);
        store.save().unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_key_store_concurrent_access() {
        let (store, _temp_dir) = temp_store();
        let store = Arc::new(store);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    let key = random_key();
                    store.add(format!("client-{}", i), key).unwrap();
                    assert!(store.contains(&key).unwrap());
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.len().unwrap(), 8);
    }

    #[test]
    fn test_identity_generated_once() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("data").join("identity.key");

        let first = load_or_generate_identity(&path).unwrap();
        let second = load_or_generate_identity(&path).unwrap();
        assert_eq!(first, second);
        assert_eq!(load_identity(&path).unwrap(), first);
    }

    #[test]
    fn test_identity_file_is_base64_text() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("identity.key");
        let key = load_or_generate_identity(&path).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents.trim(), key.to_base64());
    }

    #[cfg(unix)]
    #[test]
    fn test_identity_file_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("identity.key");
        load_or_generate_identity(&path).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_identity_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("identity.key");
        fs::write(&path, "not a key").unwrap();
        assert!(load_identity(&path).is_err());
        assert!(load_or_generate_identity(&path).is_err());
    }
}
