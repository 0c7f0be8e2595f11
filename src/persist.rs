//! Pluggable persistence of keys and certificates.
//!
//! The persistence is a simple key-value store keyed by a kind and a name. The
//! file implementation maps every key to a predictable file name, so the issued
//! material for `example.com` ends up as `example_com.key` and `example_com.crt`.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use crate::{Error, Result};

/// Kinds of [persistence keys](struct.PersistKey.html).
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum PersistKind {
    /// Persisted account private key.
    AccountPrivateKey,
    /// Persisted private key.
    PrivateKey,
    /// Persisted certificate.
    Certificate,
}

impl PersistKind {
    fn name(self) -> &'static str {
        match self {
            PersistKind::Certificate => "crt",
            PersistKind::PrivateKey => "key",
            PersistKind::AccountPrivateKey => "key",
        }
    }
}

/// Key for a value in the persistence.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct PersistKey<'a> {
    pub kind: PersistKind,
    pub key: &'a str,
}

impl<'a> PersistKey<'a> {
    pub fn new(kind: PersistKind, key: &'a str) -> Self {
        PersistKey { kind, key }
    }

    /// The file name without extension.
    pub fn stem(&self) -> String {
        let name = sanitize(self.key);
        match self.kind {
            PersistKind::AccountPrivateKey => format!("acme_account_{}", name),
            _ => name,
        }
    }
}

impl<'a> std::fmt::Display for PersistKey<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}.{}", self.stem(), self.kind.name())
    }
}

pub(crate) fn sanitize(key: &str) -> String {
    key.replace('.', "_").replace('*', "STAR")
}

/// Trait for a persistence implementation.
///
/// Implementation must be clonable and thread safe (Send). This can easily be done by
/// wrapping the implemetation an `Arc<Mutex<P>>`.
pub trait Persist: Clone + Send {
    /// Store the given bytes under the given key.
    fn put(&self, key: &PersistKey, value: &[u8]) -> Result<()>;
    /// Read the bytes stored under the given key.
    ///
    /// `None` if the value doesn't exist.
    fn get(&self, key: &PersistKey) -> Result<Option<Vec<u8>>>;
}

/// Memory implementation for dev/testing.
///
/// The entries in memory are never saved to disk and are gone when the process dies.
#[derive(Clone, Default)]
pub struct MemoryPersist {
    inner: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryPersist {
    pub fn new() -> Self {
        MemoryPersist {
            ..Default::default()
        }
    }
}

impl Persist for MemoryPersist {
    fn put(&self, key: &PersistKey, value: &[u8]) -> Result<()> {
        let mut lock = self.inner.lock().map_err(|_| "persist lock poisoned")?;
        lock.insert(key.to_string(), value.to_owned());
        Ok(())
    }
    fn get(&self, key: &PersistKey) -> Result<Option<Vec<u8>>> {
        let lock = self.inner.lock().map_err(|_| "persist lock poisoned")?;
        Ok(lock.get(&key.to_string()).cloned())
    }
}

/// Simple file persistence.
///
/// Each key is saved under a unique filename. Private keys are created with
/// mode `0600` on unix.
#[derive(Clone, Debug)]
pub struct FilePersist {
    dir: PathBuf,
}

impl FilePersist {
    /// Create a file persistence in the directory pointed out by the `dir` given.
    ///
    /// The directory must be writable.
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        FilePersist {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Where the value for `key` is (or would be) stored.
    pub fn path_of(&self, key: &PersistKey) -> PathBuf {
        self.dir.join(key.to_string())
    }
}

impl Persist for FilePersist {
    #[cfg(not(unix))]
    fn put(&self, key: &PersistKey, value: &[u8]) -> Result<()> {
        let f_name = self.path_of(key);
        fs::write(f_name, value).map_err(Error::from)
    }

    #[cfg(unix)]
    fn put(&self, key: &PersistKey, value: &[u8]) -> Result<()> {
        let f_name = self.path_of(key);
        match key.kind {
            PersistKind::AccountPrivateKey | PersistKind::PrivateKey => {
                let mut f = fs::File::create(f_name)?;
                let mut permissions = f.metadata()?.permissions();
                permissions.set_mode(0o600);
                f.set_permissions(permissions)?;
                f.write_all(value).map_err(Error::from)
            }
            PersistKind::Certificate => fs::write(f_name, value).map_err(Error::from),
        }
    }

    fn get(&self, key: &PersistKey) -> Result<Option<Vec<u8>>> {
        match fs::read(self.path_of(key)) {
            Ok(v) => Ok(Some(v)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_key_names() {
        let k = PersistKey::new(PersistKind::Certificate, "example.com");
        assert_eq!(k.to_string(), "example_com.crt");
        let k = PersistKey::new(PersistKind::PrivateKey, "*.example.com");
        assert_eq!(k.to_string(), "STAR_example_com.key");
        let k = PersistKey::new(PersistKind::AccountPrivateKey, "ops");
        assert_eq!(k.to_string(), "acme_account_ops.key");
    }

    #[test]
    fn test_file_persist() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let persist = FilePersist::new(dir.path());
        let key = PersistKey::new(PersistKind::PrivateKey, "example.com");
        assert_eq!(persist.get(&key)?, None);
        persist.put(&key, b"secret")?;
        assert_eq!(persist.get(&key)?, Some(b"secret".to_vec()));
        let path = dir.path().join("example_com.key");
        assert!(path.is_file());
        #[cfg(unix)]
        assert_eq!(fs::metadata(&path)?.permissions().mode() & 0o777, 0o600);
        Ok(())
    }

    #[test]
    fn test_memory_persist() -> Result<()> {
        let persist = MemoryPersist::new();
        let key = PersistKey::new(PersistKind::Certificate, "example.com");
        persist.put(&key, b"CERT")?;
        let other = persist.clone();
        assert_eq!(other.get(&key)?, Some(b"CERT".to_vec()));
        Ok(())
    }
}
