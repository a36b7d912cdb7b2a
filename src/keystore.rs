use log::{debug, info};
use p256::elliptic_curve::JwkEcKey;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use crate::{crypt::KeyPair, write_file, AcmeError};

#[derive(Serialize, Deserialize, Clone, Debug)]
struct StoredKey {
    private: JwkEcKey,
    public: JwkEcKey,
}

/// Named account keys, generated on first use and never regenerated afterwards.
#[derive(Debug)]
pub struct KeyStore {
    path: Option<PathBuf>,
    stored: BTreeMap<String, StoredKey>,
}

impl KeyStore {
    pub fn open(path: &Path) -> Result<Self, AcmeError> {
        let stored = if path.exists() {
            serde_json::from_str(&std::fs::read_to_string(path)?)?
        } else {
            BTreeMap::new()
        };
        debug!("Loaded {} keys from {:?}", stored.len(), path);
        Ok(KeyStore {
            path: Some(path.to_path_buf()),
            stored,
        })
    }

    pub fn in_memory() -> Self {
        KeyStore {
            path: None,
            stored: BTreeMap::new(),
        }
    }

    pub fn get_or_create(&mut self, name: &str) -> Result<KeyPair, AcmeError> {
        if let Some(s) = self.stored.get(name) {
            return KeyPair::import(&s.private, &s.public);
        }

        info!("No key stored for {}, generating", name);
        let key = KeyPair::generate()?;
        let (private, public) = key.export();
        self.stored.insert(name.to_string(), StoredKey { private, public });
        // must hit the disk before anything gets signed with it
        if let Err(e) = self.persist() {
            self.stored.remove(name);
            return Err(e);
        }
        Ok(key)
    }

    pub fn get(&self, name: &str) -> Result<Option<KeyPair>, AcmeError> {
        self.stored
            .get(name)
            .map(|s| KeyPair::import(&s.private, &s.public))
            .transpose()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.stored.keys().map(|s| s.as_str())
    }

    fn persist(&self) -> Result<(), AcmeError> {
        match &self.path {
            Some(path) => write_file(path, serde_json::to_string_pretty(&self.stored)?.as_bytes()),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_name_same_key_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");

        let mut ks = KeyStore::open(&path).unwrap();
        let first = ks.get_or_create("key1").unwrap();
        let again = ks.get_or_create("key1").unwrap();
        assert_eq!(first.public_key(), again.public_key());
        assert!(path.exists());

        let mut reopened = KeyStore::open(&path).unwrap();
        let loaded = reopened.get_or_create("key1").unwrap();
        assert_eq!(first.public_key(), loaded.public_key());
        assert_eq!(reopened.names().collect::<Vec<_>>(), vec!["key1"]);
    }

    #[test]
    fn different_names_different_keys() {
        let mut ks = KeyStore::in_memory();
        let a = ks.get_or_create("a").unwrap();
        let b = ks.get_or_create("b").unwrap();
        assert_ne!(a.public_key(), b.public_key());
        assert!(ks.get("c").unwrap().is_none());
    }
}
