//! Node key management - loading/creating the signing key

use anyhow::{Context, Result};
use bftkv_core::crypto::Keypair;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use zeroize::Zeroize;

#[derive(Debug, Serialize, Deserialize)]
struct KeyFile {
    /// Human-readable node name
    name: String,
    /// Ed25519 private key (32 bytes)
    #[serde(with = "serde_bytes")]
    private_key: Vec<u8>,
}

pub struct KeyStore {
    path: PathBuf,
    name: Option<String>,
}

impl KeyStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path, name: None }
    }

    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or("unknown")
    }

    pub fn load_or_create(&mut self) -> Result<Keypair> {
        if self.path.exists() {
            self.load()
        } else {
            self.create()
        }
    }

    fn load(&mut self) -> Result<Keypair> {
        let data = fs::read(&self.path)
            .with_context(|| format!("Failed to read key file: {}", self.path.display()))?;

        let mut file: KeyFile =
            serde_json::from_slice(&data).context("Failed to parse key file")?;
        self.name = Some(std::mem::take(&mut file.name));

        if file.private_key.len() != 32 {
            let len = file.private_key.len();
            file.private_key.zeroize();
            anyhow::bail!("Invalid private key length: expected 32 bytes, got {}", len);
        }

        let mut key_bytes = [0u8; 32];
        key_bytes.copy_from_slice(&file.private_key);
        let keypair = Keypair::from_bytes(&key_bytes);
        key_bytes.zeroize();
        file.private_key.zeroize();

        Ok(keypair)
    }

    fn create(&mut self) -> Result<Keypair> {
        let name = self
            .path
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|s| s.to_str())
            .unwrap_or("node")
            .trim_start_matches('.')
            .to_string();
        self.name = Some(name.clone());

        let keypair = Keypair::generate();
        let mut file = KeyFile {
            name,
            private_key: keypair.to_bytes().to_vec(),
        };
        let json = serde_json::to_string_pretty(&file)?;
        file.private_key.zeroize();

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, json)
            .with_context(|| format!("Failed to write key file: {}", self.path.display()))?;

        tracing::info!(path = %self.path.display(), "Created node key");
        Ok(keypair)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_then_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv").join("node.key");

        let created = KeyStore::new(path.clone()).load_or_create().unwrap();
        assert!(path.exists());

        let mut store = KeyStore::new(path);
        let loaded = store.load_or_create().unwrap();
        assert_eq!(loaded.public_key(), created.public_key());
        assert_eq!(store.name(), "kv");
    }

    #[test]
    fn test_rejects_short_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.key");
        fs::write(&path, r#"{"name":"n","private_key":[1,2,3]}"#).unwrap();

        let err = KeyStore::new(path).load_or_create().unwrap_err();
        assert!(err.to_string().contains("expected 32 bytes"));
    }
}
