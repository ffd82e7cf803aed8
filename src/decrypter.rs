// src/decrypter.rs

//! Credential bundles and their decryption.
//!
//! A [`Credentials`] blob is an AES-256-GCM encrypted JSON [`CredData`]
//! whose content key is wrapped with RSA-OAEP (SHA-256) for one public key.
//! The matching private key lives only inside a [`Decrypter`]; it is never
//! serialized, and a forked child only ever receives the decrypted
//! third-party map (see [`CredentialAccess`]).

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::OnceLock;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

use crate::task::Substitutor;
use crate::task::Variables;

const MAGIC: &[u8; 4] = b"TLCR";
const VERSION: u8 = 1;
const NONCE_LEN: usize = 12;
const CONTENT_KEY_LEN: usize = 32;

#[derive(Error, Debug)]
pub enum DecryptError {
    #[error("no credentials were provided for this task")]
    NoCredentials,

    #[error("malformed credentials blob: {0}")]
    Malformed(String),

    #[error("credentials do not match the node key")]
    KeyMismatch,

    #[error("credential encryption failed: {0}")]
    Encrypt(String),

    #[error("invalid key: {0}")]
    Key(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Decrypted credential content.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CredData {
    pub login: String,
    #[serde(default)]
    pub password: String,
    /// Third-party secrets reachable as `$credentials_<KEY>`.
    #[serde(default)]
    pub third_party: BTreeMap<String, String>,
}

/// Opaque encrypted credential bundle.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    blob: Vec<u8>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("len", &self.blob.len())
            .finish()
    }
}

impl Credentials {
    pub fn create(data: &CredData, public_key: &RsaPublicKey) -> Result<Self, DecryptError> {
        let plain = serde_json::to_vec(data).map_err(|e| DecryptError::Encrypt(e.to_string()))?;

        let mut content_key = [0u8; CONTENT_KEY_LEN];
        OsRng.fill_bytes(&mut content_key);
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let cipher = Aes256Gcm::new_from_slice(&content_key)
            .map_err(|e| DecryptError::Encrypt(e.to_string()))?;
        let sealed = cipher
            .encrypt(Nonce::from_slice(&nonce), plain.as_ref())
            .map_err(|e| DecryptError::Encrypt(e.to_string()))?;
        let wrapped = public_key
            .encrypt(&mut OsRng, Oaep::new::<Sha256>(), &content_key)
            .map_err(|e| DecryptError::Encrypt(e.to_string()))?;

        let wrapped_len = u16::try_from(wrapped.len())
            .map_err(|_| DecryptError::Encrypt("wrapped key too large".into()))?;
        let mut blob = Vec::with_capacity(7 + wrapped.len() + NONCE_LEN + sealed.len());
        blob.extend_from_slice(MAGIC);
        blob.push(VERSION);
        blob.extend_from_slice(&wrapped_len.to_be_bytes());
        blob.extend_from_slice(&wrapped);
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&sealed);
        Ok(Self { blob })
    }

    pub fn from_bytes(blob: Vec<u8>) -> Self {
        Self { blob }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.blob
    }

    pub fn read_from(path: &Path) -> Result<Self, DecryptError> {
        Ok(Self::from_bytes(std::fs::read(path)?))
    }

    fn parts(&self) -> Result<(&[u8], &[u8], &[u8]), DecryptError> {
        let b = &self.blob;
        if b.len() < 7 || &b[..4] != MAGIC {
            return Err(DecryptError::Malformed("bad header".into()));
        }
        if b[4] != VERSION {
            return Err(DecryptError::Malformed(format!("unsupported version {}", b[4])));
        }
        let wrapped_len = u16::from_be_bytes([b[5], b[6]]) as usize;
        let rest = &b[7..];
        if rest.len() < wrapped_len + NONCE_LEN {
            return Err(DecryptError::Malformed("truncated".into()));
        }
        let (wrapped, rest) = rest.split_at(wrapped_len);
        let (nonce, sealed) = rest.split_at(NONCE_LEN);
        Ok((wrapped, nonce, sealed))
    }
}

/// Decrypt `credentials` with `private_key`.
pub fn decrypt(credentials: &Credentials, private_key: &RsaPrivateKey) -> Result<CredData, DecryptError> {
    let (wrapped, nonce, sealed) = credentials.parts()?;
    let content_key = private_key
        .decrypt(Oaep::new::<Sha256>(), wrapped)
        .map_err(|_| DecryptError::KeyMismatch)?;
    let cipher = Aes256Gcm::new_from_slice(&content_key).map_err(|_| DecryptError::KeyMismatch)?;
    let plain = cipher
        .decrypt(Nonce::from_slice(nonce), sealed)
        .map_err(|_| DecryptError::Malformed("authentication failed".into()))?;
    serde_json::from_slice(&plain).map_err(|e| DecryptError::Malformed(e.to_string()))
}

/// What a task may see of its credentials.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", content = "value", rename_all = "snake_case")]
pub enum CredentialAccess {
    /// No credentials were attached; touching `credentials` is an error.
    #[default]
    Absent,
    Available(BTreeMap<String, String>),
    /// Decryption failed with this message.
    Unavailable(String),
}

impl CredentialAccess {
    pub fn map(&self) -> Option<&BTreeMap<String, String>> {
        match self {
            CredentialAccess::Available(map) => Some(map),
            _ => None,
        }
    }

    /// Error message for a script that dereferences unavailable credentials.
    pub fn denial(&self) -> Option<String> {
        match self {
            CredentialAccess::Available(_) => None,
            CredentialAccess::Absent => Some(DecryptError::NoCredentials.to_string()),
            CredentialAccess::Unavailable(msg) => Some(msg.clone()),
        }
    }
}

/// Private key plus the encrypted bundle of one task.
pub struct Decrypter {
    private_key: RsaPrivateKey,
    credentials: Option<Credentials>,
    decrypted: OnceLock<CredData>,
}

impl fmt::Debug for Decrypter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Decrypter")
            .field("credentials", &self.credentials)
            .field("decrypted", &self.decrypted.get().is_some())
            .finish_non_exhaustive()
    }
}

impl Decrypter {
    pub fn new(private_key: RsaPrivateKey) -> Self {
        Self {
            private_key,
            credentials: None,
            decrypted: OnceLock::new(),
        }
    }

    /// Load a PKCS#8 PEM private key.
    pub fn from_pem_file(path: &Path) -> Result<Self, DecryptError> {
        let pem = std::fs::read_to_string(path)?;
        let key = RsaPrivateKey::from_pkcs8_pem(&pem).map_err(|e| DecryptError::Key(e.to_string()))?;
        Ok(Self::new(key))
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self.decrypted = OnceLock::new();
        self
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    /// Decrypt once; later calls return the cached content.
    pub fn decrypt(&self) -> Result<&CredData, DecryptError> {
        if let Some(data) = self.decrypted.get() {
            return Ok(data);
        }
        let credentials = self.credentials.as_ref().ok_or(DecryptError::NoCredentials)?;
        let data = decrypt(credentials, &self.private_key)?;
        Ok(self.decrypted.get_or_init(|| data))
    }

    pub fn third_party_credentials(&self) -> CredentialAccess {
        if !self.has_credentials() {
            return CredentialAccess::Absent;
        }
        match self.decrypt() {
            Ok(data) => CredentialAccess::Available(data.third_party.clone()),
            Err(e) => CredentialAccess::Unavailable(e.to_string()),
        }
    }

    /// Replace credential placeholders, but only once decryption succeeded.
    pub fn substitute(&self, arg: &str) -> String {
        let empty = Variables::new();
        Substitutor::new(&empty)
            .with_credentials(self.decrypted.get().map(|d| &d.third_party))
            .substitute(arg)
    }
}

pub fn load_public_key(path: &Path) -> Result<RsaPublicKey, DecryptError> {
    let pem = std::fs::read_to_string(path)?;
    RsaPublicKey::from_public_key_pem(&pem).map_err(|e| DecryptError::Key(e.to_string()))
}
