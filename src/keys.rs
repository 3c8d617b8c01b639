//! Key material: the 32-byte symmetric key protecting a container and the
//! two providers that produce or recover it.
//!
//! The SSS provider splits a fresh random key across share files (or
//! recombines share records back into the key); the RSA provider wraps the
//! key with RSA-OAEP under a public key and unwraps it with the matching
//! private key. Both bind the key to the container metadata through its
//! SHA-512 digest, verified on every recovery.

use std::fmt;
use std::io::Read;
use std::path::PathBuf;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE;
use chrono::{DateTime, Utc};
use rand_chacha::ChaCha20Rng;
use rand_chacha::rand_core::RngCore;
use rand_core::OsRng;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::digest::payload_digest;
use crate::error::{FortifyError, Result};
use crate::files;
use crate::layout::Metadata;
use crate::share::{self, ShareRecord};

/// Symmetric key length in bytes (AES-256).
pub const KEY_LEN: usize = 32;

/// Share-file prefix used when the encrypt path generates and splits a
/// fresh key.
pub const KEY_SHARE_PREFIX: &str = "fortified.key";

/// The data-encryption key. Generated by the encrypter, never derived
/// from user input; zeroed when dropped.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; KEY_LEN]);

impl SymmetricKey {
    pub fn generate(rng: &mut ChaCha20Rng) -> Self {
        let mut key = [0u8; KEY_LEN];
        rng.fill_bytes(&mut key);
        Self(key)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn as_array(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    fn from_vec(mut bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() != KEY_LEN {
            let n = bytes.len();
            bytes.zeroize();
            return Err(FortifyError::KeyDecrypt(format!(
                "unexpected secret key length {n}"
            )));
        }
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&bytes);
        bytes.zeroize();
        Ok(Self(key))
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

/// How the symmetric key is protected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyKind {
    Sss,
    Rsa,
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyKind::Sss => f.write_str("sss"),
            KeyKind::Rsa => f.write_str("rsa"),
        }
    }
}

impl std::str::FromStr for KeyKind {
    type Err = FortifyError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sss" => Ok(KeyKind::Sss),
            "rsa" => Ok(KeyKind::Rsa),
            other => Err(FortifyError::UnknownKeyKind(other.to_string())),
        }
    }
}

/// Metadata block binding a container to its SSS share set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SssMetadata {
    pub timestamp: DateTime<Utc>,
    /// Digest of the symmetric key, as recorded in the share files
    pub digest: String,
    pub parts: u8,
    pub threshold: u8,
}

/// Metadata block binding a container to its wrapped RSA key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RsaMetadata {
    pub timestamp: DateTime<Utc>,
    /// Digest of the plaintext symmetric key
    pub digest: String,
    /// base64url of the OAEP-wrapped key
    pub ciphertext: String,
}

/// Inputs for the SSS provider: share records read from key files (for
/// recovery or key reuse) plus split parameters for fresh keys.
pub struct SssKeySource {
    records: Vec<ShareRecord>,
    parts: u8,
    threshold: u8,
    prefix: String,
    truncate: bool,
}

/// Inputs for the RSA provider: the raw key-file bytes and an optional
/// passphrase override (the terminal is prompted when it is absent).
pub struct RsaKeySource {
    blob: Vec<u8>,
    passphrase: Option<Zeroizing<String>>,
}

/// Unified source of the 32-byte symmetric key.
pub enum KeyProvider {
    Sss(SssKeySource),
    Rsa(RsaKeySource),
}

impl KeyProvider {
    /// Resolves a provider for the encrypt path from the CLI key-file
    /// arguments. SSS accepts zero files (generate a fresh key and split
    /// it) or an existing share set (reuse that key); RSA requires one
    /// public-key file.
    pub fn for_encrypt(
        kind: KeyKind,
        key_paths: &[PathBuf],
        parts: u8,
        threshold: u8,
        truncate: bool,
    ) -> Result<Self> {
        match kind {
            KeyKind::Sss => {
                let records = key_paths
                    .iter()
                    .map(|p| share::read_share_file(p))
                    .collect::<Result<Vec<_>>>()?;
                if records.is_empty() {
                    return Ok(Self::sss_generate(parts, threshold, KEY_SHARE_PREFIX, truncate));
                }
                Ok(Self::sss_from_records(records))
            }
            KeyKind::Rsa => Ok(Self::Rsa(RsaKeySource {
                blob: read_key_file(key_paths)?,
                passphrase: None,
            })),
        }
    }

    /// Builds an SSS provider that generates a fresh key on encrypt and
    /// writes its one-block share files under `prefix`.
    pub fn sss_generate(parts: u8, threshold: u8, prefix: &str, truncate: bool) -> Self {
        Self::Sss(SssKeySource {
            records: Vec::new(),
            parts,
            threshold,
            prefix: prefix.to_string(),
            truncate,
        })
    }

    /// Builds an SSS provider from already-read share records.
    pub fn sss_from_records(records: Vec<ShareRecord>) -> Self {
        Self::Sss(SssKeySource {
            records,
            parts: 0,
            threshold: 0,
            prefix: KEY_SHARE_PREFIX.to_string(),
            truncate: false,
        })
    }

    /// Resolves a provider for the decrypt path from the container
    /// metadata and the CLI key-file arguments.
    pub fn for_decrypt(meta: &Metadata, key_paths: &[PathBuf]) -> Result<Self> {
        match meta.key {
            KeyKind::Sss => {
                let records = key_paths
                    .iter()
                    .map(|p| share::read_share_file(p))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Self::sss_from_records(records))
            }
            KeyKind::Rsa => Ok(Self::Rsa(RsaKeySource {
                blob: read_key_file(key_paths)?,
                passphrase: None,
            })),
        }
    }

    /// Builds an RSA provider directly from key bytes.
    pub fn rsa_from_bytes(blob: Vec<u8>) -> Self {
        Self::Rsa(RsaKeySource {
            blob,
            passphrase: None,
        })
    }

    /// Supplies the private-key passphrase up front instead of prompting
    /// the terminal.
    pub fn with_passphrase(mut self, passphrase: &str) -> Self {
        if let Self::Rsa(source) = &mut self {
            source.passphrase = Some(Zeroizing::new(passphrase.to_string()));
        }
        self
    }

    pub fn kind(&self) -> KeyKind {
        match self {
            Self::Sss(_) => KeyKind::Sss,
            Self::Rsa(_) => KeyKind::Rsa,
        }
    }

    /// Produces the symmetric key and fills the matching metadata block.
    pub fn setup_for_encrypt(
        &self,
        rng: &mut ChaCha20Rng,
        meta: &mut Metadata,
    ) -> Result<SymmetricKey> {
        meta.key = self.kind();
        meta.timestamp = Utc::now();
        match self {
            Self::Sss(source) => source.setup_for_encrypt(rng, meta),
            Self::Rsa(source) => source.setup_for_encrypt(rng, meta),
        }
    }

    /// Recovers the symmetric key described by the metadata, verifying
    /// its digest.
    pub fn setup_for_decrypt(&self, meta: &Metadata) -> Result<SymmetricKey> {
        match self {
            Self::Sss(source) => source.setup_for_decrypt(meta),
            Self::Rsa(source) => source.setup_for_decrypt(meta),
        }
    }
}

impl SssKeySource {
    fn setup_for_encrypt(
        &self,
        rng: &mut ChaCha20Rng,
        meta: &mut Metadata,
    ) -> Result<SymmetricKey> {
        if !self.records.is_empty() {
            // Reuse the key behind an existing share set.
            let key = recover_key(&self.records)?;
            let first = &self.records[0];
            meta.sss = Some(SssMetadata {
                timestamp: first.timestamp,
                digest: first.digest.clone(),
                parts: first.parts,
                threshold: first.threshold,
            });
            debug!(parts = first.parts, threshold = first.threshold, "reusing shared key");
            return Ok(key);
        }

        let key = SymmetricKey::generate(rng);
        let records = share::split_secret_into_files(
            rng,
            key.as_bytes(),
            self.parts,
            self.threshold,
            &self.prefix,
            self.truncate,
        )?;
        let first = &records[0];
        meta.sss = Some(SssMetadata {
            timestamp: first.timestamp,
            digest: first.digest.clone(),
            parts: self.parts,
            threshold: self.threshold,
        });
        debug!(parts = self.parts, threshold = self.threshold, "generated and split key");
        Ok(key)
    }

    fn setup_for_decrypt(&self, meta: &Metadata) -> Result<SymmetricKey> {
        let sss = meta.sss.as_ref().ok_or(FortifyError::MissingMetadata("sss"))?;
        let key = recover_key(&self.records)?;
        let actual = payload_digest(key.as_bytes());
        if actual != sss.digest {
            return Err(FortifyError::DigestMismatch {
                expected: sss.digest.clone(),
                actual,
            });
        }
        Ok(key)
    }
}

fn recover_key(records: &[ShareRecord]) -> Result<SymmetricKey> {
    let combined = share::combine(records)?;
    let key = SymmetricKey::from_vec(combined)?;
    let expected = &records[0].digest;
    let actual = payload_digest(key.as_bytes());
    if actual != *expected {
        return Err(FortifyError::DigestMismatch {
            expected: expected.clone(),
            actual,
        });
    }
    Ok(key)
}

impl RsaKeySource {
    fn setup_for_encrypt(
        &self,
        rng: &mut ChaCha20Rng,
        meta: &mut Metadata,
    ) -> Result<SymmetricKey> {
        let public = parse_public_key(&self.blob)?;
        let key = SymmetricKey::generate(rng);
        let wrapped = public
            .encrypt(&mut OsRng, Oaep::new::<Sha256>(), key.as_bytes())
            .map_err(|e| FortifyError::KeyWrap(e.to_string()))?;
        meta.rsa = Some(RsaMetadata {
            timestamp: Utc::now(),
            digest: payload_digest(key.as_bytes()),
            ciphertext: URL_SAFE.encode(&wrapped),
        });
        Ok(key)
    }

    fn setup_for_decrypt(&self, meta: &Metadata) -> Result<SymmetricKey> {
        let rsa = meta.rsa.as_ref().ok_or(FortifyError::MissingMetadata("rsa"))?;
        let private = self.parse_private_key()?;
        let ciphertext = URL_SAFE.decode(&rsa.ciphertext)?;
        let unwrapped = private
            .decrypt(Oaep::new::<Sha256>(), &ciphertext)
            .map_err(|e| FortifyError::KeyDecrypt(e.to_string()))?;
        let key = SymmetricKey::from_vec(unwrapped)?;
        let actual = payload_digest(key.as_bytes());
        if actual != rsa.digest {
            return Err(FortifyError::DigestMismatch {
                expected: rsa.digest.clone(),
                actual,
            });
        }
        Ok(key)
    }

    fn passphrase(&self) -> Result<Zeroizing<String>> {
        let phrase = match &self.passphrase {
            Some(phrase) => phrase.clone(),
            None => Zeroizing::new(rpassword::prompt_password("Enter passphrase: ")?),
        };
        if phrase.is_empty() {
            return Err(FortifyError::PassphraseRequired);
        }
        Ok(phrase)
    }

    fn parse_private_key(&self) -> Result<RsaPrivateKey> {
        match ssh_key::PrivateKey::from_openssh(&self.blob) {
            Ok(mut key) => {
                if key.is_encrypted() {
                    let passphrase = self.passphrase()?;
                    key = key
                        .decrypt(passphrase.as_bytes())
                        .map_err(|e| FortifyError::KeyDecrypt(e.to_string()))?;
                }
                let keypair = key.key_data().rsa().ok_or_else(|| {
                    FortifyError::UnsupportedKey(format!(
                        "requiring an RSA private key, not {}",
                        key.algorithm()
                    ))
                })?;
                RsaPrivateKey::try_from(keypair)
                    .map_err(|e| FortifyError::UnsupportedKey(e.to_string()))
            }
            Err(_) => {
                let text = key_text(&self.blob)?;
                match pem_label(text) {
                    Some("RSA PRIVATE KEY") => {
                        if text.contains("Proc-Type: 4,ENCRYPTED") {
                            return Err(FortifyError::UnsupportedKey(
                                "legacy encrypted PKCS#1 PEM keys are not supported; \
                                 convert the key to OpenSSH format"
                                    .to_string(),
                            ));
                        }
                        RsaPrivateKey::from_pkcs1_pem(text)
                            .map_err(|e| FortifyError::UnsupportedKey(e.to_string()))
                    }
                    Some(other) => Err(FortifyError::UnsupportedKey(format!(
                        "requiring RSA PRIVATE KEY, not {other}"
                    ))),
                    None => Err(FortifyError::UnsupportedKey(
                        "no private key recognised in key file".to_string(),
                    )),
                }
            }
        }
    }
}

fn read_key_file(key_paths: &[PathBuf]) -> Result<Vec<u8>> {
    let path = key_paths.first().ok_or(FortifyError::MissingKeyArgument)?;
    let (mut file, _, _) = files::open_input(path)?;
    let mut blob = Vec::new();
    file.read_to_end(&mut blob)?;
    Ok(blob)
}

fn key_text(blob: &[u8]) -> Result<&str> {
    std::str::from_utf8(blob).map_err(|_| {
        FortifyError::UnsupportedKey("key file is not valid UTF-8".to_string())
    })
}

/// Extracts the label of the first PEM armor line, if any.
fn pem_label(text: &str) -> Option<&str> {
    text.lines().find_map(|line| {
        let line = line.trim();
        line.strip_prefix("-----BEGIN ")
            .and_then(|rest| rest.strip_suffix("-----"))
    })
}

fn parse_public_key(blob: &[u8]) -> Result<RsaPublicKey> {
    let text = key_text(blob)?;
    if let Ok(key) = ssh_key::PublicKey::from_openssh(text.trim()) {
        let rsa = key.key_data().rsa().ok_or_else(|| {
            FortifyError::UnsupportedKey(format!(
                "requiring an RSA public key, not {}",
                key.algorithm()
            ))
        })?;
        return RsaPublicKey::try_from(rsa)
            .map_err(|e| FortifyError::UnsupportedKey(e.to_string()));
    }
    match pem_label(text) {
        Some("RSA PUBLIC KEY") => RsaPublicKey::from_pkcs1_pem(text)
            .map_err(|e| FortifyError::UnsupportedKey(e.to_string())),
        Some(other) => Err(FortifyError::UnsupportedKey(format!(
            "requiring RSA PUBLIC KEY, not {other}"
        ))),
        None => Err(FortifyError::UnsupportedKey(
            "no public key recognised in key file".to_string(),
        )),
    }
}
