//! Binary layout of the fortified container.
//!
//! All integers are big-endian. The header is, in order: 4-byte magic,
//! 32-byte file checksum, 8-byte data length, 32-byte head checksum,
//! 4-byte metadata length, the metadata JSON, the UTF-8 data-start mark,
//! and an 8-byte nonce. The two checksum fields and the data length are
//! written as zero placeholders first and rewritten in place once the
//! ciphertext length is known.
//!
//! The head checksum authenticates the fixed header fields; the file
//! checksum additionally covers the IV, the ciphertext and the head
//! checksum itself. Nothing is written after the ciphertext, and readers
//! ignore any trailing bytes.

use std::io::{Read, Seek, SeekFrom, Write};

use chrono::{DateTime, Utc};
use hmac::Mac;
use rand_chacha::ChaCha20Rng;
use rand_chacha::rand_core::RngCore;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cipher::CipherModeName;
use crate::digest::{HmacSha256, key_hmac};
use crate::error::{FortifyError, Result};
use crate::keys::{KeyKind, RsaMetadata, SssMetadata, SymmetricKey};

/// Upper three bytes of the magic; the low byte is the format version.
pub const FILE_MAGIC: u32 = 0x40F1ED00;
/// Current format version character.
pub const FILE_VERSION: char = '1';

/// Marks the end of the header. 17 bytes of UTF-8.
pub(crate) const DATA_START_MARK: &[u8] = "🔒fortified🔒".as_bytes();

const CHECKSUM_LEN: usize = 32;
const NONCE_LEN: usize = 8;

/// Container metadata, embedded in the header as JSON. Unknown fields
/// are ignored when parsing; the block matching `key` must be present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub timestamp: DateTime<Utc>,
    pub key: KeyKind,
    pub mode: CipherModeName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sss: Option<SssMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rsa: Option<RsaMetadata>,
}

impl Metadata {
    pub fn new(key: KeyKind, mode: CipherModeName) -> Self {
        Self {
            timestamp: Utc::now(),
            key,
            mode,
            sss: None,
            rsa: None,
        }
    }
}

/// In-memory mirror of the on-disk header.
pub struct FileLayout {
    magic: u32,
    checksum: [u8; CHECKSUM_LEN],
    data_length: u64,
    head_checksum: [u8; CHECKSUM_LEN],
    metadata_raw: Vec<u8>,
    data_start_mark: Vec<u8>,
    nonce: [u8; NONCE_LEN],
    version: char,
    metadata: Metadata,
}

impl FileLayout {
    /// Parses the header fields in declared order. Fails fast when the
    /// magic does not carry the container prefix.
    pub fn read_head(r: &mut impl Read) -> Result<Self> {
        let magic = read_u32(r)?;
        if magic & 0x7FFF_FF00 != FILE_MAGIC {
            return Err(FortifyError::NotFortified);
        }
        let mut checksum = [0u8; CHECKSUM_LEN];
        r.read_exact(&mut checksum)?;
        let data_length = read_u64(r)?;
        let mut head_checksum = [0u8; CHECKSUM_LEN];
        r.read_exact(&mut head_checksum)?;
        let metadata_length = read_u32(r)?;
        let mut metadata_raw = vec![0u8; metadata_length as usize];
        r.read_exact(&mut metadata_raw)?;
        let mut data_start_mark = vec![0u8; DATA_START_MARK.len()];
        r.read_exact(&mut data_start_mark)?;
        let mut nonce = [0u8; NONCE_LEN];
        r.read_exact(&mut nonce)?;

        let version = char::from((magic & 0xFF) as u8);
        let metadata: Metadata = serde_json::from_slice(&metadata_raw)?;
        debug!(%version, data_length, metadata_length, "header parsed");

        Ok(Self {
            magic,
            checksum,
            data_length,
            head_checksum,
            metadata_raw,
            data_start_mark,
            nonce,
            version,
            metadata,
        })
    }

    /// Serialises the metadata and writes the full header with zeroed
    /// checksum and data-length placeholders, plus a random nonce.
    pub fn write_head(
        metadata: &Metadata,
        rng: &mut ChaCha20Rng,
        w: &mut impl Write,
    ) -> Result<Self> {
        let metadata_raw = serde_json::to_vec(metadata)?;
        let mut nonce = [0u8; NONCE_LEN];
        rng.fill_bytes(&mut nonce);

        let layout = Self {
            magic: FILE_MAGIC | FILE_VERSION as u32,
            checksum: [0u8; CHECKSUM_LEN],
            data_length: 0,
            head_checksum: [0u8; CHECKSUM_LEN],
            metadata_raw,
            data_start_mark: DATA_START_MARK.to_vec(),
            nonce,
            version: FILE_VERSION,
            metadata: metadata.clone(),
        };

        w.write_all(&layout.magic.to_be_bytes())?;
        w.write_all(&layout.checksum)?;
        w.write_all(&layout.data_length.to_be_bytes())?;
        w.write_all(&layout.head_checksum)?;
        w.write_all(&(layout.metadata_raw.len() as u32).to_be_bytes())?;
        w.write_all(&layout.metadata_raw)?;
        w.write_all(&layout.data_start_mark)?;
        w.write_all(&layout.nonce)?;
        Ok(layout)
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn data_length(&self) -> u64 {
        self.data_length
    }

    pub fn version(&self) -> char {
        self.version
    }

    pub(crate) fn checksum(&self) -> &[u8] {
        &self.checksum
    }

    pub(crate) fn head_checksum(&self) -> &[u8] {
        &self.head_checksum
    }

    /// Total header size in bytes, through the nonce.
    pub fn head_len(&self) -> u64 {
        (4 + CHECKSUM_LEN + 8 + CHECKSUM_LEN + 4
            + self.metadata_raw.len()
            + self.data_start_mark.len()
            + NONCE_LEN) as u64
    }

    /// HMAC over the fixed header fields, keyed by the symmetric key.
    fn head_mac(&self, key: &SymmetricKey) -> HmacSha256 {
        let mut check = key_hmac(key.as_bytes());
        check.update(&self.magic.to_be_bytes());
        check.update(&self.data_length.to_be_bytes());
        check.update(&(self.metadata_raw.len() as u32).to_be_bytes());
        check.update(&self.metadata_raw);
        check.update(&self.data_start_mark);
        check.update(&self.nonce);
        check
    }

    fn compute_head_checksum(&self, key: &SymmetricKey) -> [u8; CHECKSUM_LEN] {
        self.head_mac(key).finalize().into_bytes().into()
    }

    /// Recomputes the head checksum from the recovered key and compares
    /// it against the stored one.
    pub fn verify_head(&self, key: &SymmetricKey) -> Result<()> {
        self.head_mac(key)
            .verify_slice(&self.head_checksum)
            .map_err(|_| FortifyError::HeadChecksum)
    }

    /// Completes the write protocol after the ciphertext: fixes the data
    /// length, derives both checksums and rewrites the placeholder
    /// fields in place. `file_check` must already have been fed the IV
    /// and the ciphertext, in order.
    pub fn finalize(
        &mut self,
        out: &mut (impl Write + Seek),
        key: &SymmetricKey,
        mut file_check: HmacSha256,
        data_length: u64,
    ) -> Result<()> {
        self.data_length = data_length;
        self.head_checksum = self.compute_head_checksum(key);
        file_check.update(&self.head_checksum);
        self.checksum = file_check.finalize().into_bytes().into();

        out.seek(SeekFrom::Start(4))?;
        out.write_all(&self.checksum)?;
        out.write_all(&self.data_length.to_be_bytes())?;
        out.write_all(&self.head_checksum)?;
        debug!(data_length, "checksums rewritten");
        Ok(())
    }
}

fn read_u32(r: &mut impl Read) -> Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

fn read_u64(r: &mut impl Read) -> Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_be_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample_metadata() -> Metadata {
        Metadata::new(KeyKind::Sss, CipherModeName::Aes256Ctr)
    }

    fn test_key() -> SymmetricKey {
        SymmetricKey::generate(&mut crate::secure_rng())
    }

    #[test]
    fn mark_is_seventeen_utf8_bytes() {
        assert_eq!(DATA_START_MARK.len(), 17);
        assert_eq!(std::str::from_utf8(DATA_START_MARK).unwrap(), "🔒fortified🔒");
    }

    #[test]
    fn head_round_trip_with_placeholders() {
        let meta = sample_metadata();
        let mut buf = Vec::new();
        let written = FileLayout::write_head(&meta, &mut crate::secure_rng(), &mut buf).unwrap();
        assert_eq!(buf.len() as u64, written.head_len());
        assert_eq!(&buf[..4], &0x40F1ED31u32.to_be_bytes());
        // Placeholders are all zero until finalised.
        assert!(buf[4..76].iter().all(|&b| b == 0));

        let parsed = FileLayout::read_head(&mut Cursor::new(&buf)).unwrap();
        assert_eq!(parsed.version(), '1');
        assert_eq!(parsed.data_length(), 0);
        assert_eq!(parsed.metadata(), &meta);
    }

    #[test]
    fn finalize_rewrites_in_place_and_verifies() {
        let meta = sample_metadata();
        let key = test_key();
        let mut sink = Cursor::new(Vec::new());
        let mut layout =
            FileLayout::write_head(&meta, &mut crate::secure_rng(), &mut sink).unwrap();

        // Pretend a 5-byte ciphertext body was streamed.
        let iv = [0u8; 16];
        let body = b"hello";
        sink.write_all(&iv).unwrap();
        sink.write_all(body).unwrap();
        let mut check = key_hmac(key.as_bytes());
        check.update(&iv);
        check.update(body);
        layout.finalize(&mut sink, &key, check, body.len() as u64).unwrap();

        let bytes = sink.into_inner();
        let parsed = FileLayout::read_head(&mut Cursor::new(&bytes)).unwrap();
        assert_eq!(parsed.data_length(), 5);
        parsed.verify_head(&key).unwrap();

        let wrong = test_key();
        assert!(matches!(
            parsed.verify_head(&wrong),
            Err(FortifyError::HeadChecksum)
        ));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut buf = Vec::new();
        FileLayout::write_head(&sample_metadata(), &mut crate::secure_rng(), &mut buf).unwrap();
        buf[0] ^= 0x01;
        assert!(matches!(
            FileLayout::read_head(&mut Cursor::new(&buf)),
            Err(FortifyError::NotFortified)
        ));
    }

    #[test]
    fn header_tamper_breaks_head_checksum() {
        let meta = sample_metadata();
        let key = test_key();
        let mut sink = Cursor::new(Vec::new());
        let mut layout =
            FileLayout::write_head(&meta, &mut crate::secure_rng(), &mut sink).unwrap();
        let check = key_hmac(key.as_bytes());
        layout.finalize(&mut sink, &key, check, 0).unwrap();
        let bytes = sink.into_inner();

        // Flip one bit in the nonce (the last header field).
        let mut tampered = bytes.clone();
        let nonce_offset = tampered.len() - 1;
        tampered[nonce_offset] ^= 0x80;
        let parsed = FileLayout::read_head(&mut Cursor::new(&tampered)).unwrap();
        assert!(matches!(
            parsed.verify_head(&key),
            Err(FortifyError::HeadChecksum)
        ));
    }

    #[test]
    fn metadata_json_ignores_unknown_fields_and_requires_variant() {
        let mut value = serde_json::to_value(sample_metadata()).unwrap();
        value["extra"] = serde_json::json!({"forward": "compatible"});
        let parsed: Metadata = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.key, KeyKind::Sss);
        assert!(parsed.sss.is_none());
    }
}
