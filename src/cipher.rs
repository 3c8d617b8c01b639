//! AES-256 stream modes and the HMAC-teed copy loops.
//!
//! All three modes XOR a keystream into the data, so ciphertext length
//! equals plaintext length. CTR and OFB are their own inverses; CFB needs
//! an encrypting stream on the write path and a decrypting one on the
//! read path. The checksum hasher and the sink observe exactly the same
//! ciphertext byte sequence in the same order on both paths.

use std::fmt;
use std::io::{Read, Write};

use aes::Aes256;
use cipher::{KeyIvInit, StreamCipher};
use hmac::Mac;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::digest::HmacSha256;
use crate::error::{FortifyError, Result};
use crate::keys::SymmetricKey;

/// AES block size; the IV preceding the ciphertext is one block.
pub const IV_LEN: usize = 16;
/// Plaintext/ciphertext read buffering.
pub const READ_BUF_SIZE: usize = 128 * 1024;
/// Output buffering.
pub const WRITE_BUF_SIZE: usize = 256 * 1024;

type Aes256Ctr = ctr::Ctr128BE<Aes256>;
type Aes256Ofb = ofb::Ofb<Aes256>;
type Aes256CfbEnc = cfb_mode::BufEncryptor<Aes256>;
type Aes256CfbDec = cfb_mode::BufDecryptor<Aes256>;

/// String-keyed cipher mode registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CipherModeName {
    #[serde(rename = "aes256-ctr")]
    Aes256Ctr,
    #[serde(rename = "aes256-ofb")]
    Aes256Ofb,
    #[serde(rename = "aes256-cfb")]
    Aes256Cfb,
}

impl fmt::Display for CipherModeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CipherModeName::Aes256Ctr => "aes256-ctr",
            CipherModeName::Aes256Ofb => "aes256-ofb",
            CipherModeName::Aes256Cfb => "aes256-cfb",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for CipherModeName {
    type Err = FortifyError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "aes256-ctr" => Ok(CipherModeName::Aes256Ctr),
            "aes256-ofb" => Ok(CipherModeName::Aes256Ofb),
            "aes256-cfb" => Ok(CipherModeName::Aes256Cfb),
            other => Err(FortifyError::UnknownMode(other.to_string())),
        }
    }
}

/// Which way the CFB stream runs; CTR and OFB ignore this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Encrypt,
    Decrypt,
}

/// One initialised keystream, applied in place chunk by chunk.
pub enum Keystream {
    Ctr(Aes256Ctr),
    Ofb(Aes256Ofb),
    CfbEncrypt(Aes256CfbEnc),
    CfbDecrypt(Aes256CfbDec),
}

impl Keystream {
    pub fn new(
        mode: CipherModeName,
        direction: Direction,
        key: &SymmetricKey,
        iv: &[u8; IV_LEN],
    ) -> Self {
        let key = key.as_array();
        match mode {
            CipherModeName::Aes256Ctr => Self::Ctr(Aes256Ctr::new(key.into(), iv.into())),
            CipherModeName::Aes256Ofb => Self::Ofb(Aes256Ofb::new(key.into(), iv.into())),
            CipherModeName::Aes256Cfb => match direction {
                Direction::Encrypt => {
                    Self::CfbEncrypt(Aes256CfbEnc::new(key.into(), iv.into()))
                }
                Direction::Decrypt => {
                    Self::CfbDecrypt(Aes256CfbDec::new(key.into(), iv.into()))
                }
            },
        }
    }

    fn apply(&mut self, buf: &mut [u8]) {
        match self {
            Self::Ctr(stream) => stream.apply_keystream(buf),
            Self::Ofb(stream) => stream.apply_keystream(buf),
            Self::CfbEncrypt(stream) => stream.encrypt(buf),
            Self::CfbDecrypt(stream) => stream.decrypt(buf),
        }
    }
}

/// Streams plaintext into ciphertext: each chunk is encrypted in place,
/// then fed to the checksum and the sink. Returns the byte count.
pub(crate) fn encrypt_copy<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
    check: &mut HmacSha256,
    stream: &mut Keystream,
) -> Result<u64> {
    let mut buf = vec![0u8; READ_BUF_SIZE];
    let mut count = 0u64;
    loop {
        let n = read_chunk(reader, &mut buf)?;
        if n == 0 {
            break;
        }
        let chunk = &mut buf[..n];
        stream.apply(chunk);
        check.update(chunk);
        writer.write_all(chunk)?;
        count += n as u64;
    }
    buf.zeroize();
    Ok(count)
}

/// Streams ciphertext into plaintext: each chunk is fed to the checksum
/// as read, then decrypted in place and written (when a sink is given).
pub(crate) fn decrypt_copy<R: Read, W: Write>(
    reader: &mut R,
    mut writer: Option<&mut W>,
    check: &mut HmacSha256,
    stream: &mut Keystream,
) -> Result<u64> {
    let mut buf = vec![0u8; READ_BUF_SIZE];
    let mut count = 0u64;
    loop {
        let n = read_chunk(reader, &mut buf)?;
        if n == 0 {
            break;
        }
        let chunk = &mut buf[..n];
        check.update(chunk);
        stream.apply(chunk);
        if let Some(w) = writer.as_mut() {
            w.write_all(chunk)?;
        }
        count += n as u64;
    }
    buf.zeroize();
    Ok(count)
}

fn read_chunk(r: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    loop {
        match r.read(buf) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}
