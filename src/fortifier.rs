//! Orchestrates one encrypt or decrypt run over a fortified container.
//!
//! Encrypt: setup key -> write header placeholders -> write IV -> stream
//! ciphertext through the checksum tee -> flush and sync -> rewrite the
//! checksum fields. Decrypt: parse header -> recover key -> verify head
//! checksum -> stream plaintext out -> verify data length and file
//! checksum. The sync before the placeholder rewrite is part of the
//! protocol, not an optimisation.

use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use hmac::Mac;
use rand_chacha::ChaCha20Rng;
use rand_chacha::rand_core::RngCore;
use tracing::info;

use crate::cipher::{
    self, CipherModeName, Direction, IV_LEN, Keystream, READ_BUF_SIZE, WRITE_BUF_SIZE,
};
use crate::digest::key_hmac;
use crate::error::{FortifyError, Result};
use crate::files;
use crate::keys::KeyProvider;
use crate::layout::{FileLayout, Metadata};

/// Owns the metadata, key provider and RNG of a single run.
pub struct Fortifier {
    meta: Metadata,
    provider: KeyProvider,
    mode: CipherModeName,
    rng: ChaCha20Rng,
}

impl Fortifier {
    pub fn new(provider: KeyProvider, mode: CipherModeName) -> Self {
        Self {
            meta: Metadata::new(provider.kind(), mode),
            provider,
            mode,
            rng: crate::secure_rng(),
        }
    }

    /// Encrypts `input` into a fortified container at `output`.
    pub fn encrypt_file(&mut self, input: &Path, output: &Path, truncate: bool) -> Result<()> {
        let (in_file, size, in_path) = files::open_input(input)?;
        let (out_file, out_path) = files::open_output(output, truncate)?;
        info!(
            input = %in_path.display(),
            output = %out_path.display(),
            key = %self.meta.key,
            mode = %self.mode,
            bytes = size,
            "encrypting"
        );

        let key = self.provider.setup_for_encrypt(&mut self.rng, &mut self.meta)?;
        let mut reader = BufReader::with_capacity(READ_BUF_SIZE, in_file);
        let mut writer = BufWriter::with_capacity(WRITE_BUF_SIZE, out_file);
        let mut layout = FileLayout::write_head(&self.meta, &mut self.rng, &mut writer)?;

        let mut iv = [0u8; IV_LEN];
        self.rng.fill_bytes(&mut iv);
        writer.write_all(&iv)?;

        let mut check = key_hmac(key.as_bytes());
        check.update(&iv);
        let mut stream = Keystream::new(self.mode, Direction::Encrypt, &key, &iv);
        let count = cipher::encrypt_copy(&mut reader, &mut writer, &mut check, &mut stream)?;

        let mut out_file = writer
            .into_inner()
            .map_err(|e| FortifyError::Io(e.into_error()))?;
        out_file.sync_all()?;
        layout.finalize(&mut out_file, &key, check, count)?;
        out_file.sync_all()?;
        info!(bytes = count, "encrypted");
        Ok(())
    }

    /// Decrypts an already-parsed container body. `reader` must be
    /// positioned right after the header; plaintext goes to `writer`
    /// when one is given, so a `None` run only verifies integrity.
    /// Returns the plaintext byte count.
    pub fn decrypt_stream<R: Read, W: Write>(
        &mut self,
        reader: &mut R,
        writer: Option<&mut W>,
        layout: &FileLayout,
    ) -> Result<u64> {
        let key = self.provider.setup_for_decrypt(layout.metadata())?;
        layout.verify_head(&key)?;
        if layout.metadata().mode != self.mode {
            return Err(FortifyError::RequiresMode(layout.metadata().mode.to_string()));
        }

        let mut iv = [0u8; IV_LEN];
        reader.read_exact(&mut iv)?;
        let mut check = key_hmac(key.as_bytes());
        check.update(&iv);
        let mut stream = Keystream::new(self.mode, Direction::Decrypt, &key, &iv);

        // Exactly data_length ciphertext bytes; trailing bytes are ignored.
        let mut body = reader.take(layout.data_length());
        let count = cipher::decrypt_copy(&mut body, writer, &mut check, &mut stream)?;
        if count != layout.data_length() {
            return Err(FortifyError::DataLength {
                expected: layout.data_length(),
                actual: count,
            });
        }

        check.update(layout.head_checksum());
        check
            .verify_slice(layout.checksum())
            .map_err(|_| FortifyError::FileChecksum)?;
        Ok(count)
    }
}

/// Decrypts the container at `input`, resolving the key provider from
/// its metadata and the given key-file paths. With `output` absent the
/// run verifies integrity without writing plaintext.
pub fn decrypt_file(
    input: &Path,
    output: Option<&Path>,
    truncate: bool,
    key_paths: &[PathBuf],
) -> Result<()> {
    let (in_file, _, in_path) = files::open_input(input)?;
    let mut reader = BufReader::with_capacity(READ_BUF_SIZE, in_file);
    let layout = FileLayout::read_head(&mut reader)?;
    let meta = layout.metadata();
    info!(
        input = %in_path.display(),
        key = %meta.key,
        mode = %meta.mode,
        bytes = layout.data_length(),
        "decrypting"
    );

    let provider = KeyProvider::for_decrypt(meta, key_paths)?;
    let mut fortifier = Fortifier::new(provider, meta.mode);

    match output {
        Some(path) => {
            let (out_file, out_path) = files::open_output(path, truncate)?;
            let mut writer = BufWriter::with_capacity(WRITE_BUF_SIZE, out_file);
            match fortifier.decrypt_stream(&mut reader, Some(&mut writer), &layout) {
                Ok(count) => {
                    let out_file = writer
                        .into_inner()
                        .map_err(|e| FortifyError::Io(e.into_error()))?;
                    out_file.sync_all()?;
                    info!(output = %out_path.display(), bytes = count, "decrypted");
                    Ok(())
                }
                Err(err) => {
                    // Failed runs must not leak buffered plaintext on drop.
                    let (out_file, _discarded) = writer.into_parts();
                    drop(out_file);
                    Err(err)
                }
            }
        }
        None => {
            let count =
                fortifier.decrypt_stream(&mut reader, None::<&mut std::io::Sink>, &layout)?;
            info!(bytes = count, "verified");
            Ok(())
        }
    }
}
