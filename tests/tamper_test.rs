use std::fs;
use std::io::BufReader;
use std::path::PathBuf;

use tempfile::TempDir;

use fortify::cipher::CipherModeName;
use fortify::keys::KeyProvider;
use fortify::{FileLayout, Fortifier, FortifyError, decrypt_file};

struct Fixture {
    dir: TempDir,
    container: PathBuf,
    shares: Vec<PathBuf>,
    /// Offset of the first ciphertext byte (header + IV).
    body_offset: u64,
}

fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("input.bin");
    fs::write(&input, b"hello").unwrap();
    let container = dir.path().join("container.fortified");
    let prefix = dir.path().join("key").to_string_lossy().into_owned();

    let provider = KeyProvider::sss_generate(2, 2, &prefix, false);
    Fortifier::new(provider, CipherModeName::Aes256Ctr)
        .encrypt_file(&input, &container, false)
        .unwrap();

    let file = fs::File::open(&container).unwrap();
    let mut reader = BufReader::new(file);
    let layout = FileLayout::read_head(&mut reader).unwrap();
    let body_offset = layout.head_len() + 16;

    let shares = vec![
        dir.path().join("key1of2.json"),
        dir.path().join("key2of2.json"),
    ];
    Fixture {
        dir,
        container,
        shares,
        body_offset,
    }
}

fn flip_bit(fx: &Fixture, offset: u64, mask: u8) -> PathBuf {
    let mut raw = fs::read(&fx.container).unwrap();
    raw[offset as usize] ^= mask;
    let tampered = fx.dir.path().join("tampered.fortified");
    fs::write(&tampered, &raw).unwrap();
    tampered
}

fn decrypt_tampered(fx: &Fixture, tampered: &PathBuf) -> (FortifyError, PathBuf) {
    let out = fx.dir.path().join("tampered.out");
    let _ = fs::remove_file(&out);
    let err = decrypt_file(tampered, Some(out.as_path()), true, &fx.shares).unwrap_err();
    (err, out)
}

#[test]
fn tampered_ciphertext_fails_file_checksum_without_plaintext() {
    let fx = fixture();
    let tampered = flip_bit(&fx, fx.body_offset, 0x01);
    let (err, out) = decrypt_tampered(&fx, &tampered);
    assert!(matches!(err, FortifyError::FileChecksum), "{err}");
    // Nothing of the plaintext may reach the output.
    assert_eq!(fs::metadata(&out).unwrap().len(), 0);
}

#[test]
fn tampered_iv_fails_file_checksum() {
    let fx = fixture();
    let tampered = flip_bit(&fx, fx.body_offset - 1, 0x80);
    let (err, _) = decrypt_tampered(&fx, &tampered);
    assert!(matches!(err, FortifyError::FileChecksum), "{err}");
}

#[test]
fn tampered_magic_is_not_a_fortified_file() {
    let fx = fixture();
    let tampered = flip_bit(&fx, 0, 0x01);
    let (err, _) = decrypt_tampered(&fx, &tampered);
    assert!(matches!(err, FortifyError::NotFortified), "{err}");
}

#[test]
fn tampered_file_checksum_field_is_detected() {
    let fx = fixture();
    // Offset 4: first byte of the stored file checksum.
    let tampered = flip_bit(&fx, 4, 0x01);
    let (err, _) = decrypt_tampered(&fx, &tampered);
    assert!(matches!(err, FortifyError::FileChecksum), "{err}");
}

#[test]
fn tampered_data_length_fails_head_checksum() {
    let fx = fixture();
    // Offset 36: high byte of the 8-byte data length.
    let tampered = flip_bit(&fx, 36, 0x01);
    let (err, _) = decrypt_tampered(&fx, &tampered);
    assert!(matches!(err, FortifyError::HeadChecksum), "{err}");
}

#[test]
fn tampered_head_checksum_field_is_detected() {
    let fx = fixture();
    // Offset 44: first byte of the stored head checksum.
    let tampered = flip_bit(&fx, 44, 0x01);
    let (err, _) = decrypt_tampered(&fx, &tampered);
    assert!(matches!(err, FortifyError::HeadChecksum), "{err}");
}

#[test]
fn tampered_nonce_fails_head_checksum() {
    let fx = fixture();
    // The nonce is the last 8 header bytes.
    let tampered = flip_bit(&fx, fx.body_offset - 16 - 1, 0x01);
    let (err, _) = decrypt_tampered(&fx, &tampered);
    assert!(matches!(err, FortifyError::HeadChecksum), "{err}");
}

#[test]
fn truncated_body_fails_length_check() {
    let fx = fixture();
    let mut raw = fs::read(&fx.container).unwrap();
    raw.truncate(raw.len() - 2);
    let truncated = fx.dir.path().join("short.fortified");
    fs::write(&truncated, &raw).unwrap();
    let (err, _) = decrypt_tampered(&fx, &truncated);
    assert!(
        matches!(err, FortifyError::DataLength { expected: 5, actual: 3 }),
        "{err}"
    );
}

#[test]
fn share_from_another_run_is_a_digest_mismatch() {
    // Pair one genuine share with a share from an independent run: the
    // combined key cannot match the recorded digest.
    let fx = fixture();
    let other = fixture();
    let mixed = vec![fx.shares[0].clone(), other.shares[1].clone()];
    let out = fx.dir.path().join("mixed.out");
    let err = decrypt_file(&fx.container, Some(out.as_path()), false, &mixed).unwrap_err();
    assert!(matches!(err, FortifyError::DigestMismatch { .. }), "{err}");
    // The key never verified, so no plaintext was produced.
    assert_eq!(fs::metadata(&out).unwrap().len(), 0);
}

#[test]
fn forcing_the_wrong_mode_is_rejected() {
    let fx = fixture();
    let file = fs::File::open(&fx.container).unwrap();
    let mut reader = BufReader::new(file);
    let layout = FileLayout::read_head(&mut reader).unwrap();

    let provider = KeyProvider::for_decrypt(layout.metadata(), &fx.shares).unwrap();
    // The container says aes256-ctr; force a cfb pipeline.
    let mut fortifier = Fortifier::new(provider, CipherModeName::Aes256Cfb);
    let err = fortifier
        .decrypt_stream(&mut reader, None::<&mut Vec<u8>>, &layout)
        .unwrap_err();
    match err {
        FortifyError::RequiresMode(name) => assert_eq!(name, "aes256-ctr"),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn metadata_bit_flip_is_detected() {
    let fx = fixture();
    // Somewhere inside the metadata JSON (after the fixed 80-byte prefix).
    let tampered = flip_bit(&fx, 90, 0x01);
    let out = fx.dir.path().join("meta.out");
    let err = decrypt_file(&tampered, Some(out.as_path()), true, &fx.shares).unwrap_err();
    // Depending on the flipped character this surfaces as JSON breakage,
    // a key-digest mismatch or the head checksum; never plaintext.
    assert!(
        matches!(
            err,
            FortifyError::Json(_)
                | FortifyError::HeadChecksum
                | FortifyError::DigestMismatch { .. }
        ),
        "{err}"
    );
}
