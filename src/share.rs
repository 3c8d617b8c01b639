//! Share engine: splitting arbitrary-length payloads into line-delimited
//! JSON share files in fixed blocks, and recombining them.
//!
//! A share file holds one JSON record per block, records separated by a
//! blank line (`"\n\n"`). All records of one file carry the same `part`,
//! `parts` and `threshold`; `block` increases strictly from 1. The digest
//! of every record fingerprints the pre-split secret of that block, so
//! recombination can reject wrong or mismatched share sets.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE;
use chrono::{DateTime, Utc};
use rand_chacha::ChaCha20Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use zeroize::Zeroize;

use crate::digest::payload_digest;
use crate::error::{FortifyError, Result};
use crate::files;
use crate::shamir;

/// Secrets are split in blocks of this many bytes.
pub const BLOCK_SIZE: usize = 512 * 1024;
/// Upper bound on one serialised share line when parsing share files.
pub const MAX_LINE: usize = 768 * 1024;

/// One share of one block, as serialised into a share file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShareRecord {
    /// base64url of the raw share bytes for this block
    pub payload: String,
    /// 1-based block index within the split payload
    pub block: u64,
    /// Total block count of the payload
    pub blocks: u64,
    /// 1-based index of this share within its set
    pub part: u32,
    /// Total share count
    pub parts: u8,
    /// Minimum share count for recovery
    pub threshold: u8,
    /// base64url SHA-512 of the pre-split secret of this block
    pub digest: String,
    pub timestamp: DateTime<Utc>,
}

/// Splits one secret block into `parts` records. `block`/`blocks` are
/// left zero; the caller assigns them when it knows the block position.
pub fn split(
    rng: &mut ChaCha20Rng,
    secret: &[u8],
    parts: u8,
    threshold: u8,
) -> Result<Vec<ShareRecord>> {
    let shares = shamir::split(rng, secret, parts, threshold)?;
    let digest = payload_digest(secret);
    let timestamp = Utc::now();
    Ok(shares
        .into_iter()
        .enumerate()
        .map(|(index, bytes)| ShareRecord {
            payload: URL_SAFE.encode(&bytes),
            block: 0,
            blocks: 0,
            part: (index + 1) as u32,
            parts,
            threshold,
            digest: digest.clone(),
            timestamp,
        })
        .collect())
}

/// Recombines a set of records belonging to the same block.
///
/// All records must agree on `digest`; the recovered secret is returned
/// without further checks (callers compare its digest where the record
/// set is untrusted).
pub fn combine(records: &[ShareRecord]) -> Result<Vec<u8>> {
    if records.is_empty() {
        return Err(FortifyError::InsufficientShares { needed: 1, got: 0 });
    }
    let expect = &records[0].digest;
    let mut points = Vec::with_capacity(records.len());
    for record in records {
        if record.digest != *expect {
            return Err(FortifyError::DigestMismatch {
                expected: expect.clone(),
                actual: record.digest.clone(),
            });
        }
        let index =
            u8::try_from(record.part).map_err(|_| FortifyError::InvalidShareIndex(record.part))?;
        points.push((index, URL_SAFE.decode(&record.payload)?));
    }
    let secret = shamir::combine(&points)?;
    for (_, mut payload) in points {
        payload.zeroize();
    }
    Ok(secret)
}

/// Writes share records into `{prefix}{part}of{parts}.json` files, one
/// operation at a time. The file map lives for the duration of one split
/// or random-generation run; handles are reused across blocks and all of
/// them are released when the writer is dropped.
pub struct ShareWriter {
    prefix: String,
    truncate: bool,
    handles: Mutex<HashMap<PathBuf, File>>,
}

impl ShareWriter {
    pub fn new(prefix: &str, truncate: bool) -> Self {
        Self {
            prefix: prefix.to_string(),
            truncate,
            handles: Mutex::new(HashMap::new()),
        }
    }

    fn record_path(&self, record: &ShareRecord) -> Result<PathBuf> {
        let name = format!("{}{}of{}.json", self.prefix, record.part, record.parts);
        Ok(std::path::absolute(PathBuf::from(name))?)
    }

    /// Appends one block's records, each to its own file, in parallel.
    /// The first block truncates existing files (or refuses non-empty
    /// ones); later blocks are preceded by the `"\n\n"` separator.
    pub fn append_block(
        &self,
        records: &mut [ShareRecord],
        block: u64,
        blocks: u64,
    ) -> Result<()> {
        for record in records.iter_mut() {
            record.block = block;
            record.blocks = blocks;
        }

        let mut guard = self.handles.lock().expect("share file map poisoned");
        for record in records.iter() {
            let path = self.record_path(record)?;
            if !guard.contains_key(&path) {
                let (file, path) = files::open_append(&path)?;
                if block == 1 && file.metadata()?.len() > 0 {
                    if !self.truncate {
                        return Err(FortifyError::OutputNotEmpty(path));
                    }
                    file.set_len(0)?;
                }
                guard.insert(path, file);
            }
        }

        let mut jobs = Vec::with_capacity(records.len());
        for record in records.iter() {
            let path = self.record_path(record)?;
            let file = guard.get(&path).expect("handle opened above");
            let mut line = Vec::new();
            if block > 1 {
                line.extend_from_slice(b"\n\n");
            }
            line.extend_from_slice(&serde_json::to_vec(record)?);
            jobs.push((file, line));
        }

        jobs.into_par_iter().try_for_each(|(file, line)| {
            let mut sink: &File = file;
            sink.write_all(&line).map_err(FortifyError::from)
        })
    }

    /// Flushes every open share file to disk.
    pub fn finish(&self) -> Result<()> {
        let guard = self.handles.lock().expect("share file map poisoned");
        for file in guard.values() {
            file.sync_all()?;
        }
        Ok(())
    }
}

/// Splits a secret already held in memory into one-block share files.
/// Returns the written records (their digest doubles as the secret's
/// fingerprint for callers that bind it into other metadata).
pub fn split_secret_into_files(
    rng: &mut ChaCha20Rng,
    secret: &[u8],
    parts: u8,
    threshold: u8,
    prefix: &str,
    truncate: bool,
) -> Result<Vec<ShareRecord>> {
    let mut records = split(rng, secret, parts, threshold)?;
    let writer = ShareWriter::new(prefix, truncate);
    writer.append_block(&mut records, 1, 1)?;
    writer.finish()?;
    Ok(records)
}

/// Streams `input` in `BLOCK_SIZE` chunks and appends each chunk's shares
/// to the `parts` share files. Reading stops on the first short block.
pub fn split_into_files(
    rng: &mut ChaCha20Rng,
    input: &Path,
    parts: u8,
    threshold: u8,
    prefix: &str,
    truncate: bool,
) -> Result<()> {
    let (mut file, size, path) = files::open_input(input)?;
    let blocks = size.div_ceil(BLOCK_SIZE as u64);
    info!(input = %path.display(), parts, threshold, blocks, "splitting into share files");

    let writer = ShareWriter::new(prefix, truncate);
    let mut buffer = vec![0u8; BLOCK_SIZE];
    let mut block = 0u64;
    loop {
        let n = read_block(&mut file, &mut buffer)?;
        if n == 0 {
            break;
        }
        block += 1;
        let mut records = split(rng, &buffer[..n], parts, threshold)?;
        writer.append_block(&mut records, block, blocks)?;
        debug!(block, blocks, bytes = n, "block split");
        if n < BLOCK_SIZE {
            break;
        }
    }
    writer.finish()?;
    buffer.zeroize();
    Ok(())
}

/// Fills `buf` from `r`, treating end-of-file as the only short read.
fn read_block(r: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Line reader over one share file with a hard per-line size limit.
/// Empty lines (the block separators) are skipped.
struct LineScanner {
    reader: BufReader<File>,
    buf: Vec<u8>,
}

impl LineScanner {
    fn new(file: File) -> Self {
        Self {
            reader: BufReader::new(file),
            buf: Vec::new(),
        }
    }

    fn next_record_line(&mut self) -> Result<Option<&[u8]>> {
        loop {
            self.buf.clear();
            let n = (&mut self.reader)
                .take((MAX_LINE + 1) as u64)
                .read_until(b'\n', &mut self.buf)?;
            if n == 0 {
                return Ok(None);
            }
            while matches!(self.buf.last(), Some(b'\n' | b'\r')) {
                self.buf.pop();
            }
            if self.buf.len() > MAX_LINE {
                return Err(FortifyError::LineTooLong { limit: MAX_LINE });
            }
            if self.buf.is_empty() {
                continue;
            }
            return Ok(Some(&self.buf));
        }
    }
}

/// Reads the first record of a share file (the shape key-share files
/// have: one block, one line).
pub fn read_share_file(path: &Path) -> Result<ShareRecord> {
    let (file, _, path) = files::open_input(path)?;
    let mut scanner = LineScanner::new(file);
    match scanner.next_record_line()? {
        Some(line) => Ok(serde_json::from_slice(line)?),
        None => Err(FortifyError::NoShareRecord(path)),
    }
}

/// Recombines share files block by block, appending each recovered block
/// to `output` (or only verifying when no output is given).
///
/// Every round reads one record from every file and requires agreement on
/// `block`, `blocks`, `threshold` and `digest`, a block index equal to
/// the running count plus one, and at least `threshold` inputs. The
/// recovered secret must hash back to the recorded digest. On the first
/// block a non-empty output fails unless `truncate` is set.
pub fn combine_part_files(
    inputs: &[PathBuf],
    output: Option<&Path>,
    truncate: bool,
) -> Result<()> {
    if inputs.is_empty() {
        return Err(FortifyError::InsufficientShares { needed: 1, got: 0 });
    }

    let mut scanners = Vec::with_capacity(inputs.len());
    for input in inputs {
        let (file, _, path) = files::open_input(input)?;
        debug!(path = %path.display(), "open share file");
        scanners.push(LineScanner::new(file));
    }

    let mut out = match output {
        Some(path) => {
            let (file, path) = files::open_append(path)?;
            Some((file, path))
        }
        None => None,
    };

    let mut count = 0u64;
    loop {
        let mut lines: Vec<Vec<u8>> = Vec::with_capacity(scanners.len());
        for scanner in &mut scanners {
            match scanner.next_record_line()? {
                Some(line) => lines.push(line.to_vec()),
                None => break,
            }
        }
        if lines.len() < scanners.len() {
            break;
        }

        let records: Vec<ShareRecord> = lines
            .iter()
            .map(|line| serde_json::from_slice(line).map_err(FortifyError::from))
            .collect::<Result<_>>()?;
        let first = &records[0];
        if records.len() < first.threshold as usize {
            return Err(FortifyError::InsufficientShares {
                needed: first.threshold,
                got: records.len(),
            });
        }
        if records.iter().any(|r| {
            r.block != first.block
                || r.blocks != first.blocks
                || r.threshold != first.threshold
                || r.digest != first.digest
        }) {
            return Err(FortifyError::InconsistentShares);
        }
        if first.block != count + 1 {
            return Err(FortifyError::BlockMismatch {
                expected: count + 1,
                actual: first.block,
            });
        }

        let mut secret = combine(&records)?;
        let actual = payload_digest(&secret);
        if actual != first.digest {
            return Err(FortifyError::DigestMismatch {
                expected: first.digest.clone(),
                actual,
            });
        }

        if let Some((file, path)) = &mut out {
            if count == 0 && file.metadata()?.len() > 0 {
                if !truncate {
                    return Err(FortifyError::OutputNotEmpty(path.clone()));
                }
                file.set_len(0)?;
            }
            file.write_all(&secret)?;
        }
        debug!(
            block = first.block,
            blocks = first.blocks,
            bytes = secret.len(),
            "block recovered"
        );
        secret.zeroize();
        count += 1;
    }

    if let Some((file, path)) = &out {
        file.sync_all()?;
        info!(output = %path.display(), blocks = count, "secret recovered");
    } else {
        info!(blocks = count, "share files verified");
    }
    Ok(())
}
