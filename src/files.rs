//! Open policies for the files the tool touches: inputs must exist and be
//! non-empty, outputs are created 0600 and refuse to clobber existing
//! content unless truncation was requested.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{FortifyError, Result};

/// Opens an existing, non-empty regular file read-only. Returns the
/// handle, its size and the absolute path.
pub fn open_input(path: &Path) -> Result<(File, u64, PathBuf)> {
    let path = std::path::absolute(path)?;
    let meta = std::fs::metadata(&path)?;
    if meta.is_dir() {
        return Err(FortifyError::NotAFile(path));
    }
    if meta.len() == 0 {
        return Err(FortifyError::EmptyInput(path));
    }
    let file = File::open(&path)?;
    debug!(path = %path.display(), bytes = meta.len(), "open input");
    Ok((file, meta.len(), path))
}

/// Opens (or creates) an output file for writing, mode 0600. An existing
/// non-empty file is truncated when `truncate` is set and refused
/// otherwise.
pub fn open_output(path: &Path, truncate: bool) -> Result<(File, PathBuf)> {
    let path = std::path::absolute(path)?;
    let file = write_options(false).open(&path)?;
    if file.metadata()?.len() > 0 {
        if !truncate {
            return Err(FortifyError::OutputNotEmpty(path));
        }
        file.set_len(0)?;
    }
    debug!(path = %path.display(), "open output");
    Ok((file, path))
}

/// Opens (or creates) an append-mode output, mode 0600. Share files and
/// combine outputs accumulate block by block through handles from here;
/// the first-block emptiness policy is applied by the caller.
pub fn open_append(path: &Path) -> Result<(File, PathBuf)> {
    let path = std::path::absolute(path)?;
    let file = write_options(true).open(&path)?;
    debug!(path = %path.display(), "open append");
    Ok((file, path))
}

fn write_options(append: bool) -> OpenOptions {
    let mut opts = OpenOptions::new();
    opts.write(true).create(true).append(append);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }
    opts
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn input_must_exist_and_be_non_empty() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("missing");
        assert!(matches!(open_input(&missing), Err(FortifyError::Io(_))));

        let empty = dir.path().join("empty");
        File::create(&empty).unwrap();
        assert!(matches!(
            open_input(&empty),
            Err(FortifyError::EmptyInput(_))
        ));

        assert!(matches!(
            open_input(dir.path()),
            Err(FortifyError::NotAFile(_))
        ));

        let ok = dir.path().join("ok");
        std::fs::write(&ok, b"data").unwrap();
        let (_, size, _) = open_input(&ok).unwrap();
        assert_eq!(size, 4);
    }

    #[test]
    fn output_refuses_non_empty_without_truncate() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out");
        std::fs::write(&path, b"old contents").unwrap();

        assert!(matches!(
            open_output(&path, false),
            Err(FortifyError::OutputNotEmpty(_))
        ));

        let (mut file, _) = open_output(&path, true).unwrap();
        file.write_all(b"new").unwrap();
        drop(file);
        assert_eq!(std::fs::read(&path).unwrap(), b"new");
    }

    #[cfg(unix)]
    #[test]
    fn outputs_are_created_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let path = dir.path().join("secret-out");
        let (file, _) = open_output(&path, false).unwrap();
        let mode = file.metadata().unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
