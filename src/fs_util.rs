use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use crate::error::HarvestError;

pub fn ensure_dir(dir: &Path) -> Result<(), HarvestError> {
    fs::create_dir_all(dir).map_err(|err| {
        HarvestError::Configuration(format!("cannot create directory {}: {err}", dir.display()))
    })
}

/// Checks that `path` can be opened for appending without leaving a new file
/// behind.
pub fn ensure_writable(path: &Path) -> Result<(), HarvestError> {
    let existed = path.exists();
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|err| {
            HarvestError::Configuration(format!(
                "output file {} is not writable (is it open elsewhere?): {err}",
                path.display()
            ))
        })?;
    if !existed {
        fs::remove_file(path).map_err(|err| HarvestError::Filesystem(err.to_string()))?;
    }
    Ok(())
}

/// Writes `content` to a temp file next to `path` and renames it into place.
pub fn write_bytes_atomic(path: &Path, content: &[u8]) -> Result<(), HarvestError> {
    let write_err = |message: String| HarvestError::Write {
        path: path.display().to_string(),
        message,
    };
    let parent = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut temp = tempfile::Builder::new()
        .prefix(".hpasubc-dl")
        .tempfile_in(parent)
        .map_err(|err| write_err(err.to_string()))?;
    temp.write_all(content)
        .map_err(|err| write_err(err.to_string()))?;
    temp.as_file()
        .sync_all()
        .map_err(|err| write_err(err.to_string()))?;
    temp.persist(path)
        .map_err(|err| write_err(err.error.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_replaces_content() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("image.jpg");
        write_bytes_atomic(&path, b"first").unwrap();
        write_bytes_atomic(&path, b"second").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"second");
        assert_eq!(fs::read_dir(temp.path()).unwrap().count(), 1);
    }

    #[test]
    fn writable_check_leaves_no_file() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("out.csv");
        ensure_writable(&path).unwrap();
        assert!(!path.exists());
    }
}
