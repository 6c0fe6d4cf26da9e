use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use clap::ValueEnum;
use little_exif::exif_tag::ExifTag;
use little_exif::metadata::Metadata;

use crate::error::HarvestError;
use crate::fs_util::write_bytes_atomic;

pub type Provenance = BTreeMap<String, String>;

/// Embeds provenance into a downloaded file so later tools can find it.
///
/// Implementations must be idempotent: stamping the same metadata twice leaves
/// the same logical metadata behind.
pub trait MetadataStamper: Send + Sync {
    fn stamp(&self, file: &Path, metadata: &Provenance) -> Result<(), HarvestError>;
}

impl<T: MetadataStamper + ?Sized> MetadataStamper for Box<T> {
    fn stamp(&self, file: &Path, metadata: &Provenance) -> Result<(), HarvestError> {
        (**self).stamp(file, metadata)
    }
}

/// Where provenance is stored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum StampFormat {
    /// JSON in the image's EXIF `UserComment` tag.
    #[default]
    Exif,
    /// JSON in a `<image>.json` file next to the image.
    Sidecar,
}

impl StampFormat {
    pub fn stamper(self) -> Box<dyn MetadataStamper> {
        match self {
            StampFormat::Exif => Box::new(ExifStamper),
            StampFormat::Sidecar => Box::new(JsonSidecarStamper),
        }
    }
}

/// Character-code prefix of an ASCII EXIF `UserComment`.
const ASCII_CHARSET: &[u8; 8] = b"ASCII\0\0\0";

/// Embeds the provenance as a JSON object in the EXIF `UserComment` tag.
///
/// The image is copied to a temp file, stamped there and renamed over the
/// original, so a failed stamp leaves the downloaded bytes untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExifStamper;

impl ExifStamper {
    /// The raw tag value: charset prefix plus ASCII-only JSON.
    pub fn user_comment(metadata: &Provenance) -> Result<Vec<u8>, HarvestError> {
        let json = serde_json::to_string(metadata).map_err(|err| HarvestError::Stamp {
            path: String::new(),
            message: err.to_string(),
        })?;
        let mut comment = ASCII_CHARSET.to_vec();
        for ch in json.chars() {
            if ch.is_ascii() {
                comment.push(ch as u8);
            } else {
                let mut units = [0u16; 2];
                for unit in ch.encode_utf16(&mut units) {
                    comment.extend_from_slice(format!("\\u{unit:04x}").as_bytes());
                }
            }
        }
        Ok(comment)
    }
}

impl MetadataStamper for ExifStamper {
    fn stamp(&self, file: &Path, metadata: &Provenance) -> Result<(), HarvestError> {
        let stamp_err = |message: String| HarvestError::Stamp {
            path: file.display().to_string(),
            message,
        };
        let extension = file
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        let signature: &[u8] = match extension.as_str() {
            "jpg" | "jpeg" => &[0xFF, 0xD8],
            "png" => &[0x89, b'P', b'N', b'G'],
            "tif" | "tiff" | "webp" => &[],
            other => return Err(stamp_err(format!("cannot embed EXIF in .{other} files"))),
        };

        let mut bytes = Vec::new();
        fs::File::open(file)
            .and_then(|mut handle| handle.read_to_end(&mut bytes))
            .map_err(|err| stamp_err(err.to_string()))?;
        if !bytes.starts_with(signature) {
            return Err(stamp_err(format!("not a valid .{extension} image")));
        }

        let comment = Self::user_comment(metadata)?;
        let parent = file
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut temp = tempfile::Builder::new()
            .prefix(".hpasubc-dl")
            .suffix(&format!(".{extension}"))
            .tempfile_in(parent)
            .map_err(|err| stamp_err(err.to_string()))?;
        temp.write_all(&bytes)
            .and_then(|_| temp.flush())
            .map_err(|err| stamp_err(err.to_string()))?;

        let mut exif =
            Metadata::new_from_path(temp.path()).map_err(|err| stamp_err(err.to_string()))?;
        exif.set_tag(ExifTag::UserComment(comment));
        exif.write_to_file(temp.path())
            .map_err(|err| stamp_err(err.to_string()))?;
        temp.persist(file)
            .map_err(|err| stamp_err(err.error.to_string()))?;
        Ok(())
    }
}

/// Stores the provenance as a flat JSON object in `<file>.json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSidecarStamper;

impl JsonSidecarStamper {
    pub fn sidecar_path(file: &Path) -> PathBuf {
        let mut name = file.as_os_str().to_owned();
        name.push(".json");
        PathBuf::from(name)
    }

    pub fn read(file: &Path) -> Result<Provenance, HarvestError> {
        let sidecar = Self::sidecar_path(file);
        let content = fs::read_to_string(&sidecar).map_err(|err| HarvestError::Stamp {
            path: sidecar.display().to_string(),
            message: err.to_string(),
        })?;
        serde_json::from_str(&content).map_err(|err| HarvestError::Stamp {
            path: sidecar.display().to_string(),
            message: err.to_string(),
        })
    }
}

impl MetadataStamper for JsonSidecarStamper {
    fn stamp(&self, file: &Path, metadata: &Provenance) -> Result<(), HarvestError> {
        if !file.is_file() {
            return Err(HarvestError::Stamp {
                path: file.display().to_string(),
                message: "file does not exist".to_string(),
            });
        }
        let content = serde_json::to_vec_pretty(metadata).map_err(|err| HarvestError::Stamp {
            path: file.display().to_string(),
            message: err.to_string(),
        })?;
        write_bytes_atomic(&Self::sidecar_path(file), &content).map_err(|err| {
            HarvestError::Stamp {
                path: file.display().to_string(),
                message: err.to_string(),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn stamping_is_idempotent() {
        let temp = tempfile::tempdir().unwrap();
        let image = temp.path().join("4279_20_A_1_2.jpg");
        fs::write(&image, b"jpeg").unwrap();
        let mut metadata = Provenance::new();
        metadata.insert("ensg_id".to_string(), "ENSG00000000003".to_string());

        JsonSidecarStamper.stamp(&image, &metadata).unwrap();
        JsonSidecarStamper.stamp(&image, &metadata).unwrap();

        assert_eq!(JsonSidecarStamper::read(&image).unwrap(), metadata);
        assert!(temp.path().join("4279_20_A_1_2.jpg.json").exists());
    }

    #[test]
    fn user_comment_is_prefixed_ascii_json() {
        let mut metadata = Provenance::new();
        metadata.insert("ensg_id".to_string(), "ENSG00000000003".to_string());
        metadata.insert("tissue_or_cancer".to_string(), "cancer \u{e9}".to_string());

        let comment = ExifStamper::user_comment(&metadata).unwrap();
        assert!(comment.starts_with(b"ASCII\0\0\0"));
        assert!(comment.is_ascii());
        let json: Provenance = serde_json::from_slice(&comment[8..]).unwrap();
        assert_eq!(json, metadata);
    }

    #[test]
    fn exif_stamp_rejects_files_that_are_not_images() {
        let temp = tempfile::tempdir().unwrap();
        let html = temp.path().join("1_G1.jpg");
        fs::write(&html, b"<html>rate limited</html>").unwrap();
        let err = ExifStamper.stamp(&html, &Provenance::new()).unwrap_err();
        assert_matches!(err, HarvestError::Stamp { .. });
        assert_eq!(fs::read(&html).unwrap(), b"<html>rate limited</html>");

        let text = temp.path().join("notes.txt");
        fs::write(&text, b"notes").unwrap();
        let err = ExifStamper.stamp(&text, &Provenance::new()).unwrap_err();
        assert_matches!(err, HarvestError::Stamp { .. });
    }

    #[test]
    fn stamp_format_picks_the_stamper() {
        let temp = tempfile::tempdir().unwrap();
        let image = temp.path().join("1_G1.jpg");
        fs::write(&image, b"jpeg").unwrap();
        let mut metadata = Provenance::new();
        metadata.insert("ensg_id".to_string(), "G1".to_string());

        StampFormat::Sidecar.stamper().stamp(&image, &metadata).unwrap();
        assert_eq!(JsonSidecarStamper::read(&image).unwrap(), metadata);
        assert!(StampFormat::Exif.stamper().stamp(&image, &metadata).is_err());
    }

    #[test]
    fn stamping_missing_file_fails() {
        let temp = tempfile::tempdir().unwrap();
        let err = JsonSidecarStamper
            .stamp(&temp.path().join("missing.jpg"), &Provenance::new())
            .unwrap_err();
        assert_matches!(err, HarvestError::Stamp { .. });
    }
}
