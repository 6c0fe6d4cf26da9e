use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::HarvestError;

static GENE_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._-]+$").expect("gene id pattern is valid"));

/// Metadata key carried through to the `protein_url` CSV column.
pub const PROTEIN_URL_KEY: &str = "protein_url";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GeneId(String);

impl GeneId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GeneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for GeneId {
    type Err = HarvestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if !GENE_ID_RE.is_match(trimmed) {
            return Err(HarvestError::InvalidGeneId(value.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }
}

/// One entry returned by an image catalog.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ImageRecord {
    pub ensg_id: String,
    pub tissue_or_cancer: String,
    #[serde(default)]
    pub antibody_id: Option<String>,
    pub image_url: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Derives the local file name for an image URL.
///
/// The path segments after an optional leading `images/` are joined with `_`,
/// so `https://www.proteinatlas.org/images/4279/20_A_1_2.jpg` becomes
/// `4279_20_A_1_2.jpg`.
pub fn image_file_name(image_url: &str) -> Result<String, HarvestError> {
    let url =
        Url::parse(image_url).map_err(|err| HarvestError::InvalidImageUrl(format!("{image_url}: {err}")))?;
    let segments = url
        .path_segments()
        .map(|segments| segments.filter(|s| !s.is_empty()).collect::<Vec<_>>())
        .unwrap_or_default();
    let segments = match segments.split_first() {
        Some((&"images", rest)) => rest.to_vec(),
        _ => segments,
    };
    let name = segments.join("_");
    if name.is_empty() || name == "." || name == ".." {
        return Err(HarvestError::InvalidImageUrl(format!(
            "{image_url}: no file name in path"
        )));
    }
    Ok(name)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadTask {
    gene_id: GeneId,
    tissue_or_category: String,
    antibody_id: String,
    image_url: String,
    output_file_name: String,
    extra_metadata: BTreeMap<String, String>,
}

impl DownloadTask {
    pub fn new(
        gene_id: GeneId,
        tissue_or_category: impl Into<String>,
        antibody_id: impl Into<String>,
        image_url: impl Into<String>,
    ) -> Result<Self, HarvestError> {
        let image_url = image_url.into();
        let output_file_name = image_file_name(&image_url)?;
        Ok(Self {
            gene_id,
            tissue_or_category: tissue_or_category.into(),
            antibody_id: antibody_id.into(),
            image_url,
            output_file_name,
            extra_metadata: BTreeMap::new(),
        })
    }

    pub fn from_record(record: ImageRecord) -> Result<Self, HarvestError> {
        let gene_id: GeneId = record.ensg_id.parse()?;
        let mut task = Self::new(
            gene_id,
            record.tissue_or_cancer,
            record.antibody_id.unwrap_or_default(),
            record.image_url,
        )?;
        for (key, value) in record.extra {
            let value = match value {
                Value::Null => continue,
                Value::String(text) => text,
                other => other.to_string(),
            };
            task.extra_metadata.insert(key, value);
        }
        Ok(task)
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_metadata.insert(key.into(), value.into());
        self
    }

    pub fn gene_id(&self) -> &GeneId {
        &self.gene_id
    }

    pub fn tissue_or_category(&self) -> &str {
        &self.tissue_or_category
    }

    pub fn antibody_id(&self) -> &str {
        &self.antibody_id
    }

    pub fn image_url(&self) -> &str {
        &self.image_url
    }

    pub fn output_file_name(&self) -> &str {
        &self.output_file_name
    }

    pub fn extra_metadata(&self) -> &BTreeMap<String, String> {
        &self.extra_metadata
    }

    pub fn protein_url(&self) -> Option<&str> {
        self.extra_metadata.get(PROTEIN_URL_KEY).map(String::as_str)
    }

    /// The key/value provenance stamped onto the downloaded file.
    pub fn provenance(&self) -> BTreeMap<String, String> {
        let mut metadata = self.extra_metadata.clone();
        metadata.insert("image_file".to_string(), self.output_file_name.clone());
        metadata.insert("ensg_id".to_string(), self.gene_id.to_string());
        metadata.insert(
            "tissue_or_cancer".to_string(),
            self.tissue_or_category.clone(),
        );
        metadata.insert("antibody".to_string(), self.antibody_id.clone());
        metadata.insert("image_url".to_string(), self.image_url.clone());
        metadata
            .entry(PROTEIN_URL_KEY.to_string())
            .or_insert_with(String::new);
        metadata
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeStatus {
    Ok,
    NoMetadata,
    Failed,
}

impl OutcomeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OutcomeStatus::Ok => "ok",
            OutcomeStatus::NoMetadata => "no-metadata",
            OutcomeStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutcomeStatus {
    type Err = HarvestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "ok" => Ok(OutcomeStatus::Ok),
            "no-metadata" => Ok(OutcomeStatus::NoMetadata),
            "failed" => Ok(OutcomeStatus::Failed),
            other => Err(HarvestError::Ledger {
                path: String::new(),
                message: format!("unknown status {other:?}"),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOutcome {
    pub task: DownloadTask,
    pub succeeded: bool,
    pub metadata_stamped: bool,
    pub error: Option<String>,
}

impl DownloadOutcome {
    pub fn completed(task: DownloadTask) -> Self {
        Self {
            task,
            succeeded: true,
            metadata_stamped: true,
            error: None,
        }
    }

    pub fn missing_metadata(task: DownloadTask, error: &HarvestError) -> Self {
        Self {
            task,
            succeeded: true,
            metadata_stamped: false,
            error: Some(error.to_string()),
        }
    }

    pub fn failed(task: DownloadTask, error: &HarvestError) -> Self {
        Self {
            task,
            succeeded: false,
            metadata_stamped: false,
            error: Some(error.to_string()),
        }
    }

    pub fn status(&self) -> OutcomeStatus {
        match (self.succeeded, self.metadata_stamped) {
            (false, _) => OutcomeStatus::Failed,
            (true, false) => OutcomeStatus::NoMetadata,
            (true, true) => OutcomeStatus::Ok,
        }
    }
}
