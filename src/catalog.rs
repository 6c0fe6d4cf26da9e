use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::thread;
use std::time::Duration;

use csv::ReaderBuilder;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{GeneId, ImageRecord};
use crate::error::HarvestError;
use crate::fetch::user_agent_headers;

/// Resolves genes and a tissue into the images to download.
pub trait ImageCatalog: Send + Sync {
    fn images(&self, genes: &[GeneId], tissue: &str) -> Result<Vec<ImageRecord>, HarvestError>;

    /// Known tissue and cancer names. An empty list disables validation.
    fn tissues(&self) -> Result<Vec<String>, HarvestError>;
}

#[derive(Debug, Deserialize)]
struct DataEnvelope<T> {
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct TissueEntry {
    name: String,
}

#[derive(Debug, Serialize)]
struct ImageQuery<'a> {
    ensg_ids: Vec<&'a str>,
    tissues: Vec<&'a str>,
}

/// Client for the HPASubC REST API (`/hpa_v{version}/images`, `/tissues`).
#[derive(Clone)]
pub struct HpaSubcClient {
    client: Client,
    base_url: String,
    hpa_version: u32,
}

impl HpaSubcClient {
    pub fn new(base_url: &str, hpa_version: u32, timeout: Duration) -> Result<Self, HarvestError> {
        let client = Client::builder()
            .default_headers(user_agent_headers()?)
            .timeout(timeout)
            .build()
            .map_err(|err| HarvestError::CatalogHttp(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            hpa_version,
        })
    }

    pub fn endpoint(&self, resource: &str) -> String {
        format!("{}/hpa_v{}/{}", self.base_url, self.hpa_version, resource)
    }

    fn handle_status(
        response: reqwest::blocking::Response,
    ) -> Result<reqwest::blocking::Response, HarvestError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "image catalog request failed".to_string());
        Err(HarvestError::CatalogStatus { status, message })
    }

    fn send_with_retries<F>(
        &self,
        mut make_req: F,
    ) -> Result<reqwest::blocking::Response, HarvestError>
    where
        F: FnMut() -> reqwest::blocking::RequestBuilder,
    {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0usize;
        loop {
            match make_req().send() {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Err(HarvestError::CatalogHttp(err.to_string()));
                }
            }
        }
    }
}

impl ImageCatalog for HpaSubcClient {
    fn images(&self, genes: &[GeneId], tissue: &str) -> Result<Vec<ImageRecord>, HarvestError> {
        if genes.is_empty() {
            return Ok(Vec::new());
        }
        let url = self.endpoint("images");
        let query = ImageQuery {
            ensg_ids: genes.iter().map(GeneId::as_str).collect(),
            tissues: vec![tissue],
        };
        let response = self.send_with_retries(|| self.client.post(&url).json(&query))?;
        let envelope: DataEnvelope<ImageRecord> = Self::handle_status(response)?
            .json()
            .map_err(|err| HarvestError::CatalogHttp(err.to_string()))?;
        Ok(envelope.data)
    }

    fn tissues(&self) -> Result<Vec<String>, HarvestError> {
        let url = self.endpoint("tissues");
        let response = self.send_with_retries(|| self.client.get(&url))?;
        let envelope: DataEnvelope<TissueEntry> = Self::handle_status(response)?
            .json()
            .map_err(|err| HarvestError::CatalogHttp(err.to_string()))?;
        Ok(envelope.data.into_iter().map(|entry| entry.name).collect())
    }
}

/// A local CSV image list with at least `ensg_id`, `tissue_or_cancer` and
/// `image_url` columns. `antibody_id` (or `antibody`) is optional; any other
/// column is carried as extra metadata.
#[derive(Debug, Clone)]
pub struct ImageListFile {
    records: Vec<ImageRecord>,
}

impl ImageListFile {
    pub fn open(path: &Path) -> Result<Self, HarvestError> {
        let list_err = |message: String| {
            HarvestError::TaskSource(format!("image list {}: {message}", path.display()))
        };
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .from_path(path)
            .map_err(|err| list_err(err.to_string()))?;
        let headers: Vec<String> = reader
            .headers()
            .map_err(|err| list_err(err.to_string()))?
            .iter()
            .map(|name| name.trim().to_string())
            .collect();
        for required in ["ensg_id", "tissue_or_cancer", "image_url"] {
            if !headers.iter().any(|name| name == required) {
                return Err(list_err(format!("missing column {required}")));
            }
        }

        let mut records = Vec::new();
        for row in reader.records() {
            let row = row.map_err(|err| list_err(err.to_string()))?;
            let mut fields: BTreeMap<String, String> = headers
                .iter()
                .cloned()
                .zip(row.iter().map(|value| value.trim().to_string()))
                .collect();
            let mut take = |key: &str| fields.remove(key).unwrap_or_default();
            let ensg_id = take("ensg_id");
            let tissue_or_cancer = take("tissue_or_cancer");
            let image_url = take("image_url");
            let antibody = take("antibody_id");
            let antibody = if antibody.is_empty() {
                take("antibody")
            } else {
                antibody
            };
            fields.remove("image_file");
            records.push(ImageRecord {
                ensg_id,
                tissue_or_cancer,
                antibody_id: (!antibody.is_empty()).then_some(antibody),
                image_url,
                extra: fields
                    .into_iter()
                    .filter(|(_, value)| !value.is_empty())
                    .map(|(key, value)| (key, Value::String(value)))
                    .collect(),
            });
        }
        Ok(Self { records })
    }
}

impl ImageCatalog for ImageListFile {
    fn images(&self, genes: &[GeneId], tissue: &str) -> Result<Vec<ImageRecord>, HarvestError> {
        let wanted: BTreeSet<&str> = genes.iter().map(GeneId::as_str).collect();
        Ok(self
            .records
            .iter()
            .filter(|record| wanted.contains(record.ensg_id.as_str()))
            .filter(|record| record.tissue_or_cancer.eq_ignore_ascii_case(tissue))
            .cloned()
            .collect())
    }

    fn tissues(&self) -> Result<Vec<String>, HarvestError> {
        let tissues: BTreeSet<String> = self
            .records
            .iter()
            .map(|record| record.tissue_or_cancer.to_lowercase())
            .collect();
        Ok(tissues.into_iter().collect())
    }
}

/// Case-insensitive membership check; an empty list accepts everything.
pub fn validate_tissue(tissue: &str, known: &[String]) -> Result<(), HarvestError> {
    if known.is_empty() || known.iter().any(|name| name.eq_ignore_ascii_case(tissue)) {
        return Ok(());
    }
    Err(HarvestError::UnknownTissue {
        tissue: tissue.to_string(),
        valid: known.join(", "),
    })
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

#[cfg(test)]
mod tests {
    use std::fs;

    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn endpoint_includes_version() {
        let client =
            HpaSubcClient::new("http://localhost:5000/hpasubc/api_v1/", 18, Duration::from_secs(5))
                .unwrap();
        assert_eq!(
            client.endpoint("images"),
            "http://localhost:5000/hpasubc/api_v1/hpa_v18/images"
        );
    }

    #[test]
    fn image_list_filters_by_gene_and_tissue() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("images.csv");
        fs::write(
            &path,
            "ensg_id,tissue_or_cancer,antibody,image_url,staining\n\
             G1,Heart muscle,HPA1,http://x/images/1/a.jpg,high\n\
             G1,liver,HPA1,http://x/images/1/b.jpg,\n\
             G2,heart muscle,,http://x/images/2/c.jpg,low\n",
        )
        .unwrap();
        let list = ImageListFile::open(&path).unwrap();
        let genes: Vec<GeneId> = vec!["G1".parse().unwrap()];
        let images = list.images(&genes, "heart muscle").unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].antibody_id.as_deref(), Some("HPA1"));
        assert_eq!(images[0].extra.get("staining"), Some(&Value::from("high")));
        assert_eq!(list.tissues().unwrap(), vec!["heart muscle", "liver"]);
    }

    #[test]
    fn tissue_validation_is_case_insensitive() {
        let known = vec!["heart muscle".to_string(), "liver".to_string()];
        validate_tissue("Heart Muscle", &known).unwrap();
        validate_tissue("anything", &[]).unwrap();
        let err = validate_tissue("brain", &known).unwrap_err();
        assert_matches!(err, HarvestError::UnknownTissue { .. });
    }
}
