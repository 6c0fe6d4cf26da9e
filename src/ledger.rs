use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use csv::ReaderBuilder;
use tracing::warn;

use crate::domain::{GeneId, OutcomeStatus};
use crate::error::HarvestError;

/// An existing output CSV read back as the record of finished genes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressLedger {
    completed: Vec<GeneId>,
    last_gene: Option<GeneId>,
}

impl ProgressLedger {
    pub fn read(path: &Path) -> Result<Self, HarvestError> {
        let ledger_err = |message: String| HarvestError::Ledger {
            path: path.display().to_string(),
            message,
        };

        let size = fs::metadata(path)
            .map_err(|err| ledger_err(err.to_string()))?
            .len();
        if size == 0 {
            return Ok(Self::default());
        }

        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_path(path)
            .map_err(|err| ledger_err(err.to_string()))?;
        let headers = reader
            .headers()
            .map_err(|err| ledger_err(err.to_string()))?
            .clone();
        let gene_idx = headers
            .iter()
            .position(|name| name.trim() == "ensg_id")
            .ok_or_else(|| ledger_err("header has no ensg_id column".to_string()))?;
        let status_idx = headers.iter().position(|name| name.trim() == "status");

        let mut ledger = Self::default();
        let mut seen = BTreeSet::new();
        for (index, record) in reader.records().enumerate() {
            let record = record.map_err(|err| ledger_err(err.to_string()))?;
            let Some(value) = record.get(gene_idx) else {
                warn!(row = index + 2, "ledger row has no ensg_id, ignoring");
                continue;
            };
            let gene: GeneId = match value.parse() {
                Ok(gene) => gene,
                Err(err) => {
                    warn!(row = index + 2, error = %err, "ignoring ledger row");
                    continue;
                }
            };
            ledger.last_gene = Some(gene.clone());

            let failed = status_idx
                .and_then(|idx| record.get(idx))
                .and_then(|status| status.parse::<OutcomeStatus>().ok())
                .is_some_and(|status| status == OutcomeStatus::Failed);
            if !failed && seen.insert(gene.clone()) {
                ledger.completed.push(gene);
            }
        }
        Ok(ledger)
    }

    /// Genes with at least one recorded success, in first-seen order.
    pub fn completed(&self) -> &[GeneId] {
        &self.completed
    }

    /// The gene of the last row, which may have been cut off mid-way.
    pub fn in_flight(&self) -> Option<&GeneId> {
        self.last_gene.as_ref()
    }

    pub fn skip_set(&self) -> BTreeSet<GeneId> {
        self.completed
            .iter()
            .filter(|gene| Some(*gene) != self.last_gene.as_ref())
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn gene(value: &str) -> GeneId {
        value.parse().unwrap()
    }

    #[test]
    fn last_gene_is_not_skipped() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("out.csv");
        fs::write(
            &path,
            "image_file,ensg_id,tissue_or_cancer,antibody,protein_url,image_url\n\
             a.jpg,G1,heart muscle,HPA1,deprecated,http://x/images/1/a.jpg\n\
             b.jpg,G1,heart muscle,HPA1,deprecated,http://x/images/1/b.jpg\n\
             c.jpg,G2,heart muscle,HPA2,deprecated,http://x/images/2/c.jpg\n",
        )
        .unwrap();

        let ledger = ProgressLedger::read(&path).unwrap();
        assert_eq!(ledger.completed(), &[gene("G1"), gene("G2")]);
        assert_eq!(ledger.in_flight(), Some(&gene("G2")));
        assert_eq!(ledger.skip_set(), BTreeSet::from([gene("G1")]));
    }

    #[test]
    fn failed_rows_do_not_complete_a_gene() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("out.csv");
        fs::write(
            &path,
            "image_file,ensg_id,tissue_or_cancer,antibody,protein_url,image_url,status,extra\n\
             a.jpg,G1,heart muscle,,,http://x/images/1/a.jpg,failed,\n\
             b.jpg,G2,heart muscle,,,http://x/images/1/b.jpg,ok,\n\
             c.jpg,G3,heart muscle,,,http://x/images/1/c.jpg,no-metadata,\n",
        )
        .unwrap();

        let ledger = ProgressLedger::read(&path).unwrap();
        assert_eq!(ledger.skip_set(), BTreeSet::from([gene("G2")]));
    }

    #[test]
    fn empty_and_header_only_files_skip_nothing() {
        let temp = tempfile::tempdir().unwrap();
        let empty = temp.path().join("empty.csv");
        fs::write(&empty, "").unwrap();
        assert!(ProgressLedger::read(&empty).unwrap().skip_set().is_empty());

        let header = temp.path().join("header.csv");
        fs::write(&header, "image_file,ensg_id\n").unwrap();
        let ledger = ProgressLedger::read(&header).unwrap();
        assert!(ledger.skip_set().is_empty());
        assert_eq!(ledger.in_flight(), None);
    }

    #[test]
    fn missing_gene_column_is_rejected() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("out.csv");
        fs::write(&path, "proteinID,proteinURL,image\nG1,x,y\n").unwrap();
        let err = ProgressLedger::read(&path).unwrap_err();
        assert_matches!(err, HarvestError::Ledger { .. });
    }
}
