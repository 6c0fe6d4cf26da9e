use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::Path;

use clap::ValueEnum;
use serde::Serialize;
use tracing::{debug, warn};

use crate::catalog::ImageCatalog;
use crate::domain::{DownloadTask, GeneId};
use crate::error::HarvestError;

/// What to do with images whose output file is already on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ExistingImagePolicy {
    Skip,
    Overwrite,
}

/// Reads one gene id per line. Blank lines and `#` comments are ignored and
/// repeated ids keep their first position.
pub fn read_gene_list(path: &Path) -> Result<Vec<GeneId>, HarvestError> {
    let content = fs::read_to_string(path).map_err(|err| {
        HarvestError::TaskSource(format!("cannot read {}: {err}", path.display()))
    })?;
    parse_gene_list(&content)
}

pub fn parse_gene_list(content: &str) -> Result<Vec<GeneId>, HarvestError> {
    let mut seen = HashSet::new();
    let mut genes = Vec::new();
    for (index, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let gene: GeneId = line
            .parse()
            .map_err(|err| HarvestError::TaskSource(format!("line {}: {err}", index + 1)))?;
        if seen.insert(gene.clone()) {
            genes.push(gene);
        } else {
            debug!(gene = %gene, line = index + 1, "duplicate gene id ignored");
        }
    }
    Ok(genes)
}

/// A catalog entry that could not become a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedRecord {
    pub ensg_id: String,
    pub image_url: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct TaskPlan {
    pub requested: Vec<GeneId>,
    pub skipped: Vec<GeneId>,
    pub queued_genes: Vec<GeneId>,
    pub tasks: Vec<DownloadTask>,
    pub images_found: usize,
    pub images_skipped_existing: usize,
    pub rejected: Vec<RejectedRecord>,
}

impl TaskPlan {
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Tasks whose output file already exists under `output_dir`.
    pub fn existing_outputs(&self, output_dir: &Path) -> Vec<&DownloadTask> {
        self.tasks
            .iter()
            .filter(|task| output_dir.join(task.output_file_name()).exists())
            .collect()
    }

    pub fn apply_existing_policy(&mut self, output_dir: &Path, policy: ExistingImagePolicy) {
        if policy == ExistingImagePolicy::Overwrite {
            return;
        }
        let before = self.tasks.len();
        self.tasks
            .retain(|task| !output_dir.join(task.output_file_name()).exists());
        self.images_skipped_existing += before - self.tasks.len();
    }
}

pub struct TaskSource<'a, C: ImageCatalog + ?Sized> {
    catalog: &'a C,
}

impl<'a, C: ImageCatalog + ?Sized> TaskSource<'a, C> {
    pub fn new(catalog: &'a C) -> Self {
        Self { catalog }
    }

    pub fn plan(
        &self,
        requested: Vec<GeneId>,
        tissue: &str,
        skip: &BTreeSet<GeneId>,
    ) -> Result<TaskPlan, HarvestError> {
        let (skipped, queued_genes): (Vec<GeneId>, Vec<GeneId>) = requested
            .iter()
            .cloned()
            .partition(|gene| skip.contains(gene));

        let mut plan = TaskPlan {
            requested,
            skipped,
            queued_genes,
            ..TaskPlan::default()
        };
        if plan.queued_genes.is_empty() {
            return Ok(plan);
        }

        let queued: HashSet<&GeneId> = plan.queued_genes.iter().collect();
        let records = self.catalog.images(&plan.queued_genes, tissue)?;
        plan.images_found = records.len();

        let mut file_names = HashSet::new();
        let mut tasks = Vec::with_capacity(records.len());
        for record in records {
            let (ensg_id, image_url) = (record.ensg_id.clone(), record.image_url.clone());
            let task = match DownloadTask::from_record(record) {
                Ok(task) => task,
                Err(err) => {
                    warn!(gene = %ensg_id, url = %image_url, error = %err, "skipping catalog record");
                    plan.rejected.push(RejectedRecord {
                        ensg_id,
                        image_url,
                        reason: err.to_string(),
                    });
                    continue;
                }
            };
            if !queued.contains(task.gene_id()) {
                warn!(gene = %task.gene_id(), "catalog returned an image for a gene that was not requested");
                continue;
            }
            if !file_names.insert(task.output_file_name().to_string()) {
                warn!(
                    file = task.output_file_name(),
                    url = task.image_url(),
                    "duplicate output file name, keeping the first image"
                );
                continue;
            }
            tasks.push(task);
        }
        plan.tasks = tasks;
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use crate::domain::ImageRecord;

    use super::*;

    #[test]
    fn gene_list_skips_blanks_comments_and_duplicates() {
        let genes = parse_gene_list("ENSG1\n\n  ENSG2  \n# note\nENSG1\r\n").unwrap();
        let names: Vec<&str> = genes.iter().map(GeneId::as_str).collect();
        assert_eq!(names, vec!["ENSG1", "ENSG2"]);
    }

    #[test]
    fn gene_list_rejects_malformed_ids() {
        let err = parse_gene_list("ENSG1\nENSG2,heart\n").unwrap_err();
        assert_matches!(err, HarvestError::TaskSource(message) if message.starts_with("line 2"));
    }

    struct FixedCatalog(Vec<ImageRecord>);

    impl ImageCatalog for FixedCatalog {
        fn images(&self, _genes: &[GeneId], _tissue: &str) -> Result<Vec<ImageRecord>, HarvestError> {
            Ok(self.0.clone())
        }

        fn tissues(&self) -> Result<Vec<String>, HarvestError> {
            Ok(Vec::new())
        }
    }

    fn record(gene: &str, url: &str) -> ImageRecord {
        ImageRecord {
            ensg_id: gene.to_string(),
            tissue_or_cancer: "liver".to_string(),
            antibody_id: None,
            image_url: url.to_string(),
            extra: Default::default(),
        }
    }

    #[test]
    fn bad_catalog_records_are_set_aside() {
        let catalog = FixedCatalog(vec![
            record("G1", "http://x/images/1/a.jpg"),
            record("G1", "not a url"),
            record("G 1", "http://x/images/1/b.jpg"),
            record("G2", "http://x/images/2/c.jpg"),
        ]);
        let requested = parse_gene_list("G1\nG2\n").unwrap();
        let plan = TaskSource::new(&catalog)
            .plan(requested, "liver", &BTreeSet::new())
            .unwrap();

        assert_eq!(plan.images_found, 4);
        assert_eq!(plan.tasks.len(), 2);
        assert_eq!(plan.rejected.len(), 2);
        assert_eq!(plan.rejected[0].image_url, "not a url");
        assert_eq!(plan.rejected[1].ensg_id, "G 1");
    }

    #[test]
    fn missing_gene_list_is_a_task_source_error() {
        let err = read_gene_list(Path::new("/nonexistent/genes.txt")).unwrap_err();
        assert_matches!(err, HarvestError::TaskSource(_));
    }
}
