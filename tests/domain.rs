use std::str::FromStr;

use assert_matches::assert_matches;

use hpasubc_harvest::domain::{DownloadTask, GeneId, image_file_name};
use hpasubc_harvest::error::HarvestError;

#[test]
fn gene_ids_are_trimmed_and_validated() {
    let gene = GeneId::from_str("  ENSG00000134057 ").unwrap();
    assert_eq!(gene.as_str(), "ENSG00000134057");
    assert_eq!(gene.to_string(), "ENSG00000134057");

    assert_matches!(GeneId::from_str(""), Err(HarvestError::InvalidGeneId(_)));
    assert_matches!(
        GeneId::from_str("ENSG0000/../etc"),
        Err(HarvestError::InvalidGeneId(_))
    );
}

#[test]
fn file_name_is_stable_for_the_same_url() {
    let url = "https://www.proteinatlas.org/images/18236/45_H1_1_blue_red_green.jpg";
    assert_eq!(image_file_name(url).unwrap(), image_file_name(url).unwrap());
    assert_eq!(
        image_file_name(url).unwrap(),
        "18236_45_H1_1_blue_red_green.jpg"
    );
}

#[test]
fn provenance_carries_core_fields_and_extras() {
    let task = DownloadTask::new(
        GeneId::from_str("ENSG00000134057").unwrap(),
        "heart muscle",
        "HPA061449",
        "https://www.proteinatlas.org/images/61449/1_A_1_1.jpg",
    )
    .unwrap()
    .with_metadata("staining", "high");

    let provenance = task.provenance();
    assert_eq!(provenance["image_file"], "61449_1_A_1_1.jpg");
    assert_eq!(provenance["antibody"], "HPA061449");
    assert_eq!(provenance["protein_url"], "");
    assert_eq!(provenance["staining"], "high");
    assert_eq!(task.protein_url(), None);
}

#[test]
fn task_rejects_urls_without_a_file_name() {
    let err = DownloadTask::new(
        GeneId::from_str("G1").unwrap(),
        "liver",
        "",
        "https://www.proteinatlas.org/",
    )
    .unwrap_err();
    assert_matches!(err, HarvestError::InvalidImageUrl(_));
}
