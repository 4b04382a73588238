//! Technical metadata extraction tests

mod helpers;

use anyhow::Result;
use async_trait::async_trait;
use helpers::*;
use std::path::Path;
use std::sync::Arc;

use deposit_ingest::jobs::techmd::report_path;
use deposit_ingest::services::{JobState, TechnicalMetadataExtractor};
use deposit_ingest::DepositJob;

struct FailingExtractor;

#[async_trait]
impl TechnicalMetadataExtractor for FailingExtractor {
    async fn extract(&self, staged_file: &Path) -> anyhow::Result<Vec<u8>> {
        anyhow::bail!("unsupported format: {}", staged_file.display())
    }
}

#[tokio::test]
async fn test_reports_written_for_every_file() -> Result<()> {
    let deposit = TestDeposit::new(scenario_graph());
    deposit.stage_file("data/f1.bin", b"first file");
    deposit.stage_file("data/f2.txt", b"second");

    let job = deposit.techmd_job();
    job.run().await?;

    let techmd_dir = deposit.config.techmd_dir(&deposit.deposit_id);
    let report = std::fs::read_to_string(report_path(&techmd_dir, &id("f1")))?;
    assert!(report.contains("<filename>f1.bin</filename>"));
    assert!(report.contains("<size>10</size>"));
    assert!(report_path(&techmd_dir, &id("f2")).exists());

    let progress = deposit.progress(&job.context().job_id);
    assert_eq!(progress.state, JobState::Completed);
    assert_eq!(progress.total_units, 2);
    assert_eq!(progress.completed_units, 2);
    Ok(())
}

#[tokio::test]
async fn test_existing_reports_are_not_regenerated() -> Result<()> {
    let deposit = TestDeposit::new(scenario_graph());
    deposit.stage_file("data/f1.bin", b"first file");
    deposit.stage_file("data/f2.txt", b"second");
    let existing = deposit.write_techmd("f1");

    let job = deposit.techmd_job();
    job.run().await?;

    let kept = std::fs::read_to_string(existing)?;
    assert_eq!(kept, "<techmd><id>f1</id></techmd>");

    let progress = deposit.progress(&job.context().job_id);
    assert_eq!(progress.total_units, 2);
    assert_eq!(progress.completed_units, 2);
    Ok(())
}

#[tokio::test]
async fn test_many_files_through_a_small_pool() -> Result<()> {
    let mut graph = empty_graph();
    graph.add_child(
        &id(DEPOSIT),
        deposit_ingest::model::StagedResource::work(id("W")),
    )?;
    for n in 0..25 {
        graph.add_child(
            &id("W"),
            deposit_ingest::model::StagedResource::file(id(&format!("file-{}", n)))
                .with_staging_location(format!("pages/{}.txt", n)),
        )?;
    }

    let deposit = TestDeposit::new(graph);
    for n in 0..25 {
        deposit.stage_file(&format!("pages/{}.txt", n), format!("page {}", n).as_bytes());
    }

    let job = deposit.techmd_job();
    job.run().await?;

    let techmd_dir = deposit.config.techmd_dir(&deposit.deposit_id);
    for n in 0..25 {
        assert!(report_path(&techmd_dir, &id(&format!("file-{}", n))).exists());
    }
    assert_eq!(deposit.progress(&job.context().job_id).completed_units, 25);
    Ok(())
}

#[tokio::test]
async fn test_extraction_failure_fails_the_job() -> Result<()> {
    let mut deposit = TestDeposit::new(scenario_graph());
    deposit.stage_file("data/f1.bin", b"first file");
    deposit.stage_file("data/f2.txt", b"second");
    deposit.extractor = Arc::new(FailingExtractor);

    let job = deposit.techmd_job();
    let err = job.run().await.unwrap_err();

    assert!(err.is_failed());
    assert!(err.to_string().contains("extraction failed"));
    assert!(err.details().unwrap().contains("unsupported format"));
    assert_eq!(deposit.progress(&job.context().job_id).state, JobState::Failed);
    Ok(())
}

#[tokio::test]
async fn test_missing_staged_file_fails_the_job() -> Result<()> {
    let deposit = TestDeposit::new(scenario_graph());
    deposit.stage_file("data/f1.bin", b"first file");

    let err = deposit.techmd_job().run().await.unwrap_err();

    assert!(err.is_failed());
    assert!(err.to_string().contains("f2"));
    Ok(())
}
