//! Deposit record tests

mod helpers;

use anyhow::Result;
use helpers::*;

use deposit_ingest::model::{DepositGraph, StagedResource};
use deposit_ingest::repository::{ObjectType, MANIFEST_PREFIX};
use deposit_ingest::services::{EventType, JobState};
use deposit_ingest::DepositJob;

fn graph_with_manifest() -> DepositGraph {
    DepositGraph::new(
        StagedResource::deposit(id(DEPOSIT))
            .with_label("Staged label")
            .with_manifest("manifests/bag.txt", Some("text/plain")),
    )
    .expect("deposit root")
}

// ============================================================================
// Creation
// ============================================================================

#[tokio::test]
async fn test_record_describes_the_deposit() -> Result<()> {
    let deposit = TestDeposit::new(graph_with_manifest());
    deposit.stage_file("manifests/bag.txt", b"data/f1.bin 00\n");

    let job = deposit.record_job();
    job.run().await?;

    let record_id = deposit.deposit_id.record_id();
    let record = deposit.repository.object(&record_id).unwrap();
    assert_eq!(record.object_type, ObjectType::DepositRecord);
    assert_eq!(record.title(), Some("Test deposit"));
    assert_eq!(record.description.original_deposit, Some(deposit.deposit_id.clone()));

    let properties = &record.description.properties;
    assert_eq!(properties.get("depositor").map(String::as_str), Some("jdoe"));
    assert_eq!(properties.get("deposit_method").map(String::as_str), Some("sword"));
    assert_eq!(properties.get("packaging_profile").map(String::as_str), Some("simple"));
    assert!(properties.contains_key("submitted_at"));

    let manifest = record
        .binary(&format!("{}bag.txt", MANIFEST_PREFIX))
        .expect("manifest attached");
    assert_eq!(manifest.mimetype.as_deref(), Some("text/plain"));
    assert_eq!(manifest.size, 15);

    let progress = deposit.progress(&job.context().job_id);
    assert_eq!(progress.state, JobState::Completed);
    assert_eq!(progress.total_units, 1);
    assert_eq!(progress.completed_units, 1);
    Ok(())
}

#[tokio::test]
async fn test_record_creation_is_logged_once() -> Result<()> {
    let deposit = TestDeposit::new(empty_graph());

    deposit.record_job().run().await?;

    let events = deposit.provenance.events_for(&deposit.deposit_id.record_id());
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, EventType::Ingestion);
    assert!(events[0].details.iter().any(|d| d.contains("jdoe")));
    assert!(events[0].details.iter().any(|d| d.contains("sword")));
    Ok(())
}

// ============================================================================
// Re-runs
// ============================================================================

#[tokio::test]
async fn test_rerun_overwrites_instead_of_duplicating() -> Result<()> {
    let deposit = TestDeposit::new(graph_with_manifest());
    deposit.stage_file("manifests/bag.txt", b"first manifest");
    deposit.record_job().run().await?;

    let record_id = deposit.deposit_id.record_id();
    let first_digest = deposit
        .repository
        .object(&record_id)
        .unwrap()
        .binary(&format!("{}bag.txt", MANIFEST_PREFIX))
        .unwrap()
        .sha256
        .clone();

    let mut status = deposit.status.deposit(&deposit.deposit_id).unwrap();
    status.label = Some("Corrected title".to_string());
    deposit.status.register_deposit(status);
    deposit.stage_file("manifests/bag.txt", b"second manifest");

    deposit.record_job().run().await?;

    let record = deposit.repository.object(&record_id).unwrap();
    assert_eq!(deposit.repository.creation_count(&record_id), 1);
    assert_eq!(record.title(), Some("Corrected title"));
    assert_eq!(record.binaries.len(), 1);
    assert_ne!(record.binaries[0].sha256, first_digest);
    assert_eq!(deposit.provenance.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_unlabelled_deposit_falls_back_to_staged_label() -> Result<()> {
    let deposit = TestDeposit::new(graph_with_manifest());
    deposit.stage_file("manifests/bag.txt", b"manifest");
    let mut status = deposit.status.deposit(&deposit.deposit_id).unwrap();
    status.label = None;
    deposit.status.register_deposit(status);

    deposit.record_job().run().await?;

    let record = deposit
        .repository
        .object(&deposit.deposit_id.record_id())
        .unwrap();
    assert_eq!(record.title(), Some("Staged label"));
    Ok(())
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test]
async fn test_missing_manifest_fails_without_record() -> Result<()> {
    let deposit = TestDeposit::new(graph_with_manifest());

    let job = deposit.record_job();
    let err = job.run().await.unwrap_err();

    assert!(err.is_failed());
    assert!(err.to_string().contains("manifests/bag.txt"));
    assert!(deposit
        .repository
        .object(&deposit.deposit_id.record_id())
        .is_none());
    assert!(deposit.provenance.is_empty());
    assert_eq!(
        deposit.progress(&job.context().job_id).state,
        JobState::Failed
    );
    Ok(())
}
