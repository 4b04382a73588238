//! Deposit graph fixtures

use deposit_common::ObjectId;
use deposit_ingest::model::{DepositGraph, StagedResource};

/// Deposit id used by every fixture graph
pub const DEPOSIT: &str = "deposit-1";

pub fn id(value: &str) -> ObjectId {
    value.parse().expect("valid object id")
}

/// Empty deposit graph
pub fn empty_graph() -> DepositGraph {
    DepositGraph::new(StagedResource::deposit(id(DEPOSIT)).with_label("Test deposit"))
        .expect("deposit root")
}

/// `Folder(A) -> Work(W) -> [File(f1), File(f2)]` with `W.primary = f1`
pub fn scenario_graph() -> DepositGraph {
    let mut graph = empty_graph();
    graph
        .add_child(&id(DEPOSIT), StagedResource::folder(id("A")).with_label("Folder A"))
        .unwrap();
    graph
        .add_child(
            &id("A"),
            StagedResource::work(id("W"))
                .with_label("Work W")
                .with_primary_object(id("f1")),
        )
        .unwrap();
    graph
        .add_child(
            &id("W"),
            StagedResource::file(id("f1"))
                .with_staging_location("data/f1.bin")
                .with_mimetype("application/octet-stream")
                .with_checksum("SHA256", "00"),
        )
        .unwrap();
    graph
        .add_child(
            &id("W"),
            StagedResource::file(id("f2"))
                .with_staging_location("data/f2.txt")
                .with_filename("second.txt"),
        )
        .unwrap();
    graph
}

/// Folders `[A, B, C]` directly below the deposit, each holding nothing
pub fn ordered_folders_graph() -> DepositGraph {
    let mut graph = empty_graph();
    for name in ["A", "B", "C"] {
        graph
            .add_child(&id(DEPOSIT), StagedResource::folder(id(name)))
            .unwrap();
    }
    graph
}

/// `Folder(A) -> File(lone)`
pub fn standalone_file_graph(label: Option<&str>) -> DepositGraph {
    let mut graph = empty_graph();
    graph
        .add_child(&id(DEPOSIT), StagedResource::folder(id("A")))
        .unwrap();
    let mut file = StagedResource::file(id("lone")).with_staging_location("lone.pdf");
    if let Some(label) = label {
        file = file.with_label(label);
    }
    graph.add_child(&id("A"), file).unwrap();
    graph
}
