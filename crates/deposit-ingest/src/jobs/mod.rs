//! Concrete deposit jobs

pub mod deposit_record;
pub mod ingest_content;
pub mod techmd;

pub use deposit_record::DepositRecordJob;
pub use ingest_content::IngestContentObjectsJob;
pub use techmd::{ExtractTechnicalMetadataJob, ExtractedReport};
