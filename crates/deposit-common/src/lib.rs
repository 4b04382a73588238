//! Deposit Common Library
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
//!
//! Shared identifiers, error handling and logging for the deposit workspace.
//!
//! # Overview
//!
//! - **Identifiers**: `ObjectId`, `DepositId` and `JobId` newtypes
//! - **Error Handling**: `CommonError` and the `Result` alias
//! - **Logging**: tracing subscriber setup shared by every binary
//!
//! # Example
//!
//! ```no_run
//! use deposit_common::logging::{init_logging, LogConfig};
//! use deposit_common::types::DepositId;
//!
//! fn main() -> anyhow::Result<()> {
//!     init_logging(&LogConfig::from_env()?)?;
//!     let deposit: DepositId = "7f3c1a".parse()?;
//!     tracing::info!(deposit_id = %deposit, "Deposit registered");
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{CommonError, Result};
pub use types::{DepositId, JobId, ObjectId};
