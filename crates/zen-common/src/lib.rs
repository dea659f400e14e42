//! Zen Common Library
//!
//! Shared pieces every process in a zen enrichment fleet must agree on.
//!
//! # Overview
//!
//! - **Partition key**: the single pinned hash that maps a work item's link to
//!   its shard. Workers, the supervisor and the store's own SQL function all
//!   compute the same value; see [`partition`].
//! - **Error handling**: the fleet-wide error taxonomy and result alias.
//! - **Logging**: tracing bootstrap shared by the binaries.
//! - **Types**: status enums stored as text in the claim store.
//!
//! # Example
//!
//! ```
//! use zen_common::partition::{partition_key, PARTITION_COUNT};
//!
//! let key = partition_key("https://a.com");
//! assert_eq!(key, 15);
//! assert!(key >= 0 && (key as u32) < PARTITION_COUNT);
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod error;
pub mod logging;
pub mod partition;
pub mod types;

// Re-export commonly used types
pub use error::{Result, ZenError};
pub use partition::{partition_key, PARTITION_COUNT};
pub use types::{ScrapeStatus, WorkStatus};
