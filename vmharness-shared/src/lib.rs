//! Types shared between the vmharness crates.
//!
//! - [`errors`]: the harness error taxonomy and result alias
//! - [`endpoint`]: monitor/console socket addresses

pub mod endpoint;
pub mod errors;

pub use endpoint::Endpoint;
pub use errors::{ErrorCategory, HarnessError, HarnessResult};
