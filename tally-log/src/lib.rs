//! Logging for the Tally server and agent.
//!
//! Both binaries log through [`tracing`]. This crate re-exports its macros, so other crates depend
//! on `tally-log` alone, and it owns subscriber setup behind the `init` feature.
//!
//! ```ignore
//! tally_log::init(&tally_log::LogConfig::default());
//! tally_log::info!("listening on {addr}");
//! ```
//!
//! Messages start lowercase and carry no trailing punctuation. Failures that the process recovers
//! from, such as a batch that ran out of delivery attempts, are warnings. Errors are reserved for
//! bugs and states that need an operator.
//!
//! Errors are logged with their full source chain through [`LogError`]:
//!
//! ```
//! let error = std::io::Error::other("connection reset");
//! tally_log::warn!("delivery failed: {}", tally_log::LogError(&error));
//! ```
//!
//! Tests call [`init_test!`] (feature `test`) to capture output at TRACE for the calling crate.

#![warn(missing_docs)]

#[cfg(feature = "init")]
mod setup;
#[cfg(feature = "init")]
pub use setup::*;

#[cfg(feature = "test")]
pub use test::*;

mod utils;
pub use utils::*;

#[doc(inline)]
pub use tracing::{Level, debug, error, info, trace, warn};
