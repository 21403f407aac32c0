//! The producing side of Tally.
//!
//! The agent samples metrics with a [`Sampler`](tally_metrics::Sampler) and delivers them to the
//! server's batch endpoint. Delivery happens in a [`DeliveryPool`]: a bounded queue drained by a
//! fixed number of workers, each sending one job at a time and retrying network errors and server
//! errors with increasing delays:
//!
//! ```text
//! Queued -> Sending -> Succeeded
//!              |   \-> Failed (client error, or retries exhausted)
//!              v
//!           Retrying -> Sending
//! ```

#![warn(missing_docs)]

mod client;
mod delivery;
mod service;

pub use self::client::*;
pub use self::delivery::*;
pub use self::service::*;
