//! Metrics protocol, wire codec and sampler for Tally.
//!
//! # Protocol
//!
//! A [`Metric`] is a name with a typed [`MetricValue`]: either a gauge, whose stored value is
//! replaced on every update, or a counter, whose stored value accumulates the delivered deltas.
//! On the wire, metrics travel as [`MetricRecord`]s, a JSON object carrying the type and exactly
//! one of `value` (gauges) or `delta` (counters):
//!
//! ```json
//! [
//!   {"id": "Alloc", "type": "gauge", "value": 1250672.5},
//!   {"id": "PollCount", "type": "counter", "delta": 5}
//! ]
//! ```
//!
//! # Codec
//!
//! [`encode`] serializes a [`Batch`], compresses it with gzip and signs the compressed bytes if a
//! [`SharedKey`](tally_auth::SharedKey) is given. [`decode`] is the exact inverse and fails closed
//! on any verification, decompression or decoding error.
//!
//! # Sampler
//!
//! The [`Sampler`] collects system and process gauges from a static table of accessors, along
//! with the `PollCount` counter and the `RandomValue` gauge.

#![warn(missing_docs)]

mod codec;
mod protocol;
mod sampler;

pub use self::codec::*;
pub use self::protocol::*;
pub use self::sampler::*;
