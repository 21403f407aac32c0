//! Foundational system components for Tally's services.
//!
//! The [`Controller`] turns process signals into a [`Shutdown`] notification that every long
//! running service can wait on through a [`ShutdownHandle`].

#![warn(missing_docs)]

mod controller;

pub use self::controller::*;
