//! Configuration for the Tally CLI, agent and server.
//!
//! The configuration is loaded from a `config.yml` file in a config folder and can be overridden
//! by command line arguments and environment variables through [`OverridableConfig`].

#![warn(missing_docs)]

mod config;

pub use self::config::*;
