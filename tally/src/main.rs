//! The Tally binary.
//!
//! Tally collects runtime metrics of a host and ships them to a central server. The same binary
//! runs either side:
//!
//! - `tally run agent` samples system and process metrics and delivers them to the server,
//!   retrying transient failures;
//! - `tally run server` receives, verifies and stores metrics and serves them over HTTP;
//! - `tally healthcheck` asks a running server whether its storage is reachable.
//!
//! Options are read from `config.yml` in the folder given by `--config`, then overridden by
//! environment variables and command line arguments.

mod cli;
mod cliapp;
mod healthcheck;
mod setup;

use std::process;

pub fn main() {
    let exit_code = match cli::execute() {
        Ok(()) => 0,
        Err(err) => {
            tally_log::ensure_error(&err);
            1
        }
    };

    process::exit(exit_code);
}
