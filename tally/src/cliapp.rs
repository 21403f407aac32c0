//! This module implements the definition of the command line app.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::builder::ValueParser;
use clap::{Arg, ArgAction, Command, value_parser};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ABOUT: &str = "Tally collects host metrics with an agent and stores them on a server.";

fn address_arg() -> Arg {
    Arg::new("address")
        .long("address")
        .short('a')
        .value_name("HOST:PORT")
        .env("ADDRESS")
        .help("The address the server listens on or the agent sends to.")
}

fn key_arg() -> Arg {
    Arg::new("key")
        .long("key")
        .short('k')
        .value_name("KEY")
        .env("KEY")
        .hide_env_values(true)
        .help("The shared key for HashSHA256 payload signatures.")
}

fn server_command() -> Command {
    Command::new("server")
        .about("Run the metrics server")
        .after_help(
            "This runs the server in the foreground until it's shut down. It binds to the \
             configured address and stores metrics in memory, or in a database if one is \
             configured.",
        )
        .arg(address_arg())
        .arg(key_arg())
        .arg(
            Arg::new("store_interval")
                .long("store-interval")
                .short('i')
                .value_name("SECONDS")
                .env("STORE_INTERVAL")
                .help("Seconds between snapshot flushes, 0 flushes after every update."),
        )
        .arg(
            Arg::new("file_storage_path")
                .long("file-storage-path")
                .short('f')
                .value_name("PATH")
                .env("FILE_STORAGE_PATH")
                .help("The snapshot file of the memory store, empty to disable."),
        )
        .arg(
            Arg::new("restore")
                .long("restore")
                .short('r')
                .value_name("BOOL")
                .env("RESTORE")
                .help("Load the snapshot on startup."),
        )
        .arg(
            Arg::new("database_dsn")
                .long("database-dsn")
                .short('d')
                .value_name("DSN")
                .env("DATABASE_DSN")
                .help("A SQLite database to use instead of the memory store."),
        )
        .arg(
            Arg::new("audit_file")
                .long("audit-file")
                .value_name("PATH")
                .env("AUDIT_FILE")
                .help("Append audit events to this file."),
        )
        .arg(
            Arg::new("audit_url")
                .long("audit-url")
                .value_name("URL")
                .env("AUDIT_URL")
                .help("Post audit events to this URL."),
        )
        .arg(
            Arg::new("shutdown_timeout")
                .long("shutdown-timeout")
                .value_name("SECONDS")
                .env("SHUTDOWN_TIMEOUT")
                .help("Maximum number of seconds to wait for pending work on shutdown."),
        )
}

fn agent_command() -> Command {
    Command::new("agent")
        .about("Run the metrics agent")
        .after_help(
            "This runs the agent in the foreground until it's shut down. It polls host \
             metrics and reports them to the server in regular intervals.",
        )
        .arg(address_arg())
        .arg(key_arg())
        .arg(
            Arg::new("hash_key")
                .long("hash-key")
                .value_name("KEY")
                .env("HASH_KEY")
                .hide(true)
                .hide_env_values(true),
        )
        .arg(
            Arg::new("poll_interval")
                .long("poll-interval")
                .short('p')
                .value_name("SECONDS")
                .env("POLL_INTERVAL")
                .help("Seconds between two polls of the sampler."),
        )
        .arg(
            Arg::new("report_interval")
                .long("report-interval")
                .short('r')
                .value_name("SECONDS")
                .env("REPORT_INTERVAL")
                .help("Seconds between two reports to the server."),
        )
        .arg(
            Arg::new("rate_limit")
                .long("rate-limit")
                .short('l')
                .value_name("COUNT")
                .env("RATE_LIMIT")
                .help("Maximum number of concurrent requests to the server."),
        )
        .arg(
            Arg::new("shutdown_timeout")
                .long("shutdown-timeout")
                .value_name("SECONDS")
                .env("SHUTDOWN_TIMEOUT")
                .help("Maximum number of seconds to deliver queued metrics on shutdown."),
        )
}

pub fn make_app() -> Command {
    Command::new("tally")
        .disable_help_subcommand(true)
        .subcommand_required(true)
        .arg_required_else_help(true)
        .propagate_version(true)
        .max_term_width(79)
        .version(VERSION)
        .about(ABOUT)
        .arg(
            Arg::new("config")
                .value_name("CONFIG")
                .long("config")
                .short('c')
                .global(true)
                .value_parser(ValueParser::path_buf())
                .help("The path to the config folder."),
        )
        .subcommand(
            Command::new("run")
                .about("Run the server or the agent")
                .subcommand_required(true)
                .subcommand(server_command())
                .subcommand(agent_command()),
        )
        .subcommand(
            Command::new("config")
                .about("Manage the config")
                .subcommand_required(true)
                .subcommand(
                    Command::new("show")
                        .about("Show the entire config out for debugging purposes")
                        .after_help(
                            "This dumps out the entire config including the values which \
                             are not in the config file but filled in from defaults.",
                        ),
                ),
        )
        .subcommand(
            Command::new("healthcheck")
                .about("Check the health of a running server")
                .after_help(
                    "This requests the health check endpoint of a server and exits with \
                     status 0 if the server and its storage are healthy.",
                )
                .arg(
                    Arg::new("addr")
                        .long("addr")
                        .value_name("ADDR")
                        .value_parser(value_parser!(SocketAddr))
                        .help("The address of the server, defaults to the configured address."),
                )
                .arg(
                    Arg::new("timeout")
                        .long("timeout")
                        .value_name("SECONDS")
                        .value_parser(value_parser!(u64))
                        .default_value("5")
                        .help("Seconds to wait for the response."),
                ),
        )
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .short('v')
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Log at debug level, overriding the config."),
        )
}

/// Returns the config folder given on the command line, if any.
pub fn config_path(matches: &clap::ArgMatches) -> Option<&PathBuf> {
    matches.get_one::<PathBuf>("config")
}
