use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::ArgMatches;
use tally_agent::AgentService;
use tally_config::{Config, OverridableConfig};
use tally_system::Controller;
use tokio::runtime::Runtime;

use crate::cliapp::make_app;
use crate::{cliapp, healthcheck, setup};

/// Default config folder, relative to the working directory.
const DEFAULT_CONFIG_PATH: &str = ".tally";

fn string_arg(matches: &ArgMatches, name: &str) -> Option<String> {
    matches.get_one::<String>(name).cloned()
}

/// Extracts config overrides of the `run server` command.
fn extract_server_overrides(matches: &ArgMatches) -> OverridableConfig {
    OverridableConfig {
        address: string_arg(matches, "address"),
        key: string_arg(matches, "key"),
        store_interval: string_arg(matches, "store_interval"),
        file_storage_path: string_arg(matches, "file_storage_path"),
        restore: string_arg(matches, "restore"),
        database_dsn: string_arg(matches, "database_dsn"),
        audit_file: string_arg(matches, "audit_file"),
        audit_url: string_arg(matches, "audit_url"),
        shutdown_timeout: string_arg(matches, "shutdown_timeout"),
        ..Default::default()
    }
}

/// Extracts config overrides of the `run agent` command.
fn extract_agent_overrides(matches: &ArgMatches) -> OverridableConfig {
    OverridableConfig {
        address: string_arg(matches, "address"),
        key: string_arg(matches, "key").or_else(|| string_arg(matches, "hash_key")),
        poll_interval: string_arg(matches, "poll_interval"),
        report_interval: string_arg(matches, "report_interval"),
        rate_limit: string_arg(matches, "rate_limit"),
        shutdown_timeout: string_arg(matches, "shutdown_timeout"),
        ..Default::default()
    }
}

fn create_runtime() -> Result<Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .thread_name("tally")
        .enable_all()
        .build()
        .context("failed to start the async runtime")
}

/// Runs the command line application.
pub fn execute() -> Result<()> {
    let app = make_app();
    let matches = app.get_matches();
    let config_path = cliapp::config_path(&matches)
        .map(|path| path.as_path())
        .unwrap_or(Path::new(DEFAULT_CONFIG_PATH));

    let mut config = Config::from_path(config_path)?;

    if let Some(("run", run_matches)) = matches.subcommand() {
        let overrides = match run_matches.subcommand() {
            Some(("server", m)) => extract_server_overrides(m),
            Some(("agent", m)) => extract_agent_overrides(m),
            _ => unreachable!(),
        };
        config.apply_override(overrides)?;
    }

    let mut log_config = config.logging().clone();
    if matches.get_flag("verbose") {
        log_config.level = tally_log::LogLevel::Debug;
    }
    tally_log::init(&log_config);

    match matches.subcommand() {
        Some(("run", run_matches)) => match run_matches.subcommand() {
            Some(("server", _)) => run_server(config),
            Some(("agent", _)) => run_agent(config),
            _ => unreachable!(),
        },
        Some(("config", config_matches)) => manage_config(&config, config_matches),
        Some(("healthcheck", matches)) => healthcheck::healthcheck(&config, matches),
        _ => unreachable!(),
    }
}

pub fn manage_config(config: &Config, matches: &ArgMatches) -> Result<()> {
    match matches.subcommand() {
        Some(("show", _)) => {
            #[allow(clippy::print_stdout)]
            {
                print!("{}", config.to_yaml_string()?);
            }
            Ok(())
        }
        _ => unreachable!(),
    }
}

pub fn run_server(config: Config) -> Result<()> {
    setup::check_server_config(&config)?;
    setup::dump_spawn_infos(&config, "server");

    let config = Arc::new(config);
    create_runtime()?.block_on(async move {
        let controller = Controller::new();
        controller.start(config.shutdown_timeout());
        tally_server::run(config, controller.shutdown_handle()).await
    })?;

    tally_log::info!("server shut down");
    Ok(())
}

pub fn run_agent(config: Config) -> Result<()> {
    setup::check_agent_config(&config)?;
    setup::dump_spawn_infos(&config, "agent");

    let config = Arc::new(config);
    create_runtime()?.block_on(async move {
        let controller = Controller::new();
        controller.start(config.shutdown_timeout());

        let agent = AgentService::new(config)?;
        agent.run(controller.shutdown_handle()).await;
        Ok::<_, anyhow::Error>(())
    })?;

    tally_log::info!("agent shut down");
    Ok(())
}
