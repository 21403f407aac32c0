use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Result, format_err};
use clap::ArgMatches;
use reqwest::blocking::Client;
use tally_config::Config;
use tally_server::Status;

pub fn healthcheck(config: &Config, matches: &ArgMatches) -> Result<()> {
    let timeout = matches.get_one::<u64>("timeout").copied().unwrap_or(5);

    let addr = match matches.get_one::<SocketAddr>("addr") {
        Some(addr) => *addr,
        None => config.listen_addr()?,
    };

    let client = Client::builder()
        .timeout(Some(Duration::from_secs(timeout)))
        .build()?;

    let response = client.get(format!("http://{addr}/healthcheck")).send();

    match response {
        Ok(response) => {
            let status = response.status();
            let healthy = status.is_success()
                && response
                    .json::<Status>()
                    .is_ok_and(|status| status.is_healthy);

            if healthy {
                tally_log::info!("server at {addr} is healthy");
                Ok(())
            } else {
                tally_log::error!("server is unhealthy. Status code: {status}");
                Err(format_err!("server is unhealthy. Status code: {status}"))
            }
        }
        Err(err) => {
            tally_log::error!("server is unhealthy. Error: {err}");
            Err(err.into())
        }
    }
}
