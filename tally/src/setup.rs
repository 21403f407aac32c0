use anyhow::{Context, Result};
use tally_config::Config;

/// Validates the config of the server before binding anything.
pub fn check_server_config(config: &Config) -> Result<()> {
    config
        .listen_addr()
        .context("the server cannot listen on the configured address")?;

    if config.database_path().is_some() && config.restore() {
        tally_log::warn!("restore has no effect when a database is configured");
    }

    if config.database_path().is_none() && config.file_storage_path().is_none() && config.restore()
    {
        anyhow::bail!("restore requires a file storage path");
    }

    if let Some(url) = config.audit_url()
        && !url.starts_with("http://")
        && !url.starts_with("https://")
    {
        anyhow::bail!("the audit url must be an http or https url, got {url:?}");
    }

    Ok(())
}

/// Validates the config of the agent.
pub fn check_agent_config(config: &Config) -> Result<()> {
    if config.upstream_address().is_empty() {
        anyhow::bail!("the agent has no server address");
    }

    if config.report_interval() < config.poll_interval() {
        tally_log::warn!(
            "report interval {:?} is shorter than poll interval {:?}, reports will repeat values",
            config.report_interval(),
            config.poll_interval(),
        );
    }

    Ok(())
}

/// Print spawn infos to the log.
pub fn dump_spawn_infos(config: &Config, mode: &str) {
    if config.path().as_os_str().is_empty() {
        tally_log::info!("launching tally {mode} without config folder");
    } else {
        tally_log::info!(
            "launching tally {mode} from config folder {}",
            config.path().display()
        );
    }

    match config.shared_key() {
        Some(_) => tally_log::info!("  payload signatures: enabled"),
        None => tally_log::info!("  payload signatures: disabled"),
    }

    match mode {
        "server" => {
            match (config.database_path(), config.file_storage_path()) {
                (Some(path), _) => tally_log::info!("  storage: sqlite {}", path.display()),
                (None, Some(path)) => {
                    tally_log::info!("  storage: memory, snapshot {}", path.display())
                }
                (None, None) => tally_log::info!("  storage: memory"),
            }
            match config.store_interval() {
                Some(interval) => tally_log::info!("  store interval: {interval:?}"),
                None => tally_log::info!("  store interval: synchronous"),
            }
        }
        _ => {
            tally_log::info!("  server: {}", config.upstream_address());
            tally_log::info!("  poll interval: {:?}", config.poll_interval());
            tally_log::info!("  report interval: {:?}", config.report_interval());
            tally_log::info!("  rate limit: {}", config.rate_limit());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(json: serde_json::Value) -> Config {
        Config::from_json_value(json).unwrap()
    }

    #[test]
    fn test_restore_requires_snapshot() {
        let config = load(serde_json::json!({
            "server": {"restore": true, "file_storage_path": null}
        }));
        assert!(check_server_config(&config).is_err());
    }

    #[test]
    fn test_audit_url_scheme() {
        let config = load(serde_json::json!({"audit": {"url": "ftp://audit"}}));
        assert!(check_server_config(&config).is_err());

        let config = load(serde_json::json!({
            "server": {"address": "127.0.0.1:0"},
            "audit": {"url": "http://localhost:9000/audit"}
        }));
        assert!(check_server_config(&config).is_ok());
    }

    #[test]
    fn test_default_agent_config() {
        assert!(check_agent_config(&Config::default()).is_ok());
    }
}
