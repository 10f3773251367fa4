use std::path::PathBuf;

use color_eyre::{eyre::eyre, Result};
use dirs::data_dir;
use feedsync_client::{FeedService, HttpTransport, ResilientClient, Throttle};
use feedsync_session::SessionAuthenticator;
use feedsync_vault::file_vault::FileVault;
use tracing::debug;

use crate::config::Config;

pub type Service = FeedService<FileVault, HttpTransport>;

/// Resolve the default data directory for feedsync.
pub fn default_data_dir() -> Result<PathBuf> {
    let base = data_dir().ok_or_else(|| eyre!("no data dir available"))?;
    Ok(base.join("feedsync"))
}

/// Credential file location, honoring the config override.
pub fn vault_path(config: &Config) -> Result<PathBuf> {
    match &config.vault_path {
        Some(path) => Ok(path.clone()),
        None => Ok(default_data_dir()?.join("credentials.enc")),
    }
}

pub fn vault_from_config(config: &Config) -> Result<FileVault> {
    let path = vault_path(config)?;
    debug!(path = %path.display(), "using credential vault");
    Ok(FileVault::with_options(path, config.vault()))
}

/// Vault, session and HTTP client wired from config.
pub fn service_from_config(config: &Config) -> Result<Service> {
    let session = SessionAuthenticator::new(vault_from_config(config)?, config.session());
    let transport = HttpTransport::new(config.request_timeout())?;
    let client = ResilientClient::new(
        transport,
        Throttle::new(config.min_interval()),
        config.client(),
    );
    Ok(FeedService::new(session, client))
}
