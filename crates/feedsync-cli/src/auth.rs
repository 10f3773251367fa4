use std::{collections::BTreeMap, fs, io::BufRead, path::Path};

use chrono::{DateTime, Utc};
use color_eyre::{
    eyre::{eyre, Report, WrapErr},
    Result, Section,
};
use feedsync_client::ClientError;
use feedsync_core::{bundle::CredentialBundle, secret::SecretString, vault::CredentialVault};
use feedsync_session::{AuthError, SessionAuthenticator};
use serde::Deserialize;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::{
    cli::AuthCommand,
    config::Config,
    storage::{self, Service},
};

/// Read the vault password from here before prompting.
pub const PASSWORD_ENV: &str = "FEEDSYNC_PASSWORD";

/// Cookies and headers copied out of a logged-in browser.
#[derive(Debug, Deserialize)]
struct BrowserExport {
    cookies: BTreeMap<String, String>,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    /// Capture time as Unix seconds.
    #[serde(default)]
    timestamp: Option<f64>,
}

pub fn parse_export(contents: &str) -> Result<CredentialBundle> {
    let export: BrowserExport =
        serde_json::from_str(contents).wrap_err("browser export is not valid JSON")?;
    let captured_at = export.timestamp.and_then(timestamp_to_utc);
    let mut bundle = CredentialBundle::from_browser_export(export.cookies, export.headers);
    if let Some(at) = captured_at {
        bundle.captured_at = at;
    }
    bundle
        .validate()
        .map_err(|e| Report::new(AuthError::InvalidBundle(e)))?;
    Ok(bundle)
}

fn timestamp_to_utc(secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    let whole = secs.trunc() as i64;
    let nanos = ((secs - secs.trunc()) * 1e9) as u32;
    DateTime::from_timestamp(whole, nanos)
}

/// Password from `FEEDSYNC_PASSWORD`, else one line from stdin.
pub fn read_password() -> Result<SecretString> {
    if let Ok(value) = std::env::var(PASSWORD_ENV) {
        let value = Zeroizing::new(value);
        if !value.is_empty() {
            return Ok(SecretString::from(value.as_str()));
        }
    }
    eprint!("Vault password: ");
    let mut line = Zeroizing::new(String::new());
    std::io::stdin().lock().read_line(&mut line)?;
    let trimmed = line.trim_end_matches(['\r', '\n']);
    if trimmed.is_empty() {
        return Err(eyre!("empty password"));
    }
    Ok(SecretString::from(trimmed))
}

/// Attach the recovery hint to an auth failure.
pub fn auth_report(err: AuthError) -> Report {
    let hint = err.remediation();
    Report::new(err).suggestion(hint)
}

pub fn client_report(err: ClientError) -> Report {
    match err {
        ClientError::Auth(auth) => auth_report(auth),
        other if other.needs_reauthentication() => {
            Report::new(other).suggestion("run `feedsync auth login` and retry")
        }
        other => Report::new(other),
    }
}

/// Build the service and unlock it with the vault password.
pub async fn unlock(config: &Config) -> Result<Service> {
    let service = storage::service_from_config(config)?;
    let password = read_password()?;
    service.authenticate(&password).await.map_err(auth_report)?;
    if let Some(warning) = service.session().status().weak_protection {
        warn!(%warning, "weak credential protection");
    }
    Ok(service)
}

pub async fn handle(cmd: AuthCommand, config: &Config) -> Result<()> {
    match cmd {
        AuthCommand::Import { file } => import(&file, config).await,
        AuthCommand::Login => login(config).await,
        AuthCommand::Clear => clear(config).await,
        AuthCommand::Info => print_info(config),
    }
}

async fn import(file: &Path, config: &Config) -> Result<()> {
    let contents = Zeroizing::new(
        fs::read_to_string(file).wrap_err_with(|| format!("reading {}", file.display()))?,
    );
    let bundle = parse_export(&contents)?;
    let cookie_count = bundle.cookies.len();
    let vault = storage::vault_from_config(config)?;
    let session = SessionAuthenticator::new(vault, config.session());
    let password = read_password()?;
    let report = session
        .store_credentials(bundle, &password)
        .await
        .map_err(auth_report)?;
    info!(cookies = cookie_count, protection = ?report.protection, "credentials imported");
    println!(
        "Stored {cookie_count} cookie(s) at {}",
        session.vault().path().display()
    );
    if let Some(warning) = report.warning {
        eprintln!("warning: {warning}");
    }
    println!("The export file still holds plaintext cookies; delete it.");
    Ok(())
}

async fn login(config: &Config) -> Result<()> {
    let service = unlock(config).await?;
    let cancel = crate::interrupt_signal();
    if service.verify(&cancel).await.map_err(auth_report)? {
        print_session(&service);
        Ok(())
    } else {
        Err(eyre!("the service rejected the stored session")
            .suggestion("log in through the browser again and re-import the cookies"))
    }
}

async fn clear(config: &Config) -> Result<()> {
    let vault = storage::vault_from_config(config)?;
    vault
        .clear()
        .await
        .map_err(|e| auth_report(AuthError::from(e)))?;
    println!("Credentials cleared");
    Ok(())
}

fn print_info(config: &Config) -> Result<()> {
    let vault = storage::vault_from_config(config)?;
    let info = vault
        .info()
        .map_err(|e| auth_report(AuthError::from(e)))?;
    println!("Path: {}", info.path.display());
    if !info.exists {
        println!("Stored: no");
        return Ok(());
    }
    println!("Stored: yes");
    if let Some(size) = info.size {
        println!("Size: {size} bytes");
    }
    if let Some(mode) = info.mode {
        println!("Mode: {:o}", mode & 0o777);
    }
    if let Some(modified) = info.modified {
        println!("Modified: {}", modified.to_rfc3339());
    }
    match info.protection {
        Some(protection) => println!("Protection: {protection:?}"),
        None => println!("Protection: unreadable"),
    }
    Ok(())
}

pub async fn status(config: &Config) -> Result<()> {
    let service = unlock(config).await?;
    print_session(&service);
    Ok(())
}

pub async fn verify(config: &Config) -> Result<()> {
    login(config).await
}

fn print_session(service: &Service) {
    let status = service.status();
    println!("Session: {}", status.session.phase);
    if let Some(until) = status.valid_until {
        println!("Valid until: {}", until.to_rfc3339());
        println!(
            "Remaining: {}m",
            status.session.time_remaining.num_minutes().max(0)
        );
    }
    if let Some(captured) = status.session.captured_at {
        println!("Captured: {}", captured.to_rfc3339());
    }
    println!(
        "Cookies: {}, headers: {}",
        yes_no(status.session.has_cookies),
        yes_no(status.session.has_headers)
    );
    if let Some(category) = status.last_error {
        println!("Last error: {category}");
    }
    if let Some(warning) = status.session.weak_protection {
        eprintln!("warning: {warning}");
    }
}

fn yes_no(flag: bool) -> &'static str {
    if flag {
        "yes"
    } else {
        "no"
    }
}
