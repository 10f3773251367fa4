mod auth;
mod cli;
mod config;
mod feed;
mod storage;

use crate::cli::{Command, ConfigCommand};
use clap::Parser;
use color_eyre::Result;
use feedsync_core::cancel::Cancellation;
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Entry point wiring the CLI to the vault, session and feed client.
#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    let cli = cli::Cli::parse();
    let config = config::load()?;
    match cli.command.unwrap_or(Command::Status) {
        Command::Auth(cmd) => auth::handle(cmd, &config).await?,
        Command::Status => auth::status(&config).await?,
        Command::Verify => auth::verify(&config).await?,
        Command::Feed {
            ranking,
            limit,
            cursor,
            output,
        } => feed::page(&config, ranking, limit, cursor.as_deref(), &output).await?,
        Command::Search {
            query,
            limit,
            output,
        } => feed::search(&config, &query.join(" "), limit, &output).await?,
        Command::Bookmarks { limit, output } => feed::bookmarks(&config, limit, &output).await?,
        Command::Article { url, stats } => feed::article(&config, &url, stats).await?,
        Command::Config(ConfigCommand::Init) => init_config(&config)?,
        Command::Version => print_version(),
    }

    Ok(())
}

fn init_tracing() {
    // Logs go to stderr so stdout stays parseable with --json.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

fn print_version() {
    println!("feedsync {}", env!("CARGO_PKG_VERSION"));
}

/// Cancellation fired by Ctrl-C; in-flight requests stop at the next wait.
pub(crate) fn interrupt_signal() -> Cancellation {
    let (handle, cancel) = Cancellation::pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted; cancelling");
            handle.cancel();
        }
    });
    cancel
}

fn init_config(config: &config::Config) -> Result<()> {
    let path = config::write_default_if_missing(config)?;
    println!("Config ready at {}", path.display());
    Ok(())
}
