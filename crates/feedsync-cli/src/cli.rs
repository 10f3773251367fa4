use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use feedsync_core::feed::FeedRanking;

/// CLI surface definition.
#[derive(Parser, Debug)]
#[command(
    name = "feedsync",
    about = "Encrypted session vault and rate-limited feed client",
    version,
    propagate_version = true
)]
pub struct Cli {
    /// Subcommand; defaults to `status` when absent.
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Manage stored browser session credentials.
    #[command(subcommand)]
    Auth(AuthCommand),
    /// Unlock the vault and show session state.
    Status,
    /// Unlock the vault and confirm the session with the service.
    Verify,
    /// Fetch one page of the feed.
    Feed {
        #[arg(long, default_value_t = FeedRanking::Popular)]
        ranking: FeedRanking,
        #[arg(long, default_value_t = 20)]
        limit: u32,
        /// Cursor returned by a previous page.
        #[arg(long)]
        cursor: Option<String>,
        #[command(flatten)]
        output: OutputArgs,
    },
    /// Search posts.
    Search {
        #[arg(required = true)]
        query: Vec<String>,
        #[arg(long, default_value_t = 20)]
        limit: u32,
        #[command(flatten)]
        output: OutputArgs,
    },
    /// List bookmarked posts.
    Bookmarks {
        #[arg(long, default_value_t = 100)]
        limit: u32,
        #[command(flatten)]
        output: OutputArgs,
    },
    /// Print the full page of an article.
    Article {
        url: String,
        /// Print request statistics afterwards.
        #[arg(long)]
        stats: bool,
    },
    /// Manage CLI configuration.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print version and exit.
    Version,
}

#[derive(Args, Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputArgs {
    /// Print request statistics afterwards.
    #[arg(long)]
    pub stats: bool,
    /// Print items as JSON lines.
    #[arg(long)]
    pub json: bool,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum AuthCommand {
    /// Encrypt a browser export (`{"cookies": {...}, "headers": {...}}`) into the vault.
    Import { file: PathBuf },
    /// Unlock the vault and check the session with the service.
    Login,
    /// Overwrite and delete the stored credentials.
    Clear,
    /// Show the credential file without decrypting it.
    Info,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum ConfigCommand {
    /// Create a default config file if one does not exist.
    Init,
}
