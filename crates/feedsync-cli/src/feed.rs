use color_eyre::Result;
use feedsync_client::RequestStats;
use feedsync_core::feed::{FeedItem, FeedRanking};
use tracing::info;

use crate::{
    auth::{self, client_report},
    cli::OutputArgs,
    config::Config,
    storage::Service,
};

pub async fn page(
    config: &Config,
    ranking: FeedRanking,
    limit: u32,
    cursor: Option<&str>,
    output: &OutputArgs,
) -> Result<()> {
    let service = auth::unlock(config).await?;
    let cancel = crate::interrupt_signal();
    let result = service
        .fetch_ranked_page(cursor, limit, ranking, &cancel)
        .await
        .map_err(client_report);
    let page = finish(&service, result, output)?;
    print_items(&page.items, output.json)?;
    if let Some(next) = page.next_cursor.filter(|_| page.has_next_page) {
        if output.json {
            info!(cursor = %next, "more items available");
        } else {
            println!("\nNext page: --cursor {next}");
        }
    }
    Ok(())
}

pub async fn search(config: &Config, query: &str, limit: u32, output: &OutputArgs) -> Result<()> {
    let service = auth::unlock(config).await?;
    let cancel = crate::interrupt_signal();
    let result = service
        .search(query, limit, &cancel)
        .await
        .map_err(client_report);
    let items = finish(&service, result, output)?;
    if items.is_empty() && !output.json {
        println!("No results for {query:?}");
    }
    print_items(&items, output.json)
}

pub async fn bookmarks(config: &Config, limit: u32, output: &OutputArgs) -> Result<()> {
    let service = auth::unlock(config).await?;
    let cancel = crate::interrupt_signal();
    let result = service
        .bookmarks(limit, &cancel)
        .await
        .map_err(client_report);
    let items = finish(&service, result, output)?;
    print_items(&items, output.json)
}

pub async fn article(config: &Config, url: &str, stats: bool) -> Result<()> {
    let service = auth::unlock(config).await?;
    let cancel = crate::interrupt_signal();
    let result = service
        .article_content(url, &cancel)
        .await
        .map_err(client_report);
    let output = OutputArgs { stats, json: false };
    let body = finish(&service, result, &output)?;
    println!("{body}");
    Ok(())
}

/// Print stats even when the request failed.
fn finish<R>(service: &Service, result: Result<R>, output: &OutputArgs) -> Result<R> {
    if output.stats {
        eprintln!("{}", format_stats(&service.client().stats()));
    }
    result
}

fn print_items(items: &[FeedItem], json: bool) -> Result<()> {
    for item in items {
        if json {
            println!("{}", serde_json::to_string(item)?);
        } else {
            println!("{}", format_item(item));
        }
    }
    Ok(())
}

pub fn format_item(item: &FeedItem) -> String {
    let mut meta = vec![
        format!("{} upvotes", item.upvotes),
        format!("{} comments", item.comments),
    ];
    if let Some(minutes) = item.read_time {
        meta.push(format!("{minutes} min read"));
    }
    if let Some(source) = &item.source {
        meta.push(source.clone());
    }
    let mut out = format!("{}\n  {}", item.title, meta.join(" | "));
    if let Some(url) = &item.url {
        out.push_str(&format!("\n  {url}"));
    }
    if !item.tags.is_empty() {
        out.push_str(&format!("\n  #{}", item.tags.join(" #")));
    }
    out
}

pub fn format_stats(stats: &RequestStats) -> String {
    format!(
        "Requests: {} total, {} ok, {} failed, {} rate limited, {} retried ({:.1}% success)",
        stats.total,
        stats.successful,
        stats.failed,
        stats.rate_limited,
        stats.retried,
        stats.success_rate()
    )
}
