use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Feed ordering offered by the remote service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedRanking {
    #[default]
    Popular,
    Recent,
    Trending,
}

impl FeedRanking {
    /// Value of the GraphQL `Ranking` enum. The service has no trending
    /// ranking, so it maps onto popularity.
    pub fn as_graphql(&self) -> &'static str {
        match self {
            FeedRanking::Popular | FeedRanking::Trending => "POPULARITY",
            FeedRanking::Recent => "TIME",
        }
    }
}

impl fmt::Display for FeedRanking {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FeedRanking::Popular => "popular",
            FeedRanking::Recent => "recent",
            FeedRanking::Trending => "trending",
        })
    }
}

impl FromStr for FeedRanking {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "popular" => Ok(FeedRanking::Popular),
            "recent" => Ok(FeedRanking::Recent),
            "trending" => Ok(FeedRanking::Trending),
            other => Err(format!("unknown ranking: {other}")),
        }
    }
}

/// A post from the feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedItem {
    pub id: String,
    pub title: String,
    pub url: Option<String>,
    pub summary: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub read_time: Option<u32>,
    pub upvotes: u32,
    pub comments: u32,
    pub tags: Vec<String>,
    pub source: Option<String>,
    pub author: Option<String>,
}

/// One page of a cursor-paginated listing.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Page {
    pub items: Vec<FeedItem>,
    pub next_cursor: Option<String>,
    pub has_next_page: bool,
}
