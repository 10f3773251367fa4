//! GraphQL operations of the feed service and their response parsing.

use chrono::{DateTime, Utc};
use feedsync_core::feed::{FeedItem, FeedRanking, Page};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{classify::redacted_excerpt, client::GraphqlRequest};

/// Content types requested from the feed.
pub const SUPPORTED_TYPES: [&str; 2] = ["article", "video:youtube"];

/// Bookmarks fetched when no limit is given.
pub const DEFAULT_BOOKMARK_LIMIT: u32 = 100;

const POST_FIELDS: &str = "
        node {
          id
          title
          permalink
          summary
          createdAt
          readTime
          upvotes
          numComments
          tags
          source { name image }
          author { name image }
        }";

pub fn feed_request(first: u32, after: Option<&str>, ranking: FeedRanking) -> GraphqlRequest {
    let query = format!(
        "query Feed($first: Int, $after: String, $ranking: Ranking, $supportedTypes: [String!]) {{
  page: feed(first: $first, after: $after, ranking: $ranking, supportedTypes: $supportedTypes) {{
    edges {{{POST_FIELDS}
    }}
    pageInfo {{ hasNextPage endCursor }}
  }}
}}"
    );
    GraphqlRequest::new("Feed", query).with_variables(json!({
        "first": first,
        "after": after,
        "ranking": ranking.as_graphql(),
        "supportedTypes": SUPPORTED_TYPES,
    }))
}

pub fn search_request(text: &str, first: u32) -> GraphqlRequest {
    let query = format!(
        "query SearchPosts($query: String!, $first: Int) {{
  search: searchPosts(query: $query, first: $first) {{
    edges {{{POST_FIELDS}
    }}
  }}
}}"
    );
    GraphqlRequest::new("SearchPosts", query).with_variables(json!({
        "query": text,
        "first": first,
    }))
}

pub fn bookmarks_request(first: u32, after: Option<&str>) -> GraphqlRequest {
    let query = format!(
        "query UserBookmarks($first: Int, $after: String) {{
  bookmarks: userBookmarks(first: $first, after: $after) {{
    edges {{{POST_FIELDS}
    }}
    pageInfo {{ hasNextPage endCursor }}
  }}
}}"
    );
    GraphqlRequest::new("UserBookmarks", query).with_variables(json!({
        "first": first,
        "after": after,
    }))
}

/// Smallest authenticated query; used to confirm a session is accepted.
pub fn probe_request() -> GraphqlRequest {
    GraphqlRequest::new(
        "TestConnection",
        "query TestConnection { feed(first: 1) { edges { node { id title } } } }",
    )
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Connection {
    #[serde(default)]
    edges: Vec<Edge>,
    page_info: Option<PageInfo>,
}

#[derive(Deserialize)]
struct Edge {
    node: Node,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    #[serde(default)]
    has_next_page: bool,
    end_cursor: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Node {
    id: String,
    title: Option<String>,
    permalink: Option<String>,
    summary: Option<String>,
    created_at: Option<DateTime<Utc>>,
    read_time: Option<f64>,
    upvotes: Option<u32>,
    num_comments: Option<u32>,
    tags: Option<Vec<String>>,
    source: Option<Named>,
    author: Option<Named>,
}

#[derive(Deserialize)]
struct Named {
    name: Option<String>,
}

impl From<Node> for FeedItem {
    fn from(node: Node) -> Self {
        FeedItem {
            id: node.id,
            title: node.title.unwrap_or_default(),
            url: node.permalink,
            summary: node.summary.filter(|s| !s.is_empty()),
            created_at: node.created_at,
            read_time: node.read_time.map(|m| m.round().max(0.0) as u32),
            upvotes: node.upvotes.unwrap_or(0),
            comments: node.num_comments.unwrap_or(0),
            tags: node.tags.unwrap_or_default(),
            source: node.source.and_then(|s| s.name),
            author: node.author.and_then(|a| a.name),
        }
    }
}

/// Parse the connection under `data[field]` into a page.
pub fn parse_page(data: &Value, field: &str) -> Result<Page, String> {
    let raw = data
        .get(field)
        .ok_or_else(|| format!("response has no `{field}` field"))?;
    let connection = Connection::deserialize(raw).map_err(|e| {
        format!(
            "unexpected `{field}` shape: {}",
            redacted_excerpt(e.to_string().as_bytes())
        )
    })?;
    let (has_next_page, next_cursor) = match connection.page_info {
        Some(info) => (info.has_next_page, info.end_cursor),
        None => (false, None),
    };
    Ok(Page {
        items: connection.edges.into_iter().map(|e| e.node.into()).collect(),
        next_cursor,
        has_next_page,
    })
}
