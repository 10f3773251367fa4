use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use feedsync_core::{
    cancel::Cancellation,
    clock::{Clock, SystemClock},
    error::ErrorCategory,
    feed::{FeedItem, FeedRanking, Page},
    secret::SecretString,
    vault::CredentialVault,
};
use feedsync_session::{AuthError, SessionAuthenticator, SessionStatus};
use tracing::{info, instrument};

use crate::{
    client::{GraphqlRequest, RequestStats, ResilientClient},
    error::ClientError,
    feed,
    transport::Transport,
};

/// What callers see of the service at a glance.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceStatus {
    pub authenticated: bool,
    pub valid_until: Option<DateTime<Utc>>,
    pub last_error: Option<ErrorCategory>,
    pub session: SessionStatus,
    pub stats: RequestStats,
}

/// Session plus client: the operations the sync layer consumes.
pub struct FeedService<V, T, C = SystemClock> {
    session: SessionAuthenticator<V, C>,
    client: ResilientClient<T>,
    last_error: Mutex<Option<ErrorCategory>>,
}

impl<V, T, C> FeedService<V, T, C>
where
    V: CredentialVault,
    T: Transport,
    C: Clock,
{
    pub fn new(session: SessionAuthenticator<V, C>, client: ResilientClient<T>) -> Self {
        Self {
            session,
            client,
            last_error: Mutex::new(None),
        }
    }

    pub fn session(&self) -> &SessionAuthenticator<V, C> {
        &self.session
    }

    pub fn client(&self) -> &ResilientClient<T> {
        &self.client
    }

    pub async fn authenticate(&self, password: &SecretString) -> Result<(), AuthError> {
        self.session.authenticate(password).await
    }

    /// Confirm with the remote service that the session is still accepted.
    pub async fn verify(&self, cancel: &Cancellation) -> Result<bool, AuthError> {
        let accepted = self.session.verify(&self.client, cancel).await?;
        if !accepted {
            self.set_last_error(Some(ErrorCategory::AuthExpired));
        }
        Ok(accepted)
    }

    /// One page of the default (popular) feed.
    pub async fn fetch_page(
        &self,
        cursor: Option<&str>,
        page_size: u32,
        cancel: &Cancellation,
    ) -> Result<Page, ClientError> {
        self.fetch_ranked_page(cursor, page_size, FeedRanking::default(), cancel)
            .await
    }

    #[instrument(skip_all, fields(page_size = page_size, ranking = %ranking))]
    pub async fn fetch_ranked_page(
        &self,
        cursor: Option<&str>,
        page_size: u32,
        ranking: FeedRanking,
        cancel: &Cancellation,
    ) -> Result<Page, ClientError> {
        if page_size == 0 {
            return Ok(Page::default());
        }
        self.query_page(&feed::feed_request(page_size, cursor, ranking), "page", cancel)
            .await
    }

    #[instrument(skip_all, fields(limit = limit))]
    pub async fn search(
        &self,
        query: &str,
        limit: u32,
        cancel: &Cancellation,
    ) -> Result<Vec<FeedItem>, ClientError> {
        if limit == 0 || query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let page = self
            .query_page(&feed::search_request(query.trim(), limit), "search", cancel)
            .await?;
        Ok(page.items)
    }

    /// Up to `limit` bookmarks, following cursors as needed.
    #[instrument(skip_all, fields(limit = limit))]
    pub async fn bookmarks(
        &self,
        limit: u32,
        cancel: &Cancellation,
    ) -> Result<Vec<FeedItem>, ClientError> {
        let limit = limit as usize;
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;
        while items.len() < limit {
            let first = (limit - items.len()).min(feed::DEFAULT_BOOKMARK_LIMIT as usize) as u32;
            let request = feed::bookmarks_request(first, cursor.as_deref());
            let page = self.query_page(&request, "bookmarks", cancel).await?;
            let fetched = page.items.len();
            items.extend(page.items);
            match page.next_cursor {
                Some(next) if page.has_next_page && fetched > 0 => cursor = Some(next),
                _ => break,
            }
        }
        items.truncate(limit);
        info!(count = items.len(), "bookmarks fetched");
        Ok(items)
    }

    /// Full body of an article page, fetched with the session.
    #[instrument(skip_all)]
    pub async fn article_content(
        &self,
        url: &str,
        cancel: &Cancellation,
    ) -> Result<String, ClientError> {
        let result = self
            .client
            .fetch_document_authenticated(&self.session, url, cancel)
            .await
            .map(|document| document.body);
        self.note_result(&result);
        result
    }

    pub fn logout(&self) {
        self.session.logout();
    }

    pub fn last_error(&self) -> Option<ErrorCategory> {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> ServiceStatus {
        let session = self.session.status();
        ServiceStatus {
            authenticated: session.authenticated,
            valid_until: session.valid_until,
            last_error: self.last_error(),
            stats: self.client.stats(),
            session,
        }
    }

    fn set_last_error(&self, category: Option<ErrorCategory>) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = category;
    }

    async fn query_page(
        &self,
        request: &GraphqlRequest,
        field: &str,
        cancel: &Cancellation,
    ) -> Result<Page, ClientError> {
        let result = self
            .client
            .execute_authenticated(&self.session, request, cancel)
            .await
            .and_then(|response| {
                feed::parse_page(&response.data, field).map_err(|detail| ClientError::Request {
                    category: ErrorCategory::Malformed,
                    attempts: response.attempts,
                    status: None,
                    detail,
                })
            });
        self.note_result(&result);
        result
    }

    fn note_result<R>(&self, result: &Result<R, ClientError>) {
        match result {
            Ok(_) => self.set_last_error(None),
            Err(ClientError::NotAuthenticated { .. }) => {
                self.set_last_error(Some(ErrorCategory::AuthExpired))
            }
            Err(err) => {
                if let Some(category) = err.category() {
                    self.set_last_error(Some(category));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;
    use feedsync_core::{bundle::CredentialBundle, clock::ManualClock, vault::InMemoryVault};
    use feedsync_session::{SessionConfig, SessionPhase};
    use serde_json::{json, Value};

    use super::*;
    use std::time::Duration;

    use crate::{
        client::ClientConfig,
        throttle::Throttle,
        transport::{Method, ScriptedTransport, TransportResponse},
    };

    type TestService = FeedService<InMemoryVault, ScriptedTransport, ManualClock>;

    async fn service(clock: ManualClock) -> TestService {
        let vault = InMemoryVault::new();
        vault
            .store(
                CredentialBundle::new([("token", "abc")]),
                &SecretString::from("correct"),
            )
            .await
            .expect("store");
        let session = SessionAuthenticator::with_clock(
            vault,
            SessionConfig {
                ttl: ChronoDuration::hours(24),
            },
            clock,
        );
        let client = ResilientClient::new(
            ScriptedTransport::new(),
            Throttle::default(),
            ClientConfig::default(),
        );
        FeedService::new(session, client)
    }

    fn edges(ids: &[&str]) -> Value {
        Value::Array(
            ids.iter()
                .map(|id| json!({"node": {"id": id, "title": format!("t-{id}")}}))
                .collect(),
        )
    }

    fn connection(field: &str, ids: &[&str], next: Option<&str>) -> TransportResponse {
        let mut data = serde_json::Map::new();
        data.insert(
            field.to_string(),
            json!({
                "edges": edges(ids),
                "pageInfo": {"hasNextPage": next.is_some(), "endCursor": next}
            }),
        );
        TransportResponse::json(200, &json!({ "data": Value::Object(data) }))
    }

    #[tokio::test(start_paused = true)]
    async fn operations_require_authentication() {
        let service = service(ManualClock::default()).await;
        let err = service
            .fetch_page(None, 10, &Cancellation::none())
            .await
            .expect_err("not authenticated");
        assert_eq!(
            err,
            ClientError::NotAuthenticated {
                phase: SessionPhase::Unauthenticated
            }
        );
        assert!(!service.status().authenticated);
        assert_eq!(service.client().transport().calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_page_returns_items_and_cursor() {
        let service = service(ManualClock::default()).await;
        service
            .authenticate(&SecretString::from("correct"))
            .await
            .expect("authenticate");
        service
            .client()
            .transport()
            .respond(connection("page", &["a", "b"], Some("b")));

        let page = service
            .fetch_ranked_page(None, 2, FeedRanking::Recent, &Cancellation::none())
            .await
            .expect("page");
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.next_cursor.as_deref(), Some("b"));

        let requests = service.client().transport().requests();
        assert_eq!(requests[0].1.body["variables"]["ranking"], "TIME");

        let status = service.status();
        assert!(status.authenticated);
        assert!(status.valid_until.is_some());
        assert_eq!(status.last_error, None);
        assert_eq!(status.stats.successful, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn search_returns_items() {
        let service = service(ManualClock::default()).await;
        service
            .authenticate(&SecretString::from("correct"))
            .await
            .expect("authenticate");
        service
            .client()
            .transport()
            .respond(connection("search", &["x"], None));

        let items = service
            .search("rust", 5, &Cancellation::none())
            .await
            .expect("search");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].title, "t-x");

        let blank = service
            .search("   ", 5, &Cancellation::none())
            .await
            .expect("blank");
        assert!(blank.is_empty());
        assert_eq!(service.client().transport().calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn bookmarks_follow_cursors_up_to_limit() {
        let service = service(ManualClock::default()).await;
        service
            .authenticate(&SecretString::from("correct"))
            .await
            .expect("authenticate");
        service
            .client()
            .transport()
            .respond(connection("bookmarks", &["1", "2"], Some("c1")))
            .respond(connection("bookmarks", &["3", "4"], Some("c2")));

        let items = service
            .bookmarks(3, &Cancellation::none())
            .await
            .expect("bookmarks");
        assert_eq!(
            items.iter().map(|i| i.id.as_str()).collect::<Vec<_>>(),
            ["1", "2", "3"]
        );
        let requests = service.client().transport().requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].1.body["variables"]["after"], "c1");
        assert_eq!(requests[1].1.body["variables"]["first"], 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_are_reported_in_status() {
        let service = service(ManualClock::default()).await;
        service
            .authenticate(&SecretString::from("correct"))
            .await
            .expect("authenticate");
        let transport = service.client().transport();
        transport
            .respond(TransportResponse::json(200, &json!({"data": {"unexpected": {}}})))
            .respond(connection("page", &["a"], None));

        let err = service
            .fetch_page(None, 1, &Cancellation::none())
            .await
            .expect_err("malformed");
        assert_eq!(err.category(), Some(ErrorCategory::Malformed));
        assert_eq!(service.status().last_error, Some(ErrorCategory::Malformed));

        service
            .fetch_page(None, 1, &Cancellation::none())
            .await
            .expect("page");
        assert_eq!(service.last_error(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn article_content_is_throttled_and_counted() {
        let service = service(ManualClock::default()).await;
        service
            .authenticate(&SecretString::from("correct"))
            .await
            .expect("authenticate");
        let transport = service.client().transport();
        transport
            .respond(TransportResponse::new(503, "busy"))
            .respond(TransportResponse::new(200, "<article>Hello</article>"))
            .respond(TransportResponse::new(200, "<article>Elsewhere</article>"));

        let body = service
            .article_content("https://app.daily.dev/posts/hello", &Cancellation::none())
            .await
            .expect("article");
        assert_eq!(body, "<article>Hello</article>");

        service
            .article_content("https://blog.example.com/post", &Cancellation::none())
            .await
            .expect("external article");

        let requests = transport.requests();
        assert_eq!(requests.len(), 3);
        assert!(requests.iter().all(|(_, r)| r.method == Method::Get));
        assert!(requests[1].0 - requests[0].0 >= Duration::from_secs(1));
        assert!(requests[2].0 - requests[1].0 >= Duration::from_secs(1));
        assert_eq!(
            requests[1].1.header("cookie").map(SecretString::expose),
            Some("token=abc")
        );
        assert!(requests[2].1.header("cookie").is_none());

        let stats = service.status().stats;
        assert_eq!((stats.total, stats.successful, stats.failed), (3, 2, 1));
        assert_eq!(stats.retried, 1);
        assert_eq!(service.last_error(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn article_content_failures_follow_the_policy() {
        let service = service(ManualClock::default()).await;
        assert!(matches!(
            service
                .article_content("https://app.daily.dev/posts/x", &Cancellation::none())
                .await,
            Err(ClientError::NotAuthenticated { .. })
        ));

        service
            .authenticate(&SecretString::from("correct"))
            .await
            .expect("authenticate");
        let err = service
            .article_content("ftp://example.com/file", &Cancellation::none())
            .await
            .expect_err("unsupported scheme");
        assert_eq!(err.category(), Some(ErrorCategory::Fatal));
        assert_eq!(service.client().transport().calls(), 0);

        service
            .client()
            .transport()
            .respond(TransportResponse::new(401, ""));
        let err = service
            .article_content("https://app.daily.dev/posts/x", &Cancellation::none())
            .await
            .expect_err("rejected");
        assert_eq!(err.category(), Some(ErrorCategory::AuthExpired));
        assert_eq!(service.session().status().phase, SessionPhase::Expired);
        assert_eq!(service.last_error(), Some(ErrorCategory::AuthExpired));
    }

    #[tokio::test(start_paused = true)]
    async fn logout_ends_the_session() {
        let service = service(ManualClock::default()).await;
        service
            .authenticate(&SecretString::from("correct"))
            .await
            .expect("authenticate");
        service.logout();
        assert!(!service.status().authenticated);
        assert!(service
            .search("rust", 5, &Cancellation::none())
            .await
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_verify_marks_auth_error() {
        let service = service(ManualClock::default()).await;
        service
            .authenticate(&SecretString::from("correct"))
            .await
            .expect("authenticate");
        service
            .client()
            .transport()
            .respond(TransportResponse::new(403, ""));

        let accepted = service.verify(&Cancellation::none()).await.expect("verify");
        assert!(!accepted);
        let status = service.status();
        assert!(!status.authenticated);
        assert_eq!(status.session.phase, SessionPhase::Expired);
        assert_eq!(status.last_error, Some(ErrorCategory::AuthExpired));
    }
}
