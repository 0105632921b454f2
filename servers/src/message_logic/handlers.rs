//! # Message HTTP API
//!
//! - `POST /channels/{channel_id}/messages` with `{sender_id, content}`
//!   returns `201 {message_id, created_at}`.
//! - `GET /channels/{channel_id}/messages?limit=&before=` returns a page of
//!   the channel's history, most recent first. Without `before` the page comes
//!   from the recent-history cache; with it (unix seconds) from the database.
//!
//! A read that lost the cache rebuild race answers `503` with
//! `Retry-After`, so the caller retries instead of hammering the database.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::post,
};
use lib_fanout::core::CacheError;
use lib_fanout::models::ChannelMessage;
use lib_fanout::services::ServiceError;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, warn};

use super::state::AppState;
use crate::health;

#[derive(Debug, Deserialize, Serialize)]
pub struct CreateMessageBody {
    #[serde(alias = "user_id")]
    pub sender_id: String,
    pub content: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct CreatedMessage {
    pub message_id: String,
    pub created_at: i64,
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
    pub before: Option<i64>,
}

/// The service API plus `GET /health`.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/channels/{channel_id}/messages", post(create_message).get(recent_messages))
        .with_state(state)
        .merge(health::router())
}

pub async fn create_message(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
    Json(body): Json<CreateMessageBody>,
) -> Result<(StatusCode, Json<CreatedMessage>), ApiError> {
    let message = state
        .messages
        .create_message(&channel_id, &body.sender_id, &body.content)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(CreatedMessage {
            message_id: message.message_id,
            created_at: message.created_at,
        }),
    ))
}

pub async fn recent_messages(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<ChannelMessage>>, ApiError> {
    let messages = state
        .messages
        .history_page(&channel_id, query.before, query.limit)
        .await?;
    Ok(Json(messages))
}

/// Maps service failures onto HTTP responses.
#[derive(Debug)]
pub struct ApiError(ServiceError);

impl From<ServiceError> for ApiError {
    fn from(error: ServiceError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let detail = self.0.to_string();
        match self.0 {
            ServiceError::Validation(_) => {
                (StatusCode::BAD_REQUEST, Json(json!({"error_type": "InvalidRequest", "message": detail}))).into_response()
            }
            ServiceError::Cache(CacheError::Contended(_)) => {
                warn!(%detail, "cache rebuild contended");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    [(header::RETRY_AFTER, "1")],
                    Json(json!({"error_type": "Contended", "message": detail})),
                )
                    .into_response()
            }
            ServiceError::Bus(_) => {
                error!(%detail, "message bus unavailable");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(json!({"error_type": "BusUnavailable", "message": detail})),
                )
                    .into_response()
            }
            ServiceError::Cache(_) | ServiceError::Encode(_) | ServiceError::Repository(_) => {
                error!(%detail, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({"error_type": "Internal", "message": detail})),
                )
                    .into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use lib_fanout::connections::{BusError, BusPublisher, KvStore, MemoryStore, MessageRepository, RepoError};
    use lib_fanout::core::message_cache::lock_key;
    use lib_fanout::core::{CacheSettings, DistributedLock, MessageCache};
    use lib_fanout::services::MessageService;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Default)]
    struct NullBus;

    #[async_trait]
    impl BusPublisher for NullBus {
        async fn publish(&self, _subject: &str, _payload: Bytes) -> Result<(), BusError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct VecRepo(Mutex<Vec<ChannelMessage>>);

    #[async_trait]
    impl MessageRepository for VecRepo {
        async fn insert(&self, message: &ChannelMessage) -> Result<(), RepoError> {
            self.0.lock().unwrap().push(message.clone());
            Ok(())
        }

        async fn recent_for_channel(&self, channel_id: &str, limit: usize) -> Result<Vec<ChannelMessage>, RepoError> {
            let mut rows: Vec<_> = self.0.lock().unwrap().iter().filter(|m| m.channel_id == channel_id).cloned().collect();
            rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            rows.truncate(limit);
            Ok(rows)
        }

        async fn messages_before(
            &self,
            channel_id: &str,
            before_unix: i64,
            limit: usize,
        ) -> Result<Vec<ChannelMessage>, RepoError> {
            let mut rows: Vec<_> = self
                .0
                .lock()
                .unwrap()
                .iter()
                .filter(|m| m.channel_id == channel_id && m.created_at < before_unix)
                .cloned()
                .collect();
            rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            rows.truncate(limit);
            Ok(rows)
        }
    }

    fn app_state(store: &Arc<MemoryStore>) -> AppState {
        app_state_with(store, Arc::new(VecRepo::default()))
    }

    fn app_state_with(store: &Arc<MemoryStore>, repo: Arc<VecRepo>) -> AppState {
        let settings = CacheSettings {
            lock_wait: Duration::from_millis(10),
            ..CacheSettings::default()
        };
        let messages = MessageService::new(
            MessageCache::new(Arc::clone(store) as Arc<dyn KvStore>, settings),
            repo as Arc<dyn MessageRepository>,
            Arc::new(NullBus) as Arc<dyn BusPublisher>,
            "channel.message",
            50,
        );
        AppState {
            messages: Arc::new(messages),
        }
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_create_then_list() {
        let store = Arc::new(MemoryStore::new());
        let state = app_state(&store);

        let body = CreateMessageBody {
            sender_id: "u1".into(),
            content: "hello".into(),
        };
        let response = create_message(State(state.clone()), Path("c1".to_string()), Json(body))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::CREATED);
        let created = body_json(response).await;
        let message_id = created["message_id"].as_str().unwrap().to_string();
        assert!(message_id.starts_with("message_"));

        let response = recent_messages(State(state), Path("c1".to_string()), Query(HistoryQuery::default()))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let listed = body_json(response).await;
        assert_eq!(listed[0]["message_id"], message_id.as_str());
        assert_eq!(listed[0]["sender_id"], "u1");
    }

    #[tokio::test]
    async fn test_blank_content_is_bad_request() {
        let store = Arc::new(MemoryStore::new());
        let body = CreateMessageBody {
            sender_id: "u1".into(),
            content: "   ".into(),
        };
        let response = create_message(State(app_state(&store)), Path("c1".to_string()), Json(body))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_contended_rebuild_is_service_unavailable() {
        let store = Arc::new(MemoryStore::new());
        let state = app_state(&store);
        let _held = DistributedLock::new(Arc::clone(&store) as Arc<dyn KvStore>, lock_key("busy"), Duration::from_secs(10))
            .try_acquire()
            .await
            .unwrap()
            .unwrap();

        let response = recent_messages(State(state), Path("busy".to_string()), Query(HistoryQuery::default()))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[header::RETRY_AFTER], "1");
    }

    #[tokio::test]
    async fn test_before_cursor_pages_from_database() {
        let store = Arc::new(MemoryStore::new());
        let repo = Arc::new(VecRepo::default());
        for (id, at) in [("m1", 100), ("m2", 200), ("m3", 300)] {
            repo.0.lock().unwrap().push(ChannelMessage {
                message_id: id.to_string(),
                channel_id: "c9".to_string(),
                sender_id: "u1".to_string(),
                content: id.to_string(),
                created_at: at,
            });
        }
        let state = app_state_with(&store, repo);

        let query = HistoryQuery {
            limit: Some(1),
            before: Some(300),
        };
        let response = recent_messages(State(state.clone()), Path("c9".to_string()), Query(query))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let page = body_json(response).await;
        assert_eq!(page.as_array().unwrap().len(), 1);
        assert_eq!(page[0]["message_id"], "m2");

        let query = HistoryQuery {
            limit: Some(0),
            before: None,
        };
        let response = recent_messages(State(state), Path("c9".to_string()), Query(query))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_history_query_parses_from_url() {
        let query: HistoryQuery = parse_query("limit=20&before=1700000000");
        assert_eq!(query.limit, Some(20));
        assert_eq!(query.before, Some(1_700_000_000));
    }

    fn parse_query(raw: &str) -> HistoryQuery {
        let uri: axum::http::Uri = format!("/channels/c1/messages?{raw}").parse().unwrap();
        Query::<HistoryQuery>::try_from_uri(&uri).unwrap().0
    }

    #[test]
    fn test_legacy_user_id_field_is_accepted() {
        let body: CreateMessageBody = serde_json::from_str(r#"{"user_id":"u7","content":"hi"}"#).unwrap();
        assert_eq!(body.sender_id, "u7");
    }
}
