//! HTTP + WebSocket implementation of [`RemoteService`].
//!
//! Collections are fetched and written over a small REST surface;
//! change events arrive over a per-filter WebSocket subscription and
//! are forwarded onto a bounded channel.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, trace, warn};

use tandem_core::{ChangeEvent, ChangeOp, Entity, ResourceFilter, decode_entity, decode_rows};

use crate::error::SyncError;
use crate::remote::{ChangeStream, RemoteService, WriteOp};

/// Buffered change events per subscription before backpressure.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Remote data service spoken over HTTP, with WebSocket push.
pub struct HttpRemoteService {
    http: Client,
    base_url: String,
    ws_url: String,
}

impl HttpRemoteService {
    /// Create a client for the given service URL. The WebSocket
    /// endpoint is derived from it (`http` becomes `ws`).
    pub fn new(base_url: impl Into<String>) -> Self {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build HTTP client");

        let base_url = base_url.into().trim_end_matches('/').to_string();
        let ws_url = derive_ws_url(&base_url);
        Self {
            http,
            base_url,
            ws_url,
        }
    }

    /// Override the WebSocket endpoint, for deployments that serve
    /// push traffic from a different host.
    pub fn with_ws_url(mut self, ws_url: impl Into<String>) -> Self {
        self.ws_url = ws_url.into().trim_end_matches('/').to_string();
        self
    }

    /// REST URL for a filter's collection.
    fn collection_url(&self, filter: &ResourceFilter) -> String {
        match filter {
            ResourceFilter::Posts => format!("{}/posts", self.base_url),
            ResourceFilter::Tasks { assignee } => {
                format!("{}/tasks?assignee={}", self.base_url, assignee)
            }
            ResourceFilter::Conversation { id } => {
                format!("{}/conversations/{}/messages", self.base_url, id)
            }
            ResourceFilter::Kudos => format!("{}/kudos", self.base_url),
        }
    }

    /// REST URL for writes against a filter's collection (no query
    /// string; write routes take ids as path segments).
    fn write_url(&self, filter: &ResourceFilter) -> String {
        match filter {
            ResourceFilter::Posts => format!("{}/posts", self.base_url),
            ResourceFilter::Tasks { .. } => format!("{}/tasks", self.base_url),
            ResourceFilter::Conversation { id } => {
                format!("{}/conversations/{}/messages", self.base_url, id)
            }
            ResourceFilter::Kudos => format!("{}/kudos", self.base_url),
        }
    }

    fn subscribe_url(&self, filter: &ResourceFilter) -> String {
        format!("{}/subscribe?filter={}", self.ws_url, filter.cache_key())
    }

    /// Map a non-success response to a [`SyncError`].
    async fn error_for(response: reqwest::Response) -> SyncError {
        let status = response.status();
        let message = response
            .text()
            .await
            .unwrap_or_else(|e| format!("failed to read response body: {e}"));
        if status == reqwest::StatusCode::UNPROCESSABLE_ENTITY
            || status == reqwest::StatusCode::BAD_REQUEST
        {
            SyncError::Validation(message)
        } else {
            SyncError::Remote {
                status: status.as_u16(),
                message,
            }
        }
    }
}

fn derive_ws_url(base_url: &str) -> String {
    if let Some(rest) = base_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base_url.to_string()
    }
}

/// Wire form of one push event.
#[derive(Debug, Deserialize)]
struct WireEvent {
    op: ChangeOp,
    filter: String,
}

impl WireEvent {
    fn into_event(self) -> Option<ChangeEvent> {
        match ResourceFilter::parse(&self.filter) {
            Ok(filter) => Some(ChangeEvent {
                op: self.op,
                filter,
            }),
            Err(e) => {
                warn!(error = %e, "push event names unknown filter, dropped");
                None
            }
        }
    }
}

#[async_trait]
impl RemoteService for HttpRemoteService {
    async fn query(&self, filter: &ResourceFilter) -> Result<Vec<Entity>, SyncError> {
        let url = self.collection_url(filter);
        debug!(url = %url, "querying collection");

        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(Self::error_for(response).await);
        }

        let rows: Vec<serde_json::Value> = response.json().await?;
        Ok(decode_rows(rows))
    }

    async fn mutate(&self, op: WriteOp) -> Result<Option<Entity>, SyncError> {
        let response = match op {
            WriteOp::Create { resource, value } => {
                let url = self.write_url(&resource);
                debug!(url = %url, "creating record");
                self.http.post(&url).json(&value).send().await?
            }
            WriteOp::Update {
                resource,
                id,
                value,
            } => {
                let url = format!("{}/{}", self.write_url(&resource), id);
                debug!(url = %url, "updating record");
                self.http.patch(&url).json(&value).send().await?
            }
            WriteOp::Delete { resource, id } => {
                let url = format!("{}/{}", self.write_url(&resource), id);
                debug!(url = %url, "deleting record");
                let response = self.http.delete(&url).send().await?;
                if !response.status().is_success() {
                    return Err(Self::error_for(response).await);
                }
                return Ok(None);
            }
        };

        if !response.status().is_success() {
            return Err(Self::error_for(response).await);
        }

        let value: serde_json::Value = response.json().await?;
        let entity = decode_entity(value)?;
        Ok(Some(entity))
    }

    async fn subscribe(&self, filter: &ResourceFilter) -> Result<ChangeStream, SyncError> {
        let url = self.subscribe_url(filter);
        info!(url = %url, "opening push subscription");

        let (ws_stream, _) = connect_async(&url)
            .await
            .map_err(|e| SyncError::WebSocket(format!("connection failed: {e}")))?;
        let (_, mut read) = ws_stream.split();

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let key = filter.cache_key();

        tokio::spawn(async move {
            while let Some(message) = read.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        match serde_json::from_str::<WireEvent>(&text) {
                            Ok(wire) => {
                                if let Some(event) = wire.into_event() {
                                    if tx.send(event).await.is_err() {
                                        // Receiver dropped; subscription released.
                                        return;
                                    }
                                }
                            }
                            Err(e) => {
                                warn!(key = %key, error = %e, "malformed push event, dropped");
                            }
                        }
                    }
                    Ok(Message::Ping(_)) => {
                        trace!(key = %key, "push channel ping");
                    }
                    Ok(Message::Close(_)) => {
                        info!(key = %key, "push channel closed by server");
                        return;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(key = %key, error = %e, "push channel read error");
                        return;
                    }
                }
            }
            debug!(key = %key, "push channel ended");
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use tandem_core::EntityId;

    use crate::error::ErrorKind;

    #[test]
    fn ws_url_is_derived_from_base() {
        let service = HttpRemoteService::new("https://tandem.example.com/");
        assert_eq!(service.base_url, "https://tandem.example.com");
        assert_eq!(service.ws_url, "wss://tandem.example.com");

        let service = HttpRemoteService::new("http://localhost:8080");
        assert_eq!(service.ws_url, "ws://localhost:8080");
    }

    #[test]
    fn collection_urls_cover_every_filter() {
        let service = HttpRemoteService::new("https://t.example.com");
        assert_eq!(
            service.collection_url(&ResourceFilter::Posts),
            "https://t.example.com/posts"
        );
        assert_eq!(
            service.collection_url(&ResourceFilter::Tasks {
                assignee: "alice".into()
            }),
            "https://t.example.com/tasks?assignee=alice"
        );
        assert_eq!(
            service.collection_url(&ResourceFilter::Conversation { id: "c42".into() }),
            "https://t.example.com/conversations/c42/messages"
        );
        assert_eq!(
            service.subscribe_url(&ResourceFilter::Kudos),
            "wss://t.example.com/subscribe?filter=kudos"
        );
    }

    #[test]
    fn wire_event_parses_and_maps_filter() {
        let wire: WireEvent =
            serde_json::from_str(r#"{"op":"insert","filter":"tasks:alice"}"#).unwrap();
        let event = wire.into_event().unwrap();
        assert_eq!(event.op, ChangeOp::Insert);
        assert_eq!(
            event.filter,
            ResourceFilter::Tasks {
                assignee: "alice".into()
            }
        );

        let wire: WireEvent =
            serde_json::from_str(r#"{"op":"delete","filter":"inventory"}"#).unwrap();
        assert!(wire.into_event().is_none());
    }

    #[tokio::test]
    async fn query_decodes_rows_and_skips_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/tasks"))
            .and(query_param("assignee", "alice"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {
                    "kind": "task",
                    "id": "t-1",
                    "title": "ship it",
                    "assignee": "alice",
                    "status": "open",
                    "due": null,
                    "created_at": "2026-08-01T10:00:00Z"
                },
                {"kind": "task", "id": "t-2"},
                {"not": "a task"}
            ])))
            .mount(&server)
            .await;

        let service = HttpRemoteService::new(server.uri());
        let entities = service
            .query(&ResourceFilter::Tasks {
                assignee: "alice".into(),
            })
            .await
            .unwrap();

        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].id().as_str(), "t-1");
    }

    #[tokio::test]
    async fn create_posts_payload_and_decodes_canonical_entity() {
        let server = MockServer::start().await;
        let payload = json!({
            "kind": "kudos",
            "id": "temp-abc",
            "from": "alice",
            "to": "bob",
            "message": "great demo",
            "created_at": "2026-08-01T10:00:00Z"
        });
        Mock::given(method("POST"))
            .and(path("/kudos"))
            .and(body_json(payload.clone()))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "kind": "kudos",
                "id": "k-9",
                "from": "alice",
                "to": "bob",
                "message": "great demo",
                "created_at": "2026-08-01T10:00:01Z"
            })))
            .mount(&server)
            .await;

        let service = HttpRemoteService::new(server.uri());
        let entity = service
            .mutate(WriteOp::Create {
                resource: ResourceFilter::Kudos,
                value: payload,
            })
            .await
            .unwrap()
            .unwrap();

        assert_eq!(entity.id().as_str(), "k-9");
    }

    #[tokio::test]
    async fn unprocessable_maps_to_validation_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/posts"))
            .respond_with(ResponseTemplate::new(422).set_body_string("body required"))
            .mount(&server)
            .await;

        let service = HttpRemoteService::new(server.uri());
        let err = service
            .mutate(WriteOp::Create {
                resource: ResourceFilter::Posts,
                value: json!({}),
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.to_string().contains("body required"));
    }

    #[tokio::test]
    async fn server_error_maps_to_remote_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/posts"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let service = HttpRemoteService::new(server.uri());
        let err = service.query(&ResourceFilter::Posts).await.unwrap_err();
        match err {
            SyncError::Remote { status, message } => {
                assert_eq!(status, 500);
                assert_eq!(message, "boom");
            }
            other => panic!("expected remote error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn delete_returns_no_entity() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/posts/p-3"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let service = HttpRemoteService::new(server.uri());
        let entity = service
            .mutate(WriteOp::Delete {
                resource: ResourceFilter::Posts,
                id: EntityId::from("p-3"),
            })
            .await
            .unwrap();

        assert_eq!(entity, None);
    }
}
