//! Operator HTTP API: add and remove listeners at runtime.

use std::future::Future;
use std::io;
use std::net::SocketAddr;

use axum::{
    body::Body,
    extract::{Path, State},
    http::{Request, StatusCode},
    response::IntoResponse,
    routing::{delete, get, put},
    Router,
};
use fabriclog_core::{ListenerError, SubscriptionKey};
use fabriclog_listener::{EventSubscription, ListenerManager, RegisterOutcome};
use serde_json::Value;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, info_span};

pub struct ApiServer {
    listener: TcpListener,
    manager: ListenerManager,
}

impl ApiServer {
    pub async fn bind(addr: SocketAddr, manager: ListenerManager) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, manager })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until `shutdown` resolves, then finish in-flight requests.
    pub async fn run(self, shutdown: impl Future<Output = ()> + Send + 'static) -> io::Result<()> {
        info!(addr = %self.local_addr()?, "listening for operator requests");
        axum::serve(self.listener, routes(self.manager))
            .with_graceful_shutdown(shutdown)
            .await
    }
}

pub fn routes(manager: ListenerManager) -> Router {
    Router::new()
        .route("/channels/:channel", get(add_channel).put(add_channel).delete(remove_channel))
        .route("/channels/:channel/events/:ccid", put(add_event))
        .route("/channels/:channel/events/:ccid/:filter", delete(remove_event))
        .route("/healthcheck", get(healthcheck))
        .layer(TraceLayer::new_for_http().make_span_with(|req: &Request<Body>| {
            info_span!("request", method = %req.method(), uri = %req.uri())
        }))
        .with_state(manager)
}

fn registered(
    result: Result<RegisterOutcome, ListenerError>,
    created: String,
    existing: String,
) -> (StatusCode, String) {
    match result {
        Ok(RegisterOutcome::Registered) => (StatusCode::CREATED, created),
        Ok(RegisterOutcome::AlreadyRegistered) => (StatusCode::NOT_MODIFIED, existing),
        Err(e) => {
            error!(error = %e, "failed to register listener");
            (StatusCode::INTERNAL_SERVER_ERROR, String::new())
        }
    }
}

async fn add_channel(
    State(manager): State<ListenerManager>,
    Path(channel): Path<String>,
) -> impl IntoResponse {
    let result = manager.register_listener(&channel).await;
    registered(
        result,
        format!("Connecting to {channel}\n"),
        format!("Fabric logger already started on {channel}.\n"),
    )
}

/// Pull a non-empty `filter` out of a JSON body. Non-string values are
/// used in their JSON text form.
fn filter_from_body(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    let filter = match value.get("filter")? {
        Value::String(s) => s.clone(),
        Value::Null => return None,
        other => other.to_string(),
    };
    (!filter.is_empty()).then_some(filter)
}

async fn add_event(
    State(manager): State<ListenerManager>,
    Path((channel, ccid)): Path<(String, String)>,
    body: String,
) -> impl IntoResponse {
    let Some(filter) = filter_from_body(&body) else {
        return (
            StatusCode::BAD_REQUEST,
            "Failed to register chaincode event listener. Request requires filter parameter in body\n"
                .to_string(),
        );
    };
    let result = manager
        .register_chaincode_event(EventSubscription::new(&channel, &ccid, &filter))
        .await;
    registered(
        result,
        format!("Listening to chaincode {ccid} events matching {filter} on channel {channel}\n"),
        format!("Fabric logger already listens to {filter} events of {ccid} on channel {channel}.\n"),
    )
}

async fn remove_channel(
    State(manager): State<ListenerManager>,
    Path(channel): Path<String>,
) -> StatusCode {
    manager.remove_listener(&SubscriptionKey::channel(&channel)).await;
    StatusCode::ACCEPTED
}

async fn remove_event(
    State(manager): State<ListenerManager>,
    Path((channel, ccid, filter)): Path<(String, String, String)>,
) -> StatusCode {
    manager
        .remove_listener(&SubscriptionKey::event(&channel, &ccid, &filter))
        .await;
    StatusCode::ACCEPTED
}

async fn healthcheck() -> &'static str {
    debug!("healthcheck");
    "ok!"
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use fabriclog_core::{CheckpointStore, MemoryBackend};
    use fabriclog_listener::{CollectingSink, ListenerConfig, MockLedgerClient, SubscriptionState};
    use tokio::sync::oneshot;

    struct Running {
        base: String,
        client: MockLedgerClient,
        manager: ListenerManager,
        stop: oneshot::Sender<()>,
        handle: tokio::task::JoinHandle<io::Result<()>>,
    }

    async fn start() -> Running {
        let client = MockLedgerClient::new();
        let store = CheckpointStore::load(Arc::new(MemoryBackend::new()), Duration::ZERO)
            .await
            .unwrap();
        let manager = ListenerManager::new(
            Arc::new(client.clone()),
            store,
            Arc::new(CollectingSink::new()),
            ListenerConfig::new("peer0", "Org1MSP"),
        );
        let server = ApiServer::bind("127.0.0.1:0".parse().unwrap(), manager.clone())
            .await
            .unwrap();
        let base = format!("http://{}", server.local_addr().unwrap());
        let (stop, stopped) = oneshot::channel();
        let handle = tokio::spawn(server.run(async {
            let _ = stopped.await;
        }));
        Running {
            base,
            client,
            manager,
            stop,
            handle,
        }
    }

    impl Running {
        async fn finish(self) {
            self.stop.send(()).unwrap();
            self.handle.await.unwrap().unwrap();
            self.manager.shutdown().await;
        }
    }

    #[test]
    fn filter_extraction() {
        assert_eq!(filter_from_body(r#"{"filter": "transfer.*"}"#).as_deref(), Some("transfer.*"));
        assert_eq!(filter_from_body(r#"{"filter": 5}"#).as_deref(), Some("5"));
        assert_eq!(filter_from_body(r#"{"filter": ""}"#), None);
        assert_eq!(filter_from_body(r#"{"other": "x"}"#), None);
        assert_eq!(filter_from_body(""), None);
    }

    #[tokio::test]
    async fn healthcheck_answers() {
        let app = start().await;
        let resp = reqwest::get(format!("{}/healthcheck", app.base)).await.unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.text().await.unwrap(), "ok!");
        app.finish().await;
    }

    #[tokio::test]
    async fn channel_lifecycle() {
        let app = start().await;
        let http = reqwest::Client::new();
        let url = format!("{}/channels/C1", app.base);

        let resp = http.put(&url).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED.as_u16());
        assert!(app.manager.has_listener("C1"));
        assert_eq!(app.client.block_subscribers("C1"), 1);

        // GET is accepted too.
        let resp = http.get(&url).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_MODIFIED.as_u16());

        let resp = http.delete(&url).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED.as_u16());
        assert!(!app.manager.has_listener("C1"));
        assert!(app.manager.subscriptions().is_empty());
        app.finish().await;
    }

    #[tokio::test]
    async fn failing_registration_is_500() {
        let app = start().await;
        app.client.fail_next_opens("C9", 1);
        let resp = reqwest::Client::new()
            .put(format!("{}/channels/C9", app.base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR.as_u16());
        assert!(!app.manager.has_listener("C9"));
        app.finish().await;
    }

    #[tokio::test]
    async fn event_listener_lifecycle() {
        let app = start().await;
        let http = reqwest::Client::new();
        let url = format!("{}/channels/C1/events/mycc", app.base);

        let resp = http.put(&url).body("{}").send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST.as_u16());

        let body = r#"{"filter": "transfer"}"#;
        let resp = http
            .put(&url)
            .header("content-type", "application/json")
            .body(body)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED.as_u16());
        assert_eq!(
            app.manager.subscriptions(),
            vec![(
                SubscriptionKey::event("C1", "mycc", "transfer"),
                SubscriptionState::Active
            )]
        );

        let resp = http.put(&url).body(body).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_MODIFIED.as_u16());

        let resp = http
            .delete(format!("{url}/transfer"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED.as_u16());
        assert!(!app.manager.has_event_listener("C1", "mycc", "transfer"));
        app.finish().await;
    }

    #[tokio::test]
    async fn removing_unknown_listener_is_accepted() {
        let app = start().await;
        let resp = reqwest::Client::new()
            .delete(format!("{}/channels/nope/events/cc/x", app.base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED.as_u16());
        app.finish().await;
    }
}
