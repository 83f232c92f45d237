//! HTTP surface of the server
use axum::{
    body::Bytes,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use log::{debug, info, warn};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;

use crate::error::{AgentError, IngestError, Result};
use crate::service::IngestService;

const EMPTY_OBJECT: &str = "{}";

/// Build the router for every endpoint
pub fn router(service: Arc<IngestService>) -> Router {
    Router::new()
        .route("/", get(list_names))
        .route("/ping", get(ping))
        .route("/update/", post(update))
        .route("/updates/", post(update_batch))
        .route("/value/", post(value))
        .with_state(service)
}

/// Serve the router on `listener` until `shutdown` completes
pub async fn serve<F>(listener: TcpListener, service: Arc<IngestService>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!("Listening on {}", addr);
    }

    axum::serve(listener, router(service))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| AgentError::Other(format!("HTTP server failed: {}", e)))?;

    info!("HTTP server stopped");
    Ok(())
}

fn json(status: StatusCode, body: impl Into<axum::body::Body>) -> Response {
    (status, [(header::CONTENT_TYPE, "application/json")], body.into()).into_response()
}

async fn update(State(service): State<Arc<IngestService>>, body: Bytes) -> Response {
    let status = match service.update_from_json(&body).await {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            warn!("Update rejected: {}", e);
            match e {
                IngestError::WrongMetricsType(_) => StatusCode::NOT_IMPLEMENTED,
                IngestError::WrongHash(_) => StatusCode::BAD_REQUEST,
                _ => StatusCode::NOT_FOUND,
            }
        }
    };
    json(status, EMPTY_OBJECT)
}

async fn update_batch(State(service): State<Arc<IngestService>>, body: Bytes) -> Response {
    match service.update_batch_from_json(&body).await {
        Ok(applied) => {
            debug!("Batch update applied {} metrics", applied);
            json(StatusCode::OK, EMPTY_OBJECT)
        }
        Err(e) => {
            warn!("Batch update rejected: {}", e);
            json(StatusCode::NOT_FOUND, EMPTY_OBJECT)
        }
    }
}

async fn value(State(service): State<Arc<IngestService>>, body: Bytes) -> Response {
    match service.value_from_json(&body).await {
        Ok(record) => json(StatusCode::OK, record),
        Err(e) => {
            debug!("Value query failed: {}", e);
            let status = match e {
                IngestError::WrongMetricsType(_) => StatusCode::NOT_IMPLEMENTED,
                IngestError::NoSuchMetric(_) => StatusCode::NOT_FOUND,
                _ => StatusCode::BAD_REQUEST,
            };
            json(status, EMPTY_OBJECT)
        }
    }
}

async fn list_names(State(service): State<Arc<IngestService>>) -> Response {
    let names = service.list_known_names().await;
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/html")],
        names.join("\n"),
    )
        .into_response()
}

async fn ping(State(service): State<Arc<IngestService>>) -> StatusCode {
    if service.is_storage_healthy().await {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Authenticator;
    use crate::metrics::{MetricRecord, POLL_COUNT};
    use crate::storage::MemoryStorage;
    use tokio::sync::oneshot;

    struct TestServer {
        base: String,
        client: reqwest::Client,
        stop: Option<oneshot::Sender<()>>,
    }

    impl TestServer {
        async fn start(key: Option<&str>) -> Self {
            let service = Arc::new(IngestService::new(Arc::new(MemoryStorage::new()), key));
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let base = format!("http://{}", listener.local_addr().unwrap());

            let (tx, rx) = oneshot::channel::<()>();
            tokio::spawn(serve(listener, service, async move {
                let _ = rx.await;
            }));

            Self {
                base,
                client: reqwest::Client::new(),
                stop: Some(tx),
            }
        }

        async fn post(&self, path: &str, body: &str) -> (u16, String) {
            let response = self
                .client
                .post(format!("{}{}", self.base, path))
                .header("Content-Type", "application/json")
                .body(body.to_string())
                .send()
                .await
                .unwrap();
            let status = response.status().as_u16();
            (status, response.text().await.unwrap())
        }

        async fn get(&self, path: &str) -> (u16, String) {
            let response = self
                .client
                .get(format!("{}{}", self.base, path))
                .send()
                .await
                .unwrap();
            let status = response.status().as_u16();
            (status, response.text().await.unwrap())
        }
    }

    impl Drop for TestServer {
        fn drop(&mut self) {
            if let Some(stop) = self.stop.take() {
                let _ = stop.send(());
            }
        }
    }

    #[tokio::test]
    async fn test_update_then_value() {
        let server = TestServer::start(None).await;

        let (status, body) = server
            .post("/update/", r#"{"id":"PollCount","type":"counter","delta":5}"#)
            .await;
        assert_eq!((status, body.as_str()), (200, "{}"));
        server
            .post("/update/", r#"{"id":"PollCount","type":"counter","delta":7}"#)
            .await;

        let (status, body) = server
            .post("/value/", r#"{"id":"PollCount","type":"counter"}"#)
            .await;
        assert_eq!(status, 200);
        let record: MetricRecord = serde_json::from_str(&body).unwrap();
        assert_eq!(record, MetricRecord::counter(POLL_COUNT, 12));
    }

    #[tokio::test]
    async fn test_update_status_mapping() {
        let server = TestServer::start(Some("k")).await;

        let (status, _) = server
            .post("/update/", r#"{"id":"X","type":"histogram","value":1}"#)
            .await;
        assert_eq!(status, 501);

        let (status, _) = server
            .post("/update/", r#"{"id":"Alloc","type":"gauge","value":1,"hash":"00"}"#)
            .await;
        assert_eq!(status, 400);

        let (status, body) = server.post("/update/", "not json").await;
        assert_eq!((status, body.as_str()), (404, "{}"));

        let (status, _) = server.post("/update/", r#"{"id":"Alloc","type":"gauge"}"#).await;
        assert_eq!(status, 404);

        let mut record = MetricRecord::gauge("Alloc", 2.5);
        Authenticator::new(Some("k")).sign(&mut record);
        let (status, _) = server
            .post("/update/", &serde_json::to_string(&record).unwrap())
            .await;
        assert_eq!(status, 200);
    }

    #[tokio::test]
    async fn test_value_status_mapping() {
        let server = TestServer::start(None).await;

        let (status, body) = server.post("/value/", r#"{"id":"Nope","type":"gauge"}"#).await;
        assert_eq!((status, body.as_str()), (404, "{}"));

        let (status, _) = server.post("/value/", r#"{"id":"Nope","type":"summary"}"#).await;
        assert_eq!(status, 501);

        let (status, _) = server.post("/value/", "[").await;
        assert_eq!(status, 400);
    }

    #[tokio::test]
    async fn test_batch_endpoint_and_listing() {
        let server = TestServer::start(None).await;

        let (status, body) = server
            .post(
                "/updates/",
                r#"[{"id":"Alloc","type":"gauge","value":1.5},{"id":"Bad","type":"x"},{"id":"PollCount","type":"counter","delta":1}]"#,
            )
            .await;
        assert_eq!((status, body.as_str()), (200, "{}"));

        let (status, _) = server.post("/updates/", "{broken").await;
        assert_eq!(status, 404);

        let (status, body) = server.get("/").await;
        assert_eq!(status, 200);
        let mut names: Vec<&str> = body.lines().collect();
        names.sort();
        assert_eq!(names, vec!["Alloc", "PollCount"]);
    }

    #[tokio::test]
    async fn test_ping() {
        let server = TestServer::start(None).await;
        let (status, _) = server.get("/ping").await;
        assert_eq!(status, 200);
    }

    #[tokio::test]
    async fn test_listing_content_type() {
        let server = TestServer::start(None).await;
        let response = server
            .client
            .get(format!("{}/", server.base))
            .send()
            .await
            .unwrap();
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "text/html"
        );
    }
}
