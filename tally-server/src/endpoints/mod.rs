//! Web server endpoints.
//!
//! Ingestion endpoints verify the raw body against the shared key before decompressing and
//! decoding it. Every successful update is applied through the
//! [`UpsertEngine`](crate::services::engine::UpsertEngine) and audited.

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use tally_config::Config;

use crate::service::ServiceState;

mod common;
mod health_check;
mod list;
mod ping;
mod update;
mod updates;
mod value;

pub use self::common::BadUpdate;
pub use self::health_check::Status;

/// Returns the router with all routes of the server.
pub fn routes(config: &Config) -> Router<ServiceState> {
    let ingestion = Router::new()
        .route("/updates", post(updates::handle))
        .route("/update", post(update::handle))
        .route("/update/{type}/{name}/{value}", post(update::handle_path))
        .route_layer(DefaultBodyLimit::max(config.max_body_size()));

    Router::new()
        .route("/", get(list::handle))
        .route("/ping", get(ping::handle))
        .route("/healthcheck", get(health_check::handle))
        .route("/value", post(value::handle_json))
        .route("/value/{type}/{name}", get(value::handle))
        .merge(ingestion)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{HeaderMap, Request, StatusCode, header};
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use similar_asserts::assert_eq;
    use tally_auth::{SIGNATURE_HEADER, SharedKey};
    use tally_metrics::Metric;
    use tower::ServiceExt;

    use super::*;
    use crate::services::audit::{AuditBroadcaster, AuditEvent, AuditLogger, FileSink};
    use crate::services::engine::UpsertEngine;
    use crate::store::{MemoryStore, Storage};

    fn state(config: serde_json::Value, audit: AuditLogger) -> ServiceState {
        let config = Arc::new(Config::from_json_value(config).unwrap());
        let engine = UpsertEngine::new(Storage::Memory(Arc::new(MemoryStore::new())));
        ServiceState::new(config, engine, audit)
    }

    fn app(state: &ServiceState) -> Router {
        routes(state.config()).with_state(state.clone())
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, HeaderMap, String) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, headers, String::from_utf8(body.to_vec()).unwrap())
    }

    fn updates(batch: &[Metric], key: Option<&SharedKey>) -> Request<Body> {
        let encoded = tally_metrics::encode(batch, key).unwrap();
        let mut builder = Request::post("/updates")
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::CONTENT_ENCODING, "gzip");
        if let Some(signature) = encoded.signature {
            builder = builder.header(SIGNATURE_HEADER, signature.as_str());
        }
        builder.body(Body::from(encoded.payload)).unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    fn post(uri: &str, body: &str) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_owned()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_counter_accumulates() {
        let state = state(serde_json::json!({}), AuditLogger::disabled());
        let app = app(&state);

        for _ in 0..2 {
            let batch = [Metric::counter("Requests", 5)];
            let (status, _, _) = send(&app, updates(&batch, None)).await;
            assert_eq!(status, StatusCode::OK);
        }

        let (status, _, body) = send(&app, get("/value/counter/Requests")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "10");
    }

    #[tokio::test]
    async fn test_gauge_replaces() {
        let state = state(serde_json::json!({}), AuditLogger::disabled());
        let app = app(&state);

        send(&app, updates(&[Metric::gauge("Temp", 3.14)], None)).await;
        send(&app, updates(&[Metric::gauge("Temp", 9.8)], None)).await;

        let (_, _, body) = send(&app, get("/value/gauge/Temp")).await;
        assert_eq!(body, "9.8");
    }

    #[tokio::test]
    async fn test_signed_batch() {
        let state = state(
            serde_json::json!({"auth": {"key": "secret"}}),
            AuditLogger::disabled(),
        );
        let app = app(&state);
        let key = SharedKey::new("secret").unwrap();

        let (status, _, _) = send(&app, updates(&[Metric::counter("Requests", 5)], Some(&key))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            state.engine().get("Requests").await.unwrap(),
            Some(Metric::counter("Requests", 5))
        );
    }

    #[tokio::test]
    async fn test_bad_signature_leaves_storage_unchanged() {
        let state = state(
            serde_json::json!({"auth": {"key": "secret"}}),
            AuditLogger::disabled(),
        );
        let app = app(&state);
        let wrong = SharedKey::new("wrong").unwrap();

        let (status, _, _) = send(&app, updates(&[Metric::counter("Requests", 5)], Some(&wrong))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _, _) = send(&app, updates(&[Metric::counter("Requests", 5)], None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        assert!(state.engine().list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_signature_ignored_without_key() {
        let state = state(serde_json::json!({}), AuditLogger::disabled());
        let app = app(&state);
        let key = SharedKey::new("unknown").unwrap();

        let (status, _, _) = send(&app, updates(&[Metric::counter("Requests", 1)], Some(&key))).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_type_conflict_rejects_batch() {
        let state = state(serde_json::json!({}), AuditLogger::disabled());
        let app = app(&state);

        send(&app, updates(&[Metric::gauge("Temp", 1.0)], None)).await;

        let batch = [Metric::counter("Requests", 1), Metric::counter("Temp", 1)];
        let (status, _, _) = send(&app, updates(&batch, None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        assert_eq!(
            state.engine().list().await.unwrap(),
            vec![Metric::gauge("Temp", 1.0)]
        );
    }

    #[tokio::test]
    async fn test_malformed_batch() {
        let state = state(serde_json::json!({}), AuditLogger::disabled());
        let app = app(&state);

        let missing_delta = r#"[{"id": "Requests", "type": "counter"}]"#;
        let (status, _, _) = send(&app, post("/updates", missing_delta)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let unknown_type = r#"[{"id": "Requests", "type": "histogram", "value": 1}]"#;
        let (status, _, _) = send(&app, post("/updates", unknown_type)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let not_gzip = Request::post("/updates")
            .header(header::CONTENT_ENCODING, "gzip")
            .body(Body::from("[]"))
            .unwrap();
        let (status, _, _) = send(&app, not_gzip).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_body_limit() {
        let state = state(
            serde_json::json!({"limits": {"max_body_size": 16}}),
            AuditLogger::disabled(),
        );
        let app = app(&state);

        let body = r#"[{"id": "Requests", "type": "counter", "delta": 1}]"#;
        let (status, _, _) = send(&app, post("/updates", body)).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_single_update_responds_with_stored_record() {
        let state = state(serde_json::json!({}), AuditLogger::disabled());
        let app = app(&state);

        let body = r#"{"id": "Requests", "type": "counter", "delta": 5}"#;
        send(&app, post("/update", body)).await;
        let (status, headers, body) = send(&app, post("/update", body)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[header::CONTENT_TYPE], "application/json");
        insta::assert_snapshot!(body, @r#"{"id":"Requests","type":"counter","delta":10}"#);
    }

    #[tokio::test]
    async fn test_single_update_gzip_body() {
        use std::io::Write;

        let state = state(serde_json::json!({}), AuditLogger::disabled());
        let app = app(&state);

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(br#"{"id": "Temp", "type": "gauge", "value": 3.14}"#)
            .unwrap();
        let request = Request::post("/update")
            .header(header::CONTENT_ENCODING, "gzip")
            .body(Body::from(encoder.finish().unwrap()))
            .unwrap();

        let (status, _, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, r#"{"id":"Temp","type":"gauge","value":3.14}"#);
    }

    #[tokio::test]
    async fn test_single_and_batch_updates_agree() {
        let single = state(serde_json::json!({}), AuditLogger::disabled());
        let batched = state(serde_json::json!({}), AuditLogger::disabled());

        let metrics = [
            Metric::counter("Requests", 5),
            Metric::gauge("Temp", 3.14),
            Metric::counter("Requests", 5),
        ];

        let single_app = app(&single);
        for metric in &metrics {
            let body = serde_json::to_string(&tally_metrics::MetricRecord::from(metric)).unwrap();
            send(&single_app, post("/update", &body)).await;
        }
        send(&app(&batched), updates(&metrics, None)).await;

        assert_eq!(
            single.engine().list().await.unwrap(),
            batched.engine().list().await.unwrap()
        );
    }

    #[tokio::test]
    async fn test_path_update() {
        let state = state(serde_json::json!({}), AuditLogger::disabled());
        let app = app(&state);

        let (status, _, _) = send(&app, post("/update/counter/Requests/5", "")).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _, _) = send(&app, post("/update/gauge/Temp/-3.5", "")).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _, _) = send(&app, post("/update/histogram/Temp/1", "")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _, _) = send(&app, post("/update/counter/Requests/1.5", "")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _, _) = send(&app, post("/update/gauge/Temp/none", "")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _, _) = send(&app, post("/update/counter/Requests", "")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        assert_eq!(
            state.engine().list().await.unwrap(),
            vec![Metric::counter("Requests", 5), Metric::gauge("Temp", -3.5)]
        );
    }

    #[tokio::test]
    async fn test_value_lookups() {
        let state = state(serde_json::json!({}), AuditLogger::disabled());
        let app = app(&state);
        send(&app, updates(&[Metric::gauge("Temp", 3.0)], None)).await;

        let (status, _, body) = send(&app, get("/value/gauge/Temp")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "3");

        let (status, _, body) = send(&app, get("/value/gauge/Missing")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        insta::assert_snapshot!(body, @r#"{"detail":"metric not found"}"#);

        let (status, _, _) = send(&app, get("/value/counter/Temp")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _, _) = send(&app, get("/value/histogram/Temp")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_json_value_is_signed() {
        let state = state(
            serde_json::json!({"auth": {"key": "secret"}}),
            AuditLogger::disabled(),
        );
        let app = app(&state);
        state
            .engine()
            .upsert(&[Metric::counter("Requests", 7)])
            .await
            .unwrap();

        let (status, headers, body) =
            send(&app, post("/value", r#"{"id": "Requests", "type": "counter"}"#)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, r#"{"id":"Requests","type":"counter","delta":7}"#);

        let key = SharedKey::new("secret").unwrap();
        let signature = headers[SIGNATURE_HEADER].to_str().unwrap();
        assert!(key.verify(body.as_bytes(), signature).is_ok());

        let (status, _, _) =
            send(&app, post("/value", r#"{"id": "Missing", "type": "counter"}"#)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_list() {
        let state = state(serde_json::json!({}), AuditLogger::disabled());
        let app = app(&state);
        send(
            &app,
            updates(&[Metric::gauge("Temp", 9.8), Metric::counter("Requests", 10)], None),
        )
        .await;

        let (status, headers, body) = send(&app, get("/")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(headers[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/html"));
        insta::assert_snapshot!(body, @r"
        <!DOCTYPE html>
        <html>
        <body>
        <p>Requests: 10</p>
        <p>Temp: 9.8</p>
        </body>
        </html>
        ");
    }

    #[tokio::test]
    async fn test_storage_failure_is_retryable_and_leaves_no_state() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "").unwrap();

        let store = MemoryStore::with_snapshot(blocker.join("metrics.json"), true, false)
            .await
            .unwrap();
        let config = Arc::new(Config::from_json_value(serde_json::json!({})).unwrap());
        let engine = UpsertEngine::new(Storage::Memory(Arc::new(store)));
        let state = ServiceState::new(config, engine, AuditLogger::disabled());
        let app = app(&state);

        let batch = [Metric::counter("Requests", 5)];
        for _ in 0..2 {
            let (status, _, _) = send(&app, updates(&batch, None)).await;
            assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        }

        let (status, _, _) = send(&app, get("/value/counter/Requests")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        std::fs::remove_file(&blocker).unwrap();
        let (status, _, _) = send(&app, updates(&batch, None)).await;
        assert_eq!(status, StatusCode::OK);

        let (_, _, body) = send(&app, get("/value/counter/Requests")).await;
        assert_eq!(body, "5");
    }

    #[tokio::test]
    async fn test_ping_and_health_check() {
        let state = state(serde_json::json!({}), AuditLogger::disabled());
        let app = app(&state);

        let (status, _, _) = send(&app, get("/ping")).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _, body) = send(&app, get("/healthcheck")).await;
        assert_eq!(status, StatusCode::OK);
        let health: Status = serde_json::from_str(&body).unwrap();
        assert!(health.is_healthy);
    }

    #[tokio::test]
    async fn test_updates_are_audited() {
        tally_log::init_test!();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");

        let mut broadcaster = AuditBroadcaster::new();
        broadcaster.subscribe(FileSink::new(&path), 10);
        let (logger, handle) = broadcaster.start();

        let state = state(serde_json::json!({}), logger);
        let app = app(&state);

        let batch = [Metric::counter("Requests", 1), Metric::gauge("Temp", 1.0)];
        let request = updates(&batch, None);
        let (mut parts, body) = request.into_parts();
        parts
            .headers
            .insert("x-real-ip", "10.1.2.3".parse().unwrap());
        send(&app, Request::from_parts(parts, body)).await;

        // A rejected batch is not audited.
        send(&app, post("/updates", "not json")).await;

        drop(app);
        drop(state);
        handle.finish(std::time::Duration::from_secs(5)).await;

        let contents = std::fs::read_to_string(&path).unwrap();
        let events = contents
            .lines()
            .map(|line| serde_json::from_str::<AuditEvent>(line).unwrap())
            .collect::<Vec<_>>();

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].metrics, vec!["Requests", "Temp"]);
        assert_eq!(events[0].ip_address, "10.1.2.3");
    }
}
