//! End-to-end exercises of the HTTP surface, driving the router the same
//! way a real client would instead of calling the channel service directly.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;

use cache::{MemoryKv, PrefixedKv};
use channel::{ChannelConfig, ChannelService};
use filter::{IpFilter, IpFilterConfig, SyncMode};
use audit::LoggingAuditSink;
use keyexchange_server::admin::PlainTextAdminView;
use keyexchange_server::api::{self, AppState};

fn id(seed: char) -> String {
    seed.to_string().repeat(256)
}

fn router() -> Router {
    let kv = Arc::new(PrefixedKv::new(Arc::new(MemoryKv::new()), "keyexchange:"));
    let audit_sink: Arc<dyn audit::AuditSink> = Arc::new(LoggingAuditSink);

    let channel = ChannelService::new(
        kv.clone(),
        ChannelConfig {
            cid_len: 4,
            ttl: Duration::from_secs(300),
            max_gets: 2,
            root_redirect: "https://example.org/".to_string(),
        },
        audit_sink.clone(),
    );

    let filter = Arc::new(IpFilter::new(
        kv,
        IpFilterConfig {
            queue_size: 1000,
            br_queue_size: 1000,
            treshold: 1_000_000,
            br_treshold: 1_000_000,
            blacklist_ttl: Some(Duration::from_secs(60)),
            br_blacklist_ttl: Some(Duration::from_secs(60)),
            ip_queue_ttl: Duration::from_secs(60),
            ip_whitelist: Vec::new(),
            observe: false,
            sync_mode: SyncMode::Sync { update_every: 0 },
            callback: None,
            br_callback: None,
        },
        audit_sink.clone(),
    ));

    let state = Arc::new(AppState {
        channel,
        filter,
        audit: audit_sink,
        admin_view: Arc::new(PlainTextAdminView),
        admin_page: Some("/__admin__".to_string()),
    });

    api::build_router(state)
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
    let response = app.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, headers, body.to_vec())
}

fn request(method: &str, path: &str, client_id: Option<&str>, body: Vec<u8>) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(path)
        .header("x-forwarded-for", "203.0.113.7");
    if let Some(id) = client_id {
        builder = builder.header("x-keyexchange-id", id);
    }
    builder.body(Body::from(body)).unwrap()
}

async fn new_channel(app: &Router, client_id: &str) -> String {
    let (status, headers, body) =
        send(app, request("GET", "/new_channel", Some(client_id), vec![])).await;
    assert_eq!(status, StatusCode::OK);
    let cid: String = serde_json::from_slice(&body).unwrap();
    assert_eq!(
        headers.get("x-keyexchange-channel").unwrap().to_str().unwrap(),
        cid
    );
    cid
}

#[tokio::test]
async fn happy_path_two_parties_exchange_messages() {
    let app = router();

    let cid = new_channel(&app, &id('a')).await;

    let (status, headers, _) = send(
        &app,
        request("PUT", &format!("/{cid}"), Some(&id('a')), b"one".to_vec()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(headers.get("etag").is_some());

    let (status, headers, body) = send(
        &app,
        request("GET", &format!("/{cid}"), Some(&id('b')), vec![]),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"one");
    let etag1 = headers.get("etag").unwrap().to_str().unwrap().to_string();

    let (status, _, _) = send(
        &app,
        request("PUT", &format!("/{cid}"), Some(&id('b')), b"two".to_vec()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, headers, body) = send(
        &app,
        request("GET", &format!("/{cid}"), Some(&id('a')), vec![]),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"two");
    assert_ne!(headers.get("etag").unwrap().to_str().unwrap(), etag1);
}

#[tokio::test]
async fn third_party_intrusion_destroys_the_channel() {
    let app = router();
    let cid = new_channel(&app, &id('a')).await;

    send(
        &app,
        request("PUT", &format!("/{cid}"), Some(&id('a')), b"one".to_vec()),
    )
    .await;
    send(&app, request("GET", &format!("/{cid}"), Some(&id('b')), vec![])).await;

    let (status, _, _) = send(&app, request("GET", &format!("/{cid}"), Some(&id('c')), vec![])).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, _) = send(&app, request("GET", &format!("/{cid}"), Some(&id('a')), vec![])).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

fn md5_hex(data: &[u8]) -> String {
    use md5::{Digest, Md5};
    hex::encode(Md5::digest(data))
}

#[tokio::test]
async fn precondition_headers_are_enforced() {
    let app = router();
    let cid = new_channel(&app, &id('a')).await;

    send(
        &app,
        request("PUT", &format!("/{cid}"), Some(&id('a')), b"x".to_vec()),
    )
    .await;

    let mut req = request("PUT", &format!("/{cid}"), Some(&id('a')), b"y".to_vec());
    req.headers_mut()
        .insert("if-none-match", "*".parse().unwrap());
    let (status, _, _) = send(&app, req).await;
    assert_eq!(status, StatusCode::PRECONDITION_FAILED);

    let stale_etag = md5_hex(b"x");
    let mut req = request("PUT", &format!("/{cid}"), Some(&id('a')), b"z".to_vec());
    req.headers_mut()
        .insert("if-match", format!("\"{stale_etag}\"").parse().unwrap());
    let (status, headers, _) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers.get("etag").unwrap(), md5_hex(b"z").as_str());

    let mut req = request("PUT", &format!("/{cid}"), Some(&id('a')), b"w".to_vec());
    req.headers_mut()
        .insert("if-match", format!("\"{stale_etag}\"").parse().unwrap());
    let (status, _, _) = send(&app, req).await;
    assert_eq!(status, StatusCode::PRECONDITION_FAILED);
}

#[tokio::test]
async fn get_cap_destroys_the_channel() {
    let app = router();
    let cid = new_channel(&app, &id('a')).await;
    send(
        &app,
        request("PUT", &format!("/{cid}"), Some(&id('a')), b"x".to_vec()),
    )
    .await;

    let (status, _, _) = send(&app, request("GET", &format!("/{cid}"), Some(&id('a')), vec![])).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _, _) = send(&app, request("GET", &format!("/{cid}"), Some(&id('a')), vec![])).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _, _) = send(&app, request("GET", &format!("/{cid}"), Some(&id('a')), vec![])).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unknown_channel_is_404() {
    let app = router();
    let (status, _, _) = send(&app, request("GET", "/zzzz", Some(&id('a')), vec![])).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn bad_client_id_length_is_400() {
    let app = router();
    let (status, _, _) = send(&app, request("GET", "/new_channel", Some("short"), vec![])).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_url_is_404() {
    let app = router();
    let (status, _, _) = send(&app, request("GET", "/no/such/path", None, vec![])).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn wrong_method_is_405() {
    let app = router();
    let cid = new_channel(&app, &id('a')).await;
    let (status, _, _) = send(&app, request("POST", &format!("/{cid}"), Some(&id('a')), vec![])).await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn cors_preflight_carries_the_full_header_set() {
    let app = router();
    let (status, headers, _) = send(&app, request("OPTIONS", "/new_channel", None, vec![])).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        headers.get("access-control-allow-origin").unwrap(),
        "*"
    );
    assert_eq!(
        headers.get("access-control-allow-methods").unwrap(),
        "GET, POST, PUT, OPTIONS"
    );
    assert!(headers.get("access-control-expose-headers").is_some());
}

#[tokio::test]
async fn root_redirects_on_healthy_backend() {
    let app = router();
    let (status, headers, _) = send(&app, request("GET", "/", None, vec![])).await;
    assert_eq!(status, StatusCode::MOVED_PERMANENTLY);
    assert_eq!(headers.get("location").unwrap(), "https://example.org/");
}

#[tokio::test]
async fn report_deletes_the_named_channel() {
    let app = router();
    let cid = new_channel(&app, &id('a')).await;

    let mut req = request("POST", "/report", None, b"trouble".to_vec());
    req.headers_mut()
        .insert("x-keyexchange-id", id('a').parse().unwrap());
    req.headers_mut().insert("x-keyexchange-cid", cid.parse().unwrap());
    let (status, _, _) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, _) = send(&app, request("GET", &format!("/{cid}"), Some(&id('a')), vec![])).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
