use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};

use cache::Kv;
use channel::{CID_CHARS, ChannelError, ChannelService, GetOutcome};
use filter::{IpFilter, IpFilterLayer};

use crate::admin::{self, AdminView};
use audit::AuditSink;

pub struct AppState<K> {
    pub channel: ChannelService<K>,
    pub filter: Arc<IpFilter<K>>,
    pub audit: Arc<dyn AuditSink>,
    pub admin_view: Arc<dyn AdminView>,
    pub admin_page: Option<String>,
}

/// Builds the full router: the channel rendezvous routes behind the IP
/// filter, with CORS preflight handling wrapped around everything so an
/// `OPTIONS` request never reaches the filter or the channel service.
pub fn build_router<K>(state: Arc<AppState<K>>) -> Router
where
    K: Kv + 'static,
{
    let admin_page = state.admin_page.clone();
    let filter = state.filter.clone();
    let admin_view = state.admin_view.clone();

    let mut router = Router::new()
        .route("/", get(root))
        .route("/new_channel", get(new_channel))
        .route("/report", post(report))
        .route("/{cid}", get(get_channel).put(put_channel))
        .with_state(state);

    if let Some(path) = admin_page {
        let view = admin_view;
        let get_filter = filter.clone();
        let post_filter = filter.clone();
        router = router.route(
            &path,
            get(move || {
                let filter = get_filter.clone();
                let view = view.clone();
                async move { admin_get(filter, view).await }
            })
            .post(move |body: Bytes| {
                let filter = post_filter.clone();
                async move { admin_post(filter, body).await }
            }),
        );
    }

    router
        .layer(IpFilterLayer::new(filter))
        .layer(middleware::from_fn(cors))
}

async fn admin_get<K: Kv>(filter: Arc<IpFilter<K>>, view: Arc<dyn AdminView>) -> Response {
    let blacklisted = filter.blacklisted();
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        view.render(&blacklisted),
    )
        .into_response()
}

async fn admin_post<K: Kv>(filter: Arc<IpFilter<K>>, body: Bytes) -> Response {
    let form: Vec<(String, String)> = serde_urlencoded::from_bytes(&body).unwrap_or_default();
    let ips = admin::checked_ips(&form);
    if let Err(err) = filter.admin_remove(&ips) {
        log::error!("admin: failed to persist blacklist removal: {err:#}");
    }
    StatusCode::OK.into_response()
}

/// Short-circuits CORS preflight before the request reaches the filter or
/// the channel service, and adorns every response (not just preflight)
/// with the CORS header set.
async fn cors(req: axum::http::Request<Body>, next: Next) -> Response {
    if req.method() == Method::OPTIONS {
        let mut response = StatusCode::OK.into_response();
        add_cors_headers(response.headers_mut());
        return response;
    }

    let mut response = next.run(req).await;
    add_cors_headers(response.headers_mut());
    response
}

fn add_cors_headers(headers: &mut HeaderMap) {
    headers.insert(
        "access-control-allow-origin",
        HeaderValue::from_static("*"),
    );
    headers.insert(
        "access-control-allow-headers",
        HeaderValue::from_static(
            "contenttype, x-keyexchange-cid, x-keyexchange-channel, x-keyexchange-id, x-keyexchange-log, if-match, if-none-match",
        ),
    );
    headers.insert(
        "access-control-expose-headers",
        HeaderValue::from_static("etag, x-status"),
    );
    headers.insert(
        "access-control-allow-methods",
        HeaderValue::from_static("GET, POST, PUT, OPTIONS"),
    );
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn valid_cid_format(cid: &str) -> bool {
    !cid.is_empty() && cid.bytes().all(|b| CID_CHARS.contains(&b))
}

async fn root<K: Kv>(State(state): State<Arc<AppState<K>>>) -> Response {
    match state.channel.health_check() {
        Ok(()) => {
            let mut response = StatusCode::MOVED_PERMANENTLY.into_response();
            if let Ok(value) = HeaderValue::from_str(&state.channel.config().root_redirect) {
                response.headers_mut().insert(header::LOCATION, value);
            }
            response
        }
        Err(err) => {
            log::error!("health check failed: {err:#}");
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
    }
}

async fn new_channel<K: Kv>(
    State(state): State<Arc<AppState<K>>>,
    headers: HeaderMap,
) -> Response {
    let client_id = header_str(&headers, "x-keyexchange-id").unwrap_or_default();

    match state.channel.new_channel(client_id) {
        Ok(cid) => {
            let mut response =
                (StatusCode::OK, Json(cid.clone())).into_response();
            if let Ok(value) = HeaderValue::from_str(&cid) {
                response.headers_mut().insert("x-keyexchange-channel", value);
            }
            response
        }
        Err(ChannelError::BadClientId) => {
            state.audit.bad_client_id("-");
            StatusCode::BAD_REQUEST.into_response()
        }
        Err(err) => {
            log::error!("new_channel failed: {err:#}");
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
    }
}

async fn get_channel<K: Kv>(
    State(state): State<Arc<AppState<K>>>,
    Path(cid): Path<String>,
    headers: HeaderMap,
) -> Response {
    if !valid_cid_format(&cid) {
        return StatusCode::NOT_FOUND.into_response();
    }

    let client_id = header_str(&headers, "x-keyexchange-id").unwrap_or_default();
    let if_none_match = header_str(&headers, "if-none-match");

    match state.channel.get(&cid, client_id, if_none_match) {
        Ok(GetOutcome::NotModified) => StatusCode::NOT_MODIFIED.into_response(),
        Ok(GetOutcome::Ok { payload, etag }) => {
            let mut response = (StatusCode::OK, payload).into_response();
            if let Ok(value) = HeaderValue::from_str(&etag) {
                response.headers_mut().insert(header::ETAG, value);
            }
            response
        }
        Err(ChannelError::BadClientId) => {
            state.audit.bad_client_id(&cid);
            StatusCode::BAD_REQUEST.into_response()
        }
        Err(ChannelError::UnknownThirdParty) => {
            state.audit.third_party_intrusion(&cid);
            StatusCode::BAD_REQUEST.into_response()
        }
        Err(ChannelError::NotFound) => StatusCode::NOT_FOUND.into_response(),
        Err(ChannelError::PreconditionFailed { .. }) => {
            StatusCode::PRECONDITION_FAILED.into_response()
        }
        Err(err) => {
            log::error!("get failed: {err:#}");
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
    }
}

async fn put_channel<K: Kv>(
    State(state): State<Arc<AppState<K>>>,
    Path(cid): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !valid_cid_format(&cid) {
        return StatusCode::NOT_FOUND.into_response();
    }

    let client_id = header_str(&headers, "x-keyexchange-id").unwrap_or_default();
    let if_match = header_str(&headers, "if-match");
    let if_none_match = header_str(&headers, "if-none-match");

    match state
        .channel
        .put(&cid, client_id, body.to_vec(), if_match, if_none_match)
    {
        Ok(etag) => {
            let mut response = StatusCode::OK.into_response();
            if let Ok(value) = HeaderValue::from_str(&etag) {
                response.headers_mut().insert(header::ETAG, value);
            }
            response
        }
        Err(ChannelError::BadClientId) => {
            state.audit.bad_client_id(&cid);
            StatusCode::BAD_REQUEST.into_response()
        }
        Err(ChannelError::UnknownThirdParty) => {
            state.audit.third_party_intrusion(&cid);
            StatusCode::BAD_REQUEST.into_response()
        }
        Err(ChannelError::NotFound) => StatusCode::NOT_FOUND.into_response(),
        Err(ChannelError::PreconditionFailed { etag }) => {
            let mut response = StatusCode::PRECONDITION_FAILED.into_response();
            if let Some(etag) = etag {
                if let Ok(value) = HeaderValue::from_str(&etag) {
                    response.headers_mut().insert(header::ETAG, value);
                }
            }
            response
        }
        Err(err) => {
            log::error!("put failed: {err:#}");
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
    }
}

async fn report<K: Kv>(
    State(state): State<Arc<AppState<K>>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let log_header = header_str(&headers, "x-keyexchange-log");
    let client_id = header_str(&headers, "x-keyexchange-id");
    let cid = header_str(&headers, "x-keyexchange-cid");

    let outcome = state.channel.report(log_header, &body, client_id, cid);
    if let Some(message) = outcome.log_message {
        state.audit.report(&message);
    }

    StatusCode::OK.into_response()
}
