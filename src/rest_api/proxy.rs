//! Invocation proxy for deployed functions
//!
//! `/function/{name}` forwards the buffered request to one ready endpoint
//! picked by the lookup, then relays the upstream response. Resolution
//! failures map to 404 and 503, the 503 being the signal an external
//! scaler watches to wake a scaled-to-zero function.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Bytes,
    extract::{Path, RawQuery, State},
    http::{HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use tracing::{debug, warn};

use crate::error::Error;

use super::dto::ErrorResponse;
use super::handlers::error_response;
use super::ApiState;

/// Headers that belong to one hop and must not be forwarded
const HOP_BY_HOP_HEADERS: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
];

fn is_hop_header(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|hop| name.eq_ignore_ascii_case(hop))
}

fn filtered_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers.iter() {
        if !is_hop_header(name.as_str()) {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

/// `ANY /function/{name}`
pub async fn invoke_root(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
    method: Method,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Response {
    invoke(state, name, "/".to_string(), query, method, headers, body).await
}

/// `ANY /function/{name}/{*path}`
pub async fn invoke_path(
    State(state): State<Arc<ApiState>>,
    Path((name, path)): Path<(String, String)>,
    method: Method,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Response {
    invoke(state, name, format!("/{path}"), query, method, headers, body).await
}

#[cfg_attr(not(feature = "metrics"), allow(unused_variables))]
async fn invoke(
    state: Arc<ApiState>,
    name: String,
    path: String,
    query: Option<String>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let key = match state.lookup.function_key(&name) {
        Ok(key) => key,
        Err(err) => return error_response(err).into_response(),
    };
    let started = Instant::now();

    let response = match state.lookup.resolve(&name) {
        Ok(upstream) => {
            forward(
                &state.proxy_client,
                &upstream,
                &path,
                query.as_deref(),
                method,
                &headers,
                body,
            )
            .await
        }
        Err(err) => error_response(err).into_response(),
    };

    #[cfg(feature = "metrics")]
    crate::controller::metrics::observe_invocation(
        &format!("{}.{}", key.name, key.namespace),
        response.status().as_u16(),
        started.elapsed().as_secs_f64(),
    );

    response
}

/// Forward one buffered request and relay the upstream answer.
///
/// Any transport failure towards the function maps to 502, the function's
/// own HTTP status passes through untouched.
async fn forward(
    client: &reqwest::Client,
    upstream: &str,
    path: &str,
    query: Option<&str>,
    method: Method,
    headers: &HeaderMap,
    body: Bytes,
) -> Response {
    let url = match query {
        Some(query) => format!("{upstream}{path}?{query}"),
        None => format!("{upstream}{path}"),
    };
    debug!(%method, %url, "forwarding invocation");

    let result = client
        .request(method, &url)
        .headers(filtered_headers(headers))
        .body(body)
        .send()
        .await;

    let upstream_response = match result {
        Ok(response) => response,
        Err(err) => {
            warn!(%url, "upstream request failed: {err}");
            return bad_gateway(&Error::HttpError(err));
        }
    };

    let status = upstream_response.status();
    let headers = filtered_headers(upstream_response.headers());
    match upstream_response.bytes().await {
        Ok(bytes) => (status, headers, bytes).into_response(),
        Err(err) => {
            warn!(%url, "reading upstream response failed: {err}");
            bad_gateway(&Error::HttpError(err))
        }
    }
}

fn bad_gateway(err: &Error) -> Response {
    (
        StatusCode::BAD_GATEWAY,
        Json(ErrorResponse::new("upstream_error", &err.to_string())),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header::{HeaderName, HeaderValue, CONNECTION, CONTENT_TYPE, HOST};
    use wiremock::matchers::{body_string, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_hop_headers_are_stripped() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert(HOST, HeaderValue::from_static("gateway"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        headers.insert(
            HeaderName::from_static("x-custom"),
            HeaderValue::from_static("kept"),
        );

        let filtered = filtered_headers(&headers);

        assert!(filtered.get(CONNECTION).is_none());
        assert!(filtered.get(HOST).is_none());
        assert_eq!(
            filtered.get(CONTENT_TYPE),
            Some(&HeaderValue::from_static("text/plain"))
        );
        assert_eq!(
            filtered.get("x-custom"),
            Some(&HeaderValue::from_static("kept"))
        );
    }

    #[tokio::test]
    async fn test_forward_relays_body_and_query() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .and(query_param("pretty", "1"))
            .and(header("x-custom", "kept"))
            .and(body_string("hello"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("x-function", "figlet")
                    .set_body_string("HELLO"),
            )
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("x-custom"),
            HeaderValue::from_static("kept"),
        );
        headers.insert(CONNECTION, HeaderValue::from_static("close"));

        let response = forward(
            &client,
            &server.uri(),
            "/",
            Some("pretty=1"),
            Method::POST,
            &headers,
            Bytes::from_static(b"hello"),
        )
        .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("x-function"),
            Some(&HeaderValue::from_static("figlet"))
        );
    }

    #[tokio::test]
    async fn test_forward_passes_function_status_through() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(418))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let response = forward(
            &client,
            &server.uri(),
            "/missing",
            None,
            Method::GET,
            &HeaderMap::new(),
            Bytes::new(),
        )
        .await;

        assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
    }

    #[tokio::test]
    async fn test_forward_unreachable_upstream_is_bad_gateway() {
        let client = reqwest::Client::new();
        let response = forward(
            &client,
            "http://127.0.0.1:1",
            "/",
            None,
            Method::GET,
            &HeaderMap::new(),
            Bytes::new(),
        )
        .await;

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
