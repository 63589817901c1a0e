//! Streaming hand-off of the upstream response to the client.

use axum::{body::Body, response::Response};
use http::HeaderMap;

use super::headers::filter_response_headers;

/// Turn the upstream response into the client response.
///
/// Headers go out first (hop-by-hop removed, injected headers merged last so
/// they win), then the body is streamed chunk by chunk. Nothing buffers the
/// payload: hyper's bounded channel provides the backpressure, so a stalled
/// client stalls the upstream read and memory stays flat for arbitrarily
/// large bodies. If the upstream fails mid-stream the body stream yields an
/// error and the connection is aborted without a late status change.
pub fn into_client_response(upstream: reqwest::Response, inject: &HeaderMap) -> Response {
    let status = upstream.status();
    let mut headers = filter_response_headers(upstream.headers());
    for (name, value) in inject {
        headers.insert(name.clone(), value.clone());
    }

    let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}
