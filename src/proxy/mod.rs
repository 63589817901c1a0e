//! Request admission and rewriting pipeline.
//!
//! Order matters and is part of the security contract: the instance is
//! resolved, then the client address is checked, the token verified, and
//! the target classified before any byte goes upstream. A request
//! that fails any gate produces its fault without outbound side effects.

mod dispatch;
mod headers;
mod relay;
mod websocket;

use std::{net::SocketAddr, time::Duration};

use axum::{
    extract::{ConnectInfo, FromRequestParts, Path, Request, State, WebSocketUpgrade},
    response::{IntoResponse, Response},
};
use http::{HeaderMap, header};

use crate::{
    AppState, auth,
    error::ProxyError,
    middleware::extract_client_ip,
    params::ProxyParams,
    policy,
};

/// Entry point for `/{instance}`, any method.
pub async fn handle(
    State(state): State<AppState>,
    Path(instance_name): Path<String>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    match admit_and_dispatch(state, instance_name, peer, request).await {
        Ok(response) => response,
        Err(error) => error.into_response(),
    }
}

async fn admit_and_dispatch(
    state: AppState,
    instance_name: String,
    peer: SocketAddr,
    request: Request,
) -> Result<Response, ProxyError> {
    let instance = state
        .registry
        .get(&instance_name)
        .ok_or_else(|| ProxyError::InstanceNotFound(instance_name.clone()))?;

    let client_ip = extract_client_ip(
        peer.ip(),
        request.headers(),
        &state.config.server.trusted_proxies,
    );
    policy::authorize_inbound(client_ip, &instance)?;

    let params = ProxyParams::from_query(request.uri().query())?;
    auth::authorize(&instance, params.token.as_deref())?;

    let effective_timeout =
        Duration::from_secs(params.timeout_override.unwrap_or(instance.timeout));
    let pinned = policy::resolve_and_authorize(&params.target, &instance).await?;

    let is_websocket = wants_websocket(request.headers());
    tracing::info!(
        instance = %instance_name,
        client = %client_ip,
        method = %request.method(),
        target_host = %pinned.host,
        target_addr = %pinned.addr,
        websocket = is_websocket,
        "proxying request"
    );

    if is_websocket {
        let (mut parts, _body) = request.into_parts();
        let upgrade = WebSocketUpgrade::from_request_parts(&mut parts, &())
            .await
            .map_err(|e| ProxyError::BadTarget(format!("malformed websocket upgrade: {e}")))?;
        let upstream_headers = headers::build_upstream_headers(
            &parts.headers,
            &params.target,
            &params.request_headers_override,
        )?;
        websocket::dispatch_websocket(
            upgrade,
            &params.target,
            &pinned,
            upstream_headers,
            &params.skip_tls_checks,
            effective_timeout,
        )
        .await
    } else {
        let url = dispatch::http_equivalent(&params.target);
        let (parts, body) = request.into_parts();
        let upstream_headers = headers::build_upstream_headers(
            &parts.headers,
            &url,
            &params.request_headers_override,
        )?;
        let had_body = request_has_body(&parts.headers);
        let body = had_body.then(|| reqwest::Body::wrap_stream(body.into_data_stream()));

        let response = dispatch::dispatch(
            &state.http_client,
            &instance,
            url,
            pinned,
            parts.method,
            upstream_headers,
            body,
            had_body,
            params.follow_redirects,
            &params.skip_tls_checks,
            effective_timeout,
        )
        .await?;

        Ok(relay::into_client_response(
            response,
            &params.response_headers_inject,
        ))
    }
}

/// Whether the request asks for a WebSocket upgrade.
fn wants_websocket(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

/// Whether the inbound request carries a body worth streaming upstream.
/// Methods without bodies get none attached unless one was actually present.
fn request_has_body(headers: &HeaderMap) -> bool {
    if headers.contains_key(header::TRANSFER_ENCODING) {
        return true;
    }
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .is_some_and(|n| n > 0)
}

#[cfg(test)]
mod tests {
    use http::HeaderValue;

    use super::*;

    #[test]
    fn websocket_detection_is_case_insensitive() {
        let mut headers = HeaderMap::new();
        assert!(!wants_websocket(&headers));

        headers.insert(header::UPGRADE, HeaderValue::from_static("WebSocket"));
        assert!(wants_websocket(&headers));

        headers.insert(header::UPGRADE, HeaderValue::from_static("h2c"));
        assert!(!wants_websocket(&headers));
    }

    #[test]
    fn body_detection_uses_length_and_encoding() {
        let mut headers = HeaderMap::new();
        assert!(!request_has_body(&headers));

        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("0"));
        assert!(!request_has_body(&headers));

        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("42"));
        assert!(request_has_body(&headers));

        let mut chunked = HeaderMap::new();
        chunked.insert(
            header::TRANSFER_ENCODING,
            HeaderValue::from_static("chunked"),
        );
        assert!(request_has_body(&chunked));
    }
}
