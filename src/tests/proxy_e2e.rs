//! End-to-end tests through the real router.
//!
//! Each test builds the application router from a config, sends a request
//! with `tower::ServiceExt::oneshot`, and (where the request should reach
//! an upstream) proxies to a local wiremock server.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{Router, body::Body, extract::connect_info::ConnectInfo};
use http::{Request, StatusCode};
use tower::ServiceExt;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{body_string, header, method, path, query_param},
};

use crate::{AppState, config::GatewayConfig, registry::InstanceRegistry, routes};

/// Socket peer used for every test request (a public address so inbound
/// CIDR tests bite).
const PEER: &str = "203.0.113.10:55555";

fn app_from_config(config_json: &str) -> Router {
    let mut config: GatewayConfig = serde_json::from_str(config_json).unwrap();
    config.validate().unwrap();
    let registry = Arc::new(InstanceRegistry::new(&config.instances));
    let http_client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap();
    routes::build_router(AppState {
        config: Arc::new(config),
        registry,
        http_client,
    })
}

/// A router with one tokened open instance and one external-only instance.
fn app() -> Router {
    app_from_config(
        r#"{
            "instances": {
                "test": { "tokens": ["tok"] },
                "egress": { "tokens": ["tok"], "restrict_out": "external" },
                "lan": { "restrict_in_cidrs": ["192.168.0.0/16"] }
            }
        }"#,
    )
}

fn proxy_uri(instance: &str, pairs: &[(&str, &str)]) -> String {
    let mut query = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in pairs {
        query.append_pair(key, value);
    }
    format!("/{instance}?{}", query.finish())
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .extension(ConnectInfo::<SocketAddr>(PEER.parse().unwrap()))
        .body(Body::empty())
        .unwrap()
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

#[tokio::test]
async fn proxies_a_simple_get() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/get"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("hello")
                .insert_header("content-type", "text/plain"),
        )
        .mount(&upstream)
        .await;

    let uri = proxy_uri(
        "test",
        &[("token", "tok"), ("url", &format!("{}/get", upstream.uri()))],
    );
    let response = app().oneshot(get(&uri)).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "text/plain");
    assert_eq!(body_bytes(response).await, b"hello");
}

#[tokio::test]
async fn wrong_token_is_401_with_error_document() {
    let upstream = MockServer::start().await;
    let uri = proxy_uri(
        "test",
        &[
            ("token", "WRONG"),
            ("url", &format!("{}/get", upstream.uri())),
        ],
    );
    let response = app().oneshot(get(&uri)).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let json = body_json(response).await;
    assert_eq!(json["code"], 401);
    assert!(json["error"].as_str().unwrap().contains("token"));
    assert!(json["timestamp"].as_str().unwrap().ends_with('Z'));

    // Auth failed before any upstream side effect.
    assert!(upstream.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn unknown_instance_is_404() {
    let response = app()
        .oneshot(get("/nope?url=http://example.com/"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["code"], 404);
}

#[tokio::test]
async fn missing_url_is_400() {
    let response = app().oneshot(get("/test?token=tok")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["code"], 400);
    assert!(json["error"].as_str().unwrap().contains("url"));
}

#[tokio::test]
async fn external_only_instance_denies_loopback_target() {
    let upstream = MockServer::start().await;
    let uri = proxy_uri(
        "egress",
        &[("token", "tok"), ("url", &format!("{}/get", upstream.uri()))],
    );
    let response = app().oneshot(get(&uri)).await.unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(body_json(response).await["code"], 403);
    assert!(upstream.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn inbound_cidr_denies_outside_client() {
    // PEER is 203.0.113.10, outside 192.168.0.0/16
    let response = app()
        .oneshot(get("/lan?url=http://example.com/"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn redirects_return_verbatim_by_default() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/hop"))
        .respond_with(ResponseTemplate::new(302).insert_header("location", "/final"))
        .mount(&upstream)
        .await;

    let uri = proxy_uri(
        "test",
        &[("token", "tok"), ("url", &format!("{}/hop", upstream.uri()))],
    );
    let response = app().oneshot(get(&uri)).await.unwrap();

    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(response.headers()["location"], "/final");
}

#[tokio::test]
async fn redirects_are_followed_when_asked() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/hop"))
        .respond_with(ResponseTemplate::new(302).insert_header("location", "/final"))
        .mount(&upstream)
        .await;
    Mock::given(method("GET"))
        .and(path("/final"))
        .respond_with(ResponseTemplate::new(200).set_body_string("done"))
        .mount(&upstream)
        .await;

    let uri = proxy_uri(
        "test",
        &[
            ("token", "tok"),
            ("url", &format!("{}/hop", upstream.uri())),
            ("follow_redirects", "true"),
        ],
    );
    let response = app().oneshot(get(&uri)).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, b"done");
}

#[tokio::test]
async fn redirect_chain_at_cap_succeeds_and_beyond_fails() {
    let upstream = MockServer::start().await;

    // Exactly 10 hops: /s/0 → … → /s/10, which answers 200.
    for i in 0..10 {
        Mock::given(method("GET"))
            .and(path(format!("/s/{i}")))
            .respond_with(
                ResponseTemplate::new(302).insert_header("location", format!("/s/{}", i + 1)),
            )
            .mount(&upstream)
            .await;
    }
    Mock::given(method("GET"))
        .and(path("/s/10"))
        .respond_with(ResponseTemplate::new(200).set_body_string("deep"))
        .mount(&upstream)
        .await;

    // An endless loop: /loop → /loop.
    Mock::given(method("GET"))
        .and(path("/loop"))
        .respond_with(ResponseTemplate::new(302).insert_header("location", "/loop"))
        .mount(&upstream)
        .await;

    let ok_uri = proxy_uri(
        "test",
        &[
            ("token", "tok"),
            ("url", &format!("{}/s/0", upstream.uri())),
            ("follow_redirects", "yes"),
        ],
    );
    let response = app().oneshot(get(&ok_uri)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, b"deep");

    let loop_uri = proxy_uri(
        "test",
        &[
            ("token", "tok"),
            ("url", &format!("{}/loop", upstream.uri())),
            ("follow_redirects", "true"),
        ],
    );
    let response = app().oneshot(get(&loop_uri)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let json = body_json(response).await;
    assert!(json["error"].as_str().unwrap().contains("redirect"));
}

#[tokio::test]
async fn header_overrides_reach_the_upstream() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/h"))
        .and(header("x-custom", "1"))
        .and(header("host", "custom.example.com"))
        .respond_with(ResponseTemplate::new(200).set_body_string("matched"))
        .mount(&upstream)
        .await;

    let uri = proxy_uri(
        "test",
        &[
            ("token", "tok"),
            ("url", &format!("{}/h", upstream.uri())),
            ("request_header[X-Custom]", "1"),
            ("request_header[Host]", "custom.example.com"),
        ],
    );
    let response = app().oneshot(get(&uri)).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, b"matched");
}

#[tokio::test]
async fn response_headers_are_injected() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/get"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&upstream)
        .await;

    let uri = proxy_uri(
        "test",
        &[
            ("token", "tok"),
            ("url", &format!("{}/get", upstream.uri())),
            ("response_header[Access-Control-Allow-Origin]", "*"),
        ],
    );
    let response = app().oneshot(get(&uri)).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["access-control-allow-origin"], "*");
}

#[tokio::test]
async fn post_body_streams_to_upstream() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/echo"))
        .and(body_string("ping"))
        .respond_with(ResponseTemplate::new(200).set_body_string("pong"))
        .mount(&upstream)
        .await;

    let uri = proxy_uri(
        "test",
        &[("token", "tok"), ("url", &format!("{}/echo", upstream.uri()))],
    );
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-length", "4")
        .extension(ConnectInfo::<SocketAddr>(PEER.parse().unwrap()))
        .body(Body::from("ping"))
        .unwrap();
    let response = app().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, b"pong");
}

#[tokio::test]
async fn target_query_string_is_forwarded() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/q"))
        .and(query_param("a", "1"))
        .and(query_param("b", "two"))
        .respond_with(ResponseTemplate::new(200).set_body_string("queried"))
        .mount(&upstream)
        .await;

    let uri = proxy_uri(
        "test",
        &[
            ("token", "tok"),
            ("url", &format!("{}/q?a=1&b=two", upstream.uri())),
        ],
    );
    let response = app().oneshot(get(&uri)).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, b"queried");
}

#[tokio::test]
async fn slow_upstream_times_out_fast_upstream_does_not() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(1500)))
        .mount(&upstream)
        .await;
    Mock::given(method("GET"))
        .and(path("/quick"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(200)))
        .mount(&upstream)
        .await;

    let slow = proxy_uri(
        "test",
        &[
            ("token", "tok"),
            ("url", &format!("{}/slow", upstream.uri())),
            ("timeout", "1"),
        ],
    );
    let response = app().oneshot(get(&slow)).await.unwrap();
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(body_json(response).await["code"], 504);

    let quick = proxy_uri(
        "test",
        &[
            ("token", "tok"),
            ("url", &format!("{}/quick", upstream.uri())),
            ("timeout", "1"),
        ],
    );
    let response = app().oneshot(get(&quick)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn unreachable_upstream_is_502() {
    // Nothing listens on the discard port; connect is refused immediately.
    let uri = proxy_uri(
        "test",
        &[("token", "tok"), ("url", "http://127.0.0.1:9/")],
    );
    let response = app().oneshot(get(&uri)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn health_endpoint() {
    let response = app().oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "ok");
}

#[tokio::test]
async fn debug_endpoint_redacts_tokens() {
    let config = r#"{
        "server": { "debug_endpoint": { "enabled": true } },
        "instances": { "test": { "tokens": ["tok"] } }
    }"#;
    let response = app_from_config(config).oneshot(get("/debug")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["instances"]["test"]["tokens"][0], "<redacted>");
}

#[tokio::test]
async fn debug_endpoint_can_expose_tokens() {
    let config = r#"{
        "server": { "debug_endpoint": { "enabled": true, "expose_tokens": true } },
        "instances": { "test": { "tokens": ["tok"] } }
    }"#;
    let response = app_from_config(config).oneshot(get("/debug")).await.unwrap();
    let json = body_json(response).await;
    assert_eq!(json["instances"]["test"]["tokens"][0], "tok");
}

#[tokio::test]
async fn debug_endpoint_absent_unless_enabled() {
    // "/debug" falls through to instance routing and is not configurable
    // as an instance name, so it 404s.
    let response = app().oneshot(get("/debug")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn forwarding_headers_are_stripped() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/clean"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&upstream)
        .await;

    let uri = proxy_uri(
        "test",
        &[
            ("token", "tok"),
            ("url", &format!("{}/clean", upstream.uri())),
        ],
    );
    let request = Request::builder()
        .method("GET")
        .uri(uri)
        .header("x-forwarded-for", "6.6.6.6")
        .header("x-real-ip", "6.6.6.6")
        .extension(ConnectInfo::<SocketAddr>(PEER.parse().unwrap()))
        .body(Body::empty())
        .unwrap();
    let response = app().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let received = upstream.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
    assert!(!received[0].headers.contains_key("x-forwarded-for"));
    assert!(!received[0].headers.contains_key("x-real-ip"));
}

#[tokio::test]
async fn reserved_params_are_not_forwarded() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/params"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&upstream)
        .await;

    let uri = proxy_uri(
        "test",
        &[
            ("token", "tok"),
            ("url", &format!("{}/params", upstream.uri())),
            ("follow_redirects", "false"),
        ],
    );
    let response = app().oneshot(get(&uri)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let received = upstream.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
    let upstream_query = received[0].url.query().unwrap_or("");
    assert!(!upstream_query.contains("token"));
    assert!(!upstream_query.contains("follow_redirects"));
}
