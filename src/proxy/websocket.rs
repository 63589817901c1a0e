//! WebSocket passthrough.
//!
//! The upstream handshake completes first, over a socket dialed to the
//! policy engine's pinned address; the upstream-negotiated subprotocol is
//! echoed into the client-side `101`. After both handshakes, two
//! unidirectional pumps relay frames verbatim until either side closes.
//! Each pump forwards one frame at a time, so a stalled peer stalls its
//! direction instead of growing a buffer.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use axum::{
    extract::ws::{self, WebSocket, WebSocketUpgrade},
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use http::{
    HeaderMap, HeaderName,
    header::{self, HOST},
};
use tokio::net::TcpStream;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream, client_async_tls_with_config};
use tokio_tungstenite::tungstenite::{self, client::IntoClientRequest};
use url::Url;

use crate::{error::ProxyError, params::SkipTlsChecks, policy::PinnedTarget, tls};

/// Map an `http`/`https` target to its WebSocket equivalent.
fn ws_equivalent(url: &Url) -> Url {
    let mut url = url.clone();
    let mapped = match url.scheme() {
        "http" => "ws",
        "https" => "wss",
        _ => return url,
    };
    let _ = url.set_scheme(mapped);
    url
}

/// Handshake headers tungstenite must generate itself.
fn is_handshake_reserved(name: &HeaderName) -> bool {
    *name == header::SEC_WEBSOCKET_KEY
        || *name == header::SEC_WEBSOCKET_VERSION
        || *name == header::SEC_WEBSOCKET_ACCEPT
        || *name == header::SEC_WEBSOCKET_EXTENSIONS
}

/// Open the upstream WebSocket and return the client-side upgrade response.
///
/// `headers` is the rewritten upstream header set (including the
/// `Sec-WebSocket-Protocol` offer, if the client made one); `timeout` bounds
/// the TCP connect plus handshake. An established tunnel is not subject to
/// the timeout; it lives until either peer closes.
pub async fn dispatch_websocket(
    upgrade: WebSocketUpgrade,
    target: &Url,
    pinned: &PinnedTarget,
    headers: HeaderMap,
    skip_tls: &SkipTlsChecks,
    timeout: Duration,
) -> Result<Response, ProxyError> {
    let ws_url = ws_equivalent(target);
    let started = Instant::now();

    let connector = match ws_url.scheme() {
        "wss" if !skip_tls.is_empty() => Some(Connector::Rustls(Arc::new(
            tls::permissive_config(skip_tls)?,
        ))),
        _ => None,
    };

    let tcp = tokio::time::timeout(timeout, TcpStream::connect(pinned.addr))
        .await
        .map_err(|_| ProxyError::UpstreamTimeout(timeout))?
        .map_err(|e| {
            ProxyError::UpstreamUnreachable(format!("connect to {} failed: {e}", pinned.addr))
        })?;

    let mut request = ws_url
        .as_str()
        .into_client_request()
        .map_err(|e| ProxyError::BadTarget(format!("invalid websocket target: {e}")))?;
    {
        let request_headers = request.headers_mut();
        for (name, value) in &headers {
            if is_handshake_reserved(name) {
                continue;
            }
            if *name == HOST {
                request_headers.insert(HOST, value.clone());
            } else {
                request_headers.append(name.clone(), value.clone());
            }
        }
    }

    let remaining = timeout
        .checked_sub(started.elapsed())
        .filter(|d| !d.is_zero())
        .ok_or(ProxyError::UpstreamTimeout(timeout))?;
    let (upstream, response) = tokio::time::timeout(
        remaining,
        client_async_tls_with_config(request, tcp, None, connector),
    )
    .await
    .map_err(|_| ProxyError::UpstreamTimeout(timeout))?
    .map_err(|e| match e {
        tungstenite::Error::Io(io) => {
            ProxyError::UpstreamUnreachable(format!("websocket handshake failed: {io}"))
        }
        tungstenite::Error::Tls(tls_err) => {
            ProxyError::UpstreamUnreachable(format!("upstream TLS failure: {tls_err}"))
        }
        other => ProxyError::UpstreamProtocol(format!("websocket handshake failed: {other}")),
    })?;

    // Echo the subprotocol the upstream actually negotiated. It came out of
    // the client's own offer, so the client-side handshake will accept it.
    let negotiated = response
        .headers()
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    let mut upgrade = upgrade;
    if let Some(protocol) = negotiated {
        upgrade = upgrade.protocols([protocol]);
    }

    Ok(upgrade.on_upgrade(move |client| relay(client, upstream)))
}

type Upstream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Pump frames in both directions until either side closes.
///
/// Both pumps must finish before the session is done: when one peer closes,
/// its pump forwards the close and shuts the opposite sink, which ends the
/// other pump in turn.
async fn relay(client: WebSocket, upstream: Upstream) {
    let (mut client_tx, mut client_rx) = client.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    let client_to_upstream = async {
        while let Some(next) = client_rx.next().await {
            let Ok(message) = next else { break };
            let closing = matches!(message, ws::Message::Close(_));
            if upstream_tx.send(client_to_upstream_message(message)).await.is_err() {
                break;
            }
            if closing {
                break;
            }
        }
        let _ = upstream_tx.close().await;
    };

    let upstream_to_client = async {
        while let Some(next) = upstream_rx.next().await {
            let Ok(message) = next else { break };
            let Some(message) = upstream_to_client_message(message) else {
                continue;
            };
            let closing = matches!(message, ws::Message::Close(_));
            if client_tx.send(message).await.is_err() {
                break;
            }
            if closing {
                break;
            }
        }
        let _ = client_tx.close().await;
    };

    tokio::join!(client_to_upstream, upstream_to_client);
    tracing::debug!("websocket relay finished");
}

fn client_to_upstream_message(message: ws::Message) -> tungstenite::Message {
    match message {
        ws::Message::Text(text) => tungstenite::Message::Text(text.to_string().into()),
        ws::Message::Binary(data) => tungstenite::Message::Binary(data),
        ws::Message::Ping(data) => tungstenite::Message::Ping(data),
        ws::Message::Pong(data) => tungstenite::Message::Pong(data),
        ws::Message::Close(frame) => {
            tungstenite::Message::Close(frame.map(|f| tungstenite::protocol::CloseFrame {
                code: f.code.into(),
                reason: f.reason.to_string().into(),
            }))
        }
    }
}

fn upstream_to_client_message(message: tungstenite::Message) -> Option<ws::Message> {
    match message {
        tungstenite::Message::Text(text) => Some(ws::Message::Text(text.to_string().into())),
        tungstenite::Message::Binary(data) => Some(ws::Message::Binary(data)),
        tungstenite::Message::Ping(data) => Some(ws::Message::Ping(data)),
        tungstenite::Message::Pong(data) => Some(ws::Message::Pong(data)),
        tungstenite::Message::Close(frame) => {
            Some(ws::Message::Close(frame.map(|f| ws::CloseFrame {
                code: f.code.into(),
                reason: f.reason.to_string().into(),
            })))
        }
        // Raw frames only appear in manual frame mode.
        tungstenite::Message::Frame(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheme_mapping() {
        let http = Url::parse("http://h.example/stream").unwrap();
        assert_eq!(ws_equivalent(&http).as_str(), "ws://h.example/stream");

        let https = Url::parse("https://h.example:8443/stream").unwrap();
        assert_eq!(ws_equivalent(&https).as_str(), "wss://h.example:8443/stream");

        let already_ws = Url::parse("wss://h.example/").unwrap();
        assert_eq!(ws_equivalent(&already_ws).as_str(), "wss://h.example/");
    }

    #[test]
    fn frames_map_verbatim_client_to_upstream() {
        let text = client_to_upstream_message(ws::Message::Text("hello".into()));
        assert_eq!(text, tungstenite::Message::Text("hello".into()));

        let binary =
            client_to_upstream_message(ws::Message::Binary(bytes::Bytes::from_static(b"\x01\x02")));
        assert_eq!(
            binary,
            tungstenite::Message::Binary(bytes::Bytes::from_static(b"\x01\x02"))
        );

        let ping = client_to_upstream_message(ws::Message::Ping(bytes::Bytes::new()));
        assert!(matches!(ping, tungstenite::Message::Ping(_)));
    }

    #[test]
    fn close_frames_propagate_code_and_reason() {
        let close = client_to_upstream_message(ws::Message::Close(Some(ws::CloseFrame {
            code: 1001,
            reason: "going away".into(),
        })));
        match close {
            tungstenite::Message::Close(Some(frame)) => {
                assert_eq!(u16::from(frame.code), 1001);
                assert_eq!(frame.reason.as_str(), "going away");
            }
            other => panic!("unexpected message: {other:?}"),
        }

        let back = upstream_to_client_message(tungstenite::Message::Close(Some(
            tungstenite::protocol::CloseFrame {
                code: 1000.into(),
                reason: "done".into(),
            },
        )));
        match back {
            Some(ws::Message::Close(Some(frame))) => {
                assert_eq!(frame.code, 1000);
                assert_eq!(frame.reason.as_str(), "done");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn handshake_reserved_headers() {
        assert!(is_handshake_reserved(&header::SEC_WEBSOCKET_KEY));
        assert!(is_handshake_reserved(&header::SEC_WEBSOCKET_VERSION));
        assert!(!is_handshake_reserved(&header::SEC_WEBSOCKET_PROTOCOL));
        assert!(!is_handshake_reserved(&header::AUTHORIZATION));
    }
}
