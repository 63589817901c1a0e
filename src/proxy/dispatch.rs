//! Upstream dispatch.
//!
//! Builds and sends the upstream request with reqwest. The client never
//! re-resolves: for hostname targets the policy engine's chosen address is
//! pinned into the resolver override, so the address that was classified is
//! the address dialed. Redirect following is disabled at the client and done
//! by hand so every hop re-runs outbound policy.

use std::{
    net::SocketAddr,
    time::{Duration, Instant},
};

use http::{
    HeaderMap, Method, StatusCode,
    header::{self, HOST, LOCATION},
};
use reqwest::redirect;
use url::Url;

use super::headers::authority;
use crate::{
    config::InstanceConfig,
    error::ProxyError,
    params::SkipTlsChecks,
    policy::{self, PinnedTarget},
    tls,
};

/// Maximum redirect hops when `follow_redirects` is on.
pub const MAX_REDIRECT_HOPS: usize = 10;

/// Map a `ws`/`wss` target to its HTTP equivalent for plain dispatch.
pub fn http_equivalent(url: &Url) -> Url {
    let mut url = url.clone();
    let mapped = match url.scheme() {
        "ws" => "http",
        "wss" => "https",
        _ => return url,
    };
    // Both sides are special schemes, so this cannot fail.
    let _ = url.set_scheme(mapped);
    url
}

/// What to do with a 3xx when following redirects.
#[derive(Debug, PartialEq, Eq)]
enum RedirectAction {
    /// 301/302/303: follow with GET (HEAD stays HEAD), body dropped.
    FollowAsGet,
    /// 307/308 without a request body: follow with the same method.
    FollowSameMethod,
    /// Anything else, including 307/308 whose streamed body cannot be
    /// replayed: hand the 3xx back verbatim.
    ReturnVerbatim,
}

fn redirect_action(status: StatusCode, had_body: bool) -> RedirectAction {
    match status {
        StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND | StatusCode::SEE_OTHER => {
            RedirectAction::FollowAsGet
        }
        StatusCode::TEMPORARY_REDIRECT | StatusCode::PERMANENT_REDIRECT if !had_body => {
            RedirectAction::FollowSameMethod
        }
        _ => RedirectAction::ReturnVerbatim,
    }
}

/// Send the upstream request, following redirects when asked.
///
/// `timeout` bounds the whole upstream exchange across all hops; the
/// remaining budget is re-applied to each hop's request.
#[allow(clippy::too_many_arguments)]
pub async fn dispatch(
    shared_client: &reqwest::Client,
    instance: &InstanceConfig,
    url: Url,
    mut pinned: PinnedTarget,
    method: Method,
    headers: HeaderMap,
    body: Option<reqwest::Body>,
    had_body: bool,
    follow_redirects: bool,
    skip_tls: &SkipTlsChecks,
    timeout: Duration,
) -> Result<reqwest::Response, ProxyError> {
    let started = Instant::now();
    let host_overridden = headers_overrode_host(&headers, &url);

    let mut current_url = url;
    let mut current_method = method;
    let mut current_headers = headers;
    let mut body = body;
    let mut hops = 0usize;

    loop {
        let remaining = timeout
            .checked_sub(started.elapsed())
            .filter(|d| !d.is_zero())
            .ok_or(ProxyError::UpstreamTimeout(timeout))?;

        let client = client_for(shared_client, &pinned, skip_tls)?;
        let mut request = client
            .request(current_method.clone(), current_url.clone())
            .timeout(remaining);
        request = request.headers(current_headers.clone());
        if let Some(body) = body.take() {
            request = request.body(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| map_send_error(e, timeout))?;

        if !follow_redirects || !response.status().is_redirection() {
            return Ok(response);
        }
        let location = match response.headers().get(LOCATION) {
            // 304 and friends carry no Location; nothing to follow.
            None => return Ok(response),
            Some(value) => value
                .to_str()
                .map(str::to_owned)
                .map_err(|_| {
                    ProxyError::UpstreamProtocol("redirect Location is not valid UTF-8".into())
                })?,
        };

        match redirect_action(response.status(), had_body) {
            RedirectAction::ReturnVerbatim => return Ok(response),
            RedirectAction::FollowAsGet => {
                if current_method != Method::HEAD {
                    current_method = Method::GET;
                }
                for name in [
                    header::CONTENT_LENGTH,
                    header::CONTENT_TYPE,
                    header::CONTENT_ENCODING,
                    header::EXPECT,
                ] {
                    current_headers.remove(name);
                }
            }
            RedirectAction::FollowSameMethod => {}
        }

        hops += 1;
        if hops > MAX_REDIRECT_HOPS {
            return Err(ProxyError::UpstreamProtocol(format!(
                "redirect chain exceeded {MAX_REDIRECT_HOPS} hops"
            )));
        }

        let next = current_url.join(&location).map_err(|e| {
            ProxyError::UpstreamProtocol(format!("unparseable redirect Location: {e}"))
        })?;
        if !matches!(next.scheme(), "http" | "https") {
            return Err(ProxyError::UpstreamProtocol(format!(
                "redirect to unsupported scheme '{}'",
                next.scheme()
            )));
        }

        tracing::debug!(from = %current_url, to = %next, hop = hops, "following redirect");

        // Every hop is re-resolved, re-classified, and re-pinned.
        pinned = policy::resolve_and_authorize(&next, instance).await?;
        if !host_overridden {
            let next_authority = authority(&next);
            if let Ok(value) = next_authority.parse() {
                current_headers.insert(HOST, value);
            }
        }
        current_url = next;
    }
}

/// Pick (or build) the client for one hop.
///
/// The shared strict client serves literal-IP targets with default TLS;
/// there was no resolution step to pin. Anything else gets a fresh client:
/// hostname targets for the resolver pin, permissive-TLS requests so the
/// relaxed configuration dies with the request.
fn client_for(
    shared: &reqwest::Client,
    pinned: &PinnedTarget,
    skip_tls: &SkipTlsChecks,
) -> Result<reqwest::Client, ProxyError> {
    if pinned.is_literal && skip_tls.is_empty() {
        return Ok(shared.clone());
    }
    let mut builder = reqwest::Client::builder().redirect(redirect::Policy::none());
    if !pinned.is_literal {
        builder = builder.resolve(
            &pinned.host,
            SocketAddr::new(pinned.addr.ip(), pinned.addr.port()),
        );
    }
    if !skip_tls.is_empty() {
        builder = builder.use_preconfigured_tls(tls::permissive_config(skip_tls)?);
    }
    builder
        .build()
        .map_err(|e| ProxyError::Internal(format!("failed to build upstream client: {e}")))
}

/// Whether the caller pinned `Host` to something other than the target
/// authority (in which case redirects keep it).
fn headers_overrode_host(headers: &HeaderMap, url: &Url) -> bool {
    match headers.get(HOST) {
        Some(value) => value.as_bytes() != authority(url).as_bytes(),
        None => false,
    }
}

fn map_send_error(e: reqwest::Error, timeout: Duration) -> ProxyError {
    if e.is_timeout() {
        ProxyError::UpstreamTimeout(timeout)
    } else if e.is_connect() {
        ProxyError::UpstreamUnreachable(error_chain(&e))
    } else if e.is_body() {
        // The request body stream failed while uploading, i.e. the client
        // went away mid-request.
        ProxyError::ClientAborted
    } else if e.is_decode() {
        ProxyError::UpstreamProtocol(error_chain(&e))
    } else {
        ProxyError::UpstreamUnreachable(error_chain(&e))
    }
}

/// Join an error with its sources; reqwest's top-level messages alone
/// rarely say what actually failed.
fn error_chain(e: &dyn std::error::Error) -> String {
    let mut out = e.to_string();
    let mut source = e.source();
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_schemes_map_to_http() {
        let ws = Url::parse("ws://h.example:9001/stream").unwrap();
        assert_eq!(http_equivalent(&ws).as_str(), "http://h.example:9001/stream");

        let wss = Url::parse("wss://h.example/stream").unwrap();
        assert_eq!(http_equivalent(&wss).as_str(), "https://h.example/stream");

        let http = Url::parse("http://h.example/").unwrap();
        assert_eq!(http_equivalent(&http).as_str(), "http://h.example/");
    }

    #[test]
    fn see_other_and_legacy_redirects_convert_to_get() {
        for status in [
            StatusCode::MOVED_PERMANENTLY,
            StatusCode::FOUND,
            StatusCode::SEE_OTHER,
        ] {
            assert_eq!(redirect_action(status, true), RedirectAction::FollowAsGet);
            assert_eq!(redirect_action(status, false), RedirectAction::FollowAsGet);
        }
    }

    #[test]
    fn temporary_redirects_preserve_method_only_without_body() {
        for status in [
            StatusCode::TEMPORARY_REDIRECT,
            StatusCode::PERMANENT_REDIRECT,
        ] {
            assert_eq!(
                redirect_action(status, false),
                RedirectAction::FollowSameMethod
            );
            // A streamed body cannot be replayed.
            assert_eq!(redirect_action(status, true), RedirectAction::ReturnVerbatim);
        }
    }

    #[test]
    fn other_statuses_return_verbatim() {
        assert_eq!(
            redirect_action(StatusCode::NOT_MODIFIED, false),
            RedirectAction::ReturnVerbatim
        );
        assert_eq!(
            redirect_action(StatusCode::MULTIPLE_CHOICES, false),
            RedirectAction::ReturnVerbatim
        );
    }

    #[test]
    fn host_override_detection() {
        let url = Url::parse("http://t.example:8080/").unwrap();

        let mut same = HeaderMap::new();
        same.insert(HOST, "t.example:8080".parse().unwrap());
        assert!(!headers_overrode_host(&same, &url));

        let mut custom = HeaderMap::new();
        custom.insert(HOST, "custom.example.com".parse().unwrap());
        assert!(headers_overrode_host(&custom, &url));

        assert!(!headers_overrode_host(&HeaderMap::new(), &url));
    }
}
