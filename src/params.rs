//! Query-string parsing for proxy requests.
//!
//! The query string carries everything that steers a request: the target
//! URL, the authentication token, per-request overrides, and two keyed
//! collections flattened into bracketed parameters
//! (`request_header[NAME]=V`, `response_header[NAME]=V`). Reserved
//! parameters are consumed here and never reach the upstream.

use http::{HeaderMap, HeaderName, HeaderValue};
use url::{Url, form_urlencoded};

use crate::{config::MAX_TIMEOUT_SECS, error::ProxyError};

/// Which TLS verification failures the caller asked to forgive.
///
/// Behavior depends on the set, not the order tokens were listed in;
/// unknown tokens are ignored; `all` implies the full set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SkipTlsChecks {
    pub all: bool,
    pub expired_cert: bool,
    pub self_signed: bool,
    pub hostname_mismatch: bool,
    pub cert_authority: bool,
    pub weak_cipher: bool,
}

impl SkipTlsChecks {
    /// Parse a comma-separated token list.
    pub fn parse(list: &str) -> Self {
        let mut set = Self::default();
        for token in list.split(',') {
            match token.trim().to_ascii_lowercase().as_str() {
                "all" => set = Self::everything(),
                "expired_cert" => set.expired_cert = true,
                "self_signed" => set.self_signed = true,
                "hostname_mismatch" => set.hostname_mismatch = true,
                "cert_authority" => set.cert_authority = true,
                "weak_cipher" => set.weak_cipher = true,
                // Unknown tokens are ignored
                _ => {}
            }
        }
        set
    }

    /// The full set, as implied by `all`.
    pub fn everything() -> Self {
        Self {
            all: true,
            expired_cert: true,
            self_signed: true,
            hostname_mismatch: true,
            cert_authority: true,
            weak_cipher: true,
        }
    }

    /// No check is skipped; strict verification applies and transports may
    /// be pooled.
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    pub fn forgives_expiry(&self) -> bool {
        self.all || self.expired_cert
    }

    pub fn forgives_hostname(&self) -> bool {
        self.all || self.hostname_mismatch
    }

    /// `self_signed` and `cert_authority` both mean "accept chains not
    /// rooted in the trust store".
    pub fn forgives_unknown_issuer(&self) -> bool {
        self.all || self.self_signed || self.cert_authority
    }
}

/// Everything the query string said about one proxy request.
#[derive(Debug)]
pub struct ProxyParams {
    /// Parsed absolute target URL (scheme http, https, ws, or wss).
    pub target: Url,
    /// Authentication token, if presented.
    pub token: Option<String>,
    /// Per-request timeout override in seconds, clamped to [1, 3600].
    pub timeout_override: Option<u64>,
    /// Follow upstream redirects instead of returning 3xx verbatim.
    pub follow_redirects: bool,
    /// TLS verification failures to forgive for this request.
    pub skip_tls_checks: SkipTlsChecks,
    /// Header overrides applied to the upstream request; last occurrence
    /// wins, names are case-insensitive.
    pub request_headers_override: HeaderMap,
    /// Headers injected into the response sent back to the client.
    pub response_headers_inject: HeaderMap,
}

impl ProxyParams {
    /// Parse the raw query string. Parses exactly once; unrecognized
    /// parameters are ignored.
    pub fn from_query(query: Option<&str>) -> Result<Self, ProxyError> {
        let mut url_param: Option<String> = None;
        let mut token: Option<String> = None;
        let mut timeout_override: Option<u64> = None;
        let mut follow_redirects = false;
        let mut skip_tls_checks = SkipTlsChecks::default();
        let mut request_headers_override = HeaderMap::new();
        let mut response_headers_inject = HeaderMap::new();

        for (key, value) in form_urlencoded::parse(query.unwrap_or("").as_bytes()) {
            match key.as_ref() {
                "url" => url_param = Some(value.into_owned()),
                "token" => token = Some(value.into_owned()),
                "timeout" => timeout_override = Some(parse_timeout(&value)?),
                "follow_redirects" => follow_redirects = parse_bool(&value),
                "skip_tls_checks" => skip_tls_checks = SkipTlsChecks::parse(&value),
                key => {
                    // `request_headers[..]` is a deprecated synonym kept for
                    // configurations written against older releases.
                    if let Some(name) = bracketed(key, "request_header")
                        .or_else(|| bracketed(key, "request_headers"))
                    {
                        insert_header(&mut request_headers_override, name, &value)?;
                    } else if let Some(name) = bracketed(key, "response_header") {
                        insert_header(&mut response_headers_inject, name, &value)?;
                    }
                }
            }
        }

        let raw = url_param
            .ok_or_else(|| ProxyError::BadTarget("missing 'url' parameter".into()))?;
        let target = Url::parse(&raw)
            .map_err(|e| ProxyError::BadTarget(format!("unparseable 'url' parameter: {e}")))?;
        match target.scheme() {
            "http" | "https" | "ws" | "wss" => {}
            other => {
                return Err(ProxyError::BadTarget(format!(
                    "unsupported target scheme '{other}'"
                )));
            }
        }
        if target.host_str().is_none() {
            return Err(ProxyError::BadTarget("target URL has no host".into()));
        }

        Ok(Self {
            target,
            token,
            timeout_override,
            follow_redirects,
            skip_tls_checks,
            request_headers_override,
            response_headers_inject,
        })
    }
}

/// `{true, 1, yes, on}` case-insensitive; everything else is false.
fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}

fn parse_timeout(value: &str) -> Result<u64, ProxyError> {
    let secs: u64 = value
        .trim()
        .parse()
        .map_err(|_| ProxyError::BadTarget(format!("invalid 'timeout' value '{value}'")))?;
    Ok(secs.clamp(1, MAX_TIMEOUT_SECS))
}

/// Extract NAME from `<prefix>[NAME]`.
fn bracketed<'a>(key: &'a str, prefix: &str) -> Option<&'a str> {
    key.strip_prefix(prefix)?.strip_prefix('[')?.strip_suffix(']')
}

fn insert_header(map: &mut HeaderMap, name: &str, value: &str) -> Result<(), ProxyError> {
    let header_name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|_| ProxyError::BadTarget(format!("invalid header name '{name}'")))?;
    let header_value = HeaderValue::from_str(value)
        .map_err(|_| ProxyError::BadTarget(format!("invalid value for header '{name}'")))?;
    map.insert(header_name, header_value);
    Ok(())
}
