//! Proxy module
//!
//! Forwards requests to a fixed upstream after running the transform hook and
//! the path rewrite chain, then relays the upstream response.

use axum::body::{Body, Bytes};
use axum::extract::ConnectInfo;
use axum::http::{header, HeaderMap, HeaderValue, Request, Response};
use regex::Regex;
use reqwest::{Client, Url};
use std::borrow::Cow;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use crate::config::{ConfigError, ParserConfig};
use crate::dispatcher::DispatchError;
use crate::hooks::{HookRegistry, HookRequest, TransformHook};
use crate::logging::{log_request, log_response};

/// Headers that only apply to a single connection
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";

/// Regular expression substitution applied to the outbound path
#[derive(Debug, Clone)]
pub struct RewriteRule {
    source: String,
    regex: Option<Regex>,
    target: String,
}

impl RewriteRule {
    /// A source that does not compile is kept but skipped when applied
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        let source = source.into();
        let regex = match Regex::new(&source) {
            Ok(regex) => Some(regex),
            Err(e) => {
                tracing::error!(source = %source, error = %e, "error parsing rewrite");
                None
            }
        };
        Self {
            source,
            regex,
            target: target.into(),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn apply<'a>(&self, path: &'a str) -> Cow<'a, str> {
        match &self.regex {
            Some(regex) => regex.replace_all(path, self.target.as_str()),
            None => {
                tracing::error!(source = %self.source, "skipping invalid rewrite");
                Cow::Borrowed(path)
            }
        }
    }
}

/// Run every rule in order, each one rewriting the previous output
pub fn rewrite_path(rules: &[RewriteRule], path: &str) -> String {
    rules
        .iter()
        .fold(path.to_string(), |current, rule| rule.apply(&current).into_owned())
}

/// Request path and query aimed at the upstream's scheme, host and port
pub fn upstream_url(base: &Url, path: &str, query: Option<&str>) -> Url {
    let mut url = base.clone();
    url.set_path(path);
    url.set_query(query.filter(|query| !query.is_empty()));
    url.set_fragment(None);
    url
}

/// Append the client to `x-forwarded-for` and keep the original host
fn add_forwarded_headers(headers: &mut HeaderMap, client: Option<IpAddr>) {
    if let Some(host) = headers.get(header::HOST).cloned() {
        if !headers.contains_key(X_FORWARDED_HOST) {
            headers.insert(X_FORWARDED_HOST, host);
        }
    }

    let Some(client) = client else {
        return;
    };
    let prior = headers
        .get_all(X_FORWARDED_FOR)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .collect::<Vec<_>>()
        .join(", ");
    let forwarded = if prior.is_empty() {
        client.to_string()
    } else {
        format!("{prior}, {client}")
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Pass-through handling for one route
pub struct PassThrough {
    upstream: Url,
    client: Client,
    rewrites: Vec<RewriteRule>,
    transform: Option<Arc<dyn TransformHook>>,
    log: bool,
}

impl PassThrough {
    pub fn new(upstream: Url) -> Result<Self, ConfigError> {
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| ConfigError::invalid(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            upstream,
            client,
            rewrites: Vec::new(),
            transform: None,
            log: false,
        })
    }

    pub fn with_rewrite(mut self, rule: RewriteRule) -> Self {
        self.rewrites.push(rule);
        self
    }

    pub fn with_transform(mut self, transform: Arc<dyn TransformHook>) -> Self {
        self.transform = Some(transform);
        self
    }

    pub fn with_log(mut self, log: bool) -> Self {
        self.log = log;
        self
    }

    pub fn from_config(parser: &ParserConfig, hooks: &HookRegistry) -> Result<Self, ConfigError> {
        let base = parser
            .pass_base_uri
            .as_deref()
            .filter(|uri| !uri.is_empty())
            .ok_or_else(|| ConfigError::invalid("pass services require pass-base-uri"))?;
        let upstream = Url::parse(base)
            .map_err(|e| ConfigError::invalid(format!("error parsing pass url {base}: {e}")))?;
        if !matches!(upstream.scheme(), "http" | "https") || upstream.host_str().is_none() {
            return Err(ConfigError::invalid(format!(
                "pass url {base} must be an absolute http(s) url"
            )));
        }
        tracing::debug!(upstream = %upstream, "Pass url");

        let mut pass = Self::new(upstream)?.with_log(parser.log);

        match (parser.transform_lib.as_deref(), parser.transform_symbol.as_deref()) {
            (Some(library), Some(symbol)) if !library.is_empty() && !symbol.is_empty() => {
                pass = pass.with_transform(hooks.resolve_transform(library, symbol)?);
            }
            _ => {}
        }

        for rewrite in &parser.rewrites {
            pass = pass.with_rewrite(RewriteRule::new(&rewrite.source, &rewrite.target));
        }

        Ok(pass)
    }

    pub fn upstream(&self) -> &Url {
        &self.upstream
    }

    pub fn rewrites(&self) -> &[RewriteRule] {
        &self.rewrites
    }

    /// Transform a copy of the request; a failing transform leaves it untouched
    async fn apply_transform(&self, request: HookRequest) -> HookRequest {
        let Some(transform) = self.transform.clone() else {
            return request;
        };

        let original = request.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut candidate = request;
            transform.transform(&mut candidate).map(|()| candidate)
        })
        .await;

        match result {
            Ok(Ok(transformed)) => transformed,
            Ok(Err(e)) => {
                tracing::error!(error = %e, "error transforming pass request");
                original
            }
            Err(e) => {
                tracing::error!(error = %e, "transform hook panicked");
                original
            }
        }
    }

    /// Forward the request upstream and relay the response
    pub async fn forward(&self, req: Request<Body>) -> Result<Response<Body>, DispatchError> {
        let (parts, body) = req.into_parts();
        let client = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());
        let body = axum::body::to_bytes(body, usize::MAX)
            .await
            .map_err(|e| DispatchError::BodyRead(e.to_string()))?;

        let request = self
            .apply_transform(HookRequest {
                method: parts.method,
                uri: parts.uri,
                headers: parts.headers,
                body,
            })
            .await;

        let path = rewrite_path(&self.rewrites, request.path());
        let url = upstream_url(&self.upstream, &path, request.query());
        tracing::debug!(url = %url, "URL after rewrite");

        let mut headers = request.headers;
        add_forwarded_headers(&mut headers, client);
        headers.remove(header::HOST);
        strip_hop_by_hop(&mut headers);

        if self.log {
            log_request(&request.method, url.as_str(), &headers, &request.body);
        }

        let upstream_response = self
            .client
            .request(request.method, url.clone())
            .headers(headers)
            .body(request.body)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, target = %url, "Proxy error");
                DispatchError::Upstream(e.to_string())
            })?;

        let status = upstream_response.status();
        let mut headers = upstream_response.headers().clone();
        let body: Bytes = upstream_response
            .bytes()
            .await
            .map_err(|e| DispatchError::Upstream(e.to_string()))?;

        if self.log {
            log_response(status, &headers, &body);
        }

        tracing::info!(target = %url, status = %status.as_u16(), "Proxied request");

        strip_hop_by_hop(&mut headers);
        let mut response = Response::new(Body::from(body));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}
