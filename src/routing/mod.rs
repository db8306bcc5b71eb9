//! Route matching
//!
//! Routes are evaluated in configuration order and the first one whose
//! headers, method and path pattern all match wins.

use axum::http::{request::Parts, HeaderMap, HeaderName, Method};
use regex::Regex;

use crate::config::{ConfigError, ParserConfig, RouteKind};
use crate::hooks::HookRegistry;
use crate::mock::MockHandler;
use crate::proxy::PassThrough;

/// What a matched route does with the request
pub enum RouteMode {
    Mock(MockHandler),
    Pass(PassThrough),
}

/// A configured service endpoint
pub struct Route {
    pattern: Regex,
    methods: Vec<Method>,
    headers: Vec<(HeaderName, String)>,
    log: bool,
    mode: RouteMode,
}

impl Route {
    pub fn new(pattern: Regex, methods: Vec<Method>, mode: RouteMode) -> Self {
        Self {
            pattern,
            methods,
            headers: Vec::new(),
            log: false,
            mode,
        }
    }

    /// Require a header to carry exactly this value
    pub fn with_header(mut self, name: HeaderName, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    pub fn with_log(mut self, log: bool) -> Self {
        self.log = log;
        self
    }

    /// Build a route from its parser configuration
    pub fn from_config(parser: &ParserConfig, hooks: &HookRegistry) -> Result<Self, ConfigError> {
        let pattern = Regex::new(&parser.pattern)?;

        if parser.methods.is_empty() {
            return Err(ConfigError::invalid("at least one method is required"));
        }
        let methods = parser
            .methods
            .iter()
            .map(|m| parse_method(m))
            .collect::<Result<Vec<_>, _>>()?;

        let mut headers = parser
            .headers
            .iter()
            .map(|(name, value)| {
                HeaderName::from_bytes(name.as_bytes())
                    .map(|name| (name, value.clone()))
                    .map_err(|_| ConfigError::invalid(format!("invalid header name {name:?}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        headers.sort_by(|a, b| a.0.as_str().cmp(b.0.as_str()));

        let mode = match parser.kind {
            RouteKind::Mock => RouteMode::Mock(MockHandler::from_config(&parser.responses, hooks)?),
            RouteKind::Pass => RouteMode::Pass(PassThrough::from_config(parser, hooks)?),
        };

        Ok(Self {
            pattern,
            methods,
            headers,
            log: parser.log,
            mode,
        })
    }

    /// Header values must be equal, methods must be listed, and the pattern
    /// must be found somewhere in the path.
    pub fn matches(&self, method: &Method, path: &str, headers: &HeaderMap) -> bool {
        let headers_match = self.headers.iter().all(|(name, expected)| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .is_some_and(|value| value == expected)
        });

        headers_match && self.methods.contains(method) && self.pattern.is_match(path)
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    pub fn methods(&self) -> &[Method] {
        &self.methods
    }

    pub fn log(&self) -> bool {
        self.log
    }

    pub fn mode(&self) -> &RouteMode {
        &self.mode
    }
}

pub(crate) fn parse_method(method: &str) -> Result<Method, ConfigError> {
    Method::from_bytes(method.trim().to_uppercase().as_bytes())
        .map_err(|_| ConfigError::invalid(format!("invalid method {method:?}")))
}

/// Ordered route list
#[derive(Default)]
pub struct RouteMatcher {
    routes: Vec<Route>,
}

impl RouteMatcher {
    pub fn new(routes: Vec<Route>) -> Self {
        Self { routes }
    }

    /// First route accepting the request, in declaration order
    pub fn find(&self, parts: &Parts) -> Option<&Route> {
        self.routes
            .iter()
            .find(|route| route.matches(&parts.method, parts.uri.path(), &parts.headers))
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::BodyKind;
    use crate::mock::MockResponse;
    use axum::http::Request;

    fn mock_route(pattern: &str, methods: &[Method], body: &'static str) -> Route {
        let response = MockResponse::new(BodyKind::fixed(body));
        Route::new(
            Regex::new(pattern).unwrap(),
            methods.to_vec(),
            RouteMode::Mock(MockHandler::new(vec![response]).unwrap()),
        )
    }

    fn parts(method: Method, uri: &str, headers: &[(&str, &str)]) -> Parts {
        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    fn fixed_body(route: &Route) -> &str {
        match route.mode() {
            RouteMode::Mock(handler) => match handler.responses()[0].body() {
                BodyKind::Fixed(fixed) => std::str::from_utf8(fixed.content()).unwrap(),
                _ => panic!("expected fixed body"),
            },
            RouteMode::Pass(_) => panic!("expected mock route"),
        }
    }

    #[test]
    fn test_first_match_wins() {
        let matcher = RouteMatcher::new(vec![
            mock_route("/mock", &[Method::GET], "first"),
            mock_route("/mock/fixed", &[Method::GET], "second"),
        ]);

        let route = matcher
            .find(&parts(Method::GET, "/mock/fixed/value/x", &[]))
            .unwrap();
        assert_eq!(fixed_body(route), "first");
    }

    #[test]
    fn test_method_must_be_accepted() {
        let matcher = RouteMatcher::new(vec![
            mock_route("/items", &[Method::POST], "post"),
            mock_route("/items", &[Method::GET, Method::PUT], "get-put"),
        ]);

        let route = matcher.find(&parts(Method::PUT, "/items", &[])).unwrap();
        assert_eq!(fixed_body(route), "get-put");
        assert!(matcher.find(&parts(Method::DELETE, "/items", &[])).is_none());
    }

    #[test]
    fn test_pattern_is_unanchored_search() {
        let matcher = RouteMatcher::new(vec![mock_route("fixed/v", &[Method::GET], "hit")]);
        assert!(matcher
            .find(&parts(Method::GET, "/mock/fixed/value", &[]))
            .is_some());

        let anchored = RouteMatcher::new(vec![mock_route("^/fixed$", &[Method::GET], "hit")]);
        assert!(anchored
            .find(&parts(Method::GET, "/mock/fixed", &[]))
            .is_none());
    }

    #[test]
    fn test_headers_must_all_be_equal() {
        let route = mock_route("/tenant", &[Method::GET], "acme")
            .with_header(HeaderName::from_static("x-tenant"), "acme")
            .with_header(HeaderName::from_static("x-region"), "eu");
        let matcher = RouteMatcher::new(vec![route, mock_route("/tenant", &[Method::GET], "any")]);

        let matched = matcher
            .find(&parts(
                Method::GET,
                "/tenant",
                &[("X-Tenant", "acme"), ("X-Region", "eu")],
            ))
            .unwrap();
        assert_eq!(fixed_body(matched), "acme");

        // substring is not equality
        let fallback = matcher
            .find(&parts(
                Method::GET,
                "/tenant",
                &[("X-Tenant", "acme-corp"), ("X-Region", "eu")],
            ))
            .unwrap();
        assert_eq!(fixed_body(fallback), "any");

        let missing = matcher
            .find(&parts(Method::GET, "/tenant", &[("X-Tenant", "acme")]))
            .unwrap();
        assert_eq!(fixed_body(missing), "any");
    }

    #[test]
    fn test_no_match() {
        let matcher = RouteMatcher::new(vec![mock_route("/ping", &[Method::GET], "pong")]);
        assert!(matcher.find(&parts(Method::GET, "/teste", &[])).is_none());
        assert!(RouteMatcher::default()
            .find(&parts(Method::GET, "/", &[]))
            .is_none());
    }

    #[test]
    fn test_from_config_rejects_bad_input() {
        let yaml = r#"
pattern: "("
methods: [GET]
type: mock
responses:
  - body: pong
"#;
        let parser: ParserConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(
            Route::from_config(&parser, &HookRegistry::new()),
            Err(ConfigError::Pattern(_))
        ));

        let no_methods: ParserConfig =
            serde_yaml::from_str("pattern: /ping\ntype: mock\nresponses:\n  - body: pong\n")
                .unwrap();
        assert!(Route::from_config(&no_methods, &HookRegistry::new()).is_err());
    }

    #[test]
    fn test_from_config_normalizes_methods() {
        let parser: ParserConfig = serde_yaml::from_str(
            "pattern: /ping\nmethods: [get, Post]\ntype: mock\nresponses:\n  - body: pong\n",
        )
        .unwrap();
        let route = Route::from_config(&parser, &HookRegistry::new()).unwrap();
        assert_eq!(route.methods(), &[Method::GET, Method::POST]);
        assert_eq!(route.pattern(), "/ping");
    }
}
