//! Mock responses
//!
//! A mock route owns one or more candidate responses. Each request draws one
//! of them in proportion to its configured weight, waits for the configured
//! delay, then writes the response body.

use axum::body::Body;
use axum::http::{HeaderName, HeaderValue, Method, Request, Response, StatusCode};
use rand::Rng;
use std::collections::HashMap;
use std::time::Duration;

use crate::body::BodyKind;
use crate::config::{BodyType, ConfigError, ResponseConfig};
use crate::dispatcher::DispatchError;
use crate::hooks::HookRegistry;
use crate::routing::parse_method;

/// Total weight of all responses of a route
pub const TOTAL_WEIGHT: f64 = 100.0;

const WEIGHT_TOLERANCE: f64 = 1e-6;

/// Inclusive latency bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayRange {
    min: Duration,
    max: Duration,
}

impl DelayRange {
    pub fn new(min: Duration, max: Duration) -> Result<Self, ConfigError> {
        if min > max {
            return Err(ConfigError::invalid(format!(
                "delay min {min:?} is greater than max {max:?}"
            )));
        }
        Ok(Self { min, max })
    }

    /// Fixed delay
    pub fn exactly(delay: Duration) -> Self {
        Self {
            min: delay,
            max: delay,
        }
    }

    pub fn sample(&self) -> Duration {
        if self.min == self.max {
            return self.min;
        }
        rand::thread_rng().gen_range(self.min..=self.max)
    }

    pub async fn wait(&self) {
        let delay = self.sample();
        tracing::debug!(delay_ms = %delay.as_millis(), "Applying delay");
        tokio::time::sleep(delay).await;
    }
}

/// One candidate response of a mock route
pub struct MockResponse {
    status: HashMap<Method, StatusCode>,
    headers: Vec<(HeaderName, HeaderValue)>,
    weight: f64,
    delay: Option<DelayRange>,
    body: BodyKind,
}

impl MockResponse {
    pub fn new(body: BodyKind) -> Self {
        Self {
            status: HashMap::new(),
            headers: Vec::new(),
            weight: TOTAL_WEIGHT,
            delay: None,
            body,
        }
    }

    pub fn with_status(mut self, method: Method, status: StatusCode) -> Self {
        self.status.insert(method, status);
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.push((name, value));
        self
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_delay(mut self, delay: DelayRange) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn from_config(config: &ResponseConfig, hooks: &HookRegistry) -> Result<Self, ConfigError> {
        let body = match config.body_type {
            BodyType::Fixed => BodyKind::from_fixed_config(config)?,
            BodyType::Request => BodyKind::Echo,
            BodyType::Runnable => {
                let (Some(library), Some(symbol)) =
                    (config.response_lib.as_deref(), config.response_symbol.as_deref())
                else {
                    return Err(ConfigError::invalid(
                        "runnable responses require response-lib and response-symbol",
                    ));
                };
                BodyKind::Runnable(hooks.resolve_runnable(library, symbol)?)
            }
        };

        let mut response = Self::new(body).with_weight(config.distribution);

        for (method, code) in &config.status {
            let status = StatusCode::from_u16(*code)
                .map_err(|_| ConfigError::invalid(format!("invalid status code {code}")))?;
            response = response.with_status(parse_method(method)?, status);
        }

        for (name, value) in &config.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| ConfigError::invalid(format!("invalid header name {name:?}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| ConfigError::invalid(format!("invalid value for header {name}")))?;
            response = response.with_header(name, value);
        }

        if let Some((min, max)) = config.delay.as_ref().map(|d| d.bounds()).transpose()?.flatten() {
            response = response.with_delay(DelayRange::new(min, max)?);
        }

        Ok(response)
    }

    /// Status for the request method, 200 when the method has no mapping
    pub fn status_for(&self, method: &Method) -> StatusCode {
        self.status.get(method).copied().unwrap_or(StatusCode::OK)
    }

    pub fn headers(&self) -> &[(HeaderName, HeaderValue)] {
        &self.headers
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    pub fn delay(&self) -> Option<DelayRange> {
        self.delay
    }

    pub fn body(&self) -> &BodyKind {
        &self.body
    }

    /// Render this response for the request
    pub async fn write(&self, request: Request<Body>) -> Result<Response<Body>, DispatchError> {
        let status = self.status_for(request.method());
        self.body.render(status, &self.headers, request).await
    }
}

/// Weighted set of responses belonging to one route
pub struct MockHandler {
    responses: Vec<MockResponse>,
}

impl MockHandler {
    /// Validate weights and order responses ascending by weight.
    ///
    /// A single response always carries the full weight. Ties keep their
    /// configured order.
    pub fn new(mut responses: Vec<MockResponse>) -> Result<Self, ConfigError> {
        match responses.len() {
            0 => return Err(ConfigError::invalid("mock services need at least one response")),
            1 => responses[0].weight = TOTAL_WEIGHT,
            _ => {
                if let Some(bad) = responses
                    .iter()
                    .find(|r| !(0.0..=TOTAL_WEIGHT).contains(&r.weight))
                {
                    return Err(ConfigError::invalid(format!(
                        "distribution {} is outside 0..=100",
                        bad.weight
                    )));
                }
                let total: f64 = responses.iter().map(|r| r.weight).sum();
                if (total - TOTAL_WEIGHT).abs() > WEIGHT_TOLERANCE {
                    return Err(ConfigError::invalid(format!(
                        "response distributions must sum to 100, got {total}"
                    )));
                }
            }
        }

        responses.sort_by(|a, b| a.weight.total_cmp(&b.weight));
        Ok(Self { responses })
    }

    pub fn from_config(configs: &[ResponseConfig], hooks: &HookRegistry) -> Result<Self, ConfigError> {
        let responses = configs
            .iter()
            .enumerate()
            .map(|(index, config)| {
                MockResponse::from_config(config, hooks).map_err(|e| {
                    ConfigError::invalid(format!("response {index}: {e}"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(responses)
    }

    pub fn responses(&self) -> &[MockResponse] {
        &self.responses
    }

    /// Response whose cumulative weight first exceeds `draw` (in `[0, 100)`)
    pub fn select(&self, draw: f64) -> &MockResponse {
        let mut cumulative = 0.0;
        for response in &self.responses {
            cumulative += response.weight;
            if draw < cumulative {
                return response;
            }
        }
        // weights sum to 100, so any draw below 100 lands on a response
        unreachable!("draw {draw} exceeds cumulative weight {cumulative}")
    }

    /// Draw a response at random, with 0.01 granularity
    pub fn choose(&self) -> &MockResponse {
        let draw = rand::thread_rng().gen_range(0..10_000) as f64 / 100.0;
        self.select(draw)
    }

    /// Pick a response, apply its delay and write it
    pub async fn respond(&self, request: Request<Body>) -> Result<Response<Body>, DispatchError> {
        let response = self.choose();
        if let Some(delay) = response.delay {
            delay.wait().await;
        }
        response.write(request).await
    }
}
