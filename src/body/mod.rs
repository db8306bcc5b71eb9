//! Response body resolution
//!
//! Four body kinds are supported: fixed content, fixed content with a
//! per-request override file, an echo of the request body, and a runnable
//! hook that writes the whole response.

use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, Response, StatusCode};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{ConfigError, ResponseConfig};
use crate::dispatcher::DispatchError;
use crate::hooks::{HookRequest, ResponseSink, RunnableHook};

/// Loaded override files, keyed by file name.
///
/// Entries live for the life of the process.
#[derive(Debug, Default)]
pub struct FileContentCache {
    entries: Mutex<HashMap<String, Bytes>>,
}

impl FileContentCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Bytes> {
        self.entries.lock().get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Cached content for `name`, reading `dir/name` on a miss.
    ///
    /// Concurrent misses may both read the file; the first stored entry wins.
    pub async fn get_or_load(&self, dir: &Path, name: &str) -> std::io::Result<Bytes> {
        if let Some(content) = self.get(name) {
            return Ok(content);
        }

        let content = Bytes::from(tokio::fs::read(dir.join(name)).await?);
        tracing::debug!(file = %name, bytes = content.len(), "Loaded override file");

        Ok(self
            .entries
            .lock()
            .entry(name.to_string())
            .or_insert(content)
            .clone())
    }
}

/// Request header that selects an alternate body file
#[derive(Debug)]
pub struct OverrideFiles {
    header: HeaderName,
    source_dir: PathBuf,
    cache: FileContentCache,
}

impl OverrideFiles {
    pub fn new(header: HeaderName, source_dir: impl Into<PathBuf>) -> Self {
        Self {
            header,
            source_dir: source_dir.into(),
            cache: FileContentCache::new(),
        }
    }

    pub fn header(&self) -> &HeaderName {
        &self.header
    }

    pub fn cache(&self) -> &FileContentCache {
        &self.cache
    }

    /// Load the file named by `requested`. Only the last path component is
    /// used so lookups never leave the source directory.
    pub async fn load(&self, requested: &str) -> Result<Bytes, DispatchError> {
        let not_found = || DispatchError::OverrideFileNotFound(requested.to_string());

        let name = Path::new(requested)
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(not_found)?;

        self.cache
            .get_or_load(&self.source_dir, name)
            .await
            .map_err(|e| {
                tracing::warn!(file = %name, error = %e, "Override file unavailable");
                not_found()
            })
    }
}

/// Static body, optionally replaced per request by an override file
#[derive(Debug)]
pub struct FixedBody {
    content: Bytes,
    overrides: Option<OverrideFiles>,
}

impl FixedBody {
    pub fn new(content: impl Into<Bytes>) -> Self {
        Self {
            content: content.into(),
            overrides: None,
        }
    }

    pub fn with_overrides(mut self, overrides: OverrideFiles) -> Self {
        self.overrides = Some(overrides);
        self
    }

    pub fn content(&self) -> &Bytes {
        &self.content
    }

    pub fn overrides(&self) -> Option<&OverrideFiles> {
        self.overrides.as_ref()
    }

    async fn resolve(&self, headers: &HeaderMap) -> Result<Bytes, DispatchError> {
        let Some(overrides) = &self.overrides else {
            return Ok(self.content.clone());
        };

        let requested = headers
            .get(overrides.header())
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
            .map(str::to_owned);

        match requested {
            Some(requested) => overrides.load(&requested).await,
            None => Ok(self.content.clone()),
        }
    }
}

/// How a mock response produces its body
pub enum BodyKind {
    Fixed(FixedBody),
    Echo,
    Runnable(Arc<dyn RunnableHook>),
}

impl BodyKind {
    pub fn fixed(content: impl Into<Bytes>) -> Self {
        BodyKind::Fixed(FixedBody::new(content))
    }

    /// Fixed body from inline content or a file read once at startup
    pub fn from_fixed_config(config: &ResponseConfig) -> Result<Self, ConfigError> {
        let content = match &config.body_file {
            Some(path) => Bytes::from(std::fs::read(path).map_err(|source| ConfigError::Io {
                path: path.clone(),
                source,
            })?),
            None => Bytes::from(config.body.clone().unwrap_or_default()),
        };

        let mut fixed = FixedBody::new(content);
        if let Some(header) = config.magic_header_name.as_deref().filter(|h| !h.is_empty()) {
            let header = HeaderName::from_bytes(header.as_bytes())
                .map_err(|_| ConfigError::invalid(format!("invalid header name {header:?}")))?;
            let source_dir = config.magic_header_folder.clone().unwrap_or_default();
            fixed = fixed.with_overrides(OverrideFiles::new(header, source_dir));
        }

        Ok(BodyKind::Fixed(fixed))
    }

    /// Produce the response with the configured headers and status
    pub async fn render(
        &self,
        status: StatusCode,
        headers: &[(HeaderName, HeaderValue)],
        request: Request<Body>,
    ) -> Result<Response<Body>, DispatchError> {
        match self {
            BodyKind::Fixed(fixed) => {
                let body = fixed.resolve(request.headers()).await?;
                Ok(build_response(status, headers, body))
            }
            BodyKind::Echo => {
                let body = axum::body::to_bytes(request.into_body(), usize::MAX)
                    .await
                    .map_err(|e| DispatchError::BodyRead(e.to_string()))?;
                Ok(build_response(status, headers, body))
            }
            BodyKind::Runnable(hook) => run_hook(hook.clone(), status, headers, request).await,
        }
    }
}

fn build_response(
    status: StatusCode,
    headers: &[(HeaderName, HeaderValue)],
    body: Bytes,
) -> Response<Body> {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    for (name, value) in headers {
        response.headers_mut().append(name.clone(), value.clone());
    }
    response
}

/// Hooks may block, so they run on the blocking pool
async fn run_hook(
    hook: Arc<dyn RunnableHook>,
    status: StatusCode,
    headers: &[(HeaderName, HeaderValue)],
    request: Request<Body>,
) -> Result<Response<Body>, DispatchError> {
    let (parts, body) = request.into_parts();
    let body = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|e| DispatchError::BodyRead(e.to_string()))?;
    let hook_request = HookRequest {
        method: parts.method,
        uri: parts.uri,
        headers: parts.headers,
        body,
    };

    let mut sink = ResponseSink::new();
    for (name, value) in headers {
        sink.headers_mut().append(name.clone(), value.clone());
    }

    let sink = tokio::task::spawn_blocking(move || {
        hook.run(&mut sink, &hook_request, status).map(|()| sink)
    })
    .await
    .map_err(|e| DispatchError::Runnable(e.to_string()))?
    .map_err(|e| DispatchError::Runnable(e.to_string()))?;

    Ok(sink.into_response(status))
}
