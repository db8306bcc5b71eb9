//! User supplied callbacks
//!
//! Runnable hooks write a whole mock response, transform hooks mutate a
//! request before it is forwarded upstream. Both are resolved once at startup
//! from a `(library, symbol)` pair, either from closures registered in-process
//! or from an executable that is invoked per call.

use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, Response, StatusCode, Uri};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;
use thiserror::Error;

/// Errors produced by hooks or while resolving them
#[derive(Debug, Error)]
pub enum HookError {
    #[error("symbol {symbol} not found in {library}")]
    NotFound { library: String, symbol: String },

    #[error("{0}")]
    Failed(String),

    #[error("failed to run {}: {source}", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{} exited with {status}: {stderr}", program.display())]
    Exit {
        program: PathBuf,
        status: std::process::ExitStatus,
        stderr: String,
    },

    #[error("invalid hook output: {0}")]
    Output(#[from] serde_json::Error),

    #[error("invalid {0} in hook output")]
    Field(&'static str),
}

impl HookError {
    /// Convenience constructor for hook implementations
    pub fn failed(message: impl Into<String>) -> Self {
        HookError::Failed(message.into())
    }
}

/// Request as seen by hooks
#[derive(Debug, Clone)]
pub struct HookRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HookRequest {
    pub fn path(&self) -> &str {
        self.uri.path()
    }

    pub fn query(&self) -> Option<&str> {
        self.uri.query()
    }

    /// Replace the path, keeping the query string
    pub fn set_path(&mut self, path: &str) -> Result<(), HookError> {
        let path_and_query = match self.uri.query() {
            Some(query) => format!("{path}?{query}"),
            None => path.to_string(),
        };
        let mut parts = self.uri.clone().into_parts();
        parts.path_and_query = Some(
            path_and_query
                .parse()
                .map_err(|_| HookError::Field("path"))?,
        );
        self.uri = Uri::from_parts(parts).map_err(|_| HookError::Field("path"))?;
        Ok(())
    }

    /// JSON document handed to command hooks.
    ///
    /// `body` is the body as (lossy) UTF-8 text and `body_base64` carries the
    /// exact bytes. Header values that are not valid UTF-8 are left out.
    fn to_json(&self) -> serde_json::Value {
        let headers: BTreeMap<&str, &str> = self
            .headers
            .iter()
            .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str(), v)))
            .collect();

        serde_json::json!({
            "method": self.method.as_str(),
            "path": self.path(),
            "query": self.query(),
            "headers": headers,
            "body": String::from_utf8_lossy(&self.body),
            "body_base64": STANDARD.encode(&self.body),
        })
    }
}

/// Response under construction by a runnable hook.
///
/// Headers may be added before the status and body are written. When no
/// status is written the status resolved for the request method is used.
#[derive(Debug, Default)]
pub struct ResponseSink {
    headers: HeaderMap,
    status: Option<StatusCode>,
    body: Vec<u8>,
}

impl ResponseSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn write_status(&mut self, status: StatusCode) {
        self.status = Some(status);
    }

    pub fn write(&mut self, chunk: &[u8]) {
        self.body.extend_from_slice(chunk);
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn into_response(self, default_status: StatusCode) -> Response<Body> {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status.unwrap_or(default_status);
        *response.headers_mut() = self.headers;
        response
    }
}

/// Produces a complete mock response
pub trait RunnableHook: Send + Sync {
    fn run(
        &self,
        sink: &mut ResponseSink,
        request: &HookRequest,
        status: StatusCode,
    ) -> Result<(), HookError>;
}

impl<F> RunnableHook for F
where
    F: Fn(&mut ResponseSink, &HookRequest, StatusCode) -> Result<(), HookError> + Send + Sync,
{
    fn run(
        &self,
        sink: &mut ResponseSink,
        request: &HookRequest,
        status: StatusCode,
    ) -> Result<(), HookError> {
        self(sink, request, status)
    }
}

/// Mutates an outbound request before it is forwarded
pub trait TransformHook: Send + Sync {
    fn transform(&self, request: &mut HookRequest) -> Result<(), HookError>;
}

impl<F> TransformHook for F
where
    F: Fn(&mut HookRequest) -> Result<(), HookError> + Send + Sync,
{
    fn transform(&self, request: &mut HookRequest) -> Result<(), HookError> {
        self(request)
    }
}

type HookKey = (String, String);

/// Resolves `(library, symbol)` pairs to hooks.
///
/// In-process registrations take precedence. Otherwise `library` must name an
/// executable, which is run as `<library> <symbol>` for every call.
#[derive(Clone, Default)]
pub struct HookRegistry {
    runnables: HashMap<HookKey, Arc<dyn RunnableHook>>,
    transforms: HashMap<HookKey, Arc<dyn TransformHook>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_runnable(
        &mut self,
        library: impl Into<String>,
        symbol: impl Into<String>,
        hook: impl RunnableHook + 'static,
    ) -> &mut Self {
        self.runnables
            .insert((library.into(), symbol.into()), Arc::new(hook));
        self
    }

    pub fn register_transform(
        &mut self,
        library: impl Into<String>,
        symbol: impl Into<String>,
        hook: impl TransformHook + 'static,
    ) -> &mut Self {
        self.transforms
            .insert((library.into(), symbol.into()), Arc::new(hook));
        self
    }

    pub fn resolve_runnable(
        &self,
        library: &str,
        symbol: &str,
    ) -> Result<Arc<dyn RunnableHook>, HookError> {
        if let Some(hook) = self
            .runnables
            .get(&(library.to_string(), symbol.to_string()))
        {
            return Ok(hook.clone());
        }
        Ok(Arc::new(CommandHook::locate(library, symbol)?))
    }

    pub fn resolve_transform(
        &self,
        library: &str,
        symbol: &str,
    ) -> Result<Arc<dyn TransformHook>, HookError> {
        if let Some(hook) = self
            .transforms
            .get(&(library.to_string(), symbol.to_string()))
        {
            return Ok(hook.clone());
        }
        Ok(Arc::new(CommandHook::locate(library, symbol)?))
    }
}

/// Hook backed by an external executable.
///
/// The request is written to stdin as a JSON document and the hook's answer
/// is read from stdout as JSON.
#[derive(Debug, Clone)]
pub struct CommandHook {
    program: PathBuf,
    symbol: String,
}

#[derive(Debug, Default, Deserialize)]
struct RunnableOutput {
    #[serde(default)]
    status: Option<u16>,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    body_base64: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TransformOutput {
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    body_base64: Option<String>,
}

impl CommandHook {
    /// Resolve a hook executable, failing if it does not exist
    pub fn locate(library: &str, symbol: &str) -> Result<Self, HookError> {
        let program = PathBuf::from(library);
        if library.is_empty() || symbol.is_empty() || !program.is_file() {
            return Err(HookError::NotFound {
                library: library.to_string(),
                symbol: symbol.to_string(),
            });
        }
        Ok(Self {
            program,
            symbol: symbol.to_string(),
        })
    }

    fn invoke(&self, input: &serde_json::Value) -> Result<Vec<u8>, HookError> {
        let spawn_err = |source| HookError::Spawn {
            program: self.program.clone(),
            source,
        };

        let mut child = Command::new(&self.program)
            .arg(&self.symbol)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(spawn_err)?;

        // Hooks may answer without draining stdin
        let stdin = child.stdin.take();
        let payload = input.to_string().into_bytes();
        let writer = std::thread::spawn(move || match stdin {
            Some(mut stdin) => match stdin.write_all(&payload) {
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
                result => result,
            },
            None => Ok(()),
        });

        let output = child.wait_with_output().map_err(spawn_err)?;
        writer
            .join()
            .map_err(|_| HookError::failed("hook input writer panicked"))?
            .map_err(spawn_err)?;
        if !output.status.success() {
            return Err(HookError::Exit {
                program: self.program.clone(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output.stdout)
    }
}

/// Body returned by a hook, preferring the base64 form when both are given
fn output_body(text: Option<String>, encoded: Option<String>) -> Result<Option<Bytes>, HookError> {
    match (encoded, text) {
        (Some(encoded), _) => STANDARD
            .decode(encoded.as_bytes())
            .map(|bytes| Some(Bytes::from(bytes)))
            .map_err(|_| HookError::Field("body_base64")),
        (None, Some(text)) => Ok(Some(Bytes::from(text))),
        (None, None) => Ok(None),
    }
}

fn insert_headers(
    target: &mut HeaderMap,
    headers: BTreeMap<String, String>,
) -> Result<(), HookError> {
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| HookError::Field("header name"))?;
        let value = HeaderValue::from_str(&value).map_err(|_| HookError::Field("header value"))?;
        target.insert(name, value);
    }
    Ok(())
}

impl RunnableHook for CommandHook {
    fn run(
        &self,
        sink: &mut ResponseSink,
        request: &HookRequest,
        status: StatusCode,
    ) -> Result<(), HookError> {
        let mut input = request.to_json();
        input["status"] = serde_json::json!(status.as_u16());

        let output: RunnableOutput = serde_json::from_slice(&self.invoke(&input)?)?;

        insert_headers(sink.headers_mut(), output.headers)?;
        if let Some(code) = output.status {
            sink.write_status(StatusCode::from_u16(code).map_err(|_| HookError::Field("status"))?);
        }
        if let Some(body) = output_body(output.body, output.body_base64)? {
            sink.write(&body);
        }
        Ok(())
    }
}

impl TransformHook for CommandHook {
    fn transform(&self, request: &mut HookRequest) -> Result<(), HookError> {
        let output: TransformOutput = serde_json::from_slice(&self.invoke(&request.to_json())?)?;

        if let Some(method) = output.method {
            request.method =
                Method::from_bytes(method.as_bytes()).map_err(|_| HookError::Field("method"))?;
        }
        if let Some(path) = output.path {
            request.set_path(&path)?;
        }
        insert_headers(&mut request.headers, output.headers)?;
        if let Some(body) = output_body(output.body, output.body_base64)? {
            request.body = body;
        }
        Ok(())
    }
}
