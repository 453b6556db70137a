//! The `http` module.
//!
//! Requests run on a tokio task and their outcome comes back to the script as
//! a separate callback through the host queue. Only plain `http://` URLs are
//! accepted; this host carries no TLS connector.

use std::{collections::BTreeMap, time::Duration};

use bytes::Bytes;
use http::{header::HeaderName, HeaderValue, Method, Request, Uri};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use scriptbot_plugin_sdk::{OperationError, OperationErrorKind};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tower::{timeout::Timeout, ServiceExt};

use crate::{dispatch::Outbox, plugin::ScriptContext};

pub(crate) type HttpClient = Client<HttpConnector, Full<Bytes>>;

pub(crate) fn build_client() -> HttpClient {
    let connector = HttpConnector::new();
    Client::builder(TokioExecutor::new()).build(connector)
}

/// Options of a `simple_request` call. Unset limits fall back to the host's
/// `[http]` settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SimpleRequest {
    pub method: Option<String>,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
    /// Milliseconds until the whole response must have arrived.
    pub timeout: Option<u64>,
    /// Largest accepted response body in bytes.
    pub max_size: Option<usize>,
}

impl SimpleRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn post(url: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            method: Some("POST".into()),
            url: url.into(),
            body: Some(body.into()),
            ..Self::default()
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout.as_millis().try_into().unwrap_or(u64::MAX));
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub status_text: String,
    /// Lower-cased header names; repeated headers are joined with `, `.
    pub headers: BTreeMap<String, String>,
    pub data: Bytes,
}

impl HttpResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, OperationError> {
        serde_json::from_slice(&self.data)
            .map_err(|err| OperationError::new(OperationErrorKind::Encoding, err.to_string()))
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct HttpLimits {
    pub(crate) timeout: Duration,
    pub(crate) max_body_bytes: usize,
}

pub struct HttpNamespace {
    client: HttpClient,
    outbox: Outbox,
    limits: HttpLimits,
}

impl HttpNamespace {
    pub(crate) fn new(client: HttpClient, outbox: Outbox, limits: HttpLimits) -> Self {
        Self {
            client,
            outbox,
            limits,
        }
    }

    /// Starts `request` and returns immediately. `callback` runs later on the
    /// host loop with exactly one of the response or the error. A script
    /// reloaded in the meantime never sees the callback.
    pub fn simple_request<F>(&self, request: SimpleRequest, callback: F)
    where
        F: FnOnce(&mut ScriptContext, Result<HttpResponse, OperationError>) + Send + 'static,
    {
        let ticket = self.outbox.ticket();
        let script = self.outbox.script();
        let limits = HttpLimits {
            timeout: request
                .timeout
                .map_or(self.limits.timeout, Duration::from_millis),
            max_body_bytes: request.max_size.unwrap_or(self.limits.max_body_bytes),
        };
        let prepared = match prepare(&request) {
            Ok(prepared) => prepared,
            Err(err) => {
                ticket.complete(move |cx| callback(cx, Err(err)));
                return;
            }
        };
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                let err = OperationError::new(
                    OperationErrorKind::Connection,
                    "no async runtime available for outgoing requests",
                );
                ticket.complete(move |cx| callback(cx, Err(err)));
                return;
            }
        };

        let client = self.client.clone();
        tracing::debug!(script = %script, method = %prepared.method(), uri = %prepared.uri(), "http request started");
        runtime.spawn(async move {
            let result = execute(client, prepared, limits).await;
            if let Err(err) = &result {
                tracing::debug!(script = %script, error = %err, "http request failed");
            }
            ticket.complete(move |cx| callback(cx, result));
        });
    }
}

fn prepare(request: &SimpleRequest) -> Result<Request<Full<Bytes>>, OperationError> {
    let method = request.method.as_deref().unwrap_or("GET").to_ascii_uppercase();
    let method = Method::from_bytes(method.as_bytes())
        .map_err(|_| invalid(format!("invalid method `{method}`")))?;
    let uri: Uri = request
        .url
        .trim()
        .parse()
        .map_err(|err| invalid(format!("invalid url `{}`: {err}", request.url)))?;
    match uri.scheme_str() {
        Some("http") => {}
        Some(other) => return Err(invalid(format!("unsupported scheme `{other}`"))),
        None => return Err(invalid(format!("url `{}` is not absolute", request.url))),
    }

    let mut builder = Request::builder().method(method).uri(uri);
    for (name, value) in &request.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| invalid(format!("invalid header name `{name}`")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| invalid(format!("invalid value for header `{name}`")))?;
        builder = builder.header(name, value);
    }
    let body = request.body.clone().map(Bytes::from).unwrap_or_default();
    builder
        .body(Full::new(body))
        .map_err(|err| invalid(err.to_string()))
}

async fn execute(
    client: HttpClient,
    request: Request<Full<Bytes>>,
    limits: HttpLimits,
) -> Result<HttpResponse, OperationError> {
    let deadline = tokio::time::Instant::now() + limits.timeout;
    let response = Timeout::new(client, limits.timeout)
        .oneshot(request)
        .await
        .map_err(|err| {
            if err.is::<tower::timeout::error::Elapsed>() {
                timed_out(limits.timeout)
            } else {
                OperationError::new(OperationErrorKind::Connection, error_chain(&*err))
            }
        })?;

    let (parts, body) = response.into_parts();
    let collected = tokio::time::timeout_at(deadline, Limited::new(body, limits.max_body_bytes).collect())
        .await
        .map_err(|_| timed_out(limits.timeout))?
        .map_err(|err| {
            if err.is::<LengthLimitError>() {
                OperationError::new(
                    OperationErrorKind::InvalidRequest,
                    format!("response body exceeds {} bytes", limits.max_body_bytes),
                )
            } else {
                OperationError::new(OperationErrorKind::Connection, error_chain(&*err))
            }
        })?;

    let mut headers = BTreeMap::new();
    for (name, value) in &parts.headers {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        headers
            .entry(name.as_str().to_string())
            .and_modify(|joined: &mut String| {
                joined.push_str(", ");
                joined.push_str(&value);
            })
            .or_insert(value);
    }
    Ok(HttpResponse {
        status: parts.status.as_u16(),
        status_text: parts.status.canonical_reason().unwrap_or_default().to_string(),
        headers,
        data: collected.to_bytes(),
    })
}

fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

fn timed_out(timeout: Duration) -> OperationError {
    OperationError::new(
        OperationErrorKind::Timeout,
        format!("no complete response within {} ms", timeout.as_millis()),
    )
}

fn invalid(message: impl Into<String>) -> OperationError {
    OperationError::new(OperationErrorKind::InvalidRequest, message)
}
