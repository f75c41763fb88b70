//! API-key authentication and namespace enforcement.
//!
//! The loopback listener runs without this layer and is fully trusted. The
//! remote listener resolves the `x-api-key` header to an [`Identity`] whose
//! allowed-namespace set gates every call: the layer inspects the JSON-RPC
//! envelope, extracts the target namespace from the request params and
//! rejects out-of-scope calls with `PermissionDenied` before they ever reach
//! a handler. `whoAmI` is answered by the layer itself, since only the layer
//! knows who is calling.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use devnet_rpc_api::{ApiError, ErrorCode};
use hyper::header::CONTENT_TYPE;
use hyper::{Body, Request, Response};
use serde::Deserialize;
use tower::{Layer, Service};
use tracing::debug;

pub const API_KEY_HEADER: &str = "x-api-key";

/// Namespace wildcard granting access to every namespace.
pub const ALL_NAMESPACES: &str = "*";

/// Who a caller is and what namespaces they may touch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
    pub namespaces: HashSet<String>,
}

impl Identity {
    pub fn new(name: impl Into<String>, namespaces: impl IntoIterator<Item = String>) -> Self {
        Self { name: name.into(), namespaces: namespaces.into_iter().collect() }
    }

    /// The implicit identity of the loopback listener.
    pub fn trusted() -> Self {
        Self::new("local", [ALL_NAMESPACES.to_string()])
    }

    pub fn is_wildcard(&self) -> bool {
        self.namespaces.contains(ALL_NAMESPACES)
    }

    pub fn allows(&self, namespace: &str) -> bool {
        self.is_wildcard() || self.namespaces.contains(namespace)
    }

    pub fn namespace_list(&self) -> Vec<String> {
        let mut list: Vec<_> = self.namespaces.iter().cloned().collect();
        list.sort();
        list
    }
}

/// API key → identity map, loaded from the daemon's key file.
#[derive(Debug, Clone, Default)]
pub struct ApiKeySet {
    keys: Arc<HashMap<String, Identity>>,
}

impl ApiKeySet {
    pub fn new(keys: HashMap<String, Identity>) -> Self {
        Self { keys: Arc::new(keys) }
    }

    pub fn resolve(&self, key: &str) -> Option<&Identity> {
        self.keys.get(key)
    }
}

/// The layer's verdict for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny { message: String },
    /// Answered by the layer itself (`whoAmI`).
    SelfAnswer,
}

/// Extracts the namespace a JSON-RPC call targets, if the method is
/// namespace-scoped. Handles both positional (`[{..}]`) and named parameter
/// encodings.
pub fn namespace_of(params: &serde_json::Value) -> Option<String> {
    let obj = match params {
        serde_json::Value::Array(items) => items.first()?.as_object()?,
        serde_json::Value::Object(obj) => obj,
        _ => return None,
    };
    obj.get("namespace").and_then(|v| v.as_str()).map(str::to_string)
}

/// Decides whether `identity` may issue this call.
///
/// Calls without a namespace in their params (ping, listNetworks, …) are
/// open to any authenticated identity. A namespace-bearing call must target
/// an allowed namespace; an *empty* namespace means "all namespaces"
/// (`listDevnets`) and needs the wildcard.
pub fn decide(identity: &Identity, method: &str, params: &serde_json::Value) -> Decision {
    if method.ends_with("whoAmI") {
        return Decision::SelfAnswer;
    }

    match namespace_of(params) {
        None => Decision::Allow,
        Some(namespace) if namespace.is_empty() => {
            if identity.is_wildcard() {
                Decision::Allow
            } else {
                Decision::Deny {
                    message: format!(
                        "identity {:?} must name an explicit namespace",
                        identity.name
                    ),
                }
            }
        }
        Some(namespace) => {
            if identity.allows(&namespace) {
                Decision::Allow
            } else {
                Decision::Deny {
                    message: format!(
                        "identity {:?} is not allowed to access namespace {namespace:?}",
                        identity.name
                    ),
                }
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct RpcEnvelope {
    #[serde(default)]
    id: serde_json::Value,
    #[serde(default)]
    method: String,
    #[serde(default)]
    params: serde_json::Value,
}

fn rpc_error_response(id: &serde_json::Value, error: ApiError) -> Response<Body> {
    let body = serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": error.code as i32, "message": error.message },
    });
    Response::builder()
        .status(hyper::StatusCode::OK)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("static response is valid")
}

fn rpc_result_response(id: &serde_json::Value, result: serde_json::Value) -> Response<Body> {
    let body = serde_json::json!({ "jsonrpc": "2.0", "id": id, "result": result });
    Response::builder()
        .status(hyper::StatusCode::OK)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("static response is valid")
}

/// Tower layer installing [`ApiKeyAuth`].
#[derive(Debug, Clone)]
pub struct ApiKeyLayer {
    keys: ApiKeySet,
}

impl ApiKeyLayer {
    pub fn new(keys: ApiKeySet) -> Self {
        Self { keys }
    }
}

impl<S> Layer<S> for ApiKeyLayer {
    type Service = ApiKeyAuth<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ApiKeyAuth { inner, keys: self.keys.clone() }
    }
}

#[derive(Debug, Clone)]
pub struct ApiKeyAuth<S> {
    inner: S,
    keys: ApiKeySet,
}

impl<S> Service<Request<Body>> for ApiKeyAuth<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let keys = self.keys.clone();
        // Take the ready service, leave a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let null = serde_json::Value::Null;

            let identity = match req
                .headers()
                .get(API_KEY_HEADER)
                .and_then(|v| v.to_str().ok())
                .and_then(|key| keys.resolve(key))
            {
                Some(identity) => identity.clone(),
                None => {
                    debug!(target: "rpc", "Rejected request without a valid API key.");
                    return Ok(rpc_error_response(
                        &null,
                        ApiError::new(ErrorCode::PermissionDenied, "missing or unknown API key"),
                    ));
                }
            };

            // Non-POST traffic (websocket upgrades, health GETs) carries no
            // JSON-RPC envelope to inspect; the key check above is all that
            // applies here.
            if req.method() != hyper::Method::POST {
                return inner.call(req).await;
            }

            let (parts, body) = req.into_parts();
            let bytes = match hyper::body::to_bytes(body).await {
                Ok(bytes) => bytes,
                Err(_) => {
                    return Ok(rpc_error_response(
                        &null,
                        ApiError::new(ErrorCode::InvalidArgument, "unreadable request body"),
                    ));
                }
            };

            let value: serde_json::Value = match serde_json::from_slice(&bytes) {
                Ok(value) => value,
                // Malformed bodies fall through to the server, which produces
                // the proper JSON-RPC parse error itself.
                Err(_) => {
                    let req = Request::from_parts(parts, Body::from(bytes));
                    return inner.call(req).await;
                }
            };

            // A batch is admitted only if every inner call is.
            if let serde_json::Value::Array(calls) = &value {
                for call in calls {
                    let envelope: RpcEnvelope =
                        serde_json::from_value(call.clone()).unwrap_or_else(|_| RpcEnvelope {
                            id: serde_json::Value::Null,
                            method: String::new(),
                            params: serde_json::Value::Null,
                        });
                    if let Decision::Deny { message } =
                        decide(&identity, &envelope.method, &envelope.params)
                    {
                        return Ok(rpc_error_response(
                            &envelope.id,
                            ApiError::new(ErrorCode::PermissionDenied, message),
                        ));
                    }
                }
                let req = Request::from_parts(parts, Body::from(bytes));
                return inner.call(req).await;
            }

            let envelope: RpcEnvelope = match serde_json::from_value(value) {
                Ok(envelope) => envelope,
                Err(_) => {
                    let req = Request::from_parts(parts, Body::from(bytes));
                    return inner.call(req).await;
                }
            };

            match decide(&identity, &envelope.method, &envelope.params) {
                Decision::Allow => {
                    let req = Request::from_parts(parts, Body::from(bytes));
                    inner.call(req).await
                }
                Decision::SelfAnswer => {
                    let result = serde_json::json!({
                        "identity": identity.name,
                        "namespaces": identity.namespace_list(),
                    });
                    Ok(rpc_result_response(&envelope.id, result))
                }
                Decision::Deny { message } => {
                    debug!(target: "rpc", identity = %identity.name, method = %envelope.method, "Denied.");
                    Ok(rpc_error_response(
                        &envelope.id,
                        ApiError::new(ErrorCode::PermissionDenied, message),
                    ))
                }
            }
        })
    }
}
