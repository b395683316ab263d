//! Typed unary procedures grouped into services.
//!
//! A handler is an async function of the call context and the decoded
//! request. [`RpcService::unary`] erases its types into a boxed
//! `tower::Service<Call>` so the hub can wrap every procedure with the same
//! interceptor chain.

use std::fmt::Debug;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::task::{Context, Poll};

use portico_core::{CallContext, Message, RpcError, Schema};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tower::util::BoxCloneSyncService;
use tower::Service;

use super::call::{Call, CallError, CallFuture, Reply};

/// A type-erased procedure handler.
pub type BoxCallService = BoxCloneSyncService<Call, Reply, CallError>;

/// Decodes a JSON request body into the procedure's message type.
pub type DecodeFn = fn(&[u8]) -> Result<Arc<dyn Message>, RpcError>;

// ---------------------------------------------------------------------------
// RpcService
// ---------------------------------------------------------------------------

/// A named group of unary procedures, e.g. `acme.greet.v1.GreetService`.
pub struct RpcService {
    name: String,
    procedures: Vec<Procedure>,
}

/// One registered method of a service.
#[derive(Clone)]
pub struct Procedure {
    /// Full path, `/<service>/<method>`.
    pub path: String,
    pub decode: DecodeFn,
    pub handler: BoxCallService,
}

impl RpcService {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            procedures: Vec::new(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registers a unary method.
    #[must_use]
    pub fn unary<Req, Res, F, Fut>(mut self, method: &str, handler: F) -> Self
    where
        Req: Schema + DeserializeOwned + Serialize + Debug + Send + Sync + 'static,
        Res: Serialize + Send + 'static,
        F: Fn(CallContext, Arc<Req>) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<Res, RpcError>> + Send + 'static,
    {
        self.procedures.push(Procedure {
            path: format!("/{}/{method}", self.name),
            decode: decode_json::<Req>,
            handler: BoxCloneSyncService::new(UnaryHandler::new(handler)),
        });
        self
    }

    /// Path prefix every procedure of this service lives under.
    #[must_use]
    pub fn path_prefix(&self) -> String {
        format!("/{}/", self.name)
    }

    #[must_use]
    pub fn procedures(&self) -> &[Procedure] {
        &self.procedures
    }

    pub(crate) fn into_procedures(self) -> Vec<Procedure> {
        self.procedures
    }
}

impl Debug for RpcService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcService")
            .field("name", &self.name)
            .field(
                "procedures",
                &self.procedures.iter().map(|p| p.path.as_str()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

fn decode_json<T>(body: &[u8]) -> Result<Arc<dyn Message>, RpcError>
where
    T: Schema + DeserializeOwned + Serialize + Debug + Send + Sync + 'static,
{
    let message: T = serde_json::from_slice(body).map_err(|e| {
        RpcError::invalid_argument(format!("unmarshal into {}: {e}", T::descriptor().name))
    })?;
    Ok(Arc::new(message))
}

// ---------------------------------------------------------------------------
// UnaryHandler
// ---------------------------------------------------------------------------

/// Adapts a typed handler function to `Service<Call>`.
pub struct UnaryHandler<Req, Res, F> {
    handler: F,
    _types: PhantomData<fn(Req) -> Res>,
}

impl<Req, Res, F: Clone> Clone for UnaryHandler<Req, Res, F> {
    fn clone(&self) -> Self {
        Self {
            handler: self.handler.clone(),
            _types: PhantomData,
        }
    }
}

impl<Req, Res, F> UnaryHandler<Req, Res, F> {
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _types: PhantomData,
        }
    }
}

impl<Req, Res, F, Fut> Service<Call> for UnaryHandler<Req, Res, F>
where
    Req: Send + Sync + 'static,
    Res: Serialize + Send + 'static,
    F: Fn(CallContext, Arc<Req>) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = Result<Res, RpcError>> + Send + 'static,
{
    type Response = Reply;
    type Error = CallError;
    type Future = CallFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, call: Call) -> Self::Future {
        let Ok(request) = Arc::clone(&call.message).into_any().downcast::<Req>() else {
            let err = RpcError::from(anyhow::anyhow!(
                "request for {} has an unexpected message type",
                call.procedure
            ));
            return Box::pin(async move { Err(CallError::Status(err)) });
        };
        let fut = (self.handler)(call.ctx, request);
        Box::pin(async move {
            let response = fut.await?;
            Reply::encode(&response).map_err(CallError::from)
        })
    }
}
