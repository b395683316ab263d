//! The unit of work flowing through the interceptor chain.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};

use axum::http::{HeaderMap, Method};
use portico_core::{CallContext, ConfigError, Message, RpcError};
use serde::Serialize;
use uuid::Uuid;

/// Boxed future returned by every service in the chain.
pub type CallFuture = Pin<Box<dyn Future<Output = Result<Reply, CallError>> + Send>>;

/// Who issued the call.
///
/// Server interceptors only make sense on inbound calls; seeing a client
/// role means they were wired into an outbound client by mistake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

// ---------------------------------------------------------------------------
// Call
// ---------------------------------------------------------------------------

/// One inbound unary call.
///
/// Created by the transport per request and dropped once the response is
/// written. `ctx` is replaced by the deadline layer with a bounded child.
#[derive(Debug)]
pub struct Call {
    pub id: Uuid,
    /// Full procedure path, e.g. `/acme.greet.v1.GreetService/Greet`.
    pub procedure: String,
    pub role: Role,
    pub http_method: Method,
    pub headers: HeaderMap,
    pub peer: Option<String>,
    pub message: Arc<dyn Message>,
    pub ctx: CallContext,
    diagnostics: Diagnostics,
}

impl Call {
    /// A server-role `POST` call with a background context.
    pub fn new(procedure: impl Into<String>, message: Arc<dyn Message>) -> Self {
        Self {
            id: Uuid::new_v4(),
            procedure: procedure.into(),
            role: Role::Server,
            http_method: Method::POST,
            headers: HeaderMap::new(),
            peer: None,
            message,
            ctx: CallContext::background(),
            diagnostics: Diagnostics::default(),
        }
    }

    #[must_use]
    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    #[must_use]
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    #[must_use]
    pub fn with_peer(mut self, peer: Option<String>) -> Self {
        self.peer = peer;
        self
    }

    #[must_use]
    pub fn with_context(mut self, ctx: CallContext) -> Self {
        self.ctx = ctx;
        self
    }

    /// Slot holding the sanitized request once the redactor ran.
    #[must_use]
    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// Value of the `host` header, if any.
    #[must_use]
    pub fn host(&self) -> Option<&str> {
        self.headers
            .get(axum::http::header::HOST)
            .and_then(|value| value.to_str().ok())
    }
}

/// Redacted request copy shared between the redactor and the classifier.
///
/// Write-once: the first value stored wins.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics(Arc<OnceLock<serde_json::Value>>);

impl Diagnostics {
    pub fn set(&self, sanitized: serde_json::Value) {
        let _ = self.0.set(sanitized);
    }

    #[must_use]
    pub fn get(&self) -> Option<&serde_json::Value> {
        self.0.get()
    }
}

// ---------------------------------------------------------------------------
// Reply / CallError
// ---------------------------------------------------------------------------

/// Successful call outcome, already in its JSON wire shape.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub message: serde_json::Value,
}

impl Reply {
    /// Encodes a response message.
    ///
    /// # Errors
    ///
    /// Returns an unclassified error if the message cannot be represented
    /// as JSON.
    pub fn encode<T: Serialize>(message: &T) -> Result<Self, RpcError> {
        let message = serde_json::to_value(message)
            .map_err(|e| RpcError::from(anyhow::Error::new(e).context("encoding response")))?;
        Ok(Self { message })
    }
}

/// Error type of every service in the chain.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    /// A status the transport writes back to the caller.
    #[error(transparent)]
    Status(#[from] RpcError),
    /// A misconfiguration; the process stops and no response is written.
    #[error(transparent)]
    Fatal(#[from] ConfigError),
}
