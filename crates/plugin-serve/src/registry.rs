//! Capability registry - binds capability names to their method tables.
//!
//! Capabilities are registered once at startup. The registry is then frozen
//! behind an `Arc` and only read, so concurrent calls resolve without locking.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Serialize, de::DeserializeOwned};

use crate::bridge::protocol::ErrorKind;
use crate::call::{CallContext, CallError};

/// Result of a type-erased method invocation.
pub type CallResult = Result<serde_json::Value, CallError>;

type MethodFn =
    dyn Fn(serde_json::Value, CallContext) -> BoxFuture<'static, CallResult> + Send + Sync;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("capability already registered: {0}")]
    DuplicateCapability(String),

    #[error("unknown capability: {0}")]
    UnknownCapability(String),

    #[error("unknown method {method} on capability {capability}")]
    UnknownMethod { capability: String, method: String },
}

impl From<RegistryError> for CallError {
    fn from(err: RegistryError) -> Self {
        let kind = match err {
            RegistryError::UnknownCapability(_) => ErrorKind::UnknownCapability,
            RegistryError::UnknownMethod { .. } => ErrorKind::UnknownMethod,
            RegistryError::DuplicateCapability(_) => ErrorKind::Internal,
        };
        CallError::new(kind, err.to_string())
    }
}

/// A named set of remote-callable methods backed by one implementation object.
pub struct Capability {
    name: String,
    methods: HashMap<String, Arc<MethodFn>>,
}

impl Capability {
    /// Start building a capability whose methods are served by `target`.
    pub fn builder<T>(name: impl Into<String>, target: Arc<T>) -> CapabilityBuilder<T>
    where
        T: Send + Sync + 'static,
    {
        CapabilityBuilder {
            name: name.into(),
            target,
            methods: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Method names, sorted.
    pub fn method_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capability")
            .field("name", &self.name)
            .field("methods", &self.method_names())
            .finish()
    }
}

pub struct CapabilityBuilder<T> {
    name: String,
    target: Arc<T>,
    methods: HashMap<String, Arc<MethodFn>>,
}

impl<T: Send + Sync + 'static> CapabilityBuilder<T> {
    /// Add a method with a typed request and response.
    ///
    /// The payload is decoded into `Req` before `handler` runs; a payload that
    /// does not decode yields an `invalid_request` error without invoking it.
    pub fn method<Req, Resp, F, Fut>(mut self, name: &str, handler: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Arc<T>, Req, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, CallError>> + Send + 'static,
    {
        let target = Arc::clone(&self.target);
        let handler = Arc::new(handler);
        let method_name = name.to_string();

        let erased: Arc<MethodFn> = Arc::new(
            move |payload: serde_json::Value, ctx: CallContext| -> BoxFuture<'static, CallResult> {
                let target = Arc::clone(&target);
                let handler = Arc::clone(&handler);
                let method_name = method_name.clone();
                Box::pin(async move {
                    let request: Req = serde_json::from_value(payload).map_err(|e| {
                        CallError::invalid_request(format!("invalid {method_name} request: {e}"))
                    })?;
                    let response = handler(target, request, ctx).await?;
                    serde_json::to_value(response).map_err(|e| {
                        CallError::internal(format!("failed to encode {method_name} response: {e}"))
                    })
                })
            },
        );

        if self.methods.insert(name.to_string(), erased).is_some() {
            tracing::warn!(
                capability = %self.name,
                method = name,
                "Method registered twice, keeping the last"
            );
        }
        self
    }

    pub fn build(self) -> Capability {
        Capability {
            name: self.name,
            methods: self.methods,
        }
    }
}

/// A resolved method, ready to invoke.
#[derive(Clone)]
pub struct BoundMethod {
    capability: Arc<str>,
    method: Arc<str>,
    f: Arc<MethodFn>,
}

impl BoundMethod {
    pub fn capability(&self) -> &str {
        &self.capability
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn invoke(
        &self,
        payload: serde_json::Value,
        ctx: CallContext,
    ) -> BoxFuture<'static, CallResult> {
        (self.f)(payload, ctx)
    }
}

impl std::fmt::Debug for BoundMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundMethod")
            .field("capability", &self.capability)
            .field("method", &self.method)
            .finish()
    }
}

/// Binding table from capability name to capability.
#[derive(Debug, Default)]
pub struct Registry {
    capabilities: HashMap<String, Capability>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, capability: Capability) -> Result<(), RegistryError> {
        if self.capabilities.contains_key(capability.name()) {
            return Err(RegistryError::DuplicateCapability(
                capability.name().to_string(),
            ));
        }
        tracing::debug!(
            capability = capability.name(),
            methods = ?capability.method_names(),
            "Registered capability"
        );
        self.capabilities
            .insert(capability.name().to_string(), capability);
        Ok(())
    }

    pub fn resolve(&self, capability: &str, method: &str) -> Result<BoundMethod, RegistryError> {
        let cap = self
            .capabilities
            .get(capability)
            .ok_or_else(|| RegistryError::UnknownCapability(capability.to_string()))?;
        let f = cap
            .methods
            .get(method)
            .ok_or_else(|| RegistryError::UnknownMethod {
                capability: capability.to_string(),
                method: method.to_string(),
            })?;
        Ok(BoundMethod {
            capability: Arc::from(capability),
            method: Arc::from(method),
            f: Arc::clone(f),
        })
    }

    pub fn contains(&self, capability: &str) -> bool {
        self.capabilities.contains_key(capability)
    }

    /// Capability names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.capabilities.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }
}
