//! Handler registry with exclusive and ordinary methods.
//!
//! Each method is registered with an explicit [`HandlerKind`]. Dispatch
//! checks the kind before running anything: an exclusive method on an
//! instance that is not active is rejected with `NotActive` and its body
//! never runs.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::debug;

use crate::error::{RpcError, RpcResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    /// Runs only on the active instance of the group.
    Exclusive,
    /// Runs on any instance.
    Ordinary,
}

/// Async method body.
pub type Handler = Arc<dyn Fn(Value) -> BoxFuture<'static, RpcResult<Value>> + Send + Sync>;

/// Wrap an async closure as a [`Handler`].
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RpcResult<Value>> + Send + 'static,
{
    Arc::new(move |params| -> BoxFuture<'static, RpcResult<Value>> { Box::pin(f(params)) })
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, (HandlerKind, Handler)>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a method.
    pub fn register(&self, method: &str, kind: HandlerKind, handler: Handler) {
        self.handlers
            .write()
            .unwrap()
            .insert(method.to_string(), (kind, handler));
        debug!(%method, ?kind, "handler registered");
    }

    pub fn register_exclusive(&self, method: &str, handler: Handler) {
        self.register(method, HandlerKind::Exclusive, handler);
    }

    pub fn register_ordinary(&self, method: &str, handler: Handler) {
        self.register(method, HandlerKind::Ordinary, handler);
    }

    pub fn kind(&self, method: &str) -> Option<HandlerKind> {
        self.handlers.read().unwrap().get(method).map(|(kind, _)| *kind)
    }

    pub fn methods(&self) -> Vec<String> {
        let mut methods: Vec<_> = self.handlers.read().unwrap().keys().cloned().collect();
        methods.sort();
        methods
    }

    /// Run `method` on behalf of `instance_id`, whose current leadership is
    /// `active`.
    pub async fn dispatch(&self, instance_id: &str, active: bool, method: &str, params: Value) -> RpcResult<Value> {
        let entry = self.handlers.read().unwrap().get(method).cloned();
        let Some((kind, handler)) = entry else {
            return Err(RpcError::MethodNotFound(method.to_string()));
        };
        if kind == HandlerKind::Exclusive && !active {
            debug!(%instance_id, %method, "rejecting exclusive call on non-active instance");
            return Err(RpcError::NotActive {
                instance_id: instance_id.to_string(),
                method: method.to_string(),
            });
        }
        handler(params).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use serde_json::json;

    fn counting(calls: Arc<AtomicUsize>) -> Handler {
        handler(move |params| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(params)
            }
        })
    }

    #[tokio::test]
    async fn exclusive_rejected_without_running_body() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = HandlerRegistry::new();
        registry.register_exclusive("place", counting(calls.clone()));

        let err = registry
            .dispatch("orders-2", false, "place", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::NotActive { ref instance_id, .. } if instance_id == "orders-2"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let out = registry
            .dispatch("orders-1", true, "place", json!({"id": 1}))
            .await
            .unwrap();
        assert_eq!(out, json!({"id": 1}));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ordinary_runs_anywhere() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = HandlerRegistry::new();
        registry.register_ordinary("ping", counting(calls.clone()));

        registry.dispatch("orders-2", false, "ping", json!(null)).await.unwrap();
        registry.dispatch("orders-1", true, "ping", json!(null)).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unknown_method() {
        let registry = HandlerRegistry::new();
        let err = registry.dispatch("a", true, "nope", json!(null)).await.unwrap_err();
        assert!(matches!(err, RpcError::MethodNotFound(_)));
    }

    #[test]
    fn kinds_and_methods() {
        let registry = HandlerRegistry::new();
        registry.register_exclusive("place", handler(|p| async move { Ok(p) }));
        registry.register_ordinary("ping", handler(|p| async move { Ok(p) }));
        assert_eq!(registry.kind("place"), Some(HandlerKind::Exclusive));
        assert_eq!(registry.kind("ping"), Some(HandlerKind::Ordinary));
        assert_eq!(registry.kind("nope"), None);
        assert_eq!(registry.methods(), vec!["ping", "place"]);
    }
}
