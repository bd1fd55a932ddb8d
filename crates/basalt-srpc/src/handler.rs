//! `HandlerRegistry`: maps a request `${prefix}` to the async function that
//! produces its `${prefix}Response`, shared by [`crate::server::SrpcServer`]
//! (inbound client requests) and [`crate::client::SrpcClient`] (inbound
//! server-initiated requests).

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};

use serde_json::Value;

pub type HandlerFuture = Pin<Box<dyn Future<Output = std::result::Result<Value, String>> + Send>>;
pub type HandlerFn = Arc<dyn Fn(Value) -> HandlerFuture + Send + Sync>;

/// A registry of `prefix -> handler`, cheap to clone (shares the same map).
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<StdMutex<HashMap<String, HandlerFn>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `prefix`. Re-registering the same prefix
    /// replaces the previous handler.
    pub fn register<F, Fut>(&self, prefix: impl Into<String>, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, String>> + Send + 'static,
    {
        self.handlers
            .lock()
            .unwrap()
            .insert(prefix.into(), Arc::new(move |data| Box::pin(handler(data))));
    }

    pub fn get(&self, prefix: &str) -> Option<HandlerFn> {
        self.handlers.lock().unwrap().get(prefix).cloned()
    }

    pub fn contains(&self, prefix: &str) -> bool {
        self.handlers.lock().unwrap().contains_key(prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn registers_and_dispatches_by_prefix() {
        let registry = HandlerRegistry::new();
        registry.register("uEcho", |data| async move { Ok(data) });

        let handler = registry.get("uEcho").expect("handler registered");
        let result = handler(json!({"text": "hi"})).await.unwrap();
        assert_eq!(result, json!({"text": "hi"}));
        assert!(registry.get("uMissing").is_none());
    }

    #[tokio::test]
    async fn re_registering_replaces_handler() {
        let registry = HandlerRegistry::new();
        registry.register("uEcho", |_data| async move { Ok(json!(1)) });
        registry.register("uEcho", |_data| async move { Ok(json!(2)) });

        let handler = registry.get("uEcho").unwrap();
        assert_eq!(handler(json!(null)).await.unwrap(), json!(2));
    }
}
